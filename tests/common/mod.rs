//! Shared utilities for integration tests.
//!
//! Every suite runs a real broker on an ephemeral port or path and talks to
//! it through the public crate surface only.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crossbus::command::{Args, ProcessKind};
use crossbus::{
    handler_fn, Broker, BusClient, BusEvent, BusOptions, MessageHandler, SocketConnector, Transport,
};

/// Handler that forwards every delivery into an inspectable channel.
pub fn forwarding_handler(tx: mpsc::UnboundedSender<(BusEvent, Args)>) -> Arc<dyn MessageHandler> {
    handler_fn(move |event, args| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((event, args));
        }
    })
}

pub async fn recv(rx: &mut mpsc::UnboundedReceiver<(BusEvent, Args)>) -> (BusEvent, Args) {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no delivery within 2s")
        .expect("delivery channel closed")
}

/// Let in-flight traffic land, then require that none arrived here.
pub async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<(BusEvent, Args)>) {
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "unexpected delivery");
}

pub async fn wait_for_broker_channel(broker: &Broker, channel: &str, present: bool) {
    for _ in 0..400 {
        if broker.has_channel(channel).await == present {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("channel {channel} never became present={present}");
}

/// A connected client dialing the broker's TCP port, as a separate process
/// would.
pub async fn socket_client(port: u16) -> (Transport, BusClient) {
    let transport = Transport::new(SocketConnector::new(ProcessKind::Node));
    let client = transport.client();
    client
        .connect(BusOptions::new().with_port(port))
        .await
        .expect("client failed to join the bus");
    (transport, client)
}
