//! Host-channel connector: the bus link for embedded execution contexts.
//!
//! The embedding application owns the actual plumbing; this module models it
//! as an in-process message channel between a context end
//! ([`HostConnector`]) and a bridge end ([`HostEndpoint`]). The bridge
//! answers the handshake with the context's process descriptor (host pid
//! plus the routing id it assigned). Deliveries to the context are either
//! values (native path) or encoded frames (portable path); traffic from the
//! context is always values, the two ends share one process.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use super::{Connector, ConnectorSink, HandshakeInfo};
use crate::command::{Args, Command, ProcessInfo, ProcessKind};
use crate::config::BusOptions;
use crate::error::{BusError, Result};
use crate::packet::Frame;

/// What travels over a host channel.
pub enum HostMessage {
    /// Context → bridge: announce, and learn the assigned descriptor.
    Handshake {
        reply: oneshot::Sender<ProcessInfo>,
    },
    /// Decoded command plus arguments (native path).
    Args { command: Command, args: Args },
    /// Encoded frame (portable path).
    Packet { frame: Frame },
    /// Teardown notice, valid in either direction.
    Closed,
}

/// Context end of a host channel. Single-use: a closed link is not
/// re-handshaken, the embedding application wires a fresh channel instead.
pub struct HostConnector {
    up: mpsc::UnboundedSender<HostMessage>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<HostMessage>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Bridge end of a host channel.
pub struct HostEndpoint {
    down: mpsc::UnboundedSender<HostMessage>,
    inbox: Option<mpsc::UnboundedReceiver<HostMessage>>,
}

/// Wire up one context ↔ bridge channel pair.
pub fn host_channel() -> (HostConnector, HostEndpoint) {
    let (up_tx, up_rx) = mpsc::unbounded_channel();
    let (down_tx, down_rx) = mpsc::unbounded_channel();
    (
        HostConnector {
            up: up_tx,
            inbox: Mutex::new(Some(down_rx)),
            pump: Mutex::new(None),
        },
        HostEndpoint {
            down: down_tx,
            inbox: Some(up_rx),
        },
    )
}

impl HostEndpoint {
    /// Take the inbound receiver; the bridge pumps it.
    pub fn take_inbox(&mut self) -> Option<mpsc::UnboundedReceiver<HostMessage>> {
        self.inbox.take()
    }

    /// Native-path delivery. False when the context is gone.
    pub fn deliver_args(&self, command: Command, args: Args) -> bool {
        self.down
            .send(HostMessage::Args { command, args })
            .is_ok()
    }

    /// Portable-path delivery. False when the context is gone.
    pub fn deliver_frame(&self, frame: Frame) -> bool {
        self.down.send(HostMessage::Packet { frame }).is_ok()
    }

    /// Tell the context the link is over.
    pub fn close(&self) {
        let _ = self.down.send(HostMessage::Closed);
    }
}

#[async_trait]
impl Connector for HostConnector {
    fn process_kind(&self) -> ProcessKind {
        ProcessKind::Renderer
    }

    async fn handshake(
        &self,
        sink: Arc<dyn ConnectorSink>,
        options: &BusOptions,
    ) -> Result<HandshakeInfo> {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            // already linked; the descriptor does not change
            return Err(BusError::Connection("host link already established".into()));
        }
        let inbox = self
            .inbox
            .lock()
            .await
            .take()
            .ok_or_else(|| BusError::Connection("host link is closed".into()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.up
            .send(HostMessage::Handshake { reply: reply_tx })
            .map_err(|_| BusError::Connection("bridge end is gone".into()))?;
        let process = tokio::time::timeout(options.connect_timeout(), reply_rx)
            .await
            .map_err(|_| BusError::Connection("bridge did not answer the handshake".into()))?
            .map_err(|_| BusError::Connection("bridge dropped the handshake".into()))?;

        *pump = Some(tokio::spawn(pump_inbox(inbox, sink)));
        Ok(HandshakeInfo { process })
    }

    async fn post_command(&self, command: Command, args: Args) -> Result<()> {
        self.up
            .send(HostMessage::Args { command, args })
            .map_err(|_| BusError::NotConnected)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
            let _ = self.up.send(HostMessage::Closed);
        }
        Ok(())
    }
}

async fn pump_inbox(
    mut inbox: mpsc::UnboundedReceiver<HostMessage>,
    sink: Arc<dyn ConnectorSink>,
) {
    while let Some(message) = inbox.recv().await {
        match message {
            HostMessage::Args { command, args } => sink.on_command(command, args).await,
            HostMessage::Packet { frame } => match frame.decode() {
                Ok((command, args)) => sink.on_command(command, Arc::new(args)).await,
                Err(e) => warn!(error = %e, "Dropping undecodable host frame"),
            },
            HostMessage::Closed => {
                sink.on_closed().await;
                return;
            }
            HostMessage::Handshake { .. } => {}
        }
    }
    // bridge end dropped without a Closed notice
    sink.on_closed().await;
}
