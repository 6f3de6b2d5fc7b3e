//! Socket bus integration tests.
//!
//! Broker plus TCP (and Unix socket) transports, exercised end to end the
//! way separate processes would use them.

#[path = "../common/mod.rs"]
mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;

use common::{
    expect_silence, forwarding_handler, recv, socket_client, wait_for_broker_channel,
};
use crossbus::command::REPLY_CHANNEL_PREFIX;
use crossbus::{handler_fn, Broker, BusError, BusOptions};

async fn wait_for_no_reply_channels(broker: &Broker) {
    for _ in 0..400 {
        let lingering = broker
            .channels()
            .await
            .into_iter()
            .any(|channel| channel.starts_with(REPLY_CHANNEL_PREFIX));
        if !lingering {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("broker kept a reply channel alive");
}

#[tokio::test]
async fn test_pub_sub_roundtrip_over_tcp() {
    let broker = Broker::listen(BusOptions::new().with_port(0)).await.unwrap();
    let port = broker.local_addr().unwrap().port();

    let (_keep_a, alice) = socket_client(port).await;
    let (_keep_b, bob) = socket_client(port).await;

    let (tx, mut bob_rx) = mpsc::unbounded_channel();
    bob.add_listener("news", forwarding_handler(tx)).await;
    wait_for_broker_channel(&broker, "news", true).await;

    alice.send("news", vec![json!({"headline": "hello"})]).await;
    let (event, args) = recv(&mut bob_rx).await;
    assert_eq!(event.channel, "news");
    assert_eq!(event.sender.id, alice.peer().await.id);
    assert_eq!(args[0], json!({"headline": "hello"}));

    let (tx, mut alice_rx) = mpsc::unbounded_channel();
    alice.add_listener("sports", forwarding_handler(tx)).await;
    wait_for_broker_channel(&broker, "sports", true).await;

    bob.send("sports", vec![json!(4), json!(2)]).await;
    let (event, args) = recv(&mut alice_rx).await;
    assert_eq!(event.channel, "sports");
    assert_eq!(args.len(), 2);
    assert_eq!(args[1], json!(2));

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_fan_out_reaches_every_subscriber_exactly_once() {
    let broker = Broker::listen(BusOptions::new().with_port(0)).await.unwrap();
    let port = broker.local_addr().unwrap().port();

    let (_keep_a, alice) = socket_client(port).await;
    let (_keep_b, bob) = socket_client(port).await;
    let (_keep_c, carol) = socket_client(port).await;

    let (tx, mut alice_rx) = mpsc::unbounded_channel();
    alice.add_listener("ticker", forwarding_handler(tx)).await;
    let (tx, mut bob_rx) = mpsc::unbounded_channel();
    bob.add_listener("ticker", forwarding_handler(tx)).await;
    let (tx, mut carol_rx) = mpsc::unbounded_channel();
    carol.add_listener("ticker", forwarding_handler(tx)).await;
    wait_for_broker_channel(&broker, "ticker", true).await;

    alice.send("ticker", vec![json!("tick")]).await;

    // the sender's copy is applied locally, never echoed back by the broker
    let (event, _) = recv(&mut alice_rx).await;
    assert_eq!(event.sender.id, alice.peer().await.id);
    recv(&mut bob_rx).await;
    recv(&mut carol_rx).await;

    expect_silence(&mut alice_rx).await;
    expect_silence(&mut bob_rx).await;
    expect_silence(&mut carol_rx).await;

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_request_settles_across_the_broker() {
    let broker = Broker::listen(BusOptions::new().with_port(0)).await.unwrap();
    let port = broker.local_addr().unwrap().port();

    let (_keep_oracle, oracle) = socket_client(port).await;
    oracle
        .add_listener(
            "math/add",
            handler_fn(|event, args| async move {
                let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
                if let Some(request) = event.request() {
                    request.resolve(json!(sum)).await;
                }
            }),
        )
        .await;
    wait_for_broker_channel(&broker, "math/add", true).await;

    let (_keep_asker, asker) = socket_client(port).await;
    let response = asker
        .request(
            "math/add",
            Some(Duration::from_secs(2)),
            vec![json!(19), json!(23)],
        )
        .await
        .unwrap();
    assert_eq!(response.payload, json!(42));
    assert_eq!(response.event.channel, "math/add");
    assert_eq!(response.event.sender.id, oracle.peer().await.id);

    // the single-use route back is gone once the response lands
    wait_for_no_reply_channels(&broker).await;

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_request_rejection_carries_the_reason() {
    let broker = Broker::listen(BusOptions::new().with_port(0)).await.unwrap();
    let port = broker.local_addr().unwrap().port();

    let (_keep_oracle, oracle) = socket_client(port).await;
    oracle
        .add_listener(
            "vault/open",
            handler_fn(|event, _args| async move {
                if let Some(request) = event.request() {
                    request.reject("wrong passphrase").await;
                }
            }),
        )
        .await;
    wait_for_broker_channel(&broker, "vault/open", true).await;

    let (_keep_asker, asker) = socket_client(port).await;
    let outcome = asker
        .request(
            "vault/open",
            Some(Duration::from_secs(2)),
            vec![json!("sesame")],
        )
        .await;
    match outcome {
        Err(BusError::Rejected { reason, event }) => {
            assert_eq!(reason, "wrong passphrase");
            assert_eq!(event.channel, "vault/open");
        }
        other => panic!("expected a rejection, got {other:?}"),
    }

    wait_for_no_reply_channels(&broker).await;

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_request_timeout_cleans_up_reply_channels() {
    let broker = Broker::listen(BusOptions::new().with_port(0)).await.unwrap();
    let port = broker.local_addr().unwrap().port();

    // subscribed but never answers
    let (_keep_oracle, oracle) = socket_client(port).await;
    oracle
        .add_listener("slow", handler_fn(|_event, _args| async move {}))
        .await;
    wait_for_broker_channel(&broker, "slow", true).await;

    let (_keep_asker, asker) = socket_client(port).await;
    let outcome = asker
        .request("slow", Some(Duration::from_millis(50)), vec![json!(0)])
        .await;
    assert!(matches!(outcome, Err(BusError::Timeout { .. })));

    // expiry told the rest of the bus to forget the route back
    wait_for_no_reply_channels(&broker).await;

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_listener_removal_withdraws_broker_interest() {
    let broker = Broker::listen(BusOptions::new().with_port(0)).await.unwrap();
    let port = broker.local_addr().unwrap().port();

    let (_keep_a, alice) = socket_client(port).await;
    let (_keep_b, bob) = socket_client(port).await;

    let (tx, mut bob_rx) = mpsc::unbounded_channel();
    let handle = bob.add_listener("jobs", forwarding_handler(tx)).await;
    wait_for_broker_channel(&broker, "jobs", true).await;

    bob.remove_listener("jobs", handle).await;
    wait_for_broker_channel(&broker, "jobs", false).await;

    alice.send("jobs", vec![json!("orphaned")]).await;
    expect_silence(&mut bob_rx).await;

    broker.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_roundtrip() {
    use crossbus::command::ProcessKind;
    use crossbus::{SocketConnector, Transport};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.sock");
    let broker = Broker::listen(BusOptions::new().with_path(&path))
        .await
        .unwrap();

    let transport_a = Transport::new(SocketConnector::new(ProcessKind::Node));
    let alice = transport_a.client();
    alice
        .connect(BusOptions::new().with_path(&path))
        .await
        .unwrap();
    let transport_b = Transport::new(SocketConnector::new(ProcessKind::Node));
    let bob = transport_b.client();
    bob.connect(BusOptions::new().with_path(&path)).await.unwrap();

    let (tx, mut bob_rx) = mpsc::unbounded_channel();
    bob.add_listener("news", forwarding_handler(tx)).await;
    wait_for_broker_channel(&broker, "news", true).await;

    alice.send("news", vec![json!("over the socket file")]).await;
    let (event, args) = recv(&mut bob_rx).await;
    assert_eq!(event.channel, "news");
    assert_eq!(args[0], json!("over the socket file"));

    broker.close().await.unwrap();
}
