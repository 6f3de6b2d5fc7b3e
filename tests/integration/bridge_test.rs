//! Bridge federation integration tests.
//!
//! A bridge glues three worlds together: its host transport, attached
//! contexts, and a socket side that either hosts the broker or dials an
//! external one. These tests run whole topologies through the public API.

#[path = "../common/mod.rs"]
mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;

use common::{
    expect_silence, forwarding_handler, recv, socket_client, wait_for_broker_channel,
};
use crossbus::connector::host_channel;
use crossbus::{handler_fn, Bridge, Broker, BusClient, BusOptions, Transport};

async fn wait_for_bridge_channel(bridge: &Bridge, channel: &str, present: bool) {
    for _ in 0..400 {
        if bridge.channels().await.iter().any(|c| c == channel) == present {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("channel {channel} never became present={present}");
}

/// A context transport attached to `bridge`, with its routing id.
async fn attach_context(bridge: &Bridge) -> (Transport, BusClient, u32) {
    let (connector, endpoint) = host_channel();
    let rid = bridge.add_host_endpoint(endpoint).await.unwrap();
    let transport = Transport::new(connector);
    let client = transport.client();
    client.connect(BusOptions::new()).await.unwrap();
    (transport, client, rid)
}

/// Round trip a request from `client` so every command it posted before the
/// request has been fully applied on the far side of its pump.
async fn drain_pump(client: &BusClient, channel: &str) {
    let response = client
        .request(channel, Some(Duration::from_secs(2)), vec![])
        .await
        .unwrap();
    assert_eq!(response.payload, json!("pong"));
}

fn pong_handler() -> std::sync::Arc<dyn crossbus::MessageHandler> {
    handler_fn(|event, _args| async move {
        if let Some(request) = event.request() {
            request.resolve(json!("pong")).await;
        }
    })
}

#[tokio::test]
async fn test_hosted_bridge_federates_contexts_and_sockets() {
    let bridge = Bridge::new().await.unwrap();
    let host = bridge.client();
    host.connect(BusOptions::new()).await.unwrap();
    host.add_listener("sync/ping", pong_handler()).await;

    let (_keep_ctx, context, _rid) = attach_context(&bridge).await;

    bridge
        .connect(BusOptions::new().with_port(0).with_server(true))
        .await
        .unwrap();
    let port = bridge.local_addr().await.unwrap().port();
    let (_keep_remote, remote) = socket_client(port).await;

    let (tx, mut remote_rx) = mpsc::unbounded_channel();
    remote.add_listener("remote/alerts", forwarding_handler(tx)).await;
    wait_for_bridge_channel(&bridge, "remote/alerts", true).await;

    let (tx, mut ctx_rx) = mpsc::unbounded_channel();
    context.add_listener("ctx/updates", forwarding_handler(tx)).await;
    drain_pump(&context, "sync/ping").await;

    // host to the federated socket world
    host.send("remote/alerts", vec![json!({"level": "red"})]).await;
    let (event, args) = recv(&mut remote_rx).await;
    assert_eq!(event.channel, "remote/alerts");
    assert_eq!(event.sender.id, host.peer().await.id);
    assert_eq!(args[0], json!({"level": "red"}));
    expect_silence(&mut remote_rx).await;

    // socket world back to a context
    remote.send("ctx/updates", vec![json!(7)]).await;
    let (event, args) = recv(&mut ctx_rx).await;
    assert_eq!(event.channel, "ctx/updates");
    assert_eq!(event.sender.id, remote.peer().await.id);
    assert_eq!(args[0], json!(7));
    expect_silence(&mut ctx_rx).await;

    bridge.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_request_settled_by_a_context() {
    let bridge = Bridge::new().await.unwrap();
    let host = bridge.client();
    host.connect(BusOptions::new()).await.unwrap();
    host.add_listener("sync/ping", pong_handler()).await;

    let (_keep_ctx, context, rid) = attach_context(&bridge).await;
    context
        .add_listener(
            "ctx/echo",
            handler_fn(|event, args| async move {
                if let Some(request) = event.request() {
                    let payload = args.first().cloned().unwrap_or(Value::Null);
                    request.resolve(payload).await;
                }
            }),
        )
        .await;
    drain_pump(&context, "sync/ping").await;

    bridge
        .connect(BusOptions::new().with_port(0).with_server(true))
        .await
        .unwrap();
    let port = bridge.local_addr().await.unwrap().port();
    let (_keep_remote, remote) = socket_client(port).await;

    let response = remote
        .request(
            "ctx/echo",
            Some(Duration::from_secs(2)),
            vec![json!({"echo": true})],
        )
        .await
        .unwrap();
    assert_eq!(response.payload, json!({"echo": true}));
    assert_eq!(response.event.channel, "ctx/echo");
    assert_eq!(response.event.sender.process.rid, Some(rid));

    bridge.close().await.unwrap();
}

#[tokio::test]
async fn test_client_bridge_federates_with_external_broker() {
    let broker = Broker::listen(BusOptions::new().with_port(0)).await.unwrap();
    let port = broker.local_addr().unwrap().port();

    // the remote side subscribes before the bridge even exists
    let (_keep_remote, remote) = socket_client(port).await;
    let (tx, mut remote_rx) = mpsc::unbounded_channel();
    remote.add_listener("jobs", forwarding_handler(tx)).await;
    wait_for_broker_channel(&broker, "jobs", true).await;

    let bridge = Bridge::new().await.unwrap();
    let host = bridge.client();
    host.connect(BusOptions::new()).await.unwrap();
    bridge
        .connect(BusOptions::new().with_port(port))
        .await
        .unwrap();

    // the broker replays remote interest to the late-joining bridge
    wait_for_bridge_channel(&bridge, "jobs", true).await;

    host.send("jobs", vec![json!("build #42")]).await;
    let (event, args) = recv(&mut remote_rx).await;
    assert_eq!(event.channel, "jobs");
    assert_eq!(args[0], json!("build #42"));

    let (tx, mut host_rx) = mpsc::unbounded_channel();
    host.add_listener("results", forwarding_handler(tx)).await;
    wait_for_broker_channel(&broker, "results", true).await;

    remote.send("results", vec![json!("green")]).await;
    let (event, args) = recv(&mut host_rx).await;
    assert_eq!(event.channel, "results");
    assert_eq!(event.sender.id, remote.peer().await.id);
    assert_eq!(args[0], json!("green"));

    host.add_listener(
        "host/info",
        handler_fn(|event, _args| async move {
            if let Some(request) = event.request() {
                request.resolve(json!({"version": 3})).await;
            }
        }),
    )
    .await;
    wait_for_broker_channel(&broker, "host/info", true).await;

    let response = remote
        .request("host/info", Some(Duration::from_secs(2)), vec![])
        .await
        .unwrap();
    assert_eq!(response.payload, json!({"version": 3}));

    bridge.close().await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_detached_bridge_keeps_the_local_bus_alive() {
    let bridge = Bridge::new().await.unwrap();
    let host = bridge.client();
    host.connect(BusOptions::new()).await.unwrap();
    host.add_listener("sync/ping", pong_handler()).await;

    let (_keep_ctx, context, _rid) = attach_context(&bridge).await;
    let (tx, mut ctx_rx) = mpsc::unbounded_channel();
    context.add_listener("ctx/updates", forwarding_handler(tx)).await;
    drain_pump(&context, "sync/ping").await;

    bridge
        .connect(BusOptions::new().with_port(0).with_server(true))
        .await
        .unwrap();
    let port = bridge.local_addr().await.unwrap().port();
    let (_keep_remote, remote) = socket_client(port).await;
    let (tx, mut remote_rx) = mpsc::unbounded_channel();
    remote.add_listener("remote/alerts", forwarding_handler(tx)).await;
    wait_for_bridge_channel(&bridge, "remote/alerts", true).await;

    // detach the socket side; the hosted broker goes away with it
    bridge.connect(BusOptions::new()).await.unwrap();
    assert!(bridge.local_addr().await.is_none());

    host.send("remote/alerts", vec![json!("lost")]).await;
    expect_silence(&mut remote_rx).await;

    // host and contexts still share the in-process bus
    host.send("ctx/updates", vec![json!("still here")]).await;
    let (event, args) = recv(&mut ctx_rx).await;
    assert_eq!(event.channel, "ctx/updates");
    assert_eq!(args[0], json!("still here"));

    bridge.close().await.unwrap();
}
