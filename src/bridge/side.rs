//! Socket side of a bridge, in its two flavors.
//!
//! `server: false` dials an external broker like any transport would and
//! mirrors the remote routing table from the bridge-prefixed commands the
//! broker relays back. `server: true` starts the broker in process and rides
//! its tables directly through a pseudo-connection, so nothing is mirrored
//! and nothing crosses a socket twice.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::{BridgeCore, RelayPayload};
use crate::broker::{Broker, BrokerEvent, ConnId};
use crate::command::{Args, Command, CommandKind, ProcessKind};
use crate::config::BusOptions;
use crate::connector::{Connector, ConnectorSink, SocketConnector};
use crate::error::Result;
use crate::packet::Frame;

/// What a bridge asks of the far side of a relay.
///
/// `is_target` comes before any serialization; the relay loop materializes a
/// frame at most once and shares it across every frame-consuming target.
#[async_trait]
pub(crate) trait BridgeSide: Send + Sync {
    fn label(&self) -> &'static str;

    /// Would this side deliver the command to anyone?
    async fn is_target(&self, command: &Command) -> bool;

    /// Value-path broadcast; the side encodes if its medium needs bytes.
    async fn broadcast_args(&self, command: &Command, args: Args) -> Result<()>;

    /// Frame-path broadcast of an already-encoded command.
    async fn broadcast_frame(&self, command: &Command, frame: Frame) -> Result<()>;

    async fn channels(&self) -> Vec<String>;

    /// Push a bridge-prefixed listener command into the remote routing table.
    async fn declare(&self, command: Command) -> Result<()>;

    /// A request arrived from this side; remember to route its response back.
    async fn note_remote_request(&self, _reply_channel: &str) {}

    /// Bound address, when this side hosts the broker.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn shutdown(&self) -> Result<()>;
}

/// Client flavor: a framed socket link to an external broker.
pub(crate) struct SocketClientSide {
    connector: SocketConnector,
    /// Channels the remote bus subscribes to, mirrored from broker relays.
    remote_channels: Mutex<HashSet<String>>,
    /// Reply channels of remote-originated requests still in flight.
    remote_requests: Mutex<HashSet<String>>,
}

impl SocketClientSide {
    pub(crate) async fn connect(
        core: Weak<BridgeCore>,
        options: &BusOptions,
    ) -> Result<Arc<Self>> {
        let side = Arc::new(Self {
            connector: SocketConnector::new(ProcessKind::Main),
            remote_channels: Mutex::new(HashSet::new()),
            remote_requests: Mutex::new(HashSet::new()),
        });
        let sink: Arc<dyn ConnectorSink> = Arc::new(SocketSideSink {
            core,
            side: Arc::downgrade(&side),
        });
        side.connector.handshake(sink, options).await?;
        Ok(side)
    }

    /// Apply a bridge-prefixed command the broker relayed to us.
    async fn apply_remote(&self, command: &Command) {
        let mut channels = self.remote_channels.lock().await;
        match command.kind.base_variant() {
            Some(CommandKind::AddChannelListener) => {
                channels.insert(command.channel.clone());
            }
            Some(CommandKind::RemoveChannelListener)
            | Some(CommandKind::RemoveChannelAllListeners) => {
                channels.remove(&command.channel);
            }
            _ => {}
        }
        trace!(channel = %command.channel, kind = ?command.kind, "Remote interest change");
    }

    /// A response or close consumes its reply-channel entry.
    async fn finish_request(&self, command: &Command) {
        if command.kind != CommandKind::RequestResponse {
            return;
        }
        if let Some(descriptor) = &command.request {
            self.remote_requests
                .lock()
                .await
                .remove(&descriptor.reply_channel);
        }
    }
}

#[async_trait]
impl BridgeSide for SocketClientSide {
    fn label(&self) -> &'static str {
        "socket-client"
    }

    async fn is_target(&self, command: &Command) -> bool {
        if command.kind == CommandKind::RequestResponse {
            if let Some(descriptor) = &command.request {
                if self
                    .remote_requests
                    .lock()
                    .await
                    .contains(&descriptor.reply_channel)
                {
                    return true;
                }
            }
        }
        self.remote_channels.lock().await.contains(&command.channel)
    }

    async fn broadcast_args(&self, command: &Command, args: Args) -> Result<()> {
        self.finish_request(command).await;
        self.connector.post_command(command.clone(), args).await
    }

    async fn broadcast_frame(&self, command: &Command, frame: Frame) -> Result<()> {
        self.finish_request(command).await;
        self.connector.post_frame(frame).await
    }

    async fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> =
            self.remote_channels.lock().await.iter().cloned().collect();
        channels.sort();
        channels
    }

    async fn declare(&self, command: Command) -> Result<()> {
        self.connector.post_command(command, Args::default()).await
    }

    async fn note_remote_request(&self, reply_channel: &str) {
        self.remote_requests
            .lock()
            .await
            .insert(reply_channel.to_owned());
    }

    async fn shutdown(&self) -> Result<()> {
        self.connector.shutdown().await
    }
}

/// Connector-facing half of the client flavor.
struct SocketSideSink {
    core: Weak<BridgeCore>,
    side: Weak<SocketClientSide>,
}

#[async_trait]
impl ConnectorSink for SocketSideSink {
    async fn on_command(&self, command: Command, args: Args) {
        // interest updates are applied here, never re-relayed
        if command.kind.is_bridge() {
            if let Some(side) = self.side.upgrade() {
                side.apply_remote(&command).await;
            }
            return;
        }
        // a remote asker gave up; its in-flight entry goes with it
        if command.kind == CommandKind::RequestClose {
            if let (Some(side), Some(descriptor)) = (self.side.upgrade(), command.request.as_ref())
            {
                side.remote_requests
                    .lock()
                    .await
                    .remove(&descriptor.reply_channel);
            }
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.socket_arrival(command, RelayPayload::values(args))
                .await;
        }
    }

    async fn on_closed(&self) {
        warn!("Socket side link lost");
    }
}

/// Server flavor: the broker runs in process and the bridge rides its
/// routing tables through a pseudo-connection.
pub(crate) struct HostedBrokerSide {
    broker: Broker,
    conn: ConnId,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl HostedBrokerSide {
    pub(crate) async fn start(core: Weak<BridgeCore>, options: &BusOptions) -> Result<Arc<Self>> {
        let broker = Broker::listen(options.clone()).await?;
        let (conn, events) = broker.attach_bridge().await;
        let side = Arc::new(Self {
            broker,
            conn,
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(pump_broker_events(core, events));
        *side.pump.lock().await = Some(pump);
        Ok(side)
    }
}

#[async_trait]
impl BridgeSide for HostedBrokerSide {
    fn label(&self) -> &'static str {
        "hosted-broker"
    }

    async fn is_target(&self, command: &Command) -> bool {
        self.broker.is_target_except(command, self.conn).await
    }

    async fn broadcast_args(&self, command: &Command, args: Args) -> Result<()> {
        let frame = Frame::encode(command, args.as_slice())?;
        self.broker.inject(self.conn, command.clone(), frame).await;
        Ok(())
    }

    async fn broadcast_frame(&self, command: &Command, frame: Frame) -> Result<()> {
        self.broker.inject(self.conn, command.clone(), frame).await;
        Ok(())
    }

    async fn channels(&self) -> Vec<String> {
        self.broker.channels().await
    }

    async fn declare(&self, command: Command) -> Result<()> {
        let frame = Frame::encode(&command, &[])?;
        self.broker.inject(self.conn, command, frame).await;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.broker.local_addr()
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.broker.detach_bridge(self.conn).await;
        self.broker.close().await
    }
}

async fn pump_broker_events(
    core: Weak<BridgeCore>,
    mut events: mpsc::UnboundedReceiver<BrokerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(core) = core.upgrade() else { break };
        match event {
            // the hosted broker's tables already hold the change; target
            // checks read them directly
            BrokerEvent::Subscription(command) => {
                trace!(channel = %command.channel, kind = ?command.kind, "Remote interest change");
            }
            BrokerEvent::Delivery { command, frame } => {
                core.socket_arrival(command, RelayPayload::encoded(frame))
                    .await;
            }
        }
    }
}
