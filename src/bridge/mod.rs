//! Bus federator.
//!
//! A bridge joins three worlds inside a host process: bus clients on its own
//! host transport, embedded execution contexts wired in over host channels,
//! and optionally a socket side to the wider bus. Deliveries relay between
//! the sides, never back to the side they arrived from, and nothing is
//! serialized until a side that needs bytes is actually targeted.
//!
//! The bridge acts under its own peer identity when it declares the host
//! sides' aggregated interest to the socket side; individual client peers
//! stay local.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{ConnId, SubscriptionMap};
use crate::command::{Args, Command, CommandKind, Peer, ProcessInfo, ProcessKind};
use crate::config::BusOptions;
use crate::connector::{
    pair, Connector, ConnectorSink, HostEndpoint, HostMessage, InProcessConnector,
};
use crate::error::{BusError, Result};
use crate::packet::Frame;
use crate::transport::{BusClient, Transport};

mod side;

use side::{BridgeSide, HostedBrokerSide, SocketClientSide};

/// Local-table connection id of the host transport side; endpoints use
/// their routing id, assigned from 1.
const HOST_CONN: ConnId = 0;

/// Where a relayed command entered the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Host,
    Endpoint(u32),
    Socket,
}

/// Relay payload, lazily convertible both ways: values decode and a frame
/// encodes each at most once, however many sides consume them.
pub(crate) struct RelayPayload {
    args: Option<Args>,
    frame: Option<Frame>,
}

impl RelayPayload {
    pub(crate) fn values(args: Args) -> Self {
        Self {
            args: Some(args),
            frame: None,
        }
    }

    pub(crate) fn encoded(frame: Frame) -> Self {
        Self {
            args: None,
            frame: Some(frame),
        }
    }

    fn args(&mut self) -> Result<Args> {
        if self.args.is_none() {
            if let Some(frame) = &self.frame {
                self.args = Some(Arc::new(frame.args()?));
            }
        }
        Ok(self.args.clone().unwrap_or_default())
    }

    fn frame(&mut self, command: &Command) -> Result<Frame> {
        if let Some(frame) = &self.frame {
            return Ok(frame.clone());
        }
        let args = self.args.clone().unwrap_or_default();
        let frame = Frame::encode(command, args.as_slice())?;
        self.frame = Some(frame.clone());
        Ok(frame)
    }

    fn cached_frame(&self) -> Option<Frame> {
        self.frame.clone()
    }

    fn has_args(&self) -> bool {
        self.args.is_some()
    }
}

/// Where the socket side points; compared for connect idempotence.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SocketTarget {
    port: Option<u16>,
    path: Option<PathBuf>,
    server: bool,
}

struct SocketSlot {
    target: Option<SocketTarget>,
    side: Option<Arc<dyn BridgeSide>>,
}

struct EndpointHandle {
    endpoint: HostEndpoint,
    pump: JoinHandle<()>,
}

/// Federator in the host process.
pub struct Bridge {
    core: Arc<BridgeCore>,
    host_transport: Transport,
}

pub(crate) struct BridgeCore {
    peer: Peer,
    host_link: InProcessConnector,
    /// Host-endpoint delivery path: values when set, frames otherwise.
    native: AtomicBool,
    /// Interest of the host sides; conn 0 is the host transport, the rest
    /// endpoint routing ids.
    local: Mutex<SubscriptionMap>,
    endpoints: Mutex<HashMap<u32, EndpointHandle>>,
    next_rid: AtomicU32,
    socket: Mutex<SocketSlot>,
}

impl Bridge {
    /// Stand up the host-process side: bridge identity and host transport,
    /// no socket yet.
    pub async fn new() -> Result<Bridge> {
        let (bridge_end, transport_end) = pair(ProcessKind::Main, ProcessKind::Main);
        let host_transport = Transport::new(transport_end);
        let mut peer = Peer::new(ProcessInfo::current(ProcessKind::Main));
        peer.name = format!("bridge_{}", peer.process.pid);
        let core = Arc::new(BridgeCore {
            peer,
            host_link: bridge_end,
            native: AtomicBool::new(true),
            local: Mutex::new(SubscriptionMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            next_rid: AtomicU32::new(1),
            socket: Mutex::new(SocketSlot {
                target: None,
                side: None,
            }),
        });
        let sink: Arc<dyn ConnectorSink> = Arc::new(HostLinkSink(Arc::downgrade(&core)));
        core.host_link.handshake(sink, &BusOptions::default()).await?;
        info!(peer = %core.peer.name, "Bridge up");
        Ok(Bridge {
            core,
            host_transport,
        })
    }

    /// A client on the bridge's host transport; how host code joins the bus.
    pub fn client(&self) -> BusClient {
        self.host_transport.client()
    }

    /// Attach, replace or detach the socket side.
    ///
    /// `server: true` hosts the broker in process, otherwise the bridge
    /// dials the broker at `port`/`path`. Neither port nor path detaches.
    /// Reconnecting to an unchanged target is a no-op.
    pub async fn connect(&self, options: BusOptions) -> Result<()> {
        options.validate()?;
        self.core
            .native
            .store(options.use_native_serialization, Ordering::Relaxed);
        let target = if options.has_socket() {
            Some(SocketTarget {
                port: options.port,
                path: options.path.clone(),
                server: options.server,
            })
        } else {
            None
        };
        let mut slot = self.core.socket.lock().await;
        if slot.target == target && (target.is_none() || slot.side.is_some()) {
            return Ok(());
        }
        if let Some(side) = slot.side.take() {
            slot.target = None;
            if let Err(e) = side.shutdown().await {
                warn!(error = %e, "Old socket side shutdown failed");
            }
        }
        let Some(target) = target else {
            info!("Socket side detached");
            return Ok(());
        };
        let side: Arc<dyn BridgeSide> = if target.server {
            HostedBrokerSide::start(Arc::downgrade(&self.core), &options).await?
        } else {
            SocketClientSide::connect(Arc::downgrade(&self.core), &options).await?
        };
        self.core.declare_catch_up(side.as_ref()).await;
        info!(side = side.label(), "Socket side attached");
        slot.side = Some(side);
        slot.target = Some(target);
        Ok(())
    }

    /// Register an embedded context and return the routing id assigned to
    /// it. The bridge answers the context's handshake from here on.
    pub async fn add_host_endpoint(&self, mut endpoint: HostEndpoint) -> Result<u32> {
        let inbox = endpoint
            .take_inbox()
            .ok_or_else(|| BusError::Connection("host endpoint already in use".into()))?;
        let rid = self.core.next_rid.fetch_add(1, Ordering::Relaxed);
        let pump = tokio::spawn(pump_endpoint(Arc::downgrade(&self.core), rid, inbox));
        self.core
            .endpoints
            .lock()
            .await
            .insert(rid, EndpointHandle { endpoint, pump });
        info!(rid, "Host endpoint attached");
        Ok(rid)
    }

    /// Channels with at least one subscriber on any side.
    pub async fn channels(&self) -> Vec<String> {
        let mut channels = self.core.local.lock().await.channels();
        if let Some(side) = self.core.socket_side().await {
            channels.extend(side.channels().await);
        }
        channels.sort();
        channels.dedup();
        channels
    }

    /// Bound address of the hosted broker, when one is attached.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.core
            .socket_side()
            .await
            .and_then(|side| side.local_addr())
    }

    /// Detach the socket side, close every host endpoint, drop the host
    /// transport link.
    pub async fn close(&self) -> Result<()> {
        {
            let mut slot = self.core.socket.lock().await;
            slot.target = None;
            if let Some(side) = slot.side.take() {
                side.shutdown().await?;
            }
        }
        let rids: Vec<u32> = self.core.endpoints.lock().await.keys().copied().collect();
        for rid in rids {
            self.core.remove_endpoint(rid).await;
        }
        self.core.host_link.shutdown().await?;
        info!("Bridge closed");
        Ok(())
    }
}

impl BridgeCore {
    async fn socket_side(&self) -> Option<Arc<dyn BridgeSide>> {
        self.socket.lock().await.side.clone()
    }

    /// Inbound from the socket side, either flavor.
    pub(crate) async fn socket_arrival(&self, command: Command, payload: RelayPayload) {
        if command.kind == CommandKind::SendMessage {
            if let Some(descriptor) = &command.request {
                if let Some(side) = self.socket_side().await {
                    side.note_remote_request(&descriptor.reply_channel).await;
                }
            }
        }
        self.relay(Origin::Socket, command, payload).await;
    }

    /// Inbound from the host transport or an endpoint.
    async fn host_arrival(&self, conn: ConnId, origin: Origin, command: Command, args: Args) {
        if command.kind.is_listener_management() {
            self.apply_local_listener(conn, &command).await;
            return;
        }
        self.relay(origin, command, RelayPayload::values(args)).await;
    }

    /// Track host-side interest; aggregate transitions go upstream under
    /// the bridge's own peer.
    async fn apply_local_listener(&self, conn: ConnId, command: &Command) {
        let declares: Vec<(CommandKind, String)> = {
            let mut local = self.local.lock().await;
            let peer_id = command.peer.id.as_str();
            let channel = command.channel.as_str();
            match command.kind {
                CommandKind::AddChannelListener => local
                    .add_ref(channel, conn, peer_id)
                    .then(|| (CommandKind::BridgeAddChannelListener, channel.to_owned()))
                    .into_iter()
                    .collect(),
                CommandKind::RemoveChannelListener => local
                    .release(channel, conn, peer_id)
                    .then(|| (CommandKind::BridgeRemoveChannelListener, channel.to_owned()))
                    .into_iter()
                    .collect(),
                CommandKind::RemoveChannelAllListeners => local
                    .release_peer(channel, conn, peer_id)
                    .then(|| (CommandKind::BridgeRemoveChannelListener, channel.to_owned()))
                    .into_iter()
                    .collect(),
                CommandKind::RemoveListeners => local
                    .release_peer_everywhere(conn, peer_id)
                    .into_iter()
                    .map(|emptied| (CommandKind::BridgeRemoveChannelListener, emptied))
                    .collect(),
                _ => Vec::new(),
            }
        };
        if declares.is_empty() {
            return;
        }
        let Some(side) = self.socket_side().await else {
            return;
        };
        for (kind, channel) in declares {
            self.declare_one(side.as_ref(), kind, channel).await;
        }
    }

    async fn declare_one(&self, side: &dyn BridgeSide, kind: CommandKind, channel: String) {
        let declare = Command::listener(kind, channel, self.peer.clone());
        if let Err(e) = side.declare(declare).await {
            debug!(error = %e, "Interest declare failed");
        }
    }

    /// Declare every currently subscribed local channel to a fresh side.
    /// The leading reset identifies this link as a bridge and clears any
    /// prior interest held under our peer, which in turn makes the broker
    /// replay the remote channel set back to us.
    async fn declare_catch_up(&self, side: &dyn BridgeSide) {
        self.declare_one(side, CommandKind::BridgeRemoveListeners, String::new())
            .await;
        let channels = self.local.lock().await.channels();
        for channel in channels {
            self.declare_one(side, CommandKind::BridgeAddChannelListener, channel)
                .await;
        }
    }

    /// One arrival, offered to every other side.
    async fn relay(&self, origin: Origin, command: Command, mut payload: RelayPayload) {
        if command.kind == CommandKind::RequestClose {
            // only the socket side holds routing state past the bus edge
            if origin != Origin::Socket {
                if let Some(side) = self.socket_side().await {
                    match payload.args() {
                        Ok(args) => {
                            if let Err(e) = side.broadcast_args(&command, args).await {
                                debug!(error = %e, "Request close relay failed");
                            }
                        }
                        Err(e) => debug!(error = %e, "Request close relay failed"),
                    }
                }
            }
            return;
        }

        let native = self.native.load(Ordering::Relaxed);

        if origin != Origin::Host && self.host_transport_is_target(&command).await {
            match payload.args() {
                Ok(args) => {
                    if let Err(e) = self.host_link.post_command(command.clone(), args).await {
                        debug!(error = %e, "Host relay failed");
                    }
                }
                Err(e) => {
                    warn!(error = %e, channel = %command.channel, "Undecodable relay payload");
                    return;
                }
            }
        }

        let targeted = self.targeted_endpoints(origin, &command).await;
        let mut dead = Vec::new();
        if !targeted.is_empty() {
            let endpoints = self.endpoints.lock().await;
            for rid in targeted {
                let Some(handle) = endpoints.get(&rid) else {
                    continue;
                };
                let delivered = if native {
                    match payload.args() {
                        Ok(args) => handle.endpoint.deliver_args(command.clone(), args),
                        Err(e) => {
                            warn!(error = %e, channel = %command.channel, "Undecodable relay payload");
                            break;
                        }
                    }
                } else {
                    match payload.frame(&command) {
                        Ok(frame) => handle.endpoint.deliver_frame(frame),
                        Err(e) => {
                            warn!(error = %e, channel = %command.channel, "Unencodable relay payload");
                            break;
                        }
                    }
                };
                if !delivered {
                    dead.push(rid);
                }
            }
        }
        for rid in dead {
            self.remove_endpoint(rid).await;
        }

        if origin != Origin::Socket {
            if let Some(side) = self.socket_side().await {
                if side.is_target(&command).await {
                    let outcome = if let Some(frame) = payload.cached_frame() {
                        side.broadcast_frame(&command, frame).await
                    } else if payload.has_args() {
                        match payload.args() {
                            Ok(args) => side.broadcast_args(&command, args).await,
                            Err(e) => Err(e),
                        }
                    } else {
                        match payload.frame(&command) {
                            Ok(frame) => side.broadcast_frame(&command, frame).await,
                            Err(e) => Err(e),
                        }
                    };
                    if let Err(e) = outcome {
                        debug!(error = %e, channel = %command.channel, "Socket relay failed");
                    }
                }
            }
        }
    }

    async fn host_transport_is_target(&self, command: &Command) -> bool {
        if self
            .local
            .lock()
            .await
            .conn_has_channel(&command.channel, HOST_CONN)
        {
            return true;
        }
        match &command.target {
            Some(target) => target.pid == self.peer.process.pid && target.rid.is_none(),
            None => false,
        }
    }

    async fn targeted_endpoints(&self, origin: Origin, command: &Command) -> Vec<u32> {
        let rids: Vec<u32> = self.endpoints.lock().await.keys().copied().collect();
        if rids.is_empty() {
            return rids;
        }
        let local = self.local.lock().await;
        rids.into_iter()
            .filter(|rid| origin != Origin::Endpoint(*rid))
            .filter(|rid| {
                if local.conn_has_channel(&command.channel, u64::from(*rid)) {
                    return true;
                }
                match &command.target {
                    Some(target) => {
                        target.pid == self.peer.process.pid && target.rid == Some(*rid)
                    }
                    None => false,
                }
            })
            .collect()
    }

    async fn remove_endpoint(&self, rid: u32) {
        let handle = self.endpoints.lock().await.remove(&rid);
        let Some(handle) = handle else { return };
        debug!(rid, "Host endpoint removed");
        let emptied = self.local.lock().await.remove_conn(u64::from(rid));
        if !emptied.is_empty() {
            if let Some(side) = self.socket_side().await {
                for channel in emptied {
                    self.declare_one(
                        side.as_ref(),
                        CommandKind::BridgeRemoveChannelListener,
                        channel,
                    )
                    .await;
                }
            }
        }
        handle.endpoint.close();
        // last: a pump removing itself must get through the cleanup above
        handle.pump.abort();
    }
}

/// Connector-facing half of the host transport side.
struct HostLinkSink(Weak<BridgeCore>);

#[async_trait]
impl ConnectorSink for HostLinkSink {
    async fn on_command(&self, command: Command, args: Args) {
        if let Some(core) = self.0.upgrade() {
            core.host_arrival(HOST_CONN, Origin::Host, command, args)
                .await;
        }
    }

    async fn on_closed(&self) {}
}

async fn pump_endpoint(
    core: Weak<BridgeCore>,
    rid: u32,
    mut inbox: mpsc::UnboundedReceiver<HostMessage>,
) {
    while let Some(message) = inbox.recv().await {
        let Some(core) = core.upgrade() else { return };
        match message {
            HostMessage::Handshake { reply } => {
                let process = ProcessInfo::current(ProcessKind::Renderer).with_rid(rid);
                let _ = reply.send(process);
            }
            HostMessage::Args { command, args } => {
                core.host_arrival(u64::from(rid), Origin::Endpoint(rid), command, args)
                    .await;
            }
            HostMessage::Packet { frame } => match frame.decode() {
                Ok((command, args)) => {
                    core.host_arrival(
                        u64::from(rid),
                        Origin::Endpoint(rid),
                        command,
                        Arc::new(args),
                    )
                    .await;
                }
                Err(e) => warn!(rid, error = %e, "Dropping undecodable context frame"),
            },
            HostMessage::Closed => {
                core.remove_endpoint(rid).await;
                return;
            }
        }
    }
    // context end dropped without a close notice
    if let Some(core) = core.upgrade() {
        core.remove_endpoint(rid).await;
    }
}
