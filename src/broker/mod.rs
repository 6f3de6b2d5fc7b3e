//! Socket broker.
//!
//! The hub of a bus: accepts transport connections over TCP or a Unix
//! domain socket, keeps the channel subscription table and a pid-indexed
//! endpoint table, and routes every received frame by its command section
//! alone. Fan-out forwards the frame bytes exactly as received; the broker
//! never re-encodes traffic.
//!
//! A bridge hosting this broker in process attaches as a pseudo-connection:
//! it takes part in the same tables and routing as a socket connection but
//! receives its traffic as decoded [`BrokerEvent`]s instead of frames.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
#[cfg(unix)]
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::command::{Command, CommandKind, Peer, ProcessInfo, ProcessKind, REPLY_CHANNEL_PREFIX};
use crate::config::BusOptions;
use crate::error::{BusError, Result};
use crate::packet::{Frame, FrameStream};

mod subscriptions;

pub(crate) use subscriptions::{ConnId, SubscriptionMap};

/// Traffic handed to a bridge hosted in the same process.
#[derive(Debug)]
pub(crate) enum BrokerEvent {
    /// A subscription transition, already rewritten as a bridge-prefixed
    /// command.
    Subscription(Command),
    /// A delivery received on a socket connection, offered for federation.
    Delivery { command: Command, frame: Frame },
}

#[derive(Clone, Debug)]
enum ConnSink {
    /// Frames queued to a socket writer task.
    Socket(mpsc::UnboundedSender<Frame>),
    /// Events handed to an in-process bridge.
    Bridge(mpsc::UnboundedSender<BrokerEvent>),
}

#[derive(Debug)]
struct ConnHandle {
    sink: ConnSink,
    reader: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct RouterState {
    conns: HashMap<ConnId, ConnHandle>,
    subscriptions: SubscriptionMap,
    /// pid of the most recent command sender, per connection.
    endpoints: HashMap<u32, ConnId>,
    /// Connections that identified themselves with bridge-prefixed commands.
    bridges: HashSet<ConnId>,
}

#[derive(Debug)]
struct BrokerCore {
    peer: Peer,
    state: Mutex<RouterState>,
    next_conn: AtomicU64,
    accept: Mutex<Option<JoinHandle<()>>>,
    local_addr: Option<SocketAddr>,
    socket_path: Option<PathBuf>,
}

/// Socket server every transport of a bus dials into.
#[derive(Clone, Debug)]
pub struct Broker {
    core: Arc<BrokerCore>,
}

impl Broker {
    /// Bind per the options and start accepting connections.
    ///
    /// `port` binds TCP on 127.0.0.1; port 0 picks an ephemeral port,
    /// observable through [`Broker::local_addr`]. `path` binds a Unix domain
    /// socket, unlinking a stale socket file first.
    pub async fn listen(options: BusOptions) -> Result<Broker> {
        options.validate()?;
        if let Some(port) = options.port {
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            let addr = listener.local_addr()?;
            let broker = Broker::with_endpoint(Some(addr), None);
            let task = tokio::spawn(accept_tcp(
                Arc::clone(&broker.core),
                TcpListenerStream::new(listener),
            ));
            *broker.core.accept.lock().await = Some(task);
            info!(addr = %addr, "Broker listening");
            return Ok(broker);
        }
        if let Some(path) = options.path {
            #[cfg(unix)]
            {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                let listener = UnixListener::bind(&path)?;
                let broker = Broker::with_endpoint(None, Some(path.clone()));
                let task = tokio::spawn(accept_uds(
                    Arc::clone(&broker.core),
                    UnixListenerStream::new(listener),
                ));
                *broker.core.accept.lock().await = Some(task);
                info!(path = %path.display(), "Broker listening");
                return Ok(broker);
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(BusError::Unsupported(
                    "unix domain sockets on this platform",
                ));
            }
        }
        Err(BusError::InvalidOptions(
            "a broker needs a port or a path to listen on".into(),
        ))
    }

    fn with_endpoint(local_addr: Option<SocketAddr>, socket_path: Option<PathBuf>) -> Broker {
        let mut peer = Peer::new(ProcessInfo::current(ProcessKind::Main));
        peer.name = format!("broker_{}", peer.process.pid);
        Broker {
            core: Arc::new(BrokerCore {
                peer,
                state: Mutex::new(RouterState::default()),
                next_conn: AtomicU64::new(1),
                accept: Mutex::new(None),
                local_addr,
                socket_path,
            }),
        }
    }

    /// Bound TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr
    }

    /// Stop accepting, drop every connection and clear the tables.
    pub async fn close(&self) -> Result<()> {
        if let Some(task) = self.core.accept.lock().await.take() {
            task.abort();
        }
        let mut state = self.core.state.lock().await;
        for (_, handle) in state.conns.drain() {
            if let Some(reader) = handle.reader {
                reader.abort();
            }
        }
        state.subscriptions = SubscriptionMap::new();
        state.endpoints.clear();
        state.bridges.clear();
        drop(state);
        if let Some(path) = &self.core.socket_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("Broker closed");
        Ok(())
    }

    /// Snapshot of the subscribed channels, reply channels included.
    pub async fn channels(&self) -> Vec<String> {
        self.core.state.lock().await.subscriptions.channels()
    }

    pub async fn has_channel(&self, channel: &str) -> bool {
        self.core
            .state
            .lock()
            .await
            .subscriptions
            .has_channel(channel)
    }

    /// Attach an in-process bridge as a pseudo-connection.
    pub(crate) async fn attach_bridge(&self) -> (ConnId, mpsc::UnboundedReceiver<BrokerEvent>) {
        let conn = self.core.next_conn.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut state = self.core.state.lock().await;
        state.conns.insert(
            conn,
            ConnHandle {
                sink: ConnSink::Bridge(events_tx),
                reader: None,
            },
        );
        state.bridges.insert(conn);
        self.core.catch_up_bridge(&state, conn);
        debug!(conn, "Bridge attached");
        (conn, events_rx)
    }

    pub(crate) async fn detach_bridge(&self, conn: ConnId) {
        self.core.drop_connection(conn).await;
    }

    /// Route a command produced by an attached bridge.
    pub(crate) async fn inject(&self, conn: ConnId, command: Command, frame: Frame) {
        self.core.route(conn, command, frame).await;
    }

    /// True when someone besides `conn` subscribes to the command's channel,
    /// or when its target pid is connected through another connection.
    pub(crate) async fn is_target_except(&self, command: &Command, conn: ConnId) -> bool {
        let state = self.core.state.lock().await;
        if state
            .subscriptions
            .has_channel_except(&command.channel, conn)
        {
            return true;
        }
        match &command.target {
            Some(target) => {
                matches!(state.endpoints.get(&target.pid), Some(&owner) if owner != conn)
            }
            None => false,
        }
    }
}

impl BrokerCore {
    async fn register_connection<S>(self: &Arc<Self>, stream: S)
    where
        S: FrameStream + 'static,
    {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().await;
            state.conns.insert(
                conn,
                ConnHandle {
                    sink: ConnSink::Socket(frames_tx),
                    reader: None,
                },
            );
        }
        tokio::spawn(write_frames(conn, write_half, frames_rx));
        let reader = tokio::spawn({
            let core = Arc::clone(self);
            async move { core.read_frames(conn, read_half).await }
        });
        if let Some(handle) = self.state.lock().await.conns.get_mut(&conn) {
            handle.reader = Some(reader);
        }
        debug!(conn, "Connection registered");
    }

    async fn read_frames<R>(self: Arc<Self>, conn: ConnId, mut reader: R)
    where
        R: AsyncRead + Send + Unpin,
    {
        loop {
            match Frame::read_from(&mut reader).await {
                Ok(Some(frame)) => match frame.command() {
                    Ok(command) => self.route(conn, command, frame).await,
                    Err(e) => warn!(conn, error = %e, "Undecodable command section"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(conn, error = %e, "Connection read failed");
                    break;
                }
            }
        }
        self.drop_connection(conn).await;
    }

    async fn route(&self, conn: ConnId, command: Command, frame: Frame) {
        trace!(conn, kind = ?command.kind, channel = %command.channel, "Routing command");
        let mut state = self.state.lock().await;
        state.endpoints.insert(command.peer.process.pid, conn);

        if command.kind.is_listener_management() {
            self.apply_listener_command(&mut state, conn, &command);
            return;
        }
        match command.kind {
            CommandKind::SendMessage => self.route_message(&mut state, conn, &command, frame),
            CommandKind::RequestResponse => self.route_response(&mut state, conn, &command, frame),
            CommandKind::RequestClose => {
                if let Some(descriptor) = &command.request {
                    state.subscriptions.remove_channel(&descriptor.reply_channel);
                }
                // federators track in-flight requests; they must hear closes
                let bridges: Vec<ConnId> = state.bridges.iter().copied().collect();
                for bridge in bridges {
                    if bridge != conn {
                        self.deliver(&state, bridge, &command, frame.clone());
                    }
                }
            }
            _ => {}
        }
    }

    fn apply_listener_command(&self, state: &mut RouterState, conn: ConnId, command: &Command) {
        let kind = command.kind;
        if kind.is_bridge() && state.bridges.insert(conn) {
            self.catch_up_bridge(state, conn);
        }
        let channel = command.channel.as_str();
        let peer_id = command.peer.id.as_str();
        match kind.base_variant().unwrap_or(kind) {
            CommandKind::AddChannelListener => {
                if state.subscriptions.add_ref(channel, conn, peer_id) {
                    self.relay_transition(
                        state,
                        conn,
                        kind,
                        CommandKind::BridgeAddChannelListener,
                        channel,
                        &command.peer,
                    );
                }
            }
            CommandKind::RemoveChannelListener => {
                if state.subscriptions.release(channel, conn, peer_id) {
                    self.relay_transition(
                        state,
                        conn,
                        kind,
                        CommandKind::BridgeRemoveChannelListener,
                        channel,
                        &command.peer,
                    );
                }
            }
            CommandKind::RemoveChannelAllListeners => {
                if state.subscriptions.release_peer(channel, conn, peer_id) {
                    self.relay_transition(
                        state,
                        conn,
                        kind,
                        CommandKind::BridgeRemoveChannelListener,
                        channel,
                        &command.peer,
                    );
                }
            }
            CommandKind::RemoveListeners => {
                for emptied in state.subscriptions.release_peer_everywhere(conn, peer_id) {
                    self.relay_transition(
                        state,
                        conn,
                        kind,
                        CommandKind::BridgeRemoveChannelListener,
                        &emptied,
                        &command.peer,
                    );
                }
            }
            _ => {}
        }
    }

    /// Tell every bridge connection but the originating one about a
    /// first/last subscriber transition. Bridge-caused changes stay where
    /// they landed (single-hop propagation), and reply channels are silent.
    fn relay_transition(
        &self,
        state: &RouterState,
        origin: ConnId,
        caused_by: CommandKind,
        relay_kind: CommandKind,
        channel: &str,
        peer: &Peer,
    ) {
        if caused_by.is_bridge() || channel.starts_with(REPLY_CHANNEL_PREFIX) {
            return;
        }
        if state.bridges.is_empty() {
            return;
        }
        let relay = Command::listener(relay_kind, channel, peer.clone());
        self.send_to_bridges(state, origin, &relay);
    }

    /// Replay current channel interest to a connection that just declared
    /// itself a bridge, so a late-joining federator starts in sync. Channels
    /// only the new bridge itself populates are skipped.
    fn catch_up_bridge(&self, state: &RouterState, conn: ConnId) {
        for channel in state.subscriptions.channels() {
            if channel.starts_with(REPLY_CHANNEL_PREFIX)
                || !state.subscriptions.has_channel_except(&channel, conn)
            {
                continue;
            }
            let relay = Command::listener(
                CommandKind::BridgeAddChannelListener,
                channel,
                self.peer.clone(),
            );
            self.send_to_conn(state, conn, &relay);
        }
    }

    fn send_to_conn(&self, state: &RouterState, conn: ConnId, relay: &Command) {
        let Some(handle) = state.conns.get(&conn) else {
            return;
        };
        match &handle.sink {
            ConnSink::Socket(frames) => match Frame::encode(relay, &[]) {
                Ok(frame) => {
                    let _ = frames.send(frame);
                }
                Err(e) => warn!(error = %e, "Relay encode failed"),
            },
            ConnSink::Bridge(events) => {
                let _ = events.send(BrokerEvent::Subscription(relay.clone()));
            }
        }
    }

    fn send_to_bridges(&self, state: &RouterState, origin: ConnId, relay: &Command) {
        let mut encoded: Option<Frame> = None;
        for (&conn, handle) in &state.conns {
            if conn == origin || !state.bridges.contains(&conn) {
                continue;
            }
            match &handle.sink {
                ConnSink::Socket(frames) => {
                    let frame = match &encoded {
                        Some(frame) => frame.clone(),
                        None => match Frame::encode(relay, &[]) {
                            Ok(frame) => {
                                encoded = Some(frame.clone());
                                frame
                            }
                            Err(e) => {
                                warn!(error = %e, "Relay encode failed");
                                return;
                            }
                        },
                    };
                    let _ = frames.send(frame);
                }
                ConnSink::Bridge(events) => {
                    let _ = events.send(BrokerEvent::Subscription(relay.clone()));
                }
            }
        }
    }

    fn route_message(
        &self,
        state: &mut RouterState,
        origin: ConnId,
        command: &Command,
        frame: Frame,
    ) {
        if let Some(descriptor) = &command.request {
            // single-use route back for the response; no channel event
            state
                .subscriptions
                .add_ref(&descriptor.reply_channel, origin, &command.peer.id);
        }
        if let Some(target) = &command.target {
            self.deliver_to_pid(state, target.pid, command, frame);
            return;
        }
        self.fan_out(state, origin, command, frame);
    }

    fn route_response(
        &self,
        state: &mut RouterState,
        origin: ConnId,
        command: &Command,
        frame: Frame,
    ) {
        let reply_channel = command
            .request
            .as_ref()
            .map(|descriptor| descriptor.reply_channel.as_str())
            .unwrap_or(command.channel.as_str());
        // the registration made at request time names the exact connection;
        // the pid table is the fallback for replies we never saw issued
        let holders = state.subscriptions.conns(reply_channel);
        if !holders.is_empty() {
            for conn in holders {
                if conn != origin {
                    self.deliver(state, conn, command, frame.clone());
                }
            }
        } else if let Some(target) = &command.target {
            self.deliver_to_pid(state, target.pid, command, frame);
        } else {
            self.fan_out(state, origin, command, frame);
        }
        state.subscriptions.remove_channel(reply_channel);
    }

    fn fan_out(&self, state: &RouterState, origin: ConnId, command: &Command, frame: Frame) {
        let mut delivered = 0usize;
        for conn in state.subscriptions.conns(&command.channel) {
            if conn == origin {
                continue;
            }
            if self.deliver(state, conn, command, frame.clone()) {
                delivered += 1;
            }
        }
        trace!(channel = %command.channel, delivered, "Fan-out");
    }

    fn deliver_to_pid(&self, state: &RouterState, pid: u32, command: &Command, frame: Frame) {
        match state.endpoints.get(&pid) {
            Some(&conn) => {
                self.deliver(state, conn, command, frame);
            }
            None => trace!(pid, channel = %command.channel, "No endpoint for target"),
        }
    }

    fn deliver(&self, state: &RouterState, conn: ConnId, command: &Command, frame: Frame) -> bool {
        let Some(handle) = state.conns.get(&conn) else {
            return false;
        };
        match &handle.sink {
            ConnSink::Socket(frames) => frames.send(frame).is_ok(),
            ConnSink::Bridge(events) => events
                .send(BrokerEvent::Delivery {
                    command: command.clone(),
                    frame,
                })
                .is_ok(),
        }
    }

    async fn drop_connection(&self, conn: ConnId) {
        let mut state = self.state.lock().await;
        if state.conns.remove(&conn).is_none() {
            return;
        }
        state.endpoints.retain(|_, owner| *owner != conn);
        let was_bridge = state.bridges.remove(&conn);
        let emptied = state.subscriptions.remove_conn(conn);
        debug!(conn, channels = emptied.len(), "Connection dropped");
        if was_bridge {
            return;
        }
        for channel in emptied {
            if channel.starts_with(REPLY_CHANNEL_PREFIX) {
                continue;
            }
            let relay = Command::listener(
                CommandKind::BridgeRemoveChannelListener,
                channel,
                self.peer.clone(),
            );
            self.send_to_bridges(&state, conn, &relay);
        }
    }
}

async fn accept_tcp(core: Arc<BrokerCore>, mut incoming: TcpListenerStream) {
    while let Some(stream) = incoming.next().await {
        match stream {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                core.register_connection(stream).await;
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }
}

#[cfg(unix)]
async fn accept_uds(core: Arc<BrokerCore>, mut incoming: UnixListenerStream) {
    while let Some(stream) = incoming.next().await {
        match stream {
            Ok(stream) => core.register_connection(stream).await,
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }
}

async fn write_frames<W>(conn: ConnId, mut writer: W, mut frames: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = frame.write_to(&mut writer).await {
            debug!(conn, error = %e, "Connection write failed");
            break;
        }
    }
}
