//! User-facing client handle.
//!
//! A [`BusClient`] is one logical endpoint on the bus: it owns a peer
//! identity and a listener registry, and shares the underlying transport
//! (and with it the socket) with every other client minted from the same
//! [`Transport`](super::Transport). Listener registrations mirror into the
//! remote subscription tables through the listener-management commands.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::command::{Args, CommandKind, Peer};
use crate::config::BusOptions;
use crate::error::Result;
use crate::transport::event::{BusEvent, RequestResponse};
use crate::transport::TransportShared;

/// Listener invoked for every delivery on a subscribed channel.
///
/// Handlers of one client run sequentially in registration order on the
/// transport's delivery task; spawn long-running work instead of blocking
/// the bus.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, event: BusEvent, args: Args);
}

/// Adapt an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(BusEvent, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(BusEvent, Args) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: BusEvent, args: Args) {
        (self.0)(event, args).await;
    }
}

/// Opaque id of one listener registration, unique per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub(crate) u64);

#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub(crate) handle: ListenerHandle,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) once: bool,
}

/// Per-client state shared between the handle and the transport engine.
pub(crate) struct ClientState {
    /// Provisional until connect finalizes it; replaced on every reconnect.
    pub(crate) peer: RwLock<Peer>,
    /// True between a successful connect and the matching close.
    pub(crate) attached: AtomicBool,
    listeners: RwLock<HashMap<String, Vec<ListenerEntry>>>,
}

impl ClientState {
    pub(crate) fn new(peer: Peer) -> Self {
        Self {
            peer: RwLock::new(peer),
            attached: AtomicBool::new(false),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn insert_entry(&self, channel: &str, entry: ListenerEntry) {
        self.listeners
            .write()
            .await
            .entry(channel.to_owned())
            .or_default()
            .push(entry);
    }

    /// Remove one registration; true when it was still present.
    pub(crate) async fn remove_entry(&self, channel: &str, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.write().await;
        let Some(entries) = listeners.get_mut(channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.handle != handle);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(channel);
        }
        removed
    }

    /// Drop every registration for one channel; true when any existed.
    pub(crate) async fn clear_channel(&self, channel: &str) -> bool {
        self.listeners.write().await.remove(channel).is_some()
    }

    pub(crate) async fn clear_all(&self) {
        self.listeners.write().await.clear();
    }

    /// Snapshot of the registrations for one channel, in registration order.
    pub(crate) async fn entries_for(&self, channel: &str) -> Vec<ListenerEntry> {
        self.listeners
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

/// One endpoint on the bus.
///
/// Minted by [`Transport::client`](super::Transport::client); clones share
/// the same identity and registry. Every client on a transport shares its
/// connector link, request table and delivery task.
#[derive(Clone)]
pub struct BusClient {
    pub(crate) shared: Arc<TransportShared>,
    pub(crate) state: Arc<ClientState>,
}

impl BusClient {
    /// Join the bus.
    ///
    /// The first client to connect performs the connector handshake; later
    /// clients reuse the established link. Idempotent per client, and each
    /// connect after a close mints a fresh peer identity.
    pub async fn connect(&self, options: BusOptions) -> Result<Peer> {
        self.shared.connect_client(&self.state, options).await
    }

    /// Leave the bus.
    ///
    /// Waits for an in-flight connect, tells the rest of the bus to forget
    /// this client's subscriptions, and clears the local registry. The last
    /// client to leave shuts the connector down. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.shared.close_client(&self.state).await
    }

    /// This client's identity as other peers see it.
    pub async fn peer(&self) -> Peer {
        self.state.peer.read().await.clone()
    }

    /// Broadcast a message to every listener of `channel`, including
    /// listeners attached to this same transport. Fire and forget; sends on
    /// a disconnected client are dropped.
    pub async fn send(&self, channel: &str, args: Vec<Value>) {
        self.shared.send_message(&self.state, channel, args).await;
    }

    /// Broadcast a request on `channel` and await the first settlement.
    ///
    /// `timeout` of `None` never expires; on expiry the pending request is
    /// rejected locally and the rest of the bus is told to forget its reply
    /// channel.
    pub async fn request(
        &self,
        channel: &str,
        timeout: Option<Duration>,
        args: Vec<Value>,
    ) -> Result<RequestResponse> {
        self.shared
            .request_message(&self.state, channel, timeout, args)
            .await
    }

    /// Subscribe `handler` to `channel`. Listeners run in registration
    /// order.
    pub async fn add_listener(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> ListenerHandle {
        self.shared
            .add_listener(&self.state, channel, handler, false)
            .await
    }

    /// Subscribe `handler` for a single delivery; it is unregistered before
    /// it runs.
    pub async fn once(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> ListenerHandle {
        self.shared
            .add_listener(&self.state, channel, handler, true)
            .await
    }

    /// Drop one registration.
    pub async fn remove_listener(&self, channel: &str, handle: ListenerHandle) {
        self.shared
            .remove_listener(&self.state, channel, handle)
            .await;
    }

    /// Drop every registration this client holds on `channel`.
    pub async fn remove_all_listeners(&self, channel: &str) {
        self.state.clear_channel(channel).await;
        self.shared
            .post_listener_command(&self.state, CommandKind::RemoveChannelAllListeners, channel)
            .await;
    }

    /// Drop every registration this client holds.
    pub async fn remove_all(&self) {
        self.state.clear_all().await;
        self.shared
            .post_listener_command(&self.state, CommandKind::RemoveListeners, "")
            .await;
    }
}
