//! Client-side bus engine.
//!
//! A [`Transport`] owns exactly one [`Connector`] and multiplexes any number
//! of [`BusClient`]s over it: one connect state machine, one pending-request
//! table, one delivery task. Outbound commands are applied to the
//! transport's own clients directly and posted through the connector for the
//! rest of the bus; remote sides never echo a command back to its origin, so
//! every subscriber sees exactly one delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::command::{
    peer_name, reply_channel, Args, Command, CommandKind, Peer, ProcessInfo, ProcessKind,
    RequestDescriptor,
};
use crate::config::BusOptions;
use crate::connector::{Connector, ConnectorSink};
use crate::error::{BusError, Result};

pub mod client;
pub mod event;


pub use client::{handler_fn, BusClient, ListenerHandle, MessageHandler};
pub use event::{BusEvent, RequestContext, RequestResponse};

use client::{ClientState, ListenerEntry};
use event::ResponseRoute;

type Delivery = (Command, Args);

fn empty_args() -> Args {
    Arc::new(Vec::new())
}

/// Client-side engine over one connector link.
pub struct Transport {
    shared: Arc<TransportShared>,
}

impl Transport {
    /// Wrap a connector. The transport stays dormant until the first client
    /// connects.
    pub fn new(connector: impl Connector + 'static) -> Self {
        let (deliveries, delivery_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(TransportShared {
                connector: Box::new(connector),
                link: Mutex::new(LinkState::Down),
                link_up: AtomicBool::new(false),
                requests: Mutex::new(HashMap::new()),
                clients: RwLock::new(Vec::new()),
                deliveries,
                delivery_rx: Mutex::new(Some(delivery_rx)),
                request_seq: AtomicU64::new(0),
                name_seq: AtomicU64::new(0),
                listener_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Two transports wired back to back inside this process.
    pub fn in_process_pair(left: ProcessKind, right: ProcessKind) -> (Transport, Transport) {
        let (a, b) = crate::connector::pair(left, right);
        (Transport::new(a), Transport::new(b))
    }

    /// Mint a client. It joins the bus on [`BusClient::connect`].
    pub fn client(&self) -> BusClient {
        let process = ProcessInfo::current(self.shared.connector.process_kind());
        BusClient {
            shared: self.shared.clone(),
            state: Arc::new(ClientState::new(Peer::new(process))),
        }
    }
}

enum LinkState {
    Down,
    Up { process: ProcessInfo },
}

/// Pending request. Removal from the table is the settlement arbitration:
/// whoever removes the entry is the only writer of its outcome.
struct DeferredRequest {
    descriptor: RequestDescriptor,
    peer: Peer,
    tx: oneshot::Sender<Result<RequestResponse>>,
}

impl DeferredRequest {
    fn settle(self, response: &Command, descriptor: &RequestDescriptor, args: &Args) {
        let event = BusEvent::new(descriptor.channel.clone(), response.peer.clone());
        let outcome = if descriptor.resolved {
            Ok(RequestResponse {
                event,
                payload: args.first().cloned().unwrap_or(Value::Null),
            })
        } else if descriptor.rejected {
            let reason = match args.first() {
                Some(Value::String(reason)) => reason.clone(),
                Some(other) => other.to_string(),
                None => String::from("request rejected"),
            };
            Err(BusError::Rejected { event, reason })
        } else {
            Err(BusError::UnknownFormat { event })
        };
        // the requester may have dropped the future already
        let _ = self.tx.send(outcome);
    }

    /// Timeout settlement; the delivering event names the requester itself.
    fn expire(self) {
        let event = BusEvent::new(self.descriptor.channel.clone(), self.peer.clone());
        let _ = self.tx.send(Err(BusError::Timeout { event }));
    }
}

pub(crate) struct TransportShared {
    connector: Box<dyn Connector>,
    /// Connect/close state machine; held across the handshake so concurrent
    /// connects serialize and close waits for an in-flight connect.
    link: Mutex<LinkState>,
    /// Fast gate for the outbound paths and the only link state the
    /// connector sink may touch.
    link_up: AtomicBool,
    /// Pending requests keyed by reply channel.
    requests: Mutex<HashMap<String, DeferredRequest>>,
    /// Attached clients in attach order.
    clients: RwLock<Vec<Arc<ClientState>>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    /// Consumed by the delivery task on first connect.
    delivery_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    request_seq: AtomicU64,
    name_seq: AtomicU64,
    listener_seq: AtomicU64,
}

impl TransportShared {
    pub(crate) async fn connect_client(
        self: &Arc<Self>,
        client: &Arc<ClientState>,
        options: BusOptions,
    ) -> Result<Peer> {
        if client.attached.load(Ordering::Acquire) && self.link_up.load(Ordering::Acquire) {
            return Ok(client.peer.read().await.clone());
        }
        let mut link = self.link.lock().await;
        if client.attached.load(Ordering::Acquire) && self.link_up.load(Ordering::Acquire) {
            return Ok(client.peer.read().await.clone());
        }
        let established = match &*link {
            LinkState::Up { process } if self.link_up.load(Ordering::Acquire) => Some(*process),
            _ => None,
        };
        let process = match established {
            Some(process) => process,
            None => {
                if let Some(rx) = self.delivery_rx.lock().await.take() {
                    tokio::spawn(dispatch_worker(Arc::downgrade(self), rx));
                }
                let sink: Arc<dyn ConnectorSink> = Arc::new(SinkAdapter(Arc::downgrade(self)));
                let info = self.connector.handshake(sink, &options).await?;
                *link = LinkState::Up {
                    process: info.process,
                };
                self.link_up.store(true, Ordering::Release);
                info!(
                    kind = %info.process.kind,
                    pid = info.process.pid,
                    "Bus link established"
                );
                info.process
            }
        };
        let mut peer = Peer::new(process);
        peer.name = match options.peer_name {
            Some(ref name) => name.clone(),
            None => peer_name(&process, self.name_seq.fetch_add(1, Ordering::Relaxed) + 1),
        };
        *client.peer.write().await = peer.clone();
        client.attached.store(true, Ordering::Release);
        let mut clients = self.clients.write().await;
        if !clients.iter().any(|other| Arc::ptr_eq(other, client)) {
            clients.push(client.clone());
        }
        debug!(peer = %peer.name, "Client joined the bus");
        Ok(peer)
    }

    pub(crate) async fn close_client(&self, client: &Arc<ClientState>) -> Result<()> {
        let mut link = self.link.lock().await;
        if !client.attached.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let peer = client.peer.read().await.clone();
        debug!(peer = %peer.name, "Client leaving the bus");
        self.post(
            Command::listener(CommandKind::RemoveListeners, "", peer),
            empty_args(),
        )
        .await;
        client.clear_all().await;
        let remaining = {
            let mut clients = self.clients.write().await;
            clients.retain(|other| !Arc::ptr_eq(other, client));
            clients.len()
        };
        if remaining == 0 {
            self.link_up.store(false, Ordering::Release);
            *link = LinkState::Down;
            self.connector.shutdown().await?;
            info!("Bus link closed");
        }
        Ok(())
    }

    pub(crate) async fn send_message(&self, client: &ClientState, channel: &str, args: Vec<Value>) {
        if !client.attached.load(Ordering::Acquire) || !self.link_up.load(Ordering::Acquire) {
            trace!(channel, "Dropped send on a disconnected client");
            return;
        }
        let peer = client.peer.read().await.clone();
        let command = Command::message(channel, peer);
        let args = Arc::new(args);
        // own clients first, then the rest of the bus
        self.enqueue_delivery(command.clone(), args.clone());
        self.post(command, args).await;
    }

    pub(crate) async fn request_message(
        self: &Arc<Self>,
        client: &Arc<ClientState>,
        channel: &str,
        timeout: Option<Duration>,
        args: Vec<Value>,
    ) -> Result<RequestResponse> {
        let peer = client.peer.read().await.clone();
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let reply = reply_channel(&peer.id, seq);
        let descriptor = RequestDescriptor::new(channel, reply.clone());
        let (tx, rx) = oneshot::channel();
        self.requests.lock().await.insert(
            reply.clone(),
            DeferredRequest {
                descriptor: descriptor.clone(),
                peer: peer.clone(),
                tx,
            },
        );
        debug!(channel, reply_channel = %reply, "Request issued");
        if client.attached.load(Ordering::Acquire) && self.link_up.load(Ordering::Acquire) {
            let command = Command::message(channel, peer).with_request(descriptor);
            let args = Arc::new(args);
            self.enqueue_delivery(command.clone(), args.clone());
            self.post(command, args).await;
        } else {
            // dropped like any other disconnected post; the timer still runs
            trace!(channel, "Request issued on a disconnected client");
        }
        if let Some(window) = timeout {
            let shared = Arc::downgrade(self);
            let reply = reply.clone();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(shared) = shared.upgrade() {
                    shared.expire_request(&reply).await;
                }
            });
        }
        match rx.await {
            Ok(outcome) => outcome,
            // the transport went away with the request pending
            Err(_) => Err(BusError::NotConnected),
        }
    }

    async fn expire_request(&self, reply: &str) {
        let expired = self.requests.lock().await.remove(reply);
        let Some(expired) = expired else { return };
        debug!(
            channel = %expired.descriptor.channel,
            reply_channel = %reply,
            "Request timed out"
        );
        let close = Command::request_close(expired.descriptor.clone(), expired.peer.clone());
        self.post(close, empty_args()).await;
        expired.expire();
    }

    pub(crate) async fn add_listener(
        &self,
        client: &ClientState,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
        once: bool,
    ) -> ListenerHandle {
        let handle = ListenerHandle(self.listener_seq.fetch_add(1, Ordering::Relaxed) + 1);
        client
            .insert_entry(
                channel,
                ListenerEntry {
                    handle,
                    handler,
                    once,
                },
            )
            .await;
        self.post_listener_command(client, CommandKind::AddChannelListener, channel)
            .await;
        handle
    }

    /// Remove one registration; posts the removal only when it was still
    /// present, keeping remote reference counts in step.
    pub(crate) async fn remove_listener(
        &self,
        client: &ClientState,
        channel: &str,
        handle: ListenerHandle,
    ) -> bool {
        let removed = client.remove_entry(channel, handle).await;
        if removed {
            self.post_listener_command(client, CommandKind::RemoveChannelListener, channel)
                .await;
        }
        removed
    }

    pub(crate) async fn post_listener_command(
        &self,
        client: &ClientState,
        kind: CommandKind,
        channel: &str,
    ) {
        let peer = client.peer.read().await.clone();
        self.post(Command::listener(kind, channel, peer), empty_args())
            .await;
    }

    /// Fire-and-forget outbound path; a down link is a silent no-op sink.
    async fn post(&self, command: Command, args: Args) {
        if !self.link_up.load(Ordering::Acquire) {
            trace!(kind = ?command.kind, channel = %command.channel, "Dropped outbound command");
            return;
        }
        if let Err(error) = self.connector.post_command(command, args).await {
            debug!(error = %error, "Outbound command lost");
        }
    }

    fn enqueue_delivery(&self, command: Command, args: Args) {
        // the receiver lives as long as the transport
        let _ = self.deliveries.send((command, args));
    }

    async fn handle_inbound(&self, command: Command, args: Args) {
        match command.kind {
            CommandKind::RequestResponse => {
                // settled inline so a listener awaiting a chained request
                // never stalls its own response
                self.settle_from_response(&command, &args).await;
            }
            CommandKind::SendMessage => self.enqueue_delivery(command, args),
            _ => {
                trace!(kind = ?command.kind, channel = %command.channel, "Ignored inbound command");
            }
        }
    }

    /// True when the response settled a pending request of this transport.
    async fn settle_from_response(&self, command: &Command, args: &Args) -> bool {
        let Some(descriptor) = &command.request else {
            warn!(channel = %command.channel, "Response without a request descriptor");
            return false;
        };
        let pending = self.requests.lock().await.remove(&descriptor.reply_channel);
        match pending {
            Some(pending) => {
                pending.settle(command, descriptor, args);
                true
            }
            None => {
                trace!(reply_channel = %descriptor.reply_channel, "Late response dropped");
                false
            }
        }
    }

    /// Pending requests are left to their timers. Must not take the link
    /// mutex: a close on the other end of an in-process pair holds its own
    /// while notifying us.
    fn on_link_lost(&self) {
        self.link_up.store(false, Ordering::Release);
        warn!("Bus link lost");
    }

    async fn dispatch_message(self: &Arc<Self>, command: Command, args: Args) {
        let clients: Vec<Arc<ClientState>> = self.clients.read().await.clone();
        for client in &clients {
            let entries = client.entries_for(&command.channel).await;
            if entries.is_empty() {
                continue;
            }
            let mut event = BusEvent::new(command.channel.clone(), command.peer.clone());
            if let Some(descriptor) = &command.request {
                let responder = client.peer.read().await.clone();
                let route: Arc<dyn ResponseRoute> = self.clone();
                event = event.with_request(RequestContext::new(
                    descriptor.clone(),
                    command.peer.process,
                    responder,
                    route,
                ));
            }
            for entry in entries {
                if entry.once
                    && !self
                        .remove_listener(client, &command.channel, entry.handle)
                        .await
                {
                    continue;
                }
                entry.handler.handle(event.clone(), args.clone()).await;
            }
        }
    }
}

#[async_trait]
impl ResponseRoute for TransportShared {
    async fn deliver_response(&self, command: Command, args: Args) {
        // same-process short-circuit: a requester on this transport settles
        // without touching the wire
        if self.settle_from_response(&command, &args).await {
            return;
        }
        self.post(command, args).await;
    }
}

async fn dispatch_worker(
    shared: Weak<TransportShared>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some((command, args)) = deliveries.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        shared.dispatch_message(command, args).await;
    }
}

/// Connector-facing half of the transport.
struct SinkAdapter(Weak<TransportShared>);

#[async_trait]
impl ConnectorSink for SinkAdapter {
    async fn on_command(&self, command: Command, args: Args) {
        if let Some(shared) = self.0.upgrade() {
            shared.handle_inbound(command, args).await;
        }
    }

    async fn on_closed(&self) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_link_lost();
        }
    }
}
