//! Delivery envelope and the request/response capability.
//!
//! Every listener invocation receives a [`BusEvent`]; when the sender awaits
//! an answer the event additionally carries a [`RequestContext`] whose
//! `resolve`/`reject` route the response back to the requester.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::command::{Args, Command, Peer, ProcessInfo, RequestDescriptor, Settlement};

/// Where a settled response goes.
///
/// Implemented by the transport: a response either settles a pending request
/// of the same transport directly or leaves through the connector.
#[async_trait]
pub(crate) trait ResponseRoute: Send + Sync {
    async fn deliver_response(&self, command: Command, args: Args);
}

/// One inbound delivery: the channel it arrived on and the peer that sent it.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub channel: String,
    pub sender: Peer,
    request: Option<RequestContext>,
}

impl BusEvent {
    pub fn new(channel: impl Into<String>, sender: Peer) -> Self {
        Self {
            channel: channel.into(),
            sender,
            request: None,
        }
    }

    pub(crate) fn with_request(mut self, request: RequestContext) -> Self {
        self.request = Some(request);
        self
    }

    /// True when the sender awaits an answer.
    pub fn is_request(&self) -> bool {
        self.request.is_some()
    }

    /// Settlement capability, present when [`is_request`](Self::is_request).
    pub fn request(&self) -> Option<&RequestContext> {
        self.request.as_ref()
    }
}

/// Successful outcome of a request: the delivering event and the payload the
/// responder resolved with.
#[derive(Debug, Clone)]
pub struct RequestResponse {
    pub event: BusEvent,
    pub payload: Value,
}

/// Settlement capability handed to listeners of a request message.
///
/// Cloned into every listener invocation of one receiving client; all clones
/// share a single settled flag, so a context settles at most once no matter
/// how many listeners saw it. Settling after the first attempt is a no-op.
#[derive(Clone)]
pub struct RequestContext {
    descriptor: RequestDescriptor,
    requester: ProcessInfo,
    responder: Peer,
    slot: Arc<ReplySlot>,
}

struct ReplySlot {
    settled: AtomicBool,
    route: Arc<dyn ResponseRoute>,
}

impl RequestContext {
    pub(crate) fn new(
        descriptor: RequestDescriptor,
        requester: ProcessInfo,
        responder: Peer,
        route: Arc<dyn ResponseRoute>,
    ) -> Self {
        Self {
            descriptor,
            requester,
            responder,
            slot: Arc::new(ReplySlot {
                settled: AtomicBool::new(false),
                route,
            }),
        }
    }

    /// Channel the request was issued on.
    pub fn channel(&self) -> &str {
        &self.descriptor.channel
    }

    /// Answer the request with a payload.
    pub async fn resolve(&self, payload: Value) {
        self.settle(Settlement::Resolved, payload).await;
    }

    /// Refuse the request with a reason the requester sees as an error.
    pub async fn reject(&self, reason: impl Into<String>) {
        self.settle(Settlement::Rejected, Value::String(reason.into()))
            .await;
    }

    async fn settle(&self, settlement: Settlement, payload: Value) {
        if self.slot.settled.swap(true, Ordering::AcqRel) {
            debug!(
                channel = %self.descriptor.channel,
                reply_channel = %self.descriptor.reply_channel,
                "Request already settled"
            );
            return;
        }
        let response = Command::response(
            &self.descriptor,
            &self.responder,
            self.requester,
            settlement,
        );
        let args = Arc::new(vec![payload]);
        self.slot.route.deliver_response(response, args).await;
    }
}

// The route is a trait object with no useful Debug of its own.
impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("descriptor", &self.descriptor)
            .field("responder", &self.responder.name)
            .finish_non_exhaustive()
    }
}
