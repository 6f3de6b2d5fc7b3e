//! Bus command protocol.
//!
//! Shared vocabulary for everything else in the crate: the command envelope
//! exchanged between transports, brokers and bridges, peer identity, and the
//! request descriptor that turns a plain message into a request/response
//! exchange. This module has no dependency on the runtime pieces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Argument array riding with a message.
///
/// Shared between every local listener of a delivery; payloads are opaque to
/// the bus and never cloned per listener.
pub type Args = Arc<Vec<serde_json::Value>>;

/// Reserved channel namespace for bus-internal traffic.
pub const BUS_NAMESPACE: &str = "/crossbus";

/// Prefix of every request reply channel.
///
/// The full reply channel is `<prefix><peer id>-<per-transport counter>`.
/// This exact string is shared by every implementation on a bus, so it must
/// never change on a whim.
pub const REPLY_CHANNEL_PREFIX: &str = "/crossbus/request-";

/// Kind of execution context a peer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// Privileged host process.
    Main,
    /// Embedded GUI/scripting context inside the host.
    Renderer,
    /// Auxiliary worker process.
    Node,
    Other,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessKind::Main => "main",
            ProcessKind::Renderer => "renderer",
            ProcessKind::Node => "node",
            ProcessKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Where a peer runs: context kind, OS process id, and for embedded
/// contexts the routing id assigned by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub kind: ProcessKind,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rid: Option<u32>,
}

impl ProcessInfo {
    /// Descriptor for the current OS process.
    pub fn current(kind: ProcessKind) -> Self {
        Self {
            kind,
            pid: std::process::id(),
            rid: None,
        }
    }

    pub fn with_rid(mut self, rid: u32) -> Self {
        self.rid = Some(rid);
        self
    }
}

/// One logical bus endpoint.
///
/// A peer is minted per connection attempt: a fresh uuid, a name either
/// supplied by the caller or generated from the process descriptor, and the
/// process descriptor returned by the connector handshake. Immutable after
/// connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub process: ProcessInfo,
}

impl Peer {
    /// Mint a peer with a fresh id and an empty name (finalized at connect).
    pub fn new(process: ProcessInfo) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            process,
        }
    }
}

/// Generated peer name: `<kind>_<pid>[-<rid>]-<seq>`.
pub fn peer_name(process: &ProcessInfo, seq: u64) -> String {
    let mut name = format!("{}_{}", process.kind, process.pid);
    if let Some(rid) = process.rid {
        name.push_str(&format!("-{rid}"));
    }
    name.push_str(&format!("-{seq}"));
    name
}

/// Reply channel for request `seq` issued by `peer_id`.
///
/// Peer id plus a per-transport counter: unique within the peer, and peers
/// never collide with each other.
pub fn reply_channel(peer_id: &str, seq: u64) -> String {
    format!("{REPLY_CHANNEL_PREFIX}{peer_id}-{seq}")
}

/// Travels inside a command to make it a request; the reply channel doubles
/// as a single-use subscription routing the response back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub channel: String,
    pub reply_channel: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub rejected: bool,
}

impl RequestDescriptor {
    pub fn new(channel: impl Into<String>, reply_channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            reply_channel: reply_channel.into(),
            resolved: false,
            rejected: false,
        }
    }
}

/// How a responder settled a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Resolved,
    Rejected,
}

/// The closed set of command kinds.
///
/// The bridge-prefixed kinds are the listener-management kinds as relayed by
/// a bridge on behalf of a whole bus side; brokers track them per bridge
/// connection and never relay them further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    SendMessage,
    RequestResponse,
    RequestClose,
    AddChannelListener,
    RemoveChannelListener,
    RemoveChannelAllListeners,
    RemoveListeners,
    BridgeAddChannelListener,
    BridgeRemoveChannelListener,
    BridgeRemoveChannelAllListeners,
    BridgeRemoveListeners,
}

impl CommandKind {
    /// Bridge-prefixed form of a listener-management kind.
    pub fn bridge_variant(self) -> Option<CommandKind> {
        match self {
            CommandKind::AddChannelListener => Some(CommandKind::BridgeAddChannelListener),
            CommandKind::RemoveChannelListener => Some(CommandKind::BridgeRemoveChannelListener),
            CommandKind::RemoveChannelAllListeners => {
                Some(CommandKind::BridgeRemoveChannelAllListeners)
            }
            CommandKind::RemoveListeners => Some(CommandKind::BridgeRemoveListeners),
            _ => None,
        }
    }

    /// Base form of a bridge-prefixed kind.
    pub fn base_variant(self) -> Option<CommandKind> {
        match self {
            CommandKind::BridgeAddChannelListener => Some(CommandKind::AddChannelListener),
            CommandKind::BridgeRemoveChannelListener => Some(CommandKind::RemoveChannelListener),
            CommandKind::BridgeRemoveChannelAllListeners => {
                Some(CommandKind::RemoveChannelAllListeners)
            }
            CommandKind::BridgeRemoveListeners => Some(CommandKind::RemoveListeners),
            _ => None,
        }
    }

    pub fn is_bridge(self) -> bool {
        self.base_variant().is_some()
    }

    /// True for the kinds that mutate a subscription table.
    pub fn is_listener_management(self) -> bool {
        matches!(
            self,
            CommandKind::AddChannelListener
                | CommandKind::RemoveChannelListener
                | CommandKind::RemoveChannelAllListeners
                | CommandKind::RemoveListeners
        ) || self.is_bridge()
    }
}

/// The command envelope.
///
/// `target` addresses a specific process for direct delivery instead of
/// channel fan-out; responses carry the requester's process there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub channel: String,
    pub peer: Peer,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request: Option<RequestDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target: Option<ProcessInfo>,
}

impl Command {
    /// A plain broadcast message.
    pub fn message(channel: impl Into<String>, peer: Peer) -> Self {
        Self {
            kind: CommandKind::SendMessage,
            channel: channel.into(),
            peer,
            request: None,
            target: None,
        }
    }

    /// Attach a request descriptor, turning a message into a request.
    pub fn with_request(mut self, descriptor: RequestDescriptor) -> Self {
        self.request = Some(descriptor);
        self
    }

    /// A listener-management command.
    pub fn listener(kind: CommandKind, channel: impl Into<String>, peer: Peer) -> Self {
        debug_assert!(kind.is_listener_management());
        Self {
            kind,
            channel: channel.into(),
            peer,
            request: None,
            target: None,
        }
    }

    /// A request-close notice for an abandoned request.
    pub fn request_close(descriptor: RequestDescriptor, peer: Peer) -> Self {
        Self {
            kind: CommandKind::RequestClose,
            channel: descriptor.channel.clone(),
            peer,
            request: Some(descriptor),
            target: None,
        }
    }

    /// Build the response to a request.
    ///
    /// Always a fresh command: the inbound request command is never mutated.
    /// The response travels on the reply channel, carries the responder as
    /// its peer and the requester's process as its direct-delivery target,
    /// and its descriptor has exactly one of resolved/rejected set.
    pub fn response(
        request: &RequestDescriptor,
        responder: &Peer,
        requester: ProcessInfo,
        settlement: Settlement,
    ) -> Self {
        let descriptor = RequestDescriptor {
            channel: request.channel.clone(),
            reply_channel: request.reply_channel.clone(),
            resolved: settlement == Settlement::Resolved,
            rejected: settlement == Settlement::Rejected,
        };
        Self {
            kind: CommandKind::RequestResponse,
            channel: descriptor.reply_channel.clone(),
            peer: responder.clone(),
            request: Some(descriptor),
            target: Some(requester),
        }
    }
}
