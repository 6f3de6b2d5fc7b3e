//! The connector abstraction: one link contract, three media.
//!
//! A transport owns exactly one connector and never cares which medium is
//! behind it:
//!
//! ```text
//!   Transport ──► Connector ──► in-process pair   (direct dispatch)
//!                           ──► socket            (framed TCP / UDS)
//!                           ──► host channel      (embedding app's mpsc)
//! ```
//!
//! Inbound traffic flows the other way through [`ConnectorSink`], which the
//! transport implements.

use async_trait::async_trait;
use std::sync::Arc;

use crate::command::{Args, Command, ProcessInfo, ProcessKind};
use crate::config::BusOptions;
use crate::error::Result;

pub mod host;
pub mod in_process;
pub mod socket;

pub use host::{host_channel, HostConnector, HostEndpoint, HostMessage};
pub use in_process::{pair, InProcessConnector};
pub use socket::SocketConnector;

/// Outcome of a successful handshake: the process descriptor the connected
/// peer carries from now on. Socket and in-process connectors report their
/// own process; a host-channel connector is told its descriptor (pid plus
/// routing id) by the bridge end.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub process: ProcessInfo,
}

/// Inbound half of a link, implemented by the transport.
#[async_trait]
pub trait ConnectorSink: Send + Sync {
    /// One command arrived from the remote side.
    async fn on_command(&self, command: Command, args: Args);

    /// The link died underneath us (remote close or transport failure).
    /// Not invoked for a locally requested shutdown.
    async fn on_closed(&self);
}

/// One logical link to the rest of the bus.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Kind of execution context this connector represents.
    fn process_kind(&self) -> ProcessKind;

    /// Establish the link and register `sink` for inbound delivery.
    async fn handshake(
        &self,
        sink: Arc<dyn ConnectorSink>,
        options: &BusOptions,
    ) -> Result<HandshakeInfo>;

    /// Ship one command, fire and forget.
    async fn post_command(&self, command: Command, args: Args) -> Result<()>;

    /// Tear the link down. Closing an already-closed link is a no-op.
    async fn shutdown(&self) -> Result<()>;
}
