//! In-process link: two connectors joined by direct dispatch.
//!
//! No serialization, no framing; a posted command lands in the peer end's
//! sink as the same values. Used standalone for two transports in one
//! runtime, and by the bridge for its host-process side.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

use super::{Connector, ConnectorSink, HandshakeInfo};
use crate::command::{Args, Command, ProcessInfo, ProcessKind};
use crate::config::BusOptions;
use crate::error::Result;

struct PairShared {
    sinks: [RwLock<Option<Arc<dyn ConnectorSink>>>; 2],
}

/// One end of an in-process link.
pub struct InProcessConnector {
    shared: Arc<PairShared>,
    side: usize,
    kind: ProcessKind,
    closed: AtomicBool,
}

/// Create a joined pair; each end reports the given context kind.
pub fn pair(left: ProcessKind, right: ProcessKind) -> (InProcessConnector, InProcessConnector) {
    let shared = Arc::new(PairShared {
        sinks: [RwLock::new(None), RwLock::new(None)],
    });
    (
        InProcessConnector {
            shared: Arc::clone(&shared),
            side: 0,
            kind: left,
            closed: AtomicBool::new(false),
        },
        InProcessConnector {
            shared,
            side: 1,
            kind: right,
            closed: AtomicBool::new(false),
        },
    )
}

impl InProcessConnector {
    fn peer_side(&self) -> usize {
        1 - self.side
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    fn process_kind(&self) -> ProcessKind {
        self.kind
    }

    async fn handshake(
        &self,
        sink: Arc<dyn ConnectorSink>,
        _options: &BusOptions,
    ) -> Result<HandshakeInfo> {
        self.closed.store(false, Ordering::SeqCst);
        *self.shared.sinks[self.side].write().await = Some(sink);
        Ok(HandshakeInfo {
            process: ProcessInfo::current(self.kind),
        })
    }

    async fn post_command(&self, command: Command, args: Args) -> Result<()> {
        // Clone the sink out of the lock, dispatch after release.
        let peer = self.shared.sinks[self.peer_side()].read().await.clone();
        match peer {
            Some(sink) => sink.on_command(command, args).await,
            None => trace!(channel = %command.channel, "No peer end, command dropped"),
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.shared.sinks[self.side].write().await = None;
        let peer = self.shared.sinks[self.peer_side()].read().await.clone();
        if let Some(sink) = peer {
            sink.on_closed().await;
        }
        Ok(())
    }
}
