//! Error taxonomy.
//!
//! Local/programmer errors surface as `Err` from the called operation;
//! network-delivered failures (rejection, timeout, malformed response)
//! settle the pending request future with the variants below, carrying the
//! delivering event so callers can see who answered.

use crate::transport::BusEvent;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The request deadline elapsed before any response arrived.
    #[error("timeout")]
    Timeout { event: BusEvent },

    /// The responder rejected the request.
    #[error("{reason}")]
    Rejected { event: BusEvent, reason: String },

    /// A response carried neither a resolution nor a rejection.
    #[error("unknown format")]
    UnknownFormat { event: BusEvent },

    /// The operation needs a connected transport.
    #[error("not connected")]
    NotConnected,

    /// Establishing the link failed.
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Frame or command encode/decode failure.
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// Rejected configuration (mutually exclusive or missing options).
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The side or connector cannot perform this operation at all.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl BusError {
    /// Delivering event of a failed request, when the failure has one.
    pub fn event(&self) -> Option<&BusEvent> {
        match self {
            BusError::Timeout { event }
            | BusError::Rejected { event, .. }
            | BusError::UnknownFormat { event } => Some(event),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, BusError::Rejected { .. })
    }
}
