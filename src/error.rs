use std::sync::Arc;
use std::time::Duration;

use crate::state::ConnectionState;

/// Failures that change what a caller can legitimately do next. They are always surfaced through
///  the operation's result; protocol violations by the peer are not, they are logged and the
///  offending packet is dropped.
///
/// [TransportError::Timeout] is deliberately distinct from [TransportError::WriteFailed]: a
///  timed out request may well have been processed by the peer, a failed write was not.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// the connection is not in a traffic-accepting state
    #[error("connection is not accepting traffic in state {0:?}")]
    InvalidState(ConnectionState),
    #[error("connection is being re-established")]
    Reconnecting,
    /// the connection was closed while the operation was pending
    #[error("connection was closed")]
    ConnectionClosed,
    #[error("write failed: {0}")]
    WriteFailed(Arc<std::io::Error>),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("stream {0} is not open")]
    StreamNotOpen(i32),
}

impl TransportError {
    pub fn write_failed(e: std::io::Error) -> TransportError {
        TransportError::WriteFailed(Arc::new(e))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    /// true for all variants signalling that the connection can not be used (any more)
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::InvalidState(_) | TransportError::Reconnecting | TransportError::ConnectionClosed)
    }
}
