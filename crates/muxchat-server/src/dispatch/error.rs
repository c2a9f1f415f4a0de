//! Errors reported by the dispatch engine.

use muxchat_protocol::{CommandId, FrameError, MarshalError};
use thiserror::Error;

use crate::transport::TransportError;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Everything that can end a connection's dispatch loop.
///
/// A clean end of stream is not represented here; the loop simply
/// returns. Unknown commands are not errors either.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed frame (shorter than the command header).
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// A message or an accumulated read grew past the payload limit.
    #[error("received {total} bytes, more than the {max}-byte limit")]
    SizeLimit { total: usize, max: usize },

    /// Read or write failure other than a clean end of stream.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The payload after the header did not decode.
    #[error("payload error: {0}")]
    Payload(#[from] MarshalError),

    /// The header resolved to no registered command (only raised by
    /// `bind`; the dispatch loop drops such frames silently).
    #[error("unknown command header {header:?}")]
    UnknownCommand { header: String },

    #[error("handler for command {command} failed: {source}")]
    Handler {
        command: CommandId,
        #[source]
        source: BoxError,
    },

    /// A panic caught at the connection boundary.
    #[error("dispatch loop fault: {0}")]
    Fault(String),
}

impl DispatchError {
    pub fn is_framing(&self) -> bool {
        matches!(self, DispatchError::Frame(_) | DispatchError::SizeLimit { .. })
    }
}
