//! Transport abstraction.
//!
//! A `Transport` is one client's bidirectional message channel. It is
//! shared between the registry (which sends through it) and the
//! connection's dispatch loop (which receives from it), so every method
//! takes `&self` and implementations lock their read and write sides
//! independently.

pub mod memory;
pub mod tcp;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

/// Shared handle on a live connection.
pub type Connection = Arc<dyn Transport>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away cleanly.
    #[error("end of stream")]
    Eof,

    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,

    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("no data received within {0:?}")]
    DeadlineExceeded(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Clean end of stream, which callers treat as "not an error".
    pub fn is_eof(&self) -> bool {
        matches!(self, TransportError::Eof)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Receive one whole message unit.
    ///
    /// Returns `Ok(None)` when the peer finished the stream cleanly.
    async fn receive(&self) -> Result<Option<Bytes>, TransportError>;

    /// Read whatever is available into `buf`. `Ok(0)` means end of stream.
    async fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Send one whole message unit.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Close both directions. Idempotent; a receive blocked on another
    /// task fails with `TransportError::Closed`.
    async fn close(&self);

    /// Printable peer identity, for logs.
    fn peer(&self) -> String;
}
