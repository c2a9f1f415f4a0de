//! Frame layout.
//!
//! ```text
//! [0..32] : command hash (ASCII upper-case hex, see `command_hash`)
//! [32..]  : serialized payload (format chosen by the `Marshaller`)
//! ```
//!
//! A frame shorter than the header is malformed and is rejected before
//! any payload decoding is attempted.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::command_hash::{CommandHash, HASH_LEN};

/// Width of the command-hash header.
pub const HEADER_LEN: usize = HASH_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes is shorter than the {}-byte command header", HEADER_LEN)]
    TooShort { len: usize },
}

/// One inbound or outbound message with a validated header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Bytes,
}

impl Frame {
    /// Validate raw bytes received from a transport.
    pub fn parse(raw: impl Into<Bytes>) -> Result<Self, FrameError> {
        let raw = raw.into();
        if raw.len() < HEADER_LEN {
            return Err(FrameError::TooShort { len: raw.len() });
        }
        Ok(Frame { raw })
    }

    /// Build an outbound frame from a header and an encoded payload.
    pub fn encode(hash: &CommandHash, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_slice(hash.as_bytes());
        buf.put_slice(payload);
        Frame { raw: buf.freeze() }
    }

    pub fn header(&self) -> &[u8] {
        &self.raw[..HEADER_LEN]
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Cheap handle on the whole frame, for relaying it unchanged.
    pub fn to_bytes(&self) -> Bytes {
        self.raw.clone()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// A frame always carries its header; only the payload can be empty.
    pub fn is_empty(&self) -> bool {
        false
    }
}
