//! muxchat-protocol
//!
//! Wire-level pieces shared by the server and its clients.
//!
//! - [`command`]      : command catalogue and content kinds
//! - [`command_hash`] : 32-byte command headers and the hash → id table
//! - [`frame`]        : `[header][payload]` framing
//! - [`marshaller`]   : pluggable payload serialization (JSON default)
//! - [`models`]       : payload types (`Reply`, `SendOne`, ...)

pub mod command;
pub mod command_hash;
pub mod frame;
pub mod marshaller;
pub mod models;

pub use command::{Category, Command, CommandId, ContentKind, UNKNOWN_COMMAND};
pub use command_hash::{CommandHash, CommandTable, HASH_LEN};
pub use frame::{Frame, FrameError, HEADER_LEN};
pub use marshaller::{JsonMarshaller, MarshalError, Marshaller};
pub use models::{Reply, ReplyKind, SendMany, SendOne};
