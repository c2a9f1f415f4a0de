//! muxchat-server
//!
//! Many logical commands over one long-lived connection per client, and a
//! process-wide registry of who is online.

pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use config::Config;
pub use dispatch::{
    CommandHandler, DispatchError, Dispatcher, ErrorSink, HandlerContext, LoopExit, Scratch,
};
pub use registry::{ConnectionRegistry, SendFailure, SendManyError};
pub use supervisor::SupervisorHandle;
pub use transport::{Connection, MemoryTransport, TcpTransport, Transport, TransportError};
