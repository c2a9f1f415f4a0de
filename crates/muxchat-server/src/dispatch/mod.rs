//! Command dispatch over one connection.
//!
//! A `Dispatcher` owns the command table, the handlers and the marshaller.
//! It is configured once at startup (`register_commands`,
//! `register_handler`, `set_error_handler` all take `&mut self`) and then
//! shared behind an `Arc`, so the hot path reads the tables without a lock
//! and re-registration during traffic cannot happen.
//!
//! Per-connection state machine:
//!
//! ```text
//! OPEN --frame--> OPEN
//! OPEN --EOF--> CLOSED-CLEAN
//! OPEN --framing/transport/handler error--> CLOSED-ERROR
//! OPEN --panic--> CLOSED-FAULT
//! ```
//!
//! Every terminal state closes the transport exactly once.

mod context;
mod error;

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::BytesMut;
use futures::FutureExt;
use muxchat_protocol::{
    CommandHash, CommandId, CommandTable, Frame, JsonMarshaller, MarshalError, Marshaller,
    HEADER_LEN, UNKNOWN_COMMAND,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

pub use context::{CommandHandler, HandlerContext, Scratch};
pub use error::DispatchError;

use crate::registry::ConnectionRegistry;
use crate::transport::{Connection, Transport, TransportError};

/// Size of one read in `bounded_extract`.
pub const READ_CHUNK: usize = 512;

/// Sink every loop-ending error is funnelled through.
pub type ErrorSink = Arc<dyn Fn(DispatchError) + Send + Sync>;

/// How a connection's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Peer finished the stream.
    Clean,
    /// Framing, transport or handler error, reported to the sink.
    Error,
    /// A panic was caught at the loop boundary, reported to the sink.
    Fault,
}

/// Default sink: escalate. The panic ends the connection's task.
pub fn escalate(err: DispatchError) {
    panic!("unhandled dispatch error: {}", err);
}

pub struct Dispatcher<M: Marshaller = JsonMarshaller> {
    commands: CommandTable,
    handlers: HashMap<CommandId, Arc<dyn CommandHandler<M>>>,
    marshaller: M,
    registry: Arc<ConnectionRegistry>,
    on_error: ErrorSink,
    max_payload: usize,
}

impl Dispatcher<JsonMarshaller> {
    pub fn new(registry: Arc<ConnectionRegistry>, max_payload: usize) -> Self {
        Dispatcher::with_marshaller(registry, max_payload, JsonMarshaller)
    }
}

impl<M: Marshaller> Dispatcher<M> {
    pub fn with_marshaller(
        registry: Arc<ConnectionRegistry>,
        max_payload: usize,
        marshaller: M,
    ) -> Self {
        Dispatcher {
            commands: CommandTable::new(),
            handlers: HashMap::new(),
            marshaller,
            registry,
            on_error: Arc::new(escalate),
            max_payload,
        }
    }

    // ------------------------------------------------------------------
    // Startup configuration
    // ------------------------------------------------------------------

    /// Install the full command set, discarding any previous one.
    pub fn register_commands<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = CommandId>,
    {
        self.commands.install(ids);
        debug!(count = self.commands.len(), "commands registered");
    }

    /// Route frames of `command` to `handler`, replacing any earlier one.
    pub fn register_handler<H>(&mut self, command: CommandId, handler: H)
    where
        H: CommandHandler<M> + 'static,
    {
        if self.commands.hash_of(command).is_none() {
            warn!(command, "handler registered for a command outside the command set");
        }
        self.handlers.insert(command, Arc::new(handler));
    }

    pub fn set_error_handler<F>(&mut self, f: F)
    where
        F: Fn(DispatchError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(f);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn error_sink(&self) -> ErrorSink {
        self.on_error.clone()
    }

    pub fn marshaller(&self) -> &M {
        &self.marshaller
    }

    pub fn format_name(&self) -> &'static str {
        self.marshaller.format_name()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn has_handler(&self, command: CommandId) -> bool {
        self.handlers.contains_key(&command)
    }

    pub fn commands(&self) -> &[CommandId] {
        self.commands.commands()
    }

    /// Hash → command listing of the registered set.
    pub fn list_command_hashes(&self) -> BTreeMap<CommandHash, CommandId> {
        self.commands.entries()
    }

    pub fn hash_of(&self, command: CommandId) -> Option<CommandHash> {
        self.commands.hash_of(command)
    }

    // ------------------------------------------------------------------
    // Online / offline
    // ------------------------------------------------------------------

    pub async fn online(&self, key: impl Into<String>, conn: Connection) -> bool {
        self.registry.add(key, conn).await
    }

    pub async fn offline(&self, key: &str) -> bool {
        self.registry.remove(key).await
    }

    // ------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------

    /// Resolve a header. `UNKNOWN_COMMAND` when it is not registered.
    pub fn resolve_command(&self, header: &[u8]) -> CommandId {
        self.commands.resolve(header)
    }

    /// Command of a frame already validated by `extract_frame`.
    ///
    /// # Panics
    ///
    /// If `frame` is shorter than the header. That can only happen when a
    /// caller skipped validation, which is a bug.
    pub fn command_of(&self, frame: &[u8]) -> CommandId {
        assert!(
            frame.len() >= HEADER_LEN,
            "command_of on a {}-byte buffer; frames must be validated first",
            frame.len()
        );
        self.resolve_command(&frame[..HEADER_LEN])
    }

    /// Decode the bytes after the header into `T`.
    pub fn payload_of<T: DeserializeOwned>(&self, frame: &Frame) -> Result<T, MarshalError> {
        self.marshaller.unmarshal(frame.payload())
    }

    /// Marshal `value` and prefix it with the header of `command`.
    pub fn encode<T>(&self, command: CommandId, value: &T) -> Result<Frame, DispatchError>
    where
        T: Serialize + ?Sized,
    {
        let hash = self
            .commands
            .hash_of(command)
            .unwrap_or_else(|| CommandHash::of(command));
        let payload = self.marshaller.marshal(value)?;
        Ok(Frame::encode(&hash, &payload))
    }

    /// Read one message off `conn` and validate its length.
    ///
    /// `Ok(None)` on a clean end of stream.
    pub async fn extract_frame(&self, conn: &dyn Transport) -> Result<Option<Frame>, DispatchError> {
        let raw = match conn.receive().await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) if e.is_eof() => return Ok(None),
            Err(TransportError::PayloadTooLarge { len, max }) => {
                return Err(DispatchError::SizeLimit { total: len, max })
            }
            Err(e) => return Err(e.into()),
        };
        if raw.len() > self.max_payload {
            return Err(DispatchError::SizeLimit {
                total: raw.len(),
                max: self.max_payload,
            });
        }
        Ok(Some(Frame::parse(raw)?))
    }

    /// One bounded read appended to `acc`, with `total` tracking the bytes
    /// accumulated so far.
    ///
    /// Returns the number of bytes read, `0` at end of stream. Fails with
    /// `SizeLimit` as soon as `total` passes the payload limit, before the
    /// chunk is appended.
    pub async fn bounded_extract(
        &self,
        conn: &dyn Transport,
        acc: &mut BytesMut,
        total: &mut usize,
    ) -> Result<usize, DispatchError> {
        let mut buf = [0u8; READ_CHUNK];
        let n = match conn.read_chunk(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.is_eof() => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(0);
        }

        *total += n;
        if *total > self.max_payload {
            return Err(DispatchError::SizeLimit {
                total: *total,
                max: self.max_payload,
            });
        }
        acc.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Receive one frame and decode it as `T`.
    ///
    /// Unlike the dispatch loop, an unknown command is an error here.
    /// `Ok(None)` on a clean end of stream.
    pub async fn bind<T: DeserializeOwned>(
        &self,
        conn: &dyn Transport,
    ) -> Result<Option<(CommandId, T)>, DispatchError> {
        let Some(frame) = self.extract_frame(conn).await? else {
            return Ok(None);
        };
        let command = self.command_of(frame.as_bytes());
        if command == UNKNOWN_COMMAND {
            return Err(DispatchError::UnknownCommand {
                header: String::from_utf8_lossy(frame.header()).into_owned(),
            });
        }
        Ok(Some((command, self.payload_of(&frame)?)))
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    /// Drive `conn` with the configured error sink.
    pub async fn serve(&self, conn: Connection) -> LoopExit {
        let sink = self.on_error.clone();
        self.run_loop(conn, &*sink).await
    }

    /// Drive `conn` until end of stream, an error, or a fault.
    ///
    /// Errors and caught panics go to `on_error` after the connection has
    /// been closed.
    pub async fn run_loop(
        &self,
        conn: Connection,
        on_error: &(dyn Fn(DispatchError) + Send + Sync),
    ) -> LoopExit {
        let peer = conn.peer();
        let outcome = AssertUnwindSafe(self.drive(&conn)).catch_unwind().await;
        conn.close().await;

        match outcome {
            Ok(Ok(())) => {
                debug!(peer = %peer, "connection finished");
                LoopExit::Clean
            }
            Ok(Err(err)) => {
                warn!(peer = %peer, error = %err, "connection terminated");
                on_error(err);
                LoopExit::Error
            }
            Err(panic) => {
                let msg = panic_message(&*panic);
                error!(peer = %peer, fault = %msg, "recovered from fault in dispatch loop");
                on_error(DispatchError::Fault(msg));
                LoopExit::Fault
            }
        }
    }

    async fn drive(&self, conn: &Connection) -> Result<(), DispatchError> {
        let mut scratch = Scratch::new();

        loop {
            let Some(frame) = self.extract_frame(&**conn).await? else {
                return Ok(());
            };

            let command = self.command_of(frame.as_bytes());
            let handler = match self.handlers.get(&command) {
                Some(h) if command != UNKNOWN_COMMAND => h.clone(),
                _ => {
                    debug!(command, len = frame.len(), "no handler, frame dropped");
                    continue;
                }
            };

            let ctx = HandlerContext {
                command,
                frame: &frame,
                registry: &self.registry,
                connection: conn,
                scratch: &mut scratch,
                dispatcher: self,
            };
            if let Err(err) = handler.handle(ctx).await {
                if caused_by_eof(&err) {
                    return Ok(());
                }
                return Err(DispatchError::Handler {
                    command,
                    source: err.into(),
                });
            }
        }
    }
}

fn caused_by_eof(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<TransportError>(), Some(TransportError::Eof)))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}
