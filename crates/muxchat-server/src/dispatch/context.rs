//! Command handlers and the state they see.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use muxchat_protocol::{CommandId, Frame, MarshalError, Marshaller};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Dispatcher;
use crate::registry::ConnectionRegistry;
use crate::transport::Connection;

/// Trait implemented by every command handler.
///
/// Returning an error ends the connection: it is reported through the
/// dispatcher's error sink and the connection is closed. An error caused
/// by a clean end of stream ends the connection without a report.
#[async_trait]
pub trait CommandHandler<M: Marshaller>: Send + Sync {
    async fn handle(&self, ctx: HandlerContext<'_, M>) -> anyhow::Result<()>;
}

/// Per-connection key/value bag that survives between frames of the same
/// connection, e.g. to assemble a multi-frame upload.
#[derive(Default)]
pub struct Scratch {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key)?.downcast_mut()
    }

    /// Take a value out. A value of another type is left in place.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        let boxed = self.values.remove(key)?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(boxed) => {
                self.values.insert(key.to_string(), boxed);
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a handler gets for one frame.
pub struct HandlerContext<'a, M: Marshaller> {
    pub command: CommandId,
    pub frame: &'a Frame,
    pub registry: &'a Arc<ConnectionRegistry>,
    /// The connection the frame arrived on.
    pub connection: &'a Connection,
    pub scratch: &'a mut Scratch,
    pub(crate) dispatcher: &'a Dispatcher<M>,
}

impl<'a, M: Marshaller> HandlerContext<'a, M> {
    /// Decode the frame's payload with the configured marshaller.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, MarshalError> {
        self.dispatcher.payload_of(self.frame)
    }

    pub fn dispatcher(&self) -> &Dispatcher<M> {
        self.dispatcher
    }

    /// Encode `value` under `command` and send it back on this connection.
    pub async fn reply<T>(&self, command: CommandId, value: &T) -> anyhow::Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let frame = self.dispatcher.encode(command, value)?;
        self.connection.send(frame.as_bytes()).await?;
        Ok(())
    }
}
