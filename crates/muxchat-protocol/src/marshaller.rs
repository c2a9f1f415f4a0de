//! Pluggable payload serialization.
//!
//! The bytes after the frame header are produced and consumed by a
//! `Marshaller`. JSON is the default; any serde-backed format can be
//! plugged in by implementing the trait and handing it to the dispatcher
//! at construction time.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("{format} encode failed: {source}")]
    Encode {
        format: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("{format} decode failed: {source}")]
    Decode {
        format: &'static str,
        #[source]
        source: BoxError,
    },
}

pub trait Marshaller: Send + Sync + 'static {
    fn marshal<T>(&self, value: &T) -> Result<Vec<u8>, MarshalError>
    where
        T: Serialize + ?Sized;

    fn unmarshal<T>(&self, bytes: &[u8]) -> Result<T, MarshalError>
    where
        T: DeserializeOwned;

    /// Short name of the format, e.g. `"json"`.
    fn format_name(&self) -> &'static str;
}

/// Default marshaller backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn marshal<T>(&self, value: &T) -> Result<Vec<u8>, MarshalError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value).map_err(|e| MarshalError::Encode {
            format: self.format_name(),
            source: Box::new(e),
        })
    }

    fn unmarshal<T>(&self, bytes: &[u8]) -> Result<T, MarshalError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(bytes).map_err(|e| MarshalError::Decode {
            format: self.format_name(),
            source: Box::new(e),
        })
    }

    fn format_name(&self) -> &'static str {
        "json"
    }
}
