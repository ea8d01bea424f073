//! # Body Serialization
//!
//! Request and response bodies are opaque bytes to the protocol. A
//! [`Serializer`] turns typed arguments and return values into those bytes.
//! The default is JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors raised while converting bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Serialize(String),
    Deserialize(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialize(msg) => write!(f, "Body serialization failed: {}", msg),
            Self::Deserialize(msg) => write!(f, "Body deserialization failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Converts typed bodies to bytes and back.
///
/// Client and server must use compatible serializers for the same interface.
pub trait Serializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// `serde_json` bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serialize(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialize(e.to_string()))
    }
}
