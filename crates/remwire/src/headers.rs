//! # Wire Headers
//!
//! Header keys are part of the interop contract and must never change.
//! Custom headers are carried through opaquely.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Marks a request as the cancel message of an earlier invocation.
pub const CANCELLATION_HEADER: &str = "CancellationHeader";

/// Marks a response whose payload is a remote fault.
pub const REMOTE_FAULT_HEADER: &str = "HasRemoteException";

/// Set by a server that knows the partition has moved away from it.
pub const LOCATION_CHANGED_HEADER: &str = "LocationChanged";

/// Request id of the logical call chain.
pub const REQUEST_ID_HEADER: &str = "RequestId";

/// Ordered map of header name to raw bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, Vec<u8>>);

impl Headers {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.insert(key.into(), value.into());
    }

    /// Sets a header whose presence is the whole signal.
    pub fn mark(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), Vec::new());
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Returns the header value as UTF-8, if present and valid.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}
