//! Call context threaded explicitly through a remote call.
//!
//! The request id is chosen once at the proxy boundary, travels in the
//! `RequestId` header and is rebuilt on the server for the implementation.

use remwire::headers::REQUEST_ID_HEADER;
use remwire::Headers;

/// Per-call context carried from the caller to the implementation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallContext {
    request_id: String,
}

impl CallContext {
    /// Creates a context with a fresh request id.
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Creates a context that continues an existing call chain.
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Writes the context into outgoing headers.
    pub fn inject(&self, headers: &mut Headers) {
        headers.insert(REQUEST_ID_HEADER, self.request_id.as_bytes().to_vec());
    }

    /// Rebuilds the context from incoming headers, starting a new chain if absent.
    pub fn extract(headers: &Headers) -> Self {
        match headers.get_str(REQUEST_ID_HEADER) {
            Some(id) => Self::with_request_id(id),
            None => Self::new(),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}
