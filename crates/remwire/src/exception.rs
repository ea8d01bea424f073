//! # Fault Envelope
//!
//! `ServiceException` is the language-neutral shape of a failure that crossed
//! a process boundary. It names the original type, keeps the message and
//! trace, and nests the causes that produced it.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Serializable description of a remote failure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceException {
    pub exception_type_name: String,
    pub message: String,
    pub stack_trace: String,
    pub data: BTreeMap<String, String>,
    pub inner_exceptions: Vec<ServiceException>,
}

impl ServiceException {
    pub fn new(exception_type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type_name: exception_type_name.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_inner(mut self, inner: ServiceException) -> Self {
        self.inner_exceptions.push(inner);
        self
    }

    /// Nesting depth: zero for a leaf, otherwise one more than the deepest inner.
    pub fn depth(&self) -> usize {
        self.inner_exceptions
            .iter()
            .map(|inner| inner.depth() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Total number of envelopes in this tree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.inner_exceptions.iter().map(ServiceException::count).sum::<usize>()
    }
}

impl std::fmt::Display for ServiceException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.exception_type_name, self.message)
    }
}
