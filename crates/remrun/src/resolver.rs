//! # Location Resolution
//!
//! Types shared between the Partition Client and the external service that
//! knows where each partition currently lives.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::partition::ChangeNotifier;

/// Selects one partition of a service.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PartitionKey {
    Singleton,
    Int64(i64),
    Named(String),
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Singleton => write!(f, "singleton"),
            Self::Int64(n) => write!(f, "int64:{}", n),
            Self::Named(name) => write!(f, "named:{}", name),
        }
    }
}

/// Where a partition is served, as reported by the resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionLocation {
    pub service_uri: String,
    pub partition_id: String,
    /// Listener name to address. The unnamed listener is `""`.
    pub endpoints: BTreeMap<String, String>,
}

impl PartitionLocation {
    pub fn new(service_uri: impl Into<String>, partition_id: impl Into<String>) -> Self {
        Self {
            service_uri: service_uri.into(),
            partition_id: partition_id.into(),
            endpoints: BTreeMap::new(),
        }
    }

    pub fn with_endpoint(mut self, listener: impl Into<String>, address: impl Into<String>) -> Self {
        self.endpoints.insert(listener.into(), address.into());
        self
    }

    /// Address of `listener`. Without a name, the unnamed listener is used,
    /// or the only listener if there is exactly one.
    pub fn endpoint(&self, listener: Option<&str>) -> Option<&str> {
        match listener {
            Some(name) => self.endpoints.get(name).map(String::as_str),
            None => match self.endpoints.get("") {
                Some(address) => Some(address.as_str()),
                None if self.endpoints.len() == 1 => self.endpoints.values().next().map(String::as_str),
                None => None,
            },
        }
    }
}

/// A location as held by the Partition Client cache.
///
/// `generation` grows with every fresh resolution made by the same client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPartitionEndpoint {
    pub location: PartitionLocation,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The service does not exist. Never retried.
    ServiceNotFound(String),
    /// The location service could not answer right now.
    Transient(String),
    /// A single resolution attempt ran out of time.
    Timeout,
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ServiceNotFound(_))
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceNotFound(uri) => write!(f, "Service not found: {}", uri),
            Self::Transient(msg) => write!(f, "Transient resolution failure: {}", msg),
            Self::Timeout => write!(f, "Resolution timed out"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// The external location service.
#[async_trait::async_trait]
pub trait LocationResolver: Send + Sync + 'static {
    /// Resolves the partition serving `key`.
    ///
    /// `previous` is the location the caller last used; a resolver should
    /// return something fresher when it knows that location changed.
    async fn resolve(
        &self,
        service_uri: &str,
        key: &PartitionKey,
        previous: Option<&PartitionLocation>,
        timeout: Duration,
    ) -> Result<PartitionLocation, ResolveError>;

    /// Subscribes `notifier` to location changes of `service_uri`.
    fn register_for_change_notification(
        &self,
        _service_uri: &str,
        _notifier: ChangeNotifier,
    ) -> Result<(), ResolveError> {
        Ok(())
    }
}
