//! Observer hooks around Partition Client activity.
//!
//! Injected into the client at construction. Every hook has an empty default,
//! so an observer implements only what it needs.

use std::time::Duration;

use crate::resolver::ResolvedPartitionEndpoint;
use crate::transport::TransportError;

pub trait ClientObserver: Send + Sync + 'static {
    fn on_resolve(&self, _service_uri: &str, _endpoint: &ResolvedPartitionEndpoint) {}

    fn on_send(&self, _request_id: &str, _address: &str) {}

    fn on_receive(&self, _request_id: &str, _address: &str) {}

    fn on_failure(&self, _request_id: &str, _error: &TransportError) {}

    /// Called before sleeping `delay` ahead of retry number `attempt` (starting at 1).
    fn on_retry(&self, _request_id: &str, _attempt: u32, _delay: Duration) {}
}

/// Observer that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ClientObserver for NoopObserver {}
