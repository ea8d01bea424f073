//! # In-process network
//!
//! [`LoopbackNetwork`] connects clients to [`ServiceHost`]s living in the same
//! process by address, and [`StaticResolver`] answers location queries from a
//! table the caller controls. Together they run the full client and server
//! path without sockets.
//!
//! Every request is handled on its own spawned task, so dropping the calling
//! future never aborts work already handed to the host.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;

use crate::host::ServiceHost;
use crate::partition::ChangeNotifier;
use crate::resolver::LocationResolver;
use crate::resolver::PartitionKey;
use crate::resolver::PartitionLocation;
use crate::resolver::ResolveError;
use crate::transport;
use crate::transport::Connector;
use crate::transport::Transport;
use crate::transport::TransportError;

#[derive(Default)]
struct NetworkState {
    hosts: DashMap<String, Arc<ServiceHost>>,
    faults: DashMap<String, VecDeque<TransportError>>,
    connects: AtomicUsize,
}

/// Address book of in-process hosts.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<NetworkState>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `host` reachable at `address`, replacing any previous host there.
    pub fn bind(&self, address: impl Into<String>, host: Arc<ServiceHost>) {
        self.state.hosts.insert(address.into(), host);
    }

    /// Takes the host at `address` offline. New connections are refused and
    /// open ones report the connection lost.
    pub fn unbind(&self, address: &str) -> Option<Arc<ServiceHost>> {
        self.state.hosts.remove(address).map(|(_, host)| host)
    }

    /// Queues a failure for the next send to `address`.
    pub fn inject_fault(&self, address: &str, error: TransportError) {
        self.state.faults.entry(address.to_string()).or_default().push_back(error);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::Relaxed)
    }

    fn host(&self, address: &str) -> transport::Result<Arc<ServiceHost>> {
        self.state
            .hosts
            .get(address)
            .map(|host| host.clone())
            .ok_or_else(|| TransportError::ConnectionLost(format!("{} went away", address)))
    }

    fn take_fault(&self, address: &str) -> Option<TransportError> {
        self.state.faults.get_mut(address)?.pop_front()
    }
}

#[async_trait::async_trait]
impl Connector for LoopbackNetwork {
    async fn connect(&self, address: &str) -> transport::Result<Arc<dyn Transport>> {
        if !self.state.hosts.contains_key(address) {
            return Err(TransportError::ConnectionRefused(address.to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(LoopbackTransport {
            address: address.to_string(),
            network: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackTransport {
    address: String,
    network: LoopbackNetwork,
    closed: AtomicBool,
}

impl LoopbackTransport {
    fn ready(&self) -> transport::Result<Arc<ServiceHost>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if let Some(fault) = self.network.take_fault(&self.address) {
            return Err(fault);
        }
        self.network.host(&self.address)
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn request(&self, frame: &[u8]) -> transport::Result<Vec<u8>> {
        let host = self.ready()?;
        let bytes = frame.to_vec();
        let handled = tokio::spawn(async move { host.handle_frame(&bytes).await });

        match handled.await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(TransportError::Io("host produced no response".into())),
            Ok(Err(e)) => Err(TransportError::Rejected(e.to_string())),
            Err(e) => Err(TransportError::ConnectionLost(e.to_string())),
        }
    }

    async fn send_one_way(&self, frame: &[u8]) -> transport::Result<()> {
        let host = self.ready()?;
        let bytes = frame.to_vec();
        let address = self.address.clone();
        tokio::spawn(async move {
            if let Err(e) = host.handle_frame(&bytes).await {
                tracing::warn!(address = %address, error = %e, "one-way frame rejected");
            }
        });
        Ok(())
    }

    fn abort(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Resolver backed by an in-memory table.
///
/// A lookup for a key without its own entry falls back to the service's
/// singleton entry. A service with no entries at all is reported as not found.
#[derive(Default)]
pub struct StaticResolver {
    locations: DashMap<(String, PartitionKey), PartitionLocation>,
    notifiers: DashMap<String, Vec<ChangeNotifier>>,
    scripted: Mutex<VecDeque<ResolveError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_location(&self, service_uri: &str, key: PartitionKey, location: PartitionLocation) {
        self.locations.insert((service_uri.to_string(), key), location);
    }

    /// Replaces a location and notifies every subscribed client.
    pub fn move_partition(&self, service_uri: &str, key: PartitionKey, location: PartitionLocation) {
        self.set_location(service_uri, key.clone(), location);
        if let Some(mut notifiers) = self.notifiers.get_mut(service_uri) {
            notifiers.retain(|notifier| notifier.notify(service_uri, Some(&key)));
        }
    }

    pub fn remove(&self, service_uri: &str, key: &PartitionKey) -> Option<PartitionLocation> {
        self.locations
            .remove(&(service_uri.to_string(), key.clone()))
            .map(|(_, location)| location)
    }

    /// Makes the next resolution fail with `error`. Calls queue up.
    pub fn fail_next(&self, error: ResolveError) {
        self.scripted.lock().unwrap_or_else(|p| p.into_inner()).push_back(error);
    }

    /// Delays every resolution by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    /// Number of `resolve` calls seen so far.
    pub fn resolve_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, service_uri: &str) -> usize {
        self.notifiers.get(service_uri).map_or(0, |n| n.len())
    }

    fn lookup(&self, service_uri: &str, key: &PartitionKey) -> Result<PartitionLocation, ResolveError> {
        let exact = (service_uri.to_string(), key.clone());
        if let Some(location) = self.locations.get(&exact) {
            return Ok(location.clone());
        }
        let singleton = (service_uri.to_string(), PartitionKey::Singleton);
        if let Some(location) = self.locations.get(&singleton) {
            return Ok(location.clone());
        }
        if self.locations.iter().any(|entry| entry.key().0 == service_uri) {
            return Err(ResolveError::Transient(format!("no partition of {} serves {}", service_uri, key)));
        }
        Err(ResolveError::ServiceNotFound(service_uri.to_string()))
    }
}

#[async_trait::async_trait]
impl LocationResolver for StaticResolver {
    async fn resolve(
        &self,
        service_uri: &str,
        key: &PartitionKey,
        _previous: Option<&PartitionLocation>,
        _timeout: Duration,
    ) -> Result<PartitionLocation, ResolveError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.scripted.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        self.lookup(service_uri, key)
    }

    fn register_for_change_notification(&self, service_uri: &str, notifier: ChangeNotifier) -> Result<(), ResolveError> {
        self.notifiers.entry(service_uri.to_string()).or_default().push(notifier);
        Ok(())
    }
}
