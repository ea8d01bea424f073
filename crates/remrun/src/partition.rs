//! # Partition Client
//!
//! Resolves where a service partition lives, sends frames there and retries
//! through re-resolution when the location turns out to be wrong.
//!
//! ## Retry policy
//!
//! - Transient transport failures and retryable resolution failures are
//!   retried until `max_retry_attempts` attempts, the first one included, have
//!   failed. Each retry re-resolves with the
//!   previous location as a hint, after an exponential backoff with jitter
//!   capped at `max_retry_delay`.
//! - "Service not found", permanent transport failures and faults returned by
//!   the remote method are never retried.
//! - The caller's token aborts resolution and backoff. A frame already on the
//!   wire is not interrupted; that is the cancellation coordinator's job.
//!
//! ## Cache
//!
//! One entry per `(service uri, partition key)`. With change notifications
//! enabled, a fresh entry is served without contacting the resolver until a
//! notification, a transient failure or a location-changed response marks it
//! stale. Without notifications every call resolves, using the cached entry
//! as the hint.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::DashSet;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use remwire::Frame;
use remwire::RemotingRequest;
use remwire::RemotingResponse;

use crate::config::PartitionClientConfig;
use crate::context::CallContext;
use crate::events::ClientObserver;
use crate::events::NoopObserver;
use crate::resolver::LocationResolver;
use crate::resolver::PartitionKey;
use crate::resolver::PartitionLocation;
use crate::resolver::ResolveError;
use crate::resolver::ResolvedPartitionEndpoint;
use crate::transport::Connector;
use crate::transport::Transport;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    ServiceNotFound(String),
    ListenerNotFound { service_uri: String, listener: String },
    /// Retries ran out while the last attempt was a resolution timeout.
    Timeout,
    RetriesExhausted { attempts: u32, last: String },
    Transport(TransportError),
    Cancelled,
    Protocol(remwire::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceNotFound(uri) => write!(f, "Service not found: {}", uri),
            Self::ListenerNotFound { service_uri, listener } => {
                write!(f, "Service '{}' has no listener '{}'", service_uri, listener)
            }
            Self::Timeout => write!(f, "Partition resolution timed out"),
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "Gave up after {} attempts, last error: {}", attempts, last)
            }
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Cancelled => write!(f, "Invocation cancelled"),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::ServiceNotFound(uri) => Self::ServiceNotFound(uri),
            ResolveError::Timeout => Self::Timeout,
            other => Self::RetriesExhausted {
                attempts: 1,
                last: other.to_string(),
            },
        }
    }
}

impl From<remwire::Error> for Error {
    fn from(e: remwire::Error) -> Self {
        Self::Protocol(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a call is addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTarget {
    pub service_uri: String,
    pub partition_key: PartitionKey,
    pub listener_name: Option<String>,
}

impl PartitionTarget {
    pub fn new(service_uri: impl Into<String>) -> Self {
        Self {
            service_uri: service_uri.into(),
            partition_key: PartitionKey::Singleton,
            listener_name: None,
        }
    }

    pub fn with_key(mut self, key: PartitionKey) -> Self {
        self.partition_key = key;
        self
    }

    pub fn with_listener(mut self, listener: impl Into<String>) -> Self {
        self.listener_name = Some(listener.into());
        self
    }

    fn cache_key(&self) -> CacheKey {
        (self.service_uri.clone(), self.partition_key.clone())
    }
}

type CacheKey = (String, PartitionKey);

struct CacheEntry {
    endpoint: ResolvedPartitionEndpoint,
    stale: bool,
}

/// Resolved locations, shared with change notifiers.
#[derive(Default)]
pub(crate) struct EndpointCache {
    entries: DashMap<CacheKey, CacheEntry>,
    generation: AtomicU64,
}

impl EndpointCache {
    fn fresh(&self, key: &CacheKey) -> Option<ResolvedPartitionEndpoint> {
        let entry = self.entries.get(key)?;
        (!entry.stale).then(|| entry.endpoint.clone())
    }

    fn previous(&self, key: &CacheKey) -> Option<PartitionLocation> {
        self.entries.get(key).map(|entry| entry.endpoint.location.clone())
    }

    fn get(&self, key: &CacheKey) -> Option<ResolvedPartitionEndpoint> {
        self.entries.get(key).map(|entry| entry.endpoint.clone())
    }

    fn store(&self, key: CacheKey, location: PartitionLocation) -> ResolvedPartitionEndpoint {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let endpoint = ResolvedPartitionEndpoint { location, generation };
        self.entries.insert(
            key,
            CacheEntry {
                endpoint: endpoint.clone(),
                stale: false,
            },
        );
        endpoint
    }

    fn mark_stale(&self, key: &CacheKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.stale = true;
        }
    }

    fn mark_service_stale(&self, service_uri: &str, key: Option<&PartitionKey>) {
        for mut entry in self.entries.iter_mut() {
            let (uri, partition) = entry.key();
            if uri == service_uri && key.map_or(true, |k| k == partition) {
                entry.stale = true;
            }
        }
    }
}

/// Handle a resolver uses to push location changes into a client's cache.
///
/// Holds the cache weakly; notifying after the client is gone is a no-op.
#[derive(Clone)]
pub struct ChangeNotifier {
    cache: Weak<EndpointCache>,
}

impl ChangeNotifier {
    /// Marks cached locations of `service_uri` stale, all partitions when
    /// `key` is `None`. Returns `false` once the client has been dropped.
    pub fn notify(&self, service_uri: &str, key: Option<&PartitionKey>) -> bool {
        let Some(cache) = self.cache.upgrade() else { return false };
        cache.mark_service_stale(service_uri, key);
        tracing::debug!(service_uri, "location change notification");
        true
    }

    pub fn is_alive(&self) -> bool {
        self.cache.strong_count() > 0
    }
}

/// Partition-aware sender with retry, re-resolution and caching.
pub struct PartitionClient {
    resolver: Arc<dyn LocationResolver>,
    connector: Arc<dyn Connector>,
    config: PartitionClientConfig,
    cache: Arc<EndpointCache>,
    connections: DashMap<String, Arc<dyn Transport>>,
    subscribed: DashSet<String>,
    observer: Arc<dyn ClientObserver>,
}

impl PartitionClient {
    pub fn new(
        resolver: Arc<dyn LocationResolver>,
        connector: Arc<dyn Connector>,
        config: PartitionClientConfig,
    ) -> Self {
        Self {
            resolver,
            connector,
            config,
            cache: Arc::new(EndpointCache::default()),
            connections: DashMap::new(),
            subscribed: DashSet::new(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ClientObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &PartitionClientConfig {
        &self.config
    }

    /// Sends `request` and waits for its response, retrying as described above.
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        target: &PartitionTarget,
        request: &RemotingRequest,
        token: &CancellationToken,
    ) -> Result<RemotingResponse> {
        let frame = Frame::Request(request.clone()).to_bytes()?;
        match self.exchange(ctx, target, &frame, token, false).await? {
            Some(response) => Ok(response),
            None => Err(Error::Protocol(remwire::Error::ProtocolViolation(
                "request produced no response".into(),
            ))),
        }
    }

    /// Sends a fire-and-forget request. Delivery failures are retried like
    /// [`invoke`](Self::invoke); nothing comes back from the server.
    pub async fn send_one_way(
        &self,
        ctx: &CallContext,
        target: &PartitionTarget,
        request: &RemotingRequest,
        token: &CancellationToken,
    ) -> Result<()> {
        let frame = Frame::OneWay(request.clone()).to_bytes()?;
        self.exchange(ctx, target, &frame, token, true).await?;
        Ok(())
    }

    /// Single attempt without retry, used for cancel messages.
    pub async fn send_once(
        &self,
        ctx: &CallContext,
        target: &PartitionTarget,
        request: &RemotingRequest,
    ) -> Result<RemotingResponse> {
        let frame = Frame::Request(request.clone()).to_bytes()?;
        let endpoint = self.resolve(target, false).await?;
        let address = self.address_of(target, &endpoint)?;
        match self.send(ctx.request_id(), &address, &frame, false).await {
            Ok(Some(bytes)) => Ok(Frame::from_bytes(&bytes)?.into_response()?),
            Ok(None) => Err(Error::Protocol(remwire::Error::ProtocolViolation(
                "request produced no response".into(),
            ))),
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Forces the next call to `target` to resolve afresh.
    pub fn invalidate(&self, target: &PartitionTarget) {
        self.cache.mark_stale(&target.cache_key());
    }

    /// The cached location for `target`, stale or not.
    pub fn cached(&self, target: &PartitionTarget) -> Option<ResolvedPartitionEndpoint> {
        self.cache.get(&target.cache_key())
    }

    /// Handle that marks this client's cache stale; what resolvers receive on subscription.
    pub fn change_notifier(&self) -> ChangeNotifier {
        ChangeNotifier {
            cache: Arc::downgrade(&self.cache),
        }
    }

    async fn exchange(
        &self,
        ctx: &CallContext,
        target: &PartitionTarget,
        frame: &[u8],
        token: &CancellationToken,
        one_way: bool,
    ) -> Result<Option<RemotingResponse>> {
        let request_id = ctx.request_id();
        let key = target.cache_key();
        let mut attempt: u32 = 0;
        let mut force_refresh = false;

        loop {
            let resolved = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                resolved = self.resolve(target, force_refresh) => resolved,
            };

            let failure = match resolved {
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(service_uri = %target.service_uri, error = %e, "resolution failed permanently, not retrying");
                    return Err(e.into());
                }
                Err(e) => Failure::Resolve(e),
                Ok(endpoint) => {
                    let address = self.address_of(target, &endpoint)?;
                    match self.send(request_id, &address, frame, one_way).await {
                        Ok(Some(bytes)) => {
                            let response = Frame::from_bytes(&bytes)?.into_response()?;
                            if response.location_changed() {
                                tracing::debug!(service_uri = %target.service_uri, "server reported location change");
                                self.cache.mark_stale(&key);
                            }
                            return Ok(Some(response));
                        }
                        Ok(None) => return Ok(None),
                        Err(e) if e.is_transient() => {
                            self.drop_connection(&address);
                            self.cache.mark_stale(&key);
                            Failure::Transport(e)
                        }
                        Err(e) => {
                            tracing::warn!(address = %address, error = %e, "permanent transport failure");
                            return Err(Error::Transport(e));
                        }
                    }
                }
            };

            attempt += 1;
            if attempt >= self.config.max_retry_attempts {
                tracing::warn!(service_uri = %target.service_uri, attempts = attempt, error = %failure, "retries exhausted");
                return Err(match failure {
                    Failure::Resolve(ResolveError::Timeout) => Error::Timeout,
                    other => Error::RetriesExhausted {
                        attempts: attempt,
                        last: other.to_string(),
                    },
                });
            }

            let delay = self.backoff_delay(attempt);
            tracing::debug!(service_uri = %target.service_uri, attempt, ?delay, error = %failure, "retrying");
            self.observer.on_retry(request_id, attempt, delay);
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            force_refresh = true;
        }
    }

    async fn send(
        &self,
        request_id: &str,
        address: &str,
        frame: &[u8],
        one_way: bool,
    ) -> std::result::Result<Option<Vec<u8>>, TransportError> {
        let transport = match self.connection(address).await {
            Ok(transport) => transport,
            Err(e) => {
                self.observer.on_failure(request_id, &e);
                return Err(e);
            }
        };

        self.observer.on_send(request_id, address);
        let result = if one_way {
            transport.send_one_way(frame).await.map(|()| None)
        } else {
            transport.request(frame).await.map(Some)
        };

        match &result {
            Ok(_) => self.observer.on_receive(request_id, address),
            Err(e) => self.observer.on_failure(request_id, e),
        }
        result
    }

    async fn resolve(
        &self,
        target: &PartitionTarget,
        force_refresh: bool,
    ) -> std::result::Result<ResolvedPartitionEndpoint, ResolveError> {
        let key = target.cache_key();
        let notifications = self.config.use_change_notifications;

        if notifications && !force_refresh {
            if let Some(endpoint) = self.cache.fresh(&key) {
                return Ok(endpoint);
            }
        }
        if notifications {
            self.subscribe(&target.service_uri);
        }

        let previous = self.cache.previous(&key);
        let timeout = self.config.resolve_timeout_per_try;
        let resolution = self
            .resolver
            .resolve(&target.service_uri, &target.partition_key, previous.as_ref(), timeout);
        let location = match tokio::time::timeout(timeout, resolution).await {
            Ok(result) => result?,
            Err(_) => return Err(ResolveError::Timeout),
        };

        let endpoint = self.cache.store(key, location);
        tracing::debug!(
            service_uri = %target.service_uri,
            partition = %endpoint.location.partition_id,
            generation = endpoint.generation,
            "resolved partition"
        );
        self.observer.on_resolve(&target.service_uri, &endpoint);
        Ok(endpoint)
    }

    /// Registers for change notifications once per service URI.
    fn subscribe(&self, service_uri: &str) {
        if !self.subscribed.insert(service_uri.to_string()) {
            return;
        }
        if let Err(e) = self
            .resolver
            .register_for_change_notification(service_uri, self.change_notifier())
        {
            tracing::warn!(service_uri, error = %e, "change notification registration failed");
            self.subscribed.remove(service_uri);
        }
    }

    fn address_of(&self, target: &PartitionTarget, endpoint: &ResolvedPartitionEndpoint) -> Result<String> {
        let listener = target.listener_name.as_deref();
        endpoint
            .location
            .endpoint(listener)
            .map(str::to_string)
            .ok_or_else(|| Error::ListenerNotFound {
                service_uri: target.service_uri.clone(),
                listener: listener.unwrap_or_default().to_string(),
            })
    }

    async fn connection(&self, address: &str) -> std::result::Result<Arc<dyn Transport>, TransportError> {
        if let Some(existing) = self.connections.get(address) {
            return Ok(existing.clone());
        }
        let transport = self.connector.connect(address).await?;
        let cached = self
            .connections
            .entry(address.to_string())
            .or_insert(transport)
            .clone();
        Ok(cached)
    }

    fn drop_connection(&self, address: &str) {
        if let Some((_, transport)) = self.connections.remove(address) {
            tracing::debug!(address = transport.address(), "dropping connection");
            transport.abort();
        }
    }

    /// Delay before retry number `attempt`: `initial * 2^(attempt-1)` plus up to
    /// `initial` of jitter, capped at `max_retry_delay`. Never decreases with `attempt`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_retry_delay;
        let exponent = attempt.saturating_sub(1).min(20);
        let base = initial.saturating_mul(1u32 << exponent);
        let jitter_ns = rand::thread_rng().gen_range(0..=initial.as_nanos() as u64);
        let delay = base.saturating_add(Duration::from_nanos(jitter_ns));
        std::cmp::min(delay, self.config.max_retry_delay)
    }
}

enum Failure {
    Resolve(ResolveError),
    Transport(TransportError),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve(e) => write!(f, "{}", e),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}
