//! # Service Proxy
//!
//! The caller-facing stub for one remoted interface.
//!
//! A proxy turns a method call into a [`RemotingRequest`], runs it through the
//! [`CancellationCoordinator`] and the [`PartitionClient`], and turns the
//! response back into a typed value or a native error.
//!
//! ## Invariants
//!
//! - Interface and method ids come from the registry, never from the caller.
//! - An invocation id is attached only when the method is cancellable.
//! - Return values are looked up by `(interface id, method id)` in a table
//!   built once per proxy from the interface and all of its bases.
//! - Void methods never decode a body.
//! - A fault becomes an error through the exception pipeline; nothing is swallowed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use remwire::Headers;
use remwire::InterfaceId;
use remwire::InvocationId;
use remwire::MethodId;
use remwire::Payload;
use remwire::RemotingRequest;
use remwire::RemotingResponse;

use crate::cancellation::CancellationCoordinator;
use crate::cancellation::Outcome;
use crate::config::RemotingConfig;
use crate::context::CallContext;
use crate::exceptions::is_cancellation;
use crate::exceptions::BoxError;
use crate::marshal::ExceptionPipeline;
use crate::partition;
use crate::partition::PartitionClient;
use crate::partition::PartitionTarget;
use crate::registry;
use crate::registry::InterfaceDescriptor;
use crate::registry::InterfaceRegistry;
use crate::registry::MethodDescriptor;
use crate::registry::RemotedInterface;
use crate::registry::TypeRef;
use crate::serializer;
use crate::serializer::JsonSerializer;
use crate::serializer::Serializer;

/// Errors returned to the caller of a proxy method.
#[derive(Debug)]
pub enum Error {
    /// The remote method failed; holds the rebuilt native error.
    Remote(BoxError),
    /// The caller cancelled and the call did not complete.
    Cancelled,
    Partition(partition::Error),
    Serialization(serializer::Error),
    Registry(registry::Error),
    /// The interface and its bases declare no such method.
    UnknownMethod { interface: String, method: String },
    /// The method's declared return type differs from the one requested.
    ReturnTypeMismatch { method: String, declared: Option<TypeRef>, requested: TypeRef },
    Protocol(String),
}

impl Error {
    /// True for caller cancellation and for remote cancellation faults.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled | Self::Partition(partition::Error::Cancelled) => true,
            Self::Remote(e) => is_cancellation(e.as_ref()),
            _ => false,
        }
    }

    /// The rebuilt remote error, if this is one.
    pub fn remote(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Remote(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "Remote call failed: {}", e),
            Self::Cancelled => write!(f, "Call cancelled"),
            Self::Partition(e) => write!(f, "{}", e),
            Self::Serialization(e) => write!(f, "{}", e),
            Self::Registry(e) => write!(f, "{}", e),
            Self::UnknownMethod { interface, method } => {
                write!(f, "Interface '{}' has no method '{}'", interface, method)
            }
            Self::ReturnTypeMismatch { method, declared, requested } => match declared {
                Some(declared) => write!(
                    f,
                    "Method '{}' returns {}, not {}",
                    method,
                    declared.name(),
                    requested.name()
                ),
                None => write!(f, "Method '{}' returns nothing, not {}", method, requested.name()),
            },
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e.as_ref()),
            Self::Partition(e) => Some(e),
            Self::Serialization(e) => Some(e),
            Self::Registry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<partition::Error> for Error {
    fn from(e: partition::Error) -> Self {
        match e {
            partition::Error::Cancelled => Self::Cancelled,
            other => Self::Partition(other),
        }
    }
}

impl From<serializer::Error> for Error {
    fn from(e: serializer::Error) -> Self {
        Self::Serialization(e)
    }
}

impl From<registry::Error> for Error {
    fn from(e: registry::Error) -> Self {
        Self::Registry(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type MethodKey = (InterfaceId, MethodId);

/// Client stub for one interface at one partition target.
pub struct ServiceProxy<S: Serializer = JsonSerializer> {
    interface: Arc<InterfaceDescriptor>,
    methods: HashMap<MethodKey, MethodDescriptor>,
    by_name: HashMap<String, MethodKey>,
    target: PartitionTarget,
    client: Arc<PartitionClient>,
    pipeline: Arc<ExceptionPipeline>,
    coordinator: CancellationCoordinator,
    serializer: Arc<S>,
    headers: Headers,
}

impl<S: Serializer> ServiceProxy<S> {
    pub fn interface(&self) -> &Arc<InterfaceDescriptor> {
        &self.interface
    }

    pub fn target(&self) -> &PartitionTarget {
        &self.target
    }

    /// Adds a header sent unchanged with every request of this proxy.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Calls `method` and decodes its return value.
    pub async fn invoke<A, R>(&self, ctx: &CallContext, method: &str, args: &A, token: &CancellationToken) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let key = self.key_of(method)?;
        self.invoke_on(ctx, key.0, key.1, args, token).await
    }

    /// Calls a method by ids, which may belong to any interface this proxy inherits.
    pub async fn invoke_on<A, R>(
        &self,
        ctx: &CallContext,
        interface_id: InterfaceId,
        method_id: MethodId,
        args: &A,
        token: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let method = self.method_at(interface_id, method_id)?;
        let requested = TypeRef::of::<R>();
        if method.return_type.as_ref() != Some(&requested) {
            return Err(Error::ReturnTypeMismatch {
                method: method.name.clone(),
                declared: method.return_type.clone(),
                requested,
            });
        }

        let body = self.serializer.serialize(args)?;
        match self.call(ctx, interface_id, method, body, token).await? {
            Some(bytes) => Ok(self.serializer.deserialize(&bytes)?),
            None => Err(Error::Protocol(format!("method '{}' returned no value", method.name))),
        }
    }

    /// Calls `method` and discards any return value without decoding it.
    pub async fn invoke_void<A: Serialize>(
        &self,
        ctx: &CallContext,
        method: &str,
        args: &A,
        token: &CancellationToken,
    ) -> Result<()> {
        let (interface_id, method_id) = self.key_of(method)?;
        let method = self.method_at(interface_id, method_id)?;
        let body = self.serializer.serialize(args)?;
        self.call(ctx, interface_id, method, body, token).await?;
        Ok(())
    }

    /// Sends `method` without waiting for, or ever receiving, a result.
    pub async fn invoke_one_way<A: Serialize>(&self, ctx: &CallContext, method: &str, args: &A) -> Result<()> {
        let (interface_id, method_id) = self.key_of(method)?;
        let body = self.serializer.serialize(args)?;
        let request = self.request(ctx, interface_id, method_id, body);

        let span = tracing::info_span!(
            "remote_call",
            request_id = ctx.request_id(),
            interface_id = %interface_id,
            method_id = %method_id,
            one_way = true
        );
        let token = CancellationToken::new();
        self.client
            .send_one_way(ctx, &self.target, &request, &token)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn call(
        &self,
        ctx: &CallContext,
        interface_id: InterfaceId,
        method: &MethodDescriptor,
        body: Vec<u8>,
        token: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        let mut request = self.request(ctx, interface_id, method.id, body);
        if method.has_cancellation_token {
            request = request.with_invocation_id(InvocationId::new());
        }

        let span = tracing::info_span!(
            "remote_call",
            request_id = ctx.request_id(),
            interface_id = %interface_id,
            method_id = %method.id,
            method = %method.name
        );

        async {
            let primary = self.client.invoke(ctx, &self.target, &request, token);
            let outcome = match request.cancel_message() {
                Some(cancel) => {
                    self.coordinator
                        .run(token, primary, || self.send_cancel(ctx, &cancel))
                        .await?
                }
                None => Outcome::Completed(primary.await?),
            };
            match outcome {
                Outcome::Completed(response) => self.unpack(response, method),
                Outcome::CancelDelivered | Outcome::CancelledBeforeSend | Outcome::Abandoned => Err(Error::Cancelled),
            }
        }
        .instrument(span)
        .await
    }

    /// One cancel delivery; reports whether the server found the invocation.
    async fn send_cancel(&self, ctx: &CallContext, cancel: &RemotingRequest) -> partition::Result<bool> {
        let response = self.client.send_once(ctx, &self.target, cancel).await?;
        Ok(matches!(response.payload, Payload::CancelAck { delivered: true }))
    }

    fn unpack(&self, response: RemotingResponse, method: &MethodDescriptor) -> Result<Option<Vec<u8>>> {
        match response.payload {
            Payload::Fault(exception) => {
                tracing::debug!(type_name = %exception.exception_type_name, "remote fault");
                Err(Error::Remote(self.pipeline.from_service_exception(&exception)))
            }
            Payload::Value(bytes) if method.returns_value() => Ok(Some(bytes)),
            Payload::Value(_) => Ok(None),
            Payload::Empty if method.returns_value() => {
                Err(Error::Protocol(format!("method '{}' returned no value", method.name)))
            }
            Payload::Empty => Ok(None),
            Payload::CancelAck { .. } => Err(Error::Protocol("unexpected cancel acknowledgement".into())),
        }
    }

    fn request(&self, ctx: &CallContext, interface_id: InterfaceId, method_id: MethodId, body: Vec<u8>) -> RemotingRequest {
        let mut request = RemotingRequest::new(interface_id, method_id, body);
        for (key, value) in self.headers.iter() {
            request.headers.insert(key, value.to_vec());
        }
        ctx.inject(&mut request.headers);
        request
    }

    fn key_of(&self, method: &str) -> Result<MethodKey> {
        self.by_name.get(method).copied().ok_or_else(|| Error::UnknownMethod {
            interface: self.interface.full_name.clone(),
            method: method.to_string(),
        })
    }

    fn method_at(&self, interface_id: InterfaceId, method_id: MethodId) -> Result<&MethodDescriptor> {
        self.methods
            .get(&(interface_id, method_id))
            .ok_or_else(|| Error::UnknownMethod {
                interface: self.interface.full_name.clone(),
                method: format!("{}/{}", interface_id, method_id),
            })
    }
}

/// Creates proxies that share one Partition Client, pipeline and serializer.
pub struct ProxyFactory<S: Serializer = JsonSerializer> {
    registry: Arc<InterfaceRegistry>,
    client: Arc<PartitionClient>,
    pipeline: Arc<ExceptionPipeline>,
    coordinator: CancellationCoordinator,
    serializer: Arc<S>,
}

impl ProxyFactory<JsonSerializer> {
    pub fn new(registry: Arc<InterfaceRegistry>, client: Arc<PartitionClient>, config: &RemotingConfig) -> Self {
        Self::with_serializer(registry, client, config, JsonSerializer)
    }
}

impl<S: Serializer> ProxyFactory<S> {
    pub fn with_serializer(
        registry: Arc<InterfaceRegistry>,
        client: Arc<PartitionClient>,
        config: &RemotingConfig,
        serializer: S,
    ) -> Self {
        Self {
            registry,
            client,
            pipeline: Arc::new(ExceptionPipeline::new(config.exceptions.clone())),
            coordinator: CancellationCoordinator::new(config.cancellation.clone()),
            serializer: Arc::new(serializer),
        }
    }

    /// Replaces the client-side exception pipeline.
    pub fn with_pipeline(mut self, pipeline: ExceptionPipeline) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }

    /// Registers `I` if needed and creates a proxy for it.
    pub fn create<I: RemotedInterface + ?Sized>(&self, target: PartitionTarget) -> Result<ServiceProxy<S>> {
        let descriptor = self.registry.register::<I>()?;
        self.create_for(descriptor, target)
    }

    /// Creates a proxy for an already registered interface.
    pub fn create_for(&self, interface: Arc<InterfaceDescriptor>, target: PartitionTarget) -> Result<ServiceProxy<S>> {
        let mut methods = HashMap::new();
        let mut by_name = HashMap::new();
        for descriptor in self.registry.closure(&interface)? {
            for method in &descriptor.methods {
                let key = (descriptor.id, method.id);
                methods.insert(key, method.clone());
                by_name.entry(method.name.clone()).or_insert(key);
            }
        }

        Ok(ServiceProxy {
            interface,
            methods,
            by_name,
            target,
            client: self.client.clone(),
            pipeline: self.pipeline.clone(),
            coordinator: self.coordinator.clone(),
            serializer: self.serializer.clone(),
            headers: Headers::new(),
        })
    }
}
