//! # Method Dispatcher
//!
//! Server-side routing from a method id to the implementation.
//!
//! A [`MethodDispatcher`] is bound to exactly one [`InterfaceDescriptor`] and
//! holds a table of `method id -> thunk`. Each thunk captures the typed
//! implementation together with the serializer, so a call costs one map
//! lookup plus body (de)serialization.
//!
//! ## Rules
//!
//! - An unknown method id is a local error ([`Error::MissingMethod`]), raised
//!   before any implementation runs. It signals version skew and is never
//!   turned into a wire fault.
//! - Building fails unless every declared method has exactly one implementation.
//! - The dispatcher keeps no per-call state, so concurrent dispatch is safe.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use remwire::InterfaceId;
use remwire::MethodId;

use crate::context::CallContext;
use crate::exceptions::ArgumentError;
use crate::exceptions::BoxError;
use crate::registry::InterfaceDescriptor;
use crate::serializer::JsonSerializer;
use crate::serializer::Serializer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No implementation is registered for this method id.
    MissingMethod { interface: InterfaceId, method: MethodId },
    /// An implementation names a method the interface does not declare.
    UnknownMethod { interface: String, name: String },
    /// Two implementations were given for the same method.
    DuplicateImplementation { interface: String, name: String },
    /// Declared methods left without an implementation.
    Unimplemented { interface: String, methods: Vec<String> },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMethod { interface, method } => {
                write!(f, "No method {} on {}", method, interface)
            }
            Self::UnknownMethod { interface, name } => {
                write!(f, "Interface '{}' declares no method '{}'", interface, name)
            }
            Self::DuplicateImplementation { interface, name } => {
                write!(f, "Method '{}' of '{}' implemented twice", name, interface)
            }
            Self::Unimplemented { interface, methods } => {
                write!(f, "Interface '{}' is missing implementations for: {}", interface, methods.join(", "))
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Output of a dispatched call: the serialized return value, `None` for void
/// methods, or the native error the implementation failed with.
pub type MethodFuture = BoxFuture<'static, std::result::Result<Option<Vec<u8>>, BoxError>>;

type Thunk<T> = Arc<dyn Fn(Arc<T>, &[u8], Call) -> MethodFuture + Send + Sync>;

/// Per-call inputs handed to an implementation besides its arguments.
#[derive(Clone, Debug, Default)]
pub struct Call {
    pub context: CallContext,
    /// Triggered when the caller's cancel message reaches this invocation.
    /// Never triggered for methods that are not cancellable.
    pub token: CancellationToken,
}

impl Call {
    pub fn new(context: CallContext, token: CancellationToken) -> Self {
        Self { context, token }
    }

    pub fn request_id(&self) -> &str {
        self.context.request_id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Routes method ids of one interface to implementations on `T`.
pub struct MethodDispatcher<T: ?Sized> {
    descriptor: Arc<InterfaceDescriptor>,
    thunks: HashMap<MethodId, Thunk<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> MethodDispatcher<T> {
    /// Starts a dispatcher for `descriptor` with JSON bodies.
    pub fn builder(descriptor: Arc<InterfaceDescriptor>) -> DispatcherBuilder<T, JsonSerializer> {
        DispatcherBuilder::new(descriptor, JsonSerializer)
    }

    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.descriptor
    }

    /// Invokes `method_id` on `target`.
    ///
    /// Fails synchronously with [`Error::MissingMethod`] if the id is unknown;
    /// otherwise the returned future runs the implementation.
    pub fn dispatch(&self, target: Arc<T>, method_id: MethodId, body: &[u8], call: Call) -> Result<MethodFuture> {
        let Some(thunk) = self.thunks.get(&method_id) else {
            tracing::error!(interface = %self.descriptor.id, method = %method_id, "dispatch to unknown method");
            return Err(Error::MissingMethod {
                interface: self.descriptor.id,
                method: method_id,
            });
        };
        tracing::debug!(interface = %self.descriptor.full_name, method = %method_id, request_id = call.request_id(), "dispatching");
        Ok(thunk(target, body, call))
    }

    /// Fire-and-forget invocation. The call runs on its own task; a failure
    /// is logged here and never reported to the caller.
    pub fn dispatch_one_way(&self, target: Arc<T>, method_id: MethodId, body: &[u8], call: Call) -> Result<()> {
        let interface = self.descriptor.full_name.clone();
        let request_id = call.request_id().to_string();
        let future = self.dispatch(target, method_id, body, call)?;
        tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::warn!(interface = %interface, method = %method_id, request_id = %request_id, error = %e, "one-way call failed");
            }
        });
        Ok(())
    }

    /// Pairs this dispatcher with the object it routes to.
    pub fn bind(self, target: Arc<T>) -> BoundDispatcher<T> {
        BoundDispatcher {
            dispatcher: Arc::new(self),
            target,
        }
    }
}

/// Builds a [`MethodDispatcher`], checking the implementation set against the descriptor.
pub struct DispatcherBuilder<T: ?Sized, S> {
    descriptor: Arc<InterfaceDescriptor>,
    serializer: Arc<S>,
    thunks: HashMap<MethodId, Thunk<T>>,
    error: Option<Error>,
}

impl<T: ?Sized + Send + Sync + 'static, S: Serializer> DispatcherBuilder<T, S> {
    pub fn new(descriptor: Arc<InterfaceDescriptor>, serializer: S) -> Self {
        Self {
            descriptor,
            serializer: Arc::new(serializer),
            thunks: HashMap::new(),
            error: None,
        }
    }

    /// Implements the method called `name`.
    ///
    /// `A` is the argument type (a tuple for several parameters, `()` for
    /// none). For void methods the returned value is discarded.
    pub fn method<A, R, F, Fut>(mut self, name: &str, implementation: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, A, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        let Some(method) = self.descriptor.method_by_name(name) else {
            self.error = Some(Error::UnknownMethod {
                interface: self.descriptor.full_name.clone(),
                name: name.to_string(),
            });
            return self;
        };
        if self.thunks.contains_key(&method.id) {
            self.error = Some(Error::DuplicateImplementation {
                interface: self.descriptor.full_name.clone(),
                name: name.to_string(),
            });
            return self;
        }

        let id = method.id;
        let returns_value = method.returns_value();
        let serializer = self.serializer.clone();

        let thunk: Thunk<T> = Arc::new(move |target: Arc<T>, body: &[u8], call: Call| -> MethodFuture {
            let args: A = match serializer.deserialize(body) {
                Ok(args) => args,
                Err(e) => {
                    let err: BoxError = Box::new(ArgumentError::new("request body could not be decoded").with_source(e));
                    return futures::future::ready(Err(err)).boxed();
                }
            };
            let serializer = serializer.clone();
            let running = implementation(target, args, call);
            async move {
                let value = running.await?;
                if !returns_value {
                    return Ok(None);
                }
                let bytes = serializer.serialize(&value)?;
                Ok::<_, BoxError>(Some(bytes))
            }
            .boxed()
        });

        self.thunks.insert(id, thunk);
        self
    }

    pub fn build(self) -> Result<MethodDispatcher<T>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let missing: Vec<String> = self
            .descriptor
            .methods
            .iter()
            .filter(|m| !self.thunks.contains_key(&m.id))
            .map(|m| m.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Unimplemented {
                interface: self.descriptor.full_name.clone(),
                methods: missing,
            });
        }
        Ok(MethodDispatcher {
            descriptor: self.descriptor,
            thunks: self.thunks,
        })
    }
}

/// Object-safe view of a dispatcher already bound to its target.
pub trait ServiceDispatch: Send + Sync + 'static {
    fn descriptor(&self) -> &Arc<InterfaceDescriptor>;
    fn dispatch(&self, method_id: MethodId, body: &[u8], call: Call) -> Result<MethodFuture>;
    fn dispatch_one_way(&self, method_id: MethodId, body: &[u8], call: Call) -> Result<()>;
}

/// A dispatcher plus its target object.
pub struct BoundDispatcher<T: ?Sized> {
    dispatcher: Arc<MethodDispatcher<T>>,
    target: Arc<T>,
}

impl<T: ?Sized> Clone for BoundDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            target: self.target.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> ServiceDispatch for BoundDispatcher<T> {
    fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        self.dispatcher.descriptor()
    }

    fn dispatch(&self, method_id: MethodId, body: &[u8], call: Call) -> Result<MethodFuture> {
        self.dispatcher.dispatch(self.target.clone(), method_id, body, call)
    }

    fn dispatch_one_way(&self, method_id: MethodId, body: &[u8], call: Call) -> Result<()> {
        self.dispatcher.dispatch_one_way(self.target.clone(), method_id, body, call)
    }
}
