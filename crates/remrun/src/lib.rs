//! # Remrun
//!
//! Runtime for calling remoted interfaces across process boundaries.
//!
//! ## Client path
//!
//! [`proxy::ServiceProxy`] packages a call into a request, the
//! [`cancellation::CancellationCoordinator`] races a caller cancel against the
//! response, and [`partition::PartitionClient`] finds the partition, sends the
//! frame and retries through re-resolution. Faults are rebuilt into native
//! errors by [`marshal::ExceptionPipeline`].
//!
//! ## Server path
//!
//! [`host::ServiceHost`] decodes frames, tracks cancellable invocations and
//! hands calls to a [`dispatch::MethodDispatcher`] bound to the implementation.
//! Failures go back through the same pipeline as [`remwire::ServiceException`]s.
//!
//! [`registry::InterfaceRegistry`] gives both sides the same interface and
//! method ids. [`local`] wires clients to hosts inside one process.

pub mod cancellation;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod events;
pub mod exceptions;
pub mod host;
pub mod local;
pub mod marshal;
pub mod partition;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod serializer;
pub mod transport;

pub use config::RemotingConfig;
pub use context::CallContext;
pub use exceptions::BoxError;
pub use registry::InterfaceDefinition;
pub use registry::InterfaceRegistry;
pub use registry::MethodDefinition;
pub use registry::RemotedInterface;
