//! # Remwire
//!
//! The wire contract for remoted interface calls.
//!
//! ## Architecture
//!
//! A call is identified on the wire by two stable numbers: the interface id and
//! the method id. Both are computed from names, so client and server agree on
//! them without a handshake. Everything else a transport needs to carry is
//! defined here:
//!
//! - [`RemotingRequest`]: the call, with an optional invocation id that joins a
//!   cancellable call to its later cancel message.
//! - [`RemotingResponse`]: a value, an empty reply, a cancel acknowledgement or
//!   a [`ServiceException`] fault.
//! - [`Frame`]: the envelope a transport moves as opaque bytes.
//!
//! The body of a request or response is opaque to this crate.

pub mod error;
pub mod exception;
pub mod headers;
pub mod ids;
pub mod message;

pub use error::Error;
pub use error::Result;
pub use exception::ServiceException;
pub use headers::Headers;
pub use ids::InterfaceId;
pub use ids::InvocationId;
pub use ids::MethodId;
pub use message::Frame;
pub use message::Payload;
pub use message::RemotingRequest;
pub use message::RemotingResponse;

#[cfg(test)]
mod tests;
