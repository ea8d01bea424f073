//! # Native Exceptions
//!
//! Error types that have a well-known identity on the wire. A remote method
//! fails by returning one of these (or any other error); the caller receives
//! the same type back after the fault pipeline reconstructs it.
//!
//! Errors without a well-known identity come back as [`RemoteException`],
//! which keeps the whole envelope.

use remwire::ServiceException;

/// The error type remote methods return and callers receive.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error with a stable wire type name that can be rebuilt from message and cause.
pub trait WireException: std::error::Error + Send + Sync + Sized + 'static {
    /// Type name written into the envelope.
    const TYPE_NAME: &'static str;

    fn message(&self) -> &str;

    fn cause(&self) -> Option<&(dyn std::error::Error + 'static)>;

    fn from_parts(message: String, cause: Option<BoxError>) -> Self;
}

/// Defines an error with a message, an optional cause and a wire type name.
macro_rules! wire_exception {
    ($(#[$meta:meta])* $name:ident => $type_name:literal) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            message: String,
            source: Option<BoxError>,
        }

        impl $name {
            pub fn new(message: impl Into<String>) -> Self {
                Self { message: message.into(), source: None }
            }

            pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
                self.source = Some(source.into());
                self
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.message)
            }
        }

        impl std::error::Error for $name {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
            }
        }

        impl WireException for $name {
            const TYPE_NAME: &'static str = $type_name;

            fn message(&self) -> &str {
                &self.message
            }

            fn cause(&self) -> Option<&(dyn std::error::Error + 'static)> {
                std::error::Error::source(self)
            }

            fn from_parts(message: String, cause: Option<BoxError>) -> Self {
                Self { message, source: cause }
            }
        }
    };
}

wire_exception!(
    /// The operation is not valid for the object's current state.
    InvalidOperationError => "InvalidOperationException"
);

wire_exception!(
    /// The operation was cancelled before it finished.
    OperationCanceled => "OperationCanceledException"
);

wire_exception!(
    /// The operation did not finish within its allotted time.
    TimeoutError => "TimeoutException"
);

wire_exception!(
    /// A lookup key was not present.
    KeyNotFoundError => "KeyNotFoundException"
);

wire_exception!(
    /// The requested operation is not implemented by the service.
    NotImplementedError => "NotImplementedException"
);

/// An argument was invalid.
#[derive(Debug)]
pub struct ArgumentError {
    message: String,
    param_name: Option<String>,
    source: Option<BoxError>,
}

impl ArgumentError {
    pub const TYPE_NAME: &'static str = "ArgumentException";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            param_name: None,
            source: None,
        }
    }

    pub fn with_param(mut self, param_name: impl Into<String>) -> Self {
        self.param_name = Some(param_name.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn param_name(&self) -> Option<&str> {
        self.param_name.as_deref()
    }
}

impl std::fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.param_name {
            Some(param) => write!(f, "{} (parameter '{}')", self.message, param),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ArgumentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Several independent failures reported together.
#[derive(Debug)]
pub struct AggregateError {
    message: String,
    errors: Vec<BoxError>,
}

impl AggregateError {
    pub const TYPE_NAME: &'static str = "AggregateException";

    pub fn new(message: impl Into<String>, errors: Vec<BoxError>) -> Self {
        Self {
            message: message.into(),
            errors,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn errors(&self) -> &[BoxError] {
        &self.errors
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} errors)", self.message, self.errors.len())
    }
}

impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors.first().map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

/// A remote failure no converter recognized.
///
/// Carries the full envelope so nothing about the fault is lost, and exposes
/// the reconstructed inner exceptions as causes.
#[derive(Debug)]
pub struct RemoteException {
    exception: ServiceException,
    inner: Vec<BoxError>,
}

impl RemoteException {
    pub fn new(exception: ServiceException, inner: Vec<BoxError>) -> Self {
        Self { exception, inner }
    }

    pub fn exception(&self) -> &ServiceException {
        &self.exception
    }

    pub fn type_name(&self) -> &str {
        &self.exception.exception_type_name
    }

    pub fn inner(&self) -> &[BoxError] {
        &self.inner
    }
}

impl std::fmt::Display for RemoteException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote {}: {}", self.exception.exception_type_name, self.exception.message)
    }
}

impl std::error::Error for RemoteException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.first().map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

/// Returns true when `err` is, or was caused by, a cancellation.
pub fn is_cancellation(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<OperationCanceled>() {
            return true;
        }
        if let Some(remote) = e.downcast_ref::<RemoteException>() {
            if remote.type_name() == OperationCanceled::TYPE_NAME {
                return true;
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_chain_is_exposed() {
        let err = InvalidOperationError::new("outer").with_source(TimeoutError::new("inner"));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.is::<TimeoutError>());
        assert_eq!(source.to_string(), "inner");
    }

    #[test]
    fn test_argument_display_names_parameter() {
        let err = ArgumentError::new("bad value").with_param("amount");
        assert_eq!(err.to_string(), "bad value (parameter 'amount')");
        assert_eq!(err.message(), "bad value");
    }

    #[test]
    fn test_cancellation_detected_through_causes() {
        let err = InvalidOperationError::new("wrapped").with_source(OperationCanceled::new("stop"));
        assert!(is_cancellation(&err));
        assert!(!is_cancellation(&TimeoutError::new("late")));

        let remote = RemoteException::new(ServiceException::new("OperationCanceledException", "x"), vec![]);
        assert!(is_cancellation(&remote));
    }
}
