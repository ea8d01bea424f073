//! # Fault Marshaling Pipeline
//!
//! Converts native errors into [`ServiceException`] envelopes on the server
//! and back into native errors on the client.
//!
//! Both directions run an ordered chain of [`ExceptionConverter`]s; the first
//! converter that accepts wins. Custom converters run before the built-in
//! ones, so they can take over any type name.
//!
//! ## Invariants
//!
//! - **Nothing is dropped**: an error no converter recognizes is wrapped by a
//!   generic fallback on the server and surfaced as [`RemoteException`] on the
//!   client.
//! - **Bounded**: nesting is cut at `max_depth` and fan-out at `max_breadth`
//!   in both directions. Cut inner exceptions are counted in the envelope data
//!   under [`TRUNCATED_KEY`], never turned into a failure.
//! - **Converter faults are contained**: a converter that errors or panics is
//!   logged and treated as a declination.

use std::error::Error as StdError;
use std::marker::PhantomData;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use remwire::ServiceException;

use crate::config::ExceptionConfig;
use crate::exceptions::AggregateError;
use crate::exceptions::ArgumentError;
use crate::exceptions::BoxError;
use crate::exceptions::InvalidOperationError;
use crate::exceptions::KeyNotFoundError;
use crate::exceptions::NotImplementedError;
use crate::exceptions::OperationCanceled;
use crate::exceptions::RemoteException;
use crate::exceptions::TimeoutError;
use crate::exceptions::WireException;

/// Envelope data key holding the HRESULT-style error code.
pub const HRESULT_KEY: &str = "HResult";

/// Envelope data key counting inner exceptions cut by the bounds.
pub const TRUNCATED_KEY: &str = "InnerExceptionsTruncated";

/// Envelope data key holding an argument error's parameter name.
pub const PARAM_NAME_KEY: &str = "ParamName";

/// Code used when an error has no more specific one (COR_E_EXCEPTION).
pub const GENERIC_HRESULT: i32 = -2146233088;

/// Type name used when an error's own name cannot be determined.
pub const GENERIC_TYPE_NAME: &str = "Exception";

/// Result of a successful server-side conversion.
///
/// `exception.inner_exceptions` is ignored; the pipeline fills it by
/// converting `inner` recursively under its bounds.
pub struct Conversion<'a> {
    pub exception: ServiceException,
    pub inner: Vec<&'a (dyn StdError + 'static)>,
}

impl<'a> Conversion<'a> {
    pub fn new(exception: ServiceException) -> Self {
        Self { exception, inner: Vec::new() }
    }

    pub fn with_inner(mut self, inner: Option<&'a (dyn StdError + 'static)>) -> Self {
        self.inner.extend(inner);
        self
    }
}

/// One link of the converter chain.
///
/// Both directions decline by default, so a converter may implement only one
/// side; client and server can run different converter sets.
pub trait ExceptionConverter: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Server side: describe `err`, or decline with `Ok(None)`.
    fn to_service_exception<'a>(
        &self,
        _err: &'a (dyn StdError + 'static),
    ) -> Result<Option<Conversion<'a>>, BoxError> {
        Ok(None)
    }

    /// Client side: whether this converter rebuilds envelopes of `type_name`.
    fn accepts(&self, _type_name: &str) -> bool {
        false
    }

    /// Client side: rebuild the native error. `inner` holds the already rebuilt
    /// inner exceptions, in envelope order.
    fn from_service_exception(
        &self,
        exception: &ServiceException,
        _inner: Vec<BoxError>,
    ) -> Result<BoxError, BoxError> {
        Err(format!("converter '{}' cannot rebuild '{}'", self.name(), exception.exception_type_name).into())
    }
}

/// Ordered converter chain with depth and breadth bounds.
pub struct ExceptionPipeline {
    custom: Vec<Arc<dyn ExceptionConverter>>,
    builtin: Vec<Arc<dyn ExceptionConverter>>,
    config: ExceptionConfig,
}

impl ExceptionPipeline {
    /// Pipeline with the built-in converters.
    pub fn new(config: ExceptionConfig) -> Self {
        Self {
            custom: Vec::new(),
            builtin: builtin_converters(),
            config,
        }
    }

    /// Pipeline with no converters at all; only the generic fallback applies.
    pub fn bare(config: ExceptionConfig) -> Self {
        Self {
            custom: Vec::new(),
            builtin: Vec::new(),
            config,
        }
    }

    /// Adds a converter that runs after earlier custom ones and before the built-ins.
    pub fn with_converter(mut self, converter: impl ExceptionConverter) -> Self {
        self.custom.push(Arc::new(converter));
        self
    }

    pub fn config(&self) -> &ExceptionConfig {
        &self.config
    }

    fn converters(&self) -> impl Iterator<Item = &Arc<dyn ExceptionConverter>> {
        self.custom.iter().chain(self.builtin.iter())
    }

    /// Server side: describe `err` as an envelope.
    pub fn to_service_exception(&self, err: &(dyn StdError + 'static)) -> ServiceException {
        self.convert(err, 0)
    }

    fn convert(&self, err: &(dyn StdError + 'static), depth: usize) -> ServiceException {
        let Conversion { mut exception, inner } = self.first_conversion(err);
        exception.inner_exceptions.clear();

        if inner.is_empty() {
            return exception;
        }
        if depth >= self.config.max_depth {
            exception.data.insert(TRUNCATED_KEY.into(), inner.len().to_string());
            return exception;
        }

        let kept = inner.len().min(self.config.max_breadth);
        for child in inner.iter().take(kept) {
            let converted = self.convert(*child, depth + 1);
            exception.inner_exceptions.push(converted);
        }
        if kept < inner.len() {
            exception.data.insert(TRUNCATED_KEY.into(), (inner.len() - kept).to_string());
        }
        exception
    }

    fn first_conversion<'a>(&self, err: &'a (dyn StdError + 'static)) -> Conversion<'a> {
        for converter in self.converters() {
            let attempt = catch_unwind(AssertUnwindSafe(|| converter.to_service_exception(err)));
            match attempt {
                Ok(Ok(Some(conversion))) => return conversion,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(converter = converter.name(), error = %e, "exception converter failed, declining");
                }
                Err(_) => {
                    tracing::warn!(converter = converter.name(), "exception converter panicked, declining");
                }
            }
        }
        generic_conversion(err)
    }

    /// Client side: rebuild the native error described by `exception`.
    pub fn from_service_exception(&self, exception: &ServiceException) -> BoxError {
        self.revive(exception, 0)
    }

    fn revive(&self, exception: &ServiceException, depth: usize) -> BoxError {
        let type_name = exception.exception_type_name.as_str();

        for converter in self.converters() {
            let accepted = catch_unwind(AssertUnwindSafe(|| converter.accepts(type_name))).unwrap_or(false);
            if !accepted {
                continue;
            }
            let inner = self.revive_inner(exception, depth);
            let attempt = catch_unwind(AssertUnwindSafe(|| converter.from_service_exception(exception, inner)));
            match attempt {
                Ok(Ok(err)) => return err,
                Ok(Err(e)) => {
                    tracing::warn!(converter = converter.name(), type_name, error = %e, "exception converter failed, declining");
                }
                Err(_) => {
                    tracing::warn!(converter = converter.name(), type_name, "exception converter panicked, declining");
                }
            }
        }

        tracing::debug!(type_name, "no converter accepted remote exception, surfacing envelope");
        let inner = self.revive_inner(exception, depth);
        Box::new(RemoteException::new(exception.clone(), inner))
    }

    /// Rebuilds inner exceptions depth first, under the same bounds as the server.
    fn revive_inner(&self, exception: &ServiceException, depth: usize) -> Vec<BoxError> {
        if depth >= self.config.max_depth {
            return Vec::new();
        }
        exception
            .inner_exceptions
            .iter()
            .take(self.config.max_breadth)
            .map(|inner| self.revive(inner, depth + 1))
            .collect()
    }
}

impl Default for ExceptionPipeline {
    fn default() -> Self {
        Self::new(ExceptionConfig::default())
    }
}

fn builtin_converters() -> Vec<Arc<dyn ExceptionConverter>> {
    vec![
        Arc::new(RemoteExceptionConverter),
        Arc::new(ArgumentConverter),
        Arc::new(AggregateConverter),
        Arc::new(WireConverter::<InvalidOperationError>::new()),
        Arc::new(WireConverter::<OperationCanceled>::new()),
        Arc::new(WireConverter::<TimeoutError>::new()),
        Arc::new(WireConverter::<KeyNotFoundError>::new()),
        Arc::new(WireConverter::<NotImplementedError>::new()),
        Arc::new(IoConverter),
    ]
}

/// Fallback for errors no converter recognized.
fn generic_conversion<'a>(err: &'a (dyn StdError + 'static)) -> Conversion<'a> {
    let exception = ServiceException::new(type_name_of(err), err.to_string())
        .with_stack_trace(format!("{:?}", err))
        .with_data(HRESULT_KEY, GENERIC_HRESULT.to_string());
    Conversion::new(exception).with_inner(err.source())
}

/// Best-effort type name of an arbitrary error, read from its `Debug` form.
///
/// Derived `Debug` output starts with the type name (`ParseIntError { .. }`);
/// anything else gets the generic name.
pub fn type_name_of(err: &(dyn StdError + 'static)) -> String {
    let debug = format!("{:?}", err);
    let name: String = debug.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    match name.chars().next() {
        Some(first) if first.is_uppercase() => name,
        _ => GENERIC_TYPE_NAME.to_string(),
    }
}

/// Converter for any [`WireException`].
pub struct WireConverter<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E: WireException> WireConverter<E> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<E: WireException> Default for WireConverter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: WireException> ExceptionConverter for WireConverter<E> {
    fn name(&self) -> &str {
        E::TYPE_NAME
    }

    fn to_service_exception<'a>(
        &self,
        err: &'a (dyn StdError + 'static),
    ) -> Result<Option<Conversion<'a>>, BoxError> {
        let Some(native) = err.downcast_ref::<E>() else { return Ok(None) };
        let exception = ServiceException::new(E::TYPE_NAME, native.message());
        Ok(Some(Conversion::new(exception).with_inner(WireException::cause(native))))
    }

    fn accepts(&self, type_name: &str) -> bool {
        type_name == E::TYPE_NAME
    }

    fn from_service_exception(
        &self,
        exception: &ServiceException,
        inner: Vec<BoxError>,
    ) -> Result<BoxError, BoxError> {
        let cause = inner.into_iter().next();
        Ok(Box::new(E::from_parts(exception.message.clone(), cause)))
    }
}

struct ArgumentConverter;

impl ExceptionConverter for ArgumentConverter {
    fn name(&self) -> &str {
        ArgumentError::TYPE_NAME
    }

    fn to_service_exception<'a>(
        &self,
        err: &'a (dyn StdError + 'static),
    ) -> Result<Option<Conversion<'a>>, BoxError> {
        let Some(native) = err.downcast_ref::<ArgumentError>() else { return Ok(None) };
        let mut exception = ServiceException::new(ArgumentError::TYPE_NAME, native.message());
        if let Some(param) = native.param_name() {
            exception = exception.with_data(PARAM_NAME_KEY, param);
        }
        Ok(Some(Conversion::new(exception).with_inner(native.source())))
    }

    fn accepts(&self, type_name: &str) -> bool {
        type_name == ArgumentError::TYPE_NAME
    }

    fn from_service_exception(
        &self,
        exception: &ServiceException,
        inner: Vec<BoxError>,
    ) -> Result<BoxError, BoxError> {
        let mut native = ArgumentError::new(exception.message.clone());
        if let Some(param) = exception.data.get(PARAM_NAME_KEY) {
            native = native.with_param(param.clone());
        }
        if let Some(cause) = inner.into_iter().next() {
            native = native.with_source(cause);
        }
        Ok(Box::new(native))
    }
}

struct AggregateConverter;

impl ExceptionConverter for AggregateConverter {
    fn name(&self) -> &str {
        AggregateError::TYPE_NAME
    }

    fn to_service_exception<'a>(
        &self,
        err: &'a (dyn StdError + 'static),
    ) -> Result<Option<Conversion<'a>>, BoxError> {
        let Some(native) = err.downcast_ref::<AggregateError>() else { return Ok(None) };
        let exception = ServiceException::new(AggregateError::TYPE_NAME, native.message());
        let inner = native
            .errors()
            .iter()
            .map(|e| &**e as &(dyn StdError + 'static))
            .collect();
        Ok(Some(Conversion { exception, inner }))
    }

    fn accepts(&self, type_name: &str) -> bool {
        type_name == AggregateError::TYPE_NAME
    }

    fn from_service_exception(
        &self,
        exception: &ServiceException,
        inner: Vec<BoxError>,
    ) -> Result<BoxError, BoxError> {
        Ok(Box::new(AggregateError::new(exception.message.clone(), inner)))
    }
}

/// Passes a previously received remote fault through unchanged when it is re-thrown.
struct RemoteExceptionConverter;

impl ExceptionConverter for RemoteExceptionConverter {
    fn name(&self) -> &str {
        "RemoteException"
    }

    fn to_service_exception<'a>(
        &self,
        err: &'a (dyn StdError + 'static),
    ) -> Result<Option<Conversion<'a>>, BoxError> {
        let Some(remote) = err.downcast_ref::<RemoteException>() else { return Ok(None) };
        let mut exception = remote.exception().clone();
        exception.inner_exceptions.clear();
        let inner = remote
            .inner()
            .iter()
            .map(|e| &**e as &(dyn StdError + 'static))
            .collect();
        Ok(Some(Conversion { exception, inner }))
    }
}

struct IoConverter;

const IO_TYPE_NAME: &str = "IOException";

impl ExceptionConverter for IoConverter {
    fn name(&self) -> &str {
        IO_TYPE_NAME
    }

    fn to_service_exception<'a>(
        &self,
        err: &'a (dyn StdError + 'static),
    ) -> Result<Option<Conversion<'a>>, BoxError> {
        let Some(io) = err.downcast_ref::<std::io::Error>() else { return Ok(None) };
        let code = io.raw_os_error().unwrap_or(GENERIC_HRESULT);
        let exception = ServiceException::new(IO_TYPE_NAME, io.to_string())
            .with_data(HRESULT_KEY, code.to_string())
            .with_data("ErrorKind", format!("{:?}", io.kind()));
        Ok(Some(Conversion::new(exception).with_inner(io.get_ref().map(|e| e as &(dyn StdError + 'static)))))
    }

    fn accepts(&self, type_name: &str) -> bool {
        type_name == IO_TYPE_NAME
    }

    fn from_service_exception(
        &self,
        exception: &ServiceException,
        _inner: Vec<BoxError>,
    ) -> Result<BoxError, BoxError> {
        let kind = match exception.data.get("ErrorKind").map(String::as_str) {
            Some("NotFound") => std::io::ErrorKind::NotFound,
            Some("PermissionDenied") => std::io::ErrorKind::PermissionDenied,
            Some("TimedOut") => std::io::ErrorKind::TimedOut,
            Some("AlreadyExists") => std::io::ErrorKind::AlreadyExists,
            Some("InvalidInput") => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::Other,
        };
        Ok(Box::new(std::io::Error::new(kind, exception.message.clone())))
    }
}
