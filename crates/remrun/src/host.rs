//! # Service Host
//!
//! The server side receive path: frame in, frame out.
//!
//! A host owns the dispatchers of the interfaces it serves, the table of
//! cancellable invocations in flight and the throw-side exception pipeline.
//! Transports hand it raw frames through [`ServiceHost::handle_frame`].

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use remwire::headers::LOCATION_CHANGED_HEADER;
use remwire::Frame;
use remwire::InterfaceId;
use remwire::RemotingRequest;
use remwire::RemotingResponse;

use crate::cancellation::InFlightKey;
use crate::cancellation::InFlightTable;
use crate::context::CallContext;
use crate::dispatch;
use crate::dispatch::Call;
use crate::dispatch::ServiceDispatch;
use crate::exceptions::InvalidOperationError;
use crate::marshal::ExceptionPipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Protocol(remwire::Error),
    /// No dispatcher serves this interface id.
    UnknownInterface(InterfaceId),
    Dispatch(dispatch::Error),
    /// A dispatcher for this interface id is already hosted.
    AlreadyHosted(InterfaceId),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::UnknownInterface(id) => write!(f, "No service hosted for {}", id),
            Self::Dispatch(e) => write!(f, "Dispatch error: {}", e),
            Self::AlreadyHosted(id) => write!(f, "A service for {} is already hosted", id),
        }
    }
}

impl std::error::Error for Error {}

impl From<remwire::Error> for Error {
    fn from(e: remwire::Error) -> Self {
        Self::Protocol(e)
    }
}

impl From<dispatch::Error> for Error {
    fn from(e: dispatch::Error) -> Self {
        Self::Dispatch(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Routes incoming frames to hosted dispatchers.
pub struct ServiceHost {
    services: DashMap<InterfaceId, Arc<dyn ServiceDispatch>>,
    in_flight: InFlightTable,
    pipeline: Arc<ExceptionPipeline>,
    location_changed: AtomicBool,
}

impl ServiceHost {
    pub fn new(pipeline: ExceptionPipeline) -> Self {
        Self {
            services: DashMap::new(),
            in_flight: InFlightTable::new(),
            pipeline: Arc::new(pipeline),
            location_changed: AtomicBool::new(false),
        }
    }

    /// Serves the interface of `service`. Each interface id is hosted once.
    pub fn add_service(&self, service: impl ServiceDispatch) -> Result<()> {
        let id = service.descriptor().id;
        match self.services.entry(id) {
            Entry::Occupied(_) => Err(Error::AlreadyHosted(id)),
            Entry::Vacant(slot) => {
                tracing::debug!(%id, interface = %service.descriptor().full_name, "hosting service");
                slot.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    pub fn in_flight(&self) -> &InFlightTable {
        &self.in_flight
    }

    /// Makes the next response tell the client that the partition moved.
    pub fn signal_location_change(&self) {
        self.location_changed.store(true, Ordering::Release);
    }

    /// Handles one encoded frame. Returns the encoded response, or `None` for
    /// one-way frames.
    pub async fn handle_frame(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        match Frame::from_bytes(bytes)? {
            Frame::Request(request) => {
                let response = self.handle_request(request).await?;
                Ok(Some(Frame::Response(response).to_bytes()?))
            }
            Frame::OneWay(request) => {
                self.handle_one_way(request)?;
                Ok(None)
            }
            Frame::Response(_) => Err(Error::Protocol(remwire::Error::ProtocolViolation(
                "host received a response frame".into(),
            ))),
        }
    }

    /// Handles a request or cancel message.
    ///
    /// Failures of the implementation come back as fault responses. Unknown
    /// interfaces and methods are local errors.
    pub async fn handle_request(&self, request: RemotingRequest) -> Result<RemotingResponse> {
        if request.is_cancel() {
            let delivered = match InFlightKey::of(&request) {
                Some(key) => self.in_flight.cancel(&key),
                None => false,
            };
            return Ok(self.finish(RemotingResponse::cancel_ack(delivered)));
        }

        let service = self.service(request.interface_id)?;
        let context = CallContext::extract(&request.headers);

        let guard = match InFlightKey::of(&request) {
            Some(key) => match self.in_flight.register(key) {
                Ok(guard) => Some(guard),
                Err(duplicate) => {
                    tracing::warn!(error = %duplicate, "rejecting duplicate invocation");
                    let err = InvalidOperationError::new(duplicate.to_string());
                    return Ok(self.finish(RemotingResponse::fault(self.pipeline.to_service_exception(&err))));
                }
            },
            None => None,
        };
        let token = guard.as_ref().map(|g| g.token()).unwrap_or_else(CancellationToken::new);

        let running = service.dispatch(request.method_id, &request.body, Call::new(context, token))?;
        let result = running.await;
        drop(guard);

        let response = match result {
            Ok(Some(body)) => RemotingResponse::value(body),
            Ok(None) => RemotingResponse::empty(),
            Err(e) => {
                let exception = self.pipeline.to_service_exception(e.as_ref());
                tracing::debug!(type_name = %exception.exception_type_name, "method failed");
                RemotingResponse::fault(exception)
            }
        };
        Ok(self.finish(response))
    }

    /// Starts a one-way call; its outcome stays on this side.
    pub fn handle_one_way(&self, request: RemotingRequest) -> Result<()> {
        let service = self.service(request.interface_id)?;
        let context = CallContext::extract(&request.headers);
        service.dispatch_one_way(request.method_id, &request.body, Call::new(context, CancellationToken::new()))?;
        Ok(())
    }

    fn service(&self, id: InterfaceId) -> Result<Arc<dyn ServiceDispatch>> {
        match self.services.get(&id) {
            Some(service) => Ok(service.clone()),
            None => {
                tracing::error!(%id, "request for unhosted interface");
                Err(Error::UnknownInterface(id))
            }
        }
    }

    fn finish(&self, mut response: RemotingResponse) -> RemotingResponse {
        if self.location_changed.swap(false, Ordering::AcqRel) {
            response.headers.mark(LOCATION_CHANGED_HEADER);
        }
        response
    }
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new(ExceptionPipeline::default())
    }
}
