//! # Protocol Messages
//!
//! Defines the request, the response and the frame that wraps them.
//!
//! ## Invariants
//! - **Cancel shape**: a cancel message reuses the interface id, method id and
//!   invocation id of the call it targets, carries the cancellation header and
//!   has an empty body.
//! - **Fault marker**: a response whose payload is a fault carries the
//!   remote-fault header, so peers that only read headers can tell.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::exception::ServiceException;
use crate::headers;
use crate::headers::Headers;
use crate::ids::InterfaceId;
use crate::ids::InvocationId;
use crate::ids::MethodId;

/// A logical method call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotingRequest {
    pub interface_id: InterfaceId,
    pub method_id: MethodId,
    /// Present only when the call is cancellable.
    pub invocation_id: Option<InvocationId>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RemotingRequest {
    pub fn new(interface_id: InterfaceId, method_id: MethodId, body: Vec<u8>) -> Self {
        Self {
            interface_id,
            method_id,
            invocation_id: None,
            headers: Headers::new(),
            body,
        }
    }

    pub fn with_invocation_id(mut self, invocation_id: InvocationId) -> Self {
        self.invocation_id = Some(invocation_id);
        self
    }

    /// Builds the cancel message for this request.
    ///
    /// Returns `None` when the request is not cancellable.
    pub fn cancel_message(&self) -> Option<RemotingRequest> {
        let invocation_id = self.invocation_id.clone()?;
        let mut cancel = RemotingRequest::new(self.interface_id, self.method_id, Vec::new())
            .with_invocation_id(invocation_id);
        cancel.headers.mark(headers::CANCELLATION_HEADER);
        if let Some(request_id) = self.headers.get(headers::REQUEST_ID_HEADER) {
            cancel.headers.insert(headers::REQUEST_ID_HEADER, request_id.to_vec());
        }
        Some(cancel)
    }

    pub fn is_cancel(&self) -> bool {
        self.headers.contains(headers::CANCELLATION_HEADER)
    }

    /// Checks the cancel-shape invariant.
    pub fn validate(&self) -> Result<()> {
        if !self.is_cancel() {
            return Ok(());
        }
        if self.invocation_id.is_none() {
            return Err(Error::ProtocolViolation("Cancel message without invocation id".into()));
        }
        if !self.body.is_empty() {
            return Err(Error::ProtocolViolation("Cancel message with a body".into()));
        }
        Ok(())
    }
}

/// What a response carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Serialized return value.
    Value(Vec<u8>),
    /// The method returns nothing.
    Empty,
    /// Reply to a cancel message: whether a matching in-flight call was signalled.
    CancelAck { delivered: bool },
    /// The remote method failed.
    Fault(ServiceException),
}

/// The reply to a [`RemotingRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotingResponse {
    pub headers: Headers,
    pub payload: Payload,
}

impl RemotingResponse {
    pub fn value(body: Vec<u8>) -> Self {
        Self { headers: Headers::new(), payload: Payload::Value(body) }
    }

    pub fn empty() -> Self {
        Self { headers: Headers::new(), payload: Payload::Empty }
    }

    pub fn cancel_ack(delivered: bool) -> Self {
        let mut marks = Headers::new();
        marks.mark(headers::CANCELLATION_HEADER);
        Self { headers: marks, payload: Payload::CancelAck { delivered } }
    }

    pub fn fault(exception: ServiceException) -> Self {
        let mut marks = Headers::new();
        marks.mark(headers::REMOTE_FAULT_HEADER);
        Self { headers: marks, payload: Payload::Fault(exception) }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.payload, Payload::Fault(_))
    }

    /// True when the server signalled that the partition moved.
    pub fn location_changed(&self) -> bool {
        self.headers.contains(headers::LOCATION_CHANGED_HEADER)
    }
}

/// Top-level envelope moved by a transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A call (or cancel message) that expects a response.
    Request(RemotingRequest),
    /// A fire-and-forget call.
    OneWay(RemotingRequest),
    Response(RemotingResponse),
}

impl Frame {
    /// Encodes the frame into bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Encode(e.to_string()))
    }

    /// Decodes a frame, checking protocol invariants.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let frame: Frame = bincode::deserialize(bytes).map_err(|e| Error::Decode(e.to_string()))?;
        match &frame {
            Frame::Request(request) => request.validate()?,
            Frame::OneWay(request) => {
                if request.is_cancel() {
                    return Err(Error::ProtocolViolation("Cancel message sent one-way".into()));
                }
            }
            Frame::Response(_) => (),
        }
        Ok(frame)
    }

    /// Unwraps a response frame.
    pub fn into_response(self) -> Result<RemotingResponse> {
        match self {
            Frame::Response(response) => Ok(response),
            Frame::Request(_) | Frame::OneWay(_) => Err(Error::ProtocolViolation(
                "Received request frame while waiting for a response".into(),
            )),
        }
    }
}
