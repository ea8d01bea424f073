//! Tests for identifiers, message invariants and the frame codec.

use crate::exception::ServiceException;
use crate::headers;
use crate::ids::compute_id;
use crate::Error;
use crate::Frame;
use crate::InterfaceId;
use crate::InvocationId;
use crate::MethodId;
use crate::Payload;
use crate::RemotingRequest;
use crate::RemotingResponse;

fn sample_request() -> RemotingRequest {
    let mut request = RemotingRequest::new(InterfaceId(42), MethodId(1), vec![5])
        .with_invocation_id(InvocationId("inv-1".into()));
    request.headers.insert(headers::REQUEST_ID_HEADER, b"req-9".to_vec());
    request.headers.insert("x-tenant", b"blue".to_vec());
    request
}

#[test]
fn test_compute_id_is_crc32() {
    // Check value of CRC-32/ISO-HDLC.
    assert_eq!(compute_id("123456789"), 0xCBF43926u32 as i32);
}

#[test]
fn test_ids_are_deterministic() {
    let a = InterfaceId::from_name("Demo.Counter.ICounter");
    let b = InterfaceId::from_name("Demo.Counter.ICounter");
    assert_eq!(a, b);
    assert_ne!(a, InterfaceId::from_name("Demo.Counter.ICounter2"));
    assert_eq!(MethodId::from_name("Increment"), MethodId::from_name("Increment"));
}

#[test]
fn test_invocation_ids_are_unique() {
    assert_ne!(InvocationId::new(), InvocationId::new());
}

#[test]
fn test_cancel_message_reuses_call_identity() {
    let request = sample_request();
    let cancel = request.cancel_message().expect("cancellable request");

    assert_eq!(cancel.interface_id, request.interface_id);
    assert_eq!(cancel.method_id, request.method_id);
    assert_eq!(cancel.invocation_id, request.invocation_id);
    assert!(cancel.body.is_empty());
    assert!(cancel.is_cancel());
    assert_eq!(cancel.headers.get_str(headers::REQUEST_ID_HEADER), Some("req-9"));
    assert!(!cancel.headers.contains("x-tenant"));
}

#[test]
fn test_non_cancellable_request_has_no_cancel_message() {
    let request = RemotingRequest::new(InterfaceId(1), MethodId(2), vec![]);
    assert!(request.cancel_message().is_none());
}

#[test]
fn test_request_frame_survives_encoding() {
    let frame = Frame::Request(sample_request());
    let bytes = frame.to_bytes().unwrap();
    assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
}

#[test]
fn test_fault_response_carries_marker_and_nesting() {
    let fault = ServiceException::new("InvalidOperationException", "outer")
        .with_data("HResult", "-2146233079")
        .with_inner(ServiceException::new("ArgumentException", "inner"));
    let response = RemotingResponse::fault(fault.clone());
    assert!(response.headers.contains(headers::REMOTE_FAULT_HEADER));

    let bytes = Frame::Response(response).to_bytes().unwrap();
    let decoded = Frame::from_bytes(&bytes).unwrap().into_response().unwrap();
    match decoded.payload {
        Payload::Fault(exception) => {
            assert_eq!(exception, fault);
            assert_eq!(exception.depth(), 1);
        }
        other => panic!("Expected fault payload, got {:?}", other),
    }
}

#[test]
fn test_cancel_with_body_is_rejected() {
    let mut cancel = sample_request().cancel_message().unwrap();
    cancel.body = vec![1, 2, 3];
    let bytes = Frame::Request(cancel).to_bytes().unwrap();

    match Frame::from_bytes(&bytes) {
        Err(Error::ProtocolViolation(_)) => (),
        other => panic!("Expected ProtocolViolation, got {:?}", other),
    }
}

#[test]
fn test_one_way_cancel_is_rejected() {
    let cancel = sample_request().cancel_message().unwrap();
    let bytes = Frame::OneWay(cancel).to_bytes().unwrap();
    assert!(matches!(Frame::from_bytes(&bytes), Err(Error::ProtocolViolation(_))));
}

#[test]
fn test_garbage_does_not_decode() {
    assert!(matches!(Frame::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x01]), Err(Error::Decode(_))));
}

#[test]
fn test_request_frame_is_not_a_response() {
    let frame = Frame::Request(sample_request());
    assert!(matches!(frame.into_response(), Err(Error::ProtocolViolation(_))));
}

#[test]
fn test_exception_depth_and_count() {
    let leaf = ServiceException::new("C", "c");
    let mid = ServiceException::new("B", "b").with_inner(leaf.clone());
    let root = ServiceException::new("A", "a").with_inner(mid).with_inner(leaf);
    assert_eq!(root.depth(), 2);
    assert_eq!(root.count(), 4);
    assert_eq!(root.to_string(), "A: a");
}
