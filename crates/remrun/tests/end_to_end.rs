//! Client proxy to hosted implementation over the loopback network.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use remrun::exceptions::ArgumentError;
use remrun::exceptions::InvalidOperationError;
use remrun::exceptions::WireException;
use remrun::partition;
use remrun::partition::PartitionTarget;
use remrun::proxy;
use remrun::transport::TransportError;
use remrun::CallContext;
use remwire::InterfaceId;
use remwire::InvocationId;
use remwire::MethodId;
use remwire::RemotingRequest;

use common::Counter;
use common::Harness;
use common::SERVICE_URI;

#[tokio::test]
async fn test_increment_round_trip() -> anyhow::Result<()> {
    let harness = Harness::new();
    let proxy = harness.proxy();
    assert_eq!(proxy.interface().id, InterfaceId(42));

    let token = CancellationToken::new();
    let six: i64 = proxy
        .invoke_on(&CallContext::new(), InterfaceId(42), MethodId(1), &5i64, &token)
        .await?;
    assert_eq!(six, 6);

    let by_name: i64 = proxy.invoke(&CallContext::new(), "Increment", &5i64, &token).await?;
    assert_eq!(by_name, 6);
    assert_eq!(harness.counter.increments.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_remote_argument_exception_is_rebuilt() {
    let harness = Harness::new();
    let proxy = harness.proxy();

    let err = proxy
        .invoke_void(&CallContext::new(), "Fail", &"bad value".to_string(), &CancellationToken::new())
        .await
        .unwrap_err();

    let remote = err.remote().expect("remote failure");
    let argument = remote.downcast_ref::<ArgumentError>().expect("argument error");
    assert_eq!(argument.message(), "bad value");
    assert!(!err.is_cancelled());
}

#[tokio::test]
async fn test_base_method_through_derived_proxy() -> anyhow::Result<()> {
    let harness = Harness::new();
    let proxy = harness.proxy();

    let name: String = proxy
        .invoke(&CallContext::new(), "Name", &(), &CancellationToken::new())
        .await?;
    assert_eq!(name, "counter");
    Ok(())
}

#[tokio::test]
async fn test_request_id_reaches_implementation() -> anyhow::Result<()> {
    let harness = Harness::new();
    let proxy = harness.proxy();
    let ctx = CallContext::with_request_id("req-7");

    let seen: String = proxy.invoke(&ctx, "WhoAmI", &(), &CancellationToken::new()).await?;
    assert_eq!(seen, "req-7");
    Ok(())
}

#[tokio::test]
async fn test_one_way_call_runs_on_server() -> anyhow::Result<()> {
    let harness = Harness::new();
    let proxy = harness.proxy();

    let recorded = harness.counter.recorded.notified();
    proxy
        .invoke_one_way(&CallContext::new(), "Record", &"hello".to_string())
        .await?;
    tokio::time::timeout(Duration::from_secs(1), recorded).await?;

    assert_eq!(*harness.counter.records.lock().unwrap(), vec!["hello".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_wrong_return_type_is_rejected_locally() {
    let harness = Harness::new();
    let proxy = harness.proxy();

    let err = proxy
        .invoke::<_, String>(&CallContext::new(), "Increment", &1i64, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, proxy::Error::ReturnTypeMismatch { .. }));
    assert_eq!(harness.counter.increments.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_method_name_is_rejected_locally() {
    let harness = Harness::new();
    let proxy = harness.proxy();

    let err = proxy
        .invoke_void(&CallContext::new(), "Decrement", &1i64, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, proxy::Error::UnknownMethod { .. }));
}

#[tokio::test]
async fn test_unhosted_interface_is_a_permanent_failure() {
    let harness = Harness::new();
    let unknown = RemotingRequest::new(InterfaceId(7), MethodId(1), b"1".to_vec());

    let err = harness
        .client
        .invoke(&CallContext::new(), &PartitionTarget::new(SERVICE_URI), &unknown, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, partition::Error::Transport(TransportError::Rejected(_))));
    assert_eq!(harness.resolver.resolve_count(), 1);
}

#[tokio::test]
async fn test_duplicate_invocation_is_refused() -> anyhow::Result<()> {
    let harness = Harness::new();
    let descriptor = harness.registry.register::<Counter>()?;
    let slow = descriptor.method_by_name("Slow").unwrap().id;
    let request = RemotingRequest::new(InterfaceId(42), slow, b"50".to_vec())
        .with_invocation_id(InvocationId::new());

    let first = harness.host.clone();
    let first_request = request.clone();
    let running = tokio::spawn(async move { first.handle_request(first_request).await });
    tokio::task::yield_now().await;
    while harness.host.in_flight().is_empty() {
        tokio::task::yield_now().await;
    }

    let second = harness.host.handle_request(request).await?;
    let remwire::Payload::Fault(exception) = second.payload else {
        panic!("expected a fault for the duplicate");
    };
    assert_eq!(exception.exception_type_name, InvalidOperationError::TYPE_NAME);

    let first = running.await??;
    assert_eq!(first.payload, remwire::Payload::Value(b"50".to_vec()));
    assert!(harness.host.in_flight().is_empty());
    Ok(())
}
