//! Policy-driven retry scenarios: transient failures replayed from the
//! write buffer, commitment on response data, and attempt exhaustion.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lariat_core::{
    retry_unary, CallOptions, Channel, ChannelOptions, MethodRegistry, RetryingCall, Server,
    Status, StatusCode,
};

use crate::harness::{init_tracing, unique_target};

const UNARY: &str = "/retrytest.Echo/Unary";

fn retry_config() -> ChannelOptions {
    let mut options = ChannelOptions::new();
    options
        .add_str(
            lariat_core::channel_options::names::SERVICE_CONFIG,
            r#"{
                "methodConfig": [{
                    "name": [{"service": "retrytest.Echo", "method": "Unary"}],
                    "retryPolicy": {
                        "maxAttempts": 3,
                        "initialBackoff": "0.01s",
                        "maxBackoff": "0.05s",
                        "backoffMultiplier": 2.0,
                        "retryableStatusCodes": ["UNAVAILABLE"]
                    }
                }]
            }"#,
        )
        .unwrap();
    options
}

/// An echo server that fails the first `failures` attempts with `code`.
fn flaky_server(
    prefix: &str,
    failures: u32,
    code: StatusCode,
) -> (Server, String, Arc<AtomicU32>) {
    let target = unique_target(prefix);
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let mut methods = MethodRegistry::new();
    methods.add_fn(UNARY, move |call| {
        let counter = counter.clone();
        async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let request = call
                .read_next()
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            if attempt < failures {
                return Err(Status::new(code, "try again"));
            }
            if let Some(request) = request {
                call.send_message(request)
                    .await
                    .map_err(|e| Status::internal(e.to_string()))?;
            }
            Ok(())
        }
    });
    let server = Server::bind(&target, methods).unwrap();
    (server, target, attempts)
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    init_tracing();
    let (server, target, attempts) = flaky_server("retry", 2, StatusCode::Unavailable);
    let channel = Channel::new(&target, retry_config()).unwrap();

    let call = RetryingCall::start(&channel, UNARY, CallOptions::new())
        .await
        .unwrap();
    call.send_message(Bytes::from_static(b"persist")).await.unwrap();
    call.complete_writes().await.unwrap();
    let response = call.read_next().await.unwrap().expect("echoed response");
    assert_eq!(&response[..], b"persist");
    let terminal = call.finished().await.unwrap();
    assert_eq!(terminal.status.code(), StatusCode::Ok);
    assert_eq!(call.attempts_made(), 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_non_retryable_codes_fail_immediately() {
    init_tracing();
    let (server, target, attempts) = flaky_server("retry", u32::MAX, StatusCode::Internal);
    let channel = Channel::new(&target, retry_config()).unwrap();

    let call = RetryingCall::start(&channel, UNARY, CallOptions::new())
        .await
        .unwrap();
    call.send_message(Bytes::from_static(b"nope")).await.unwrap();
    call.complete_writes().await.unwrap();
    assert_eq!(call.read_next().await.unwrap(), None);
    let terminal = call.finished().await.unwrap();
    assert_eq!(terminal.status.code(), StatusCode::Internal);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retries_are_exhausted_after_max_attempts() {
    init_tracing();
    let (server, target, attempts) = flaky_server("retry", u32::MAX, StatusCode::Unavailable);
    let channel = Channel::new(&target, retry_config()).unwrap();

    let call = RetryingCall::start(&channel, UNARY, CallOptions::new())
        .await
        .unwrap();
    call.send_message(Bytes::from_static(b"doomed")).await.unwrap();
    call.complete_writes().await.unwrap();
    assert_eq!(call.read_next().await.unwrap(), None);
    let terminal = call.finished().await.unwrap();
    assert_eq!(terminal.status.code(), StatusCode::Unavailable);
    assert_eq!(call.attempts_made(), 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_a_committed_call_is_never_retried() {
    init_tracing();
    let target = unique_target("retry");
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let mut methods = MethodRegistry::new();
    // Sends response data first, then fails: the client has committed by
    // the time the failure arrives.
    methods.add_fn(UNARY, move |call| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = call.read_next().await;
            call.send_message(Bytes::from_static(b"partial"))
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            Err(Status::new(StatusCode::Unavailable, "late failure"))
        }
    });
    let server = Server::bind(&target, methods).unwrap();
    let channel = Channel::new(&target, retry_config()).unwrap();

    let call = RetryingCall::start(&channel, UNARY, CallOptions::new())
        .await
        .unwrap();
    call.send_message(Bytes::from_static(b"req")).await.unwrap();
    call.complete_writes().await.unwrap();
    let response = call.read_next().await.unwrap().expect("partial response");
    assert_eq!(&response[..], b"partial");
    let terminal = call.finished().await.unwrap();
    assert_eq!(terminal.status.code(), StatusCode::Unavailable);
    assert_eq!(call.attempts_made(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_unblocks_a_suspended_read() {
    init_tracing();
    let target = unique_target("retry");
    let mut methods = MethodRegistry::new();
    // Never responds; only the client's cancellation ends the call.
    methods.add_fn(UNARY, |call| async move {
        let reason = call.cancellation_token().cancelled().await;
        Err(Status::cancelled(reason.to_string()))
    });
    let server = Server::bind(&target, methods).unwrap();
    let channel = Channel::new(&target, retry_config()).unwrap();

    let call = Arc::new(
        RetryingCall::start(&channel, UNARY, CallOptions::new())
            .await
            .unwrap(),
    );
    call.send_message(Bytes::from_static(b"req")).await.unwrap();
    let reader = {
        let call = call.clone();
        tokio::spawn(async move { call.read_next().await })
    };
    tokio::task::yield_now().await;
    call.cancel();

    let read = tokio::time::timeout(std::time::Duration::from_secs(2), reader)
        .await
        .expect("cancel must unblock the pending read")
        .unwrap();
    let err = read.unwrap_err();
    assert_eq!(
        err.status().expect("status error").code(),
        StatusCode::Cancelled
    );
    let terminal = call.finished().await.unwrap();
    assert_eq!(terminal.status.code(), StatusCode::Cancelled);
    assert_eq!(call.attempts_made(), 1);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_unary_convenience() {
    init_tracing();
    let (server, target, attempts) = flaky_server("retry", 1, StatusCode::Unavailable);
    let channel = Channel::new(&target, retry_config()).unwrap();

    let (response, terminal) = retry_unary(
        &channel,
        UNARY,
        Bytes::from_static(b"once more"),
        CallOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(&response.expect("echoed response")[..], b"once more");
    assert_eq!(terminal.status.code(), StatusCode::Ok);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unary_without_policy_runs_a_single_attempt() {
    init_tracing();
    let (server, target, attempts) = flaky_server("retry", 0, StatusCode::Unavailable);
    // No service config on this channel.
    let channel = Channel::new(&target, ChannelOptions::new()).unwrap();

    let (response, terminal) = retry_unary(
        &channel,
        UNARY,
        Bytes::from_static(b"plain"),
        CallOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(&response.expect("echoed response")[..], b"plain");
    assert_eq!(terminal.status.code(), StatusCode::Ok);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}
