//! Deadline and cancellation propagation from a serving call into nested
//! outbound calls.

use std::time::Duration;

use lariat_core::{
    CallOptions, Channel, Deadline, MethodRegistry, PropagationOptions, RpcError, Server, Status,
    StatusCode, UsageError,
};
use tokio::sync::mpsc;

use crate::harness::{init_tracing, unique_target};

const EXPECT_FINITE: &str = "/lariat.test.Nested/ExpectFinite";
const EXPECT_INFINITE: &str = "/lariat.test.Nested/ExpectInfinite";
const HANG: &str = "/lariat.test.Nested/Hang";

fn nested_registry() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    methods.add_fn(EXPECT_FINITE, |call| async move {
        if call.deadline().is_infinite() {
            return Err(Status::new(
                StatusCode::FailedPrecondition,
                "expected an inherited deadline",
            ));
        }
        Ok(())
    });
    methods.add_fn(EXPECT_INFINITE, |call| async move {
        if !call.deadline().is_infinite() {
            return Err(Status::new(
                StatusCode::FailedPrecondition,
                "expected no deadline",
            ));
        }
        Ok(())
    });
    methods.add_fn(HANG, |call| async move {
        let reason = call.cancellation_token().cancelled().await;
        Err(Status::cancelled(reason.to_string()))
    });
    methods
}

#[tokio::test]
async fn test_child_call_inherits_parent_deadline() {
    init_tracing();
    let nested_target = unique_target("propagation-nested");
    let nested_server = Server::bind(&nested_target, nested_registry()).unwrap();

    let outer_target = unique_target("propagation-outer");
    let mut outer_methods = MethodRegistry::new();
    let relay_target = nested_target.clone();
    outer_methods.add_fn("/lariat.test.Outer/Relay", move |call| {
        let nested_target = relay_target.clone();
        async move {
            let channel = Channel::new(&nested_target, Default::default())
                .map_err(|e| Status::internal(e.to_string()))?;

            // Default options: the nested call inherits the deadline.
            let token = call.propagation_token(PropagationOptions::default());
            let options = CallOptions::new().with_propagation(token);
            let nested = channel
                .call(EXPECT_FINITE, &options)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            nested
                .complete_writes()
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            let first = nested.finished().await.status;

            // Deadline propagation suppressed: the nested call runs without
            // one.
            let token = call.propagation_token(PropagationOptions {
                propagate_deadline: false,
                propagate_cancellation: true,
            });
            let options = CallOptions::new().with_propagation(token);
            let nested = channel
                .call(EXPECT_INFINITE, &options)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            nested
                .complete_writes()
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            let second = nested.finished().await.status;

            channel
                .shutdown()
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            if !first.is_ok() {
                return Err(first);
            }
            if !second.is_ok() {
                return Err(second);
            }
            Ok(())
        }
    });
    let outer_server = Server::bind(&outer_target, outer_methods).unwrap();
    let channel = Channel::new(&outer_target, Default::default()).unwrap();

    let options = CallOptions::new().with_deadline(Deadline::after(Duration::from_secs(10)));
    let call = channel
        .call("/lariat.test.Outer/Relay", &options)
        .await
        .unwrap();
    call.complete_writes().await.unwrap();
    let terminal = call.finished().await;
    assert_eq!(terminal.status.code(), StatusCode::Ok, "{}", terminal.status);

    channel.shutdown().await.unwrap();
    outer_server.shutdown().await.unwrap();
    nested_server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_parent_cancellation_reaches_the_nested_call() {
    init_tracing();
    let nested_target = unique_target("propagation-nested");
    let nested_server = Server::bind(&nested_target, nested_registry()).unwrap();

    let (report_tx, mut report_rx) = mpsc::unbounded_channel::<StatusCode>();
    let outer_target = unique_target("propagation-outer");
    let mut outer_methods = MethodRegistry::new();
    let relay_target = nested_target.clone();
    outer_methods.add_fn("/lariat.test.Outer/Relay", move |call| {
        let nested_target = relay_target.clone();
        let report = report_tx.clone();
        async move {
            let channel = Channel::new(&nested_target, Default::default())
                .map_err(|e| Status::internal(e.to_string()))?;
            let token = call.propagation_token(PropagationOptions::default());
            let options = CallOptions::new().with_propagation(token);
            let nested = match channel.call(HANG, &options).await {
                Ok(nested) => nested,
                // The parent was cancelled before the nested call started.
                Err(e) => {
                    let code = e
                        .status()
                        .map(|s| s.code())
                        .unwrap_or(StatusCode::Unknown);
                    let _ = report.send(code);
                    let _ = channel.shutdown().await;
                    return Err(Status::cancelled("parent cancelled early"));
                }
            };
            // The nested call only ends because the parent's cancellation
            // propagates into it.
            let terminal = nested.finished().await;
            let _ = report.send(terminal.status.code());
            let _ = channel.shutdown().await;
            Err(terminal.status)
        }
    });
    let outer_server = Server::bind(&outer_target, outer_methods).unwrap();
    let channel = Channel::new(&outer_target, Default::default()).unwrap();

    let call = channel
        .call("/lariat.test.Outer/Relay", &CallOptions::new())
        .await
        .unwrap();
    // Give the relay a moment to start its nested call, then cancel.
    tokio::time::sleep(Duration::from_millis(100)).await;
    call.cancel();
    assert_eq!(call.finished().await.status.code(), StatusCode::Cancelled);
    assert_eq!(report_rx.recv().await, Some(StatusCode::Cancelled));

    channel.shutdown().await.unwrap();
    outer_server.shutdown().await.unwrap();
    nested_server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_explicit_and_propagated_deadline_is_ambiguous() {
    init_tracing();
    let nested_target = unique_target("propagation-nested");
    let nested_server = Server::bind(&nested_target, nested_registry()).unwrap();

    let (report_tx, mut report_rx) = mpsc::unbounded_channel::<bool>();
    let outer_target = unique_target("propagation-outer");
    let mut outer_methods = MethodRegistry::new();
    let relay_target = nested_target.clone();
    outer_methods.add_fn("/lariat.test.Outer/Relay", move |call| {
        let nested_target = relay_target.clone();
        let report = report_tx.clone();
        async move {
            let channel = Channel::new(&nested_target, Default::default())
                .map_err(|e| Status::internal(e.to_string()))?;
            let token = call.propagation_token(PropagationOptions::default());
            let options = CallOptions::new()
                .with_propagation(token)
                .with_deadline(Deadline::after(Duration::from_secs(1)));
            let outcome = channel.call(EXPECT_FINITE, &options).await;
            let ambiguous = matches!(
                outcome,
                Err(RpcError::Usage(UsageError::AmbiguousDeadline))
            );
            let _ = report.send(ambiguous);
            let _ = channel.shutdown().await;
            Ok(())
        }
    });
    let outer_server = Server::bind(&outer_target, outer_methods).unwrap();
    let channel = Channel::new(&outer_target, Default::default()).unwrap();

    let call = channel
        .call("/lariat.test.Outer/Relay", &CallOptions::new())
        .await
        .unwrap();
    call.complete_writes().await.unwrap();
    assert_eq!(call.finished().await.status.code(), StatusCode::Ok);
    assert_eq!(report_rx.recv().await, Some(true));

    channel.shutdown().await.unwrap();
    outer_server.shutdown().await.unwrap();
    nested_server.shutdown().await.unwrap();
}
