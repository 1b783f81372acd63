//! Channel connectivity state machine and server lifecycle scenarios.

use std::time::Duration;

use lariat_core::{
    CallOptions, Channel, ChannelState, Deadline, MethodRegistry, RpcError, Server, StatusCode,
    UsageError,
};

use crate::harness::{echo_registry, init_tracing, start_echo_server, unique_target, ECHO_METHOD};

#[tokio::test]
async fn test_channel_connects_once_target_is_bound() {
    init_tracing();
    let target = unique_target("connectivity");
    let channel = Channel::new(&target, Default::default()).unwrap();
    assert_eq!(channel.state(false), ChannelState::Idle);

    assert_eq!(channel.state(true), ChannelState::Connecting);
    let server = Server::bind(&target, echo_registry()).unwrap();
    let next = channel
        .wait_for_state_change(ChannelState::Connecting, Deadline::after(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(next, Some(ChannelState::Ready));

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_resolves_when_server_arrives_and_times_out_otherwise() {
    init_tracing();
    let target = unique_target("connectivity");
    let channel = Channel::new(&target, Default::default()).unwrap();

    let ready = channel
        .connect_within(Deadline::after(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(!ready, "no server bound yet");

    let server = Server::bind(&target, echo_registry()).unwrap();
    let ready = channel
        .connect_within(Deadline::after(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(ready);
    assert_eq!(channel.state(false), ChannelState::Ready);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_call_fails_fast_when_target_unreachable() {
    init_tracing();
    let target = unique_target("connectivity");
    let channel = Channel::new(&target, Default::default()).unwrap();

    let err = channel.call(ECHO_METHOD, &CallOptions::new()).await.unwrap_err();
    assert_eq!(
        err.status().expect("status error").code(),
        StatusCode::Unavailable
    );
    assert_eq!(channel.state(false), ChannelState::TransientFailure);

    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_for_ready_call_waits_for_the_server() {
    init_tracing();
    let target = unique_target("connectivity");
    let channel = Channel::new(&target, Default::default()).unwrap();

    let bind_target = target.clone();
    let binder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Server::bind(&bind_target, echo_registry()).unwrap()
    });

    let options = CallOptions::new()
        .with_wait_for_ready(true)
        .with_deadline(Deadline::after(Duration::from_secs(5)));
    let call = channel.call(ECHO_METHOD, &options).await.unwrap();
    call.complete_writes().await.unwrap();
    assert_eq!(call.finished().await.status.code(), StatusCode::Ok);

    let server = binder.await.unwrap();
    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_for_ready_sees_a_bind_racing_the_attempt() {
    init_tracing();
    // Tight loop so the bind lands in every window around the admission
    // attempt, including right after a failed one.
    for _ in 0..64 {
        let target = unique_target("connectivity");
        let channel = Channel::new(&target, Default::default()).unwrap();

        let bind_target = target.clone();
        let binder =
            tokio::spawn(async move { Server::bind(&bind_target, echo_registry()).unwrap() });

        let options = CallOptions::new()
            .with_wait_for_ready(true)
            .with_deadline(Deadline::after(Duration::from_secs(5)));
        let call = channel.call(ECHO_METHOD, &options).await.unwrap();
        call.complete_writes().await.unwrap();
        assert_eq!(call.finished().await.status.code(), StatusCode::Ok);

        let server = binder.await.unwrap();
        channel.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_wait_for_ready_respects_the_deadline() {
    init_tracing();
    let target = unique_target("connectivity");
    let channel = Channel::new(&target, Default::default()).unwrap();

    let options = CallOptions::new()
        .with_wait_for_ready(true)
        .with_deadline(Deadline::after(Duration::from_millis(50)));
    let err = channel.call(ECHO_METHOD, &options).await.unwrap_err();
    assert_eq!(
        err.status().expect("status error").code(),
        StatusCode::DeadlineExceeded
    );

    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_for_state_change_can_time_out() {
    init_tracing();
    let target = unique_target("connectivity");
    let channel = Channel::new(&target, Default::default()).unwrap();

    let outcome = channel
        .wait_for_state_change(
            ChannelState::Idle,
            Deadline::after(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    assert_eq!(outcome, None);

    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_channel_rejects_further_use() {
    init_tracing();
    let target = unique_target("connectivity");
    let channel = Channel::new(&target, Default::default()).unwrap();
    channel.shutdown().await.unwrap();

    assert_eq!(channel.state(false), ChannelState::Shutdown);
    let err = channel
        .wait_for_state_change(ChannelState::Shutdown, Deadline::infinite())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Usage(UsageError::WaitOnShutdownState)));

    let err = channel.call(ECHO_METHOD, &CallOptions::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::Usage(UsageError::ChannelDisposed)));

    let err = channel.shutdown().await.unwrap_err();
    assert!(matches!(err, RpcError::Usage(UsageError::AlreadyShutDown)));
}

#[tokio::test]
async fn test_target_can_only_be_bound_once() {
    init_tracing();
    let (server, target) = start_echo_server("connectivity");

    let err = Server::bind(&target, MethodRegistry::new()).unwrap_err();
    assert!(matches!(err, RpcError::Usage(UsageError::TargetAlreadyBound(_))));

    server.shutdown().await.unwrap();
    let err = server.shutdown().await.unwrap_err();
    assert!(matches!(
        err,
        RpcError::Usage(UsageError::ServerAlreadyShutDown)
    ));

    // Unbinding frees the target for a new server.
    let reborn = Server::bind(&target, echo_registry()).unwrap();
    reborn.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_channel_shutdown_cancels_inflight_calls() {
    init_tracing();
    let (server, target) = start_echo_server("connectivity");
    let channel = Channel::new(&target, Default::default()).unwrap();

    let call = channel.call(ECHO_METHOD, &CallOptions::new()).await.unwrap();
    channel.shutdown().await.unwrap();
    assert_eq!(call.finished().await.status.code(), StatusCode::Cancelled);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_shutdown_aborts_calls_in_flight() {
    init_tracing();
    let (server, target) = start_echo_server("connectivity");
    let channel = Channel::new(&target, Default::default()).unwrap();

    let call = channel.call(ECHO_METHOD, &CallOptions::new()).await.unwrap();
    server.shutdown().await.unwrap();
    assert_eq!(call.finished().await.status.code(), StatusCode::Cancelled);

    channel.shutdown().await.unwrap();
}
