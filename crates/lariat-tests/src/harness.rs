//! Shared scaffolding: unique in-process targets and tracing setup.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use lariat_core::{
    handler_fn, ChannelOptions, MethodRegistry, Server, Status,
};

static NEXT_TARGET: AtomicU64 = AtomicU64::new(0);

/// A target name no other test will bind.
pub fn unique_target(prefix: &str) -> String {
    let n = NEXT_TARGET.fetch_add(1, Ordering::Relaxed);
    format!("inproc://{prefix}-{n}")
}

/// Installs the tracing subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Full method name served by [`echo_registry`].
pub const ECHO_METHOD: &str = "/lariat.test.Echo/Chat";

/// A registry with a bidirectional echo method: every request message is
/// echoed back, and the call finishes `OK` once the client half-closes.
pub fn echo_registry() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    methods.add(
        ECHO_METHOD,
        handler_fn(|call| async move {
            while let Some(message) = call.read_next().await.map_err(to_status)? {
                call.send_message(message).await.map_err(to_status)?;
            }
            Ok(())
        }),
    );
    methods
}

/// Starts an echo server on a fresh target and returns it with the target
/// name.
pub fn start_echo_server(prefix: &str) -> (Server, String) {
    let target = unique_target(prefix);
    let server = Server::bind(&target, echo_registry()).expect("bind echo server");
    (server, target)
}

/// Default channel options for tests.
pub fn test_channel_options() -> ChannelOptions {
    ChannelOptions::new()
}

/// A payload of `len` bytes with deterministic content.
pub fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

fn to_status(err: lariat_core::RpcError) -> Status {
    match err {
        lariat_core::RpcError::Status(status) => status,
        other => Status::unknown(other.to_string()),
    }
}
