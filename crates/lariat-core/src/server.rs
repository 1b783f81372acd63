//! Server: binds a target, accepts calls through the completion queue, and
//! dispatches them to registered method handlers. Handler panics and
//! unknown methods turn into terminal statuses rather than crashes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::batch::BatchOutcome;
use crate::completion::PendingTracker;
use crate::environment::Environment;
use crate::error::{Result, RpcError, UsageError};
use crate::metadata::Metadata;
use crate::server_call::ServerCall;
use crate::status::{Status, StatusCode};
use crate::transport::Listener;

/// What a handler returns: `Ok` finishes the call with `OK` unless the
/// handler already finished it, `Err` finishes with the given status.
pub type HandlerResult = std::result::Result<(), Status>;

/// Serves one method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Handles one accepted call.
    async fn handle(&self, call: ServerCall) -> HandlerResult;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(ServerCall) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, call: ServerCall) -> HandlerResult {
        (self.f)(call).await
    }
}

/// Wraps an async closure as a [`MethodHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// The methods a server exposes, keyed by full `/service/method` name.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. A later registration for the same name wins.
    pub fn add(&mut self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) -> &mut Self {
        self.methods.insert(method.into(), handler);
        self
    }

    /// Registers an async closure as a handler.
    pub fn add_fn<F, Fut>(&mut self, method: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.add(method, handler_fn(f))
    }

    fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(method).cloned()
    }
}

struct ServerInner {
    env: Arc<Environment>,
    target: String,
    methods: MethodRegistry,
    listener: Arc<Listener>,
    tracker: Arc<PendingTracker>,
    shut_down: AtomicBool,
}

impl ServerInner {
    async fn next_accept(self: &Arc<Self>) -> BatchOutcome {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let registry = self.env.registry();
        let key = registry.allocate_key();
        let guard = self.tracker.begin();
        registry.register(
            key,
            Box::new(move |outcome| {
                let _guard = guard;
                let _ = outcome_tx.send(outcome);
            }),
        );
        self.listener.request_call(key);
        outcome_rx
            .await
            .unwrap_or_else(|_| BatchOutcome::failed(None, true))
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            let outcome = self.next_accept().await;
            if !outcome.success {
                debug!(target = %self.target, "accept loop stopping");
                return;
            }
            let Some(incoming) = outcome.incoming else {
                return;
            };
            let call = ServerCall::accept(self.env.clone(), self.tracker.clone(), incoming);
            let inner = self.clone();
            self.env.spawn(async move {
                inner.dispatch(call).await;
            });
        }
    }

    async fn dispatch(self: Arc<Self>, call: ServerCall) {
        let Some(handler) = self.methods.get(call.method()) else {
            let status = Status::new(
                StatusCode::Unimplemented,
                format!("unknown method {}", call.method()),
            );
            let _ = call.finish(status, Metadata::new()).await;
            return;
        };
        // The handler runs in its own task so a panic is contained and
        // reported as UNKNOWN instead of taking the dispatcher down.
        let handler_call = call.clone();
        let joined = self
            .env
            .spawn(async move { handler.handle(handler_call).await })
            .await;
        let status = match joined {
            Ok(Ok(())) => Status::ok(),
            Ok(Err(status)) => status,
            Err(join_error) => {
                // The handler task died mid-call; its pending operations can
                // never be completed in order, so abort instead of finishing.
                warn!(method = %call.method(), %join_error, "handler panicked");
                call.abort(Status::unknown("handler terminated abnormally"));
                return;
            }
        };
        if !call.is_finished() {
            let _ = call.finish(status, Metadata::new()).await;
        }
    }
}

/// A running server bound to one target.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Binds `target` and starts serving `methods`. Acquires the shared
    /// environment; the matching release happens in [`Server::shutdown`].
    pub fn bind(target: impl Into<String>, methods: MethodRegistry) -> Result<Server> {
        let target = target.into();
        let env = Environment::acquire();
        let listener = match env.fabric().bind(&target) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = Environment::release();
                return Err(e.into());
            }
        };
        let inner = Arc::new(ServerInner {
            env,
            target,
            methods,
            listener,
            tracker: PendingTracker::new(),
            shut_down: AtomicBool::new(false),
        });
        inner.env.spawn(inner.clone().accept_loop());
        debug!(target = %inner.target, "server started");
        Ok(Server { inner })
    }

    /// Target this server is bound to.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Stops accepting, aborts calls still in flight, waits for their
    /// completions to drain, then releases the shared environment.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Err(UsageError::ServerAlreadyShutDown.into());
        }
        self.inner.env.fabric().unbind(&self.inner.target);
        let active = self.inner.listener.shutdown();
        for handle in active {
            handle.cancel(Status::cancelled("server shut down"));
        }
        self.inner.tracker.drained().await;
        debug!(target = %self.inner.target, "server shut down");
        Environment::release().map_err(RpcError::from)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("target", &self.inner.target).finish()
    }
}
