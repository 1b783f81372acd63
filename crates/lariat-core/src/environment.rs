//! Process-wide engine state: event queue, poller pool, worker pool.
//!
//! The environment is explicitly reference-counted with paired
//! acquire/release, not an implicit singleton. Channels and servers acquire
//! a reference on creation and release it on shutdown; the last release
//! tears the poller threads down. A release without a matching acquire is
//! rejected.
//!
//! Poller threads are the only place completion events are observed.
//! Continuations are never invoked on a poller thread; they are handed to a
//! dedicated worker runtime whose thread count must exceed the expected
//! nesting depth of blocking calls.

use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, warn};

use crate::batch::CompletionEvent;
use crate::completion::CompletionRegistry;
use crate::error::UsageError;
use crate::transport::Fabric;

/// Events drained by the poller pool.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    /// A previously issued operation batch finished.
    Completion(CompletionEvent),
    /// Sentinel telling one poller thread to exit.
    Shutdown,
}

/// Sizing of the poller and worker pools.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Number of threads draining the completion event queue (default: 2).
    pub poller_count: usize,
    /// Worker runtime threads; must exceed the expected depth of nested
    /// blocking calls (default: 8).
    pub worker_threads: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            poller_count: 2,
            worker_threads: 8,
        }
    }
}

/// Explicit acquire/release pairing. Kept separate so the contract is
/// testable without touching the global environment.
#[derive(Debug, Default)]
pub(crate) struct RefCounter {
    count: usize,
}

impl RefCounter {
    /// Increments and returns the new count.
    pub(crate) fn acquire(&mut self) -> usize {
        self.count += 1;
        self.count
    }

    /// Decrements and returns the new count; rejects an unmatched release.
    pub(crate) fn release(&mut self) -> Result<usize, UsageError> {
        if self.count == 0 {
            return Err(UsageError::UnmatchedEnvironmentRelease);
        }
        self.count -= 1;
        Ok(self.count)
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }
}

/// The shared engine state owned by all live channels and servers.
pub struct Environment {
    registry: Arc<CompletionRegistry>,
    events_tx: Sender<EngineEvent>,
    fabric: Fabric,
    worker_handle: Handle,
    workers: Mutex<Option<Runtime>>,
    pollers: Mutex<Vec<thread::JoinHandle<()>>>,
    config: EnvironmentConfig,
}

struct Global {
    counter: RefCounter,
    env: Option<Arc<Environment>>,
}

static GLOBAL: Mutex<Global> = Mutex::new(Global {
    counter: RefCounter { count: 0 },
    env: None,
});

fn poller_loop(
    index: usize,
    events_rx: Receiver<EngineEvent>,
    registry: Arc<CompletionRegistry>,
    workers: Handle,
) {
    debug!(index, "poller thread started");
    loop {
        match events_rx.recv() {
            Ok(EngineEvent::Completion(event)) => {
                let continuation = registry.resolve(event.key);
                let outcome = event.outcome;
                // Continuations run application-visible work; hand them off
                // so a blocking continuation cannot stall event dispatch.
                workers.spawn(async move { continuation(outcome) });
            }
            Ok(EngineEvent::Shutdown) | Err(_) => break,
        }
    }
    debug!(index, "poller thread exited");
}

impl Environment {
    fn boot(config: EnvironmentConfig) -> Arc<Environment> {
        let (events_tx, events_rx) = unbounded();
        let registry = Arc::new(CompletionRegistry::new());
        let workers = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("lariat-worker")
            .enable_all()
            .build()
            .expect("failed to build worker runtime");
        let worker_handle = workers.handle().clone();
        let mut pollers = Vec::with_capacity(config.poller_count.max(1));
        for index in 0..config.poller_count.max(1) {
            let rx = events_rx.clone();
            let reg = registry.clone();
            let handle = worker_handle.clone();
            let joiner = thread::Builder::new()
                .name(format!("lariat-poller-{index}"))
                .spawn(move || poller_loop(index, rx, reg, handle))
                .expect("failed to spawn poller thread");
            pollers.push(joiner);
        }
        let fabric = Fabric::new(events_tx.clone());
        Arc::new(Environment {
            registry,
            events_tx,
            fabric,
            worker_handle,
            workers: Mutex::new(Some(workers)),
            pollers: Mutex::new(pollers),
            config,
        })
    }

    /// Acquires a reference to the shared environment, booting it with
    /// default sizing on the first acquire.
    pub fn acquire() -> Arc<Environment> {
        Self::acquire_with(EnvironmentConfig::default())
    }

    /// Acquires a reference; `config` takes effect only when this acquire
    /// boots a fresh environment.
    pub fn acquire_with(config: EnvironmentConfig) -> Arc<Environment> {
        let mut global = GLOBAL.lock().unwrap();
        let refs = global.counter.acquire();
        if global.env.is_none() {
            debug!(
                pollers = config.poller_count,
                workers = config.worker_threads,
                "booting environment"
            );
            global.env = Some(Environment::boot(config));
        }
        let env = global.env.as_ref().unwrap().clone();
        debug!(refs, "environment acquired");
        env
    }

    /// Releases one previously acquired reference. The last release tears
    /// down poller threads and the worker runtime.
    pub fn release() -> Result<(), UsageError> {
        let env = {
            let mut global = GLOBAL.lock().unwrap();
            let refs = global.counter.release()?;
            debug!(refs, "environment released");
            if refs == 0 {
                global.env.take()
            } else {
                None
            }
        };
        if let Some(env) = env {
            env.teardown();
        }
        Ok(())
    }

    /// Number of outstanding acquires.
    pub fn reference_count() -> usize {
        GLOBAL.lock().unwrap().counter.count()
    }

    fn teardown(&self) {
        if self.registry.pending_count() > 0 {
            // Channels and servers drain their completions before release;
            // anything left here escaped a shutdown path.
            warn!(
                pending = self.registry.pending_count(),
                "environment tearing down with unresolved completions"
            );
        }
        for _ in 0..self.config.poller_count.max(1) {
            let _ = self.events_tx.send(EngineEvent::Shutdown);
        }
        let pollers = std::mem::take(&mut *self.pollers.lock().unwrap());
        for poller in pollers {
            let _ = poller.join();
        }
        if let Some(workers) = self.workers.lock().unwrap().take() {
            // Safe to call from async contexts, unlike dropping the runtime.
            workers.shutdown_background();
        }
        debug!("environment torn down");
    }

    /// The completion registry shared with the poller pool.
    pub(crate) fn registry(&self) -> &Arc<CompletionRegistry> {
        &self.registry
    }

    /// The in-process transport fabric.
    pub(crate) fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Spawns a task on the worker runtime.
    pub(crate) fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.worker_handle.spawn(future)
    }
}
