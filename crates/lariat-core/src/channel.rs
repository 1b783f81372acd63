//! Client channel: connectivity state machine, call creation, and a
//! drain-aware shutdown that cancels in-flight calls before releasing the
//! shared environment.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::channel_options::{names, ChannelOptions, ServiceConfig};
use crate::client_call::ClientCall;
use crate::completion::PendingTracker;
use crate::deadline::Deadline;
use crate::environment::Environment;
use crate::error::{Result, RpcError, UsageError};
use crate::options::CallOptions;
use crate::retry::RetryPolicy;
use crate::status::Status;
use crate::transport::CallHandle;

use tokio::sync::watch;

/// Connectivity state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection attempt has been made yet.
    Idle,
    /// Actively trying to reach the target.
    Connecting,
    /// The target is reachable.
    Ready,
    /// The last attempt failed; the target is currently unreachable.
    TransientFailure,
    /// The channel has been shut down. Terminal.
    Shutdown,
}

struct ChannelInner {
    env: Arc<Environment>,
    target: String,
    user_agent: String,
    service_config: Option<ServiceConfig>,
    state_tx: watch::Sender<ChannelState>,
    tracker: Arc<PendingTracker>,
    active: Mutex<Vec<CallHandle>>,
}

impl ChannelInner {
    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: ChannelState) {
        self.state_tx.send_if_modified(|current| {
            // Shutdown is terminal.
            if *current == ChannelState::Shutdown || *current == next {
                return false;
            }
            debug!(target = %self.target, from = ?*current, to = ?next, "channel state");
            *current = next;
            true
        });
    }
}

/// A client connection to one target.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Opens a channel to `target`. Acquires the shared environment; the
    /// matching release happens in [`Channel::shutdown`].
    pub fn new(target: impl Into<String>, options: ChannelOptions) -> Result<Channel> {
        let env = Environment::acquire();
        let service_config = match options.get_str(names::SERVICE_CONFIG) {
            Some(json) => Some(ServiceConfig::from_json(json)?),
            None => None,
        };
        let user_agent = options
            .get_str(names::USER_AGENT)
            .unwrap_or(concat!("lariat/", env!("CARGO_PKG_VERSION")))
            .to_string();
        let (state_tx, _) = watch::channel(ChannelState::Idle);
        Ok(Channel {
            inner: Arc::new(ChannelInner {
                env,
                target: target.into(),
                user_agent,
                service_config,
                state_tx,
                tracker: PendingTracker::new(),
                active: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Target this channel connects to.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Current connectivity state. With `try_to_connect`, an `Idle` channel
    /// starts connecting as a side effect.
    pub fn state(&self, try_to_connect: bool) -> ChannelState {
        let current = self.inner.state();
        if try_to_connect && current == ChannelState::Idle {
            self.kick_connect();
            return self.inner.state();
        }
        current
    }

    fn kick_connect(&self) {
        self.inner.transition(ChannelState::Connecting);
        if self.inner.env.fabric().is_reachable(&self.inner.target) {
            self.inner.transition(ChannelState::Ready);
            return;
        }
        let inner = self.inner.clone();
        self.inner.env.spawn(async move {
            let mut binds = inner.env.fabric().bind_watch();
            loop {
                if inner.state() == ChannelState::Shutdown {
                    return;
                }
                if inner.env.fabric().is_reachable(&inner.target) {
                    inner.transition(ChannelState::Ready);
                    return;
                }
                if binds.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Waits until the state differs from `last_observed`, or until
    /// `deadline` passes (returns `None`). Waiting for a change away from
    /// `Shutdown` is a usage error; that state is terminal.
    pub async fn wait_for_state_change(
        &self,
        last_observed: ChannelState,
        deadline: Deadline,
    ) -> Result<Option<ChannelState>> {
        if last_observed == ChannelState::Shutdown {
            return Err(UsageError::WaitOnShutdownState.into());
        }
        let mut rx = self.inner.state_tx.subscribe();
        let wait = rx.wait_for(|s| *s != last_observed);
        match deadline.remaining() {
            None => match wait.await {
                Ok(state) => Ok(Some(*state)),
                Err(_) => Ok(Some(ChannelState::Shutdown)),
            },
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(Ok(state)) => Ok(Some(*state)),
                Ok(Err(_)) => Ok(Some(ChannelState::Shutdown)),
                Err(_) => Ok(None),
            },
        }
    }

    /// Connects eagerly, resolving once the channel is `Ready`. Fails if
    /// the channel shuts down first.
    pub async fn connect(&self) -> Result<()> {
        match self.connect_within(Deadline::infinite()).await? {
            true => Ok(()),
            false => unreachable!("infinite deadline cannot time out"),
        }
    }

    /// Like [`Channel::connect`] but bounded by `deadline`. Returns `false`
    /// when the deadline passed before the channel became `Ready`.
    pub async fn connect_within(&self, deadline: Deadline) -> Result<bool> {
        let mut state = self.state(true);
        loop {
            match state {
                ChannelState::Ready => return Ok(true),
                ChannelState::Shutdown => return Err(UsageError::ChannelDisposed.into()),
                other => match self.wait_for_state_change(other, deadline).await? {
                    Some(next) => state = next,
                    None => return Ok(false),
                },
            }
        }
    }

    /// The retry policy configured for `method`, if any.
    pub fn retry_policy_for(&self, method: &str) -> Option<RetryPolicy> {
        self.inner
            .service_config
            .as_ref()
            .and_then(|config| config.retry_policy_for_full_name(method))
            .cloned()
    }

    /// Starts a call to `method` (full `/service/method` form).
    ///
    /// When the target is unreachable the call fails with `UNAVAILABLE`,
    /// unless the options request wait-for-ready, in which case it waits
    /// for the target within the call's deadline.
    pub async fn call(&self, method: &str, options: &CallOptions) -> Result<ClientCall> {
        if self.inner.state() == ChannelState::Shutdown {
            return Err(UsageError::ChannelDisposed.into());
        }
        let mut resolved = options.normalize()?;
        if resolved.headers.get("user-agent").is_none() {
            resolved
                .headers
                .add_ascii("user-agent", self.inner.user_agent.clone())?;
        }

        if matches!(
            self.inner.state(),
            ChannelState::Idle | ChannelState::TransientFailure
        ) {
            self.inner.transition(ChannelState::Connecting);
        }
        let handle = loop {
            if self.inner.state() == ChannelState::Shutdown {
                return Err(UsageError::ChannelDisposed.into());
            }
            if let Some(cancel) = &resolved.cancel {
                if cancel.is_cancelled() {
                    return Err(RpcError::Status(Status::cancelled("cancelled by caller")));
                }
            }
            // Subscribe before attempting, so a bind racing the attempt
            // still flips the receiver's changed flag.
            let mut binds = self.inner.env.fabric().bind_watch();
            if let Some(handle) = self.inner.env.fabric().start_call(
                &self.inner.target,
                method,
                resolved.headers.clone(),
                resolved.deadline,
            ) {
                break handle;
            }
            self.inner.transition(ChannelState::TransientFailure);
            if !resolved.wait_for_ready {
                return Err(RpcError::Status(Status::unavailable(format!(
                    "target {} is not reachable",
                    self.inner.target
                ))));
            }
            let changed = binds.changed();
            match resolved.deadline.remaining() {
                None => {
                    if changed.await.is_err() {
                        return Err(RpcError::Status(Status::unavailable(
                            "environment shut down",
                        )));
                    }
                }
                Some(timeout) => match tokio::time::timeout(timeout, changed).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        return Err(RpcError::Status(Status::unavailable(
                            "environment shut down",
                        )))
                    }
                    Err(_) => {
                        return Err(RpcError::Status(Status::deadline_exceeded(
                            "deadline expired while waiting for a ready target",
                        )))
                    }
                },
            }
            self.inner.transition(ChannelState::Connecting);
        };
        self.inner.transition(ChannelState::Ready);

        {
            let mut active = self.inner.active.lock().unwrap();
            active.retain(|h| h.terminal_status().is_none());
            active.push(handle.clone());
        }
        Ok(ClientCall::start(
            self.inner.env.clone(),
            self.inner.tracker.clone(),
            handle,
            method.to_string(),
            &resolved,
        ))
    }

    /// Shuts the channel down: cancels in-flight calls, waits for their
    /// completions to drain, then releases the shared environment.
    pub async fn shutdown(&self) -> Result<()> {
        let was_shut_down = !self.inner.state_tx.send_if_modified(|current| {
            if *current == ChannelState::Shutdown {
                return false;
            }
            *current = ChannelState::Shutdown;
            true
        });
        if was_shut_down {
            return Err(UsageError::AlreadyShutDown.into());
        }

        let handles: Vec<CallHandle> = self.inner.active.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.cancel(Status::cancelled("channel shut down"));
        }
        self.inner.tracker.drained().await;
        if self.inner.tracker.outstanding() > 0 {
            warn!(target = %self.inner.target, "completions outstanding after drain");
        }
        debug!(target = %self.inner.target, "channel shut down");
        Environment::release()?;
        Ok(())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.target)
            .field("state", &self.inner.state())
            .finish()
    }
}
