//! Transparent retries driven by per-method policies.
//!
//! Outgoing messages are buffered so a failed attempt can be replayed on a
//! fresh call. A call commits once any response data arrives; committed
//! calls are never retried, whatever their final status.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tracing::debug;

use crate::channel::Channel;
use crate::client_call::{ClientCall, Terminal};
use crate::error::{Result, RpcError, UsageError};
use crate::options::CallOptions;
use crate::status::StatusCode;

/// One method's retry policy, typically parsed from the service config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the original one. At least 2.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling for the exponential backoff.
    pub max_backoff: Duration,
    /// Growth factor applied per retry.
    pub backoff_multiplier: f64,
    /// Status codes that trigger a retry.
    pub retryable_codes: Vec<StatusCode>,
}

impl RetryPolicy {
    /// Checks the policy's internal consistency.
    pub fn validate(&self) -> std::result::Result<(), UsageError> {
        if self.max_attempts < 2 {
            return Err(UsageError::InvalidRetryPolicy(
                "maxAttempts must be at least 2".into(),
            ));
        }
        if self.initial_backoff.is_zero() || self.max_backoff.is_zero() {
            return Err(UsageError::InvalidRetryPolicy(
                "backoff durations must be positive".into(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(UsageError::InvalidRetryPolicy(
                "backoffMultiplier must be at least 1".into(),
            ));
        }
        if self.retryable_codes.is_empty() {
            return Err(UsageError::InvalidRetryPolicy(
                "retryableStatusCodes must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Whether `code` is retryable under this policy.
    pub fn is_retryable(&self, code: StatusCode) -> bool {
        self.retryable_codes.contains(&code)
    }

    /// Deterministic backoff before retry number `retry_index` (0-based),
    /// before jitter.
    pub fn backoff_for(&self, retry_index: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry_index as i32);
        let backoff = self.initial_backoff.mul_f64(factor);
        backoff.min(self.max_backoff)
    }
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.8..=1.0))
}

struct RetryState {
    attempt: Arc<ClientCall>,
    buffered: Vec<Bytes>,
    writes_completed: bool,
    committed: bool,
}

/// A client call that transparently retries failed attempts.
///
/// The live attempt is also kept in `current`, outside the operation
/// mutex, so `cancel` can reach it while a read is suspended.
pub struct RetryingCall {
    channel: Channel,
    method: String,
    options: CallOptions,
    policy: RetryPolicy,
    state: tokio::sync::Mutex<RetryState>,
    current: std::sync::Mutex<Arc<ClientCall>>,
    attempts_made: AtomicU32,
    cancelled: AtomicBool,
}

impl RetryingCall {
    /// Starts a retrying call using the channel's configured policy for
    /// `method`. Fails when no policy is configured.
    pub async fn start(channel: &Channel, method: &str, options: CallOptions) -> Result<Self> {
        let policy = channel.retry_policy_for(method).ok_or_else(|| {
            UsageError::InvalidRetryPolicy(format!("no retry policy configured for {method}"))
        })?;
        Self::start_with_policy(channel, method, options, policy).await
    }

    /// Starts a retrying call with an explicit policy.
    pub async fn start_with_policy(
        channel: &Channel,
        method: &str,
        options: CallOptions,
        policy: RetryPolicy,
    ) -> Result<Self> {
        policy.validate()?;
        let attempt = Arc::new(channel.call(method, &options).await?);
        Ok(RetryingCall {
            channel: channel.clone(),
            method: method.to_string(),
            options,
            policy,
            state: tokio::sync::Mutex::new(RetryState {
                attempt: attempt.clone(),
                buffered: Vec::new(),
                writes_completed: false,
                committed: false,
            }),
            current: std::sync::Mutex::new(attempt),
            attempts_made: AtomicU32::new(1),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Retries if the policy allows it: replaces the attempt and replays
    /// buffered writes. Returns `false` when the failure must stand.
    async fn try_reattempt(&self, st: &mut RetryState, code: StatusCode) -> Result<bool> {
        let attempts_made = self.attempts_made.load(Ordering::SeqCst);
        if st.committed
            || self.cancelled.load(Ordering::SeqCst)
            || !self.policy.is_retryable(code)
            || attempts_made >= self.policy.max_attempts
        {
            return Ok(false);
        }
        let retry_index = attempts_made - 1;
        let backoff = jittered(self.policy.backoff_for(retry_index));
        debug!(
            method = %self.method,
            attempt = attempts_made + 1,
            backoff_ms = backoff.as_millis() as u64,
            "retrying call"
        );
        tokio::time::sleep(backoff).await;

        let attempt = Arc::new(self.channel.call(&self.method, &self.options).await?);
        self.attempts_made.fetch_add(1, Ordering::SeqCst);
        for payload in &st.buffered {
            attempt.send_message(payload.clone()).await?;
        }
        if st.writes_completed {
            attempt.complete_writes().await?;
        }
        {
            // A cancel that raced the new attempt must still take it down.
            let mut current = self.current.lock().unwrap();
            if self.cancelled.load(Ordering::SeqCst) {
                attempt.cancel();
                return Ok(false);
            }
            *current = attempt.clone();
        }
        st.attempt = attempt;
        Ok(true)
    }

    /// Sends one message, buffering it for replay on retry.
    pub async fn send_message(&self, payload: Bytes) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.writes_completed {
            return Err(UsageError::WritesAlreadyCompleted.into());
        }
        st.buffered.push(payload.clone());
        match st.attempt.send_message(payload).await {
            Ok(()) => Ok(()),
            Err(RpcError::Status(status)) => {
                if !self.try_reattempt(&mut st, status.code()).await? {
                    return Err(RpcError::Status(status));
                }
                // The replay already delivered this payload.
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Half-closes the request stream.
    pub async fn complete_writes(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.writes_completed {
            return Err(UsageError::WritesAlreadyCompleted.into());
        }
        st.writes_completed = true;
        st.attempt.complete_writes().await
    }

    /// Receives the next response message, retrying failed attempts that
    /// have not yet produced any response data.
    ///
    /// End-of-stream on the wire can mean either a clean close or a failed
    /// attempt that produced nothing; the attempt's terminal status
    /// disambiguates the two.
    pub async fn read_next(&self) -> Result<Option<Bytes>> {
        let mut st = self.state.lock().await;
        loop {
            match st.attempt.read_next().await {
                Ok(Some(message)) => {
                    st.committed = true;
                    return Ok(Some(message));
                }
                Ok(None) => {
                    let terminal = st.attempt.finished().await;
                    if terminal.status.is_ok() {
                        st.committed = true;
                        return Ok(None);
                    }
                    if !self.try_reattempt(&mut st, terminal.status.code()).await? {
                        return Ok(None);
                    }
                }
                Err(RpcError::Status(status)) => {
                    if !self.try_reattempt(&mut st, status.code()).await? {
                        return Err(RpcError::Status(status));
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Waits for the final outcome, retrying terminal failures the policy
    /// covers.
    pub async fn finished(&self) -> Result<Terminal> {
        let mut st = self.state.lock().await;
        loop {
            let terminal = st.attempt.finished().await;
            if terminal.status.is_ok() {
                return Ok(terminal);
            }
            if !self.try_reattempt(&mut st, terminal.status.code()).await? {
                return Ok(terminal);
            }
        }
    }

    /// Cancels the current attempt and unblocks any suspended operation;
    /// no further retries happen.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let current = self.current.lock().unwrap();
        current.cancel();
    }

    /// Attempts started so far.
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made.load(Ordering::SeqCst)
    }
}

/// Runs a unary exchange with retries: one request, one response.
pub async fn retry_unary(
    channel: &Channel,
    method: &str,
    request: Bytes,
    options: CallOptions,
) -> Result<(Option<Bytes>, Terminal)> {
    let call = match channel.retry_policy_for(method) {
        Some(policy) => {
            RetryingCall::start_with_policy(channel, method, options, policy).await?
        }
        None => {
            // No policy configured: a single attempt, same surface.
            let attempt = channel.call(method, &options).await?;
            attempt.send_message(request).await?;
            attempt.complete_writes().await?;
            let response = match attempt.read_next().await {
                Ok(message) => message,
                Err(RpcError::Status(_)) => None,
                Err(other) => return Err(other),
            };
            return Ok((response, attempt.finished().await));
        }
    };
    call.send_message(request).await?;
    call.complete_writes().await?;
    let response = match call.read_next().await {
        Ok(message) => message,
        Err(RpcError::Status(_)) => None,
        Err(other) => return Err(other),
    };
    let terminal = call.finished().await?;
    Ok((response, terminal))
}
