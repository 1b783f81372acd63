//! Per-call configuration and its normalization.
//!
//! Every field is optional. Normalizing resolves an explicit deadline or
//! cancellation signal against a propagation token's implied ones and
//! rejects the ambiguous case where both are independently specified.

use std::sync::Arc;

use crate::batch::WriteFlags;
use crate::cancel::CancelToken;
use crate::deadline::Deadline;
use crate::error::{Result, UsageError};
use crate::metadata::Metadata;
use crate::propagation::PropagationToken;

/// Supplies per-call credentials as metadata attached to the request.
pub trait CallCredentials: Send + Sync {
    /// Produces the metadata entries to attach.
    fn metadata(&self) -> Result<Metadata>;
}

/// Bearer-token credentials producing an `authorization` header.
pub struct BearerTokenCredentials {
    token: String,
}

impl BearerTokenCredentials {
    /// Creates credentials for the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CallCredentials for BearerTokenCredentials {
    fn metadata(&self) -> Result<Metadata> {
        let mut md = Metadata::new();
        md.add_ascii("authorization", format!("Bearer {}", self.token))?;
        Ok(md)
    }
}

/// Configuration for one call. All fields optional.
#[derive(Clone, Default)]
pub struct CallOptions {
    headers: Option<Metadata>,
    deadline: Option<Deadline>,
    cancel: Option<CancelToken>,
    write_flags: WriteFlags,
    propagation: Option<PropagationToken>,
    credentials: Option<Arc<dyn CallCredentials>>,
    wait_for_ready: bool,
    cacheable_request: bool,
}

impl CallOptions {
    /// Empty options: infinite deadline, no headers, no propagation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches request headers.
    pub fn with_headers(mut self, headers: Metadata) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Sets an explicit deadline. Conflicts with a deadline-propagating
    /// token at normalization time.
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attaches an explicit cancellation signal. Conflicts with a
    /// cancellation-propagating token at normalization time.
    pub fn with_cancellation(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Default write flags for messages on this call.
    pub fn with_write_flags(mut self, flags: WriteFlags) -> Self {
        self.write_flags = flags;
        self
    }

    /// Attaches a propagation token from a parent call.
    pub fn with_propagation(mut self, token: PropagationToken) -> Self {
        self.propagation = Some(token);
        self
    }

    /// Attaches per-call credentials.
    pub fn with_credentials(mut self, credentials: Arc<dyn CallCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Queue the call until the channel is ready instead of failing fast.
    pub fn with_wait_for_ready(mut self, wait: bool) -> Self {
        self.wait_for_ready = wait;
        self
    }

    /// Marks the request as cacheable by intermediaries.
    pub fn with_cacheable_request(mut self, cacheable: bool) -> Self {
        self.cacheable_request = cacheable;
        self
    }

    /// Default write flags.
    pub fn write_flags(&self) -> WriteFlags {
        self.write_flags
    }

    /// Whether the call waits for channel readiness.
    pub fn wait_for_ready(&self) -> bool {
        self.wait_for_ready
    }

    /// Whether the request is marked cacheable.
    pub fn cacheable_request(&self) -> bool {
        self.cacheable_request
    }

    /// Resolves explicit settings against the propagation token.
    pub fn normalize(&self) -> Result<ResolvedCallOptions> {
        let inherited_deadline = self
            .propagation
            .as_ref()
            .and_then(|t| t.inherited_deadline());
        let inherited_cancel = self
            .propagation
            .as_ref()
            .and_then(|t| t.inherited_cancellation());

        let deadline = match (self.deadline, inherited_deadline) {
            (Some(_), Some(_)) => return Err(UsageError::AmbiguousDeadline.into()),
            (Some(own), None) => own,
            (None, Some(parent)) => Deadline::infinite().min(parent),
            (None, None) => Deadline::infinite(),
        };
        let cancel = match (&self.cancel, inherited_cancel) {
            (Some(_), Some(_)) => return Err(UsageError::AmbiguousCancellation.into()),
            (Some(own), None) => Some(own.clone()),
            (None, parent) => parent,
        };

        let mut headers = self.headers.clone().unwrap_or_default();
        if let Some(credentials) = &self.credentials {
            headers.extend(&credentials.metadata()?);
        }

        Ok(ResolvedCallOptions {
            headers,
            deadline,
            cancel,
            write_flags: self.write_flags,
            wait_for_ready: self.wait_for_ready,
            cacheable_request: self.cacheable_request,
        })
    }
}

/// The effective settings a call runs with after normalization.
#[derive(Clone, Debug)]
pub struct ResolvedCallOptions {
    /// Request headers including credential metadata.
    pub headers: Metadata,
    /// Effective deadline (possibly infinite).
    pub deadline: Deadline,
    /// Effective cancellation signal, if any.
    pub cancel: Option<CancelToken>,
    /// Default write flags.
    pub write_flags: WriteFlags,
    /// Wait-for-ready flag.
    pub wait_for_ready: bool,
    /// Cacheable-request flag.
    pub cacheable_request: bool,
}
