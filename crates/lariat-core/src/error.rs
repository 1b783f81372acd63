//! Error taxonomy for the call lifecycle engine.
//!
//! RPC-level failures surface as a terminal [`Status`]; invalid API usage is
//! a local programming error raised synchronously at the call site and never
//! delivered asynchronously. The two must stay distinct.

use thiserror::Error;

use crate::status::Status;

/// Out-of-sequence or malformed API usage. Always raised synchronously.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// A write was issued after the outgoing direction was half-closed.
    #[error("writes were already completed on this call")]
    WritesAlreadyCompleted,

    /// A second write was issued while one was still pending.
    #[error("another write is already pending on this call")]
    ConcurrentWrite,

    /// A second read was issued while one was still pending.
    #[error("another read is already pending on this call")]
    ConcurrentRead,

    /// A read was issued after end-of-stream had been observed.
    #[error("the peer already half-closed; no further reads are possible")]
    ReadAfterEndOfStream,

    /// Response headers were sent a second time.
    #[error("response headers were already sent")]
    HeadersAlreadySent,

    /// Explicit response headers arrived after a message write.
    #[error("response headers must be sent before the first message write")]
    HeadersAfterFirstWrite,

    /// `finish` was called a second time.
    #[error("the call was already finished")]
    AlreadyFinished,

    /// The channel was shut down a second time.
    #[error("channel was already shut down")]
    AlreadyShutDown,

    /// An operation was issued on a shut-down channel.
    #[error("channel is disposed")]
    ChannelDisposed,

    /// The server was shut down a second time.
    #[error("server was already shut down")]
    ServerAlreadyShutDown,

    /// Another server already serves this target.
    #[error("target is already bound by another server: {0}")]
    TargetAlreadyBound(String),

    /// A state-change wait was issued with `Shutdown` as the baseline.
    #[error("Shutdown is terminal; waiting for a state change is meaningless")]
    WaitOnShutdownState,

    /// A deadline came from both the options and a propagation token.
    #[error("deadline specified both explicitly and via propagation token")]
    AmbiguousDeadline,

    /// A cancellation signal came from both the options and a propagation
    /// token.
    #[error("cancellation specified both explicitly and via propagation token")]
    AmbiguousCancellation,

    /// The same channel option name was set twice.
    #[error("duplicate channel option: {0}")]
    DuplicateChannelOption(String),

    /// The service config JSON could not be parsed or validated.
    #[error("invalid service config: {0}")]
    InvalidServiceConfig(String),

    /// A metadata key contained characters outside the allowed set.
    #[error("invalid metadata key: {0:?}")]
    InvalidMetadataKey(String),

    /// A binary value was added under a key without the `-bin` suffix.
    #[error("binary metadata value requires a key with the -bin suffix: {0:?}")]
    BinaryValueForAsciiKey(String),

    /// An ascii value was added under a `-bin` key.
    #[error("ascii metadata value not allowed for -bin key: {0:?}")]
    AsciiValueForBinaryKey(String),

    /// A retry policy failed validation.
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// The global environment was released more times than acquired.
    #[error("environment release without a matching acquire")]
    UnmatchedEnvironmentRelease,
}

/// Marshalling failure reported by an external marshaller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("marshalling failed: {0}")]
pub struct MarshalError(pub String);

/// Top-level error type for call operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The call terminated with a non-OK status.
    #[error("rpc failed: {0}")]
    Status(Status),

    /// The API was used out of sequence; a local bug, not an RPC outcome.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// Sender-side serialization failure, surfaced synchronously.
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

impl RpcError {
    /// Returns the terminal status if this is an RPC-level failure.
    pub fn status(&self) -> Option<&Status> {
        match self {
            RpcError::Status(status) => Some(status),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
