//! Integration scenarios for the lariat call-lifecycle engine.
//!
//! Each module exercises one slice of the engine end to end over the
//! in-process fabric: full call lifecycles, channel connectivity, deadline
//! and cancellation propagation, policy-driven retries, and typed
//! marshalling.

pub mod harness;

#[cfg(test)]
mod connectivity;
#[cfg(test)]
mod marshalling;
#[cfg(test)]
mod propagation;
#[cfg(test)]
mod retry_scenarios;

pub use harness::{init_tracing, unique_target};
