//! Absolute call deadlines with an infinite sentinel.
//!
//! A deadline only ever shrinks when propagated: a child call observes
//! `min(its own deadline, the inherited one)`. The infinite sentinel must
//! never be transmitted as a finite duration.

use std::time::{Duration, Instant};

/// An absolute point in time by which a call must complete.
///
/// The sentinel [`Deadline::infinite`] means "no deadline".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline expiring `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now().checked_add(timeout))
    }

    /// A deadline at the given absolute instant.
    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// The infinite sentinel: the call has no deadline.
    pub fn infinite() -> Self {
        Deadline(None)
    }

    /// Returns `true` for the infinite sentinel.
    pub fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    /// Returns `true` when a finite deadline has passed. Infinite deadlines
    /// never expire.
    pub fn is_expired(&self) -> bool {
        match self.0 {
            Some(instant) => Instant::now() >= instant,
            None => false,
        }
    }

    /// Remaining time until expiry, saturating at zero.
    ///
    /// Returns `None` for the infinite sentinel.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|instant| instant.saturating_duration_since(Instant::now()))
    }

    /// The absolute expiry instant, if finite.
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// The earlier of two deadlines. Propagation only shrinks.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) => Deadline(Some(a)),
            (None, b) => Deadline(b),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::infinite()
    }
}
