//! Parent-to-child context propagation.
//!
//! A server-side call can hand a propagation token to a child client call so
//! the child inherits the parent's deadline and cancellation. The token is a
//! one-way value copy of the deadline plus a one-way signal subscription for
//! cancellation; the child never holds a reference back to the parent call.

use crate::cancel::CancelToken;
use crate::deadline::Deadline;

/// Which aspects of the parent's context a token carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationOptions {
    /// Inherit the parent's deadline (default: true).
    pub propagate_deadline: bool,
    /// Cancel the child when the parent is cancelled (default: true).
    pub propagate_cancellation: bool,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        Self {
            propagate_deadline: true,
            propagate_cancellation: true,
        }
    }
}

/// A capability letting a child call inherit deadline/cancellation from a
/// parent call.
#[derive(Clone)]
pub struct PropagationToken {
    parent_deadline: Deadline,
    parent_cancel: CancelToken,
    options: PropagationOptions,
}

impl PropagationToken {
    pub(crate) fn new(
        parent_deadline: Deadline,
        parent_cancel: CancelToken,
        options: PropagationOptions,
    ) -> Self {
        Self {
            parent_deadline,
            parent_cancel,
            options,
        }
    }

    /// The parent's deadline, when deadline propagation is enabled.
    pub fn inherited_deadline(&self) -> Option<Deadline> {
        self.options
            .propagate_deadline
            .then_some(self.parent_deadline)
    }

    /// The parent's cancellation signal, when cancellation propagation is
    /// enabled.
    pub fn inherited_cancellation(&self) -> Option<CancelToken> {
        self.options
            .propagate_cancellation
            .then(|| self.parent_cancel.clone())
    }

    /// The propagation options this token was created with.
    pub fn options(&self) -> PropagationOptions {
        self.options
    }
}
