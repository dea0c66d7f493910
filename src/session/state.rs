//! Session state machine
//!
//! ```text
//! Closed → Connecting → Connected → Ending → Closed
//!              │             │
//!              └──── Closed ←┘   (unexpected close/end/error)
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Closed,
    Connecting,
    Connected,
    Ending,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Closed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Closed)
                | (Connecting, Ending)
                | (Connected, Ending)
                | (Connected, Closed)
                | (Ending, Closed)
        )
    }
}

/// Who reacted to the most recent termination signal.
///
/// Replaces per-signal "handled" booleans: a signal is either caught by a
/// running operation or by the session-wide fallback, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationHandling {
    Unhandled,
    /// Delivered to the operations in flight
    Scoped,
    /// No operation was running; the fallback cleared the channel
    Global,
}
