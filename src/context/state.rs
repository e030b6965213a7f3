//! Lifecycle state of a unit of work.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a context.
///
/// `Pending → Running → Done | Error`. `Done` and `Error` are terminal and
/// mutually exclusive: whichever is entered first sticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    /// Created, nothing has run yet
    #[default]
    Pending,
    /// Phases are executing or a completion signal has been observed
    Running,
    /// Every phase finished without an error
    Done,
    /// An action failed, the run timed out, or `error()` was called
    Error,
}

impl ContextState {
    /// Check if the context is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether moving from `self` to `to` is allowed.
    pub fn can_transition_to(&self, to: ContextState) -> bool {
        match (self, to) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, Self::Done | Self::Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}
