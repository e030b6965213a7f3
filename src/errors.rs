//! Typed error hierarchy for the coordination engine.
//!
//! - `RegistrationError`: rejected action registrations (non-fatal)
//! - `PlanError`: pre-flight failures raised before any action runs
//! - `CoordinationError`: everything `coordinate_and_run` can return
//! - `ContextError`: failures observed through a context (`wait_for`)
//! - `ActionError`: failures reported by action handlers

use conductor_common::{ActionId, IdError};
use thiserror::Error;
use uuid::Uuid;

/// Errors from registering an action under a topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("Malformed topic pattern '{pattern}': {reason}")]
    MalformedPattern { pattern: String, reason: String },

    #[error("Invalid action identifier: {0}")]
    InvalidActionId(#[from] IdError),
}

/// Pre-flight validation failures of a phase plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Dependency resolution error: {action} depends on {dependency}, which is not scheduled for this run")]
    DependencyResolution {
        action: ActionId,
        dependency: ActionId,
    },

    #[error("Phase dependency paradox: {action} (phase {action_phase}) depends on {dependency} (phase {dependency_phase})")]
    PhaseParadox {
        action: ActionId,
        action_phase: i32,
        dependency: ActionId,
        dependency_phase: i32,
    },

    #[error("No handlers for topic '{topic}'")]
    NoHandlers { topic: String },
}

/// Errors returned by `Engine::coordinate_and_run`.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Conflicting values for parameter '{name}' while matching '{topic}'")]
    ParamConflict { topic: String, name: String },

    #[error("Context {0} has already been coordinated")]
    AlreadyCoordinated(Uuid),

    #[error("Context {0} is closed")]
    ContextClosed(Uuid),
}

impl CoordinationError {
    /// Whether this failure means "nothing to do" rather than an internal fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Plan(PlanError::NoHandlers { .. }))
    }
}

/// Errors observed through a context while waiting on dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("Dependency {dependency} failed: {reason}")]
    DependencyFailed { dependency: ActionId, reason: String },

    #[error("Context {0} closed before dependencies completed")]
    Closed(Uuid),
}

/// Failure reported by an action handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("Action failed: {0}")]
    Failed(String),

    #[error("Action panicked: {0}")]
    Panicked(String),

    #[error("No handler registered for {0}")]
    Unregistered(ActionId),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
