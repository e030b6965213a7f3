pub mod action;
pub mod bus;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod http;
pub mod manifest;
pub mod plan;
pub mod telemetry;
pub mod timeout;
pub mod topic;

pub use action::{ActionHandler, handler_fn};
pub use context::{Context, ContextState};
pub use engine::{Engine, EngineSettings};
pub use errors::{ActionError, CoordinationError, PlanError, RegistrationError};
