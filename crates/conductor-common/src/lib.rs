//! Shared domain types for the Conductor coordination engine.
//!
//! These types are used by the engine, the HTTP surface and the CLI, and are
//! kept free of any runtime dependency so they can be shared by tooling that
//! only needs to describe actions.

mod action;
mod error;

pub use action::{ActionDescriptor, ActionId, DEFAULT_PHASE, Params};
pub use error::IdError;
