//! Topic matching.
//!
//! Actions are registered under hierarchical topic patterns such as
//! `http/get/users/:id`. A concrete topic is tested against every pattern;
//! the union of matching actions is scheduled and the named segments become
//! the run's path parameters. The same pattern syntax is used for event bus
//! subscriptions.

mod pattern;
mod registry;

pub use pattern::TopicPattern;
pub use registry::{TopicMatch, TopicRegistry};
