//! Declarative actions from `[[actions]]` in conductor.toml.
//!
//! A manifest action carries no code of its own: its handler waits
//! `delay_ms`, then either fails with `fail` or merges `data` into the
//! context's data bag. This is enough to describe routes, phases and
//! dependencies without writing a handler.

use crate::action::ActionHandler;
use crate::context::Context;
use crate::engine::Engine;
use crate::errors::ActionError;
use async_trait::async_trait;
use conductor_common::{ActionDescriptor, ActionId, IdError, Params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// One `[[actions]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestAction {
    pub module: String,
    pub name: String,
    /// Pattern the action is registered under
    pub topic: String,
    /// Defaults to `[engine] default_phase`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<i32>,
    #[serde(default)]
    pub middleware: bool,
    /// `module/name` identifiers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Simulated work before the action completes
    #[serde(default)]
    pub delay_ms: u64,
    /// Fail the action with this message instead of completing it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail: Option<String>,
    /// Merged into the context data bag on success
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl ManifestAction {
    pub fn id(&self) -> ActionId {
        ActionId::new(self.module.as_str(), self.name.as_str())
    }

    /// Build the descriptor, rejecting malformed dependency ids.
    pub fn descriptor(&self, default_phase: i32) -> Result<ActionDescriptor, IdError> {
        let mut descriptor = ActionDescriptor::new(self.module.as_str(), self.name.as_str())
            .with_phase(self.phase.unwrap_or(default_phase))
            .with_middleware(self.middleware);

        for dep in &self.depends_on {
            descriptor = descriptor.depends_on(dep.parse()?);
        }
        if let Some(ms) = self.timeout_ms {
            descriptor = descriptor.with_timeout(Duration::from_millis(ms));
        }
        Ok(descriptor)
    }

    pub fn handler(&self) -> Arc<dyn ActionHandler> {
        Arc::new(ManifestHandler {
            delay: Duration::from_millis(self.delay_ms),
            fail: self.fail.clone(),
            data: self.data.clone(),
        })
    }
}

struct ManifestHandler {
    delay: Duration,
    fail: Option<String>,
    data: Map<String, Value>,
}

#[async_trait]
impl ActionHandler for ManifestHandler {
    async fn handle(&self, ctx: Arc<Context>, _params: Params) -> Result<(), ActionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.fail {
            return Err(ActionError::failed(message.clone()));
        }

        let mut bag = ctx.data();
        for (key, value) in &self.data {
            bag.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

/// Register every manifest action on `engine`, returning how many were added.
///
/// Entries that fail to register are logged and skipped.
pub fn register_all(engine: &Engine, actions: &[ManifestAction], default_phase: i32) -> usize {
    let mut registered = 0;
    for action in actions {
        let descriptor = match action.descriptor(default_phase) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(action = %action.id(), error = %e, "manifest action skipped");
                continue;
            }
        };
        if let Ok(true) = engine.register_action(&action.topic, descriptor, action.handler()) {
            registered += 1;
        }
    }
    tracing::info!(registered, declared = actions.len(), "manifest actions loaded");
    registered
}
