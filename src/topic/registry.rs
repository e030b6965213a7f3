//! Append-only registry of topic patterns and the actions registered under them.

use super::pattern::TopicPattern;
use crate::errors::RegistrationError;
use conductor_common::{ActionDescriptor, ActionId, Params};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

/// Result of matching a concrete topic against every registered pattern.
#[derive(Debug, Clone, Default)]
pub struct TopicMatch {
    /// Matched actions, deduplicated by id, in registration order
    pub actions: Vec<Arc<ActionDescriptor>>,
    /// Merged named-segment values; later matching patterns win
    pub params: Params,
    /// Parameter names whose value was overwritten by a later pattern
    pub collisions: Vec<String>,
}

impl TopicMatch {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug)]
struct Entry {
    pattern: TopicPattern,
    actions: Vec<Arc<ActionDescriptor>>,
}

/// Pattern → actions table.
///
/// Populated at load time and read concurrently afterwards. Entries are only
/// ever appended; [`TopicRegistry::clear`] exists for test teardown.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under a pattern.
    ///
    /// Returns `Ok(false)` when the action was already registered under the
    /// same pattern.
    pub fn register(
        &self,
        pattern: &str,
        action: Arc<ActionDescriptor>,
    ) -> Result<bool, RegistrationError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = entries.iter_mut().find(|e| e.pattern.as_str() == pattern) {
            let id = action.id();
            if entry.actions.iter().any(|a| a.id() == id) {
                return Ok(false);
            }
            entry.actions.push(action);
            return Ok(true);
        }

        let compiled = TopicPattern::compile(pattern)?;
        entries.push(Entry {
            pattern: compiled,
            actions: vec![action],
        });
        Ok(true)
    }

    /// Match a concrete topic against all patterns.
    pub fn match_all(&self, topic: &str) -> TopicMatch {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut result = TopicMatch::default();
        let mut seen: HashSet<ActionId> = HashSet::new();

        for entry in entries.iter() {
            let Some(params) = entry.pattern.captures(topic) else {
                continue;
            };

            for (name, value) in params {
                if let Some(previous) = result.params.insert(name.clone(), value.clone())
                    && previous != value
                {
                    result.collisions.push(name);
                }
            }

            for action in &entry.actions {
                if seen.insert(action.id()) {
                    result.actions.push(Arc::clone(action));
                }
            }
        }

        result
    }

    /// Registered patterns with the ids of their actions, in registration order.
    pub fn routes(&self) -> Vec<(String, Vec<ActionId>)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|e| {
                (
                    e.pattern.as_str().to_string(),
                    e.actions.iter().map(|a| a.id()).collect(),
                )
            })
            .collect()
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
