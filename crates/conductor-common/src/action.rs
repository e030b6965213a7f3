//! Action identity and descriptor types.

use crate::error::IdError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Phase assigned to actions that do not declare one.
///
/// Phases are ordered ascending, so the mid-range default leaves room for
/// middleware to run before (lower) or after (higher) ordinary handlers.
pub const DEFAULT_PHASE: i32 = 50;

/// Named path parameters extracted from a topic.
pub type Params = BTreeMap<String, String>;

/// Strongly-typed `module/name` identifier of an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionId {
    module: String,
    name: String,
}

impl ActionId {
    /// Build an identifier without validating its parts.
    ///
    /// Use [`ActionId::validate`] (or parse from a string) when the parts
    /// come from untrusted input.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check that both parts are non-empty and safe to embed in a topic.
    pub fn validate(&self) -> Result<(), IdError> {
        for (part, value) in [("module", &self.module), ("name", &self.name)] {
            if value.is_empty() {
                return Err(IdError::Empty { part });
            }
            if value.contains('/') {
                return Err(IdError::NestedSeparator {
                    part,
                    value: value.clone(),
                });
            }
            if value.starts_with(':') || value.contains('*') {
                return Err(IdError::Reserved {
                    part,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.name)
    }
}

impl FromStr for ActionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (module, name) = s
            .split_once('/')
            .ok_or_else(|| IdError::MissingSeparator(s.to_string()))?;
        let id = Self::new(module, name);
        id.validate()?;
        Ok(id)
    }
}

impl TryFrom<String> for ActionId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActionId> for String {
    fn from(id: ActionId) -> Self {
        id.to_string()
    }
}

/// Descriptor of a registered action.
///
/// Descriptors are built once at load time and never mutated after
/// registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    /// Owning module identifier
    pub module: String,
    /// Action name, unique within its module
    pub name: String,
    /// Execution tier; lower phases run first and may be negative
    pub phase: i32,
    /// Pattern this action was first registered under
    ///
    /// Later registrations of the same id under other patterns add routes
    /// but leave this descriptor untouched.
    pub topic: String,
    /// Middleware does not count as a handler for not-found purposes
    pub middleware: bool,
    /// Actions that must complete in the same run before this one
    pub depends_on: Vec<ActionId>,
    /// Longest time this action is expected to take
    pub timeout: Option<Duration>,
}

impl ActionDescriptor {
    /// Create a descriptor with the default phase and no dependencies.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            phase: DEFAULT_PHASE,
            topic: String::new(),
            middleware: false,
            depends_on: Vec::new(),
            timeout: None,
        }
    }

    /// The `module/name` identifier of this action.
    pub fn id(&self) -> ActionId {
        ActionId::new(self.module.clone(), self.name.clone())
    }

    pub fn with_phase(mut self, phase: i32) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_middleware(mut self, middleware: bool) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn depends_on(mut self, dependency: ActionId) -> Self {
        self.depends_on.push(dependency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action_id() {
        let id: ActionId = "users/load".parse().unwrap();
        assert_eq!(id.module(), "users");
        assert_eq!(id.name(), "load");
        assert_eq!(id.to_string(), "users/load");
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        let err = "users".parse::<ActionId>().unwrap_err();
        assert_eq!(err, IdError::MissingSeparator("users".to_string()));
    }

    #[test]
    fn test_parse_rejects_empty_and_nested_parts() {
        assert!(matches!(
            "/load".parse::<ActionId>(),
            Err(IdError::Empty { part: "module" })
        ));
        assert!(matches!(
            "users/".parse::<ActionId>(),
            Err(IdError::Empty { part: "name" })
        ));
        assert!(matches!(
            "users/load/extra".parse::<ActionId>(),
            Err(IdError::NestedSeparator { part: "name", .. })
        ));
    }

    #[test]
    fn test_parse_rejects_reserved_topic_characters() {
        assert!(matches!(
            ":users/load".parse::<ActionId>(),
            Err(IdError::Reserved { part: "module", .. })
        ));
        assert!(matches!(
            "users/lo*d".parse::<ActionId>(),
            Err(IdError::Reserved { part: "name", .. })
        ));
    }

    #[test]
    fn test_action_id_ordering_is_module_then_name() {
        let mut ids = vec![
            ActionId::new("b", "a"),
            ActionId::new("a", "z"),
            ActionId::new("a", "b"),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["a/b", "a/z", "b/a"]);
    }

    #[test]
    fn test_action_id_serde_as_string() {
        let id = ActionId::new("auth", "session");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""auth/session""#);

        let parsed: ActionId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);

        assert!(serde_json::from_str::<ActionId>(r#""no-separator""#).is_err());
    }

    #[test]
    fn test_descriptor_defaults() {
        let action = ActionDescriptor::new("users", "load");
        assert_eq!(action.phase, DEFAULT_PHASE);
        assert!(!action.middleware);
        assert!(action.depends_on.is_empty());
        assert!(action.timeout.is_none());
        assert_eq!(action.id(), ActionId::new("users", "load"));
    }

    #[test]
    fn test_descriptor_builder() {
        let action = ActionDescriptor::new("users", "render")
            .with_phase(90)
            .with_middleware(true)
            .depends_on(ActionId::new("users", "load"))
            .with_timeout(Duration::from_secs(2));

        assert_eq!(action.phase, 90);
        assert!(action.middleware);
        assert_eq!(action.depends_on, vec![ActionId::new("users", "load")]);
        assert_eq!(action.timeout, Some(Duration::from_secs(2)));
    }
}
