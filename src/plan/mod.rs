//! Phase planning for a coordination run.
//!
//! The planner takes the actions matched for a topic, groups them by their
//! declared phase, and validates the result before anything executes:
//!
//! 1. **Build** - phase number → set of action ids, with each action's
//!    descriptor resolved once so later stages never look it up again
//! 2. **Validate** - every dependency must be scheduled in the same run at
//!    the same or an earlier phase, and at least one non-middleware action
//!    must be present
//!
//! ## Example
//!
//! ```
//! use conductor::plan::PlanBuilder;
//! use conductor_common::{ActionDescriptor, ActionId};
//! use std::sync::Arc;
//!
//! let actions = vec![
//!     Arc::new(ActionDescriptor::new("m", "A").with_phase(0)),
//!     Arc::new(
//!         ActionDescriptor::new("m", "B")
//!             .with_phase(1)
//!             .depends_on(ActionId::new("m", "A")),
//!     ),
//! ];
//!
//! let plan = PlanBuilder::new(actions).build();
//! plan.validate("/x").unwrap();
//! assert_eq!(plan.phase_numbers(), vec![0, 1]);
//! ```

use crate::errors::PlanError;
use conductor_common::{ActionDescriptor, ActionId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Phase number → scheduled actions, plus the descriptors they came from.
#[derive(Debug, Clone, Default)]
pub struct PhasePlan {
    /// Scheduled actions per phase, ascending
    phases: BTreeMap<i32, BTreeSet<ActionId>>,
    /// Descriptor of every scheduled action
    actions: HashMap<ActionId, Arc<ActionDescriptor>>,
}

impl PhasePlan {
    /// Total number of scheduled actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Phases in ascending order with their actions.
    pub fn phases(&self) -> impl Iterator<Item = (i32, &BTreeSet<ActionId>)> {
        self.phases.iter().map(|(phase, ids)| (*phase, ids))
    }

    pub fn phase_numbers(&self) -> Vec<i32> {
        self.phases.keys().copied().collect()
    }

    /// Phase an action is scheduled at, if it is scheduled at all.
    pub fn phase_of(&self, id: &ActionId) -> Option<i32> {
        self.actions.get(id).map(|a| a.phase)
    }

    pub fn action(&self, id: &ActionId) -> Option<&Arc<ActionDescriptor>> {
        self.actions.get(id)
    }

    /// Number of scheduled actions that are not middleware.
    pub fn handler_count(&self) -> usize {
        self.actions.values().filter(|a| !a.middleware).count()
    }

    /// Slowest declared per-action timeout.
    pub fn max_timeout(&self) -> Option<Duration> {
        self.actions.values().filter_map(|a| a.timeout).max()
    }

    /// Check the plan before any action runs.
    ///
    /// - every dependency must be scheduled in this run
    /// - no dependency may be scheduled at a later phase than its dependent
    /// - at least one non-middleware action must be scheduled
    pub fn validate(&self, topic: &str) -> Result<(), PlanError> {
        for (phase, ids) in &self.phases {
            for id in ids {
                let Some(action) = self.actions.get(id) else {
                    continue;
                };
                for dependency in &action.depends_on {
                    let dependency_phase = self.phase_of(dependency).ok_or_else(|| {
                        PlanError::DependencyResolution {
                            action: id.clone(),
                            dependency: dependency.clone(),
                        }
                    })?;

                    if dependency_phase > *phase {
                        return Err(PlanError::PhaseParadox {
                            action: id.clone(),
                            action_phase: *phase,
                            dependency: dependency.clone(),
                            dependency_phase,
                        });
                    }
                }
            }
        }

        if self.handler_count() == 0 {
            return Err(PlanError::NoHandlers {
                topic: topic.to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for PhasePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (phase, ids) in &self.phases {
            let names: Vec<String> = ids
                .iter()
                .map(|id| match self.actions.get(id) {
                    Some(a) if a.middleware => format!("{} (middleware)", id),
                    _ => id.to_string(),
                })
                .collect();
            writeln!(f, "phase {}: {}", phase, names.join(", "))?;
        }
        Ok(())
    }
}

/// Builder for phase plans.
pub struct PlanBuilder {
    actions: Vec<Arc<ActionDescriptor>>,
}

impl PlanBuilder {
    /// Create a new builder with the matched actions.
    pub fn new(actions: Vec<Arc<ActionDescriptor>>) -> Self {
        Self { actions }
    }

    /// Group the actions by phase.
    ///
    /// Duplicate ids keep the first descriptor. The plan is not validated;
    /// call [`PhasePlan::validate`] before executing it.
    pub fn build(self) -> PhasePlan {
        let mut plan = PhasePlan::default();

        for action in self.actions {
            let id = action.id();
            if plan.actions.contains_key(&id) {
                continue;
            }
            plan.phases.entry(action.phase).or_default().insert(id.clone());
            plan.actions.insert(id, action);
        }

        tracing::debug!(
            actions = plan.len(),
            phases = ?plan.phase_numbers(),
            "built phase plan"
        );

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str, phase: i32, deps: &[&str]) -> Arc<ActionDescriptor> {
        let mut a = ActionDescriptor::new("m", name).with_phase(phase);
        for dep in deps {
            a = a.depends_on(ActionId::new("m", *dep));
        }
        Arc::new(a)
    }

    fn id(name: &str) -> ActionId {
        ActionId::new("m", name)
    }

    #[test]
    fn test_build_groups_by_phase() {
        let plan = PlanBuilder::new(vec![
            action("C", 5, &[]),
            action("A", 0, &[]),
            action("B", 0, &[]),
        ])
        .build();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.phase_numbers(), vec![0, 5]);
        let phases: Vec<(i32, Vec<ActionId>)> = plan
            .phases()
            .map(|(p, ids)| (p, ids.iter().cloned().collect()))
            .collect();
        assert_eq!(phases[0], (0, vec![id("A"), id("B")]));
        assert_eq!(phases[1], (5, vec![id("C")]));
    }

    #[test]
    fn test_build_deduplicates_ids() {
        let plan = PlanBuilder::new(vec![action("A", 0, &[]), action("A", 9, &[])]).build();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.phase_of(&id("A")), Some(0));
    }

    #[test]
    fn test_valid_dependency_chain() {
        let plan = PlanBuilder::new(vec![action("A", 0, &[]), action("B", 1, &["A"])]).build();
        assert!(plan.validate("/x").is_ok());
    }

    #[test]
    fn test_same_phase_dependency_is_allowed() {
        let plan = PlanBuilder::new(vec![action("A", 3, &[]), action("B", 3, &["A"])]).build();
        assert!(plan.validate("/x").is_ok());
    }

    #[test]
    fn test_dependency_at_earlier_phase_is_not_a_paradox() {
        // A (phase 1) after its dependency B (phase 0) is the ordinary case
        let plan = PlanBuilder::new(vec![action("A", 1, &["B"]), action("B", 0, &[])]).build();
        assert!(plan.validate("/x").is_ok());
        assert_eq!(plan.phase_numbers(), vec![0, 1]);
    }

    #[test]
    fn test_phase_paradox() {
        let plan = PlanBuilder::new(vec![action("A", 0, &["B"]), action("B", 1, &[])]).build();
        let err = plan.validate("/x").unwrap_err();
        assert_eq!(
            err,
            PlanError::PhaseParadox {
                action: id("A"),
                action_phase: 0,
                dependency: id("B"),
                dependency_phase: 1,
            }
        );
    }

    #[test]
    fn test_missing_dependency() {
        let plan = PlanBuilder::new(vec![action("A", 0, &["nonexistent"])]).build();
        let err = plan.validate("/x").unwrap_err();
        assert_eq!(
            err,
            PlanError::DependencyResolution {
                action: id("A"),
                dependency: id("nonexistent"),
            }
        );
    }

    #[test]
    fn test_no_handlers_when_only_middleware() {
        let mw = Arc::new(ActionDescriptor::new("auth", "session").with_middleware(true));
        let plan = PlanBuilder::new(vec![mw]).build();
        assert_eq!(plan.handler_count(), 0);
        assert_eq!(
            plan.validate("/y").unwrap_err(),
            PlanError::NoHandlers {
                topic: "/y".to_string()
            }
        );
    }

    #[test]
    fn test_empty_plan_has_no_handlers() {
        let plan = PlanBuilder::new(vec![]).build();
        assert!(plan.is_empty());
        assert!(matches!(
            plan.validate("/nothing"),
            Err(PlanError::NoHandlers { .. })
        ));
    }

    #[test]
    fn test_max_timeout() {
        let plan = PlanBuilder::new(vec![
            Arc::new(ActionDescriptor::new("m", "a").with_timeout(Duration::from_millis(200))),
            Arc::new(ActionDescriptor::new("m", "b").with_timeout(Duration::from_millis(900))),
            Arc::new(ActionDescriptor::new("m", "c")),
        ])
        .build();
        assert_eq!(plan.max_timeout(), Some(Duration::from_millis(900)));

        let plan = PlanBuilder::new(vec![action("A", 0, &[])]).build();
        assert_eq!(plan.max_timeout(), None);
    }

    #[test]
    fn test_display_lists_phases() {
        let mw = Arc::new(ActionDescriptor::new("auth", "session").with_phase(0).with_middleware(true));
        let plan = PlanBuilder::new(vec![mw, action("A", 1, &[])]).build();
        assert_eq!(
            plan.to_string(),
            "phase 0: auth/session (middleware)\nphase 1: m/A\n"
        );
    }
}
