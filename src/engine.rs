//! The coordination engine.
//!
//! An [`Engine`] owns the topic registry, the module registry and the event
//! bus. Coordinating a context goes through two stages:
//!
//! 1. **Prepare** - match the context's topic, build the phase plan and
//!    validate it. Every failure here is returned to the caller and no
//!    action has been triggered.
//! 2. **Execute** - run the plan phase by phase over the bus. Failures from
//!    here on are only visible through the context state.

use crate::action::{ActionHandler, ModuleRegistry};
use crate::bus::EventBus;
use crate::config::ConductorConfig;
use crate::context::Context;
use crate::dispatcher::{self, DispatcherHandle};
use crate::errors::{CoordinationError, RegistrationError};
use crate::executor::{ExecutionResult, PhaseExecutor};
use crate::plan::{PhasePlan, PlanBuilder};
use crate::timeout::{self, ResponseSlot, SupervisorHandle};
use crate::topic::{TopicMatch, TopicRegistry};
use conductor_common::{ActionDescriptor, ActionId, Params};
use std::sync::Arc;
use std::time::Duration;

/// Settings the engine reads at runtime.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Fail coordination when matching patterns disagree on a parameter
    pub strict_params: bool,
    /// Deadline when no matched action declares a timeout
    pub default_timeout: Duration,
    /// Deadline applied by a supervisor bump
    pub rolling_window: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&ConductorConfig::default())
    }
}

impl EngineSettings {
    /// Create from a loaded configuration.
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            strict_params: config.engine.strict_params,
            default_timeout: config.timeouts.default_timeout(),
            rolling_window: config.timeouts.rolling_window(),
        }
    }

    pub fn with_strict_params(mut self, strict: bool) -> Self {
        self.strict_params = strict;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Topic matching, planning and execution for registered actions.
pub struct Engine {
    settings: EngineSettings,
    bus: EventBus,
    topics: TopicRegistry,
    modules: Arc<ModuleRegistry>,
    executor: PhaseExecutor,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        let bus = EventBus::new();
        Self {
            settings,
            executor: PhaseExecutor::new(bus.clone()),
            bus,
            topics: TopicRegistry::new(),
            modules: Arc::new(ModuleRegistry::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Register `handler` for `descriptor` under a topic pattern.
    ///
    /// Returns `Ok(false)` when the action is already registered under this
    /// pattern. A rejected registration is logged and leaves the engine
    /// unchanged.
    pub fn register_action(
        &self,
        pattern: &str,
        descriptor: ActionDescriptor,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<bool, RegistrationError> {
        let result = self.try_register(pattern, descriptor, handler);
        if let Err(e) = &result {
            tracing::warn!(pattern = %pattern, error = %e, "action registration skipped");
        }
        result
    }

    fn try_register(
        &self,
        pattern: &str,
        mut descriptor: ActionDescriptor,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<bool, RegistrationError> {
        let id = descriptor.id();
        id.validate()?;
        // Compile before touching either registry so a bad pattern registers nothing
        crate::topic::TopicPattern::compile(pattern)?;

        // Repeat registrations of an id add routes but keep the first descriptor
        let descriptor = match self.modules.lookup(&id) {
            Some(existing) => existing.descriptor,
            None => {
                descriptor.topic = pattern.to_string();
                let descriptor = Arc::new(descriptor);
                self.modules.insert(Arc::clone(&descriptor), handler);
                descriptor
            }
        };

        let added = self.topics.register(pattern, descriptor)?;
        if added {
            tracing::debug!(pattern = %pattern, action = %id, "action registered");
        }
        Ok(added)
    }

    /// Every registered action matching `topic`, with extracted parameters.
    pub fn match_topic(&self, topic: &str) -> TopicMatch {
        self.topics.match_all(topic)
    }

    /// Build and validate the plan for `topic` without running anything.
    pub fn plan_for(&self, topic: &str) -> Result<(PhasePlan, Params), CoordinationError> {
        let matched = self.match_topic(topic);

        if self.settings.strict_params
            && let Some(name) = matched.collisions.first()
        {
            return Err(CoordinationError::ParamConflict {
                topic: topic.to_string(),
                name: name.clone(),
            });
        }
        for name in &matched.collisions {
            tracing::debug!(topic = %topic, param = %name, "parameter collision, later pattern wins");
        }

        let plan = PlanBuilder::new(matched.actions).build();
        plan.validate(topic)?;
        Ok((plan, matched.params))
    }

    /// Create a context for a topic occurrence, sharing the engine's bus.
    pub fn create_context(&self, topic: impl Into<String>) -> Arc<Context> {
        Context::new(topic, self.bus.clone())
    }

    /// Plan `ctx` and install the plan on it.
    ///
    /// Nothing is triggered. A plan error moves the context to `error`.
    pub fn prepare(&self, ctx: &Arc<Context>) -> Result<(), CoordinationError> {
        if ctx.is_closed() {
            return Err(CoordinationError::ContextClosed(ctx.id()));
        }
        if ctx.phase_map().is_some() {
            return Err(CoordinationError::AlreadyCoordinated(ctx.id()));
        }

        let (plan, params) = match self.plan_for(ctx.topic()) {
            Ok(planned) => planned,
            Err(e) => {
                tracing::debug!(context = %ctx.id(), topic = %ctx.topic(), error = %e, "coordination rejected");
                ctx.error();
                return Err(e);
            }
        };

        if !ctx.install_plan(plan, params) {
            return Err(CoordinationError::AlreadyCoordinated(ctx.id()));
        }
        Ok(())
    }

    /// Run the plan installed by [`Engine::prepare`].
    ///
    /// A context that was never prepared has an empty plan and goes straight
    /// to `done`.
    pub async fn execute(&self, ctx: &Arc<Context>) -> ExecutionResult {
        let params = ctx.url_params();
        let empty = PhasePlan::default();
        let plan = ctx.phase_map().unwrap_or(&empty);
        let result = self.executor.run(ctx, plan, &params).await;
        tracing::debug!(
            context = %ctx.id(),
            state = %result.state,
            phases = result.phases_run,
            elapsed_ms = result.duration.as_millis() as u64,
            "coordination finished"
        );
        result
    }

    /// Plan and run `ctx` to completion.
    ///
    /// Pre-flight failures are returned; once execution starts this resolves
    /// whether the context ends `done` or `error`.
    pub async fn coordinate_and_run(&self, ctx: &Arc<Context>) -> Result<ExecutionResult, CoordinationError> {
        self.prepare(ctx)?;
        Ok(self.execute(ctx).await)
    }

    /// Arm a timeout supervisor for a prepared context.
    ///
    /// The deadline is the slowest declared action timeout in the plan, or
    /// the configured default.
    pub fn supervise(&self, ctx: &Arc<Context>, slot: Arc<ResponseSlot>) -> SupervisorHandle {
        let deadline = ctx
            .phase_map()
            .and_then(PhasePlan::max_timeout)
            .unwrap_or(self.settings.default_timeout);
        timeout::supervise(ctx, slot, deadline, self.settings.rolling_window)
    }

    /// Start running handlers for triggers published on this engine's bus.
    pub fn start(&self) -> Result<DispatcherHandle, RegistrationError> {
        dispatcher::spawn(&self.bus, Arc::clone(&self.modules))
    }

    /// Registered patterns with their actions, in registration order.
    pub fn routes(&self) -> Vec<(String, Vec<ActionId>)> {
        self.topics.routes()
    }

    pub fn action_count(&self) -> usize {
        self.modules.len()
    }

    /// Forget every registration.
    pub fn clear(&self) {
        self.topics.clear();
        self.modules.clear();
    }
}
