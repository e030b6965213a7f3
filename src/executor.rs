//! Phase executor.
//!
//! Runs a validated [`PhasePlan`] against a context. Phases run strictly in
//! ascending order. Inside a phase every action is triggered before any is
//! awaited, then the executor joins on all of them. A failed action is only
//! observed through the context state; the executor never raises it.

use crate::bus::{BusEvent, EventBus, Subscription, Trigger, topics};
use crate::context::{self, Context, ContextState};
use crate::plan::PhasePlan;
use conductor_common::{ActionId, Params};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Progress events emitted while a plan runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseEvent {
    /// Every action of the phase has been triggered.
    PhaseStarted { phase: i32, actions: Vec<ActionId> },
    /// Every action of the phase has finished or been abandoned.
    PhaseCompleted { phase: i32, state: ContextState },
    /// The run ended.
    RunCompleted { state: ContextState, phases_run: usize },
}

/// How a single action's wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Done,
    Failed(String),
    /// The context became terminal or was closed first
    Abandoned,
}

/// Result of running a plan.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub state: ContextState,
    pub phases_run: usize,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.state == ContextState::Done
    }
}

/// Drives plans over the event bus.
#[derive(Clone)]
pub struct PhaseExecutor {
    bus: EventBus,
    event_tx: Option<mpsc::UnboundedSender<PhaseEvent>>,
}

impl PhaseExecutor {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            event_tx: None,
        }
    }

    /// Report progress on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PhaseEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, event: PhaseEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run every phase of `plan` for `ctx`.
    ///
    /// Moves the context to `running`, and to `done` if no phase left it
    /// terminal. Stops after the first phase that ends with the context
    /// terminal or closed.
    pub async fn run(&self, ctx: &Arc<Context>, plan: &PhasePlan, params: &Params) -> ExecutionResult {
        let started = Instant::now();
        let mut phases_run = 0;
        ctx.start();

        for (phase, ids) in plan.phases() {
            if ctx.state().is_terminal() || ctx.is_closed() {
                break;
            }

            let mut waits = Vec::with_capacity(ids.len());
            for id in ids {
                // Subscribe before triggering so a fast handler cannot finish unseen
                let subscription = match self.bus.subscribe(&topics::completion(ctx.id(), id)) {
                    Ok(sub) => sub,
                    Err(e) => {
                        ctx.action_error(id, e.to_string());
                        continue;
                    }
                };
                self.bus.publish(
                    topics::trigger(id),
                    BusEvent::Trigger(Trigger {
                        context: Arc::clone(ctx),
                        action: id.clone(),
                        params: params.clone(),
                    }),
                );
                waits.push(await_completion(ctx, subscription));
            }

            tracing::debug!(context = %ctx.id(), phase, actions = ids.len(), "phase started");
            self.emit(PhaseEvent::PhaseStarted {
                phase,
                actions: ids.iter().cloned().collect(),
            });

            let outcomes = join_all(waits).await;
            phases_run += 1;

            let failed = outcomes
                .iter()
                .filter(|c| matches!(c, Completion::Failed(_)))
                .count();
            tracing::debug!(
                context = %ctx.id(),
                phase,
                failed,
                state = %ctx.state(),
                "phase completed"
            );
            self.emit(PhaseEvent::PhaseCompleted {
                phase,
                state: ctx.state(),
            });
        }

        if !ctx.is_closed() {
            ctx.done();
        }

        let state = ctx.state();
        self.emit(PhaseEvent::RunCompleted { state, phases_run });

        ExecutionResult {
            state,
            phases_run,
            duration: started.elapsed(),
        }
    }
}

/// Wait for one action's done or error signal, or for the context to end.
async fn await_completion(ctx: &Context, mut subscription: Subscription) -> Completion {
    let mut ledger = ctx.watch();
    tokio::select! {
        envelope = subscription.recv() => match envelope.map(|e| e.event) {
            Some(BusEvent::ActionDone { .. }) => Completion::Done,
            Some(BusEvent::ActionError { reason, .. }) => Completion::Failed(reason),
            _ => Completion::Abandoned,
        },
        _ = context::wait_terminal(&mut ledger) => Completion::Abandoned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ModuleRegistry, handler_fn};
    use crate::dispatcher;
    use crate::errors::ActionError;
    use crate::plan::PlanBuilder;
    use conductor_common::{ActionDescriptor, DEFAULT_PHASE};
    use std::sync::Mutex;

    struct Harness {
        bus: EventBus,
        modules: Arc<ModuleRegistry>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                bus: EventBus::new(),
                modules: Arc::new(ModuleRegistry::new()),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn action(&self, descriptor: ActionDescriptor, fail: bool) -> Arc<ActionDescriptor> {
            let descriptor = Arc::new(descriptor);
            let log = Arc::clone(&self.log);
            let name = descriptor.id().to_string();
            self.modules.insert(
                Arc::clone(&descriptor),
                handler_fn(move |_ctx, _params| {
                    let log = Arc::clone(&log);
                    let name = name.clone();
                    async move {
                        log.lock().unwrap().push(name.clone());
                        if fail {
                            return Err(ActionError::failed(format!("{} failed", name)));
                        }
                        Ok(())
                    }
                }),
            );
            descriptor
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_phases_run_in_ascending_order() {
        let h = Harness::new();
        let actions = vec![
            h.action(ActionDescriptor::new("m", "late").with_phase(90), false),
            h.action(ActionDescriptor::new("m", "early").with_phase(0), false),
            h.action(ActionDescriptor::new("m", "middle").with_phase(50), false),
        ];
        let _dispatcher = dispatcher::spawn(&h.bus, Arc::clone(&h.modules)).unwrap();

        let plan = PlanBuilder::new(actions).build();
        let ctx = Context::new("/x", h.bus.clone());
        let result = PhaseExecutor::new(h.bus.clone())
            .run(&ctx, &plan, &Params::new())
            .await;

        assert!(result.success());
        assert_eq!(result.phases_run, 3);
        assert_eq!(h.log(), vec!["m/early", "m/middle", "m/late"]);
        assert_eq!(ctx.action_log().len(), 3);
    }

    #[tokio::test]
    async fn test_same_phase_actions_are_all_triggered_before_awaiting() {
        let bus = EventBus::new();
        let modules = Arc::new(ModuleRegistry::new());
        let waiter = Arc::new(ActionDescriptor::new("m", "A").with_phase(0));
        let peer = Arc::new(ActionDescriptor::new("m", "B").with_phase(0));
        modules.insert(
            Arc::clone(&waiter),
            handler_fn(|ctx, _params| async move {
                ctx.wait_for(&[ActionId::new("m", "B")])
                    .await
                    .map_err(|e| ActionError::failed(e.to_string()))
            }),
        );
        modules.insert(Arc::clone(&peer), handler_fn(|_ctx, _params| async { Ok(()) }));
        let _dispatcher = dispatcher::spawn(&bus, modules).unwrap();

        // m/A sorts first, so a trigger-then-await loop would never reach m/B
        let plan = PlanBuilder::new(vec![waiter, peer]).build();
        let ctx = Context::new("/x", bus.clone());
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            PhaseExecutor::new(bus.clone()).run(&ctx, &plan, &Params::new()),
        )
        .await
        .expect("same-phase wait_for deadlocked");

        assert!(result.success());
        assert_eq!(result.phases_run, 1);
        assert!(ctx.has_completed(&ActionId::new("m", "A")));
        assert!(ctx.has_completed(&ActionId::new("m", "B")));
    }

    #[tokio::test]
    async fn test_phase_boundaries_hold_with_several_actions_per_phase() {
        let bus = EventBus::new();
        let modules = Arc::new(ModuleRegistry::new());
        let stamps: Arc<Mutex<Vec<(i32, Instant)>>> = Arc::default();

        let mut actions = Vec::new();
        for (name, phase, delay_ms) in [
            ("a", 0, 40),
            ("b", 0, 5),
            ("c", 0, 20),
            ("d", 1, 0),
            ("e", 1, 10),
        ] {
            let descriptor = Arc::new(ActionDescriptor::new("m", name).with_phase(phase));
            let stamps = Arc::clone(&stamps);
            modules.insert(
                Arc::clone(&descriptor),
                handler_fn(move |_ctx, _params| {
                    let stamps = Arc::clone(&stamps);
                    async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        stamps.lock().unwrap().push((phase, Instant::now()));
                        Ok(())
                    }
                }),
            );
            actions.push(descriptor);
        }
        let _dispatcher = dispatcher::spawn(&bus, modules).unwrap();

        let plan = PlanBuilder::new(actions).build();
        let ctx = Context::new("/x", bus.clone());
        let result = PhaseExecutor::new(bus.clone())
            .run(&ctx, &plan, &Params::new())
            .await;
        assert!(result.success());

        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), 5);
        let latest_phase_zero = stamps.iter().filter(|(p, _)| *p == 0).map(|(_, t)| *t).max().unwrap();
        let earliest_phase_one = stamps.iter().filter(|(p, _)| *p == 1).map(|(_, t)| *t).min().unwrap();
        assert!(latest_phase_zero <= earliest_phase_one);
    }

    #[tokio::test]
    async fn test_negative_phase_runs_first() {
        let h = Harness::new();
        let actions = vec![
            h.action(ActionDescriptor::new("m", "handler"), false),
            h.action(ActionDescriptor::new("m", "guard").with_phase(-10), false),
        ];
        let _dispatcher = dispatcher::spawn(&h.bus, Arc::clone(&h.modules)).unwrap();

        let plan = PlanBuilder::new(actions).build();
        assert_eq!(plan.phase_numbers(), vec![-10, DEFAULT_PHASE]);
        let ctx = Context::new("/x", h.bus.clone());
        let result = PhaseExecutor::new(h.bus.clone())
            .run(&ctx, &plan, &Params::new())
            .await;

        assert!(result.success());
        assert_eq!(h.log(), vec!["m/guard", "m/handler"]);
    }

    #[tokio::test]
    async fn test_failure_stops_later_phases() {
        let h = Harness::new();
        let actions = vec![
            h.action(ActionDescriptor::new("m", "A").with_phase(0), true),
            h.action(ActionDescriptor::new("m", "B").with_phase(1), false),
        ];
        let _dispatcher = dispatcher::spawn(&h.bus, Arc::clone(&h.modules)).unwrap();

        let plan = PlanBuilder::new(actions).build();
        let ctx = Context::new("/x", h.bus.clone());
        let result = PhaseExecutor::new(h.bus.clone())
            .run(&ctx, &plan, &Params::new())
            .await;

        assert_eq!(result.state, ContextState::Error);
        assert_eq!(result.phases_run, 1);
        assert_eq!(h.log(), vec!["m/A"]);
    }

    #[tokio::test]
    async fn test_terminal_context_runs_nothing() {
        let h = Harness::new();
        let actions = vec![h.action(ActionDescriptor::new("m", "A").with_phase(0), false)];
        let _dispatcher = dispatcher::spawn(&h.bus, Arc::clone(&h.modules)).unwrap();

        let plan = PlanBuilder::new(actions).build();
        let ctx = Context::new("/x", h.bus.clone());
        ctx.error();
        let result = PhaseExecutor::new(h.bus.clone())
            .run(&ctx, &plan, &Params::new())
            .await;

        assert_eq!(result.phases_run, 0);
        assert_eq!(result.state, ContextState::Error);
        assert!(h.log().is_empty());
    }

    #[tokio::test]
    async fn test_external_error_unblocks_stalled_action() {
        let bus = EventBus::new();
        let modules = Arc::new(ModuleRegistry::new());
        let stalled = Arc::new(ActionDescriptor::new("m", "stalled"));
        modules.insert(
            Arc::clone(&stalled),
            handler_fn(|_ctx, _params| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        );
        let _dispatcher = dispatcher::spawn(&bus, modules).unwrap();

        let plan = PlanBuilder::new(vec![stalled]).build();
        let ctx = Context::new("/x", bus.clone());
        let killer = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                ctx.error();
            })
        };

        let result = PhaseExecutor::new(bus.clone())
            .run(&ctx, &plan, &Params::new())
            .await;
        killer.await.unwrap();

        assert_eq!(result.state, ContextState::Error);
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let h = Harness::new();
        let actions = vec![
            h.action(ActionDescriptor::new("m", "A").with_phase(0), false),
            h.action(ActionDescriptor::new("m", "B").with_phase(1), false),
        ];
        let _dispatcher = dispatcher::spawn(&h.bus, Arc::clone(&h.modules)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let plan = PlanBuilder::new(actions).build();
        let ctx = Context::new("/x", h.bus.clone());
        PhaseExecutor::new(h.bus.clone())
            .with_events(tx)
            .run(&ctx, &plan, &Params::new())
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                PhaseEvent::PhaseStarted {
                    phase: 0,
                    actions: vec![ActionId::new("m", "A")]
                },
                PhaseEvent::PhaseCompleted {
                    phase: 0,
                    state: ContextState::Running
                },
                PhaseEvent::PhaseStarted {
                    phase: 1,
                    actions: vec![ActionId::new("m", "B")]
                },
                PhaseEvent::PhaseCompleted {
                    phase: 1,
                    state: ContextState::Running
                },
                PhaseEvent::RunCompleted {
                    state: ContextState::Done,
                    phases_run: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_params_reach_handlers() {
        let bus = EventBus::new();
        let modules = Arc::new(ModuleRegistry::new());
        let action = Arc::new(ActionDescriptor::new("users", "load"));
        modules.insert(
            Arc::clone(&action),
            handler_fn(|ctx, params| async move {
                ctx.set("id", serde_json::json!(params.get("id")));
                Ok(())
            }),
        );
        let _dispatcher = dispatcher::spawn(&bus, modules).unwrap();

        let mut params = Params::new();
        params.insert("id".to_string(), "42".to_string());
        let plan = PlanBuilder::new(vec![action]).build();
        let ctx = Context::new("/users/42", bus.clone());
        PhaseExecutor::new(bus.clone()).run(&ctx, &plan, &params).await;

        assert_eq!(ctx.get("id"), Some(serde_json::json!("42")));
    }
}
