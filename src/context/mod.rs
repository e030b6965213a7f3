//! Unit-of-work context.
//!
//! A [`Context`] represents one coordination run: identity, creation time,
//! a monotonic state machine, the data bag shared by every action of the
//! run, and the log of completed actions used to satisfy `wait_for`.
//!
//! Each context listens on `context/{id}/**` so that completion signals
//! published by collaborators outside the engine land in its action log.
//! The listener is released by [`Context::close`] or, if the owner forgets,
//! when the last `Arc<Context>` is dropped.

mod state;

pub use state::ContextState;

use crate::bus::{BusEvent, EventBus, topics};
use crate::errors::ContextError;
use crate::plan::PhasePlan;
use chrono::{DateTime, Utc};
use conductor_common::{ActionId, Params};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Everything waiters can observe about a context.
#[derive(Debug, Clone, Default)]
pub(crate) struct Ledger {
    pub(crate) state: ContextState,
    pub(crate) completed: HashSet<ActionId>,
    pub(crate) failed: HashMap<ActionId, String>,
    pub(crate) closed: bool,
}

/// One coordination run.
pub struct Context {
    id: Uuid,
    topic: String,
    created: DateTime<Utc>,
    started: Instant,
    ledger: Arc<watch::Sender<Ledger>>,
    data: Mutex<Map<String, Value>>,
    params: OnceLock<Params>,
    plan: OnceLock<PhasePlan>,
    bus: EventBus,
    listener: Mutex<Option<(u64, JoinHandle<()>)>>,
}

impl Context {
    /// Create a context for a topic occurrence.
    ///
    /// When called inside a tokio runtime the context starts listening for
    /// completion signals addressed to it.
    pub fn new(topic: impl Into<String>, bus: EventBus) -> Arc<Self> {
        let (tx, _) = watch::channel(Ledger::default());
        let ctx = Arc::new(Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            created: Utc::now(),
            started: Instant::now(),
            ledger: Arc::new(tx),
            data: Mutex::new(Map::new()),
            params: OnceLock::new(),
            plan: OnceLock::new(),
            bus,
            listener: Mutex::new(None),
        });
        ctx.spawn_listener();
        ctx
    }

    fn spawn_listener(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(context = %self.id, "no runtime, context listener disabled");
            return;
        };

        let mut subscription = match self.bus.subscribe(&topics::context(self.id)) {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!(context = %self.id, error = %e, "failed to subscribe context listener");
                return;
            }
        };

        let subscription_id = subscription.id();
        let ledger = Arc::clone(&self.ledger);
        let id = self.id;
        let handle = runtime.spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                match envelope.event {
                    BusEvent::ActionDone { action, .. } => record_done(&ledger, id, action),
                    BusEvent::ActionError { action, reason, .. } => {
                        record_error(&ledger, id, action, reason)
                    }
                    _ => {}
                }
            }
        });

        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((subscription_id, handle));
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The concrete topic this context was created for.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Time elapsed since the context was created.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn state(&self) -> ContextState {
        self.ledger.borrow().state
    }

    pub fn is_closed(&self) -> bool {
        self.ledger.borrow().closed
    }

    /// `Pending → Running`; no-op in any other state.
    pub fn start(&self) -> bool {
        self.transition(ContextState::Running)
    }

    /// Move to `Done` unless already terminal.
    pub fn done(&self) -> bool {
        self.transition(ContextState::Done)
    }

    /// Move to `Error` unless already terminal.
    pub fn error(&self) -> bool {
        self.transition(ContextState::Error)
    }

    fn transition(&self, to: ContextState) -> bool {
        transition(&self.ledger, self.id, to)
    }

    /// The data bag shared by every action of this run.
    pub fn data(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a value into the data bag, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data().insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data().get(key).cloned()
    }

    /// A copy of the data bag as a JSON object.
    pub fn data_snapshot(&self) -> Value {
        Value::Object(self.data().clone())
    }

    /// Path parameters extracted when the topic was matched.
    pub fn url_params(&self) -> Params {
        self.params.get().cloned().unwrap_or_default()
    }

    /// The phase map, once the context has been coordinated.
    pub fn phase_map(&self) -> Option<&PhasePlan> {
        self.plan.get()
    }

    /// Install the phase map and parameters; `false` if already coordinated.
    pub(crate) fn install_plan(&self, plan: PhasePlan, params: Params) -> bool {
        if self.plan.set(plan).is_err() {
            return false;
        }
        let _ = self.params.set(params);
        true
    }

    /// Completed actions recorded so far.
    pub fn action_log(&self) -> HashSet<ActionId> {
        self.ledger.borrow().completed.clone()
    }

    pub fn has_completed(&self, action: &ActionId) -> bool {
        self.ledger.borrow().completed.contains(action)
    }

    /// Record that an action finished and publish its done signal.
    pub fn action_done(&self, action: &ActionId) {
        record_done(&self.ledger, self.id, action.clone());
        self.bus.publish(
            topics::done(self.id, action),
            BusEvent::ActionDone {
                context: self.id,
                action: action.clone(),
            },
        );
    }

    /// Record that an action failed, publish its error signal and fail the run.
    pub fn action_error(&self, action: &ActionId, reason: impl Into<String>) {
        let reason = reason.into();
        record_error(&self.ledger, self.id, action.clone(), reason.clone());
        self.bus.publish(
            topics::error(self.id, action),
            BusEvent::ActionError {
                context: self.id,
                action: action.clone(),
                reason,
            },
        );
    }

    /// Resolve once every dependency has completed.
    ///
    /// Resolves immediately if they already have; fails as soon as any of
    /// them signals an error, or if the context is closed first.
    pub async fn wait_for(&self, dependencies: &[ActionId]) -> Result<(), ContextError> {
        let mut rx = self.ledger.subscribe();
        loop {
            {
                let ledger = rx.borrow_and_update();
                if let Some((dependency, reason)) = dependencies
                    .iter()
                    .find_map(|d| ledger.failed.get(d).map(|r| (d, r)))
                {
                    return Err(ContextError::DependencyFailed {
                        dependency: dependency.clone(),
                        reason: reason.clone(),
                    });
                }
                if dependencies.iter().all(|d| ledger.completed.contains(d)) {
                    return Ok(());
                }
                if ledger.closed {
                    return Err(ContextError::Closed(self.id));
                }
            }
            if rx.changed().await.is_err() {
                return Err(ContextError::Closed(self.id));
            }
        }
    }

    /// Resolve once the context is terminal or closed, returning the state.
    pub async fn wait_terminal(&self) -> ContextState {
        let mut rx = self.ledger.subscribe();
        wait_terminal(&mut rx).await
    }

    pub(crate) fn watch(&self) -> watch::Receiver<Ledger> {
        self.ledger.subscribe()
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Release the context's bus subscription and wake any waiters.
    pub fn close(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((subscription_id, handle)) = listener {
            self.bus.detach(subscription_id);
            handle.abort();
        }
        self.ledger.send_if_modified(|ledger| {
            if ledger.closed {
                return false;
            }
            ledger.closed = true;
            true
        });
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) async fn wait_terminal(rx: &mut watch::Receiver<Ledger>) -> ContextState {
    loop {
        {
            let ledger = rx.borrow_and_update();
            if ledger.state.is_terminal() || ledger.closed {
                return ledger.state;
            }
        }
        if rx.changed().await.is_err() {
            return rx.borrow().state;
        }
    }
}

fn transition(ledger: &watch::Sender<Ledger>, id: Uuid, to: ContextState) -> bool {
    ledger.send_if_modified(|l| {
        if !l.state.can_transition_to(to) {
            return false;
        }
        tracing::debug!(context = %id, from = %l.state, to = %to, "context transition");
        l.state = to;
        true
    })
}

fn record_done(ledger: &watch::Sender<Ledger>, id: Uuid, action: ActionId) {
    transition(ledger, id, ContextState::Running);
    ledger.send_if_modified(|l| l.completed.insert(action));
}

fn record_error(ledger: &watch::Sender<Ledger>, id: Uuid, action: ActionId, reason: String) {
    let recorded = ledger.send_if_modified(|l| {
        if l.failed.contains_key(&action) {
            return false;
        }
        l.failed.insert(action.clone(), reason.clone());
        true
    });
    if recorded {
        tracing::warn!(context = %id, action = %action, reason = %reason, "action failed");
    }
    transition(ledger, id, ContextState::Error);
}
