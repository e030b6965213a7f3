//! Runs action handlers in response to bus triggers.
//!
//! The dispatcher subscribes to every `action/**` topic. Each trigger is
//! resolved through the [`ModuleRegistry`] and the handler runs on its own
//! tokio task; its outcome is reported back through the context's
//! `action_done` / `action_error` signals.

use crate::action::ModuleRegistry;
use crate::bus::{BusEvent, EventBus, Subscription, Trigger, topics};
use crate::errors::{ActionError, RegistrationError};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Handle to a running dispatcher; stops it when dropped.
pub struct DispatcherHandle {
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start dispatching triggers published on `bus`.
///
/// The subscription is taken before this returns, so triggers published
/// right afterwards are never missed.
pub fn spawn(bus: &EventBus, modules: Arc<ModuleRegistry>) -> Result<DispatcherHandle, RegistrationError> {
    let subscription = bus.subscribe(topics::ALL_TRIGGERS)?;
    let task = tokio::spawn(run(subscription, modules));
    tracing::debug!("action dispatcher started");
    Ok(DispatcherHandle { task })
}

async fn run(mut subscription: Subscription, modules: Arc<ModuleRegistry>) {
    while let Some(envelope) = subscription.recv().await {
        if let BusEvent::Trigger(trigger) = envelope.event {
            dispatch(trigger, &modules);
        }
    }
}

fn dispatch(trigger: Trigger, modules: &ModuleRegistry) {
    let Trigger {
        context,
        action,
        params,
    } = trigger;

    if context.state().is_terminal() {
        tracing::debug!(
            context = %context.id(),
            action = %action,
            state = %context.state(),
            "skipping trigger for finished context"
        );
        return;
    }

    let Some(registered) = modules.lookup(&action) else {
        let err = ActionError::Unregistered(action.clone());
        context.action_error(&action, err.to_string());
        return;
    };

    tokio::spawn(async move {
        tracing::debug!(context = %context.id(), action = %action, "running action");
        let handler = Arc::clone(&registered.handler);
        let ctx = Arc::clone(&context);
        let run = tokio::spawn(async move { handler.handle(ctx, params).await });

        let outcome = match run.await {
            Ok(result) => result,
            Err(join_error) => Err(ActionError::Panicked(join_error.to_string())),
        };

        match outcome {
            Ok(()) => context.action_done(&action),
            Err(err) => context.action_error(&action, err.to_string()),
        }
    });
}
