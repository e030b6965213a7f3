//! In-process event bus with wildcard subscriptions.
//!
//! The coordinator never calls an action directly: it publishes a trigger on
//! the action's execution topic and waits for a completion signal on a
//! topic that embeds the context id. Keeping the context id in every
//! completion topic means two contexts running the same action never see
//! each other's signals.
//!
//! ## Topics
//!
//! | Topic                                   | Event            |
//! |-----------------------------------------|------------------|
//! | `action/{module}/{name}`                | `Trigger`        |
//! | `context/{id}/done/{module}/{name}`     | `ActionDone`     |
//! | `context/{id}/error/{module}/{name}`    | `ActionError`    |
//! | `context/{id}/timeout`                  | `Timeout`        |
//!
//! Subscriptions are RAII handles: dropping a [`Subscription`] unsubscribes
//! it, so a context that is dropped without an explicit `close()` still
//! releases its listener.

use crate::context::Context;
use crate::errors::RegistrationError;
use crate::topic::TopicPattern;
use conductor_common::{ActionId, Params};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Topic builders for the engine's internal signals.
pub mod topics {
    use super::*;

    pub fn trigger(action: &ActionId) -> String {
        format!("action/{}/{}", action.module(), action.name())
    }

    pub fn done(context: Uuid, action: &ActionId) -> String {
        format!("context/{}/done/{}/{}", context, action.module(), action.name())
    }

    pub fn error(context: Uuid, action: &ActionId) -> String {
        format!("context/{}/error/{}/{}", context, action.module(), action.name())
    }

    pub fn timeout(context: Uuid) -> String {
        format!("context/{}/timeout", context)
    }

    /// Matches both the done and the error signal of one action.
    pub fn completion(context: Uuid, action: &ActionId) -> String {
        format!("context/{}/*/{}/{}", context, action.module(), action.name())
    }

    /// Matches every signal addressed to a context.
    pub fn context(context: Uuid) -> String {
        format!("context/{}/**", context)
    }

    /// Matches every action trigger.
    pub const ALL_TRIGGERS: &str = "action/**";
}

/// Request to execute one action for one context.
#[derive(Clone)]
pub struct Trigger {
    pub context: Arc<Context>,
    pub action: ActionId,
    pub params: Params,
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("context", &self.context.id())
            .field("action", &self.action)
            .field("params", &self.params)
            .finish()
    }
}

/// Events carried by the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Trigger(Trigger),
    ActionDone {
        context: Uuid,
        action: ActionId,
    },
    ActionError {
        context: Uuid,
        action: ActionId,
        reason: String,
    },
    Timeout {
        context: Uuid,
        after: Duration,
    },
    /// Free-form payload for collaborators outside the engine
    Custom(serde_json::Value),
}

/// A published event together with the concrete topic it was sent on.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub event: BusEvent,
}

struct Subscriber {
    pattern: TopicPattern,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

/// Cheaply cloneable handle to a shared bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every topic matching `pattern`.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, RegistrationError> {
        let pattern = TopicPattern::compile(pattern)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Subscriber { pattern, tx });

        Ok(Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            rx,
        })
    }

    /// Publish an event, returning how many subscribers received it.
    pub fn publish(&self, topic: impl Into<String>, event: BusEvent) -> usize {
        let topic = topic.into();
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, sub) in subscribers.iter() {
                if !sub.pattern.is_match(&topic) {
                    continue;
                }
                let envelope = Envelope {
                    topic: topic.clone(),
                    event: event.clone(),
                };
                if sub.tx.send(envelope).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        for id in closed {
            self.inner.remove(id);
        }

        tracing::trace!(topic = %topic, delivered, "bus publish");
        delivered
    }

    /// Release a subscription explicitly.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Drop a subscription by id, closing its receiver.
    pub(crate) fn detach(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Receiving end of a bus subscription; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next matching event.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Take a pending event without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(n: i64) -> BusEvent {
        BusEvent::Custom(serde_json::json!(n))
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_delivery() {
        let bus = EventBus::new();
        let mut exact = bus.subscribe("a/b").unwrap();
        let mut wild = bus.subscribe("a/*").unwrap();
        let mut deep = bus.subscribe("a/**").unwrap();

        assert_eq!(bus.publish("a/b", custom(1)), 3);
        assert_eq!(bus.publish("a/b/c", custom(2)), 1);

        assert_eq!(exact.recv().await.unwrap().topic, "a/b");
        assert_eq!(wild.recv().await.unwrap().topic, "a/b");
        assert_eq!(deep.recv().await.unwrap().topic, "a/b");
        assert_eq!(deep.recv().await.unwrap().topic, "a/b/c");
        assert!(exact.try_recv().is_none());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe("x/**").unwrap();
        let other = bus.subscribe("y").unwrap();
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(other);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish("x/1", custom(1)), 0);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus = EventBus::new();
        let sub = bus.subscribe("x").unwrap();
        drop(bus);
        // Dropping after the bus is gone must not panic
        drop(sub);
    }

    #[test]
    fn test_malformed_subscription_pattern() {
        let bus = EventBus::new();
        assert!(bus.subscribe("a/**/b").is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_completion_topic_matches_done_and_error_only() {
        let ctx = Uuid::new_v4();
        let action = ActionId::new("users", "load");
        let pattern = TopicPattern::compile(&topics::completion(ctx, &action)).unwrap();

        assert!(pattern.is_match(&topics::done(ctx, &action)));
        assert!(pattern.is_match(&topics::error(ctx, &action)));
        assert!(!pattern.is_match(&topics::done(Uuid::new_v4(), &action)));
        assert!(!pattern.is_match(&topics::done(ctx, &ActionId::new("users", "save"))));
        assert!(!pattern.is_match(&topics::timeout(ctx)));
    }

    #[test]
    fn test_context_topic_matches_all_context_signals() {
        let ctx = Uuid::new_v4();
        let action = ActionId::new("m", "a");
        let pattern = TopicPattern::compile(&topics::context(ctx)).unwrap();
        assert!(pattern.is_match(&topics::done(ctx, &action)));
        assert!(pattern.is_match(&topics::timeout(ctx)));
        assert!(!pattern.is_match(&topics::trigger(&action)));
    }
}
