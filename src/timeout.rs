//! Deadline supervision for request-bound contexts.
//!
//! A supervisor is armed once a context has been planned. If the deadline
//! passes before the context reaches a terminal state and before anyone has
//! answered the caller, the context is failed, a single timeout notification
//! is published on `context/{id}/timeout`, and the response is finalized with
//! `408 Request Timeout`.
//!
//! Actions are never aborted: a handler that finishes after the deadline
//! still runs to completion, but its response is discarded by the slot.

use crate::bus::{BusEvent, topics};
use crate::context::{self, Context};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Status code sent when the supervisor fires.
pub const TIMEOUT_STATUS: u16 = 408;

/// A response for the caller of a request-bound context.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn timeout() -> Self {
        Self::new(TIMEOUT_STATUS, json!({ "error": "Request Timeout" }))
    }
}

/// Once-only response channel. The first `finalize` wins; later ones are
/// discarded.
#[derive(Debug)]
pub struct ResponseSlot {
    tx: Mutex<Option<oneshot::Sender<Reply>>>,
}

impl ResponseSlot {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        });
        (slot, rx)
    }

    /// Send the reply unless one was already sent.
    pub fn finalize(&self, reply: Reply) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                // The receiver may be gone if the caller disconnected
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[derive(Debug)]
enum Command {
    Extend(Duration),
    Bump,
}

/// Handle to a running supervisor; disarms it when dropped.
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Re-arm the deadline to `duration` from now.
    pub fn extend(&self, duration: Duration) {
        let _ = self.commands.send(Command::Extend(duration));
    }

    /// Reset the deadline to the rolling window from now.
    pub fn bump(&self) {
        let _ = self.commands.send(Command::Bump);
    }

    /// Whether the deadline passed and the supervisor failed the context.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Whether the supervisor is still watching the context.
    pub fn is_armed(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn disarm(self) {
        drop(self);
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start supervising `ctx`.
///
/// The supervisor holds only a weak reference, so it never keeps a context
/// alive; dropping the context ends supervision.
pub fn supervise(
    ctx: &Arc<Context>,
    slot: Arc<ResponseSlot>,
    deadline: Duration,
    rolling_window: Duration,
) -> SupervisorHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let fired = Arc::new(AtomicBool::new(false));

    let watcher = Watcher {
        context: Arc::downgrade(ctx),
        slot,
        fired: Arc::clone(&fired),
        rolling_window,
    };

    tracing::debug!(
        context = %ctx.id(),
        deadline_ms = deadline.as_millis() as u64,
        "timeout supervisor armed"
    );

    let ledger = ctx.watch();
    let task = tokio::spawn(watcher.run(deadline, rx, ledger));

    SupervisorHandle {
        commands,
        fired,
        task,
    }
}

struct Watcher {
    context: Weak<Context>,
    slot: Arc<ResponseSlot>,
    fired: Arc<AtomicBool>,
    rolling_window: Duration,
}

impl Watcher {
    async fn run(
        self,
        deadline: Duration,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut ledger: tokio::sync::watch::Receiver<context::Ledger>,
    ) {
        let armed_at = Instant::now();
        let sleep = tokio::time::sleep(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    self.expire(armed_at.elapsed());
                    return;
                }
                command = commands.recv() => match command {
                    Some(Command::Extend(duration)) => {
                        sleep.as_mut().reset(Instant::now() + duration);
                    }
                    Some(Command::Bump) => {
                        sleep.as_mut().reset(Instant::now() + self.rolling_window);
                    }
                    None => return,
                },
                state = context::wait_terminal(&mut ledger) => {
                    tracing::trace!(state = %state, "timeout supervisor cleared");
                    return;
                }
            }
        }
    }

    fn expire(&self, after: Duration) {
        let Some(ctx) = self.context.upgrade() else {
            return;
        };
        if self.slot.is_finalized() {
            tracing::debug!(context = %ctx.id(), "deadline passed after response was sent");
            return;
        }
        if !ctx.error() {
            // Finished just before the deadline; the caller is answered by the owner
            return;
        }

        self.fired.store(true, Ordering::SeqCst);
        tracing::warn!(
            context = %ctx.id(),
            topic = %ctx.topic(),
            after_ms = after.as_millis() as u64,
            "context timed out"
        );
        ctx.bus().publish(
            topics::timeout(ctx.id()),
            BusEvent::Timeout {
                context: ctx.id(),
                after,
            },
        );
        self.slot.finalize(Reply::timeout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::context::ContextState;

    #[test]
    fn test_slot_finalizes_once() {
        let (slot, mut rx) = ResponseSlot::new();
        assert!(!slot.is_finalized());
        assert!(slot.finalize(Reply::new(200, json!({"ok": true}))));
        assert!(!slot.finalize(Reply::timeout()));
        assert!(slot.is_finalized());
        assert_eq!(rx.try_recv().unwrap().status, 200);
    }

    #[test]
    fn test_slot_tolerates_dropped_receiver() {
        let (slot, rx) = ResponseSlot::new();
        drop(rx);
        assert!(slot.finalize(Reply::timeout()));
    }

    #[tokio::test]
    async fn test_expiry_fails_context_and_notifies_once() {
        let bus = EventBus::new();
        let ctx = Context::new("/slow", bus.clone());
        ctx.start();
        let mut timeouts = bus.subscribe(&topics::timeout(ctx.id())).unwrap();
        let (slot, rx) = ResponseSlot::new();

        let handle = supervise(
            &ctx,
            Arc::clone(&slot),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );

        let reply = rx.await.unwrap();
        assert_eq!(reply, Reply::timeout());
        assert_eq!(ctx.state(), ContextState::Error);
        assert!(handle.has_fired());

        let envelope = timeouts.recv().await.unwrap();
        assert!(matches!(envelope.event, BusEvent::Timeout { context, .. } if context == ctx.id()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(timeouts.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_terminal_context_clears_supervisor() {
        let ctx = Context::new("/fast", EventBus::new());
        let (slot, _rx) = ResponseSlot::new();
        let handle = supervise(
            &ctx,
            Arc::clone(&slot),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );

        ctx.done();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!handle.is_armed());
        assert!(!handle.has_fired());
        assert!(!slot.is_finalized());
        assert_eq!(ctx.state(), ContextState::Done);
    }

    #[tokio::test]
    async fn test_finalized_response_suppresses_timeout() {
        let bus = EventBus::new();
        let ctx = Context::new("/answered", bus.clone());
        let mut timeouts = bus.subscribe(&topics::timeout(ctx.id())).unwrap();
        let (slot, _rx) = ResponseSlot::new();
        slot.finalize(Reply::new(200, json!({})));

        let handle = supervise(
            &ctx,
            Arc::clone(&slot),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!handle.has_fired());
        assert_eq!(ctx.state(), ContextState::Pending);
        assert!(timeouts.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_extend_rearms_from_now() {
        let ctx = Context::new("/long", EventBus::new());
        let (slot, _rx) = ResponseSlot::new();
        let handle = supervise(
            &ctx,
            Arc::clone(&slot),
            Duration::from_millis(40),
            Duration::from_millis(40),
        );

        handle.extend(Duration::from_millis(300));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.has_fired());
        assert!(ctx.state() != ContextState::Error);

        handle.extend(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(handle.has_fired());
        assert_eq!(ctx.state(), ContextState::Error);
    }

    #[tokio::test]
    async fn test_bump_resets_to_rolling_window() {
        let ctx = Context::new("/stream", EventBus::new());
        let (slot, _rx) = ResponseSlot::new();
        let handle = supervise(
            &ctx,
            Arc::clone(&slot),
            Duration::from_millis(60),
            Duration::from_millis(250),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.bump();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.has_fired());
        assert!(handle.is_armed());
    }

    #[tokio::test]
    async fn test_dropping_handle_disarms() {
        let ctx = Context::new("/dropped", EventBus::new());
        let (slot, _rx) = ResponseSlot::new();
        let handle = supervise(
            &ctx,
            Arc::clone(&slot),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        handle.disarm();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ctx.state(), ContextState::Pending);
        assert!(!slot.is_finalized());
    }
}
