//! Per-connection outbound message queue.
//!
//! An [`OutboundQueue`] holds encoded lines waiting to be written to its
//! connection's channel. A dedicated worker (spawned by the registry)
//! drains it in FIFO order and drives the retry policy:
//!
//! - `Running <-> Paused`: paused queues accept new messages but attempt
//!   no sends.
//! - `Running -> Errored -> Running`: a failed send enters `Errored` and is
//!   retried; a successful resend returns to `Running`. If the error
//!   persists past the send timeout, the worker gives up on the head
//!   message and escalates to a registry-level disconnect of the hash.
//! - `Disconnected`: the owning connection is gone but the hash is being
//!   tracked for reconnection. No sends are attempted. If a reconnect
//!   timeout is set and elapses, the queue closes itself and evicts its
//!   hash from the registry, which is what makes a late reconnection
//!   attempt correctly read as not-found.
//!
//! FIFO order survives pause/resume and error cycles; only `clear` and
//! successful delivery remove entries. The queue is addressed by the same
//! hash as its connection at all times — the registry mirrors hash changes
//! on both under its lock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, RwLock, watch};

/// Retry and reconnection policy for an outbound queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a failing send is retried before the queue forces a
    /// disconnect of its connection. Default: 5 s.
    pub send_timeout: Duration,
    /// Pause between send retries while in `Errored`. Default: 20 ms.
    pub retry_interval: Duration,
    /// How long a `Disconnected` queue waits for reconnection before
    /// evicting itself. Default: unset (wait forever).
    pub reconnect_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(20),
            reconnect_timeout: None,
        }
    }
}

/// Lifecycle state of an outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Created but the worker has not started yet.
    New,
    /// Draining normally.
    Running,
    /// Holding messages; no send attempts.
    Paused,
    /// Last send failed; retrying since the recorded instant.
    Errored {
        /// When the current error streak began.
        since: Instant,
    },
    /// Connection gone, hash tracked for reconnection since the recorded
    /// instant.
    Disconnected {
        /// When the disconnect occurred.
        since: Instant,
    },
    /// Torn down, messages discarded. Terminal.
    Closed,
}

impl QueueState {
    /// Whether the queue has been torn down.
    pub fn is_closed(self) -> bool {
        matches!(self, QueueState::Closed)
    }

    /// Whether the queue is suspended awaiting reconnection.
    pub fn is_disconnected(self) -> bool {
        matches!(self, QueueState::Disconnected { .. })
    }
}

/// FIFO of pending outbound lines for one connection.
pub struct OutboundQueue {
    hash: RwLock<String>,
    state_tx: watch::Sender<QueueState>,
    pending: Mutex<VecDeque<String>>,
    work: Notify,
    reconnect_timeout: RwLock<Option<Duration>>,
    config: QueueConfig,
}

impl OutboundQueue {
    /// Create a queue in the `New` state for the given hash.
    pub fn new(hash: String, config: QueueConfig) -> Self {
        let (state_tx, _) = watch::channel(QueueState::New);
        Self {
            hash: RwLock::new(hash),
            state_tx,
            pending: Mutex::new(VecDeque::new()),
            work: Notify::new(),
            reconnect_timeout: RwLock::new(config.reconnect_timeout),
            config,
        }
    }

    /// The hash this queue is addressed by.
    pub async fn hash(&self) -> String {
        self.hash.read().await.clone()
    }

    /// Re-identify the queue; mirrored with the connection by the registry.
    pub async fn set_hash(&self, hash: &str) {
        *self.hash.write().await = hash.to_string();
    }

    /// Retry policy in effect for this queue.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Current state snapshot.
    pub fn state(&self) -> QueueState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.state_tx.subscribe()
    }

    /// Reconnect window currently in effect, if any.
    pub async fn reconnect_timeout(&self) -> Option<Duration> {
        *self.reconnect_timeout.read().await
    }

    /// Set or clear the reconnect window.
    pub async fn set_reconnect_timeout(&self, timeout: Option<Duration>) {
        *self.reconnect_timeout.write().await = timeout;
        // Wake the worker so a newly set window is observed promptly.
        self.work.notify_one();
    }

    /// Append a line. Legal in every state except `Closed`; returns whether
    /// the line was accepted.
    pub async fn enqueue(&self, line: String) -> bool {
        if self.state().is_closed() {
            tracing::warn!("enqueue on closed queue, dropping message");
            return false;
        }
        self.pending.lock().await.push_back(line);
        self.work.notify_one();
        true
    }

    /// Copy of the head message, if any.
    pub async fn peek(&self) -> Option<String> {
        self.pending.lock().await.front().cloned()
    }

    /// Remove and return the head message.
    pub async fn pop(&self) -> Option<String> {
        self.pending.lock().await.pop_front()
    }

    /// Remove the head message only if it still equals `line`. The worker
    /// snapshots the head, awaits the send, then removes — a `clear` (and
    /// re-`enqueue`) racing that window must not cost a message that was
    /// never delivered. Returns whether the head was removed.
    pub async fn pop_if_head(&self, line: &str) -> bool {
        let mut pending = self.pending.lock().await;
        if pending.front().is_some_and(|head| head == line) {
            pending.pop_front();
            true
        } else {
            false
        }
    }

    /// Drop every pending message. State is unchanged.
    pub async fn clear(&self) {
        self.pending.lock().await.clear();
    }

    /// Number of pending messages.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether no messages are pending.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Worker start: `New -> Running`.
    pub fn start(&self) {
        self.state_tx.send_modify(|state| {
            if *state == QueueState::New {
                *state = QueueState::Running;
            }
        });
    }

    /// Suspend draining. Messages keep accumulating.
    pub fn pause(&self) {
        self.state_tx.send_modify(|state| {
            if matches!(
                *state,
                QueueState::New | QueueState::Running | QueueState::Errored { .. }
            ) {
                *state = QueueState::Paused;
            }
        });
    }

    /// Resume draining from `Paused` or `Disconnected`.
    pub fn resume(&self) {
        self.state_tx.send_modify(|state| {
            if matches!(*state, QueueState::Paused | QueueState::Disconnected { .. }) {
                *state = QueueState::Running;
            }
        });
        self.work.notify_one();
    }

    /// Record a failed send. Keeps the instant the error streak began and
    /// returns it, so the worker can compare against the send timeout.
    pub fn mark_errored(&self) -> Instant {
        let mut since = Instant::now();
        self.state_tx.send_modify(|state| match *state {
            QueueState::Errored { since: existing } => since = existing,
            QueueState::Closed => {}
            _ => *state = QueueState::Errored { since },
        });
        since
    }

    /// Record a successful send: clears an error streak.
    pub fn mark_sent(&self) {
        self.state_tx.send_modify(|state| {
            if matches!(*state, QueueState::Errored { .. } | QueueState::New) {
                *state = QueueState::Running;
            }
        });
    }

    /// The owning connection disconnected while its hash is tracked.
    pub fn set_disconnected(&self) {
        self.state_tx.send_modify(|state| {
            if !state.is_closed() {
                *state = QueueState::Disconnected {
                    since: Instant::now(),
                };
            }
        });
        self.work.notify_one();
    }

    /// Tear the queue down: remaining messages are discarded and the
    /// worker exits. Terminal and idempotent.
    pub async fn close(&self) {
        self.state_tx.send_modify(|state| *state = QueueState::Closed);
        self.pending.lock().await.clear();
        self.work.notify_one();
    }

    /// Resolves when new work may be available (a message arrived or the
    /// configuration changed). Used by the worker's idle wait.
    pub async fn work_notified(&self) {
        self.work.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue() -> OutboundQueue {
        OutboundQueue::new("00112233".to_string(), QueueConfig::default())
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let queue = test_queue();
        queue.start();
        assert!(queue.enqueue("a".into()).await);
        assert!(queue.enqueue("b".into()).await);

        queue.pause();
        assert!(queue.enqueue("c".into()).await, "paused queues accept messages");
        queue.resume();

        assert_eq!(queue.pop().await.as_deref(), Some("a"));
        assert_eq!(queue.pop().await.as_deref(), Some("b"));
        assert_eq!(queue.pop().await.as_deref(), Some("c"));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_enqueue_rejected_when_closed() {
        let queue = test_queue();
        queue.close().await;
        assert!(!queue.enqueue("late".into()).await);
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_close_discards_messages() {
        let queue = test_queue();
        queue.enqueue("a".into()).await;
        queue.enqueue("b".into()).await;
        queue.close().await;
        assert!(queue.is_empty().await);
        assert!(queue.state().is_closed());
    }

    #[tokio::test]
    async fn test_pop_if_head_skips_replaced_head() {
        let queue = test_queue();
        queue.start();
        queue.enqueue("a".into()).await;
        queue.clear().await;
        queue.enqueue("b".into()).await;

        assert!(
            !queue.pop_if_head("a").await,
            "a cleared head must not cost the message that replaced it"
        );
        assert_eq!(queue.len().await, 1);
        assert!(queue.pop_if_head("b").await);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear_keeps_state() {
        let queue = test_queue();
        queue.start();
        queue.enqueue("a".into()).await;
        queue.clear().await;
        assert!(queue.is_empty().await);
        assert_eq!(queue.state(), QueueState::Running);
    }

    #[tokio::test]
    async fn test_error_streak_keeps_first_instant() {
        let queue = test_queue();
        queue.start();
        let first = queue.mark_errored();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = queue.mark_errored();
        assert_eq!(first, second, "error instant marks the start of the streak");

        queue.mark_sent();
        assert_eq!(queue.state(), QueueState::Running);
    }

    #[tokio::test]
    async fn test_resume_from_disconnected() {
        let queue = test_queue();
        queue.start();
        queue.set_disconnected();
        assert!(queue.state().is_disconnected());

        queue.resume();
        assert_eq!(queue.state(), QueueState::Running);
    }

    #[tokio::test]
    async fn test_pause_does_not_leave_disconnected() {
        let queue = test_queue();
        queue.start();
        queue.set_disconnected();
        queue.pause();
        assert!(
            queue.state().is_disconnected(),
            "pause applies only to running queues"
        );
    }

    #[tokio::test]
    async fn test_closed_is_terminal() {
        let queue = test_queue();
        queue.close().await;
        queue.resume();
        queue.set_disconnected();
        assert!(queue.state().is_closed());
    }

    #[tokio::test]
    async fn test_reconnect_timeout_override() {
        let queue = test_queue();
        assert_eq!(queue.reconnect_timeout().await, None);
        queue
            .set_reconnect_timeout(Some(Duration::from_millis(250)))
            .await;
        assert_eq!(
            queue.reconnect_timeout().await,
            Some(Duration::from_millis(250))
        );
    }
}
