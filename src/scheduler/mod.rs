//! Exponential-backoff retry scheduling for undelivered outgoing messages.

use crate::database::MessageStore;
use crate::error::Result;
use crate::protocol::{EngineEvent, MessageStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

/// What `RetryScheduler` calls back into to actually re-attempt a send.
/// `Forwarder` implements this; kept as a trait so the scheduler doesn't
/// need to know about transports, crypto, or SeenSets.
#[async_trait]
pub trait EgressExecutor: Send + Sync {
    /// Re-attempt sending the outgoing message `message_id`. Returns
    /// `Ok(true)` if peers were connected at send time, `Ok(false)`
    /// otherwise (including the "no peers" case, which is not an error
    /// here -- the caller reschedules).
    async fn retry_egress(&self, message_id: &str) -> Result<bool>;
}

struct RetryState {
    attempt: u32,
    scheduled_at: Instant,
    cancelled: Arc<AtomicBool>,
}

/// Tuning constants mirrored from `Config::engine` so the scheduler doesn't
/// need the whole `Config` type.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_retry_attempts: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

/// Per-message exponential backoff: `delay(k) = min(initial * 2^k, max)`.
pub struct RetryScheduler {
    store: Arc<MessageStore>,
    executor: RwLock<Option<Arc<dyn EgressExecutor>>>,
    entries: DashMap<String, RetryState>,
    config: SchedulerConfig,
    events: broadcast::Sender<EngineEvent>,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<MessageStore>,
        config: SchedulerConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor: RwLock::new(None),
            entries: DashMap::new(),
            config,
            events,
        })
    }

    /// Wire in the executor once it exists. Must be called before the
    /// scheduler's first `schedule()`.
    pub async fn set_executor(&self, executor: Arc<dyn EgressExecutor>) {
        *self.executor.write().await = Some(executor);
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self
            .config
            .initial_retry_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.config.max_retry_delay)
    }

    /// Schedule (or reschedule) a retry at `attempt`, waiting the normal
    /// backoff delay for that attempt. Invariant 6: at most one active
    /// retry task per `message_id` -- a fresh schedule cancels whatever was
    /// already in flight for that id.
    pub fn schedule(self: &Arc<Self>, message_id: String, attempt: u32) {
        if attempt >= self.config.max_retry_attempts {
            let scheduler = self.clone();
            let message_id_owned = message_id.clone();
            tokio::spawn(async move {
                let _ = scheduler
                    .store
                    .update_status(&message_id_owned, MessageStatus::Failed)
                    .await;
                let _ = scheduler.events.send(EngineEvent::MaxRetriesExceeded {
                    message_id: message_id_owned,
                });
            });
            return;
        }

        let delay = self.delay_for(attempt);
        self.schedule_after(message_id, attempt, delay);
    }

    /// Shared registration path behind `schedule` and
    /// `retry_pending_on_connection_restored`: cancel whatever entry
    /// already exists for `message_id` and register a fresh, cancellable
    /// one before spawning the timer. Keeping both callers on this path is
    /// what makes invariant 6 hold -- there is never more than one managed
    /// timer per message id racing to fire.
    fn schedule_after(self: &Arc<Self>, message_id: String, attempt: u32, delay: Duration) {
        if let Some(existing) = self.entries.get(&message_id) {
            existing.cancelled.store(true, Ordering::SeqCst);
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.entries.insert(
            message_id.clone(),
            RetryState {
                attempt,
                scheduled_at: Instant::now(),
                cancelled: cancelled.clone(),
            },
        );

        let scheduler = self.clone();
        let _ = self.events.send(EngineEvent::RetryScheduled {
            message_id: message_id.clone(),
            attempt,
        });

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            scheduler.execute(message_id, attempt + 1).await;
        });
    }

    async fn execute(self: &Arc<Self>, message_id: String, attempt: u32) {
        self.entries.remove(&message_id);

        let executor = self.executor.read().await.clone();
        let Some(executor) = executor else {
            self.schedule(message_id, attempt);
            return;
        };

        let record = match self.store.get(&message_id).await {
            Ok(Some(record)) => record,
            _ => return,
        };

        let now_ms = crate::protocol::now_millis();
        if record.is_expired(now_ms) {
            let _ = self
                .store
                .update_status(&message_id, MessageStatus::Failed)
                .await;
            return;
        }

        match executor.retry_egress(&message_id).await {
            Ok(true) => {
                let _ = self
                    .store
                    .update_status(&message_id, MessageStatus::Sent)
                    .await;
                let _ = self
                    .events
                    .send(EngineEvent::RetrySucceeded { message_id });
            }
            _ => {
                let _ = self.events.send(EngineEvent::RetryFailed {
                    message_id: message_id.clone(),
                });
                self.schedule(message_id, attempt);
            }
        }
    }

    /// Cancel any in-flight retry for `message_id` and mark it delivered.
    /// Idempotent: calling this twice, or on an id with no active retry, is
    /// a no-op beyond the status update.
    pub async fn mark_delivered(&self, message_id: &str) {
        if let Some((_, state)) = self.entries.remove(message_id) {
            state.cancelled.store(true, Ordering::SeqCst);
        }
        let _ = self
            .store
            .update_status(message_id, MessageStatus::Delivered)
            .await;
    }

    /// Immediately (≈1s) retry every `PENDING` outgoing message. Called
    /// when a peer connects after being isolated. Routed through
    /// `schedule_after` rather than a bare spawn so this supersedes (rather
    /// than races with) any `schedule()` timer already in flight for the
    /// same message, preserving invariant 6.
    pub async fn retry_pending_on_connection_restored(self: &Arc<Self>) {
        let Ok(pending) = self.store.list_pending_outgoing().await else {
            return;
        };
        for record in pending {
            let attempt = self
                .entries
                .get(&record.message_id)
                .map(|entry| entry.attempt)
                .unwrap_or(0);
            self.schedule_after(record.message_id, attempt, Duration::from_secs(1));
        }
    }

    /// Drop any retry entry stale enough that it can no longer be the
    /// legitimate in-flight timer for its message (older than
    /// `2 * max_retry_delay`), forcing the message to `FAILED`.
    pub async fn cleanup(&self) {
        let threshold = self.config.max_retry_delay * 2;
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.scheduled_at.elapsed() > threshold)
            .map(|entry| entry.key().clone())
            .collect();

        for message_id in stale {
            if let Some((_, state)) = self.entries.remove(&message_id) {
                state.cancelled.store(true, Ordering::SeqCst);
            }
            let _ = self
                .store
                .update_status(&message_id, MessageStatus::Failed)
                .await;
            let _ = self.events.send(EngineEvent::MaxRetriesExceeded {
                message_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    struct CountingExecutor {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl EgressExecutor for CountingExecutor {
        async fn retry_egress(&self, _message_id: &str) -> Result<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n >= self.succeed_on)
        }
    }

    async fn store(dir: &TempDir) -> Arc<MessageStore> {
        Arc::new(
            MessageStore::new(
                DatabaseConfig {
                    path: dir.path().join("t.db"),
                    max_connections: 2,
                    connection_timeout: Duration::from_secs(2),
                    enable_wal: true,
                },
                "self",
            )
            .await
            .unwrap(),
        )
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn mark_delivered_cancels_pending_retry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let record = crate::protocol::MessageRecord {
            message_id: "m1".to_string(),
            content: "hi".to_string(),
            sender_id: "self".to_string(),
            recipient_id: "bob".to_string(),
            timestamp: 1,
            status: MessageStatus::Pending,
            hop_count: 0,
            ttl: crate::protocol::now_millis() + 60_000,
            integrity_hash: "h".to_string(),
            is_outgoing: true,
        };
        store.insert(&record).await.unwrap();

        let (tx, mut rx) = broadcast::channel(16);
        let scheduler = RetryScheduler::new(store.clone(), fast_config(), tx);
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            succeed_on: 100,
        });
        scheduler.set_executor(executor).await;

        scheduler.schedule("m1".to_string(), 0);
        scheduler.mark_delivered("m1").await;

        let updated = store.get("m1").await.unwrap().unwrap();
        assert_eq!(updated.status, MessageStatus::Delivered);

        // Drain a bit to make sure no further events fire for this id.
        let _ = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    }

    #[tokio::test]
    async fn max_retries_exceeded_marks_failed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let record = crate::protocol::MessageRecord {
            message_id: "m2".to_string(),
            content: "hi".to_string(),
            sender_id: "self".to_string(),
            recipient_id: "bob".to_string(),
            timestamp: 1,
            status: MessageStatus::Pending,
            hop_count: 0,
            ttl: crate::protocol::now_millis() + 60_000,
            integrity_hash: "h".to_string(),
            is_outgoing: true,
        };
        store.insert(&record).await.unwrap();

        let (tx, _rx) = broadcast::channel(16);
        let scheduler = RetryScheduler::new(store.clone(), fast_config(), tx);
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            succeed_on: 100,
        });
        scheduler.set_executor(executor).await;

        scheduler.schedule("m2".to_string(), 3);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let updated = store.get("m2").await.unwrap().unwrap();
        assert_eq!(updated.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn reconnect_retry_supersedes_pending_timer_instead_of_racing_it() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let record = crate::protocol::MessageRecord {
            message_id: "m3".to_string(),
            content: "hi".to_string(),
            sender_id: "self".to_string(),
            recipient_id: "bob".to_string(),
            timestamp: 1,
            status: MessageStatus::Pending,
            hop_count: 0,
            ttl: crate::protocol::now_millis() + 60_000,
            integrity_hash: "h".to_string(),
            is_outgoing: true,
        };
        store.insert(&record).await.unwrap();

        // A slow backoff timer (well past the reconnect retry's ~1s) so the
        // reconnect path below is observably the one that wins.
        let config = SchedulerConfig {
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_secs(3600),
            max_retry_delay: Duration::from_secs(3600),
        };
        let (tx, _rx) = broadcast::channel(16);
        let scheduler = RetryScheduler::new(store.clone(), config, tx);
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            succeed_on: 1,
        });
        scheduler.set_executor(executor.clone()).await;

        scheduler.schedule("m3".to_string(), 0);
        assert_eq!(scheduler.entries.len(), 1);

        scheduler.retry_pending_on_connection_restored().await;
        // Still exactly one managed entry for the id: the reconnect path
        // cancelled the original timer and replaced it rather than adding a
        // second, racing one.
        assert_eq!(scheduler.entries.len(), 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let updated = store.get("m3").await.unwrap().unwrap();
        assert_eq!(updated.status, MessageStatus::Sent);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        // The superseded hour-long timer must never fire and re-retry.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }
}
