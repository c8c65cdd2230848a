//! Composition root: owns every component and wires transport events,
//! periodic maintenance, and the UI-facing up-call API together.

use crate::config::Config;
use crate::crypto::CryptoBox;
use crate::database::{MessageCounts, MessageStore};
use crate::error::{Error, Result};
use crate::mesh::Forwarder;
use crate::protocol::{
    now_millis, EngineEvent, FriendRecord, MessageRecord, MessageStatus, UserId,
};
use crate::scheduler::{RetryScheduler, SchedulerConfig};
use crate::transport::{PeerTransport, TransportEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const STATS_INTERVAL: Duration = Duration::from_secs(120);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);
const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Owns the message store, crypto, forwarder, retry scheduler, and
/// transport for one running engine instance, and exposes the async API
/// the UI layer drives.
pub struct EngineCoordinator {
    store: Arc<MessageStore>,
    crypto: Arc<CryptoBox>,
    forwarder: Arc<Forwarder>,
    scheduler: Arc<RetryScheduler>,
    transport: Arc<dyn PeerTransport>,
    events_tx: broadcast::Sender<EngineEvent>,
    self_user_id: UserId,
    max_message_length: usize,
    default_ttl_ms: i64,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl EngineCoordinator {
    /// Build every component and start the background tasks that drive the
    /// engine: transport event dispatch and periodic maintenance.
    pub async fn new(
        config: Config,
        transport: Arc<dyn PeerTransport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Result<Arc<Self>> {
        let crypto = Arc::new(CryptoBox::from_seed(&config.engine.crypto_seed));
        let self_user_id = load_or_create_self_id(&config.app.data_dir, &crypto)?;

        let store = Arc::new(MessageStore::new(config.database.clone(), self_user_id.clone()).await?);
        let (events_tx, _events_rx) = broadcast::channel(512);

        let scheduler_config = SchedulerConfig {
            max_retry_attempts: config.engine.max_retry_attempts,
            initial_retry_delay: config.engine.initial_retry_delay,
            max_retry_delay: config.engine.max_retry_delay,
        };
        let scheduler = RetryScheduler::new(store.clone(), scheduler_config, events_tx.clone());

        let forwarder = Forwarder::new(
            store.clone(),
            transport.clone(),
            crypto.clone(),
            scheduler.clone(),
            events_tx.clone(),
            self_user_id.clone(),
            config.engine.max_hops,
            config.engine.seen_set_limit,
            config.engine.ack_ttl,
        );
        scheduler.set_executor(forwarder.clone()).await;

        transport.start_advertising().await?;
        transport.start_discovery().await?;

        let engine = Arc::new(Self {
            store,
            crypto,
            forwarder,
            scheduler,
            transport,
            events_tx,
            self_user_id,
            max_message_length: config.engine.max_message_length,
            default_ttl_ms: config.engine.default_ttl.as_millis() as i64,
            background: std::sync::Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        handles.push(engine.clone().spawn_transport_dispatch(transport_events));
        handles.push(engine.clone().spawn_maintenance());
        handles.push(engine.clone().spawn_stats());
        handles.push(engine.clone().spawn_rediscovery());
        *engine.background.lock().unwrap() = handles;

        Ok(engine)
    }

    fn spawn_transport_dispatch(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::EndpointConnected { endpoint_id, name } => {
                        log::info!("peer connected: {endpoint_id} ({name})");
                        self.scheduler.retry_pending_on_connection_restored().await;
                        let _ = self.events_tx.send(EngineEvent::PeerConnected {
                            endpoint_id,
                            name,
                        });
                    }
                    TransportEvent::EndpointDisconnected { endpoint_id } => {
                        log::info!("peer disconnected: {endpoint_id}");
                        let _ = self
                            .events_tx
                            .send(EngineEvent::PeerDisconnected { endpoint_id });
                    }
                    TransportEvent::EndpointDiscovered { endpoint_id } => {
                        log::debug!("peer discovered: {endpoint_id}");
                    }
                    TransportEvent::BytesReceived { bytes, .. } => {
                        self.forwarder.ingest(bytes).await;
                    }
                }
            }
        })
    }

    fn spawn_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if let Err(e) = self.cleanup_expired().await {
                    log::warn!("periodic cleanup failed: {e}");
                }
            }
        })
    }

    fn spawn_stats(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.tick().await;
            let counts = self.store.observe_counts();
            loop {
                ticker.tick().await;
                let snapshot = *counts.borrow();
                log::info!(
                    "stats: total={} pending={} delivered={}",
                    snapshot.total,
                    snapshot.pending,
                    snapshot.delivered
                );
            }
        })
    }

    fn spawn_rediscovery(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REDISCOVERY_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if self.transport.connected_endpoints().await.is_empty() {
                    if let Err(e) = self.transport.start_discovery().await {
                        log::warn!("rediscovery failed: {e}");
                    }
                }
            }
        })
    }

    /// Create and persist an outgoing message, then hand it to the
    /// forwarder's egress path. Returns the generated `message_id`.
    pub async fn send_text(&self, recipient_id: &str, body: &str) -> Result<String> {
        if body.is_empty() || body.chars().count() > self.max_message_length {
            return Err(Error::Validation(format!(
                "message body must be 1..={} code points",
                self.max_message_length
            )));
        }

        let now = now_millis();
        let message_id = self.crypto_random_id();
        // Invariant 2: integrity_hash is always over plaintext, regardless
        // of whether the wire copy ends up encrypted.
        let integrity_hash = self
            .crypto
            .content_hash(body, &self.self_user_id, recipient_id, now);
        let record = MessageRecord {
            message_id: message_id.clone(),
            content: body.to_string(),
            sender_id: self.self_user_id.clone(),
            recipient_id: recipient_id.to_string(),
            timestamp: now,
            status: MessageStatus::Pending,
            hop_count: 0,
            ttl: now + self.default_ttl_ms,
            integrity_hash,
            is_outgoing: true,
        };

        self.store.insert(&record).await?;
        self.forwarder.send_local(record).await;
        Ok(message_id)
    }

    fn crypto_random_id(&self) -> String {
        self.crypto.random_id()
    }

    pub fn observe_messages(&self) -> watch::Receiver<Vec<MessageRecord>> {
        self.store.observe_messages()
    }

    pub async fn observe_conversation(
        &self,
        u1: &str,
        u2: &str,
    ) -> Result<watch::Receiver<Vec<MessageRecord>>> {
        self.store.observe_conversation(u1, u2).await
    }

    /// Live view of aggregate message counts, re-emitted alongside
    /// `observe_messages` on every write.
    pub fn counts(&self) -> watch::Receiver<MessageCounts> {
        self.store.observe_counts()
    }

    /// Subscribe to the engine's down-call event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    pub fn self_user_id(&self) -> &str {
        &self.self_user_id
    }

    /// Prune expired messages, trim the forwarder's SeenSet bookkeeping,
    /// and garbage-collect stale retry state. Idempotent; also called by
    /// the periodic maintenance task.
    pub async fn cleanup_expired(&self) -> Result<()> {
        let now = now_millis();
        let deleted = self.store.delete_expired(now).await?;
        if deleted > 0 {
            log::debug!("pruned {deleted} expired messages");
        }
        self.forwarder.cleanup().await;
        self.scheduler.cleanup().await;
        Ok(())
    }

    // -- Friends passthrough ---------------------------------------------

    pub async fn add_friend(&self, friend: &FriendRecord) -> Result<()> {
        self.store.add_friend(friend).await
    }

    pub async fn remove_friend(&self, user_id: &str) -> Result<()> {
        self.store.remove_friend(user_id).await
    }

    pub async fn rename_friend(&self, user_id: &str, nickname: &str) -> Result<()> {
        self.store.rename_friend(user_id, nickname).await
    }

    pub async fn set_favorite(&self, user_id: &str, is_favorite: bool) -> Result<()> {
        self.store.set_favorite(user_id, is_favorite).await
    }

    pub async fn list_friends(&self) -> Result<Vec<FriendRecord>> {
        self.store.list_friends().await
    }

    /// Cancel all background tasks. Per the cancellation contract, this
    /// should complete within a few seconds; tasks that don't yield in
    /// time are aborted rather than awaited indefinitely.
    pub async fn shutdown(&self) -> Result<()> {
        self.transport.stop_all().await?;
        let handles = std::mem::take(&mut *self.background.lock().unwrap());
        let abort_all = async {
            for handle in &handles {
                handle.abort();
            }
        };
        let _ = tokio::time::timeout(SHUTDOWN_BUDGET, abort_all).await;
        Ok(())
    }
}

fn load_or_create_self_id(data_dir: &Path, crypto: &CryptoBox) -> Result<UserId> {
    std::fs::create_dir_all(data_dir).map_err(Error::Io)?;
    let path = data_dir.join("self_id");

    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let generated = crypto.random_id();
    std::fs::write(&path, &generated).map_err(Error::Io)?;
    Ok(generated)
}
