//! Ingress/egress message pipeline.
//!
//! All SeenSet and per-message bookkeeping lives inside a single dedicated
//! worker task (see `ForwarderWorker::run`), reached only through an
//! `mpsc` command channel. This keeps the pipeline free of locking: nothing
//! outside the worker ever touches the SeenSet.

use super::seen_set::SeenSet;
use crate::crypto::CryptoBox;
use crate::database::MessageStore;
use crate::error::{Error, Result};
use crate::protocol::{
    now_millis, EngineEvent, MessageRecord, MessageStatus, MessageType, NetworkMessage, UserId,
    WireCodec, BROADCAST_RECIPIENT,
};
use crate::scheduler::{EgressExecutor, RetryScheduler};
use crate::transport::PeerTransport;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

enum Command {
    Ingest {
        bytes: Vec<u8>,
    },
    SendLocal {
        record: MessageRecord,
    },
    RetryEgress {
        message_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Cleanup,
}

/// Ingress/egress pipeline for one engine instance. Cheap to clone (an
/// `Arc` handle to the worker's command channel).
pub struct Forwarder {
    command_tx: mpsc::Sender<Command>,
}

impl Forwarder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MessageStore>,
        transport: Arc<dyn PeerTransport>,
        crypto: Arc<CryptoBox>,
        scheduler: Arc<RetryScheduler>,
        events: broadcast::Sender<EngineEvent>,
        self_user_id: UserId,
        max_hops: u32,
        seen_set_limit: usize,
        ack_ttl: Duration,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(512);
        let worker = ForwarderWorker {
            store,
            transport,
            crypto,
            scheduler,
            events,
            self_user_id,
            max_hops,
            ack_ttl_ms: ack_ttl.as_millis() as i64,
            seen: SeenSet::new(seen_set_limit),
        };
        tokio::spawn(worker.run(command_rx));
        Arc::new(Self { command_tx })
    }

    /// Feed raw bytes received from `from_endpoint` into the pipeline.
    pub async fn ingest(&self, bytes: Vec<u8>) {
        let _ = self.command_tx.send(Command::Ingest { bytes }).await;
    }

    /// Begin the egress path for a freshly created outgoing `MessageRecord`.
    pub async fn send_local(&self, record: MessageRecord) {
        let _ = self.command_tx.send(Command::SendLocal { record }).await;
    }

    /// Drop stale worker-side bookkeeping. Most of SeenSet's cleanup is the
    /// coarse purge on overflow; this exists as the hook periodic
    /// maintenance calls alongside `MessageStore`/`RetryScheduler` cleanup.
    pub async fn cleanup(&self) {
        let _ = self.command_tx.send(Command::Cleanup).await;
    }
}

#[async_trait]
impl EgressExecutor for Forwarder {
    async fn retry_egress(&self, message_id: &str) -> Result<bool> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::RetryEgress {
                message_id: message_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::Internal("forwarder worker stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("forwarder worker dropped reply".to_string()))?
    }
}

struct ForwarderWorker {
    store: Arc<MessageStore>,
    transport: Arc<dyn PeerTransport>,
    crypto: Arc<CryptoBox>,
    scheduler: Arc<RetryScheduler>,
    events: broadcast::Sender<EngineEvent>,
    self_user_id: UserId,
    max_hops: u32,
    ack_ttl_ms: i64,
    seen: SeenSet,
}

impl ForwarderWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Ingest { bytes } => self.handle_ingest(bytes).await,
                Command::SendLocal { record } => self.handle_send_local(record).await,
                Command::RetryEgress { message_id, reply } => {
                    let result = self.handle_retry_egress(&message_id).await;
                    let _ = reply.send(result);
                }
                Command::Cleanup => {
                    // SeenSet has no age-based eviction to run here; it
                    // purges itself on overflow in `SeenSet::insert`.
                }
            }
        }
    }

    async fn handle_ingest(&mut self, bytes: Vec<u8>) {
        let message = match WireCodec::decode(&bytes) {
            Ok(m) => m,
            Err(_) => return,
        };

        let now_ms = now_millis();
        if message.ttl < now_ms {
            return;
        }

        if self.seen.contains(&message.message_id) {
            let _ = self.events.send(EngineEvent::DuplicateFiltered {
                message_id: message.message_id.clone(),
            });
            return;
        }

        let plaintext = match self.recover_plaintext(&message) {
            Some(p) => p,
            None => return,
        };

        let expected_hash = self.crypto.content_hash(
            &plaintext,
            &message.sender_id,
            &message.recipient_id,
            message.timestamp,
        );
        if expected_hash != message.hash {
            return;
        }

        self.seen.insert(message.message_id.clone());

        match message.message_type {
            MessageType::Text => self.handle_text(message, plaintext, now_ms).await,
            MessageType::Ack => self.handle_ack(&message).await,
        }
    }

    fn recover_plaintext(&self, message: &NetworkMessage) -> Option<String> {
        if !message.encrypted {
            return Some(message.content.clone());
        }
        let blob = serde_json::from_str(&message.content).ok()?;
        let bytes = self.crypto.decrypt(&blob).ok()?;
        String::from_utf8(bytes).ok()
    }

    async fn handle_text(&mut self, message: NetworkMessage, plaintext: String, now_ms: i64) {
        let record = MessageRecord {
            message_id: message.message_id.clone(),
            content: plaintext,
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            timestamp: message.timestamp,
            status: MessageStatus::Pending,
            hop_count: message.hop_count,
            ttl: message.ttl,
            integrity_hash: message.hash.clone(),
            is_outgoing: false,
        };

        if self.store.insert(&record).await.is_err() {
            return;
        }
        let _ = self.events.send(EngineEvent::MessageReceived {
            message_id: message.message_id.clone(),
            sender_id: message.sender_id.clone(),
        });

        let for_us =
            message.recipient_id == self.self_user_id || message.recipient_id == BROADCAST_RECIPIENT;
        if for_us {
            let _ = self
                .store
                .update_status(&message.message_id, MessageStatus::Delivered)
                .await;
            self.scheduler.mark_delivered(&message.message_id).await;
            let _ = self.events.send(EngineEvent::Delivered {
                message_id: message.message_id.clone(),
            });

            if message.recipient_id != BROADCAST_RECIPIENT {
                self.send_ack(&message.message_id, &message.sender_id).await;
            }
        }

        self.forward(message, now_ms).await;
    }

    async fn handle_ack(&mut self, message: &NetworkMessage) {
        let Some(original_id) = message.content.strip_prefix("ACK:") else {
            return;
        };
        let original_id = original_id.to_string();
        let _ = self
            .store
            .update_status(&original_id, MessageStatus::Delivered)
            .await;
        self.scheduler.mark_delivered(&original_id).await;
        let _ = self.events.send(EngineEvent::Delivered {
            message_id: original_id,
        });
    }

    async fn send_ack(&mut self, original_id: &str, original_sender: &str) {
        let now_ms = now_millis();
        let content = format!("ACK:{original_id}");
        let hash =
            self.crypto
                .content_hash(&content, &self.self_user_id, original_sender, now_ms);
        let signature = self.crypto.sign(&content, &self.self_user_id, now_ms);

        let ack = NetworkMessage {
            message_type: MessageType::Ack,
            message_id: self.crypto.random_id(),
            sender_id: self.self_user_id.clone(),
            recipient_id: original_sender.to_string(),
            content,
            timestamp: now_ms,
            hop_count: 0,
            ttl: now_ms + self.ack_ttl_ms,
            hash,
            encrypted: false,
            signature,
            forwarder_path: String::new(),
        };

        if let Ok(bytes) = WireCodec::encode(&ack) {
            self.seen.insert(ack.message_id.clone());
            let _ = self.transport.broadcast(bytes).await;
        }
    }

    /// ACKs never re-enter this path: `handle_ingest` dispatches on
    /// `message_type` and only `TEXT` reaches `handle_text`, which is the
    /// only caller of `forward`.
    async fn forward(&mut self, message: NetworkMessage, now_ms: i64) {
        if message.hop_count >= self.max_hops || message.ttl < now_ms {
            return;
        }

        let peers = self.transport.connected_endpoints().await;
        if peers.is_empty() {
            return;
        }

        let mut forwarded = message;
        forwarded.hop_count += 1;
        forwarded.forwarder_path = if forwarded.forwarder_path.is_empty() {
            format!("-> {}", self.self_user_id)
        } else {
            format!("{} -> {}", forwarded.forwarder_path, self.self_user_id)
        };

        if let Ok(bytes) = WireCodec::encode(&forwarded) {
            if self.transport.broadcast(bytes).await.is_ok() {
                let _ = self.events.send(EngineEvent::Forwarded {
                    message_id: forwarded.message_id,
                    peer_count: peers.len(),
                });
            }
        }
    }

    async fn handle_send_local(&mut self, record: MessageRecord) {
        match self.attempt_egress(&record).await {
            Ok(true) => {
                let _ = self
                    .store
                    .update_status(&record.message_id, MessageStatus::Sent)
                    .await;
            }
            Ok(false) => {
                self.scheduler.schedule(record.message_id.clone(), 0);
            }
            Err(e) => {
                let _ = self
                    .store
                    .update_status(&record.message_id, MessageStatus::Failed)
                    .await;
                let _ = self.events.send(EngineEvent::Failed {
                    message_id: record.message_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn handle_retry_egress(&mut self, message_id: &str) -> Result<bool> {
        let record = match self.store.get(message_id).await? {
            Some(record) => record,
            None => return Ok(false),
        };
        self.attempt_egress(&record).await
    }

    /// Encrypt, hash, sign, mark seen (to suppress a self-echo), then
    /// broadcast if any peer is connected. Returns whether it was actually
    /// sent; the caller decides between `SENT` and scheduling a retry.
    async fn attempt_egress(&mut self, record: &MessageRecord) -> Result<bool> {
        let blob = self.crypto.encrypt(record.content.as_bytes())?;
        let content =
            serde_json::to_string(&blob).map_err(|e| Error::EncodeFailed(e.to_string()))?;
        let hash = self.crypto.content_hash(
            &record.content,
            &record.sender_id,
            &record.recipient_id,
            record.timestamp,
        );
        let signature = self
            .crypto
            .sign(&record.content, &record.sender_id, record.timestamp);

        let message = NetworkMessage {
            message_type: MessageType::Text,
            message_id: record.message_id.clone(),
            sender_id: record.sender_id.clone(),
            recipient_id: record.recipient_id.clone(),
            content,
            timestamp: record.timestamp,
            hop_count: record.hop_count,
            ttl: record.ttl,
            hash,
            encrypted: true,
            signature,
            forwarder_path: String::new(),
        };

        let bytes = WireCodec::encode(&message)?;
        self.seen.insert(record.message_id.clone());

        let peers = self.transport.connected_endpoints().await;
        if peers.is_empty() {
            return Ok(false);
        }
        self.transport.broadcast(bytes).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::scheduler::SchedulerConfig;
    use crate::transport::TcpTransport;
    use tempfile::TempDir;
    use tokio::time::sleep;

    async fn store(dir: &TempDir, user: &str) -> Arc<MessageStore> {
        Arc::new(
            MessageStore::new(
                DatabaseConfig {
                    path: dir.path().join(format!("{user}.db")),
                    max_connections: 2,
                    connection_timeout: Duration::from_secs(2),
                    enable_wal: true,
                },
                user,
            )
            .await
            .unwrap(),
        )
    }

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(20),
            max_retry_delay: Duration::from_millis(100),
        }
    }

    struct Harness {
        forwarder: Arc<Forwarder>,
        store: Arc<MessageStore>,
    }

    async fn build(
        dir: &TempDir,
        user: &str,
        transport: Arc<dyn PeerTransport>,
    ) -> Harness {
        let store = store(dir, user).await;
        let (events, _rx) = broadcast::channel(64);
        let scheduler = RetryScheduler::new(store.clone(), scheduler_config(), events.clone());
        let crypto = Arc::new(CryptoBox::from_seed("forwarder-test-seed"));
        let forwarder = Forwarder::new(
            store.clone(),
            transport,
            crypto,
            scheduler.clone(),
            events,
            user.to_string(),
            5,
            1000,
            Duration::from_secs(60),
        );
        scheduler.set_executor(forwarder.clone()).await;
        Harness { forwarder, store }
    }

    #[tokio::test]
    async fn direct_message_is_delivered_and_acked() {
        let dir = TempDir::new().unwrap();

        let (transport_a, mut events_a) = TcpTransport::new(19001);
        let transport_a = Arc::new(transport_a);
        let (transport_b, mut events_b) = TcpTransport::new(19002);
        let transport_b = Arc::new(transport_b);

        transport_a.start_advertising().await.unwrap();
        transport_b.start_advertising().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        transport_a
            .connect("b", "127.0.0.1:19002".parse().unwrap())
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let a = build(&dir, "alice", transport_a.clone()).await;
        let b = build(&dir, "bob", transport_b.clone()).await;

        // Mirror EngineCoordinator's dispatch: every BytesReceived event
        // feeds straight into that side's forwarder.
        let a_forwarder = a.forwarder.clone();
        tokio::spawn(async move {
            while let Some(event) = events_a.recv().await {
                if let crate::transport::TransportEvent::BytesReceived { bytes, .. } = event {
                    a_forwarder.ingest(bytes).await;
                }
            }
        });
        let b_forwarder = b.forwarder.clone();
        tokio::spawn(async move {
            while let Some(event) = events_b.recv().await {
                if let crate::transport::TransportEvent::BytesReceived { bytes, .. } = event {
                    b_forwarder.ingest(bytes).await;
                }
            }
        });

        let now = now_millis();
        let record = MessageRecord {
            message_id: "msg-1".to_string(),
            content: "hi bob".to_string(),
            sender_id: "alice".to_string(),
            recipient_id: "bob".to_string(),
            timestamp: now,
            status: MessageStatus::Pending,
            hop_count: 0,
            ttl: now + 60_000,
            integrity_hash: String::new(),
            is_outgoing: true,
        };
        a.store.insert(&record).await.unwrap();
        a.forwarder.send_local(record).await;

        sleep(Duration::from_millis(200)).await;
        let delivered = b.store.get("msg-1").await.unwrap().unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);

        // The ACK should flow back and mark alice's copy delivered too.
        sleep(Duration::from_millis(100)).await;
        let sender_copy = a.store.get("msg-1").await.unwrap().unwrap();
        assert_eq!(sender_copy.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn duplicate_ingest_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (transport, _events) = TcpTransport::new(19003);
        let transport = Arc::new(transport);
        let harness = build(&dir, "carol", transport).await;

        let now = now_millis();
        let crypto = CryptoBox::from_seed("forwarder-test-seed");
        let content = "hello".to_string();
        let blob = crypto.encrypt(content.as_bytes()).unwrap();
        let hash = crypto.content_hash(&content, "dave", "carol", now);
        let message = NetworkMessage {
            message_type: MessageType::Text,
            message_id: "dup-1".to_string(),
            sender_id: "dave".to_string(),
            recipient_id: "carol".to_string(),
            content: serde_json::to_string(&blob).unwrap(),
            timestamp: now,
            hop_count: 0,
            ttl: now + 60_000,
            hash,
            encrypted: true,
            signature: crypto.sign(&content, "dave", now),
            forwarder_path: String::new(),
        };
        let bytes = WireCodec::encode(&message).unwrap();

        harness.forwarder.ingest(bytes.clone()).await;
        harness.forwarder.ingest(bytes).await;
        sleep(Duration::from_millis(50)).await;

        let stored = harness.store.observe_messages().borrow().clone();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn tampered_hash_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (transport, _events) = TcpTransport::new(19004);
        let transport = Arc::new(transport);
        let harness = build(&dir, "erin", transport).await;

        let now = now_millis();
        let message = NetworkMessage {
            message_type: MessageType::Text,
            message_id: "tampered-1".to_string(),
            sender_id: "frank".to_string(),
            recipient_id: "erin".to_string(),
            content: "hello".to_string(),
            timestamp: now,
            hop_count: 0,
            ttl: now + 60_000,
            hash: "wrong-hash".to_string(),
            encrypted: false,
            signature: String::new(),
            forwarder_path: String::new(),
        };
        let bytes = WireCodec::encode(&message).unwrap();
        harness.forwarder.ingest(bytes).await;
        sleep(Duration::from_millis(50)).await;

        assert!(harness.store.get("tampered-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_ttl_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (transport, _events) = TcpTransport::new(19005);
        let transport = Arc::new(transport);
        let harness = build(&dir, "gina", transport).await;

        let now = now_millis();
        let crypto = CryptoBox::from_seed("forwarder-test-seed");
        let hash = crypto.content_hash("late", "hank", "gina", now - 120_000);
        let message = NetworkMessage {
            message_type: MessageType::Text,
            message_id: "expired-1".to_string(),
            sender_id: "hank".to_string(),
            recipient_id: "gina".to_string(),
            content: "late".to_string(),
            timestamp: now - 120_000,
            hop_count: 0,
            ttl: now - 60_000,
            hash,
            encrypted: false,
            signature: String::new(),
            forwarder_path: String::new(),
        };
        let bytes = WireCodec::encode(&message).unwrap();
        harness.forwarder.ingest(bytes).await;
        sleep(Duration::from_millis(50)).await;

        assert!(harness.store.get("expired-1").await.unwrap().is_none());
    }
}
