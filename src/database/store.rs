//! Message and friend persistence with observable live-query views.

use super::DatabasePool;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::protocol::{FriendRecord, MessageRecord, MessageStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::watch;

/// Persistent log of messages and friends, backed by SQLite.
///
/// Writes go through `DatabasePool`'s bounded connection pool; reads that
/// feed the UI are exposed as `watch` channels that re-publish a fresh
/// snapshot after every successful mutation (the "live view" contract).
pub struct MessageStore {
    pool: Arc<DatabasePool>,
    self_user_id: String,
    messages_tx: watch::Sender<Vec<MessageRecord>>,
    messages_rx: watch::Receiver<Vec<MessageRecord>>,
    counts_tx: watch::Sender<MessageCounts>,
    counts_rx: watch::Receiver<MessageCounts>,
}

impl MessageStore {
    pub async fn new(config: DatabaseConfig, self_user_id: impl Into<String>) -> Result<Self> {
        let pool = Arc::new(DatabasePool::new(config).await?);
        let (tx, rx) = watch::channel(Vec::new());
        let (counts_tx, counts_rx) = watch::channel(MessageCounts {
            total: 0,
            pending: 0,
            delivered: 0,
        });

        let store = Self {
            pool,
            self_user_id: self_user_id.into(),
            messages_tx: tx,
            messages_rx: rx,
            counts_tx,
            counts_rx,
        };

        // Invariant 7: is_online is transient, reset on every engine start.
        store.reset_online_status().await?;
        store.republish_messages().await?;

        Ok(store)
    }

    async fn reset_online_status(&self) -> Result<()> {
        self.pool
            .with_connection(|conn| {
                conn.execute("UPDATE friends SET is_online = 0", [])
                    .map_err(|e| Error::Database(e.to_string()))?;
                Ok(())
            })
            .await
    }

    /// Re-read all messages ordered by timestamp and publish to the live view.
    async fn republish_messages(&self) -> Result<()> {
        let rows = self
            .pool
            .with_connection(|conn| {
                let mut stmt = conn
                    .prepare("SELECT * FROM messages ORDER BY timestamp ASC")
                    .map_err(|e| Error::Database(e.to_string()))?;
                let rows = stmt
                    .query_map([], row_to_message)
                    .map_err(|e| Error::Database(e.to_string()))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| Error::Database(e.to_string()))?;
                Ok(rows)
            })
            .await?;

        let _ = self.counts_tx.send(counts_from_rows(&rows));
        let _ = self.messages_tx.send(rows);
        Ok(())
    }

    /// Live view of every message, ordered by timestamp, re-emitted on
    /// every successful write.
    pub fn observe_messages(&self) -> watch::Receiver<Vec<MessageRecord>> {
        self.messages_rx.clone()
    }

    /// Live view of aggregate message counts, re-emitted from the same
    /// snapshot `observe_messages` publishes -- the two never disagree.
    pub fn observe_counts(&self) -> watch::Receiver<MessageCounts> {
        self.counts_rx.clone()
    }

    /// Live view of a single conversation between `u1` and `u2`.
    pub async fn observe_conversation(
        &self,
        u1: &str,
        u2: &str,
    ) -> Result<watch::Receiver<Vec<MessageRecord>>> {
        let all = self.observe_messages();
        let (tx, rx) = watch::channel(conversation_subset(&all.borrow(), u1, u2));

        let u1 = u1.to_string();
        let u2 = u2.to_string();
        let mut source = all;
        tokio::spawn(async move {
            loop {
                if source.changed().await.is_err() {
                    break;
                }
                let subset = conversation_subset(&source.borrow(), &u1, &u2);
                if tx.send(subset).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Insert a message, replacing any existing row with the same id
    /// (invariant 1: idempotent insert-or-replace).
    pub async fn insert(&self, record: &MessageRecord) -> Result<()> {
        let record = record.clone();
        self.pool
            .with_connection(move |conn| insert_or_replace(conn, &record))
            .await?;
        self.republish_messages().await
    }

    /// Update a message's status by id. No-op if the id does not exist, or
    /// if the current status cannot monotonically transition to `status`
    /// (invariant 5: `DELIVERED`/`FAILED` are terminal and never regress).
    pub async fn update_status(&self, message_id: &str, status: MessageStatus) -> Result<()> {
        let message_id = message_id.to_string();
        let changed = self
            .pool
            .with_connection(move |conn| {
                let current: Option<String> = conn
                    .query_row(
                        "SELECT status FROM messages WHERE message_id = ?1",
                        params![message_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| Error::Database(e.to_string()))?;

                let Some(current) = current else {
                    return Ok(false);
                };
                if !status_from_str(&current).can_transition_to(status) {
                    return Ok(false);
                }

                conn.execute(
                    "UPDATE messages SET status = ?1 WHERE message_id = ?2",
                    params![status_to_str(status), message_id],
                )
                .map_err(|e| Error::Database(e.to_string()))?;
                Ok(true)
            })
            .await?;

        if changed {
            self.republish_messages().await?;
        }
        Ok(())
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let message_id = message_id.to_string();
        self.pool
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT * FROM messages WHERE message_id = ?1",
                    params![message_id],
                    row_to_message,
                )
                .optional()
                .map_err(|e| Error::Database(e.to_string()))
            })
            .await
    }

    /// Outgoing messages still `PENDING`, used by `RetryScheduler` to flush
    /// on reconnect.
    pub async fn list_pending_outgoing(&self) -> Result<Vec<MessageRecord>> {
        self.pool
            .with_connection(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM messages WHERE is_outgoing = 1 AND status = 'PENDING'
                         ORDER BY timestamp ASC",
                    )
                    .map_err(|e| Error::Database(e.to_string()))?;
                stmt.query_map([], row_to_message)
                    .map_err(|e| Error::Database(e.to_string()))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| Error::Database(e.to_string()))
            })
            .await
    }

    /// Incoming messages not yet delivered, within TTL -- eligible to be
    /// re-forwarded.
    pub async fn list_forwardable(&self, now_ms: i64) -> Result<Vec<MessageRecord>> {
        self.pool
            .with_connection(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM messages WHERE is_outgoing = 0 AND status != 'DELIVERED'
                         AND ttl > ?1 ORDER BY timestamp ASC",
                    )
                    .map_err(|e| Error::Database(e.to_string()))?;
                stmt.query_map(params![now_ms], row_to_message)
                    .map_err(|e| Error::Database(e.to_string()))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| Error::Database(e.to_string()))
            })
            .await
    }

    /// Delete every message whose `ttl < now`. Idempotent.
    pub async fn delete_expired(&self, now_ms: i64) -> Result<usize> {
        let deleted = self
            .pool
            .with_connection(move |conn| {
                conn.execute("DELETE FROM messages WHERE ttl < ?1", params![now_ms])
                    .map_err(|e| Error::Database(e.to_string()))
            })
            .await?;
        if deleted > 0 {
            self.republish_messages().await?;
        }
        Ok(deleted)
    }

    pub fn self_user_id(&self) -> &str {
        &self.self_user_id
    }

    // -- Friends --------------------------------------------------------

    pub async fn add_friend(&self, friend: &FriendRecord) -> Result<()> {
        let friend = friend.clone();
        self.pool
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO friends (user_id, nickname, endpoint_id, last_seen_ms, added_ms,
                        is_online, total_messages, is_favorite)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(user_id) DO UPDATE SET nickname = excluded.nickname",
                    params![
                        friend.user_id,
                        friend.nickname,
                        friend.endpoint_id,
                        friend.last_seen_ms,
                        friend.added_ms,
                        friend.is_online as i64,
                        friend.total_messages as i64,
                        friend.is_favorite as i64,
                    ],
                )
                .map_err(|e| Error::Database(e.to_string()))?;
                Ok(())
            })
            .await
    }

    pub async fn remove_friend(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.to_string();
        self.pool
            .with_connection(move |conn| {
                conn.execute("DELETE FROM friends WHERE user_id = ?1", params![user_id])
                    .map_err(|e| Error::Database(e.to_string()))?;
                Ok(())
            })
            .await
    }

    pub async fn rename_friend(&self, user_id: &str, nickname: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let nickname = nickname.to_string();
        self.pool
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE friends SET nickname = ?1 WHERE user_id = ?2",
                    params![nickname, user_id],
                )
                .map_err(|e| Error::Database(e.to_string()))?;
                Ok(())
            })
            .await
    }

    pub async fn set_favorite(&self, user_id: &str, is_favorite: bool) -> Result<()> {
        let user_id = user_id.to_string();
        self.pool
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE friends SET is_favorite = ?1 WHERE user_id = ?2",
                    params![is_favorite as i64, user_id],
                )
                .map_err(|e| Error::Database(e.to_string()))?;
                Ok(())
            })
            .await
    }

    pub async fn set_online(&self, user_id: &str, endpoint_id: Option<&str>, is_online: bool, now_ms: i64) -> Result<()> {
        let user_id = user_id.to_string();
        let endpoint_id = endpoint_id.map(|s| s.to_string());
        self.pool
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE friends SET is_online = ?1, endpoint_id = ?2, last_seen_ms = ?3
                     WHERE user_id = ?4",
                    params![is_online as i64, endpoint_id, now_ms, user_id],
                )
                .map_err(|e| Error::Database(e.to_string()))?;
                Ok(())
            })
            .await
    }

    pub async fn increment_total_messages(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.to_string();
        self.pool
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE friends SET total_messages = total_messages + 1 WHERE user_id = ?1",
                    params![user_id],
                )
                .map_err(|e| Error::Database(e.to_string()))?;
                Ok(())
            })
            .await
    }

    pub async fn list_friends(&self) -> Result<Vec<FriendRecord>> {
        self.pool
            .with_connection(|conn| {
                let mut stmt = conn
                    .prepare("SELECT * FROM friends ORDER BY nickname ASC")
                    .map_err(|e| Error::Database(e.to_string()))?;
                stmt.query_map([], row_to_friend)
                    .map_err(|e| Error::Database(e.to_string()))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| Error::Database(e.to_string()))
            })
            .await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MessageCounts {
    pub total: u64,
    pub pending: u64,
    pub delivered: u64,
}

fn counts_from_rows(rows: &[MessageRecord]) -> MessageCounts {
    let total = rows.len() as u64;
    let pending = rows
        .iter()
        .filter(|m| m.status == MessageStatus::Pending)
        .count() as u64;
    let delivered = rows
        .iter()
        .filter(|m| m.status == MessageStatus::Delivered)
        .count() as u64;
    MessageCounts {
        total,
        pending,
        delivered,
    }
}

fn conversation_subset(messages: &[MessageRecord], u1: &str, u2: &str) -> Vec<MessageRecord> {
    messages
        .iter()
        .filter(|m| {
            (m.sender_id == u1 && m.recipient_id == u2) || (m.sender_id == u2 && m.recipient_id == u1)
        })
        .cloned()
        .collect()
}

fn insert_or_replace(conn: &mut Connection, record: &MessageRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (message_id, content, sender_id, recipient_id, timestamp, status,
            hop_count, ttl, integrity_hash, is_outgoing)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(message_id) DO UPDATE SET
            content = excluded.content,
            sender_id = excluded.sender_id,
            recipient_id = excluded.recipient_id,
            timestamp = excluded.timestamp,
            status = excluded.status,
            hop_count = excluded.hop_count,
            ttl = excluded.ttl,
            integrity_hash = excluded.integrity_hash,
            is_outgoing = excluded.is_outgoing",
        params![
            record.message_id,
            record.content,
            record.sender_id,
            record.recipient_id,
            record.timestamp,
            status_to_str(record.status),
            record.hop_count,
            record.ttl,
            record.integrity_hash,
            record.is_outgoing as i64,
        ],
    )
    .map_err(|e| Error::Database(e.to_string()))?;
    Ok(())
}

fn status_to_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Pending => "PENDING",
        MessageStatus::Sent => "SENT",
        MessageStatus::Delivered => "DELIVERED",
        MessageStatus::Failed => "FAILED",
    }
}

fn status_from_str(value: &str) -> MessageStatus {
    match value {
        "SENT" => MessageStatus::Sent,
        "DELIVERED" => MessageStatus::Delivered,
        "FAILED" => MessageStatus::Failed,
        _ => MessageStatus::Pending,
    }
}

fn row_to_message(row: &Row) -> rusqlite::Result<MessageRecord> {
    let status: String = row.get("status")?;
    let is_outgoing: i64 = row.get("is_outgoing")?;
    Ok(MessageRecord {
        message_id: row.get("message_id")?,
        content: row.get("content")?,
        sender_id: row.get("sender_id")?,
        recipient_id: row.get("recipient_id")?,
        timestamp: row.get("timestamp")?,
        status: status_from_str(&status),
        hop_count: row.get("hop_count")?,
        ttl: row.get("ttl")?,
        integrity_hash: row.get("integrity_hash")?,
        is_outgoing: is_outgoing != 0,
    })
}

fn row_to_friend(row: &Row) -> rusqlite::Result<FriendRecord> {
    let is_online: i64 = row.get("is_online")?;
    let is_favorite: i64 = row.get("is_favorite")?;
    let total_messages: i64 = row.get("total_messages")?;
    Ok(FriendRecord {
        user_id: row.get("user_id")?,
        nickname: row.get("nickname")?,
        endpoint_id: row.get("endpoint_id")?,
        last_seen_ms: row.get("last_seen_ms")?,
        added_ms: row.get("added_ms")?,
        is_online: is_online != 0,
        total_messages: total_messages as u64,
        is_favorite: is_favorite != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn db_config(dir: &TempDir) -> DatabaseConfig {
        DatabaseConfig {
            path: dir.path().join("store.db"),
            max_connections: 2,
            connection_timeout: Duration::from_secs(2),
            enable_wal: true,
        }
    }

    fn sample(id: &str, sender: &str, recipient: &str, ts: i64) -> MessageRecord {
        MessageRecord {
            message_id: id.to_string(),
            content: "hi".to_string(),
            sender_id: sender.to_string(),
            recipient_id: recipient.to_string(),
            timestamp: ts,
            status: MessageStatus::Pending,
            hop_count: 0,
            ttl: ts + 1000,
            integrity_hash: "hash".to_string(),
            is_outgoing: true,
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_by_message_id() {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(db_config(&dir), "self").await.unwrap();

        let mut record = sample("m1", "alice", "bob", 100);
        store.insert(&record).await.unwrap();
        record.status = MessageStatus::Sent;
        store.insert(&record).await.unwrap();

        let messages = store.observe_messages().borrow().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn update_status_never_regresses_a_terminal_status() {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(db_config(&dir), "self").await.unwrap();

        store.insert(&sample("m1", "alice", "bob", 100)).await.unwrap();
        store
            .update_status("m1", MessageStatus::Delivered)
            .await
            .unwrap();

        // A late retry firing after delivery must not regress the status.
        store.update_status("m1", MessageStatus::Sent).await.unwrap();
        let after_sent = store.get("m1").await.unwrap().unwrap();
        assert_eq!(after_sent.status, MessageStatus::Delivered);

        store.update_status("m1", MessageStatus::Failed).await.unwrap();
        let after_failed = store.get("m1").await.unwrap().unwrap();
        assert_eq!(after_failed.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn delete_expired_prunes_only_stale_rows() {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(db_config(&dir), "self").await.unwrap();

        store.insert(&sample("expired", "a", "b", 100)).await.unwrap();
        let mut fresh = sample("fresh", "a", "b", 100);
        fresh.ttl = 10_000;
        store.insert(&fresh).await.unwrap();

        let deleted = store.delete_expired(500).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.observe_messages().borrow().clone();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message_id, "fresh");
    }

    #[tokio::test]
    async fn counts_view_tracks_status_changes() {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(db_config(&dir), "self").await.unwrap();

        store.insert(&sample("m1", "alice", "bob", 1)).await.unwrap();
        store.insert(&sample("m2", "alice", "bob", 2)).await.unwrap();

        let counts = store.observe_counts();
        let snapshot = *counts.borrow();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.pending, 2);
        assert_eq!(snapshot.delivered, 0);

        store.update_status("m1", MessageStatus::Delivered).await.unwrap();
        let snapshot = *counts.borrow();
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.delivered, 1);
    }

    #[tokio::test]
    async fn conversation_view_filters_by_pair() {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(db_config(&dir), "self").await.unwrap();

        store.insert(&sample("m1", "alice", "bob", 1)).await.unwrap();
        store.insert(&sample("m2", "alice", "carol", 2)).await.unwrap();

        let conv = store.observe_conversation("alice", "bob").await.unwrap();
        let subset = conv.borrow().clone();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].message_id, "m1");
    }

    #[tokio::test]
    async fn friends_roundtrip_and_online_reset_on_start() {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(db_config(&dir), "self").await.unwrap();

        let friend = FriendRecord {
            user_id: "bob".to_string(),
            nickname: "Bob".to_string(),
            endpoint_id: None,
            last_seen_ms: 0,
            added_ms: 0,
            is_online: true,
            total_messages: 0,
            is_favorite: false,
        };
        store.add_friend(&friend).await.unwrap();
        store.set_online("bob", Some("ep1"), true, 42).await.unwrap();

        drop(store);
        let reopened = MessageStore::new(db_config(&dir), "self").await.unwrap();
        let friends = reopened.list_friends().await.unwrap();
        assert_eq!(friends.len(), 1);
        assert!(!friends[0].is_online);
    }
}
