//! Wire types and codec for the messaging engine.
//!
//! `NetworkMessage` is the only type that ever crosses [`crate::transport`];
//! `MessageRecord`/`FriendRecord` are the persisted shapes in
//! [`crate::database`]. The two overlap in fields but are kept as distinct
//! types so a codec bug can't silently leak wire-only fields (like
//! `forwarder_path`) into the persisted log.

pub mod codec;

use serde::{Deserialize, Serialize};

pub use codec::WireCodec;

/// Opaque identifiers used throughout the engine. Both are plain strings;
/// the newtypes exist so call sites can't accidentally swap a peer id for a
/// user id.
pub type UserId = String;
pub type EndpointId = String;

/// Down-call events the engine pushes upward to the UI layer. Every
/// component that can cause one of these (Forwarder, RetryScheduler,
/// EngineCoordinator) emits onto the same broadcast channel so the UI sees
/// a single ordered stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    PeerConnected { endpoint_id: EndpointId, name: String },
    PeerDisconnected { endpoint_id: EndpointId },
    MessageReceived { message_id: String, sender_id: UserId },
    Delivered { message_id: String },
    Forwarded { message_id: String, peer_count: usize },
    DuplicateFiltered { message_id: String },
    Failed { message_id: String, reason: String },
    MaxRetriesExceeded { message_id: String },
    RetryScheduled { message_id: String, attempt: u32 },
    RetrySucceeded { message_id: String },
    RetryFailed { message_id: String },
}

/// Reserved recipient meaning "every receiving device should deliver locally".
pub const BROADCAST_RECIPIENT: &str = "broadcast";

/// Current wall-clock time in milliseconds since the epoch. Centralized here
/// so TTL/expiry comparisons across the store, forwarder, and scheduler all
/// read the clock the same way.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Delivery status of a message, monotone along any single path:
/// `Pending -> Sent -> Delivered`; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    /// Whether transitioning from `self` to `next` is a legal monotone move.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (Delivered, _) | (Failed, _) => false,
            (Pending, Sent) | (Pending, Delivered) | (Pending, Failed) => true,
            (Sent, Delivered) | (Sent, Failed) => true,
            (same_a, same_b) if same_a == same_b => true,
            _ => false,
        }
    }
}

/// Distinguishes a user-authored message from a delivery acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Ack,
}

/// Persisted message row (see `MessageStore`). Never serialized onto the
/// wire directly -- `Forwarder` maps to/from `NetworkMessage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: String,
    pub content: String,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub timestamp: i64,
    pub status: MessageStatus,
    pub hop_count: u32,
    pub ttl: i64,
    pub integrity_hash: String,
    pub is_outgoing: bool,
}

impl MessageRecord {
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == BROADCAST_RECIPIENT
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.ttl < now_ms
    }
}

/// Persisted friend/contact row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRecord {
    pub user_id: UserId,
    pub nickname: String,
    pub endpoint_id: Option<EndpointId>,
    pub last_seen_ms: i64,
    pub added_ms: i64,
    pub is_online: bool,
    pub total_messages: u64,
    pub is_favorite: bool,
}

/// Ciphertext/plaintext blob embedded in `NetworkMessage.content` when
/// `encrypted = true`. Re-exported here for convenience; defined in
/// [`crate::crypto`].
pub use crate::crypto::EncryptedBlob;

/// The only type that crosses the wire. Field names are fixed for
/// interop and enforced via `#[serde(rename = ...)]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "senderId")]
    pub sender_id: UserId,
    #[serde(rename = "recipientId")]
    pub recipient_id: UserId,
    /// Plaintext, or the serialized `EncryptedBlob` when `encrypted = true`.
    pub content: String,
    pub timestamp: i64,
    #[serde(rename = "hopCount")]
    pub hop_count: u32,
    pub ttl: i64,
    pub hash: String,
    pub encrypted: bool,
    pub signature: String,
    #[serde(rename = "forwarderPath")]
    pub forwarder_path: String,
}

impl NetworkMessage {
    /// Structural validation the type system alone can't express: required
    /// non-empty fields and a positive timestamp.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.message_id.is_empty() {
            return Err(crate::error::Error::DecodeFailed(
                "messageId is required".to_string(),
            ));
        }
        if self.sender_id.is_empty() {
            return Err(crate::error::Error::DecodeFailed(
                "senderId is required".to_string(),
            ));
        }
        if self.content.is_empty() {
            return Err(crate::error::Error::DecodeFailed(
                "content is required".to_string(),
            ));
        }
        if self.timestamp <= 0 {
            return Err(crate::error::Error::DecodeFailed(
                "timestamp must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
