//! JSON wire codec for [`super::NetworkMessage`].

use super::NetworkMessage;
use crate::error::{Error, Result};

/// Serializes/deserializes `NetworkMessage` to/from its JSON wire form.
/// Stateless -- exists as a type mainly to give the operation a name
/// callers can mock or swap in tests.
pub struct WireCodec;

impl WireCodec {
    /// Deterministic JSON encoding of `m`.
    pub fn encode(m: &NetworkMessage) -> Result<Vec<u8>> {
        serde_json::to_vec(m).map_err(|e| Error::EncodeFailed(e.to_string()))
    }

    /// Decode bytes into a `NetworkMessage`, rejecting payloads missing
    /// required fields or carrying a non-positive timestamp.
    pub fn decode(bytes: &[u8]) -> Result<NetworkMessage> {
        let message: NetworkMessage =
            serde_json::from_slice(bytes).map_err(|e| Error::DecodeFailed(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn sample() -> NetworkMessage {
        NetworkMessage {
            message_type: MessageType::Text,
            message_id: "msg-1".to_string(),
            sender_id: "alice".to_string(),
            recipient_id: "bob".to_string(),
            content: "hello".to_string(),
            timestamp: 1_700_000_000_000,
            hop_count: 0,
            ttl: 1_700_086_400_000,
            hash: "deadbeef".to_string(),
            encrypted: false,
            signature: "sig".to_string(),
            forwarder_path: String::new(),
        }
    }

    #[test]
    fn round_trips() {
        let original = sample();
        let bytes = WireCodec::encode(&original).unwrap();
        let decoded = WireCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn wire_field_names_are_fixed() {
        let bytes = WireCodec::encode(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        for field in [
            "messageType",
            "messageId",
            "senderId",
            "recipientId",
            "content",
            "timestamp",
            "hopCount",
            "ttl",
            "hash",
            "encrypted",
            "signature",
            "forwarderPath",
        ] {
            assert!(text.contains(field), "missing field {field} in {text}");
        }
    }

    #[test]
    fn rejects_missing_message_id() {
        let mut m = sample();
        m.message_id = String::new();
        let bytes = serde_json::to_vec(&m).unwrap();
        assert!(WireCodec::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_non_positive_timestamp() {
        let mut m = sample();
        m.timestamp = 0;
        let bytes = serde_json::to_vec(&m).unwrap();
        assert!(WireCodec::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(WireCodec::decode(b"not json").is_err());
    }
}
