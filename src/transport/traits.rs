//! The abstract peer transport the engine is built against.

use super::TransportEvent;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;

/// Abstract neighbor discovery and byte transport to peer endpoints.
///
/// Implementations assume: (a) `broadcast` is best-effort fan-out; (b)
/// ordering between two distinct `send`/`broadcast` calls is not
/// guaranteed; (c) payloads up to the transport's MTU are delivered whole
/// or not at all. Events are delivered by pushing onto the channel handed
/// to the implementation at construction (see `TcpTransport::new`), not by
/// callback trait methods, so the transport's own receive loop never blocks
/// on engine processing.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Begin advertising this device's presence to nearby peers.
    async fn start_advertising(&self) -> Result<()>;

    /// Begin discovering nearby peers.
    async fn start_discovery(&self) -> Result<()>;

    /// Send bytes to a single connected endpoint.
    async fn send(&self, endpoint_id: &str, bytes: Vec<u8>) -> Result<()>;

    /// Best-effort fan-out to every connected endpoint.
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<()>;

    /// Stop advertising, discovery, and close all connections.
    async fn stop_all(&self) -> Result<()>;

    /// Currently connected endpoint ids.
    async fn connected_endpoints(&self) -> HashSet<String>;
}
