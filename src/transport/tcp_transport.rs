//! TCP loopback reference implementation of [`PeerTransport`].
//!
//! Each connected peer is a `TcpStream` framed with a 4-byte big-endian
//! length prefix. A single accept loop and one read task per connection
//! republish `TransportEvent`s onto a shared channel; the transport itself
//! never blocks on engine processing.

use super::{PeerTransport, TransportEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

struct Connection {
    writer: mpsc::Sender<Vec<u8>>,
}

/// A TCP-based `PeerTransport`. Useful as a loopback fixture for exercising
/// the engine end to end without a real radio.
pub struct TcpTransport {
    listen_port: u16,
    connections: Arc<RwLock<HashMap<String, Connection>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    running: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Create a transport bound to `listen_port`. Returns the transport and
    /// the receiver side of its event channel -- the caller (typically
    /// `EngineCoordinator`) drains this to drive the ingress pipeline.
    pub fn new(listen_port: u16) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        (
            Self {
                listen_port,
                connections: Arc::new(RwLock::new(HashMap::new())),
                event_tx,
                running: Arc::new(AtomicBool::new(false)),
            },
            event_rx,
        )
    }

    /// Actively dial a peer at `addr`, registering it under `endpoint_id`.
    /// Exists because this reference transport has no real discovery
    /// protocol -- tests wire peers together explicitly.
    pub async fn connect(&self, endpoint_id: &str, addr: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        self.register_connection(endpoint_id.to_string(), stream, format!("{addr}"))
            .await;
        Ok(())
    }

    async fn register_connection(&self, endpoint_id: String, stream: TcpStream, name: String) {
        let (read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);

        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let len = frame.len() as u32;
                if write_half.write_all(&len.to_be_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        self.connections
            .write()
            .await
            .insert(endpoint_id.clone(), Connection { writer: writer_tx });

        let _ = self
            .event_tx
            .send(TransportEvent::EndpointConnected {
                endpoint_id: endpoint_id.clone(),
                name,
            })
            .await;

        let connections = self.connections.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(Self::read_loop(endpoint_id, read_half, connections, event_tx));
    }

    async fn read_loop(
        endpoint_id: String,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        connections: Arc<RwLock<HashMap<String, Connection>>>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) {
        loop {
            let mut len_buf = [0u8; 4];
            if read_half.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = u32::from_be_bytes(len_buf);
            if len > MAX_FRAME_LEN {
                break;
            }
            let mut payload = vec![0u8; len as usize];
            if read_half.read_exact(&mut payload).await.is_err() {
                break;
            }

            if event_tx
                .send(TransportEvent::BytesReceived {
                    endpoint_id: endpoint_id.clone(),
                    bytes: payload,
                })
                .await
                .is_err()
            {
                break;
            }
        }

        connections.write().await.remove(&endpoint_id);
        let _ = event_tx
            .send(TransportEvent::EndpointDisconnected { endpoint_id })
            .await;
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn start_advertising(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;

        let connections = self.connections.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let endpoint_id = format!("{addr}");
                        let (read_half, mut write_half) = stream.into_split();
                        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);

                        tokio::spawn(async move {
                            while let Some(frame) = writer_rx.recv().await {
                                let len = frame.len() as u32;
                                if write_half.write_all(&len.to_be_bytes()).await.is_err() {
                                    break;
                                }
                                if write_half.write_all(&frame).await.is_err() {
                                    break;
                                }
                            }
                        });

                        connections
                            .write()
                            .await
                            .insert(endpoint_id.clone(), Connection { writer: writer_tx });

                        let _ = event_tx
                            .send(TransportEvent::EndpointConnected {
                                endpoint_id: endpoint_id.clone(),
                                name: endpoint_id.clone(),
                            })
                            .await;

                        tokio::spawn(TcpTransport::read_loop(
                            endpoint_id,
                            read_half,
                            connections.clone(),
                            event_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn start_discovery(&self) -> Result<()> {
        // No real discovery protocol in this loopback reference transport;
        // peers connect explicitly via `TcpTransport::connect`.
        Ok(())
    }

    async fn send(&self, endpoint_id: &str, bytes: Vec<u8>) -> Result<()> {
        let connections = self.connections.read().await;
        let conn = connections
            .get(endpoint_id)
            .ok_or_else(|| Error::TransportUnavailable(format!("unknown endpoint {endpoint_id}")))?;
        conn.writer
            .send(bytes)
            .await
            .map_err(|_| Error::TransportUnavailable("peer write channel closed".to_string()))
    }

    async fn broadcast(&self, bytes: Vec<u8>) -> Result<()> {
        let connections = self.connections.read().await;
        if connections.is_empty() {
            return Err(Error::NoPeers);
        }
        for conn in connections.values() {
            let _ = conn.writer.send(bytes.clone()).await;
        }
        Ok(())
    }

    async fn stop_all(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.connections.write().await.clear();
        Ok(())
    }

    async fn connected_endpoints(&self) -> HashSet<String> {
        self.connections.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn connect_and_exchange_bytes() {
        let (transport_a, mut events_a) = TcpTransport::new(18881);
        let (transport_b, mut events_b) = TcpTransport::new(18882);

        transport_a.start_advertising().await.unwrap();
        transport_b.start_advertising().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        transport_a
            .connect("b", "127.0.0.1:18882".parse().unwrap())
            .await
            .unwrap();

        // transport_a's outbound connect shows up as a connected endpoint on a.
        assert!(matches!(
            events_a.recv().await,
            Some(TransportEvent::EndpointConnected { .. })
        ));
        assert!(matches!(
            events_b.recv().await,
            Some(TransportEvent::EndpointConnected { .. })
        ));

        transport_a.send("b", b"hello".to_vec()).await.unwrap();

        let received = events_b.recv().await;
        match received {
            Some(TransportEvent::BytesReceived { bytes, .. }) => assert_eq!(bytes, b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_with_no_peers_errors() {
        let (transport, _events) = TcpTransport::new(18883);
        let result = transport.broadcast(b"x".to_vec()).await;
        assert!(matches!(result, Err(Error::NoPeers)));
    }
}
