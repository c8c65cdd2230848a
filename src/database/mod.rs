//! Embedded persistence for the messaging engine.
//!
//! [`DatabasePool`] is a small bounded pool of `rusqlite` connections in WAL
//! mode. [`MessageStore`] builds the message/friend log on top of it and
//! exposes the live query views the UI layer observes.

pub mod migrations;
pub mod store;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use rusqlite::Connection;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub use store::{MessageCounts, MessageStore};

struct PooledConnection {
    conn: Connection,
    in_use: bool,
    created_at: Instant,
}

/// Bounded pool of SQLite connections, all sharing one on-disk database in
/// WAL mode.
pub struct DatabasePool {
    connections: RwLock<Vec<PooledConnection>>,
    config: DatabaseConfig,
}

impl DatabasePool {
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let mut setup_conn = Self::create_connection(&config)?;
        migrations::MigrationManager::new().migrate(&mut setup_conn)?;

        let initial = (config.max_connections.min(4)).max(1);
        let mut connections = Vec::with_capacity(initial as usize);
        for _ in 0..initial {
            connections.push(PooledConnection {
                conn: Self::create_connection(&config)?,
                in_use: false,
                created_at: Instant::now(),
            });
        }

        Ok(Self {
            connections: RwLock::new(connections),
            config,
        })
    }

    fn create_connection(config: &DatabaseConfig) -> Result<Connection> {
        let conn = Connection::open(&config.path)
            .map_err(|e| Error::Database(format!("failed to open database: {}", e)))?;

        if config.enable_wal {
            conn.execute("PRAGMA journal_mode = WAL", [])
                .map_err(|e| Error::Database(format!("failed to enable WAL: {}", e)))?;
        }
        conn.execute("PRAGMA synchronous = NORMAL", [])
            .map_err(|e| Error::Database(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(conn)
    }

    /// Run `f` against a pooled connection, growing the pool up to
    /// `max_connections` and waiting briefly under contention.
    pub async fn with_connection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let start = Instant::now();

        loop {
            {
                let mut connections = self.connections.write().await;

                for slot in connections.iter_mut() {
                    if !slot.in_use {
                        slot.in_use = true;
                        let result = f(&mut slot.conn);
                        slot.in_use = false;
                        return result;
                    }
                }

                if connections.len() < self.config.max_connections as usize {
                    connections.push(PooledConnection {
                        conn: Self::create_connection(&self.config)?,
                        in_use: false,
                        created_at: Instant::now(),
                    });
                    continue;
                }
            }

            if start.elapsed() > self.config.connection_timeout {
                return Err(Error::Database("connection pool timeout".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<R>,
    {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::Database(format!("failed to begin transaction: {}", e)))?;
            match f(&tx) {
                Ok(result) => {
                    tx.commit()
                        .map_err(|e| Error::Database(format!("failed to commit: {}", e)))?;
                    Ok(result)
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn stats(&self) -> DatabaseStats {
        let connections = self.connections.read().await;
        DatabaseStats {
            active_connections: connections.iter().filter(|c| c.in_use).count(),
            total_connections: connections.len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DatabaseStats {
    pub active_connections: usize,
    pub total_connections: usize,
}
