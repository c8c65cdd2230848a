//! Schema migration system for `MessageStore`.

use crate::error::{Error, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};

/// A single forward-only schema change, tracked in `schema_migrations`.
#[derive(Clone)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub up_sql: String,
    pub checksum: String,
}

impl Migration {
    pub fn new(version: u32, name: impl Into<String>, up_sql: impl Into<String>) -> Self {
        let up_sql = up_sql.into();
        let checksum = Self::checksum(&up_sql);
        Self {
            version,
            name: name.into(),
            up_sql,
            checksum,
        }
    }

    fn checksum(sql: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sql.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Applies pending migrations to a connection, tracking applied versions in
/// `schema_migrations`.
pub struct MigrationManager {
    migrations: Vec<Migration>,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationManager {
    pub fn new() -> Self {
        Self {
            migrations: Self::load_migrations(),
        }
    }

    fn load_migrations() -> Vec<Migration> {
        vec![
            Migration::new(
                1,
                "messages_and_friends",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    recipient_id TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    hop_count INTEGER NOT NULL DEFAULT 0,
                    ttl INTEGER NOT NULL,
                    integrity_hash TEXT NOT NULL,
                    is_outgoing INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
                CREATE INDEX IF NOT EXISTS idx_messages_conversation
                    ON messages(sender_id, recipient_id);
                CREATE INDEX IF NOT EXISTS idx_messages_ttl ON messages(ttl);

                CREATE TABLE IF NOT EXISTS friends (
                    user_id TEXT PRIMARY KEY,
                    nickname TEXT NOT NULL,
                    endpoint_id TEXT,
                    last_seen_ms INTEGER NOT NULL,
                    added_ms INTEGER NOT NULL,
                    is_online INTEGER NOT NULL DEFAULT 0,
                    total_messages INTEGER NOT NULL DEFAULT 0,
                    is_favorite INTEGER NOT NULL DEFAULT 0
                );
                "#,
            ),
        ]
    }

    /// Apply every migration with `version > current` in order, inside one
    /// transaction each. Stops and returns the error on the first failure.
    pub fn migrate(&self, conn: &mut Connection) -> Result<u32> {
        Self::create_migrations_table(conn)?;
        let current = Self::current_version(conn)?;

        for migration in &self.migrations {
            if migration.version > current {
                Self::run_migration(conn, migration)?;
                log::info!("applied migration v{}: {}", migration.version, migration.name);
            }
        }

        Self::current_version(conn)
    }

    fn create_migrations_table(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    fn current_version(conn: &Connection) -> Result<u32> {
        let version: Option<u32> = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or(Some(0));
        Ok(version.unwrap_or(0))
    }

    fn run_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.execute_batch(&migration.up_sql)
            .map_err(|e| Error::Database(format!("migration {} failed: {}", migration.version, e)))?;

        tx.execute(
            "INSERT INTO schema_migrations (version, name, checksum, applied_at) VALUES (?, ?, ?, ?)",
            rusqlite::params![
                migration.version,
                migration.name,
                migration.checksum,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_creates_messages_and_friends_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        let manager = MigrationManager::new();
        let version = manager.migrate(&mut conn).unwrap();
        assert_eq!(version, 1);

        conn.execute("INSERT INTO messages (message_id, content, sender_id, recipient_id, timestamp, status, hop_count, ttl, integrity_hash, is_outgoing) VALUES ('m1','hi','a','b',1,'PENDING',0,2,'hash',1)", []).unwrap();
        conn.execute("INSERT INTO friends (user_id, nickname, last_seen_ms, added_ms) VALUES ('a','Alice',1,1)", []).unwrap();
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        let manager = MigrationManager::new();
        manager.migrate(&mut conn).unwrap();
        let version_again = manager.migrate(&mut conn).unwrap();
        assert_eq!(version_again, 1);
    }
}
