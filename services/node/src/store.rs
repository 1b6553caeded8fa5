//! Durable SQLite store for subscription snapshots.
//!
//! # Schema
//! - `subscriptions`: one row per active server subscription, the record
//!   serialized as JSON.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.
//! PRAGMA integrity_check runs at open; returns error if it fails.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use mtr_im::store::{PeerSubscriptionRecord, StoreError, SubscriptionStore};
use rusqlite::{Connection, params};

#[derive(Debug, thiserror::Error)]
pub enum NodeStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub struct SqliteSubscriptionStore {
    conn: Mutex<Connection>,
}

impl SqliteSubscriptionStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, NodeStoreError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS subscriptions (
                 subscription_id INTEGER PRIMARY KEY,
                 record TEXT NOT NULL
             )",
            [],
        )?;
        Ok(SqliteSubscriptionStore {
            conn: Mutex::new(conn),
        })
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), NodeStoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), NodeStoreError> {
    let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if result == "ok" {
        Ok(())
    } else {
        Err(NodeStoreError::IntegrityCheckFailed(result))
    }
}

#[async_trait]
impl SubscriptionStore for SqliteSubscriptionStore {
    async fn save(&self, record: &PeerSubscriptionRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record).map_err(|e| StoreError(e.to_string()))?;
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT OR REPLACE INTO subscriptions (subscription_id, record) VALUES (?1, ?2)",
            params![i64::from(record.subscription_id), json],
        )
        .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, subscription_id: u32) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "DELETE FROM subscriptions WHERE subscription_id = ?1",
            params![i64::from(subscription_id)],
        )
        .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PeerSubscriptionRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare("SELECT record FROM subscriptions ORDER BY subscription_id")
            .map_err(|e| StoreError(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError(e.to_string()))?;
        let mut records = Vec::new();
        for row in rows {
            let json = row.map_err(|e| StoreError(e.to_string()))?;
            let record: PeerSubscriptionRecord =
                serde_json::from_str(&json).map_err(|e| StoreError(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtr_im::path::AttributePath;
    use tempfile::NamedTempFile;

    fn record(id: u32) -> PeerSubscriptionRecord {
        PeerSubscriptionRecord {
            subscription_id: id,
            fabric_index: 1,
            node_id: 0xabc,
            attribute_requests: vec![AttributePath::concrete(1, 6, 0)],
            event_requests: vec![],
            fabric_filtered: false,
            min_interval_seconds: 1,
            max_interval_seconds: 60,
        }
    }

    #[tokio::test]
    async fn save_load_remove_round_trip() {
        let file = NamedTempFile::new().expect("temp file");
        let store = SqliteSubscriptionStore::open(file.path()).expect("open store");

        store.save(&record(1)).await.unwrap();
        store.save(&record(2)).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], record(1));

        store.remove(1).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].subscription_id, 2);
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let file = NamedTempFile::new().expect("temp file");
        let store = SqliteSubscriptionStore::open(file.path()).expect("open store");

        store.save(&record(5)).await.unwrap();
        let mut updated = record(5);
        updated.max_interval_seconds = 120;
        store.save(&updated).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].max_interval_seconds, 120);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = SqliteSubscriptionStore::open(file.path()).expect("open store");
            store.save(&record(9)).await.unwrap();
        }
        let store = SqliteSubscriptionStore::open(file.path()).expect("reopen store");
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].subscription_id, 9);
    }
}
