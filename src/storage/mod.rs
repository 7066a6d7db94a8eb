use crate::backup::{BackupJob, JobStore};
use crate::connection::RecentConnection;
use crate::error::{Error, Result};
use crate::shares::{Share, ShareKey, ShareStore};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{sqlite::SqlitePool, Row};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// Well-known keys of the key-value table.
pub mod keys {
    pub const LAST_DEVICE: &str = "last_device";
    pub const LAST_CONNECTION_PATH: &str = "last_connection_path";
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");

        // Create the database directory if it doesn't exist
        if !in_memory {
            let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to :memory: is its own database.
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_jobs (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pinned_shares (
                host TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (host, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recent_connections (
                network_id TEXT PRIMARY KEY,
                timestamp BIGINT NOT NULL,
                display_name TEXT NOT NULL,
                gateway_address TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_recent_ts ON recent_connections(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn load_jobs(&self) -> Result<Vec<BackupJob>> {
        let rows = sqlx::query("SELECT id, data FROM backup_jobs ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(decode_rows(rows, "job"))
    }

    pub async fn load_pinned_shares(&self) -> Result<Vec<Share>> {
        let rows = sqlx::query("SELECT host || '/' || name AS id, data FROM pinned_shares ORDER BY updated_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(decode_rows(rows, "share"))
    }

    pub async fn save_recent_connection(&self, entry: &RecentConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recent_connections (network_id, timestamp, display_name, gateway_address)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(network_id) DO UPDATE SET
                timestamp = excluded.timestamp,
                display_name = excluded.display_name,
                gateway_address = excluded.gateway_address
            "#,
        )
        .bind(&entry.network_id)
        .bind(entry.timestamp)
        .bind(&entry.display_name)
        .bind(&entry.gateway_address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Keep only the newest `limit` entries.
    pub async fn trim_recent_connections(&self, limit: usize) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM recent_connections WHERE network_id NOT IN (
                SELECT network_id FROM recent_connections ORDER BY timestamp DESC LIMIT ?1
            )
            "#,
        )
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_recent_connections(&self) -> Result<Vec<RecentConnection>> {
        let rows = sqlx::query(
            "SELECT network_id, timestamp, display_name, gateway_address FROM recent_connections ORDER BY timestamp DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RecentConnection {
                network_id: row.get("network_id"),
                timestamp: row.get("timestamp"),
                display_name: row.get("display_name"),
                gateway_address: row.get("gateway_address"),
            })
            .collect())
    }

    pub async fn put<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_string(value).map_err(|e| Error::validation(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A value that no longer decodes reads as absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: String = row.get("value");
        match serde_json::from_str(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Ignoring unreadable value for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<sqlx::sqlite::SqliteRow>, what: &str) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| {
            let id: String = row.get("id");
            let data: String = row.get("data");
            match serde_json::from_str(&data) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Skipping unreadable {} {}: {}", what, id, e);
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl JobStore for Storage {
    async fn save_job(&self, job: &BackupJob) -> Result<()> {
        let data = serde_json::to_string(job).map_err(|e| Error::validation(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO backup_jobs (id, data, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&job.id)
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM backup_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ShareStore for Storage {
    async fn save_pinned(&self, share: &Share) -> Result<()> {
        let data = serde_json::to_string(share).map_err(|e| Error::validation(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO pinned_shares (host, name, data, updated_at)
            VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
            ON CONFLICT(host, name) DO UPDATE SET
                data = excluded.data,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&share.host)
        .bind(&share.name)
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_pinned(&self, key: &ShareKey) -> Result<()> {
        sqlx::query("DELETE FROM pinned_shares WHERE host = ?1 AND name = ?2")
            .bind(&key.host)
            .bind(&key.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
