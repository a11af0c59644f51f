use std::sync::Arc;

use anyhow::Result;
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::DuckDbConfig;
use crate::schema::init_sql;

/// A DuckDB database serving compiled queries and ad-performance reports.
///
/// DuckDB is single-writer, so the connection sits behind `Arc<Mutex<_>>`.
/// Clones share the same connection.
///
/// Memory and thread limits are applied by [`init_sql`] at open time.
#[derive(Clone)]
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl DuckDbBackend {
    /// Open (or create) a database file at `path`.
    ///
    /// `memory_limit` is a DuckDB size string such as `"1GB"` or `"512MB"`.
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        info!(path, memory_limit, "DuckDB opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database. Data is discarded when the last clone drops.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&init_sql("1GB"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn from_config(config: &DuckDbConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::open(path, &config.memory_limit),
            None => {
                let backend = Self::open_in_memory()?;
                info!(memory_limit = %config.memory_limit, "DuckDB opened in memory");
                Ok(backend)
            }
        }
    }

    /// Runs parameterless SQL, e.g. to seed fixtures or load exports.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql)?;
        Ok(())
    }
}
