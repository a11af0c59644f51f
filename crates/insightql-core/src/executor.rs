//! Collaborators the engine talks to: a SQL executor and an ad-report source.

use serde::Serialize;

use crate::attribution::{AttributionKey, MarketingReport};
use crate::result::QueryResult;

/// Positional parameter bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// A complete statement: SQL text with `?` placeholders and the values for them, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty() || self.params.is_empty()
    }
}

/// Runs parameterized SQL and returns column headers plus rows.
///
/// Implementations own connection handling and any statement timeout.
#[async_trait::async_trait]
pub trait SqlExecutor: Send + Sync + 'static {
    async fn execute(&self, statement: &SqlStatement) -> anyhow::Result<QueryResult>;
}

/// Read-only access to ad-platform reports and project integration settings.
#[async_trait::async_trait]
pub trait AdPerformanceSource: Send + Sync + 'static {
    /// Customer account id of the project's ad integration, if configured.
    async fn customer_account_id(&self, project_id: u64) -> anyhow::Result<Option<String>>;

    /// Aggregated performance for `[from, to]`, keyed by attribution key id.
    async fn marketing_report(
        &self,
        project_id: u64,
        customer_account_id: &str,
        key: AttributionKey,
        from: i64,
        to: i64,
    ) -> anyhow::Result<MarketingReport>;
}
