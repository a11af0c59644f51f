use std::env;

/// Where the reference executor keeps its database and how much memory it may use.
#[derive(Debug, Clone, PartialEq)]
pub struct DuckDbConfig {
    /// File path; `None` opens an in-memory database.
    pub path: Option<String>,
    pub memory_limit: String,
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self {
            path: None,
            memory_limit: "1GB".to_string(),
        }
    }
}

impl DuckDbConfig {
    /// Reads `INSIGHTQL_DUCKDB_PATH` and `INSIGHTQL_DUCKDB_MEMORY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            path: env::var("INSIGHTQL_DUCKDB_PATH").ok().filter(|p| !p.is_empty()),
            memory_limit: env::var("INSIGHTQL_DUCKDB_MEMORY")
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.memory_limit),
        }
    }
}
