pub mod backend;
pub mod config;
pub mod executor;
pub mod reports;
pub mod schema;

pub use backend::DuckDbBackend;
pub use config::DuckDbConfig;

/// Re-export the `duckdb` crate so consumers (especially tests) can use
/// `insightql_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;
