pub mod attribution;
pub mod config;
pub mod error;
pub mod executor;
pub mod query;
pub mod result;
pub mod telemetry;

pub use config::EngineConfig;
pub use error::QueryError;
pub use executor::{AdPerformanceSource, SqlExecutor, SqlStatement, SqlValue};
pub use query::Query;
pub use result::QueryResult;
