pub mod attribution;
pub mod funnel;
pub mod insights;
pub mod prepare;
pub mod runner;

mod group_keys;
mod postprocess;
mod properties;
mod sql;
mod steps;
mod time_buckets;

pub use attribution::AttributionEngine;
pub use funnel::build_funnel_query;
pub use insights::build_insights_query;
pub use prepare::decode_query;
pub use runner::QueryRunner;

/// Re-export so callers can name the shared model without an extra dependency.
pub use insightql_core;
