/// Limits shared by the compiler, the post-processor, the query-group runner
/// and the attribution engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Queries of one group executed at the same time.
    pub max_concurrency: usize,
    /// User ids bound per `IN (...)` list.
    pub user_batch_size: usize,
    pub max_lookback_days: i64,
    /// Top-K kept per breakdown dimension.
    pub results_limit: usize,
    /// SQL-side cap when limiting is finished in memory.
    pub max_results_limit: usize,
    pub max_funnel_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            user_batch_size: 3000,
            max_lookback_days: 180,
            results_limit: 100,
            max_results_limit: 100_000,
            max_funnel_steps: 4,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        Ok(Self {
            max_concurrency: env_or("INSIGHTQL_MAX_CONCURRENCY", defaults.max_concurrency)?,
            user_batch_size: env_or("INSIGHTQL_USER_BATCH_SIZE", defaults.user_batch_size)?,
            max_lookback_days: env_or("INSIGHTQL_MAX_LOOKBACK_DAYS", defaults.max_lookback_days)?,
            results_limit: env_or("INSIGHTQL_RESULTS_LIMIT", defaults.results_limit)?,
            max_results_limit: env_or("INSIGHTQL_MAX_RESULTS_LIMIT", defaults.max_results_limit)?,
            max_funnel_steps: env_or("INSIGHTQL_MAX_FUNNEL_STEPS", defaults.max_funnel_steps)?,
        })
        .and_then(Self::validated)
    }

    fn validated(self) -> Result<Self, String> {
        if self.max_concurrency == 0 {
            return Err("INSIGHTQL_MAX_CONCURRENCY must be at least 1".to_string());
        }
        if self.user_batch_size == 0 {
            return Err("INSIGHTQL_USER_BATCH_SIZE must be at least 1".to_string());
        }
        Ok(self)
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}
