use thiserror::Error;

pub const ERR_MSG_QUERY_PROCESSING_FAILURE: &str = "Failed processing query";

#[derive(Debug, Error)]
pub enum QueryError {
    /// Rejected before any SQL is built.
    #[error("{0}")]
    InvalidQuery(String),

    #[error("sql generation failed: {0}")]
    SqlGeneration(String),

    #[error("query execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    #[error("result processing failed: {0}")]
    Processing(String),

    #[error("integration not found")]
    IntegrationNotFound,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueryError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    pub fn generation(msg: impl Into<String>) -> Self {
        Self::SqlGeneration(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    /// Text safe to hand back to callers. Internal failures are not detailed.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidQuery(msg) => msg.clone(),
            Self::IntegrationNotFound => self.to_string(),
            _ => ERR_MSG_QUERY_PROCESSING_FAILURE.to_string(),
        }
    }
}
