//! Compile, execute and post-process queries against a [`SqlExecutor`].

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use insightql_core::error::ERR_MSG_QUERY_PROCESSING_FAILURE;
use insightql_core::query::QueryClass;
use insightql_core::result::ResultGroup;
use insightql_core::{EngineConfig, Query, QueryError, QueryResult, SqlExecutor, SqlStatement};

use crate::prepare::prepare;
use crate::{funnel, insights, postprocess};

/// Runs insights and funnel queries. Cheap to clone.
#[derive(Clone)]
pub struct QueryRunner {
    executor: Arc<dyn SqlExecutor>,
    config: EngineConfig,
}

impl QueryRunner {
    pub fn new(executor: Arc<dyn SqlExecutor>, config: EngineConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dispatches on the query class.
    pub async fn run(&self, project_id: u64, query: &Query) -> Result<QueryResult, QueryError> {
        match query.class {
            QueryClass::Funnel => self.run_funnel(project_id, query).await,
            QueryClass::Insights => self.run_insights(project_id, query).await,
        }
    }

    pub async fn run_insights(
        &self,
        project_id: u64,
        query: &Query,
    ) -> Result<QueryResult, QueryError> {
        let prepared = prepare(query, &self.config)?;
        let statement = insights::build_prepared(project_id, &prepared, &self.config)?;
        let result = self.execute(project_id, &statement).await?;
        postprocess::process_insights(result, &prepared, self.config.results_limit)
    }

    pub async fn run_funnel(
        &self,
        project_id: u64,
        query: &Query,
    ) -> Result<QueryResult, QueryError> {
        let mut query = query.clone();
        query.class = QueryClass::Funnel;
        let prepared = prepare(&query, &self.config)?;
        let statement = funnel::build_prepared(project_id, &prepared, &self.config)?;
        let result = self.execute(project_id, &statement).await?;
        postprocess::process_funnel(result, &prepared)
    }

    async fn execute(
        &self,
        project_id: u64,
        statement: &SqlStatement,
    ) -> Result<QueryResult, QueryError> {
        if statement.is_empty() {
            error!(project_id, "refusing to execute an empty statement");
            return Err(QueryError::processing(ERR_MSG_QUERY_PROCESSING_FAILURE));
        }
        debug!(project_id, sql = %statement.sql, params = ?statement.params, "executing query");
        self.executor.execute(statement).await.map_err(|e| {
            error!(project_id, error = %e, sql = %statement.sql, "query execution failed");
            QueryError::Execution(e)
        })
    }

    /// Runs every query, at most `max_concurrency` at a time. Each window is
    /// awaited in full before the next starts. A failed or panicked query
    /// yields an error result in its own slot only.
    pub async fn run_query_group(&self, project_id: u64, queries: &[Query]) -> ResultGroup {
        let mut results: Vec<QueryResult> = queries
            .iter()
            .map(|_| QueryResult::error(ERR_MSG_QUERY_PROCESSING_FAILURE))
            .collect();
        let window = self.config.max_concurrency.max(1);

        for (chunk_index, chunk) in queries.chunks(window).enumerate() {
            let mut set = JoinSet::new();
            for (offset, query) in chunk.iter().enumerate() {
                let index = chunk_index * window + offset;
                let runner = self.clone();
                let query = query.clone();
                set.spawn(async move {
                    let result = runner.run(project_id, &query).await;
                    (index, result)
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((index, Ok(result))) => results[index] = result,
                    Ok((index, Err(e))) => {
                        warn!(project_id, index, error = %e, "query in group failed");
                        results[index] = QueryResult::error(&e.user_message());
                    }
                    Err(e) => error!(project_id, error = %e, "query task panicked"),
                }
            }
        }
        ResultGroup { results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insightql_core::SqlValue;
    use serde_json::json;

    struct Fixed(QueryResult);

    #[async_trait::async_trait]
    impl SqlExecutor for Fixed {
        async fn execute(&self, _statement: &SqlStatement) -> anyhow::Result<QueryResult> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl SqlExecutor for Failing {
        async fn execute(&self, _statement: &SqlStatement) -> anyhow::Result<QueryResult> {
            anyhow::bail!("connection reset")
        }
    }

    fn query(json: &str) -> Query {
        serde_json::from_str(json).expect("query")
    }

    #[tokio::test]
    async fn execution_errors_hide_internal_detail() {
        let runner = QueryRunner::new(Arc::new(Failing), EngineConfig::default());
        let q = query(
            r#"{"ty":"unique_users","ec":"any_given_event","ewp":[{"na":"a"}],"fr":1,"to":2}"#,
        );
        let err = runner.run_insights(1, &q).await.expect_err("failure");
        assert!(matches!(err, QueryError::Execution(_)));
        assert_eq!(err.user_message(), ERR_MSG_QUERY_PROCESSING_FAILURE);
    }

    #[tokio::test]
    async fn empty_statement_is_refused() {
        let runner = QueryRunner::new(
            Arc::new(Fixed(QueryResult::new(vec!["count".into()], vec![]))),
            EngineConfig::default(),
        );
        let err = runner
            .execute(1, &SqlStatement::new("", vec![SqlValue::Int(1)]))
            .await
            .expect_err("empty");
        assert_eq!(err.user_message(), ERR_MSG_QUERY_PROCESSING_FAILURE);
    }

    #[tokio::test]
    async fn run_dispatches_on_class() {
        let raw = QueryResult::new(
            vec!["step_0".into(), "step_1".into()],
            vec![vec![json!(5), json!(2)]],
        );
        let runner = QueryRunner::new(Arc::new(Fixed(raw)), EngineConfig::default());
        let q = query(
            r#"{"cl":"funnel","ty":"unique_users","ec":"any_given_event",
                "ewp":[{"na":"a"},{"na":"b"}],"fr":1,"to":2}"#,
        );
        let result = runner.run(1, &q).await.expect("funnel");
        assert_eq!(result.headers.last().map(String::as_str), Some("conversion_overall"));
    }
}
