use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::Query;

pub const ALIAS_AGGREGATE: &str = "count";
pub const ALIAS_DATETIME: &str = "datetime";
pub const ALIAS_EVENT_NAME: &str = "event_name";
pub const ALIAS_ERROR: &str = "error";
pub const META_EACH_EVENT_COUNT: &str = "EachEventCount";

/// A titled auxiliary table attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HeaderRows {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QueryResultMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<HeaderRows>,
}

/// Tabular result handed back to callers. Every row has one cell per header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QueryResult {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub meta: QueryResultMeta,
}

impl QueryResult {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            headers,
            rows,
            meta: QueryResultMeta::default(),
        }
    }

    /// Single-cell result describing a failed query.
    pub fn error(message: &str) -> Self {
        Self::new(
            vec![ALIAS_ERROR.to_string()],
            vec![vec![Value::String(format!("Query failed: - {message}"))]],
        )
    }

    pub fn is_error(&self) -> bool {
        self.headers.len() == 1 && self.headers[0] == ALIAS_ERROR
    }

    pub fn header_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResultGroup {
    #[serde(rename = "result_group")]
    pub results: Vec<QueryResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_result_shape() {
        let result = QueryResult::error("Failed processing query");
        assert_eq!(result.headers, vec!["error"]);
        assert_eq!(
            result.rows,
            vec![vec![Value::String(
                "Query failed: - Failed processing query".to_string()
            )]]
        );
        assert!(result.is_error());
    }

    #[test]
    fn result_group_uses_wire_name() {
        let group = ResultGroup {
            results: vec![QueryResult::new(vec!["count".into()], vec![])],
        };
        let json = serde_json::to_value(&group).expect("json");
        assert!(json.get("result_group").is_some());
    }
}
