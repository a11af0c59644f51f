//! Helpers for assembling parameterized multi-CTE statements.

use insightql_core::{QueryError, SqlStatement, SqlValue};

pub(crate) const STEP_PREFIX: &str = "step_";
pub(crate) const COAL_USER_ID: &str = "COALESCE(users.customer_user_id,events.user_id)";

pub(crate) fn step_name(i: usize) -> String {
    format!("{STEP_PREFIX}{i}")
}

/// Joins the non-empty parts with `", "`.
pub(crate) fn join_with_comma<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(AsRef::as_ref)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQL text plus the values for its placeholders, in text order.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Fragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn text(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// Appends `other` after a comma, skipping empty sides.
    pub fn push_list(&mut self, other: Fragment) {
        if other.is_empty() {
            return;
        }
        if !self.sql.is_empty() {
            self.sql.push_str(", ");
        }
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
    }

    /// Appends raw text, then `other`'s params.
    pub fn push(&mut self, other: Fragment) {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
    }

    pub fn push_str(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }
}

/// Collects named CTEs in emission order. Params follow the same order, so
/// placeholders line up with values as long as each CTE carries its own.
#[derive(Debug, Default)]
pub(crate) struct SqlBuilder {
    ctes: Vec<String>,
    params: Vec<SqlValue>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_cte(&mut self, name: &str, body: Fragment) {
        self.ctes.push(format!("{name} AS ({})", body.sql));
        self.params.extend(body.params);
    }

    /// Pushes one or more already-named CTEs, e.g. a filter step with its names lookup.
    pub fn push_named(&mut self, ctes: Fragment) {
        self.ctes.push(ctes.sql);
        self.params.extend(ctes.params);
    }

    /// Emits `WITH <ctes> <tail>`, or just `tail` when no CTE was pushed.
    pub fn finish(self, tail: Fragment) -> Result<SqlStatement, QueryError> {
        let sql = if self.ctes.is_empty() {
            tail.sql
        } else {
            format!("WITH {} {}", self.ctes.join(", "), tail.sql)
        };
        let mut params = self.params;
        params.extend(tail.params);
        statement(sql, params)
    }
}

/// Builds the final statement, rejecting a placeholder/param count mismatch.
pub(crate) fn statement(sql: String, params: Vec<SqlValue>) -> Result<SqlStatement, QueryError> {
    let placeholders = count_placeholders(&sql);
    if placeholders != params.len() {
        return Err(QueryError::generation(format!(
            "statement has {placeholders} placeholders but {} params",
            params.len()
        )));
    }
    Ok(SqlStatement::new(sql, params))
}

fn count_placeholders(sql: &str) -> usize {
    let mut in_literal = false;
    let mut count = 0;
    for c in sql.chars() {
        match c {
            '\'' => in_literal = !in_literal,
            '?' if !in_literal => count += 1,
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_skips_empty_parts() {
        assert_eq!(join_with_comma(&["a", "", "b"]), "a, b");
        assert_eq!(join_with_comma(&["", ""]), "");
    }

    #[test]
    fn placeholders_inside_literals_are_ignored() {
        assert_eq!(count_placeholders("SELECT '?' , ? FROM t WHERE x->>? = '$none'"), 2);
    }

    #[test]
    fn builder_wraps_ctes_and_keeps_param_order() {
        let mut builder = SqlBuilder::new();
        builder.push_cte("a", Fragment::new("SELECT ?", vec![SqlValue::Int(1)]));
        builder.push_cte("b", Fragment::new("SELECT ?", vec![SqlValue::Int(2)]));
        let stmt = builder
            .finish(Fragment::new("SELECT * FROM a, b WHERE x = ?", vec![SqlValue::Int(3)]))
            .expect("statement");
        assert_eq!(
            stmt.sql,
            "WITH a AS (SELECT ?), b AS (SELECT ?) SELECT * FROM a, b WHERE x = ?"
        );
        assert_eq!(
            stmt.params,
            vec![SqlValue::Int(1), SqlValue::Int(2), SqlValue::Int(3)]
        );
    }

    #[test]
    fn mismatched_params_are_rejected() {
        let err = statement("SELECT ?".to_string(), vec![]).expect_err("mismatch");
        assert!(matches!(err, QueryError::SqlGeneration(_)));
    }

    #[test]
    fn push_list_inserts_commas() {
        let mut f = Fragment::text("a");
        f.push_list(Fragment::default());
        f.push_list(Fragment::new("?", vec![SqlValue::from("x")]));
        assert_eq!(f.sql, "a, ?");
        assert_eq!(f.params.len(), 1);
    }
}
