//! [`SqlExecutor`] over DuckDB: binds positional parameters, takes headers from
//! the executed statement and converts every cell to JSON.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate};
use duckdb::types::{TimeUnit, ToSql, Value as DuckValue};
use duckdb::Row;
use serde_json::Value;
use tracing::debug;

use insightql_core::{QueryResult, SqlExecutor, SqlStatement, SqlValue};

use crate::DuckDbBackend;

fn bind(value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Int(i) => Box::new(*i),
        SqlValue::Float(f) => Box::new(*f),
        SqlValue::Text(s) => Box::new(s.clone()),
    }
}

/// Naive wall-clock text. Zoned truncation already happened in SQL.
fn timestamp_text(unit: TimeUnit, value: i64) -> Value {
    let micros = match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    };
    DateTime::from_timestamp_micros(micros)
        .map(|dt| Value::from(dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string()))
        .unwrap_or(Value::Null)
}

fn date_text(days: i32) -> Value {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|epoch| epoch.checked_add_signed(Duration::days(i64::from(days))))
        .map(|d| Value::from(d.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

/// JSON for one cell. `row` and `index` are only used to widen decimals.
fn cell(value: DuckValue, row: &Row<'_>, index: usize) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::from(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(i as f64)),
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::Float(f) => Value::from(f64::from(f)),
        DuckValue::Double(f) => Value::from(f),
        DuckValue::Text(s) | DuckValue::Enum(s) => Value::String(s),
        DuckValue::Timestamp(unit, v) => timestamp_text(unit, v),
        DuckValue::Date32(days) => date_text(days),
        // Decimals and anything exotic: numeric when DuckDB can widen it.
        _ => row.get::<_, f64>(index).map(Value::from).unwrap_or(Value::Null),
    }
}

#[async_trait]
impl SqlExecutor for DuckDbBackend {
    async fn execute(&self, statement: &SqlStatement) -> anyhow::Result<QueryResult> {
        let conn = self.conn.lock().await;
        let params: Vec<Box<dyn ToSql>> = statement.params.iter().map(bind).collect();
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&statement.sql)?;
        let mut rows = stmt.query(param_refs.as_slice())?;

        // Width is discovered per row; names are only readable once `rows` is dropped.
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::new();
            while row.get_ref(cells.len()).is_ok() {
                let index = cells.len();
                let value: DuckValue = row.get(index)?;
                cells.push(cell(value, row, index));
            }
            out.push(cells);
        }
        drop(rows);
        let headers: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        debug!(rows = out.len(), columns = headers.len(), "duckdb statement executed");
        Ok(QueryResult::new(headers, out))
    }
}
