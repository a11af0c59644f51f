//! Shapes raw SQL rows into the result contract: limits, gap-filled time series,
//! the each-event pivot, readable group headers and funnel conversions.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use insightql_core::query::{EventsCondition, Query, GROUP_KEY_PREFIX};
use insightql_core::result::{
    HeaderRows, QueryResult, ALIAS_AGGREGATE, ALIAS_DATETIME, ALIAS_EVENT_NAME,
    META_EACH_EVENT_COUNT,
};
use insightql_core::QueryError;

use crate::group_keys::RANGE_SEPARATOR;
use crate::prepare::Prepared;
use crate::sql::STEP_PREFIX;
use crate::time_buckets;

const CONVERSION_PREFIX: &str = "conversion_";
const CONVERSION_OVERALL: &str = "conversion_overall";

/// Post-processing for insights results.
pub(crate) fn process_insights(
    mut result: QueryResult,
    p: &Prepared,
    results_limit: usize,
) -> Result<QueryResult, QueryError> {
    let q = &p.query;
    limit_result(&mut result, q.group_by.len(), p.time_series(), results_limit);

    let pivot = q.events_condition == EventsCondition::EachGivenEvent && q.group_by.is_empty();
    if let Some(granularity) = p.granularity {
        let buckets: Vec<String> = time_buckets::enumerate(q.from, q.to, granularity, p.timezone)?
            .iter()
            .map(time_buckets::render)
            .collect();
        normalize_timestamps(&mut result, p)?;
        if pivot {
            result = pivot_each_event_count(&result, q, &buckets)?;
        } else {
            fill_missing_buckets(&mut result, q, &buckets)?;
        }
    }

    if q.events_condition == EventsCondition::EachGivenEvent
        && q.events.len() == 1
        && !(pivot && p.time_series())
        && result.header_index(ALIAS_EVENT_NAME).is_none()
    {
        result.headers.push(ALIAS_EVENT_NAME.to_string());
        for row in &mut result.rows {
            row.push(Value::from(q.events[0].name.as_str()));
        }
    }

    translate_group_keys(&mut result, q)?;
    if !p.time_series() {
        sanitize_numerical_ranges(&mut result, q, 0);
    }
    result.meta.query = Some(q.clone());
    Ok(result)
}

/// Post-processing for funnel results.
pub(crate) fn process_funnel(
    mut result: QueryResult,
    p: &Prepared,
) -> Result<QueryResult, QueryError> {
    if result.rows.is_empty() {
        return Err(QueryError::processing("funnel returned no rows"));
    }
    add_conversions(&mut result)?;
    translate_group_keys(&mut result, &p.query)?;
    sanitize_numerical_ranges(&mut result, &p.query, 1);
    result.meta.query = Some(p.query.clone());
    Ok(result)
}

pub(crate) fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn cell_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Sums cells, keeping integers integral.
fn sum_cells<'a>(cells: impl Iterator<Item = &'a Value>) -> Value {
    let cells: Vec<&Value> = cells.collect();
    if cells.iter().all(|c| c.as_i64().is_some()) {
        Value::from(cells.iter().filter_map(|c| c.as_i64()).sum::<i64>())
    } else {
        Value::from(cells.iter().copied().map(cell_number).sum::<f64>())
    }
}

/// Inclusive span of group-key columns: from the first to the last header that
/// is a group key or `event_name`.
fn group_key_span(headers: &[String]) -> Option<(usize, usize)> {
    let is_key = |h: &String| h.starts_with(GROUP_KEY_PREFIX) || h == ALIAS_EVENT_NAME;
    let first = headers.iter().position(is_key)?;
    let last = headers.iter().rposition(is_key)?;
    Some((first, last))
}

fn encode_key(row: &[Value], columns: std::ops::RangeInclusive<usize>) -> String {
    columns
        .filter_map(|c| row.get(c).map(|v| format!("{c}:{}", cell_text(v))))
        .collect::<Vec<_>>()
        .join("_")
}

/// Caps the number of distinct groups. Rows keep their SQL order.
pub(crate) fn limit_result(
    result: &mut QueryResult,
    group_bys: usize,
    time_series: bool,
    limit: usize,
) {
    let Some((first, last)) = group_key_span(&result.headers) else {
        return;
    };
    let before = result.rows.len();

    if group_bys > 0 && time_series {
        let mut kept: HashSet<String> = HashSet::new();
        result.rows.retain(|row| {
            let key = encode_key(row, first..=last);
            if kept.contains(&key) {
                return true;
            }
            if kept.len() < limit {
                kept.insert(key);
                return true;
            }
            false
        });
    } else if group_bys > 1 && !time_series && last > first {
        let mut prefixes: HashMap<String, HashSet<String>> = HashMap::new();
        result.rows.retain(|row| {
            let prefix = encode_key(row, first..=last - 1);
            let right = row.get(last).map(cell_text).unwrap_or_default();
            if !prefixes.contains_key(&prefix) {
                if prefixes.len() >= limit {
                    return false;
                }
                prefixes.insert(prefix.clone(), HashSet::new());
            }
            let Some(values) = prefixes.get_mut(&prefix) else {
                return false;
            };
            if values.contains(&right) {
                return true;
            }
            if values.len() < limit {
                values.insert(right);
                return true;
            }
            false
        });
    }

    if result.rows.len() != before {
        debug!(before, after = result.rows.len(), "limited result rows");
    }
}

fn required_index(result: &QueryResult, name: &str) -> Result<usize, QueryError> {
    result
        .header_index(name)
        .ok_or_else(|| QueryError::processing(format!("result has no {name} column")))
}

/// Rewrites every datetime cell as RFC 3339 in the query timezone, truncated to
/// the bucket start, then orders rows by time.
fn normalize_timestamps(result: &mut QueryResult, p: &Prepared) -> Result<(), QueryError> {
    let Some(granularity) = p.granularity else {
        return Ok(());
    };
    let ts_index = required_index(result, ALIAS_DATETIME)?;
    let mut keyed = Vec::with_capacity(result.rows.len());
    for mut row in result.rows.drain(..) {
        let cell = row.get(ts_index).cloned().unwrap_or(Value::Null);
        let bucket = time_buckets::parse_timestamp(&cell, p.timezone)
            .and_then(|dt| time_buckets::truncate(dt, granularity))
            .ok_or_else(|| QueryError::processing(format!("invalid timestamp in result: {cell}")))?;
        if let Some(slot) = row.get_mut(ts_index) {
            *slot = Value::from(time_buckets::render(&bucket));
        }
        keyed.push((bucket, row));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    result.rows = keyed.into_iter().map(|(_, row)| row).collect();
    Ok(())
}

fn zero_row(width: usize, count_index: usize, ts_index: usize, bucket: &str) -> Vec<Value> {
    let mut row = vec![Value::Null; width];
    row[count_index] = Value::from(0);
    row[ts_index] = Value::from(bucket);
    row
}

/// Adds zero rows so every series has a row per bucket. Rows end up ordered by
/// bucket, keeping series order within a bucket.
fn fill_missing_buckets(
    result: &mut QueryResult,
    q: &Query,
    buckets: &[String],
) -> Result<(), QueryError> {
    let ts_index = required_index(result, ALIAS_DATETIME)?;
    let count_index = required_index(result, ALIAS_AGGREGATE)?;
    let width = result.headers.len();

    if q.group_by.is_empty() && q.events.len() < 2 {
        let event_index = result.header_index(ALIAS_EVENT_NAME);
        let mut by_bucket: HashMap<String, Vec<Value>> = result
            .rows
            .drain(..)
            .map(|row| (cell_text(&row[ts_index]), row))
            .collect();
        result.rows = buckets
            .iter()
            .map(|bucket| {
                by_bucket.remove(bucket).unwrap_or_else(|| {
                    let mut row = zero_row(width, count_index, ts_index, bucket);
                    if let (Some(i), Some(event)) = (event_index, q.events.first()) {
                        row[i] = Value::from(event.name.as_str());
                    }
                    row
                })
            })
            .collect();
        return Ok(());
    }

    let series_columns: Vec<usize> = (0..width)
        .filter(|&c| c != ts_index && c != count_index)
        .collect();
    let series_of = |row: &[Value]| -> Vec<Value> {
        series_columns.iter().map(|&c| row[c].clone()).collect()
    };

    let mut series: Vec<Vec<Value>> = Vec::new();
    let mut present: HashSet<(String, String)> = HashSet::new();
    for row in &result.rows {
        let values = series_of(row);
        let key = serde_json::to_string(&values)?;
        if !series.contains(&values) {
            series.push(values);
        }
        present.insert((key, cell_text(&row[ts_index])));
    }

    let mut by_bucket: HashMap<String, Vec<Vec<Value>>> = HashMap::new();
    for row in result.rows.drain(..) {
        by_bucket.entry(cell_text(&row[ts_index])).or_default().push(row);
    }
    for values in &series {
        let key = serde_json::to_string(values)?;
        for bucket in buckets {
            if present.contains(&(key.clone(), bucket.clone())) {
                continue;
            }
            let mut row = zero_row(width, count_index, ts_index, bucket);
            for (value, &c) in values.iter().zip(&series_columns) {
                row[c] = value.clone();
            }
            by_bucket.entry(bucket.clone()).or_default().push(row);
        }
    }

    result.rows = buckets
        .iter()
        .filter_map(|bucket| by_bucket.remove(bucket))
        .flatten()
        .collect();
    Ok(())
}

/// Turns `(datetime, event_name, count)` rows into one row per bucket with a
/// column per event, and records per-event totals in meta.
fn pivot_each_event_count(
    result: &QueryResult,
    q: &Query,
    buckets: &[String],
) -> Result<QueryResult, QueryError> {
    let ts_index = required_index(result, ALIAS_DATETIME)?;
    let count_index = required_index(result, ALIAS_AGGREGATE)?;
    let event_index = result.header_index(ALIAS_EVENT_NAME);

    let mut events: Vec<String> = Vec::new();
    for event in &q.events {
        if !events.contains(&event.name) {
            events.push(event.name.clone());
        }
    }
    let single_event = (events.len() == 1).then(|| events[0].clone());

    let mut counts: HashMap<(String, String), Value> = HashMap::new();
    for row in &result.rows {
        let event = match event_index.map(|i| &row[i]) {
            Some(Value::String(name)) => name.clone(),
            _ => match &single_event {
                Some(name) => name.clone(),
                None => continue,
            },
        };
        counts.insert((cell_text(&row[ts_index]), event), row[count_index].clone());
    }

    let mut headers = vec![ALIAS_DATETIME.to_string()];
    headers.extend(events.iter().cloned());
    let rows: Vec<Vec<Value>> = buckets
        .iter()
        .map(|bucket| {
            let mut row = vec![Value::from(bucket.as_str())];
            row.extend(events.iter().map(|event| {
                counts
                    .get(&(bucket.clone(), event.clone()))
                    .cloned()
                    .unwrap_or_else(|| Value::from(0))
            }));
            row
        })
        .collect();

    let totals = (1..headers.len())
        .map(|c| sum_cells(rows.iter().map(|row| &row[c])))
        .collect();
    let mut pivoted = QueryResult::new(headers, rows);
    pivoted.meta.metrics.push(HeaderRows {
        title: META_EACH_EVENT_COUNT.to_string(),
        headers: events,
        rows: vec![totals],
    });
    Ok(pivoted)
}

/// Replaces `_group_key_<i>` headers with the group-by's property name.
pub(crate) fn translate_group_keys(result: &mut QueryResult, q: &Query) -> Result<(), QueryError> {
    for header in &mut result.headers {
        let Some(suffix) = header.strip_prefix(GROUP_KEY_PREFIX) else {
            continue;
        };
        let gbp = suffix
            .parse::<usize>()
            .ok()
            .and_then(|i| q.group_by.get(i))
            .ok_or_else(|| QueryError::processing(format!("invalid group key header {header}")))?;
        *header = gbp.property.clone();
    }
    Ok(())
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Drops a `.0` that ends a number, e.g. `"10.0 - 20.0"` becomes `"10 - 20"`.
fn strip_zero_fraction(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < chars.len() {
        let at_boundary = chars.get(i + 2).map_or(true, |&c| !is_word_char(c));
        if chars[i] == '.' && chars.get(i + 1) == Some(&'0') && at_boundary {
            i += 2;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Cleans bucket labels of numerical group-bys: `"5.0 - 5.0"` becomes `"5"`.
pub(crate) fn sanitize_numerical_range(raw: &str) -> String {
    let stripped = strip_zero_fraction(raw);
    match stripped.split_once(RANGE_SEPARATOR) {
        Some((low, high)) if low == high => low.to_string(),
        _ => stripped,
    }
}

/// Applied to translated headers. Each property name is handled once, over every
/// column carrying that name. The first `skip_rows` rows are left untouched.
fn sanitize_numerical_ranges(result: &mut QueryResult, q: &Query, skip_rows: usize) {
    let mut seen: HashSet<&str> = HashSet::new();
    for gbp in q.group_by.iter().filter(|g| g.is_numerical()) {
        if !seen.insert(gbp.property.as_str()) {
            continue;
        }
        let columns: Vec<usize> = result
            .headers
            .iter()
            .enumerate()
            .filter(|(_, h)| **h == gbp.property)
            .map(|(i, _)| i)
            .collect();
        for row in result.rows.iter_mut().skip(skip_rows) {
            for &c in &columns {
                if let Some(Value::String(cell)) = row.get(c) {
                    let cleaned = sanitize_numerical_range(cell);
                    row[c] = Value::String(cleaned);
                }
            }
        }
    }
}

fn conversion_percent(previous: f64, current: f64) -> String {
    if previous == 0.0 {
        return "0.0".to_string();
    }
    format!("{:.1}", current / previous * 100.0)
}

/// Null step counts become 0, then conversion columns are added after every
/// step but the first, followed by the overall conversion.
fn add_conversions(result: &mut QueryResult) -> Result<(), QueryError> {
    let steps: Vec<usize> = result
        .headers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.starts_with(STEP_PREFIX))
        .map(|(i, _)| i)
        .collect();
    if steps.is_empty() {
        return Err(QueryError::processing("funnel result has no step columns"));
    }
    let others: Vec<usize> = (0..result.headers.len()).filter(|i| !steps.contains(i)).collect();

    let mut headers: Vec<String> = others.iter().map(|&i| result.headers[i].clone()).collect();
    for (n, &s) in steps.iter().enumerate() {
        headers.push(result.headers[s].clone());
        if n > 0 {
            let prev = &result.headers[steps[n - 1]];
            headers.push(format!("{CONVERSION_PREFIX}{prev}_{}", result.headers[s]));
        }
    }
    headers.push(CONVERSION_OVERALL.to_string());

    let mut rows = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let mut out: Vec<Value> = others.iter().map(|&i| row[i].clone()).collect();
        let counts: Vec<Value> = steps
            .iter()
            .map(|&s| match &row[s] {
                Value::Null => Value::from(0),
                v => v.clone(),
            })
            .collect();
        for (n, count) in counts.iter().enumerate() {
            out.push(count.clone());
            if n > 0 {
                out.push(Value::from(conversion_percent(
                    cell_number(&counts[n - 1]),
                    cell_number(count),
                )));
            }
        }
        let first = counts.first().map(cell_number).unwrap_or(0.0);
        let last = counts.last().map(cell_number).unwrap_or(0.0);
        out.push(Value::from(conversion_percent(first, last)));
        rows.push(out);
    }

    result.headers = headers;
    result.rows = rows;
    Ok(())
}
