//! Reads for the attribution pipeline: event ids, session touch ranges, user
//! coalescing and conversion hits.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use insightql_core::attribution::{
    AttributionKey, AttributionKeyFilter, MarketingReport, RangeTimestamp, UserInfo,
};
use insightql_core::query::{QueryEventWithProperties, PropertyEntity, PROPERTY_VALUE_NONE};
use insightql_core::{QueryError, QueryResult, SqlExecutor, SqlStatement, SqlValue};

use crate::postprocess::cell_text;
use crate::properties::build_where;
use crate::sql::Fragment;

pub(crate) const GCLID_PROPERTY: &str = "$gclid";

/// Per raw user id, the touch range of every key seen in their sessions.
pub(crate) type SessionRanges = HashMap<String, HashMap<String, RangeTimestamp>>;

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn cell_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn cell_param(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Number(n) => n.as_i64().map(SqlValue::Int),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        _ => None,
    }
}

fn column(result: &QueryResult, name: &str) -> Result<usize, QueryError> {
    result
        .header_index(name)
        .ok_or_else(|| QueryError::processing(format!("attribution read is missing column {name}")))
}

async fn run(
    executor: &dyn SqlExecutor,
    statement: SqlStatement,
) -> Result<QueryResult, QueryError> {
    debug!(sql = %statement.sql, params = ?statement.params, "attribution read");
    Ok(executor.execute(&statement).await?)
}

/// Resolves event names to ids. A missing name is a caller error.
pub(crate) async fn event_name_ids(
    executor: &dyn SqlExecutor,
    project_id: u64,
    names: &[String],
) -> Result<HashMap<String, SqlValue>, QueryError> {
    let mut params = vec![SqlValue::from(project_id)];
    params.extend(names.iter().map(|n| SqlValue::from(n.as_str())));
    let result = run(
        executor,
        SqlStatement::new(
            format!(
                "SELECT id, name FROM event_names WHERE project_id=? AND name IN ({})",
                placeholders(names.len())
            ),
            params,
        ),
    )
    .await?;

    let (id, name) = (column(&result, "id")?, column(&result, "name")?);
    let ids: HashMap<String, SqlValue> = result
        .rows
        .iter()
        .filter_map(|row| Some((cell_text(&row[name]), cell_param(&row[id])?)))
        .collect();
    if let Some(missing) = names.iter().find(|n| !ids.contains_key(*n)) {
        return Err(QueryError::invalid(format!("Event not found: {missing}")));
    }
    Ok(ids)
}

fn none_coalesced(property: &str) -> Fragment {
    let none = PROPERTY_VALUE_NONE;
    Fragment::new(
        format!(
            "CASE WHEN sessions.properties->>? IS NULL THEN '{none}' \
             WHEN sessions.properties->>? = '' THEN '{none}' \
             ELSE sessions.properties->>? END"
        ),
        vec![property.into(), property.into(), property.into()],
    )
}

pub(crate) fn sessions_statement(
    project_id: u64,
    session_event_id: &SqlValue,
    key: AttributionKey,
    from: i64,
    to: i64,
) -> SqlStatement {
    let mut sql = Fragment::text("SELECT sessions.user_id, ");
    sql.push(none_coalesced(key.session_property()));
    sql.push_str(" AS attribution_key, ");
    sql.push(none_coalesced(GCLID_PROPERTY));
    sql.push(Fragment::new(
        " AS gclid, sessions.timestamp FROM events AS sessions WHERE sessions.project_id=? \
         AND sessions.event_name_id=? AND sessions.timestamp BETWEEN ? AND ?",
        vec![
            SqlValue::from(project_id),
            session_event_id.clone(),
            SqlValue::Int(from),
            SqlValue::Int(to),
        ],
    ));
    SqlStatement::new(sql.sql, sql.params)
}

fn filter_matches(filter: &AttributionKeyFilter, value: &str) -> bool {
    match filter.operator.as_str() {
        "equals" => value == filter.value,
        "notEqual" => value != filter.value,
        "contains" => value.contains(filter.value.as_str()),
        "notContains" => !value.contains(filter.value.as_str()),
        other => {
            warn!(operator = other, "unsupported attribution key filter operator");
            false
        }
    }
}

/// Only filters on `key` apply. A value passes when every AND filter matches,
/// or when any OR filter does.
pub(crate) fn passes_key_filters(
    filters: &[AttributionKeyFilter],
    key: AttributionKey,
    value: &str,
) -> bool {
    let (ors, ands): (Vec<&AttributionKeyFilter>, Vec<&AttributionKeyFilter>) = filters
        .iter()
        .filter(|f| f.attribution_key == key)
        .partition(|f| f.is_or());
    if ors.is_empty() && ands.is_empty() {
        return true;
    }
    (!ands.is_empty() && ands.iter().all(|f| filter_matches(f, value)))
        || ors.iter().any(|f| filter_matches(f, value))
}

/// Inputs for reading session touch ranges.
pub(crate) struct SessionScan<'a> {
    pub project_id: u64,
    pub session_event_id: &'a SqlValue,
    pub key: AttributionKey,
    pub filters: &'a [AttributionKeyFilter],
    /// Read range, lookback included.
    pub from: i64,
    pub to: i64,
    /// Query period, for `within_query_period`.
    pub period: (i64, i64),
}

pub(crate) async fn session_ranges(
    executor: &dyn SqlExecutor,
    scan: SessionScan<'_>,
    report: &MarketingReport,
) -> Result<SessionRanges, QueryError> {
    let result = run(
        executor,
        sessions_statement(scan.project_id, scan.session_event_id, scan.key, scan.from, scan.to),
    )
    .await?;
    let user = column(&result, "user_id")?;
    let key = column(&result, "attribution_key")?;
    let gclid = column(&result, "gclid")?;
    let timestamp = column(&result, "timestamp")?;

    let mut ranges = SessionRanges::new();
    for row in &result.rows {
        let Some(ts) = cell_i64(&row[timestamp]) else {
            continue;
        };
        let mut value = cell_text(&row[key]);
        if value.is_empty() {
            value = PROPERTY_VALUE_NONE.to_string();
        }
        // Filters see the tracked value; a known click id then overrides it.
        if !passes_key_filters(scan.filters, scan.key, &value) {
            continue;
        }
        if let Some(matched) = report.key_for_gclid(&cell_text(&row[gclid])) {
            value = matched.to_string();
        }
        let within = scan.period.0 <= ts && ts <= scan.period.1;
        let touch = RangeTimestamp::at(ts, within);
        ranges
            .entry(cell_text(&row[user]))
            .or_default()
            .entry(value)
            .and_modify(|r| r.merge(&touch))
            .or_insert(touch);
    }
    Ok(ranges)
}

/// Fills `users` with coalesced ids for every raw id not already known.
/// Ids absent from `users` coalesce to themselves.
pub(crate) async fn coalesce_users<'a>(
    executor: &dyn SqlExecutor,
    raw_ids: impl IntoIterator<Item = &'a String>,
    batch_size: usize,
    users: &mut HashMap<String, UserInfo>,
) -> Result<(), QueryError> {
    let mut pending: Vec<String> = raw_ids
        .into_iter()
        .filter(|id| !users.contains_key(*id))
        .cloned()
        .collect();
    pending.sort();
    pending.dedup();

    for batch in pending.chunks(batch_size.max(1)) {
        let result = run(
            executor,
            SqlStatement::new(
                format!(
                    "SELECT id, COALESCE(users.customer_user_id, users.id) AS coal_user_id, \
                     properties_id FROM users WHERE id IN ({})",
                    placeholders(batch.len())
                ),
                batch.iter().map(|id| SqlValue::from(id.as_str())).collect(),
            ),
        )
        .await?;
        let id = column(&result, "id")?;
        let coal = column(&result, "coal_user_id")?;
        let properties = result.header_index("properties_id");
        for row in &result.rows {
            users.insert(
                cell_text(&row[id]),
                UserInfo {
                    coal_user_id: cell_text(&row[coal]),
                    properties_id: properties.map(|p| cell_text(&row[p])).unwrap_or_default(),
                },
            );
        }
        for raw in batch {
            users.entry(raw.clone()).or_insert_with(|| UserInfo {
                coal_user_id: raw.clone(),
                properties_id: String::new(),
            });
        }
    }
    Ok(())
}

pub(crate) fn coal_id<'a>(users: &'a HashMap<String, UserInfo>, raw: &'a str) -> &'a str {
    users.get(raw).map_or(raw, |u| u.coal_user_id.as_str())
}

/// Touch ranges merged per coalesced user.
pub(crate) fn merge_by_coalesced_user(
    ranges: &SessionRanges,
    users: &HashMap<String, UserInfo>,
) -> SessionRanges {
    let mut merged = SessionRanges::new();
    for (raw, keys) in ranges {
        let target = merged.entry(coal_id(users, raw).to_string()).or_default();
        for (key, range) in keys {
            target
                .entry(key.clone())
                .and_modify(|r| r.merge(range))
                .or_insert(*range);
        }
    }
    merged
}

pub(crate) fn hits_statement(
    project_id: u64,
    event: &QueryEventWithProperties,
    event_id: &SqlValue,
    from: i64,
    to: i64,
    users: Option<&[String]>,
) -> Result<SqlStatement, QueryError> {
    let mut sql = Fragment::text("SELECT user_id, timestamp FROM events");
    if event.has_filter_on(PropertyEntity::User) {
        sql.push_str(" LEFT JOIN user_properties ON events.user_properties_id=user_properties.id");
    }
    sql.push(Fragment::new(
        " WHERE events.project_id=? AND timestamp >= ? AND timestamp <= ? \
         AND events.event_name_id IN (?)",
        vec![SqlValue::from(project_id), SqlValue::Int(from), SqlValue::Int(to), event_id.clone()],
    ));
    let predicates = build_where(&event.properties)?;
    if !predicates.is_empty() {
        sql.push_str(" AND (");
        sql.push(predicates);
        sql.push_str(")");
    }
    if let Some(users) = users {
        sql.push(Fragment::new(
            format!(" AND user_id IN ({})", placeholders(users.len())),
            users.iter().map(|u| SqlValue::from(u.as_str())).collect(),
        ));
    }
    Ok(SqlStatement::new(sql.sql, sql.params))
}

/// Raw `(user_id, timestamp)` hits of `event` in `[from, to]`, optionally limited
/// to `users` (queried in batches).
pub(crate) async fn event_hits(
    executor: &dyn SqlExecutor,
    project_id: u64,
    event: &QueryEventWithProperties,
    event_id: &SqlValue,
    (from, to): (i64, i64),
    users: Option<(&[String], usize)>,
) -> Result<Vec<(String, i64)>, QueryError> {
    let statements = match users {
        None => vec![hits_statement(project_id, event, event_id, from, to, None)?],
        Some((users, batch_size)) => users
            .chunks(batch_size.max(1))
            .map(|batch| hits_statement(project_id, event, event_id, from, to, Some(batch)))
            .collect::<Result<_, _>>()?,
    };

    let mut hits = Vec::new();
    for statement in statements {
        let result = run(executor, statement).await?;
        let user = column(&result, "user_id")?;
        let timestamp = column(&result, "timestamp")?;
        hits.extend(
            result
                .rows
                .iter()
                .filter_map(|row| Some((cell_text(&row[user]), cell_i64(&row[timestamp])?))),
        );
    }
    Ok(hits)
}

/// Earliest hit per coalesced user.
pub(crate) fn earliest_by_coalesced_user(
    hits: &[(String, i64)],
    users: &HashMap<String, UserInfo>,
) -> HashMap<String, i64> {
    let mut earliest: HashMap<String, i64> = HashMap::new();
    for (raw, ts) in hits {
        earliest
            .entry(coal_id(users, raw).to_string())
            .and_modify(|t| *t = (*t).min(*ts))
            .or_insert(*ts);
    }
    earliest
}
