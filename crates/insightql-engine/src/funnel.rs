//! Funnel compiler: ordered step chaining with drop-off preserved.

use insightql_core::query::{
    Query, QueryClass, QueryGroupByProperty, PROPERTY_VALUE_NONE, SESSION_EVENT_NAME,
};
use insightql_core::{EngineConfig, QueryError, SqlStatement};

use crate::group_keys::{
    self, build_group_select, key_list, push_numerical_bucketing, BUCKETED_STEP,
};
use crate::prepare::{ensure_event_group_bys_bound, prepare, Prepared};
use crate::sql::{join_with_comma, step_name, Fragment, SqlBuilder, COAL_USER_ID};
use crate::steps::{filter_step, step_join, FilterStep};

pub(crate) const FUNNEL_STEP: &str = "funnel";
pub(crate) const NO_GROUP: &str = "$no_group";

/// Compiles a funnel query. Steps are counted per coalesced user, each step
/// strictly after the previous one.
pub fn build_funnel_query(
    project_id: u64,
    query: &Query,
    config: &EngineConfig,
) -> Result<SqlStatement, QueryError> {
    let mut query = query.clone();
    query.class = QueryClass::Funnel;
    let prepared = prepare(&query, config)?;
    build_prepared(project_id, &prepared, config)
}

/// 1-based `(start, end)` step range scoped to one session, if requested.
fn session_range(q: &Query) -> Option<(usize, usize)> {
    let (start, end) = (q.session_start_event, q.session_end_event);
    if start > 0 && end > 0 && start < end {
        Some((start as usize, end as usize))
    } else {
        None
    }
}

/// Step `i` (0-based) projects a session id.
fn carries_session(range: Option<(usize, usize)>, i: usize) -> bool {
    range.is_some_and(|(start, end)| start - 1 <= i && i < end)
}

/// Step `i` must share its session with step `i - 1`.
fn joins_on_session(range: Option<(usize, usize)>, i: usize) -> bool {
    range.is_some_and(|(start, end)| start <= i && i < end)
}

fn chain_name(i: usize) -> String {
    format!("step_{i}_step_{}_users", i - 1)
}

/// Source CTE of the columns belonging to step `i`.
fn step_source(i: usize) -> String {
    if i == 0 {
        step_name(0)
    } else {
        chain_name(i)
    }
}

pub(crate) fn build_prepared(
    project_id: u64,
    p: &Prepared,
    config: &EngineConfig,
) -> Result<SqlStatement, QueryError> {
    let q = &p.query;
    ensure_event_group_bys_bound(q)?;
    let sessions = session_range(q);

    let mut builder = SqlBuilder::new();
    let mut step_keys: Vec<Vec<&QueryGroupByProperty>> = Vec::with_capacity(q.events.len());
    for (i, event) in q.events.iter().enumerate() {
        let name = step_name(i);
        let keys = group_keys::for_step(&q.group_by, i, &event.name);

        let distinct = if i == 0 {
            format!("DISTINCT ON({COAL_USER_ID}) ")
        } else {
            String::new()
        };
        let mut select = Fragment::text(format!(
            "{distinct}{COAL_USER_ID} as coal_user_id, events.user_id, events.timestamp, \
             1 as {name}"
        ));
        if carries_session(sessions, i) {
            let session = if event.name == SESSION_EVENT_NAME {
                "events.id::text as session_id"
            } else {
                "events.session_id as session_id"
            };
            select.push_list(Fragment::text(session));
        }
        select.push_list(build_group_select(&keys)?);

        builder.push_named(filter_step(
            project_id,
            q.from,
            q.to,
            FilterStep {
                name: Some(name),
                event,
                select,
                join: step_join(event, &keys),
                group_by: String::new(),
                order_by: "coal_user_id, events.timestamp ASC".to_string(),
            },
        )?);
        step_keys.push(keys);
    }

    for i in 1..q.events.len() {
        let cur = step_name(i);
        let prev = step_source(i - 1);
        let mut cols = vec![
            format!("DISTINCT ON({cur}.coal_user_id) {cur}.coal_user_id"),
            format!("{cur}.user_id"),
            format!("{cur}.timestamp"),
        ];
        if carries_session(sessions, i) {
            cols.push(format!("{cur}.session_id"));
        }
        cols.push(format!("{cur}.{cur}"));
        cols.extend(step_keys[i].iter().map(|g| format!("{cur}.{}", g.key())));

        let mut body = format!(
            "SELECT {} FROM {prev} LEFT JOIN {cur} ON {prev}.coal_user_id = {cur}.coal_user_id \
             WHERE {cur}.timestamp > {prev}.timestamp",
            cols.join(", ")
        );
        if joins_on_session(sessions, i) {
            body.push_str(&format!(" AND {cur}.session_id = {prev}.session_id"));
        }
        body.push_str(&format!(" ORDER BY {cur}.coal_user_id, {cur}.timestamp ASC"));
        builder.push_cte(&chain_name(i), Fragment::text(body));
    }

    builder.push_cte(FUNNEL_STEP, funnel_select(q)?);
    let tail = terminal_select(q, config, &mut builder);
    builder.finish(Fragment::text(tail))
}

/// One row per user entering step 0, with a flag per reached step.
fn funnel_select(q: &Query) -> Result<Fragment, QueryError> {
    let none = PROPERTY_VALUE_NONE;
    let mut select = Fragment::text(
        (0..q.events.len())
            .map(|i| format!("{}.{}", step_source(i), step_name(i)))
            .collect::<Vec<_>>()
            .join(", "),
    );
    let user_group_bys = group_keys::unbound_user(&q.group_by);
    select.push_list(build_group_select(&user_group_bys)?);
    for g in group_keys::event_level(&q.group_by) {
        let column = format!("{}.{}", step_source(g.event_name_index - 1), g.key());
        select.push_list(Fragment::text(format!(
            "CASE WHEN {column} IS NULL THEN '{none}' WHEN {column} = '' THEN '{none}' \
             ELSE {column} END AS {}",
            g.key()
        )));
    }

    let mut out = Fragment::text("SELECT ");
    out.push(select);
    out.push_str(" FROM step_0");
    if !user_group_bys.is_empty() {
        out.push_str(
            " LEFT JOIN users ON step_0.user_id=users.id \
             LEFT JOIN user_properties ON users.id=user_properties.user_id \
             AND user_properties.id=users.properties_id",
        );
    }
    for i in 1..q.events.len() {
        let (prev, cur) = (step_source(i - 1), chain_name(i));
        out.push_str(&format!(" LEFT JOIN {cur} ON {prev}.coal_user_id={cur}.coal_user_id"));
    }
    Ok(out)
}

/// Totals without breakdown; with breakdown, a `$no_group` totals row followed by
/// the top groups.
fn terminal_select(q: &Query, config: &EngineConfig, builder: &mut SqlBuilder) -> String {
    let step_names: Vec<String> = (0..q.events.len()).map(step_name).collect();
    let sums = step_names
        .iter()
        .map(|s| format!("SUM({s}) AS {s}"))
        .collect::<Vec<_>>()
        .join(", ");
    if q.group_by.is_empty() {
        return format!("SELECT {sums} FROM {FUNNEL_STEP}");
    }

    let keys = key_list(&group_keys::all(&q.group_by));
    let no_group = q
        .group_by
        .iter()
        .map(|g| format!("'{NO_GROUP}' AS {}", g.key()))
        .collect::<Vec<_>>()
        .join(", ");

    let limit = config.results_limit;
    let grouped = if q.has_numerical_group_by() {
        let carried: Vec<&str> = step_names.iter().map(String::as_str).collect();
        let bucketing =
            push_numerical_bucketing(builder, &q.group_by, FUNNEL_STEP, false, &carried, false);
        format!(
            "SELECT {}{sums} FROM {BUCKETED_STEP} GROUP BY {} ORDER BY {} LIMIT {limit}",
            bucketing.select_keys,
            join_with_comma(&bucketing.group_bys),
            bucketing.order_bys.join(", ")
        )
    } else {
        format!(
            "SELECT {keys}, {sums} FROM {FUNNEL_STEP} GROUP BY {keys} \
             ORDER BY step_0 DESC LIMIT {limit}"
        )
    };
    format!(
        "SELECT {no_group}, {sums} FROM {FUNNEL_STEP} \
         UNION ALL SELECT * FROM ({grouped}) AS group_funnel"
    )
}
