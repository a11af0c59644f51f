//! Insights compiler: unique-users and events-occurrence queries over one or more events.

use insightql_core::query::{
    EventsCondition, PropertyEntity, Query, QueryGroupByProperty, QueryType,
};
use insightql_core::result::{ALIAS_AGGREGATE, ALIAS_DATETIME, ALIAS_EVENT_NAME};
use insightql_core::{EngineConfig, QueryError, SqlStatement};

use crate::group_keys::{
    self, build_group_select, key_list, push_numerical_bucketing, BUCKETED_STEP,
};
use crate::prepare::{ensure_event_group_bys_bound, prepare, Prepared};
use crate::sql::{join_with_comma, statement, step_name, Fragment, SqlBuilder, COAL_USER_ID};
use crate::steps::{filter_step, step_join, FilterStep};

/// Compiles an insights query into one parameterized statement.
///
/// Compiling the same query twice yields identical SQL and params.
pub fn build_insights_query(
    project_id: u64,
    query: &Query,
    config: &EngineConfig,
) -> Result<SqlStatement, QueryError> {
    let prepared = prepare(query, config)?;
    build_prepared(project_id, &prepared, config)
}

pub(crate) fn build_prepared(
    project_id: u64,
    p: &Prepared,
    config: &EngineConfig,
) -> Result<SqlStatement, QueryError> {
    let q = &p.query;
    match q.query_type {
        QueryType::EventsOccurrence => {
            if q.events_condition == EventsCondition::EachGivenEvent {
                each_event_count(project_id, p, config)
            } else if q.events.len() == 1
                && !q.has_group_entity(PropertyEntity::User)
                && !q.has_numerical_group_by()
            {
                occurrence_single(project_id, p, config)
            } else {
                occurrence_given_event(project_id, p, config)
            }
        }
        QueryType::UniqueUsers => unique_users(project_id, p, config),
    }
}

/// SQL-side row cap. A single breakdown without time series is limited in SQL;
/// everything else is limited after execution.
pub(crate) fn sql_limit(config: &EngineConfig, group_bys: usize, time_series: bool) -> usize {
    if group_bys == 1 && !time_series {
        config.results_limit
    } else {
        config.max_results_limit
    }
}

fn qualified(step: &str, column: &str) -> String {
    format!("{step}.{column} as {column}")
}

/// Event-level keys of a tagged union branch. Keys of other steps are padded with `''`.
fn padded_keys(step_index: usize, event_level: &[&QueryGroupByProperty]) -> String {
    let step = step_name(step_index);
    let keys: Vec<String> = event_level
        .iter()
        .map(|g| {
            if g.event_name_index == step_index + 1 {
                qualified(&step, &g.key())
            } else {
                format!("'' as {}", g.key())
            }
        })
        .collect();
    keys.join(", ")
}

// ---- unique users ----

fn unique_users(
    project_id: u64,
    p: &Prepared,
    config: &EngineConfig,
) -> Result<SqlStatement, QueryError> {
    let q = &p.query;
    let condition = q.events_condition;
    if condition != EventsCondition::AnyGivenEvent {
        ensure_event_group_bys_bound(q)?;
    }

    let mut builder = SqlBuilder::new();
    let steps = push_unique_users_steps(&mut builder, project_id, p, condition)?;
    let ts = p.time_series();

    let ref_step = if steps.len() == 1 {
        steps[0].clone()
    } else {
        match condition {
            EventsCondition::AnyGivenEvent => {
                let event_keys = group_keys::of_entity(&q.group_by, PropertyEntity::Event);
                let branches: Vec<String> = steps
                    .iter()
                    .map(|step| {
                        let mut cols = vec![qualified(step, "event_user_id")];
                        if ts {
                            cols.push(qualified(step, ALIAS_DATETIME));
                        }
                        cols.extend(event_keys.iter().map(|g| qualified(step, &g.key())));
                        format!("SELECT {} FROM {step}", cols.join(", "))
                    })
                    .collect();
                builder.push_cte("events_union", Fragment::text(branches.join(" UNION ALL ")));
                "events_union".to_string()
            }
            EventsCondition::AllGivenEvent => {
                let intersect = intersect_select(q, &steps, ts);
                builder.push_cte("events_intersect", Fragment::text(intersect));
                "events_intersect".to_string()
            }
            EventsCondition::EachGivenEvent => {
                let event_level = group_keys::event_level(&q.group_by);
                let branches: Vec<String> = steps
                    .iter()
                    .enumerate()
                    .map(|(i, step)| {
                        let mut cols = vec![
                            qualified(step, ALIAS_EVENT_NAME),
                            qualified(step, "coal_user_id"),
                            qualified(step, "event_user_id"),
                        ];
                        if ts {
                            cols.push(qualified(step, ALIAS_DATETIME));
                        }
                        cols.push(padded_keys(i, &event_level));
                        format!("SELECT {} FROM {step}", join_with_comma(&cols))
                    })
                    .collect();
                builder.push_cte("each_events_union", Fragment::text(branches.join(" UNION ALL ")));
                "each_events_union".to_string()
            }
        }
    };

    let (term_name, event_keys, user_group_bys) = match condition {
        EventsCondition::AnyGivenEvent => (
            "any_users_union",
            group_keys::of_entity(&q.group_by, PropertyEntity::Event),
            group_keys::of_entity(&q.group_by, PropertyEntity::User),
        ),
        EventsCondition::AllGivenEvent => (
            "all_users_intersect",
            group_keys::event_level(&q.group_by),
            group_keys::unbound_user(&q.group_by),
        ),
        EventsCondition::EachGivenEvent => (
            "each_users_union",
            group_keys::event_level(&q.group_by),
            group_keys::unbound_user(&q.group_by),
        ),
    };

    aggregate(
        builder,
        p,
        config,
        Aggregate {
            ref_step: &ref_step,
            term_name,
            with_event_name: condition == EventsCondition::EachGivenEvent,
            ids: &["event_user_id"],
            event_keys,
            user_group_bys,
            count: "COUNT(DISTINCT(event_user_id))",
            order_by_event_name: false,
        },
    )
}

/// Pushes one `DISTINCT ON` step per event: a user's first matching event per
/// breakdown (and per bucket, for time series).
fn push_unique_users_steps(
    builder: &mut SqlBuilder,
    project_id: u64,
    p: &Prepared,
    condition: EventsCondition,
) -> Result<Vec<String>, QueryError> {
    let q = &p.query;
    let mut steps = Vec::with_capacity(q.events.len());
    for (i, event) in q.events.iter().enumerate() {
        let name = step_name(i);
        let keys = match condition {
            EventsCondition::AnyGivenEvent => {
                group_keys::of_entity(&q.group_by, PropertyEntity::Event)
            }
            _ => group_keys::for_step(&q.group_by, i, &event.name),
        };
        let step_keys = key_list(&keys);

        let mut distinct_on = vec!["coal_user_id".to_string(), step_keys.clone()];
        if let Some(ts) = &p.timestamp {
            distinct_on.push(ts.clone());
        }
        let mut select = Fragment::text(format!(
            "DISTINCT ON({}) {COAL_USER_ID} as coal_user_id",
            join_with_comma(&distinct_on)
        ));
        select.push_list(build_group_select(&keys)?);
        if let Some(ts) = &p.timestamp {
            select.push_list(Fragment::text(format!("{ts} as {ALIAS_DATETIME}")));
        }
        select.push_list(Fragment::text("events.user_id as event_user_id"));
        if condition == EventsCondition::EachGivenEvent {
            select.push_list(Fragment::new(
                format!("?::text AS {ALIAS_EVENT_NAME}"),
                vec![event.name.as_str().into()],
            ));
        }

        let order_by = if keys.is_empty() && p.timestamp.is_none() {
            String::new()
        } else {
            let datetime = if p.timestamp.is_some() { ALIAS_DATETIME } else { "" };
            format!(
                "{}, events.timestamp ASC",
                join_with_comma(&["coal_user_id", step_keys.as_str(), datetime])
            )
        };

        builder.push_named(filter_step(
            project_id,
            q.from,
            q.to,
            FilterStep {
                name: Some(name.clone()),
                event,
                select,
                join: step_join(event, &keys),
                group_by: String::new(),
                order_by,
            },
        )?);
        steps.push(name);
    }
    Ok(steps)
}

/// Users that did every event: steps joined on `coal_user_id` (and bucket).
fn intersect_select(q: &Query, steps: &[String], time_series: bool) -> String {
    let first = &steps[0];
    let mut cols = vec![qualified(first, "event_user_id")];
    if time_series {
        cols.push(qualified(first, ALIAS_DATETIME));
    }
    for g in group_keys::event_level(&q.group_by) {
        cols.push(qualified(&step_name(g.event_name_index - 1), &g.key()));
    }

    let mut sql = format!("SELECT {} FROM {first}", cols.join(", "));
    for i in 1..steps.len() {
        let (cur, prev) = (&steps[i], &steps[i - 1]);
        sql.push_str(&format!(" JOIN {cur} ON {cur}.coal_user_id = {prev}.coal_user_id"));
        if time_series {
            sql.push_str(&format!(" AND {cur}.datetime = {prev}.datetime"));
        }
    }
    sql
}

// ---- events occurrence ----

fn occurrence_single(
    project_id: u64,
    p: &Prepared,
    config: &EngineConfig,
) -> Result<SqlStatement, QueryError> {
    let q = &p.query;
    let event_gbps = group_keys::all(&q.group_by);
    let keys = key_list(&event_gbps);

    let mut select = Fragment::default();
    if let Some(ts) = &p.timestamp {
        select.push_list(Fragment::text(format!("{ts} as {ALIAS_DATETIME}")));
    }
    select.push_list(build_group_select(&event_gbps)?);
    select.push_list(Fragment::text(format!("COUNT(*) AS {ALIAS_AGGREGATE}")));

    let datetime = if p.time_series() { ALIAS_DATETIME } else { "" };
    let step = filter_step(
        project_id,
        q.from,
        q.to,
        FilterStep {
            name: None,
            event: &q.events[0],
            select,
            join: String::new(),
            group_by: join_with_comma(&[datetime, keys.as_str()]),
            order_by: format!("{ALIAS_AGGREGATE} DESC"),
        },
    )?;
    let limit = sql_limit(config, q.group_by.len(), p.time_series());
    statement(format!("{} LIMIT {limit}", step.sql), step.params)
}

fn occurrence_given_event(
    project_id: u64,
    p: &Prepared,
    config: &EngineConfig,
) -> Result<SqlStatement, QueryError> {
    let q = &p.query;
    let event_gbps = group_keys::of_entity(&q.group_by, PropertyEntity::Event);
    let event_keys = key_list(&event_gbps);

    let mut builder = SqlBuilder::new();
    let mut steps = Vec::with_capacity(q.events.len());
    for (i, event) in q.events.iter().enumerate() {
        let name = step_name(i);
        let mut select = Fragment::text("events.id as event_id, events.user_id as event_user_id");
        select.push_list(build_group_select(&event_gbps)?);
        if let Some(ts) = &p.timestamp {
            select.push_list(Fragment::text(format!("{ts} as {ALIAS_DATETIME}")));
        }
        select.push_list(Fragment::new(
            format!("?::text AS {ALIAS_EVENT_NAME}"),
            vec![event.name.as_str().into()],
        ));
        builder.push_named(filter_step(
            project_id,
            q.from,
            q.to,
            FilterStep {
                name: Some(name.clone()),
                event,
                select,
                join: String::new(),
                group_by: String::new(),
                order_by: String::new(),
            },
        )?);
        steps.push(name);
    }

    let ref_step = if steps.len() > 1 {
        let datetime = if p.time_series() { ALIAS_DATETIME } else { "" };
        let branches: Vec<String> = steps
            .iter()
            .map(|step| {
                let columns = join_with_comma(&[
                    "event_id, event_user_id, event_name",
                    datetime,
                    event_keys.as_str(),
                ]);
                format!("SELECT {columns} FROM {step}")
            })
            .collect();
        builder.push_cte("any_event", Fragment::text(branches.join(" UNION ALL ")));
        "any_event".to_string()
    } else {
        steps[0].clone()
    };

    aggregate(
        builder,
        p,
        config,
        Aggregate {
            ref_step: &ref_step,
            term_name: "users_any_event",
            with_event_name: true,
            ids: &["event_user_id", "event_id"],
            event_keys: event_gbps,
            user_group_bys: group_keys::of_entity(&q.group_by, PropertyEntity::User),
            count: "COUNT(*)",
            order_by_event_name: true,
        },
    )
}

fn each_event_count(
    project_id: u64,
    p: &Prepared,
    config: &EngineConfig,
) -> Result<SqlStatement, QueryError> {
    let q = &p.query;
    ensure_event_group_bys_bound(q)?;

    let mut builder = SqlBuilder::new();
    let mut steps = Vec::with_capacity(q.events.len());
    for (i, event) in q.events.iter().enumerate() {
        let name = step_name(i);
        let keys = group_keys::for_step(&q.group_by, i, &event.name);
        let mut select = Fragment::text("events.id as event_id, events.user_id as event_user_id");
        if let Some(ts) = &p.timestamp {
            select.push_list(Fragment::text(format!("{ts} as {ALIAS_DATETIME}")));
        }
        select.push_list(Fragment::new(
            format!("?::text AS {ALIAS_EVENT_NAME}"),
            vec![event.name.as_str().into()],
        ));
        select.push_list(build_group_select(&keys)?);
        let order_by = if q.group_by.is_empty() {
            String::new()
        } else {
            let ordered = join_with_comma(&["event_id", key_list(&keys).as_str()]);
            format!("{ordered}, events.timestamp ASC")
        };
        builder.push_named(filter_step(
            project_id,
            q.from,
            q.to,
            FilterStep {
                name: Some(name.clone()),
                event,
                select,
                join: step_join(event, &keys),
                group_by: String::new(),
                order_by,
            },
        )?);
        steps.push(name);
    }

    let event_level = group_keys::event_level(&q.group_by);
    let branches: Vec<String> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let mut cols = vec![
                qualified(step, ALIAS_EVENT_NAME),
                qualified(step, "event_id"),
                qualified(step, "event_user_id"),
            ];
            if p.time_series() {
                cols.push(qualified(step, ALIAS_DATETIME));
            }
            cols.push(padded_keys(i, &event_level));
            format!("SELECT {} FROM {step}", join_with_comma(&cols))
        })
        .collect();
    builder.push_cte("each_events_union", Fragment::text(branches.join(" UNION ALL ")));

    aggregate(
        builder,
        p,
        config,
        Aggregate {
            ref_step: "each_events_union",
            term_name: "each_users_union",
            with_event_name: true,
            ids: &["event_user_id", "event_id"],
            event_keys: event_level,
            user_group_bys: group_keys::unbound_user(&q.group_by),
            count: "COUNT(event_id)",
            order_by_event_name: false,
        },
    )
}

// ---- shared aggregation tail ----

struct Aggregate<'a> {
    /// CTE holding one row per counted unit.
    ref_step: &'a str,
    /// CTE adding the latest user properties to `ref_step`.
    term_name: &'a str,
    with_event_name: bool,
    ids: &'a [&'a str],
    /// Keys already present on `ref_step`.
    event_keys: Vec<&'a QueryGroupByProperty>,
    /// Keys computed here from the user's latest properties.
    user_group_bys: Vec<&'a QueryGroupByProperty>,
    count: &'a str,
    order_by_event_name: bool,
}

fn aggregate(
    mut builder: SqlBuilder,
    p: &Prepared,
    config: &EngineConfig,
    agg: Aggregate<'_>,
) -> Result<SqlStatement, QueryError> {
    let q = &p.query;
    let ts = p.time_series();
    let r = agg.ref_step;

    let mut term = Fragment::text(
        agg.ids
            .iter()
            .map(|id| format!("{r}.{id}"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    if agg.with_event_name {
        term.push_list(Fragment::text(format!("{r}.{ALIAS_EVENT_NAME}")));
    }
    term.push_list(build_group_select(&agg.user_group_bys)?);
    term.push_list(Fragment::text(key_list(&agg.event_keys)));
    if ts {
        term.push_list(Fragment::text(ALIAS_DATETIME));
    }
    let mut term_stmt = Fragment::text("SELECT ");
    term_stmt.push(term);
    term_stmt.push_str(&format!(" FROM {r}"));
    if !agg.user_group_bys.is_empty() {
        term_stmt.push_str(&format!(
            " LEFT JOIN users ON {r}.event_user_id=users.id \
             LEFT JOIN user_properties ON users.id=user_properties.user_id \
             AND user_properties.id=users.properties_id"
        ));
    }

    let all_keys = key_list(&group_keys::all(&q.group_by));
    let (from, select_keys, mut group_bys, order_bys) = if q.has_numerical_group_by() {
        builder.push_cte(agg.term_name, term_stmt);
        let bucketing = push_numerical_bucketing(
            &mut builder,
            &q.group_by,
            agg.term_name,
            agg.with_event_name,
            agg.ids,
            ts,
        );
        (
            BUCKETED_STEP.to_string(),
            bucketing.select_keys,
            bucketing.group_bys,
            bucketing.order_bys,
        )
    } else if !all_keys.is_empty() {
        builder.push_cte(agg.term_name, term_stmt);
        (
            agg.term_name.to_string(),
            format!("{all_keys}, "),
            vec![all_keys.clone()],
            vec![format!("{ALIAS_AGGREGATE} DESC")],
        )
    } else {
        (r.to_string(), String::new(), Vec::new(), vec![format!("{ALIAS_AGGREGATE} DESC")])
    };

    let mut select = String::from("SELECT ");
    if ts {
        select.push_str(&format!("{ALIAS_DATETIME}, "));
        group_bys.push(ALIAS_DATETIME.to_string());
    }
    if agg.with_event_name {
        select.push_str(&format!("{ALIAS_EVENT_NAME}, "));
        group_bys.insert(0, ALIAS_EVENT_NAME.to_string());
    }
    select.push_str(&format!("{select_keys}{} AS {ALIAS_AGGREGATE} FROM {from}", agg.count));
    let group_by = join_with_comma(&group_bys);
    if !group_by.is_empty() {
        select.push_str(&format!(" GROUP BY {group_by}"));
    }
    let mut orders = Vec::new();
    if agg.order_by_event_name {
        orders.push(ALIAS_EVENT_NAME.to_string());
    }
    orders.extend(order_bys);
    select.push_str(&format!(" ORDER BY {}", orders.join(", ")));
    select.push_str(&format!(" LIMIT {}", sql_limit(config, q.group_by.len(), ts)));

    builder.finish(Fragment::text(select))
}
