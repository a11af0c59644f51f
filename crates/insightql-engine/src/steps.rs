//! Per-event filter steps: the `step_<i>` CTEs every compiled query starts from.

use chrono_tz::Tz;

use insightql_core::query::{
    Granularity, PropertyEntity, QueryEventWithProperties, QueryGroupByProperty,
};
use insightql_core::{QueryError, SqlValue};

use crate::properties::build_where;
use crate::sql::Fragment;

pub(crate) const JOIN_USERS: &str = "JOIN users ON events.user_id=users.id";
const JOIN_STEP_USER_PROPERTIES: &str =
    "JOIN user_properties on events.user_properties_id=user_properties.id";
const JOIN_FILTER_USER_PROPERTIES: &str =
    "LEFT JOIN user_properties ON events.user_properties_id=user_properties.id";

/// Inputs for one filter step.
#[derive(Debug)]
pub(crate) struct FilterStep<'a> {
    /// `None` builds an unnamed statement that reads `event_names` directly.
    pub name: Option<String>,
    pub event: &'a QueryEventWithProperties,
    pub select: Fragment,
    pub join: String,
    pub group_by: String,
    pub order_by: String,
}

/// Builds `step_i_names AS (...), step_i AS (...)`, or a bare `SELECT` for an unnamed step.
///
/// Param order: names lookup, select, range, event name, predicates.
pub(crate) fn filter_step(
    project_id: u64,
    from: i64,
    to: i64,
    step: FilterStep<'_>,
) -> Result<Fragment, QueryError> {
    if from == 0 || to == 0 {
        return Err(QueryError::invalid("invalid timerange on events filter"));
    }
    if step.select.is_empty() {
        return Err(QueryError::invalid("invalid select on events filter"));
    }
    if step.event.name.is_empty() {
        return Err(QueryError::invalid("invalid event name on events filter"));
    }

    let mut out = Fragment::default();
    let names_ref = match &step.name {
        Some(name) => {
            let names = format!("{name}_names");
            out.push(Fragment::new(
                format!(
                    "{names} AS (SELECT id, project_id, name FROM event_names \
                     WHERE project_id=? AND name=?), "
                ),
                vec![SqlValue::from(project_id), step.event.name.as_str().into()],
            ));
            names
        }
        None => "event_names".to_string(),
    };

    let mut body = Fragment::text("SELECT ");
    body.push(step.select);
    body.push_str(" FROM events");
    if !step.join.is_empty() {
        body.push_str(" ");
        body.push_str(&step.join);
    }
    if step.event.has_filter_on(PropertyEntity::User) {
        body.push_str(" ");
        body.push_str(JOIN_FILTER_USER_PROPERTIES);
    }
    body.push(Fragment::new(
        format!(
            " WHERE events.project_id=? AND timestamp>=? AND timestamp<=? \
             AND events.event_name_id IN (SELECT id FROM {names_ref} WHERE project_id=? AND name=?)"
        ),
        vec![
            SqlValue::from(project_id),
            SqlValue::Int(from),
            SqlValue::Int(to),
            SqlValue::from(project_id),
            step.event.name.as_str().into(),
        ],
    ));

    let predicates = build_where(&step.event.properties)?;
    if !predicates.is_empty() {
        body.push_str(" AND ( ");
        body.push(predicates);
        body.push_str(" )");
    }
    if !step.group_by.is_empty() {
        body.push_str(&format!(" GROUP BY {}", step.group_by));
    }
    if !step.order_by.is_empty() {
        body.push_str(&format!(" ORDER BY {}", step.order_by));
    }

    match &step.name {
        Some(name) => {
            out.push_str(&format!("{name} AS ("));
            out.push(body);
            out.push_str(")");
            Ok(out)
        }
        None => Ok(body),
    }
}

/// Join clause for a step: always `users`, plus the event-time `user_properties`
/// when a user group-by is read in the step and no user filter already joined it.
pub(crate) fn step_join(
    event: &QueryEventWithProperties,
    step_group_bys: &[&QueryGroupByProperty],
) -> String {
    let user_group_by = step_group_bys.iter().any(|g| g.entity == PropertyEntity::User);
    if user_group_by && !event.has_filter_on(PropertyEntity::User) {
        format!("{JOIN_USERS} {JOIN_STEP_USER_PROPERTIES}")
    } else {
        JOIN_USERS.to_string()
    }
}

/// Validates an IANA timezone name before it is inlined into SQL.
pub(crate) fn parse_timezone(name: &str) -> Result<Tz, QueryError> {
    name.parse::<Tz>()
        .map_err(|_| QueryError::invalid(format!("Invalid timezone {name}")))
}

/// Bucketed event timestamp, e.g. `date_trunc('day', to_timestamp(timestamp) AT TIME ZONE 'UTC')`.
pub(crate) fn timestamp_select(granularity: Granularity, timezone: Tz) -> String {
    format!(
        "date_trunc('{}', to_timestamp(timestamp) AT TIME ZONE '{}')",
        granularity.trunc_unit(),
        timezone.name()
    )
}
