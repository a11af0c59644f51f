//! Query decoding, validation and normalization shared by every compiler entry point.

use chrono_tz::Tz;
use serde_json::Value;

use insightql_core::query::{
    Granularity, PropertyEntity, PropertyType, Query, QueryClass, QueryType,
};
use insightql_core::{EngineConfig, QueryError};

use crate::group_keys::datetime_unit;
use crate::steps::{parse_timezone, timestamp_select};

pub const ERR_INVALID_QUERY_TYPE: &str = "Invalid query type given";
pub const ERR_INVALID_EVENTS_CONDITION: &str = "Invalid events condition given";
pub const ERR_NO_EVENTS: &str = "No events to process";
pub const ERR_INVALID_TIME_RANGE: &str = "Invalid query time range";
pub const ERR_INVALID_GROUP_BY_TIMESTAMP: &str = "Invalid group by timestamp";
pub const ERR_MAX_FUNNEL_STEPS: &str = "Max funnel steps exceeded";
pub const ERR_INVALID_GROUP_BY: &str = "Invalid group by property";

const QUERY_TYPES: [&str; 2] = ["events_occurrence", "unique_users"];
const EVENTS_CONDITIONS: [&str; 3] = ["any_given_event", "all_given_event", "each_given_event"];

/// Decodes a wire query, reporting an unknown `ty` or `ec` with a caller-facing message.
pub fn decode_query(raw: &str) -> Result<Query, QueryError> {
    let value: Value = serde_json::from_str(raw)?;
    let is_known = |field: &str, known: &[&str]| {
        value
            .get(field)
            .and_then(Value::as_str)
            .map(|v| known.contains(&v))
            .unwrap_or(false)
    };
    if !is_known("ty", &QUERY_TYPES) {
        return Err(QueryError::invalid(ERR_INVALID_QUERY_TYPE));
    }
    if !is_known("ec", &EVENTS_CONDITIONS) {
        return Err(QueryError::invalid(ERR_INVALID_EVENTS_CONDITION));
    }
    Ok(serde_json::from_value(value)?)
}

/// A validated query with its indexes pinned and its time bucketing resolved.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub query: Query,
    pub granularity: Option<Granularity>,
    pub timezone: Tz,
    /// Bucketed timestamp select expression, when a time series was requested.
    pub timestamp: Option<String>,
}

impl Prepared {
    pub fn time_series(&self) -> bool {
        self.granularity.is_some()
    }
}

pub(crate) fn prepare(query: &Query, config: &EngineConfig) -> Result<Prepared, QueryError> {
    let mut query = query.clone();
    query.assign_group_indexes();
    validate(&query, config)?;
    bind_single_event_group_bys(&mut query);

    let granularity = query
        .granularity()
        .map_err(|_| QueryError::invalid(ERR_INVALID_GROUP_BY_TIMESTAMP))?;
    let timezone = parse_timezone(query.timezone_or_default())?;
    let timestamp = granularity.map(|g| timestamp_select(g, timezone));
    Ok(Prepared {
        query,
        granularity,
        timezone,
        timestamp,
    })
}

pub(crate) fn validate(query: &Query, config: &EngineConfig) -> Result<(), QueryError> {
    if query.events.is_empty() {
        return Err(QueryError::invalid(ERR_NO_EVENTS));
    }
    if query.from == 0 || query.to == 0 || query.from > query.to {
        return Err(QueryError::invalid(ERR_INVALID_TIME_RANGE));
    }
    if query.granularity().is_err() {
        return Err(QueryError::invalid(ERR_INVALID_GROUP_BY_TIMESTAMP));
    }
    if query.events.iter().any(|e| e.name.is_empty()) {
        return Err(QueryError::invalid("Invalid event name given"));
    }
    if query.class == QueryClass::Funnel {
        if query.query_type == QueryType::EventsOccurrence {
            return Err(QueryError::invalid(ERR_INVALID_QUERY_TYPE));
        }
        if query.events.len() > config.max_funnel_steps {
            return Err(QueryError::invalid(ERR_MAX_FUNNEL_STEPS));
        }
    }
    for gbp in &query.group_by {
        if gbp.event_name_index > query.events.len() {
            return Err(QueryError::invalid(ERR_INVALID_GROUP_BY));
        }
        if gbp.is_event_level() && query.events[gbp.event_name_index - 1].name != gbp.event_name {
            return Err(QueryError::invalid(ERR_INVALID_GROUP_BY));
        }
        if gbp.property_type == PropertyType::Datetime {
            datetime_unit(&gbp.granularity)?;
        }
    }
    Ok(())
}

/// Event-entity breakdowns must name their event unless the query unions events.
pub(crate) fn ensure_event_group_bys_bound(q: &Query) -> Result<(), QueryError> {
    let unbound = q
        .group_by
        .iter()
        .any(|g| g.entity == PropertyEntity::Event && !g.is_event_level());
    if unbound {
        return Err(QueryError::invalid(ERR_INVALID_GROUP_BY));
    }
    Ok(())
}

/// With a single event, an unbound event group-by can only mean that event.
fn bind_single_event_group_bys(query: &mut Query) {
    if query.events.len() != 1 {
        return;
    }
    let name = query.events[0].name.clone();
    for gbp in query
        .group_by
        .iter_mut()
        .filter(|g| g.entity == PropertyEntity::Event && !g.is_event_level())
    {
        gbp.event_name = name.clone();
        gbp.event_name_index = 1;
    }
}
