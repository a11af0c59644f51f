//! Group-by key expressions, per-step key selection and numerical bucketing.

use insightql_core::query::{
    PropertyEntity, PropertyType, QueryGroupByProperty, PROPERTY_VALUE_NONE,
};
use insightql_core::result::ALIAS_DATETIME;
use insightql_core::QueryError;

use crate::sql::{join_with_comma, Fragment, SqlBuilder};

const LOWER_BOUND_PERCENTILE: f64 = 0.02;
const UPPER_BOUND_PERCENTILE: f64 = 0.98;
/// Buckets between the bounds; values outside land in the two edge buckets.
const NUMERICAL_BUCKETS: u32 = 8;
pub(crate) const RANGE_SEPARATOR: &str = " - ";
pub(crate) const BUCKETED_STEP: &str = "bucketed";

/// `date_trunc` unit for a datetime group-by. Empty means day.
pub(crate) fn datetime_unit(granularity: &str) -> Result<&'static str, QueryError> {
    match granularity {
        "" | "day" | "date" => Ok("day"),
        "hour" => Ok("hour"),
        "week" => Ok("week"),
        "month" => Ok("month"),
        other => Err(QueryError::invalid(format!(
            "invalid granularity {other} on datetime group by"
        ))),
    }
}

/// Select expression for one group-by with missing and empty values mapped to `$none`.
pub(crate) fn group_key_select(gbp: &QueryGroupByProperty) -> Result<Fragment, QueryError> {
    let field = gbp.entity.properties_column();
    let key = gbp.key();
    let name = gbp.property.as_str();
    let none = PROPERTY_VALUE_NONE;
    if gbp.property_type == PropertyType::Datetime {
        let unit = datetime_unit(&gbp.granularity)?;
        return Ok(Fragment::new(
            format!(
                "CASE WHEN {field}->>? IS NULL THEN '{none}' WHEN {field}->>? = '' THEN '{none}' \
                 WHEN {field}->>? = '0' THEN '{none}' ELSE date_trunc('{unit}', \
                 to_timestamp(to_number(({field}->>?)::text,'9999999999'))::timestamp)::text \
                 END AS {key}"
            ),
            vec![name.into(), name.into(), name.into(), name.into()],
        ));
    }
    Ok(Fragment::new(
        format!(
            "CASE WHEN {field}->>? IS NULL THEN '{none}' WHEN {field}->>? = '' THEN '{none}' \
             ELSE {field}->>? END AS {key}"
        ),
        vec![name.into(), name.into(), name.into()],
    ))
}

/// Select list for `gbps`, in the order given.
pub(crate) fn build_group_select(gbps: &[&QueryGroupByProperty]) -> Result<Fragment, QueryError> {
    let mut select = Fragment::default();
    for gbp in gbps {
        select.push_list(group_key_select(gbp)?);
    }
    Ok(select)
}

/// Comma-joined aliases, in the order given.
pub(crate) fn key_list(gbps: &[&QueryGroupByProperty]) -> String {
    gbps.iter().map(|g| g.key()).collect::<Vec<_>>().join(", ")
}

pub(crate) fn all(gbps: &[QueryGroupByProperty]) -> Vec<&QueryGroupByProperty> {
    gbps.iter().collect()
}

pub(crate) fn of_entity(
    gbps: &[QueryGroupByProperty],
    entity: PropertyEntity,
) -> Vec<&QueryGroupByProperty> {
    gbps.iter().filter(|g| g.entity == entity).collect()
}

pub(crate) fn event_level(gbps: &[QueryGroupByProperty]) -> Vec<&QueryGroupByProperty> {
    gbps.iter().filter(|g| g.is_event_level()).collect()
}

/// User group-bys not bound to an event. These are read from the user's latest properties.
pub(crate) fn unbound_user(gbps: &[QueryGroupByProperty]) -> Vec<&QueryGroupByProperty> {
    gbps.iter()
        .filter(|g| g.entity == PropertyEntity::User && !g.is_event_level())
        .collect()
}

/// Group-bys bound to the step at `step_index` (0-based) for `event_name`.
pub(crate) fn for_step<'a>(
    gbps: &'a [QueryGroupByProperty],
    step_index: usize,
    event_name: &str,
) -> Vec<&'a QueryGroupByProperty> {
    gbps.iter()
        .filter(|g| {
            g.is_event_level() && g.event_name_index == step_index + 1 && g.event_name == event_name
        })
        .collect()
}

/// Output of the bucketing stage, consumed by the aggregate select.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Bucketing {
    /// Key expressions for the aggregate select, each followed by `", "`.
    pub select_keys: String,
    pub group_bys: Vec<String>,
    pub order_bys: Vec<String>,
}

/// Pushes one `_group_key_<i>_bounds` CTE per numerical group-by and a
/// `bucketed` CTE over `ref_step`.
///
/// `carried` columns are copied through untouched (ids, step flags).
pub(crate) fn push_numerical_bucketing(
    builder: &mut SqlBuilder,
    gbps: &[QueryGroupByProperty],
    ref_step: &str,
    with_event_name: bool,
    carried: &[&str],
    time_series: bool,
) -> Bucketing {
    let none = PROPERTY_VALUE_NONE;
    let mut out = Bucketing::default();
    let mut columns: Vec<String> = Vec::new();
    let mut bounds_steps: Vec<String> = Vec::new();
    if with_event_name {
        columns.push("event_name".to_string());
    }

    for gbp in gbps {
        let key = gbp.key();
        if !gbp.is_numerical() {
            columns.push(key.clone());
            out.group_bys.push(key.clone());
            out.select_keys.push_str(&format!("{key}, "));
            continue;
        }

        // The small offset on lbound keeps the lower bound value out of bucket 0.
        let bounds = format!("{key}_bounds");
        builder.push_cte(
            &bounds,
            Fragment::text(format!(
                "SELECT percentile_disc({LOWER_BOUND_PERCENTILE:.2}) \
                 WITHIN GROUP(ORDER BY {key}::numeric) + 0.00001 AS lbound, \
                 percentile_disc({UPPER_BOUND_PERCENTILE:.2}) \
                 WITHIN GROUP(ORDER BY {key}::numeric) AS ubound \
                 FROM {ref_step} WHERE {key} != '{none}' AND {key} != '' "
            )),
        );

        let bucket = format!("{key}_bucket");
        columns.push(format!(
            "COALESCE(NULLIF(COALESCE(NULLIF({key}, '{none}'), ''), ''), 'NaN') AS {key}"
        ));
        columns.push(format!(
            "CASE WHEN {key} = '{none}' THEN -1 WHEN {key} = '' THEN -1 \
             ELSE width_bucket({key}::numeric, {bounds}.lbound::numeric, \
             COALESCE(NULLIF({bounds}.ubound, {bounds}.lbound), {bounds}.ubound+1)::numeric, \
             {NUMERICAL_BUCKETS}) END AS {bucket}"
        ));
        out.select_keys.push_str(&format!(
            "COALESCE(NULLIF(concat(round(min({key}::numeric), 1), '{RANGE_SEPARATOR}', \
             round(max({key}::numeric), 1)), 'NaN{RANGE_SEPARATOR}NaN'), '{none}') AS {key}, "
        ));
        out.group_bys.push(bucket.clone());
        out.order_bys.push(bucket);
        bounds_steps.push(bounds);
    }

    columns.extend(carried.iter().map(|c| c.to_string()));
    if time_series {
        columns.push(ALIAS_DATETIME.to_string());
    }

    let mut from = ref_step.to_string();
    if !bounds_steps.is_empty() {
        from = join_with_comma(&[from, bounds_steps.join(", ")]);
    }
    builder.push_cte(
        BUCKETED_STEP,
        Fragment::text(format!("SELECT {} FROM {from}", columns.join(", "))),
    );
    out
}
