//! WHERE predicates over event and user properties.

use serde::Deserialize;
use tracing::error;

use insightql_core::query::{Operator, PropertyType, QueryProperty, PROPERTY_VALUE_NONE};
use insightql_core::{QueryError, SqlValue};

use crate::sql::Fragment;

/// SQL operator for a wire operator. Unknown names fall back to `=`.
pub(crate) fn sql_operator(op: &Operator) -> &'static str {
    match op {
        Operator::Equals => "=",
        Operator::NotEqual => "!=",
        Operator::GreaterThan => ">",
        Operator::LesserThan => "<",
        Operator::GreaterThanOrEqual => ">=",
        Operator::LesserThanOrEqual => "<=",
        Operator::Contains => "LIKE",
        Operator::NotContains => "NOT LIKE",
        Operator::Unknown(raw) => {
            error!(operator = %raw, "invalid query operator, using default");
            "="
        }
    }
}

#[derive(Debug, Deserialize)]
struct DateTimeRange {
    fr: i64,
    to: i64,
}

fn connector(logical_op: &str) -> Result<&'static str, QueryError> {
    match logical_op {
        "" | "AND" => Ok("AND"),
        "OR" => Ok("OR"),
        other => Err(QueryError::invalid(format!(
            "invalid logical op on where condition: {other}"
        ))),
    }
}

fn predicate(p: &QueryProperty) -> Result<Fragment, QueryError> {
    let field = p.entity.properties_column();
    let op = sql_operator(&p.operator);

    if p.value == PROPERTY_VALUE_NONE {
        let sql = match op {
            "=" => format!("(NOT jsonb_exists({field}, ?) OR {field}->>?='')"),
            "!=" => format!("(jsonb_exists({field}, ?) AND {field}->>?!='')"),
            _ => {
                return Err(QueryError::invalid(format!(
                    "unsupported operator {op} for property value none"
                )))
            }
        };
        return Ok(Fragment::new(
            sql,
            vec![p.property.as_str().into(), p.property.as_str().into()],
        ));
    }

    match p.property_type {
        PropertyType::Datetime => {
            let range: DateTimeRange = serde_json::from_str(&p.value).map_err(|e| {
                QueryError::invalid(format!("invalid datetime value on {}: {e}", p.property))
            })?;
            Ok(Fragment::new(
                format!("({field}->>?>=? AND {field}->>?<=?)"),
                vec![
                    p.property.as_str().into(),
                    SqlValue::Int(range.fr),
                    p.property.as_str().into(),
                    SqlValue::Int(range.to),
                ],
            ))
        }
        PropertyType::Numerical => {
            let value: f64 = p.value.trim().parse().map_err(|_| {
                QueryError::invalid(format!(
                    "invalid numerical value {} on {}",
                    p.value, p.property
                ))
            })?;
            Ok(Fragment::new(
                format!(
                    "CASE WHEN json_typeof({field}::json->?) = 'number' \
                     THEN ({field}->>?)::float {op} ? ELSE false END"
                ),
                vec![
                    p.property.as_str().into(),
                    p.property.as_str().into(),
                    SqlValue::Float(value),
                ],
            ))
        }
        PropertyType::Categorical => {
            let value = match p.operator {
                Operator::Contains | Operator::NotContains => format!("%{}%", p.value),
                _ => p.value.clone(),
            };
            Ok(Fragment::new(
                format!("{field}->>? {op} ?"),
                vec![p.property.as_str().into(), value.into()],
            ))
        }
    }
}

/// Builds the predicate list in the given order. The first predicate has no
/// connector; later ones are joined by their own `lop`.
pub(crate) fn build_where(properties: &[QueryProperty]) -> Result<Fragment, QueryError> {
    let mut out = Fragment::default();
    for (i, p) in properties.iter().enumerate() {
        let connector = connector(&p.logical_op)?;
        let pred = predicate(p)?;
        if i > 0 {
            out.push_str(&format!(" {connector} "));
        }
        out.push(pred);
    }
    Ok(out)
}
