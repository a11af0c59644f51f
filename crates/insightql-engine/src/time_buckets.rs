//! Time-series bucket enumeration and timestamp normalization in the query timezone.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone,
    Timelike,
};
use chrono_tz::Tz;
use serde_json::Value;

use insightql_core::query::Granularity;
use insightql_core::QueryError;

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Resolves a local wall-clock time. Ambiguous times take the earlier instant;
/// times inside a DST gap move forward an hour.
fn localize(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(a, b) => Some(a.min(b)),
        LocalResult::None => tz.from_local_datetime(&(naive + Duration::hours(1))).earliest(),
    }
}

fn local_midnight(tz: Tz, date: NaiveDate) -> Option<DateTime<Tz>> {
    localize(tz, date.and_hms_opt(0, 0, 0)?)
}

fn first_of_month(date: NaiveDate) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
}

fn next_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Start of the bucket containing `dt`. Weeks start on Monday.
pub(crate) fn truncate(dt: DateTime<Tz>, granularity: Granularity) -> Option<DateTime<Tz>> {
    let tz = dt.timezone();
    let local = dt.naive_local();
    match granularity {
        Granularity::Hour => {
            let naive = local.date().and_hms_opt(local.hour(), 0, 0)?;
            localize(tz, naive)
        }
        Granularity::Date => local_midnight(tz, local.date()),
        Granularity::Week => {
            let days_from_monday = i64::from(local.date().weekday().num_days_from_monday());
            local_midnight(tz, local.date() - Duration::days(days_from_monday))
        }
        Granularity::Month => local_midnight(tz, first_of_month(local.date())?),
    }
}

/// Every bucket start covering `[from, to]` (unix seconds), in ascending order.
pub(crate) fn enumerate(
    from: i64,
    to: i64,
    granularity: Granularity,
    tz: Tz,
) -> Result<Vec<DateTime<Tz>>, QueryError> {
    let invalid = || QueryError::processing(format!("invalid time range {from}..{to} for buckets"));
    let start = DateTime::from_timestamp(from, 0).ok_or_else(invalid)?.with_timezone(&tz);
    let mut current = truncate(start, granularity).ok_or_else(invalid)?;

    let mut buckets = Vec::new();
    while current.timestamp() <= to {
        buckets.push(current);
        let next = match granularity {
            Granularity::Hour => Some(current + Duration::hours(1)),
            Granularity::Date => local_midnight(tz, current.date_naive() + Duration::days(1)),
            Granularity::Week => local_midnight(tz, current.date_naive() + Duration::days(7)),
            Granularity::Month => {
                next_month(current.date_naive()).and_then(|d| local_midnight(tz, d))
            }
        };
        current = match next {
            Some(next) if next > current => next,
            _ => return Err(invalid()),
        };
    }
    Ok(buckets)
}

/// Parses a timestamp cell. RFC 3339 strings keep their offset; naive strings are
/// read as local time in `tz`; numbers are unix seconds.
pub(crate) fn parse_timestamp(value: &Value, tz: Tz) -> Option<DateTime<Tz>> {
    match value {
        Value::String(raw) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
                return Some(dt.with_timezone(&tz));
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
                .or_else(|| {
                    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
                .and_then(|naive| localize(tz, naive))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.with_timezone(&tz)),
        _ => None,
    }
}

pub(crate) fn render(dt: &DateTime<Tz>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}
