//! Aggregation of attributed credit into per-key report rows.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use insightql_core::attribution::{AttributionData, AttributionQuery, MarketingReport};
use insightql_core::query::PROPERTY_VALUE_NONE;
use insightql_core::QueryResult;

use super::sessions::SessionRanges;

pub(crate) const HEADER_IMPRESSIONS: &str = "Impressions";
pub(crate) const HEADER_CLICKS: &str = "Clicks";
pub(crate) const HEADER_SPEND: &str = "Spend";
pub(crate) const HEADER_WEBSITE_VISITORS: &str = "Website Visitors";
pub(crate) const HEADER_COST_PER_CONVERSION: &str = "Cost Per Conversion";
pub(crate) const HEADER_COMPARE_COST_PER_CONVERSION: &str = "Compare - Cost Per Conversion";

/// Summed key weights from one or more methodology runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct Credit {
    pub conversions: HashMap<String, f64>,
    pub compare: HashMap<String, f64>,
    /// Per linked event, in query order.
    pub linked: Vec<HashMap<String, f64>>,
}

/// Distinct coalesced users per key with at least one session in the query period.
pub(crate) fn website_visitors(ranges: &SessionRanges) -> HashMap<String, i64> {
    let mut visitors: HashMap<String, i64> = HashMap::new();
    for keys in ranges.values() {
        for (key, range) in keys {
            if range.within_query_period {
                *visitors.entry(key.clone()).or_default() += 1;
            }
        }
    }
    visitors
}

fn cost_per(spend: f64, conversions: f64) -> f64 {
    if conversions > 0.0 {
        spend / conversions
    } else {
        0.0
    }
}

/// Per-key aggregates: credit, visitors and ad performance merged.
pub(crate) fn build_data(
    credit: &Credit,
    visitors: &HashMap<String, i64>,
    report: &MarketingReport,
) -> HashMap<String, AttributionData> {
    let mut keys: BTreeSet<&String> = BTreeSet::new();
    keys.extend(credit.conversions.keys());
    keys.extend(credit.compare.keys());
    keys.extend(credit.linked.iter().flat_map(HashMap::keys));
    keys.extend(visitors.keys());
    keys.extend(report.performance.keys());

    keys.into_iter()
        .map(|key| {
            let mut data = AttributionData {
                name: key.clone(),
                website_visitors: visitors.get(key).copied().unwrap_or(0),
                conversion_event_count: credit.conversions.get(key).copied().unwrap_or(0.0),
                conversion_event_compare_count: credit.compare.get(key).copied().unwrap_or(0.0),
                linked_events_count: credit
                    .linked
                    .iter()
                    .map(|counts| counts.get(key).copied().unwrap_or(0.0))
                    .collect(),
                ..AttributionData::default()
            };
            if let Some(performance) = report.performance.get(key) {
                if !performance.name.is_empty() {
                    data.name = performance.name.clone();
                }
                data.impressions = performance.impressions;
                data.clicks = performance.clicks;
                data.spend = performance.spend;
            }
            data.cost_per_conversion = cost_per(data.spend, data.conversion_event_count);
            data.compare_cost_per_conversion =
                cost_per(data.spend, data.conversion_event_compare_count);
            (key.clone(), data)
        })
        .collect()
}

fn has_activity(data: &AttributionData) -> bool {
    data.conversion_event_count > 0.0
        || data.conversion_event_compare_count > 0.0
        || data.website_visitors > 0
        || data.impressions > 0
        || data.clicks > 0
        || data.spend > 0.0
}

fn fold_into(target: &mut AttributionData, data: &AttributionData) {
    target.impressions += data.impressions;
    target.clicks += data.clicks;
    target.spend += data.spend;
    target.website_visitors += data.website_visitors;
    target.conversion_event_count += data.conversion_event_count;
    target.conversion_event_compare_count += data.conversion_event_compare_count;
    for (total, count) in target.linked_events_count.iter_mut().zip(&data.linked_events_count) {
        *total += count;
    }
}

pub(crate) fn headers(query: &AttributionQuery) -> Vec<String> {
    let mut headers = vec![
        query.attribution_key.as_str().to_string(),
        HEADER_IMPRESSIONS.to_string(),
        HEADER_CLICKS.to_string(),
        HEADER_SPEND.to_string(),
        HEADER_WEBSITE_VISITORS.to_string(),
        format!("{} - Users", query.conversion_event.name),
        HEADER_COST_PER_CONVERSION.to_string(),
    ];
    if let Some((compare, _)) = query.compare_run() {
        headers.push(format!("{} - Users", compare.name));
        headers.push(HEADER_COMPARE_COST_PER_CONVERSION.to_string());
    }
    headers.extend(query.linked_events.iter().map(|e| format!("{} - Users", e.name)));
    headers
}

fn row(name: &str, data: &AttributionData, compare: bool) -> Vec<Value> {
    let mut row = vec![
        Value::from(name),
        Value::from(data.impressions),
        Value::from(data.clicks),
        Value::from(data.spend),
        Value::from(data.website_visitors),
        Value::from(data.conversion_event_count),
        Value::from(data.cost_per_conversion),
    ];
    if compare {
        row.push(Value::from(data.conversion_event_compare_count));
        row.push(Value::from(data.compare_cost_per_conversion));
    }
    row.extend(data.linked_events_count.iter().map(|c| Value::from(*c)));
    row
}

/// Rows by conversions descending, then key name. `$none` and keys without any
/// activity fold into one trailing `$none` row.
pub(crate) fn build_result(
    query: &AttributionQuery,
    data: &HashMap<String, AttributionData>,
    currency: &str,
) -> QueryResult {
    let compare = query.has_compare();
    let mut none = AttributionData {
        name: PROPERTY_VALUE_NONE.to_string(),
        linked_events_count: vec![0.0; query.linked_events.len()],
        ..AttributionData::default()
    };

    let mut kept: Vec<(&String, &AttributionData)> = Vec::new();
    for (key, entry) in data {
        if key == PROPERTY_VALUE_NONE || !has_activity(entry) {
            fold_into(&mut none, entry);
        } else {
            kept.push((key, entry));
        }
    }
    kept.sort_by(|a, b| {
        b.1.conversion_event_count
            .total_cmp(&a.1.conversion_event_count)
            .then_with(|| a.0.cmp(b.0))
    });
    none.cost_per_conversion = cost_per(none.spend, none.conversion_event_count);
    none.compare_cost_per_conversion = cost_per(none.spend, none.conversion_event_compare_count);

    let mut rows: Vec<Vec<Value>> = kept.iter().map(|(_, d)| row(&d.name, d, compare)).collect();
    rows.push(row(PROPERTY_VALUE_NONE, &none, compare));

    let mut result = QueryResult::new(headers(query), rows);
    if !currency.is_empty() {
        result.meta.currency = Some(currency.to_string());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use insightql_core::attribution::{PerformanceRow, RangeTimestamp};

    fn query(json: &str) -> AttributionQuery {
        serde_json::from_str(json).expect("query")
    }

    #[test]
    fn visitors_count_in_period_ranges_only() {
        let mut ranges = SessionRanges::new();
        ranges.entry("u1".into()).or_default().insert("Google".into(), RangeTimestamp::at(1, true));
        ranges.entry("u2".into()).or_default().insert("Google".into(), RangeTimestamp::at(1, true));
        ranges.entry("u3".into()).or_default().insert("Bing".into(), RangeTimestamp::at(1, false));
        let visitors = website_visitors(&ranges);
        assert_eq!(visitors.get("Google"), Some(&2));
        assert_eq!(visitors.get("Bing"), None);
    }

    #[test]
    fn rows_sort_and_fold_none() {
        let q = query(
            r#"{"ce":{"na":"signup"},"lfe":[{"na":"paid"}],"attribution_key":"Campaign",
                "attribution_methodology":"Linear","from":1,"to":2}"#,
        );
        let credit = Credit {
            conversions: [
                ("b".to_string(), 2.0),
                ("a".to_string(), 2.0),
                ("$none".to_string(), 1.0),
            ]
            .into_iter()
            .collect(),
            compare: HashMap::new(),
            linked: vec![[("a".to_string(), 1.0), ("idle".to_string(), 1.0)].into_iter().collect()],
        };
        let mut report = MarketingReport {
            currency: "USD".to_string(),
            ..MarketingReport::default()
        };
        report.performance.insert(
            "a".to_string(),
            PerformanceRow {
                name: "Brand Campaign".to_string(),
                impressions: 100,
                clicks: 10,
                spend: 5.0,
            },
        );
        let data = build_data(&credit, &HashMap::new(), &report);
        let result = build_result(&q, &data, &report.currency);

        assert_eq!(
            result.headers,
            vec![
                "Campaign",
                "Impressions",
                "Clicks",
                "Spend",
                "Website Visitors",
                "signup - Users",
                "Cost Per Conversion",
                "paid - Users",
            ]
        );
        let names: Vec<&Value> = result.rows.iter().map(|r| &r[0]).collect();
        assert_eq!(names, vec!["Brand Campaign", "b", "$none"]);
        assert_eq!(result.rows[0][6], Value::from(2.5));
        // `idle` only has linked credit, so it folds into `$none`.
        assert_eq!(result.rows[2][5], Value::from(1.0));
        assert_eq!(result.rows[2][7], Value::from(1.0));
        assert_eq!(result.meta.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn compare_columns_follow_conversion() {
        let q = query(
            r#"{"ce":{"na":"signup"},"attribution_key":"Source",
                "attribution_methodology":"First_Touch","attribution_methodology_c":"Last_Touch",
                "from":1,"to":2}"#,
        );
        let h = headers(&q);
        assert_eq!(&h[7..], &["signup - Users", "Compare - Cost Per Conversion"]);
    }
}
