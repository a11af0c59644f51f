//! Marketing attribution query model and per-query aggregates.

use serde::{Deserialize, Serialize};

use crate::query::{QueryEventWithProperties, PROPERTY_VALUE_NONE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributionKey {
    Campaign,
    Source,
    AdGroup,
    Keyword,
}

impl AttributionKey {
    /// Session property carrying the key value.
    pub fn session_property(self) -> &'static str {
        match self {
            Self::Campaign => "$campaign",
            Self::Source => "$source",
            Self::AdGroup => "$adgroup",
            Self::Keyword => "$keyword",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Campaign => "Campaign",
            Self::Source => "Source",
            Self::AdGroup => "AdGroup",
            Self::Keyword => "Keyword",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributionMethodology {
    #[serde(rename = "First_Touch")]
    FirstTouch,
    #[serde(rename = "First_Touch_ND")]
    FirstTouchNonDirect,
    #[serde(rename = "Last_Touch")]
    LastTouch,
    #[serde(rename = "Last_Touch_ND")]
    LastTouchNonDirect,
    #[serde(rename = "Linear")]
    Linear,
    #[serde(rename = "U_Shaped")]
    UShaped,
    #[serde(rename = "Time_Decay")]
    TimeDecay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AttributionQueryType {
    #[default]
    ConversionBased,
    EngagementBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionKeyFilter {
    pub attribution_key: AttributionKey,
    #[serde(rename = "ty", default)]
    pub property_type: String,
    #[serde(rename = "pr", default)]
    pub property: String,
    #[serde(rename = "op")]
    pub operator: String,
    #[serde(rename = "va")]
    pub value: String,
    #[serde(rename = "lop", default)]
    pub logical_op: String,
}

impl AttributionKeyFilter {
    pub fn is_or(&self) -> bool {
        self.logical_op == "OR"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionQuery {
    #[serde(rename = "cm", default)]
    pub campaign_metrics: Vec<String>,
    #[serde(rename = "ce")]
    pub conversion_event: QueryEventWithProperties,
    #[serde(rename = "ce_c", default, skip_serializing_if = "Option::is_none")]
    pub conversion_event_compare: Option<QueryEventWithProperties>,
    #[serde(rename = "lfe", default)]
    pub linked_events: Vec<QueryEventWithProperties>,
    pub attribution_key: AttributionKey,
    #[serde(rename = "attribution_key_f", default)]
    pub key_filters: Vec<AttributionKeyFilter>,
    pub attribution_methodology: AttributionMethodology,
    #[serde(
        rename = "attribution_methodology_c",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub attribution_methodology_compare: Option<AttributionMethodology>,
    #[serde(rename = "lbw", default)]
    pub lookback_days: i64,
    pub from: i64,
    pub to: i64,
    #[serde(default)]
    pub query_type: AttributionQueryType,
}

impl AttributionQuery {
    /// True when a second run (compare event or compare methodology) is requested.
    pub fn has_compare(&self) -> bool {
        self.compare_run().is_some()
    }

    /// Event and methodology of the compare run. A compare methodology re-runs the
    /// conversion event and takes precedence over a compare event.
    pub fn compare_run(&self) -> Option<(&QueryEventWithProperties, AttributionMethodology)> {
        match (&self.attribution_methodology_compare, &self.conversion_event_compare) {
            (Some(methodology), _) => Some((&self.conversion_event, *methodology)),
            (None, Some(event)) => Some((event, self.attribution_methodology)),
            (None, None) => None,
        }
    }
}

/// First and last time a user was seen with one attribution key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTimestamp {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub within_query_period: bool,
}

impl RangeTimestamp {
    pub fn at(timestamp: i64, within_query_period: bool) -> Self {
        Self {
            min_timestamp: timestamp,
            max_timestamp: timestamp,
            within_query_period,
        }
    }

    /// Widens the range to cover `other`. Never shrinks.
    pub fn merge(&mut self, other: &RangeTimestamp) {
        self.min_timestamp = self.min_timestamp.min(other.min_timestamp);
        self.max_timestamp = self.max_timestamp.max(other.max_timestamp);
        self.within_query_period |= other.within_query_period;
    }
}

/// Aggregated numbers for one attribution key value.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AttributionData {
    pub name: String,
    pub impressions: i64,
    pub clicks: i64,
    pub spend: f64,
    pub website_visitors: i64,
    pub conversion_event_count: f64,
    pub cost_per_conversion: f64,
    pub conversion_event_compare_count: f64,
    pub compare_cost_per_conversion: f64,
    pub linked_events_count: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub coal_user_id: String,
    pub properties_id: String,
}

/// Key weight assigned to a converted user by a methodology.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionKeyWeight {
    pub key: String,
    pub weight: f64,
}

/// Ad performance numbers for one key id, as reported by the ad platform.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PerformanceRow {
    pub name: String,
    pub impressions: i64,
    pub clicks: i64,
    pub spend: f64,
}

/// Marketing report consumed read-only by the attribution engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarketingReport {
    pub currency: String,
    /// Performance keyed by attribution key id.
    pub performance: std::collections::HashMap<String, PerformanceRow>,
    /// Key value resolved for a click id (`gclid`).
    pub gclid_keys: std::collections::HashMap<String, String>,
}

impl MarketingReport {
    /// Key value matched by a click id, if the report knows it.
    pub fn key_for_gclid(&self, gclid: &str) -> Option<&str> {
        if gclid == PROPERTY_VALUE_NONE {
            return None;
        }
        self.gclid_keys
            .get(gclid)
            .map(String::as_str)
            .filter(|v| !v.is_empty() && *v != PROPERTY_VALUE_NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_attribution_query() {
        let q: AttributionQuery = serde_json::from_str(
            r#"{"ce":{"na":"signup"},"lfe":[{"na":"paid"}],"attribution_key":"Campaign",
                "attribution_key_f":[
                    {"attribution_key":"Campaign","op":"contains","va":"brand","lop":"OR"}
                ],
                "attribution_methodology":"Last_Touch_ND","attribution_methodology_c":"U_Shaped",
                "lbw":30,"from":10,"to":20,"query_type":"EngagementBased"}"#,
        )
        .expect("attribution query");
        assert_eq!(q.attribution_methodology, AttributionMethodology::LastTouchNonDirect);
        assert_eq!(q.attribution_methodology_compare, Some(AttributionMethodology::UShaped));
        assert_eq!(q.query_type, AttributionQueryType::EngagementBased);
        assert!(q.key_filters[0].is_or());
        assert!(q.has_compare());
    }

    #[test]
    fn query_type_defaults_to_conversion_based() {
        let q: AttributionQuery = serde_json::from_str(
            r#"{"ce":{"na":"signup"},"attribution_key":"Source",
                "attribution_methodology":"Linear","from":1,"to":2}"#,
        )
        .expect("attribution query");
        assert_eq!(q.query_type, AttributionQueryType::ConversionBased);
        assert!(!q.has_compare());
    }

    #[test]
    fn compare_methodology_wins_over_compare_event() {
        let both: AttributionQuery = serde_json::from_str(
            r#"{"ce":{"na":"signup"},"ce_c":{"na":"trial"},"attribution_key":"Campaign",
                "attribution_methodology":"First_Touch","attribution_methodology_c":"Linear",
                "from":1,"to":2}"#,
        )
        .expect("attribution query");
        let (event, methodology) = both.compare_run().expect("compare run");
        assert_eq!(event.name, "signup");
        assert_eq!(methodology, AttributionMethodology::Linear);

        let event_only: AttributionQuery = serde_json::from_str(
            r#"{"ce":{"na":"signup"},"ce_c":{"na":"trial"},"attribution_key":"Campaign",
                "attribution_methodology":"First_Touch","from":1,"to":2}"#,
        )
        .expect("attribution query");
        let (event, methodology) = event_only.compare_run().expect("compare run");
        assert_eq!(event.name, "trial");
        assert_eq!(methodology, AttributionMethodology::FirstTouch);
    }

    #[test]
    fn range_merge_never_shrinks() {
        let mut range = RangeTimestamp::at(100, false);
        range.merge(&RangeTimestamp::at(50, true));
        range.merge(&RangeTimestamp::at(75, false));
        assert_eq!(range.min_timestamp, 50);
        assert_eq!(range.max_timestamp, 100);
        assert!(range.within_query_period);
    }

    #[test]
    fn gclid_lookup_ignores_none_values() {
        let mut report = MarketingReport::default();
        report.gclid_keys.insert("g1".into(), "Brand".into());
        report.gclid_keys.insert("g2".into(), "$none".into());
        assert_eq!(report.key_for_gclid("g1"), Some("Brand"));
        assert_eq!(report.key_for_gclid("g2"), None);
        assert_eq!(report.key_for_gclid("$none"), None);
    }
}
