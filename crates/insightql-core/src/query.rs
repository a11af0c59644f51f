//! Declarative analytics query model.
//!
//! These types are the JSON contract shared with front-end callers, so the
//! short serde field names (`ty`, `ec`, `ewp`, ...) must stay stable.

use serde::{Deserialize, Serialize};

pub const PROPERTY_VALUE_NONE: &str = "$none";
pub const SESSION_EVENT_NAME: &str = "$session";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const SECONDS_IN_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    #[default]
    Insights,
    Funnel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    EventsOccurrence,
    UniqueUsers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventsCondition {
    AnyGivenEvent,
    AllGivenEvent,
    EachGivenEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyEntity {
    User,
    Event,
}

impl PropertyEntity {
    /// JSONB column holding the properties for this entity.
    pub fn properties_column(self) -> &'static str {
        match self {
            Self::User => "user_properties.properties",
            Self::Event => "events.properties",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    #[default]
    Categorical,
    Numerical,
    Datetime,
}

/// Output granularity of a time-series query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Date,
    Week,
    Month,
}

impl Granularity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hour" => Some(Self::Hour),
            "date" => Some(Self::Date),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    /// Unit passed to `date_trunc`.
    pub fn trunc_unit(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Date => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

/// Raw `gbt` value. Older clients send a boolean instead of a granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupByTimestamp {
    Legacy(bool),
    Named(String),
}

/// Filter operator as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Equals,
    NotEqual,
    GreaterThan,
    LesserThan,
    GreaterThanOrEqual,
    LesserThanOrEqual,
    Contains,
    NotContains,
    Unknown(String),
}

impl From<String> for Operator {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "equals" => Self::Equals,
            "notEqual" => Self::NotEqual,
            "greaterThan" => Self::GreaterThan,
            "lesserThan" => Self::LesserThan,
            "greaterThanOrEqual" => Self::GreaterThanOrEqual,
            "lesserThanOrEqual" => Self::LesserThanOrEqual,
            "contains" => Self::Contains,
            "notContains" => Self::NotContains,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        match op {
            Operator::Equals => "equals".to_string(),
            Operator::NotEqual => "notEqual".to_string(),
            Operator::GreaterThan => "greaterThan".to_string(),
            Operator::LesserThan => "lesserThan".to_string(),
            Operator::GreaterThanOrEqual => "greaterThanOrEqual".to_string(),
            Operator::LesserThanOrEqual => "lesserThanOrEqual".to_string(),
            Operator::Contains => "contains".to_string(),
            Operator::NotContains => "notContains".to_string(),
            Operator::Unknown(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryProperty {
    #[serde(rename = "en")]
    pub entity: PropertyEntity,
    #[serde(rename = "ty", default)]
    pub property_type: PropertyType,
    #[serde(rename = "pr")]
    pub property: String,
    #[serde(rename = "op")]
    pub operator: Operator,
    #[serde(rename = "va")]
    pub value: String,
    #[serde(rename = "lop", default)]
    pub logical_op: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEventWithProperties {
    #[serde(rename = "na")]
    pub name: String,
    #[serde(rename = "pr", default)]
    pub properties: Vec<QueryProperty>,
}

impl QueryEventWithProperties {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn has_filter_on(&self, entity: PropertyEntity) -> bool {
        self.properties.iter().any(|p| p.entity == entity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryGroupByProperty {
    #[serde(rename = "en")]
    pub entity: PropertyEntity,
    #[serde(rename = "pr")]
    pub property: String,
    #[serde(rename = "in", default)]
    pub index: usize,
    #[serde(rename = "pty", default)]
    pub property_type: PropertyType,
    #[serde(rename = "ena", default)]
    pub event_name: String,
    #[serde(rename = "eni", default)]
    pub event_name_index: usize,
    #[serde(rename = "grn", default)]
    pub granularity: String,
}

impl QueryGroupByProperty {
    /// Synthetic SQL column carrying this breakdown.
    pub fn key(&self) -> String {
        format!("{GROUP_KEY_PREFIX}{}", self.index)
    }

    /// True when the group-by is bound to one specific event step.
    pub fn is_event_level(&self) -> bool {
        !self.event_name.is_empty() && self.event_name_index != 0
    }

    pub fn is_numerical(&self) -> bool {
        self.property_type == PropertyType::Numerical
    }
}

pub const GROUP_KEY_PREFIX: &str = "_group_key_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "cl", default)]
    pub class: QueryClass,
    #[serde(rename = "ty")]
    pub query_type: QueryType,
    #[serde(rename = "ec")]
    pub events_condition: EventsCondition,
    #[serde(rename = "ewp", default)]
    pub events: Vec<QueryEventWithProperties>,
    #[serde(rename = "gbp", default)]
    pub group_by: Vec<QueryGroupByProperty>,
    #[serde(rename = "gbt", default, skip_serializing_if = "Option::is_none")]
    pub group_by_timestamp: Option<GroupByTimestamp>,
    #[serde(rename = "tz", default)]
    pub timezone: String,
    #[serde(rename = "fr")]
    pub from: i64,
    #[serde(rename = "to")]
    pub to: i64,
    #[serde(rename = "sse", default)]
    pub session_start_event: i64,
    #[serde(rename = "see", default)]
    pub session_end_event: i64,
}

impl Query {
    /// Resolved output granularity.
    ///
    /// `Ok(None)` means no time series was requested. A legacy `true` picks
    /// hourly buckets for ranges up to a day and daily buckets otherwise.
    pub fn granularity(&self) -> Result<Option<Granularity>, String> {
        match &self.group_by_timestamp {
            None | Some(GroupByTimestamp::Legacy(false)) => Ok(None),
            Some(GroupByTimestamp::Legacy(true)) => {
                if self.to - self.from <= SECONDS_IN_DAY {
                    Ok(Some(Granularity::Hour))
                } else {
                    Ok(Some(Granularity::Date))
                }
            }
            Some(GroupByTimestamp::Named(raw)) if raw.is_empty() => Ok(None),
            Some(GroupByTimestamp::Named(raw)) => Granularity::parse(raw)
                .map(Some)
                .ok_or_else(|| format!("unsupported group by timestamp: {raw}")),
        }
    }

    /// Granularity when valid; invalid values are treated as absent.
    pub fn time_series(&self) -> Option<Granularity> {
        self.granularity().ok().flatten()
    }

    pub fn timezone_or_default(&self) -> &str {
        if self.timezone.is_empty() {
            DEFAULT_TIMEZONE
        } else {
            &self.timezone
        }
    }

    /// Pins every group-by's index to its position so aliases stay stable.
    pub fn assign_group_indexes(&mut self) {
        for (i, gbp) in self.group_by.iter_mut().enumerate() {
            gbp.index = i;
        }
    }

    pub fn has_group_entity(&self, entity: PropertyEntity) -> bool {
        self.group_by.iter().any(|g| g.entity == entity)
    }

    pub fn has_numerical_group_by(&self) -> bool {
        self.group_by.iter().any(QueryGroupByProperty::is_numerical)
    }
}
