use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use insightql_core::attribution::{
    AttributionKey, AttributionQuery, MarketingReport, PerformanceRow,
};
use insightql_core::{
    AdPerformanceSource, EngineConfig, QueryError, QueryResult, SqlExecutor, SqlStatement, SqlValue,
};
use insightql_engine::AttributionEngine;

const FROM: i64 = 1_700_000_000;
const TO: i64 = FROM + 10 * 86_400;

/// Answers the attribution reads from in-memory tables.
#[derive(Default)]
struct MockWarehouse {
    events: HashMap<String, i64>,
    /// (user_id, key, gclid, timestamp)
    sessions: Vec<(String, String, String, i64)>,
    /// raw id -> customer id
    customers: HashMap<String, String>,
    /// event id -> (user_id, timestamp)
    hits: HashMap<i64, Vec<(String, i64)>>,
}

impl MockWarehouse {
    fn new(events: &[&str]) -> Self {
        Self {
            events: events
                .iter()
                .enumerate()
                .map(|(i, name)| (name.to_string(), i as i64 + 1))
                .collect(),
            ..Self::default()
        }
    }

    fn session(mut self, user: &str, key: &str, at: i64) -> Self {
        self.sessions.push((user.into(), key.into(), "$none".into(), at));
        self
    }

    fn hit(mut self, event: &str, user: &str, at: i64) -> Self {
        let id = self.events[event];
        self.hits.entry(id).or_default().push((user.into(), at));
        self
    }
}

fn text(value: &SqlValue) -> String {
    match value {
        SqlValue::Text(s) => s.clone(),
        SqlValue::Int(i) => i.to_string(),
        SqlValue::Float(f) => f.to_string(),
    }
}

fn headers(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[async_trait::async_trait]
impl SqlExecutor for MockWarehouse {
    async fn execute(&self, statement: &SqlStatement) -> anyhow::Result<QueryResult> {
        let sql = statement.sql.as_str();
        let params = &statement.params;
        if sql.contains("FROM event_names") {
            let rows = params[1..]
                .iter()
                .filter_map(|p| {
                    let name = text(p);
                    self.events.get(&name).map(|id| vec![json!(id), json!(name)])
                })
                .collect();
            return Ok(QueryResult::new(headers(&["id", "name"]), rows));
        }
        if sql.contains("FROM events AS sessions") {
            let rows = self
                .sessions
                .iter()
                .map(|(user, key, gclid, at)| {
                    vec![json!(user), json!(key), json!(gclid), json!(at)]
                })
                .collect();
            return Ok(QueryResult::new(
                headers(&["user_id", "attribution_key", "gclid", "timestamp"]),
                rows,
            ));
        }
        if sql.contains("FROM users WHERE id IN") {
            let rows = params
                .iter()
                .map(|p| {
                    let id = text(p);
                    let coal = self.customers.get(&id).cloned().unwrap_or_else(|| id.clone());
                    vec![json!(id), json!(coal), Value::Null]
                })
                .collect();
            return Ok(QueryResult::new(headers(&["id", "coal_user_id", "properties_id"]), rows));
        }
        let event_id = match &params[3] {
            SqlValue::Int(id) => *id,
            other => anyhow::bail!("unexpected event id {other:?}"),
        };
        let restrict: Option<Vec<String>> = sql
            .contains("user_id IN")
            .then(|| params[4..].iter().map(text).collect());
        let rows = self
            .hits
            .get(&event_id)
            .into_iter()
            .flatten()
            .filter(|(user, _)| restrict.as_ref().map_or(true, |r| r.contains(user)))
            .map(|(user, at)| vec![json!(user), json!(at)])
            .collect();
        Ok(QueryResult::new(headers(&["user_id", "timestamp"]), rows))
    }
}

struct MockReports {
    account: Option<String>,
    report: MarketingReport,
}

#[async_trait::async_trait]
impl AdPerformanceSource for MockReports {
    async fn customer_account_id(&self, _project_id: u64) -> anyhow::Result<Option<String>> {
        Ok(self.account.clone())
    }

    async fn marketing_report(
        &self,
        _project_id: u64,
        _customer_account_id: &str,
        _key: AttributionKey,
        _from: i64,
        _to: i64,
    ) -> anyhow::Result<MarketingReport> {
        Ok(self.report.clone())
    }
}

fn reports() -> Arc<MockReports> {
    Arc::new(MockReports {
        account: Some("123-456".to_string()),
        report: MarketingReport {
            currency: "USD".to_string(),
            ..MarketingReport::default()
        },
    })
}

fn query(methodology: &str, extra: &str) -> AttributionQuery {
    serde_json::from_str(&format!(
        r#"{{"ce":{{"na":"signup"}},"attribution_key":"Campaign",
            "attribution_methodology":"{methodology}","lbw":30,"from":{FROM},"to":{TO}{extra}}}"#
    ))
    .expect("query")
}

fn row<'a>(result: &'a QueryResult, name: &str) -> &'a Vec<Value> {
    result
        .rows
        .iter()
        .find(|r| r[0] == json!(name))
        .unwrap_or_else(|| panic!("no row for {name}"))
}

#[tokio::test]
async fn test_last_touch_non_direct_credits_campaign() {
    let warehouse = MockWarehouse::new(&["signup", "$session"])
        .session("u1", "$none", FROM + 100)
        .session("u1", "Google", FROM + 200)
        .hit("signup", "u1", FROM + 300);
    let engine = AttributionEngine::new(Arc::new(warehouse), reports(), EngineConfig::default());

    let result = engine.run(1, &query("Last_Touch_ND", "")).await.expect("attribution");
    assert_eq!(result.rows[0][0], json!("Google"));
    assert_eq!(result.rows[0][5], json!(1.0));
    assert_eq!(result.rows.last().expect("none row")[0], json!("$none"));
    assert_eq!(result.meta.currency.as_deref(), Some("USD"));
}

#[tokio::test]
async fn test_linear_splits_credit_between_keys() {
    let warehouse = MockWarehouse::new(&["signup", "$session"])
        .session("u1", "Facebook", FROM + 100)
        .session("u1", "Google", FROM + 200)
        .session("u2", "Facebook", FROM + 150)
        .session("u2", "Google", FROM + 250)
        .hit("signup", "u1", FROM + 300)
        .hit("signup", "u2", FROM + 400);
    let engine = AttributionEngine::new(Arc::new(warehouse), reports(), EngineConfig::default());

    let result = engine.run(1, &query("Linear", "")).await.expect("attribution");
    assert_eq!(row(&result, "Facebook")[5], json!(1.0));
    assert_eq!(row(&result, "Google")[5], json!(1.0));
    assert_eq!(row(&result, "Facebook")[4], json!(2));
}

#[tokio::test]
async fn test_coalesced_users_convert_once() {
    let mut warehouse = MockWarehouse::new(&["signup", "$session"])
        .session("anon", "Facebook", FROM + 100)
        .hit("signup", "known", FROM + 200)
        .hit("signup", "known", FROM + 500);
    warehouse.customers.insert("anon".into(), "customer-1".into());
    warehouse.customers.insert("known".into(), "customer-1".into());
    let engine = AttributionEngine::new(Arc::new(warehouse), reports(), EngineConfig::default());

    let result = engine.run(1, &query("First_Touch", "")).await.expect("attribution");
    assert_eq!(row(&result, "Facebook")[5], json!(1.0));
}

#[tokio::test]
async fn test_linked_events_and_compare_columns() {
    let warehouse = MockWarehouse::new(&["signup", "paid", "$session"])
        .session("u1", "Google", FROM + 100)
        .session("u2", "Bing", FROM + 100)
        .hit("signup", "u1", FROM + 200)
        .hit("paid", "u1", FROM + 300)
        .hit("paid", "u2", FROM + 300);
    let engine = AttributionEngine::new(Arc::new(warehouse), reports(), EngineConfig::default());

    let q = query(
        "First_Touch",
        r#","attribution_methodology_c":"Last_Touch","lfe":[{"na":"paid"}]"#,
    );
    let result = engine.run(1, &q).await.expect("attribution");
    assert_eq!(result.headers.len(), 10);
    assert_eq!(result.headers[9], "paid - Users");
    let google = row(&result, "Google");
    assert_eq!(google[7], json!(1.0));
    assert_eq!(google[9], json!(1.0));
    // u2 never converted, so its paid event is not counted.
    assert_eq!(row(&result, "Bing")[9], json!(0.0));
}

#[tokio::test]
async fn test_linked_events_credit_at_goal_conversion() {
    let warehouse = MockWarehouse::new(&["signup", "paid", "$session"])
        .session("u1", "Google", FROM + 50)
        .session("u1", "Bing", FROM + 150)
        .hit("signup", "u1", FROM + 100)
        .hit("paid", "u1", FROM + 200);
    let engine = AttributionEngine::new(Arc::new(warehouse), reports(), EngineConfig::default());

    let q = query("Last_Touch", r#","lfe":[{"na":"paid"}]"#);
    let result = engine.run(1, &q).await.expect("attribution");
    assert_eq!(result.headers.len(), 8);
    assert_eq!(result.headers[7], "paid - Users");
    let google = row(&result, "Google");
    assert_eq!(google[5], json!(1.0));
    assert_eq!(google[7], json!(1.0));
    // The Bing touch comes after signup, so it earns nothing for paid either.
    let bing = row(&result, "Bing");
    assert_eq!(bing[4], json!(1));
    assert_eq!(bing[7], json!(0.0));
}

#[tokio::test]
async fn test_compare_event_runs_under_main_methodology() {
    let warehouse = MockWarehouse::new(&["signup", "trial", "$session"])
        .session("u1", "Google", FROM + 100)
        .session("u2", "Facebook", FROM + 100)
        .session("u2", "Bing", FROM + 150)
        .hit("signup", "u1", FROM + 200)
        .hit("trial", "u2", FROM + 200);
    let engine = AttributionEngine::new(Arc::new(warehouse), reports(), EngineConfig::default());

    let q = query("First_Touch", r#","ce_c":{"na":"trial"}"#);
    let result = engine.run(1, &q).await.expect("attribution");
    assert_eq!(result.headers.len(), 9);
    assert_eq!(result.headers[7], "trial - Users");
    let google = row(&result, "Google");
    assert_eq!(google[5], json!(1.0));
    assert_eq!(google[7], json!(0.0));
    assert_eq!(row(&result, "Facebook")[7], json!(1.0));
    assert_eq!(row(&result, "Bing")[7], json!(0.0));
}

#[tokio::test]
async fn test_compare_methodology_overrides_compare_event() {
    // No "trial" event exists: the compare event must not even be looked up.
    let warehouse = MockWarehouse::new(&["signup", "$session"])
        .session("u1", "Facebook", FROM + 100)
        .session("u1", "Google", FROM + 200)
        .hit("signup", "u1", FROM + 300);
    let engine = AttributionEngine::new(Arc::new(warehouse), reports(), EngineConfig::default());

    let q = query(
        "First_Touch",
        r#","ce_c":{"na":"trial"},"attribution_methodology_c":"Last_Touch""#,
    );
    let result = engine.run(1, &q).await.expect("attribution");
    assert_eq!(result.headers[7], "signup - Users");
    let facebook = row(&result, "Facebook");
    assert_eq!(facebook[5], json!(1.0));
    assert_eq!(facebook[7], json!(0.0));
    let google = row(&result, "Google");
    assert_eq!(google[5], json!(0.0));
    assert_eq!(google[7], json!(1.0));
}

#[tokio::test]
async fn test_key_filters_see_value_before_gclid_override() {
    let mut warehouse = MockWarehouse::new(&["signup", "$session"])
        .hit("signup", "u1", FROM + 300)
        .hit("signup", "u2", FROM + 300);
    // u1 is tracked as "generic" but clicked a brand ad; u2 the reverse.
    warehouse
        .sessions
        .push(("u1".into(), "generic".into(), "gclid-1".into(), FROM + 100));
    warehouse
        .sessions
        .push(("u2".into(), "brand_cmp".into(), "gclid-2".into(), FROM + 100));
    let mut report = MarketingReport {
        currency: "USD".to_string(),
        ..MarketingReport::default()
    };
    report.gclid_keys.insert("gclid-1".into(), "brand_cmp".into());
    report.gclid_keys.insert("gclid-2".into(), "generic".into());
    let engine = AttributionEngine::new(
        Arc::new(warehouse),
        Arc::new(MockReports {
            account: Some("123-456".into()),
            report,
        }),
        EngineConfig::default(),
    );

    let q = query(
        "First_Touch",
        r#","attribution_key_f":[{"attribution_key":"Campaign","op":"equals","va":"generic"}]"#,
    );
    let result = engine.run(1, &q).await.expect("attribution");
    let brand = row(&result, "brand_cmp");
    assert_eq!(brand[4], json!(1));
    assert_eq!(brand[5], json!(1.0));
    assert!(result.rows.iter().all(|r| r[0] != json!("generic")));
}

#[tokio::test]
async fn test_performance_and_gclid_enrich_rows() {
    let mut warehouse = MockWarehouse::new(&["signup", "$session"]).hit("signup", "u1", FROM + 300);
    warehouse
        .sessions
        .push(("u1".into(), "$none".into(), "gclid-1".into(), FROM + 100));
    let mut report = MarketingReport {
        currency: "EUR".to_string(),
        ..MarketingReport::default()
    };
    report.gclid_keys.insert("gclid-1".into(), "cmp-9".into());
    report.performance.insert(
        "cmp-9".into(),
        PerformanceRow {
            name: "Brand".to_string(),
            impressions: 1000,
            clicks: 50,
            spend: 20.0,
        },
    );
    let engine = AttributionEngine::new(
        Arc::new(warehouse),
        Arc::new(MockReports {
            account: Some("1".into()),
            report,
        }),
        EngineConfig::default(),
    );

    let result = engine.run(1, &query("First_Touch", "")).await.expect("attribution");
    let brand = row(&result, "Brand");
    assert_eq!(brand[1], json!(1000));
    assert_eq!(brand[5], json!(1.0));
    assert_eq!(brand[6], json!(20.0));
}

#[tokio::test]
async fn test_missing_integration_is_reported() {
    let engine = AttributionEngine::new(
        Arc::new(MockWarehouse::new(&["signup", "$session"])),
        Arc::new(MockReports {
            account: None,
            report: MarketingReport::default(),
        }),
        EngineConfig::default(),
    );
    let err = engine.run(1, &query("Linear", "")).await.expect_err("no integration");
    assert!(matches!(err, QueryError::IntegrationNotFound));
}

#[tokio::test]
async fn test_unknown_event_is_invalid() {
    let engine = AttributionEngine::new(
        Arc::new(MockWarehouse::new(&["$session"])),
        reports(),
        EngineConfig::default(),
    );
    let err = engine.run(1, &query("Linear", "")).await.expect_err("unknown event");
    assert_eq!(err.user_message(), "Event not found: signup");
}
