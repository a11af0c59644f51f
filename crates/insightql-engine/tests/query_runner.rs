use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use insightql_core::{EngineConfig, Query, QueryResult, SqlExecutor, SqlStatement};
use insightql_engine::prepare::{
    ERR_INVALID_EVENTS_CONDITION, ERR_INVALID_QUERY_TYPE, ERR_INVALID_TIME_RANGE,
};
use insightql_engine::{decode_query, QueryRunner};

// 2023-11-14T00:00:00Z
const DAY_ONE: i64 = 1_699_920_000;
const DAY: i64 = 86_400;

/// Returns the same rows for every statement and remembers what it was sent.
struct Canned {
    result: QueryResult,
    seen: Mutex<Vec<SqlStatement>>,
}

impl Canned {
    fn new(headers: &[&str], rows: Vec<Vec<Value>>) -> Arc<Self> {
        Arc::new(Self {
            result: QueryResult::new(headers.iter().map(|h| h.to_string()).collect(), rows),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl SqlExecutor for Canned {
    async fn execute(&self, statement: &SqlStatement) -> anyhow::Result<QueryResult> {
        self.seen.lock().expect("lock").push(statement.clone());
        Ok(self.result.clone())
    }
}

/// Tracks how many statements run at once.
#[derive(Default)]
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait::async_trait]
impl SqlExecutor for Gauge {
    async fn execute(&self, _statement: &SqlStatement) -> anyhow::Result<QueryResult> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(QueryResult::new(vec!["count".into()], vec![vec![json!(3)]]))
    }
}

fn query(json: &str) -> Query {
    serde_json::from_str(json).expect("query")
}

#[tokio::test]
async fn test_funnel_conversions_follow_step_counts() {
    let executor = Canned::new(
        &["step_0", "step_1", "step_2"],
        vec![vec![json!(10), json!(4), json!(2)]],
    );
    let runner = QueryRunner::new(executor.clone(), EngineConfig::default());
    let q = query(&format!(
        r#"{{"ty":"unique_users","ec":"any_given_event",
            "ewp":[{{"na":"view"}},{{"na":"cart"}},{{"na":"buy"}}],"fr":{DAY_ONE},"to":{}}}"#,
        DAY_ONE + DAY
    ));

    let result = runner.run_funnel(1, &q).await.expect("funnel");
    assert_eq!(
        result.headers,
        vec![
            "step_0",
            "step_1",
            "conversion_step_0_step_1",
            "step_2",
            "conversion_step_1_step_2",
            "conversion_overall",
        ]
    );
    assert_eq!(
        result.rows[0],
        vec![json!(10), json!(4), json!("40.0"), json!(2), json!("50.0"), json!("20.0")]
    );
    let seen = executor.seen.lock().expect("lock");
    assert_eq!(seen.len(), 1);
    assert!(seen[0].sql.contains("step_2"));
}

#[tokio::test]
async fn test_funnel_rejects_event_occurrence() {
    let runner = QueryRunner::new(Canned::new(&["step_0"], vec![]), EngineConfig::default());
    let q = query(&format!(
        r#"{{"ty":"events_occurrence","ec":"any_given_event","ewp":[{{"na":"view"}}],
            "fr":{DAY_ONE},"to":{}}}"#,
        DAY_ONE + DAY
    ));
    let err = runner.run_funnel(1, &q).await.expect_err("invalid");
    assert_eq!(err.user_message(), ERR_INVALID_QUERY_TYPE);
}

#[tokio::test]
async fn test_daily_series_fills_every_bucket() {
    let executor = Canned::new(
        &["datetime", "count"],
        vec![vec![json!("2023-11-15T00:00:00+00:00"), json!(7)]],
    );
    let runner = QueryRunner::new(executor, EngineConfig::default());
    let q = query(&format!(
        r#"{{"ty":"events_occurrence","ec":"any_given_event","ewp":[{{"na":"view"}}],"gbt":"date",
            "tz":"UTC","fr":{DAY_ONE},"to":{}}}"#,
        DAY_ONE + 3 * DAY - 1
    ));

    let result = runner.run_insights(1, &q).await.expect("insights");
    let ts = result.header_index("datetime").expect("datetime column");
    let count = result.header_index("count").expect("count column");
    let buckets: Vec<&Value> = result.rows.iter().map(|r| &r[ts]).collect();
    assert_eq!(
        buckets,
        vec!["2023-11-14T00:00:00Z", "2023-11-15T00:00:00Z", "2023-11-16T00:00:00Z"]
    );
    let counts: Vec<&Value> = result.rows.iter().map(|r| &r[count]).collect();
    assert_eq!(counts, vec![&json!(0), &json!(7), &json!(0)]);
    assert!(result.meta.query.is_some());
}

#[tokio::test]
async fn test_query_group_isolates_failures() {
    let gauge = Arc::new(Gauge::default());
    let config = EngineConfig {
        max_concurrency: 2,
        ..EngineConfig::default()
    };
    let runner = QueryRunner::new(gauge.clone(), config);

    let valid = format!(
        r#"{{"ty":"unique_users","ec":"any_given_event","ewp":[{{"na":"view"}}],
            "fr":{DAY_ONE},"to":{}}}"#,
        DAY_ONE + DAY
    );
    let invalid = format!(
        r#"{{"ty":"unique_users","ec":"any_given_event","ewp":[{{"na":"view"}}],
            "fr":{},"to":{DAY_ONE}}}"#,
        DAY_ONE + DAY
    );
    let queries: Vec<Query> = [&valid, &valid, &invalid, &valid, &valid]
        .iter()
        .map(|raw| query(raw))
        .collect();

    let group = runner.run_query_group(1, &queries).await;
    assert_eq!(group.results.len(), 5);
    for (i, result) in group.results.iter().enumerate() {
        if i == 2 {
            assert_eq!(result.headers, vec!["error"]);
            let message = result.rows[0][0].as_str().expect("message");
            assert!(message.ends_with(ERR_INVALID_TIME_RANGE), "{message}");
        } else {
            assert_eq!(result.rows[0][0], json!(3), "slot {i}");
        }
    }
    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_decode_query_rejects_unknown_enums() {
    let err = decode_query(r#"{"ty":"sessions","ec":"any_given_event","fr":1,"to":2}"#)
        .expect_err("type");
    assert_eq!(err.user_message(), ERR_INVALID_QUERY_TYPE);

    let err = decode_query(r#"{"ty":"unique_users","ec":"some_events","fr":1,"to":2}"#)
        .expect_err("condition");
    assert_eq!(err.user_message(), ERR_INVALID_EVENTS_CONDITION);

    let q = decode_query(
        r#"{"ty":"unique_users","ec":"each_given_event","ewp":[{"na":"a"}],"fr":1,"to":2}"#,
    )
    .expect("query");
    assert_eq!(q.events[0].name, "a");
}
