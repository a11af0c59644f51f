use std::sync::Arc;

use serde_json::json;

use insightql_core::attribution::AttributionKey;
use insightql_core::{AdPerformanceSource, SqlExecutor, SqlStatement, SqlValue};
use insightql_duckdb::DuckDbBackend;

async fn seeded() -> Arc<DuckDbBackend> {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    db.execute_batch(
        "INSERT INTO event_names (id, project_id, name)
             VALUES (1, 7, 'signup'), (2, 7, '$session'), (3, 8, 'signup');
         INSERT INTO project_settings VALUES (7, '123-456'), (8, NULL);
         INSERT INTO ad_performance_reports
             (project_id, customer_account_id, key_type, key_id, key_name, timestamp,
              impressions, clicks, spend, currency)
         VALUES
             (7, '123-456', 'campaign', 'c1', 'Brand', 1700000000, 100, 10, 2.5, 'USD'),
             (7, '123-456', 'campaign', 'c1', 'Brand', 1700086400, 50, 5, 1.5, 'USD'),
             (7, '123-456', 'campaign', 'c2', 'Generic', 1600000000, 999, 99, 9.0, 'USD'),
             (7, '123-456', 'keyword', 'k1', 'shoes', 1700000000, 10, 1, 0.5, 'USD');
         INSERT INTO click_reports VALUES (7, '123-456', 'gclid-1', 'campaign', 'c1', 1700000000);",
    )
    .await
    .expect("seed");
    db
}

#[tokio::test]
async fn test_execute_binds_params_and_reads_headers() {
    let db = seeded().await;
    let result = db
        .execute(&SqlStatement::new(
            "SELECT id, name FROM event_names WHERE project_id=? AND name IN (?, ?) ORDER BY id",
            vec![SqlValue::from(7u64), SqlValue::from("signup"), SqlValue::from("$session")],
        ))
        .await
        .expect("execute");
    assert_eq!(result.headers, vec!["id", "name"]);
    assert_eq!(
        result.rows,
        vec![vec![json!(1), json!("signup")], vec![json!(2), json!("$session")]]
    );
}

#[tokio::test]
async fn test_execute_converts_cell_types() {
    let db = seeded().await;
    let result = db
        .execute(&SqlStatement::new(
            "SELECT CAST(? AS HUGEINT) AS total, CAST(? AS DOUBLE) AS ratio, NULL AS missing, \
             TIMESTAMP '2023-11-15 10:00:00' AS datetime, DATE '2023-11-15' AS day, true AS flag",
            vec![SqlValue::Int(42), SqlValue::Float(0.5)],
        ))
        .await
        .expect("execute");
    assert_eq!(result.headers, vec!["total", "ratio", "missing", "datetime", "day", "flag"]);
    assert_eq!(
        result.rows[0],
        vec![
            json!(42),
            json!(0.5),
            serde_json::Value::Null,
            json!("2023-11-15 10:00:00"),
            json!("2023-11-15"),
            json!(true),
        ]
    );
}

#[tokio::test]
async fn test_execute_reports_sql_errors() {
    let db = seeded().await;
    let err = db
        .execute(&SqlStatement::new(
            "SELECT * FROM no_such_table WHERE id=?",
            vec![SqlValue::Int(1)],
        ))
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_customer_account_lookup() {
    let db = seeded().await;
    assert_eq!(db.customer_account_id(7).await.expect("lookup").as_deref(), Some("123-456"));
    assert_eq!(db.customer_account_id(8).await.expect("lookup"), None);
    assert_eq!(db.customer_account_id(9).await.expect("lookup"), None);
}

#[tokio::test]
async fn test_marketing_report_aggregates_range() {
    let db = seeded().await;
    let report = db
        .marketing_report(7, "123-456", AttributionKey::Campaign, 1_699_900_000, 1_700_100_000)
        .await
        .expect("report");

    assert_eq!(report.currency, "USD");
    assert_eq!(report.performance.len(), 1);
    let brand = &report.performance["c1"];
    assert_eq!(brand.name, "Brand");
    assert_eq!(brand.impressions, 150);
    assert_eq!(brand.clicks, 15);
    assert!((brand.spend - 4.0).abs() < 1e-9);
    assert_eq!(report.key_for_gclid("gclid-1"), Some("c1"));

    let keywords = db
        .marketing_report(7, "123-456", AttributionKey::Keyword, 1_699_900_000, 1_700_100_000)
        .await
        .expect("report");
    assert_eq!(keywords.performance["k1"].name, "shoes");
    assert!(keywords.gclid_keys.is_empty());
}
