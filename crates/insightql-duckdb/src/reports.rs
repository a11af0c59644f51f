use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use insightql_core::attribution::{AttributionKey, MarketingReport, PerformanceRow};
use insightql_core::AdPerformanceSource;

use crate::DuckDbBackend;

/// `key_type` value stored for each attribution key.
pub fn key_type(key: AttributionKey) -> &'static str {
    match key {
        AttributionKey::Campaign => "campaign",
        AttributionKey::Source => "source",
        AttributionKey::AdGroup => "ad_group",
        AttributionKey::Keyword => "keyword",
    }
}

#[async_trait]
impl AdPerformanceSource for DuckDbBackend {
    async fn customer_account_id(&self, project_id: u64) -> anyhow::Result<Option<String>> {
        let project_id = i64::try_from(project_id)?;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT customer_account_id FROM project_settings \
             WHERE project_id = ?1 AND customer_account_id IS NOT NULL \
               AND customer_account_id != ''",
        )?;
        let mut ids = stmt.query_map(duckdb::params![project_id], |row| row.get::<_, String>(0))?;
        Ok(ids.next().transpose()?)
    }

    async fn marketing_report(
        &self,
        project_id: u64,
        customer_account_id: &str,
        key: AttributionKey,
        from: i64,
        to: i64,
    ) -> anyhow::Result<MarketingReport> {
        let project_id = i64::try_from(project_id)?;
        let key_type = key_type(key);
        let conn = self.conn.lock().await;

        let mut report = MarketingReport::default();
        let mut stmt = conn.prepare(
            "SELECT key_id, MAX(key_name), CAST(SUM(impressions) AS BIGINT), \
             CAST(SUM(clicks) AS BIGINT), CAST(SUM(spend) AS DOUBLE), MAX(currency) \
             FROM ad_performance_reports \
             WHERE project_id = ?1 AND customer_account_id = ?2 AND key_type = ?3 \
               AND timestamp BETWEEN ?4 AND ?5 \
             GROUP BY key_id",
        )?;
        let rows = stmt.query_map(
            duckdb::params![project_id, customer_account_id, key_type, from, to],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    PerformanceRow {
                        name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        impressions: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        clicks: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        spend: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                    },
                    row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                ))
            },
        )?;
        for row in rows {
            let (key_id, performance, currency) = row?;
            if report.currency.is_empty() {
                report.currency = currency;
            }
            report.performance.insert(key_id, performance);
        }

        let mut stmt = conn.prepare(
            "SELECT gclid, MAX(key_id) FROM click_reports \
             WHERE project_id = ?1 AND customer_account_id = ?2 AND key_type = ?3 \
               AND timestamp BETWEEN ?4 AND ?5 \
             GROUP BY gclid",
        )?;
        let clicks = stmt.query_map(
            duckdb::params![project_id, customer_account_id, key_type, from, to],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        report.gclid_keys = clicks.collect::<Result<HashMap<_, _>, _>>()?;

        debug!(
            project_id,
            key_type,
            keys = report.performance.len(),
            gclids = report.gclid_keys.len(),
            "marketing report loaded"
        );
        Ok(report)
    }
}
