//! Marketing attribution: credits conversions to the campaign, source, ad group
//! or keyword that brought each user in.

mod methods;
mod report;
mod sessions;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use insightql_core::attribution::{
    AttributionMethodology, AttributionQuery, AttributionQueryType, UserInfo,
};
use insightql_core::query::{QueryEventWithProperties, SECONDS_IN_DAY, SESSION_EVENT_NAME};
use insightql_core::{
    AdPerformanceSource, EngineConfig, QueryError, QueryResult, SqlExecutor, SqlValue,
};

use crate::prepare::ERR_INVALID_TIME_RANGE;
use methods::{attribute, Window};
use report::{build_data, build_result, website_visitors, Credit};
use sessions::{
    coal_id, coalesce_users, earliest_by_coalesced_user, event_hits, event_name_ids,
    merge_by_coalesced_user, session_ranges, SessionRanges, SessionScan,
};

/// Runs attribution queries. Reads are sequential; user lists go out in batches.
#[derive(Clone)]
pub struct AttributionEngine {
    executor: Arc<dyn SqlExecutor>,
    reports: Arc<dyn AdPerformanceSource>,
    config: EngineConfig,
}

/// Conversion time per coalesced user, plus the raw ids that converted.
struct Conversions {
    by_user: HashMap<String, i64>,
    raw_users: Vec<String>,
}

impl AttributionEngine {
    pub fn new(
        executor: Arc<dyn SqlExecutor>,
        reports: Arc<dyn AdPerformanceSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            reports,
            config,
        }
    }

    pub async fn run(
        &self,
        project_id: u64,
        query: &AttributionQuery,
    ) -> Result<QueryResult, QueryError> {
        let query = self.normalize(query)?;
        let lookback_secs = query.lookback_days * SECONDS_IN_DAY;
        let engagement = query.query_type == AttributionQueryType::EngagementBased;

        let account = self
            .reports
            .customer_account_id(project_id)
            .await?
            .ok_or(QueryError::IntegrationNotFound)?;
        let report = self
            .reports
            .marketing_report(project_id, &account, query.attribution_key, query.from, query.to)
            .await?;

        let ids = event_name_ids(self.executor.as_ref(), project_id, &event_names(&query)).await?;
        let event_id = |name: &str| {
            ids.get(name)
                .ok_or_else(|| QueryError::invalid(format!("Event not found: {name}")))
        };

        let read_to = if engagement { query.to + lookback_secs } else { query.to };
        let raw_sessions = session_ranges(
            self.executor.as_ref(),
            SessionScan {
                project_id,
                session_event_id: event_id(SESSION_EVENT_NAME)?,
                key: query.attribution_key,
                filters: &query.key_filters,
                from: query.from - lookback_secs,
                to: read_to,
                period: (query.from, query.to),
            },
            &report,
        )
        .await?;

        let mut users: HashMap<String, UserInfo> = HashMap::new();
        coalesce_users(
            self.executor.as_ref(),
            raw_sessions.keys(),
            self.config.user_batch_size,
            &mut users,
        )
        .await?;
        let sessions = merge_by_coalesced_user(&raw_sessions, &users);
        debug!(project_id, users = sessions.len(), "session ranges coalesced");

        let conversion_end = if engagement { query.to + lookback_secs } else { query.to };
        let conversion_window = (query.from, conversion_end);
        let period = engagement.then_some((query.from, query.to));

        let goal_id = event_id(&query.conversion_event.name)?;
        let goal = self
            .conversions(
                project_id,
                &query.conversion_event,
                goal_id,
                conversion_window,
                &mut users,
            )
            .await?;
        let mut credit = Credit {
            conversions: credit_users(
                &goal.by_user,
                &sessions,
                query.attribution_methodology,
                lookback_secs,
                period,
            ),
            ..Credit::default()
        };

        if let Some((compare_event, methodology)) = query.compare_run() {
            let compare_id = event_id(&compare_event.name)?;
            let compare = self
                .conversions(
                    project_id,
                    compare_event,
                    compare_id,
                    conversion_window,
                    &mut users,
                )
                .await?;
            credit.compare = credit_users(
                &compare.by_user,
                &sessions,
                methodology,
                lookback_secs,
                period,
            );
        }

        for linked in &query.linked_events {
            let hits = event_hits(
                self.executor.as_ref(),
                project_id,
                linked,
                event_id(&linked.name)?,
                conversion_window,
                Some((&goal.raw_users, self.config.user_batch_size)),
            )
            .await?;
            coalesce_users(
                self.executor.as_ref(),
                hits.iter().map(|(u, _)| u),
                self.config.user_batch_size,
                &mut users,
            )
            .await?;
            // Linked events are credited as of the user's goal conversion.
            let linked_users: HashMap<String, i64> = hits
                .iter()
                .filter_map(|(raw, _)| {
                    let coal = coal_id(&users, raw);
                    goal.by_user.get(coal).map(|t| (coal.to_string(), *t))
                })
                .collect();
            credit.linked.push(credit_users(
                &linked_users,
                &sessions,
                query.attribution_methodology,
                lookback_secs,
                period,
            ));
        }

        let visitors = website_visitors(&sessions);
        let data = build_data(&credit, &visitors, &report);
        info!(
            project_id,
            converted = goal.by_user.len(),
            keys = data.len(),
            "attribution computed"
        );
        Ok(build_result(&query, &data, &report.currency))
    }

    /// Caps the lookback and checks the range.
    fn normalize(&self, query: &AttributionQuery) -> Result<AttributionQuery, QueryError> {
        if query.from <= 0 || query.to <= 0 || query.from > query.to {
            return Err(QueryError::invalid(ERR_INVALID_TIME_RANGE));
        }
        if query.conversion_event.name.is_empty() {
            return Err(QueryError::invalid("Invalid conversion event"));
        }
        let mut query = query.clone();
        query.lookback_days = query.lookback_days.clamp(0, self.config.max_lookback_days);
        Ok(query)
    }

    async fn conversions(
        &self,
        project_id: u64,
        event: &QueryEventWithProperties,
        event_id: &SqlValue,
        window: (i64, i64),
        users: &mut HashMap<String, UserInfo>,
    ) -> Result<Conversions, QueryError> {
        let hits =
            event_hits(self.executor.as_ref(), project_id, event, event_id, window, None).await?;
        coalesce_users(
            self.executor.as_ref(),
            hits.iter().map(|(u, _)| u),
            self.config.user_batch_size,
            users,
        )
        .await?;
        let mut raw_users: Vec<String> = hits.iter().map(|(u, _)| u.clone()).collect();
        raw_users.sort();
        raw_users.dedup();
        Ok(Conversions {
            by_user: earliest_by_coalesced_user(&hits, users),
            raw_users,
        })
    }
}

/// Event names the run needs ids for.
fn event_names(query: &AttributionQuery) -> Vec<String> {
    let mut names = vec![query.conversion_event.name.clone()];
    if let Some((compare, _)) = query.compare_run() {
        names.push(compare.name.clone());
    }
    names.extend(query.linked_events.iter().map(|e| e.name.clone()));
    names.push(SESSION_EVENT_NAME.to_string());
    names.sort();
    names.dedup();
    names
}

/// Sums methodology weights per key over every converted user. Users without a
/// qualifying touch are dropped.
fn credit_users(
    converted: &HashMap<String, i64>,
    sessions: &SessionRanges,
    methodology: AttributionMethodology,
    lookback_secs: i64,
    period: Option<(i64, i64)>,
) -> HashMap<String, f64> {
    let mut credit: HashMap<String, f64> = HashMap::new();
    for (user, conversion_time) in converted {
        let Some(ranges) = sessions.get(user) else {
            continue;
        };
        let window = Window {
            conversion_time: *conversion_time,
            lookback_secs,
            period,
        };
        for weight in attribute(methodology, ranges, &window) {
            *credit.entry(weight.key).or_default() += weight.weight;
        }
    }
    credit
}
