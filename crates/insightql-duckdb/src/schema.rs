/// DuckDB initialization SQL, run once at open time via `Connection::execute_batch`.
///
/// Every statement uses `IF NOT EXISTS`, so re-running it against an existing
/// file is a no-op. `memory_limit` is a DuckDB size string such as `"1GB"`.
///
/// The tables mirror what the query compiler reads:
///   - `events.properties` and `user_properties.properties` are JSON objects
///     queried with `->>`;
///   - `events.timestamp` is unix seconds;
///   - `users.customer_user_id` links anonymous ids to one customer.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

CREATE TABLE IF NOT EXISTS event_names (
    id              BIGINT PRIMARY KEY,
    project_id      BIGINT NOT NULL,
    name            VARCHAR NOT NULL,
    type            VARCHAR NOT NULL DEFAULT 'user_created'
);
CREATE INDEX IF NOT EXISTS idx_event_names_project ON event_names(project_id, name);

CREATE TABLE IF NOT EXISTS users (
    id                  VARCHAR PRIMARY KEY,
    project_id          BIGINT NOT NULL,
    customer_user_id    VARCHAR,
    properties_id       VARCHAR,
    join_timestamp      BIGINT
);
CREATE INDEX IF NOT EXISTS idx_users_customer ON users(project_id, customer_user_id);

CREATE TABLE IF NOT EXISTS user_properties (
    id              VARCHAR PRIMARY KEY,
    project_id      BIGINT NOT NULL,
    user_id         VARCHAR NOT NULL,
    properties      JSON NOT NULL DEFAULT '{{}}'
);

CREATE TABLE IF NOT EXISTS events (
    id                  VARCHAR PRIMARY KEY,
    project_id          BIGINT NOT NULL,
    user_id             VARCHAR NOT NULL,
    session_id          VARCHAR,
    event_name_id       BIGINT NOT NULL,
    timestamp           BIGINT NOT NULL,
    count               BIGINT NOT NULL DEFAULT 1,
    properties          JSON NOT NULL DEFAULT '{{}}',
    user_properties_id  VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_events_project_name_time
    ON events(project_id, event_name_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_user ON events(project_id, user_id);

-- Ad-platform integration per project. A NULL account means no integration.
CREATE TABLE IF NOT EXISTS project_settings (
    project_id              BIGINT PRIMARY KEY,
    customer_account_id     VARCHAR
);

-- Daily performance per attribution key. key_type is one of
-- 'campaign', 'ad_group', 'keyword', 'source'.
CREATE TABLE IF NOT EXISTS ad_performance_reports (
    project_id              BIGINT NOT NULL,
    customer_account_id     VARCHAR NOT NULL,
    key_type                VARCHAR NOT NULL,
    key_id                  VARCHAR NOT NULL,
    key_name                VARCHAR NOT NULL DEFAULT '',
    timestamp               BIGINT NOT NULL,
    impressions             BIGINT NOT NULL DEFAULT 0,
    clicks                  BIGINT NOT NULL DEFAULT 0,
    spend                   DOUBLE NOT NULL DEFAULT 0,
    currency                VARCHAR NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_ad_reports_lookup
    ON ad_performance_reports(project_id, customer_account_id, key_type, timestamp);

-- Click ids resolved to the keys they were served under.
CREATE TABLE IF NOT EXISTS click_reports (
    project_id              BIGINT NOT NULL,
    customer_account_id     VARCHAR NOT NULL,
    gclid                   VARCHAR NOT NULL,
    key_type                VARCHAR NOT NULL,
    key_id                  VARCHAR NOT NULL,
    timestamp               BIGINT NOT NULL
);
"#
    )
}
