//! Database schema definitions
//!
//! Star schema: four dimension tables keyed by a unique business key, one
//! append-only fact table referencing them by surrogate id, and two rollup
//! tables keyed by (source, time bucket). Legacy flat tables from the
//! pre-dimensional schema are read when present but never created here.

pub const CREATE_SOURCES: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'host',
    description TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL DEFAULT 1,
    log_path TEXT NOT NULL DEFAULT '',
    log_format TEXT NOT NULL DEFAULT 'combined',
    namespace TEXT NOT NULL DEFAULT '',
    ingress_name TEXT NOT NULL DEFAULT '',
    pod_selector TEXT NOT NULL DEFAULT '',
    container_name TEXT NOT NULL DEFAULT '',
    geo_enabled INTEGER NOT NULL DEFAULT 1,
    session_enabled INTEGER NOT NULL DEFAULT 0,
    collect_interval_secs INTEGER NOT NULL DEFAULT 60,
    retention_days INTEGER NOT NULL DEFAULT 30,
    last_collect_at BIGINT,
    last_collect_logs BIGINT NOT NULL DEFAULT 0,
    last_error TEXT NOT NULL DEFAULT '',
    last_file_size BIGINT NOT NULL DEFAULT 0,
    last_file_offset BIGINT NOT NULL DEFAULT 0,
    last_file_inode BIGINT NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    deleted_at BIGINT
)
"#;

pub const CREATE_DIM_IP: &str = r#"
CREATE TABLE IF NOT EXISTS dim_ip (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL UNIQUE,
    country TEXT NOT NULL DEFAULT '',
    province TEXT NOT NULL DEFAULT '',
    city TEXT NOT NULL DEFAULT '',
    isp TEXT NOT NULL DEFAULT '',
    is_bot INTEGER NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
)
"#;

pub const CREATE_DIM_URL: &str = r#"
CREATE TABLE IF NOT EXISTS dim_url (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url_hash TEXT NOT NULL UNIQUE,
    url_path TEXT NOT NULL DEFAULT '',
    url_normalized TEXT NOT NULL DEFAULT '',
    host TEXT NOT NULL DEFAULT '',
    created_at BIGINT NOT NULL
)
"#;

pub const CREATE_DIM_REFERER: &str = r#"
CREATE TABLE IF NOT EXISTS dim_referer (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    referer_hash TEXT NOT NULL UNIQUE,
    referer_url TEXT NOT NULL DEFAULT '',
    referer_domain TEXT NOT NULL DEFAULT '',
    referer_type TEXT NOT NULL DEFAULT 'other',
    created_at BIGINT NOT NULL
)
"#;

pub const CREATE_DIM_USER_AGENT: &str = r#"
CREATE TABLE IF NOT EXISTS dim_user_agent (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ua_hash TEXT NOT NULL UNIQUE,
    user_agent TEXT NOT NULL DEFAULT '',
    browser TEXT NOT NULL DEFAULT '',
    browser_version TEXT NOT NULL DEFAULT '',
    os TEXT NOT NULL DEFAULT '',
    os_version TEXT NOT NULL DEFAULT '',
    device_type TEXT NOT NULL DEFAULT 'desktop',
    is_bot INTEGER NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL
)
"#;

pub const CREATE_FACT_REQUESTS: &str = r#"
CREATE TABLE IF NOT EXISTS fact_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    ts_ms BIGINT NOT NULL,
    ip_id INTEGER NOT NULL DEFAULT 0,
    url_id INTEGER NOT NULL DEFAULT 0,
    referer_id INTEGER NOT NULL DEFAULT 0,
    ua_id INTEGER NOT NULL DEFAULT 0,
    method TEXT NOT NULL DEFAULT '',
    protocol TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL DEFAULT 0,
    body_bytes BIGINT NOT NULL DEFAULT 0,
    request_time REAL NOT NULL DEFAULT 0,
    upstream_time REAL NOT NULL DEFAULT 0,
    is_page_view INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_AGG_HOURLY: &str = r#"
CREATE TABLE IF NOT EXISTS agg_hourly (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    bucket_ms BIGINT NOT NULL,
    total_requests BIGINT NOT NULL DEFAULT 0,
    page_views BIGINT NOT NULL DEFAULT 0,
    unique_ips BIGINT NOT NULL DEFAULT 0,
    total_bytes BIGINT NOT NULL DEFAULT 0,
    status_2xx BIGINT NOT NULL DEFAULT 0,
    status_3xx BIGINT NOT NULL DEFAULT 0,
    status_4xx BIGINT NOT NULL DEFAULT 0,
    status_5xx BIGINT NOT NULL DEFAULT 0,
    min_request_time REAL NOT NULL DEFAULT 0,
    avg_request_time REAL NOT NULL DEFAULT 0,
    max_request_time REAL NOT NULL DEFAULT 0,
    method_distribution TEXT NOT NULL DEFAULT '{}',
    updated_at BIGINT NOT NULL DEFAULT 0,
    UNIQUE (source_id, bucket_ms)
)
"#;

pub const CREATE_AGG_DAILY: &str = r#"
CREATE TABLE IF NOT EXISTS agg_daily (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    bucket_ms BIGINT NOT NULL,
    total_requests BIGINT NOT NULL DEFAULT 0,
    page_views BIGINT NOT NULL DEFAULT 0,
    unique_ips BIGINT NOT NULL DEFAULT 0,
    total_bytes BIGINT NOT NULL DEFAULT 0,
    status_2xx BIGINT NOT NULL DEFAULT 0,
    status_3xx BIGINT NOT NULL DEFAULT 0,
    status_4xx BIGINT NOT NULL DEFAULT 0,
    status_5xx BIGINT NOT NULL DEFAULT 0,
    min_request_time REAL NOT NULL DEFAULT 0,
    avg_request_time REAL NOT NULL DEFAULT 0,
    max_request_time REAL NOT NULL DEFAULT 0,
    method_distribution TEXT NOT NULL DEFAULT '{}',
    top_urls TEXT NOT NULL DEFAULT '[]',
    top_ips TEXT NOT NULL DEFAULT '[]',
    top_referers TEXT NOT NULL DEFAULT '[]',
    top_countries TEXT NOT NULL DEFAULT '[]',
    top_browsers TEXT NOT NULL DEFAULT '[]',
    top_devices TEXT NOT NULL DEFAULT '[]',
    hourly_traffic TEXT NOT NULL DEFAULT '[]',
    updated_at BIGINT NOT NULL DEFAULT 0,
    UNIQUE (source_id, bucket_ms)
)
"#;

// === COVERING INDEXES ===

// Range scans by source and time drive collection, rollups, and the raw-tier
// queries
pub const CREATE_INDEX_FACT_SOURCE_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_fact_source_ts ON fact_requests(source_id, ts_ms)";

// For per-dimension drill-downs on the fact table
pub const CREATE_INDEX_FACT_IP: &str =
    "CREATE INDEX IF NOT EXISTS idx_fact_ip ON fact_requests(ip_id)";

pub const CREATE_INDEX_FACT_URL: &str =
    "CREATE INDEX IF NOT EXISTS idx_fact_url ON fact_requests(url_id)";

// For status/method filters on the listing endpoint
pub const CREATE_INDEX_FACT_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_fact_status ON fact_requests(source_id, status)";

pub const CREATE_INDEX_DIM_URL_NORMALIZED: &str =
    "CREATE INDEX IF NOT EXISTS idx_dim_url_normalized ON dim_url(url_normalized)";

pub const CREATE_INDEX_DIM_REFERER_DOMAIN: &str =
    "CREATE INDEX IF NOT EXISTS idx_dim_referer_domain ON dim_referer(referer_domain)";

pub const CREATE_INDEX_AGG_HOURLY_BUCKET: &str =
    "CREATE INDEX IF NOT EXISTS idx_agg_hourly_bucket ON agg_hourly(bucket_ms)";

pub const CREATE_INDEX_AGG_DAILY_BUCKET: &str =
    "CREATE INDEX IF NOT EXISTS idx_agg_daily_bucket ON agg_daily(bucket_ms)";

pub const ALL_STATEMENTS: &[&str] = &[
    CREATE_SOURCES,
    CREATE_DIM_IP,
    CREATE_DIM_URL,
    CREATE_DIM_REFERER,
    CREATE_DIM_USER_AGENT,
    CREATE_FACT_REQUESTS,
    CREATE_AGG_HOURLY,
    CREATE_AGG_DAILY,
    CREATE_INDEX_FACT_SOURCE_TS,
    CREATE_INDEX_FACT_IP,
    CREATE_INDEX_FACT_URL,
    CREATE_INDEX_FACT_STATUS,
    CREATE_INDEX_DIM_URL_NORMALIZED,
    CREATE_INDEX_DIM_REFERER_DOMAIN,
    CREATE_INDEX_AGG_HOURLY_BUCKET,
    CREATE_INDEX_AGG_DAILY_BUCKET,
];
