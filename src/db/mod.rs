//! Database module
//!
//! Owns the connection pool, migrations, source configuration (including the
//! collection watermark), fact-row batch writes, aggregate upserts, and
//! retention deletes. Read models for dashboards live in [`crate::query`].

pub mod dimensions;
mod schema;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::error::EngineError;

/// Current time as unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub const HOUR_MS: i64 = 3_600_000;
pub const DAY_MS: i64 = 86_400_000;

/// Start of the UTC hour containing `ts_ms`.
pub fn hour_bucket(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(HOUR_MS)
}

/// Start of the UTC day containing `ts_ms`.
pub fn day_bucket(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(DAY_MS)
}

/// One monitored log origin and its collection watermark.
///
/// The watermark triple (`last_file_size`, `last_file_offset`,
/// `last_file_inode`) is mutated only by the collector; `offset <= size`
/// always holds, and an inode change resets both to the new file.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub name: String,
    /// "host" (local file path) or "k8s_ingress" (pod selector)
    pub kind: String,
    pub description: String,
    /// 1 = active, 0 = paused
    pub status: i64,
    pub log_path: String,
    /// combined | json | custom
    pub log_format: String,
    pub namespace: String,
    pub ingress_name: String,
    pub pod_selector: String,
    pub container_name: String,
    pub geo_enabled: bool,
    pub session_enabled: bool,
    pub collect_interval_secs: i64,
    pub retention_days: i64,
    pub last_collect_at: Option<i64>,
    pub last_collect_logs: i64,
    pub last_error: String,
    pub last_file_size: i64,
    pub last_file_offset: i64,
    pub last_file_inode: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Source {
    pub fn new(name: impl Into<String>, log_path: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            name: name.into(),
            kind: "host".to_string(),
            description: String::new(),
            status: 1,
            log_path: log_path.into(),
            log_format: "combined".to_string(),
            namespace: String::new(),
            ingress_name: String::new(),
            pod_selector: String::new(),
            container_name: String::new(),
            geo_enabled: true,
            session_enabled: false,
            collect_interval_secs: 60,
            retention_days: 30,
            last_collect_at: None,
            last_collect_logs: 0,
            last_error: String::new(),
            last_file_size: 0,
            last_file_offset: 0,
            last_file_inode: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.log_format = format.to_string();
        self
    }

    pub fn with_interval(mut self, secs: i64) -> Self {
        self.collect_interval_secs = secs;
        self
    }

    pub fn with_retention(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_geo(mut self, enabled: bool) -> Self {
        self.geo_enabled = enabled;
        self
    }
}

/// One accepted request, keyed into the dimension tables.
#[derive(Debug, Clone, Default)]
pub struct FactRow {
    pub source_id: i64,
    pub ts_ms: i64,
    pub ip_id: i64,
    pub url_id: i64,
    pub referer_id: i64,
    pub ua_id: i64,
    pub method: String,
    pub protocol: String,
    pub status: i64,
    pub body_bytes: i64,
    pub request_time: f64,
    pub upstream_time: f64,
    pub is_page_view: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct HourlyAggregate {
    pub source_id: i64,
    pub bucket_ms: i64,
    pub total_requests: i64,
    pub page_views: i64,
    pub unique_ips: i64,
    pub total_bytes: i64,
    pub status_2xx: i64,
    pub status_3xx: i64,
    pub status_4xx: i64,
    pub status_5xx: i64,
    pub min_request_time: f64,
    pub avg_request_time: f64,
    pub max_request_time: f64,
    pub method_distribution: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct DailyAggregate {
    pub source_id: i64,
    pub bucket_ms: i64,
    pub total_requests: i64,
    pub page_views: i64,
    pub unique_ips: i64,
    pub total_bytes: i64,
    pub status_2xx: i64,
    pub status_3xx: i64,
    pub status_4xx: i64,
    pub status_5xx: i64,
    pub min_request_time: f64,
    pub avg_request_time: f64,
    pub max_request_time: f64,
    pub method_distribution: String,
    pub top_urls: String,
    pub top_ips: String,
    pub top_referers: String,
    pub top_countries: String,
    pub top_browsers: String,
    pub top_devices: String,
    pub hourly_traffic: String,
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    table_cache: Arc<DashMap<String, bool>>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, EngineError> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.url)).await?;
        Ok(Self {
            pool,
            table_cache: Arc::new(DashMap::new()),
        })
    }

    /// Single-connection in-memory database, used by tests and demos.
    pub async fn open_in_memory() -> Result<Self, EngineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self {
            pool,
            table_cache: Arc::new(DashMap::new()),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), EngineError> {
        // WAL mode for concurrent collectors and dashboard reads
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        for stmt in schema::ALL_STATEMENTS {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Whether `name` exists in this database. Used by the query fallback
    /// chain to detect legacy schema tiers. Positive results are cached;
    /// negatives are re-checked so a restored legacy table is picked up.
    pub async fn table_exists(&self, name: &str) -> bool {
        if let Some(hit) = self.table_cache.get(name) {
            if *hit {
                return true;
            }
        }
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .ok()
                .flatten();
        let exists = row.is_some();
        if exists {
            self.table_cache.insert(name.to_string(), true);
        }
        exists
    }

    // ============== sources ==============

    pub async fn create_source(&self, source: &Source) -> Result<i64, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sources (
                name, kind, description, status, log_path, log_format,
                namespace, ingress_name, pod_selector, container_name,
                geo_enabled, session_enabled, collect_interval_secs,
                retention_days, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.name)
        .bind(&source.kind)
        .bind(&source.description)
        .bind(source.status)
        .bind(&source.log_path)
        .bind(&source.log_format)
        .bind(&source.namespace)
        .bind(&source.ingress_name)
        .bind(&source.pod_selector)
        .bind(&source.container_name)
        .bind(source.geo_enabled)
        .bind(source.session_enabled)
        .bind(source.collect_interval_secs)
        .bind(source.retention_days)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn update_source(&self, source: &Source) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE sources SET
                name = ?, kind = ?, description = ?, status = ?, log_path = ?,
                log_format = ?, namespace = ?, ingress_name = ?,
                pod_selector = ?, container_name = ?, geo_enabled = ?,
                session_enabled = ?, collect_interval_secs = ?,
                retention_days = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&source.name)
        .bind(&source.kind)
        .bind(&source.description)
        .bind(source.status)
        .bind(&source.log_path)
        .bind(&source.log_format)
        .bind(&source.namespace)
        .bind(&source.ingress_name)
        .bind(&source.pod_selector)
        .bind(&source.container_name)
        .bind(source.geo_enabled)
        .bind(source.session_enabled)
        .bind(source.collect_interval_secs)
        .bind(source.retention_days)
        .bind(now_ms())
        .bind(source.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_source(&self, id: i64) -> Result<Source, EngineError> {
        sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::SourceNotFound(id))
    }

    pub async fn list_sources(
        &self,
        page: i64,
        page_size: i64,
        kind: Option<&str>,
        status: Option<i64>,
    ) -> Result<(Vec<Source>, i64), EngineError> {
        let offset = (page.max(1) - 1) * page_size;
        let rows = sqlx::query_as::<_, Source>(
            r#"
            SELECT * FROM sources
            WHERE deleted_at IS NULL
              AND (?1 IS NULL OR kind = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY id DESC LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(kind)
        .bind(status)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sources
            WHERE deleted_at IS NULL
              AND (?1 IS NULL OR kind = ?1)
              AND (?2 IS NULL OR status = ?2)
            "#,
        )
        .bind(kind)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows, total))
    }

    pub async fn active_sources(&self) -> Result<Vec<Source>, EngineError> {
        Ok(sqlx::query_as::<_, Source>(
            "SELECT * FROM sources WHERE status = 1 AND deleted_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Tombstone the source and hard-delete everything that hangs off it:
    /// fact rows, aggregates, and legacy rows when the legacy tables exist.
    /// Dimensions are source-independent and stay.
    pub async fn soft_delete_source(&self, id: i64) -> Result<(), EngineError> {
        let legacy_facts = self.table_exists("access_logs").await;
        let legacy_daily = self.table_exists("daily_stats").await;
        let legacy_hourly = self.table_exists("hourly_stats").await;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM fact_requests WHERE source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM agg_hourly WHERE source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM agg_daily WHERE source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if legacy_facts {
            sqlx::query("DELETE FROM access_logs WHERE source_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        if legacy_daily {
            sqlx::query("DELETE FROM daily_stats WHERE source_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        if legacy_hourly {
            sqlx::query("DELETE FROM hourly_stats WHERE source_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE sources SET deleted_at = ?, status = 0, updated_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(now_ms())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ============== watermark ==============

    /// Rotation or truncation detected: position the watermark at the start
    /// of the new file. Collection status fields are left alone; the cycle
    /// that called this continues reading from offset 0.
    pub async fn reset_watermark(&self, id: i64, size: i64, inode: i64) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE sources SET last_file_size = ?, last_file_offset = 0,
                last_file_inode = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(size)
        .bind(inode)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance the watermark after a fully persisted cycle. Also records the
    /// collection status and clears `last_error` in the same statement so
    /// the surface is consistent with the watermark.
    pub async fn advance_watermark(
        &self,
        id: i64,
        size: i64,
        offset: i64,
        inode: i64,
        logs_collected: i64,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE sources SET last_file_size = ?, last_file_offset = ?,
                last_file_inode = ?, last_collect_at = ?,
                last_collect_logs = ?, last_error = '', updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(size)
        .bind(offset)
        .bind(inode)
        .bind(now_ms())
        .bind(logs_collected)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed cycle. The watermark is deliberately untouched so the
    /// same bytes are retried next interval.
    pub async fn record_collect_error(&self, id: i64, error: &str) -> Result<(), EngineError> {
        sqlx::query("UPDATE sources SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============== fact rows ==============

    /// Append one batch of fact rows in a single transaction.
    pub async fn insert_facts(&self, rows: &[FactRow]) -> Result<(), EngineError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(EngineError::BatchWrite)?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO fact_requests (
                    source_id, ts_ms, ip_id, url_id, referer_id, ua_id,
                    method, protocol, status, body_bytes, request_time,
                    upstream_time, is_page_view
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.source_id)
            .bind(row.ts_ms)
            .bind(row.ip_id)
            .bind(row.url_id)
            .bind(row.referer_id)
            .bind(row.ua_id)
            .bind(&row.method)
            .bind(&row.protocol)
            .bind(row.status)
            .bind(row.body_bytes)
            .bind(row.request_time)
            .bind(row.upstream_time)
            .bind(row.is_page_view)
            .execute(&mut *tx)
            .await
            .map_err(EngineError::BatchWrite)?;
        }
        tx.commit().await.map_err(EngineError::BatchWrite)?;
        Ok(())
    }

    pub async fn fact_count(&self, source_id: i64) -> Result<i64, EngineError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM fact_requests WHERE source_id = ?")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ============== aggregates ==============

    /// Replace-on-conflict upsert: every derived column is overwritten so
    /// recomputing a bucket is idempotent.
    pub async fn upsert_hourly(&self, agg: &HourlyAggregate) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO agg_hourly (
                source_id, bucket_ms, total_requests, page_views, unique_ips,
                total_bytes, status_2xx, status_3xx, status_4xx, status_5xx,
                min_request_time, avg_request_time, max_request_time,
                method_distribution, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (source_id, bucket_ms) DO UPDATE SET
                total_requests = excluded.total_requests,
                page_views = excluded.page_views,
                unique_ips = excluded.unique_ips,
                total_bytes = excluded.total_bytes,
                status_2xx = excluded.status_2xx,
                status_3xx = excluded.status_3xx,
                status_4xx = excluded.status_4xx,
                status_5xx = excluded.status_5xx,
                min_request_time = excluded.min_request_time,
                avg_request_time = excluded.avg_request_time,
                max_request_time = excluded.max_request_time,
                method_distribution = excluded.method_distribution,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(agg.source_id)
        .bind(agg.bucket_ms)
        .bind(agg.total_requests)
        .bind(agg.page_views)
        .bind(agg.unique_ips)
        .bind(agg.total_bytes)
        .bind(agg.status_2xx)
        .bind(agg.status_3xx)
        .bind(agg.status_4xx)
        .bind(agg.status_5xx)
        .bind(agg.min_request_time)
        .bind(agg.avg_request_time)
        .bind(agg.max_request_time)
        .bind(&agg.method_distribution)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_daily(&self, agg: &DailyAggregate) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO agg_daily (
                source_id, bucket_ms, total_requests, page_views, unique_ips,
                total_bytes, status_2xx, status_3xx, status_4xx, status_5xx,
                min_request_time, avg_request_time, max_request_time,
                method_distribution, top_urls, top_ips, top_referers,
                top_countries, top_browsers, top_devices, hourly_traffic,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (source_id, bucket_ms) DO UPDATE SET
                total_requests = excluded.total_requests,
                page_views = excluded.page_views,
                unique_ips = excluded.unique_ips,
                total_bytes = excluded.total_bytes,
                status_2xx = excluded.status_2xx,
                status_3xx = excluded.status_3xx,
                status_4xx = excluded.status_4xx,
                status_5xx = excluded.status_5xx,
                min_request_time = excluded.min_request_time,
                avg_request_time = excluded.avg_request_time,
                max_request_time = excluded.max_request_time,
                method_distribution = excluded.method_distribution,
                top_urls = excluded.top_urls,
                top_ips = excluded.top_ips,
                top_referers = excluded.top_referers,
                top_countries = excluded.top_countries,
                top_browsers = excluded.top_browsers,
                top_devices = excluded.top_devices,
                hourly_traffic = excluded.hourly_traffic,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(agg.source_id)
        .bind(agg.bucket_ms)
        .bind(agg.total_requests)
        .bind(agg.page_views)
        .bind(agg.unique_ips)
        .bind(agg.total_bytes)
        .bind(agg.status_2xx)
        .bind(agg.status_3xx)
        .bind(agg.status_4xx)
        .bind(agg.status_5xx)
        .bind(agg.min_request_time)
        .bind(agg.avg_request_time)
        .bind(agg.max_request_time)
        .bind(&agg.method_distribution)
        .bind(&agg.top_urls)
        .bind(&agg.top_ips)
        .bind(&agg.top_referers)
        .bind(&agg.top_countries)
        .bind(&agg.top_browsers)
        .bind(&agg.top_devices)
        .bind(&agg.hourly_traffic)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn hourly_aggregates(
        &self,
        source_id: i64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<HourlyAggregate>, EngineError> {
        Ok(sqlx::query_as::<_, HourlyAggregate>(
            r#"
            SELECT * FROM agg_hourly
            WHERE source_id = ? AND bucket_ms >= ? AND bucket_ms < ?
            ORDER BY bucket_ms ASC
            "#,
        )
        .bind(source_id)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn daily_aggregates(
        &self,
        source_id: i64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<DailyAggregate>, EngineError> {
        Ok(sqlx::query_as::<_, DailyAggregate>(
            r#"
            SELECT * FROM agg_daily
            WHERE source_id = ? AND bucket_ms >= ? AND bucket_ms < ?
            ORDER BY bucket_ms ASC
            "#,
        )
        .bind(source_id)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn get_daily_aggregate(
        &self,
        source_id: i64,
        bucket_ms: i64,
    ) -> Result<Option<DailyAggregate>, EngineError> {
        Ok(sqlx::query_as::<_, DailyAggregate>(
            "SELECT * FROM agg_daily WHERE source_id = ? AND bucket_ms = ?",
        )
        .bind(source_id)
        .bind(bucket_ms)
        .fetch_optional(&self.pool)
        .await?)
    }

    // ============== retention ==============

    /// Drop rows older than the source's retention horizon. Hourly
    /// aggregates are kept twice as long as raw rows for cheap sparklines.
    pub async fn sweep_retention(&self, source: &Source) -> Result<(), EngineError> {
        let cutoff = now_ms() - source.retention_days * DAY_MS;
        let hourly_cutoff = now_ms() - source.retention_days * 2 * DAY_MS;

        sqlx::query("DELETE FROM fact_requests WHERE source_id = ? AND ts_ms < ?")
            .bind(source.id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM agg_hourly WHERE source_id = ? AND bucket_ms < ?")
            .bind(source.id)
            .bind(hourly_cutoff)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM agg_daily WHERE source_id = ? AND bucket_ms < ?")
            .bind(source.id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        if self.table_exists("access_logs").await {
            sqlx::query("DELETE FROM access_logs WHERE source_id = ? AND ts_ms < ?")
                .bind(source.id)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        }
        if self.table_exists("hourly_stats").await {
            sqlx::query("DELETE FROM hourly_stats WHERE source_id = ? AND bucket_ms < ?")
                .bind(source.id)
                .bind(hourly_cutoff)
                .execute(&self.pool)
                .await?;
        }
        if self.table_exists("daily_stats").await {
            sqlx::query("DELETE FROM daily_stats WHERE source_id = ? AND bucket_ms < ?")
                .bind(source.id)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

/// Fixture for the pre-dimensional schema. Production never creates these
/// tables; tests install them to exercise the legacy read tier.
#[cfg(test)]
pub(crate) mod legacy_fixture {
    use super::Database;

    pub const CREATE_ACCESS_LOGS: &str = r#"
    CREATE TABLE IF NOT EXISTS access_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL,
        ts_ms BIGINT NOT NULL,
        remote_addr TEXT NOT NULL DEFAULT '',
        remote_user TEXT NOT NULL DEFAULT '',
        method TEXT NOT NULL DEFAULT '',
        uri TEXT NOT NULL DEFAULT '',
        protocol TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 0,
        body_bytes BIGINT NOT NULL DEFAULT 0,
        referer TEXT NOT NULL DEFAULT '',
        user_agent TEXT NOT NULL DEFAULT '',
        request_time REAL NOT NULL DEFAULT 0,
        host TEXT NOT NULL DEFAULT '',
        country TEXT NOT NULL DEFAULT '',
        browser TEXT NOT NULL DEFAULT '',
        device_type TEXT NOT NULL DEFAULT ''
    )
    "#;

    pub const CREATE_HOURLY_STATS: &str = r#"
    CREATE TABLE IF NOT EXISTS hourly_stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL,
        bucket_ms BIGINT NOT NULL,
        total_requests BIGINT NOT NULL DEFAULT 0,
        unique_visitors BIGINT NOT NULL DEFAULT 0,
        total_bytes BIGINT NOT NULL DEFAULT 0,
        avg_request_time REAL NOT NULL DEFAULT 0,
        status_2xx BIGINT NOT NULL DEFAULT 0,
        status_3xx BIGINT NOT NULL DEFAULT 0,
        status_4xx BIGINT NOT NULL DEFAULT 0,
        status_5xx BIGINT NOT NULL DEFAULT 0
    )
    "#;

    pub const CREATE_DAILY_STATS: &str = r#"
    CREATE TABLE IF NOT EXISTS daily_stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL,
        bucket_ms BIGINT NOT NULL,
        total_requests BIGINT NOT NULL DEFAULT 0,
        unique_visitors BIGINT NOT NULL DEFAULT 0,
        total_bytes BIGINT NOT NULL DEFAULT 0,
        avg_request_time REAL NOT NULL DEFAULT 0,
        status_2xx BIGINT NOT NULL DEFAULT 0,
        status_3xx BIGINT NOT NULL DEFAULT 0,
        status_4xx BIGINT NOT NULL DEFAULT 0,
        status_5xx BIGINT NOT NULL DEFAULT 0
    )
    "#;

    pub async fn install(db: &Database) {
        for stmt in [CREATE_ACCESS_LOGS, CREATE_HOURLY_STATS, CREATE_DAILY_STATS] {
            sqlx::query(stmt).execute(db.pool()).await.unwrap();
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_access_log(
        db: &Database,
        source_id: i64,
        ts_ms: i64,
        remote_addr: &str,
        method: &str,
        uri: &str,
        status: i64,
        body_bytes: i64,
        referer: &str,
    ) {
        sqlx::query(
            "INSERT INTO access_logs (source_id, ts_ms, remote_addr, method, uri, status, body_bytes, referer) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(source_id)
        .bind(ts_ms)
        .bind(remote_addr)
        .bind(method)
        .bind(uri)
        .bind(status)
        .bind(body_bytes)
        .bind(referer)
        .execute(db.pool())
        .await
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn source_crud_and_watermark() {
        let db = Database::open_in_memory().await.unwrap();
        let id = db
            .create_source(&Source::new("web-1", "/var/log/nginx/access.log").with_interval(30))
            .await
            .unwrap();

        let src = db.get_source(id).await.unwrap();
        assert_eq!(src.name, "web-1");
        assert_eq!(src.collect_interval_secs, 30);
        assert_eq!(src.last_file_offset, 0);

        db.advance_watermark(id, 4096, 4000, 777, 12).await.unwrap();
        let src = db.get_source(id).await.unwrap();
        assert_eq!(src.last_file_size, 4096);
        assert_eq!(src.last_file_offset, 4000);
        assert_eq!(src.last_file_inode, 777);
        assert_eq!(src.last_collect_logs, 12);
        assert!(src.last_collect_at.is_some());
        assert_eq!(src.last_error, "");

        db.reset_watermark(id, 128, 778).await.unwrap();
        let src = db.get_source(id).await.unwrap();
        assert_eq!(src.last_file_offset, 0);
        assert_eq!(src.last_file_inode, 778);
    }

    #[tokio::test]
    async fn record_error_preserves_watermark() {
        let db = Database::open_in_memory().await.unwrap();
        let id = db
            .create_source(&Source::new("web-1", "/var/log/nginx/access.log"))
            .await
            .unwrap();
        db.advance_watermark(id, 100, 90, 1, 3).await.unwrap();
        db.record_collect_error(id, "file vanished").await.unwrap();

        let src = db.get_source(id).await.unwrap();
        assert_eq!(src.last_error, "file vanished");
        assert_eq!(src.last_file_offset, 90);
    }

    #[tokio::test]
    async fn hourly_upsert_replaces_not_accumulates() {
        let db = Database::open_in_memory().await.unwrap();
        let agg = HourlyAggregate {
            source_id: 1,
            bucket_ms: 0,
            total_requests: 10,
            ..Default::default()
        };
        db.upsert_hourly(&agg).await.unwrap();
        db.upsert_hourly(&agg).await.unwrap();

        let rows = db.hourly_aggregates(1, 0, HOUR_MS).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_requests, 10);
    }

    #[tokio::test]
    async fn soft_delete_cascades() {
        let db = Database::open_in_memory().await.unwrap();
        let id = db
            .create_source(&Source::new("web-1", "/tmp/a.log"))
            .await
            .unwrap();
        db.insert_facts(&[FactRow {
            source_id: id,
            ts_ms: 1,
            ..Default::default()
        }])
        .await
        .unwrap();
        db.upsert_hourly(&HourlyAggregate {
            source_id: id,
            bucket_ms: 0,
            total_requests: 1,
            ..Default::default()
        })
        .await
        .unwrap();

        db.soft_delete_source(id).await.unwrap();

        assert!(matches!(
            db.get_source(id).await,
            Err(EngineError::SourceNotFound(_))
        ));
        assert_eq!(db.fact_count(id).await.unwrap(), 0);
        assert!(db.hourly_aggregates(id, 0, HOUR_MS).await.unwrap().is_empty());
    }

    #[test]
    fn bucket_math() {
        let ts = 1_754_560_532_000; // mid-hour
        assert_eq!(hour_bucket(ts) % HOUR_MS, 0);
        assert_eq!(day_bucket(ts) % DAY_MS, 0);
        assert!(hour_bucket(ts) <= ts && ts < hour_bucket(ts) + HOUR_MS);
        assert!(day_bucket(ts) <= ts && ts < day_bucket(ts) + DAY_MS);
    }
}
