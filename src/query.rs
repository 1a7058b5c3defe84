//! Dashboard read models
//!
//! Every read walks a prioritized tier chain: the dimensional aggregate
//! tables first, then the legacy flat aggregates, then a live aggregation
//! over raw fact (or legacy) rows. A tier reports "no data for this window"
//! as `None`, which is distinct from zero values: a populated tier with zero
//! traffic terminates the chain. Exactly one tier serves a given call; only
//! the real-time tail (the last minute, read straight from raw rows) is
//! layered on top of aggregate history for "today so far" metrics.
//!
//! Public methods never fail a dashboard render: storage errors are logged
//! and degrade to empty/zero results.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use tracing::warn;

use crate::db::{day_bucket, now_ms, DailyAggregate, Database, DAY_MS, HOUR_MS};
use crate::error::EngineError;
use crate::parser::referer_domain;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSet {
    pub hits: i64,
    pub pv: i64,
    pub uv: i64,
    pub status_2xx: i64,
    pub status_3xx: i64,
    pub status_4xx: i64,
    pub status_5xx: i64,
    pub realtime_ops: f64,
    pub peak_ops: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoreMetrics {
    pub today: MetricSet,
    pub yesterday: MetricSet,
    pub yesterday_now: MetricSet,
    /// Today-so-far scaled by 24 / max(current_hour, 1). A naive linear
    /// extrapolation, not a forecast model.
    pub predicted_today: MetricSet,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub label: String,
    pub pv: i64,
    pub uv: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendMode {
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VisitorComparison {
    pub today_new: i64,
    pub today_returning: i64,
    pub today_new_pct: f64,
    pub today_returning_pct: f64,
    pub yesterday_new: i64,
    pub yesterday_returning: i64,
    pub yesterday_new_pct: f64,
    pub yesterday_returning_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageCount {
    pub path: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefererCount {
    pub domain: String,
    pub visitors: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IpStat {
    pub addr: String,
    pub country: String,
    pub city: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeoStat {
    pub name: String,
    pub count: i64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStat {
    pub device_type: String,
    pub count: i64,
    pub percent: f64,
}

/// Closed set of optional listing filters. All fields combine with AND.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub status: Option<i64>,
    pub method: Option<String>,
    pub host: Option<String>,
    pub ip_contains: Option<String>,
    pub uri_contains: Option<String>,
}

/// One fact row joined with its dimensions, for the log listing.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RequestView {
    pub id: i64,
    pub ts_ms: i64,
    pub remote_addr: String,
    pub country: String,
    pub city: String,
    pub method: String,
    pub uri: String,
    pub host: String,
    pub protocol: String,
    pub status: i64,
    pub body_bytes: i64,
    pub request_time: f64,
    pub referer: String,
    pub browser: String,
    pub os: String,
    pub device_type: String,
    pub is_bot: bool,
}

/// Which raw tier holds rows for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawTier {
    Fact,
    Legacy,
}

#[derive(Clone)]
pub struct QueryEngine {
    db: Database,
}

impl QueryEngine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ======================================================================
    // core metrics
    // ======================================================================

    pub async fn core_metrics(&self, source_id: i64) -> CoreMetrics {
        match self.core_metrics_inner(source_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(source_id, error = %e, "core metrics degraded to defaults");
                CoreMetrics::default()
            }
        }
    }

    async fn core_metrics_inner(&self, source_id: i64) -> Result<CoreMetrics, EngineError> {
        let now = now_ms();
        let today_start = day_bucket(now);
        let yesterday_start = today_start - DAY_MS;
        let current_hour = (now - today_start) / HOUR_MS;

        let mut today = self
            .day_metrics(source_id, today_start)
            .await?
            .unwrap_or_default();
        let mut yesterday = self
            .day_metrics(source_id, yesterday_start)
            .await?
            .unwrap_or_default();

        // Real-time tail straight from raw rows, layered over aggregate
        // history
        today.realtime_ops = self.recent_requests(source_id, now - 60_000).await? as f64 / 60.0;
        today.peak_ops =
            self.peak_hourly_requests(source_id, today_start, today_start + DAY_MS).await? as f64
                / 3600.0;
        yesterday.peak_ops = self
            .peak_hourly_requests(source_id, yesterday_start, today_start)
            .await? as f64
            / 3600.0;

        let yesterday_now = self
            .hour_range_metrics(
                source_id,
                yesterday_start,
                yesterday_start + current_hour * HOUR_MS,
            )
            .await?
            .unwrap_or_default();

        let factor = 24.0 / (current_hour.max(1) as f64);
        let predicted_today = MetricSet {
            hits: (today.hits as f64 * factor) as i64,
            pv: (today.pv as f64 * factor) as i64,
            uv: (today.uv as f64 * factor) as i64,
            status_2xx: (today.status_2xx as f64 * factor) as i64,
            status_3xx: (today.status_3xx as f64 * factor) as i64,
            status_4xx: (today.status_4xx as f64 * factor) as i64,
            status_5xx: (today.status_5xx as f64 * factor) as i64,
            realtime_ops: today.realtime_ops,
            peak_ops: today.peak_ops,
        };

        Ok(CoreMetrics {
            today,
            yesterday,
            yesterday_now,
            predicted_today,
        })
    }

    /// Tier chain for one day's metric set.
    async fn day_metrics(
        &self,
        source_id: i64,
        day_start: i64,
    ) -> Result<Option<MetricSet>, EngineError> {
        // Tier 1: dimensional daily aggregate
        if let Some(agg) = self.db.get_daily_aggregate(source_id, day_start).await? {
            return Ok(Some(MetricSet {
                hits: agg.total_requests,
                pv: agg.page_views,
                uv: agg.unique_ips,
                status_2xx: agg.status_2xx,
                status_3xx: agg.status_3xx,
                status_4xx: agg.status_4xx,
                status_5xx: agg.status_5xx,
                ..Default::default()
            }));
        }

        // Tier 2: legacy flat aggregate (no page-view distinction there)
        if self.db.table_exists("daily_stats").await {
            let row: Option<(i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
                "SELECT total_requests, unique_visitors, status_2xx, status_3xx, status_4xx, status_5xx \
                 FROM daily_stats WHERE source_id = ? AND bucket_ms = ?",
            )
            .bind(source_id)
            .bind(day_start)
            .fetch_optional(self.db.pool())
            .await?;
            if let Some((hits, uv, s2, s3, s4, s5)) = row {
                return Ok(Some(MetricSet {
                    hits,
                    pv: hits,
                    uv,
                    status_2xx: s2,
                    status_3xx: s3,
                    status_4xx: s4,
                    status_5xx: s5,
                    ..Default::default()
                }));
            }
        }

        // Tier 3: live aggregation over raw rows
        match self.raw_tier(source_id, day_start, day_start + DAY_MS).await? {
            Some(RawTier::Fact) => {
                let (hits, pv, uv, s2, s3, s4, s5): (i64, i64, i64, i64, i64, i64, i64) =
                    sqlx::query_as(
                        r#"
                        SELECT COUNT(*),
                               COALESCE(SUM(is_page_view), 0),
                               COUNT(DISTINCT ip_id),
                               COALESCE(SUM(CASE WHEN status BETWEEN 200 AND 299 THEN 1 ELSE 0 END), 0),
                               COALESCE(SUM(CASE WHEN status BETWEEN 300 AND 399 THEN 1 ELSE 0 END), 0),
                               COALESCE(SUM(CASE WHEN status BETWEEN 400 AND 499 THEN 1 ELSE 0 END), 0),
                               COALESCE(SUM(CASE WHEN status >= 500 THEN 1 ELSE 0 END), 0)
                        FROM fact_requests
                        WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                        "#,
                    )
                    .bind(source_id)
                    .bind(day_start)
                    .bind(day_start + DAY_MS)
                    .fetch_one(self.db.pool())
                    .await?;
                Ok(Some(MetricSet {
                    hits,
                    pv,
                    uv,
                    status_2xx: s2,
                    status_3xx: s3,
                    status_4xx: s4,
                    status_5xx: s5,
                    ..Default::default()
                }))
            }
            Some(RawTier::Legacy) => {
                let (hits, uv, s2, s3, s4, s5): (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
                    r#"
                    SELECT COUNT(*),
                           COUNT(DISTINCT remote_addr),
                           COALESCE(SUM(CASE WHEN status BETWEEN 200 AND 299 THEN 1 ELSE 0 END), 0),
                           COALESCE(SUM(CASE WHEN status BETWEEN 300 AND 399 THEN 1 ELSE 0 END), 0),
                           COALESCE(SUM(CASE WHEN status BETWEEN 400 AND 499 THEN 1 ELSE 0 END), 0),
                           COALESCE(SUM(CASE WHEN status >= 500 THEN 1 ELSE 0 END), 0)
                    FROM access_logs
                    WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                    "#,
                )
                .bind(source_id)
                .bind(day_start)
                .bind(day_start + DAY_MS)
                .fetch_one(self.db.pool())
                .await?;
                Ok(Some(MetricSet {
                    hits,
                    pv: hits,
                    uv,
                    status_2xx: s2,
                    status_3xx: s3,
                    status_4xx: s4,
                    status_5xx: s5,
                    ..Default::default()
                }))
            }
            None => Ok(None),
        }
    }

    /// Sum of hourly metrics over `[start, end)`, via the tier chain.
    async fn hour_range_metrics(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Result<Option<MetricSet>, EngineError> {
        // Tier 1: dimensional hourly aggregates
        let rows = self.db.hourly_aggregates(source_id, start, end).await?;
        if !rows.is_empty() {
            let mut ms = MetricSet::default();
            for r in &rows {
                ms.hits += r.total_requests;
                ms.pv += r.page_views;
                // summing bucket UVs over-counts repeat visitors; accepted
                // as the aggregate-tier approximation
                ms.uv += r.unique_ips;
                ms.status_2xx += r.status_2xx;
                ms.status_3xx += r.status_3xx;
                ms.status_4xx += r.status_4xx;
                ms.status_5xx += r.status_5xx;
            }
            return Ok(Some(ms));
        }

        // Tier 2: legacy hourly stats
        if self.db.table_exists("hourly_stats").await {
            let row: Option<(i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
                r#"
                SELECT SUM(total_requests), SUM(unique_visitors), SUM(status_2xx),
                       SUM(status_3xx), SUM(status_4xx), SUM(status_5xx)
                FROM hourly_stats
                WHERE source_id = ? AND bucket_ms >= ? AND bucket_ms < ?
                GROUP BY source_id
                "#,
            )
            .bind(source_id)
            .bind(start)
            .bind(end)
            .fetch_optional(self.db.pool())
            .await?;
            if let Some((hits, uv, s2, s3, s4, s5)) = row {
                return Ok(Some(MetricSet {
                    hits,
                    pv: hits,
                    uv,
                    status_2xx: s2,
                    status_3xx: s3,
                    status_4xx: s4,
                    status_5xx: s5,
                    ..Default::default()
                }));
            }
        }

        Ok(None)
    }

    async fn recent_requests(&self, source_id: i64, since_ms: i64) -> Result<i64, EngineError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM fact_requests WHERE source_id = ? AND ts_ms >= ?")
                .bind(source_id)
                .bind(since_ms)
                .fetch_one(self.db.pool())
                .await?;
        if count > 0 || !self.db.table_exists("access_logs").await {
            return Ok(count);
        }
        let (legacy,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM access_logs WHERE source_id = ? AND ts_ms >= ?")
                .bind(source_id)
                .bind(since_ms)
                .fetch_one(self.db.pool())
                .await?;
        Ok(legacy)
    }

    async fn peak_hourly_requests(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Result<i64, EngineError> {
        let (max,): (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(total_requests) FROM agg_hourly \
             WHERE source_id = ? AND bucket_ms >= ? AND bucket_ms < ?",
        )
        .bind(source_id)
        .bind(start)
        .bind(end)
        .fetch_one(self.db.pool())
        .await?;
        Ok(max.unwrap_or(0))
    }

    // ======================================================================
    // trends
    // ======================================================================

    /// Per-hour trend for one day (zero-filled up to the current hour when
    /// the day is today) or per-day trend over the trailing 30 days.
    pub async fn overview_trend(
        &self,
        source_id: i64,
        mode: TrendMode,
        date: Option<NaiveDate>,
    ) -> Vec<TrendPoint> {
        let result = match mode {
            TrendMode::Hourly => self.hourly_trend(source_id, date).await,
            TrendMode::Daily => self.daily_trend(source_id).await,
        };
        match result {
            Ok(points) => points,
            Err(e) => {
                warn!(source_id, error = %e, "trend degraded to empty");
                Vec::new()
            }
        }
    }

    async fn hourly_trend(
        &self,
        source_id: i64,
        date: Option<NaiveDate>,
    ) -> Result<Vec<TrendPoint>, EngineError> {
        let now = now_ms();
        let today_start = day_bucket(now);
        let day_start = match date {
            Some(d) => Utc
                .from_utc_datetime(&d.and_time(NaiveTime::MIN))
                .timestamp_millis(),
            None => today_start,
        };
        let day_end = day_start + DAY_MS;

        let buckets = self
            .hourly_trend_buckets(source_id, day_start, day_end)
            .await?
            .unwrap_or_default();

        let max_hour = if day_start == today_start {
            (now - today_start) / HOUR_MS
        } else {
            23
        };

        let mut points = Vec::with_capacity(max_hour as usize + 1);
        for h in 0..=max_hour {
            let bucket = day_start + h * HOUR_MS;
            let (pv, uv) = buckets
                .iter()
                .find(|(b, _, _)| *b == bucket)
                .map(|(_, pv, uv)| (*pv, *uv))
                .unwrap_or((0, 0));
            points.push(TrendPoint {
                label: format!("{h:02}:00"),
                pv,
                uv,
            });
        }
        Ok(points)
    }

    /// Tier chain producing (bucket, pv, uv) triples for one day's hours.
    /// `None` means no tier holds data for the day.
    async fn hourly_trend_buckets(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Result<Option<Vec<(i64, i64, i64)>>, EngineError> {
        // Tier 1: dimensional hourly aggregates
        let rows = self.db.hourly_aggregates(source_id, start, end).await?;
        if !rows.is_empty() {
            return Ok(Some(
                rows.into_iter()
                    .map(|r| (r.bucket_ms, r.page_views, r.unique_ips))
                    .collect(),
            ));
        }

        // Tier 2: legacy hourly stats
        if self.db.table_exists("hourly_stats").await {
            let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
                "SELECT bucket_ms, total_requests, unique_visitors FROM hourly_stats \
                 WHERE source_id = ? AND bucket_ms >= ? AND bucket_ms < ? ORDER BY bucket_ms",
            )
            .bind(source_id)
            .bind(start)
            .bind(end)
            .fetch_all(self.db.pool())
            .await?;
            if !rows.is_empty() {
                return Ok(Some(rows));
            }
        }

        // Tier 3: live aggregation over raw rows
        match self.raw_tier(source_id, start, end).await? {
            Some(RawTier::Fact) => {
                let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
                    r#"
                    SELECT (ts_ms / 3600000) * 3600000 AS bucket, COUNT(*), COUNT(DISTINCT ip_id)
                    FROM fact_requests
                    WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                    GROUP BY bucket ORDER BY bucket
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_all(self.db.pool())
                .await?;
                Ok(Some(rows))
            }
            Some(RawTier::Legacy) => {
                let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
                    r#"
                    SELECT (ts_ms / 3600000) * 3600000 AS bucket, COUNT(*), COUNT(DISTINCT remote_addr)
                    FROM access_logs
                    WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                    GROUP BY bucket ORDER BY bucket
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_all(self.db.pool())
                .await?;
                Ok(Some(rows))
            }
            None => Ok(None),
        }
    }

    async fn daily_trend(&self, source_id: i64) -> Result<Vec<TrendPoint>, EngineError> {
        let end = day_bucket(now_ms()) + DAY_MS;
        let start = end - 30 * DAY_MS;

        // Tier 1: dimensional daily aggregates
        let rows = self.db.daily_aggregates(source_id, start, end).await?;
        if !rows.is_empty() {
            return Ok(rows
                .into_iter()
                .map(|r| TrendPoint {
                    label: day_label(r.bucket_ms),
                    pv: r.page_views,
                    uv: r.unique_ips,
                })
                .collect());
        }

        // Tier 2: legacy daily stats
        if self.db.table_exists("daily_stats").await {
            let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
                "SELECT bucket_ms, total_requests, unique_visitors FROM daily_stats \
                 WHERE source_id = ? AND bucket_ms >= ? AND bucket_ms < ? ORDER BY bucket_ms",
            )
            .bind(source_id)
            .bind(start)
            .bind(end)
            .fetch_all(self.db.pool())
            .await?;
            if !rows.is_empty() {
                return Ok(rows
                    .into_iter()
                    .map(|(bucket, pv, uv)| TrendPoint {
                        label: day_label(bucket),
                        pv,
                        uv,
                    })
                    .collect());
            }
        }

        // Tier 3: live aggregation over raw rows
        let raw = match self.raw_tier(source_id, start, end).await? {
            Some(RawTier::Fact) => {
                sqlx::query_as::<_, (i64, i64, i64)>(
                    r#"
                    SELECT (ts_ms / 86400000) * 86400000 AS bucket, COUNT(*), COUNT(DISTINCT ip_id)
                    FROM fact_requests
                    WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                    GROUP BY bucket ORDER BY bucket
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_all(self.db.pool())
                .await?
            }
            Some(RawTier::Legacy) => {
                sqlx::query_as::<_, (i64, i64, i64)>(
                    r#"
                    SELECT (ts_ms / 86400000) * 86400000 AS bucket, COUNT(*), COUNT(DISTINCT remote_addr)
                    FROM access_logs
                    WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                    GROUP BY bucket ORDER BY bucket
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_all(self.db.pool())
                .await?
            }
            None => Vec::new(),
        };
        Ok(raw
            .into_iter()
            .map(|(bucket, pv, uv)| TrendPoint {
                label: day_label(bucket),
                pv,
                uv,
            })
            .collect())
    }

    // ======================================================================
    // visitors
    // ======================================================================

    /// New vs. returning visitors for today and yesterday. A visitor is
    /// returning when their identity appears in any row before the day's
    /// start.
    pub async fn new_vs_returning(&self, source_id: i64) -> VisitorComparison {
        match self.new_vs_returning_inner(source_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(source_id, error = %e, "visitor comparison degraded to defaults");
                VisitorComparison::default()
            }
        }
    }

    async fn new_vs_returning_inner(
        &self,
        source_id: i64,
    ) -> Result<VisitorComparison, EngineError> {
        let today_start = day_bucket(now_ms());
        let yesterday_start = today_start - DAY_MS;

        let (today_new, today_ret) = self
            .visitor_split(source_id, today_start, today_start + DAY_MS)
            .await?;
        let (yest_new, yest_ret) = self
            .visitor_split(source_id, yesterday_start, today_start)
            .await?;

        let mut vc = VisitorComparison {
            today_new,
            today_returning: today_ret,
            yesterday_new: yest_new,
            yesterday_returning: yest_ret,
            ..Default::default()
        };
        let today_total = today_new + today_ret;
        if today_total > 0 {
            vc.today_new_pct = today_new as f64 / today_total as f64 * 100.0;
            vc.today_returning_pct = today_ret as f64 / today_total as f64 * 100.0;
        }
        let yest_total = yest_new + yest_ret;
        if yest_total > 0 {
            vc.yesterday_new_pct = yest_new as f64 / yest_total as f64 * 100.0;
            vc.yesterday_returning_pct = yest_ret as f64 / yest_total as f64 * 100.0;
        }
        Ok(vc)
    }

    async fn visitor_split(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Result<(i64, i64), EngineError> {
        match self.raw_tier(source_id, start, end).await? {
            Some(RawTier::Fact) => {
                let (uv,): (i64,) = sqlx::query_as(
                    "SELECT COUNT(DISTINCT ip_id) FROM fact_requests \
                     WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?",
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_one(self.db.pool())
                .await?;
                let (returning,): (i64,) = sqlx::query_as(
                    r#"
                    SELECT COUNT(DISTINCT ip_id) FROM fact_requests
                    WHERE source_id = ? AND ts_ms < ? AND ip_id IN (
                        SELECT DISTINCT ip_id FROM fact_requests
                        WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                    )
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_one(self.db.pool())
                .await?;
                Ok(((uv - returning).max(0), returning))
            }
            Some(RawTier::Legacy) => {
                let (uv,): (i64,) = sqlx::query_as(
                    "SELECT COUNT(DISTINCT remote_addr) FROM access_logs \
                     WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?",
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_one(self.db.pool())
                .await?;
                let (returning,): (i64,) = sqlx::query_as(
                    r#"
                    SELECT COUNT(DISTINCT remote_addr) FROM access_logs
                    WHERE source_id = ? AND ts_ms < ? AND remote_addr IN (
                        SELECT DISTINCT remote_addr FROM access_logs
                        WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                    )
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_one(self.db.pool())
                .await?;
                Ok(((uv - returning).max(0), returning))
            }
            None => Ok((0, 0)),
        }
    }

    /// Distinct client identities within the trailing `minutes`.
    pub async fn active_visitors(&self, source_id: i64, minutes: i64) -> i64 {
        let since = now_ms() - minutes * 60_000;
        let result = async {
            match self.raw_tier(source_id, since, now_ms() + 1).await? {
                Some(RawTier::Fact) => {
                    let (uv,): (i64,) = sqlx::query_as(
                        "SELECT COUNT(DISTINCT ip_id) FROM fact_requests \
                         WHERE source_id = ? AND ts_ms >= ?",
                    )
                    .bind(source_id)
                    .bind(since)
                    .fetch_one(self.db.pool())
                    .await?;
                    Ok::<i64, EngineError>(uv)
                }
                Some(RawTier::Legacy) => {
                    let (uv,): (i64,) = sqlx::query_as(
                        "SELECT COUNT(DISTINCT remote_addr) FROM access_logs \
                         WHERE source_id = ? AND ts_ms >= ?",
                    )
                    .bind(source_id)
                    .bind(since)
                    .fetch_one(self.db.pool())
                    .await?;
                    Ok(uv)
                }
                None => Ok(0),
            }
        }
        .await;
        match result {
            Ok(v) => v,
            Err(e) => {
                warn!(source_id, error = %e, "active visitors degraded to zero");
                0
            }
        }
    }

    // ======================================================================
    // rankings
    // ======================================================================

    /// Most requested pages (page views only) in a window.
    pub async fn top_pages(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
        limit: i64,
    ) -> Vec<PageCount> {
        match self.top_pages_inner(source_id, start, end, limit).await {
            Ok(v) => v,
            Err(e) => {
                warn!(source_id, error = %e, "top pages degraded to empty");
                Vec::new()
            }
        }
    }

    async fn top_pages_inner(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
        limit: i64,
    ) -> Result<Vec<PageCount>, EngineError> {
        match self.raw_tier(source_id, start, end).await? {
            Some(RawTier::Fact) => {
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    r#"
                    SELECT u.url_normalized, COUNT(*) AS count
                    FROM fact_requests f
                    JOIN dim_url u ON f.url_id = u.id
                    WHERE f.source_id = ? AND f.ts_ms >= ? AND f.ts_ms < ? AND f.is_page_view = 1
                    GROUP BY u.url_normalized
                    ORDER BY count DESC
                    LIMIT ?
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(path, count)| PageCount { path, count })
                    .collect())
            }
            Some(RawTier::Legacy) => {
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    r#"
                    SELECT uri, COUNT(*) AS count FROM access_logs
                    WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                    GROUP BY uri ORDER BY count DESC LIMIT ?
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(path, count)| PageCount { path, count })
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Entry pages: for each distinct visitor, the destination of their
    /// earliest page view in the window, ranked by how many visitors entered
    /// there.
    pub async fn top_entry_pages(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
        limit: i64,
    ) -> Vec<PageCount> {
        match self.top_entry_pages_inner(source_id, start, end, limit).await {
            Ok(v) => v,
            Err(e) => {
                warn!(source_id, error = %e, "entry pages degraded to empty");
                Vec::new()
            }
        }
    }

    async fn top_entry_pages_inner(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
        limit: i64,
    ) -> Result<Vec<PageCount>, EngineError> {
        match self.raw_tier(source_id, start, end).await? {
            Some(RawTier::Fact) => {
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    r#"
                    SELECT u.url_normalized, COUNT(*) AS count
                    FROM (
                        SELECT f.url_id
                        FROM fact_requests f
                        JOIN (
                            SELECT ip_id, MIN(ts_ms) AS min_ts
                            FROM fact_requests
                            WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ? AND is_page_view = 1
                            GROUP BY ip_id
                        ) first_pv ON f.ip_id = first_pv.ip_id AND f.ts_ms = first_pv.min_ts
                        WHERE f.source_id = ? AND f.is_page_view = 1
                    ) entries
                    JOIN dim_url u ON u.id = entries.url_id
                    GROUP BY u.url_normalized
                    ORDER BY count DESC
                    LIMIT ?
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .bind(source_id)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(path, count)| PageCount { path, count })
                    .collect())
            }
            Some(RawTier::Legacy) => {
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    r#"
                    SELECT sub.uri, COUNT(*) AS count
                    FROM (
                        SELECT a.uri
                        FROM access_logs a
                        JOIN (
                            SELECT remote_addr, MIN(ts_ms) AS min_ts
                            FROM access_logs
                            WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                            GROUP BY remote_addr
                        ) first_req ON a.remote_addr = first_req.remote_addr
                                   AND a.ts_ms = first_req.min_ts
                        WHERE a.source_id = ?
                    ) sub
                    GROUP BY sub.uri
                    ORDER BY count DESC
                    LIMIT ?
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .bind(source_id)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(path, count)| PageCount { path, count })
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Referring domains ranked by distinct visitors.
    pub async fn top_referers(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
        limit: i64,
    ) -> Vec<RefererCount> {
        match self.top_referers_inner(source_id, start, end, limit).await {
            Ok(v) => v,
            Err(e) => {
                warn!(source_id, error = %e, "top referers degraded to empty");
                Vec::new()
            }
        }
    }

    async fn top_referers_inner(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
        limit: i64,
    ) -> Result<Vec<RefererCount>, EngineError> {
        match self.raw_tier(source_id, start, end).await? {
            Some(RawTier::Fact) => {
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    r#"
                    SELECT r.referer_domain, COUNT(DISTINCT f.ip_id) AS visitors
                    FROM fact_requests f
                    JOIN dim_referer r ON f.referer_id = r.id
                    WHERE f.source_id = ? AND f.ts_ms >= ? AND f.ts_ms < ?
                      AND r.referer_domain != ''
                    GROUP BY r.referer_domain
                    ORDER BY visitors DESC
                    LIMIT ?
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(domain, visitors)| RefererCount { domain, visitors })
                    .collect())
            }
            Some(RawTier::Legacy) => {
                // Legacy rows store the raw referer URL; pull extra rows,
                // merge by domain in memory, then cut to the limit.
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    r#"
                    SELECT referer, COUNT(DISTINCT remote_addr) AS visitors
                    FROM access_logs
                    WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ? AND referer != ''
                    GROUP BY referer
                    ORDER BY visitors DESC
                    LIMIT ?
                    "#,
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .bind(limit * 3)
                .fetch_all(self.db.pool())
                .await?;

                let mut by_domain: Vec<(String, i64)> = Vec::new();
                for (referer, visitors) in rows {
                    let domain = referer_domain(&referer);
                    if domain.is_empty() {
                        continue;
                    }
                    match by_domain.iter_mut().find(|(d, _)| *d == domain) {
                        Some((_, v)) => *v += visitors,
                        None => by_domain.push((domain, visitors)),
                    }
                }
                by_domain.sort_by(|a, b| b.1.cmp(&a.1));
                Ok(by_domain
                    .into_iter()
                    .take(limit as usize)
                    .map(|(domain, visitors)| RefererCount { domain, visitors })
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Busiest client addresses with their geo attribution.
    pub async fn top_ips(&self, source_id: i64, start: i64, end: i64, limit: i64) -> Vec<IpStat> {
        match self.top_ips_inner(source_id, start, end, limit).await {
            Ok(v) => v,
            Err(e) => {
                warn!(source_id, error = %e, "top ips degraded to empty");
                Vec::new()
            }
        }
    }

    async fn top_ips_inner(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
        limit: i64,
    ) -> Result<Vec<IpStat>, EngineError> {
        match self.raw_tier(source_id, start, end).await? {
            Some(RawTier::Fact) => Ok(sqlx::query_as::<_, IpStat>(
                r#"
                SELECT i.ip_address AS addr, i.country, i.city, COUNT(*) AS count
                FROM fact_requests f
                JOIN dim_ip i ON f.ip_id = i.id
                WHERE f.source_id = ? AND f.ts_ms >= ? AND f.ts_ms < ?
                GROUP BY i.ip_address, i.country, i.city
                ORDER BY count DESC
                LIMIT ?
                "#,
            )
            .bind(source_id)
            .bind(start)
            .bind(end)
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?),
            Some(RawTier::Legacy) => Ok(sqlx::query_as::<_, IpStat>(
                r#"
                SELECT remote_addr AS addr, country, '' AS city, COUNT(*) AS count
                FROM access_logs
                WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
                GROUP BY remote_addr, country
                ORDER BY count DESC
                LIMIT ?
                "#,
            )
            .bind(source_id)
            .bind(start)
            .bind(end)
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?),
            None => Ok(Vec::new()),
        }
    }

    /// Request share by country ("country" level) or province.
    pub async fn geo_distribution(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
        level: &str,
    ) -> Vec<GeoStat> {
        let column = if level == "province" {
            "province"
        } else {
            "country"
        };
        let result = async {
            match self.raw_tier(source_id, start, end).await? {
                Some(RawTier::Fact) => {
                    let sql = format!(
                        "SELECT i.{column}, COUNT(*) FROM fact_requests f \
                         JOIN dim_ip i ON f.ip_id = i.id \
                         WHERE f.source_id = ? AND f.ts_ms >= ? AND f.ts_ms < ? AND i.{column} != '' \
                         GROUP BY i.{column} ORDER BY COUNT(*) DESC"
                    );
                    Ok::<Vec<(String, i64)>, EngineError>(
                        sqlx::query_as(&sql)
                            .bind(source_id)
                            .bind(start)
                            .bind(end)
                            .fetch_all(self.db.pool())
                            .await?,
                    )
                }
                Some(RawTier::Legacy) => Ok(sqlx::query_as(
                    "SELECT country, COUNT(*) FROM access_logs \
                     WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ? AND country != '' \
                     GROUP BY country ORDER BY COUNT(*) DESC",
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_all(self.db.pool())
                .await?),
                None => Ok(Vec::new()),
            }
        }
        .await;

        match result {
            Ok(rows) => with_percentages(rows)
                .into_iter()
                .map(|(name, count, percent)| GeoStat {
                    name,
                    count,
                    percent,
                })
                .collect(),
            Err(e) => {
                warn!(source_id, error = %e, "geo distribution degraded to empty");
                Vec::new()
            }
        }
    }

    /// Request share by device type.
    pub async fn device_distribution(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Vec<DeviceStat> {
        let result = async {
            match self.raw_tier(source_id, start, end).await? {
                Some(RawTier::Fact) => Ok::<Vec<(String, i64)>, EngineError>(
                    sqlx::query_as(
                        "SELECT a.device_type, COUNT(*) FROM fact_requests f \
                         JOIN dim_user_agent a ON f.ua_id = a.id \
                         WHERE f.source_id = ? AND f.ts_ms >= ? AND f.ts_ms < ? \
                         GROUP BY a.device_type ORDER BY COUNT(*) DESC",
                    )
                    .bind(source_id)
                    .bind(start)
                    .bind(end)
                    .fetch_all(self.db.pool())
                    .await?,
                ),
                Some(RawTier::Legacy) => Ok(sqlx::query_as(
                    "SELECT device_type, COUNT(*) FROM access_logs \
                     WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ? AND device_type != '' \
                     GROUP BY device_type ORDER BY COUNT(*) DESC",
                )
                .bind(source_id)
                .bind(start)
                .bind(end)
                .fetch_all(self.db.pool())
                .await?),
                None => Ok(Vec::new()),
            }
        }
        .await;

        match result {
            Ok(rows) => with_percentages(rows)
                .into_iter()
                .map(|(device_type, count, percent)| DeviceStat {
                    device_type,
                    count,
                    percent,
                })
                .collect(),
            Err(e) => {
                warn!(source_id, error = %e, "device distribution degraded to empty");
                Vec::new()
            }
        }
    }

    // ======================================================================
    // listings & reports
    // ======================================================================

    /// Paginated fact listing joined with dimensions.
    pub async fn list_requests(
        &self,
        source_id: i64,
        page: i64,
        page_size: i64,
        filter: &LogFilter,
    ) -> (Vec<RequestView>, i64) {
        match self
            .list_requests_inner(source_id, page, page_size, filter)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(source_id, error = %e, "request listing degraded to empty");
                (Vec::new(), 0)
            }
        }
    }

    async fn list_requests_inner(
        &self,
        source_id: i64,
        page: i64,
        page_size: i64,
        filter: &LogFilter,
    ) -> Result<(Vec<RequestView>, i64), EngineError> {
        const WHERE_CLAUSE: &str = r#"
            f.source_id = ?1
              AND (?2 IS NULL OR f.ts_ms >= ?2)
              AND (?3 IS NULL OR f.ts_ms < ?3)
              AND (?4 IS NULL OR f.status = ?4)
              AND (?5 IS NULL OR f.method = ?5)
              AND (?6 IS NULL OR u.host = ?6)
              AND (?7 IS NULL OR instr(i.ip_address, ?7) > 0)
              AND (?8 IS NULL OR instr(u.url_path, ?8) > 0)
        "#;

        let offset = (page.max(1) - 1) * page_size;
        let select = format!(
            r#"
            SELECT f.id, f.ts_ms,
                   COALESCE(i.ip_address, '') AS remote_addr,
                   COALESCE(i.country, '') AS country,
                   COALESCE(i.city, '') AS city,
                   f.method,
                   COALESCE(u.url_path, '') AS uri,
                   COALESCE(u.host, '') AS host,
                   f.protocol, f.status, f.body_bytes, f.request_time,
                   COALESCE(r.referer_url, '') AS referer,
                   COALESCE(a.browser, '') AS browser,
                   COALESCE(a.os, '') AS os,
                   COALESCE(a.device_type, '') AS device_type,
                   COALESCE(a.is_bot, 0) AS is_bot
            FROM fact_requests f
            LEFT JOIN dim_ip i ON f.ip_id = i.id
            LEFT JOIN dim_url u ON f.url_id = u.id
            LEFT JOIN dim_referer r ON f.referer_id = r.id
            LEFT JOIN dim_user_agent a ON f.ua_id = a.id
            WHERE {WHERE_CLAUSE}
            ORDER BY f.ts_ms DESC, f.id DESC
            LIMIT ?9 OFFSET ?10
            "#
        );

        let rows = sqlx::query_as::<_, RequestView>(&select)
            .bind(source_id)
            .bind(filter.start_ms)
            .bind(filter.end_ms)
            .bind(filter.status)
            .bind(filter.method.as_deref())
            .bind(filter.host.as_deref())
            .bind(filter.ip_contains.as_deref())
            .bind(filter.uri_contains.as_deref())
            .bind(page_size)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;

        let count_sql = format!(
            r#"
            SELECT COUNT(*)
            FROM fact_requests f
            LEFT JOIN dim_ip i ON f.ip_id = i.id
            LEFT JOIN dim_url u ON f.url_id = u.id
            WHERE {WHERE_CLAUSE}
            "#
        );
        let (total,): (i64,) = sqlx::query_as(&count_sql)
            .bind(source_id)
            .bind(filter.start_ms)
            .bind(filter.end_ms)
            .bind(filter.status)
            .bind(filter.method.as_deref())
            .bind(filter.host.as_deref())
            .bind(filter.ip_contains.as_deref())
            .bind(filter.uri_contains.as_deref())
            .fetch_one(self.db.pool())
            .await?;

        Ok((rows, total))
    }

    /// Daily rollup rows for a range, e.g. for report rendering; the JSON
    /// blobs carry the Top-N lists and the hourly sparkline.
    pub async fn daily_report(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Vec<DailyAggregate> {
        match self.db.daily_aggregates(source_id, start, end).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(source_id, error = %e, "daily report degraded to empty");
                Vec::new()
            }
        }
    }

    // ======================================================================
    // tier selection
    // ======================================================================

    /// Which raw table holds rows for the window: the fact table wins; the
    /// legacy flat table serves pre-dimensional installations. `None` means
    /// the window has no raw data anywhere.
    async fn raw_tier(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Result<Option<RawTier>, EngineError> {
        let (facts,): (i64,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM fact_requests WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?)",
        )
        .bind(source_id)
        .bind(start)
        .bind(end)
        .fetch_one(self.db.pool())
        .await?;
        if facts != 0 {
            return Ok(Some(RawTier::Fact));
        }

        if self.db.table_exists("access_logs").await {
            let (legacy,): (i64,) = sqlx::query_as(
                "SELECT EXISTS(SELECT 1 FROM access_logs WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?)",
            )
            .bind(source_id)
            .bind(start)
            .bind(end)
            .fetch_one(self.db.pool())
            .await?;
            if legacy != 0 {
                return Ok(Some(RawTier::Legacy));
            }
        }

        Ok(None)
    }
}

fn day_label(bucket_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(bucket_ms)
        .map(|d| d.format("%m-%d").to_string())
        .unwrap_or_default()
}

fn with_percentages(rows: Vec<(String, i64)>) -> Vec<(String, i64, f64)> {
    let total: i64 = rows.iter().map(|(_, c)| c).sum();
    rows.into_iter()
        .map(|(name, count)| {
            let percent = if total > 0 {
                count as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            (name, count, percent)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dimensions::DimensionStore;
    use crate::db::{legacy_fixture, FactRow, HourlyAggregate};
    use crate::ua::UaParser;

    const DAY: i64 = 1_754_524_800_000; // a fixed UTC midnight

    async fn insert_fact(
        db: &Database,
        dims: &DimensionStore,
        source_id: i64,
        ts_ms: i64,
        addr: &str,
        uri: &str,
        referer: &str,
    ) {
        let ua = UaParser::new();
        let ua_str = "Mozilla/5.0 (Windows NT 10.0) Chrome/126.0.0.0 Safari/537.36";
        let info = ua.parse(ua_str);
        db.insert_facts(&[FactRow {
            source_id,
            ts_ms,
            ip_id: dims.ip_id(addr).await.unwrap(),
            url_id: dims.url_id(uri, "example.com").await.unwrap(),
            referer_id: dims.referer_id(referer).await.unwrap(),
            ua_id: dims.ua_id(ua_str, &info).await.unwrap(),
            method: "GET".to_string(),
            protocol: "HTTP/1.1".to_string(),
            status: 200,
            body_bytes: 100,
            request_time: 0.01,
            upstream_time: 0.0,
            is_page_view: crate::parser::is_page_view(uri, 200),
        }])
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn legacy_only_trend_matches_legacy_rows() {
        let db = Database::open_in_memory().await.unwrap();
        legacy_fixture::install(&db).await;
        // three hits at 08:xx from two addresses, one hit at 09:xx
        for (minute, addr) in [(0, "1.1.1.1"), (10, "1.1.1.1"), (20, "2.2.2.2")] {
            legacy_fixture::insert_access_log(
                &db,
                1,
                DAY + 8 * HOUR_MS + minute * 60_000,
                addr,
                "GET",
                "/p",
                200,
                10,
                "",
            )
            .await;
        }
        legacy_fixture::insert_access_log(&db, 1, DAY + 9 * HOUR_MS, "3.3.3.3", "GET", "/q", 200, 10, "")
            .await;

        let q = QueryEngine::new(db);
        let date = DateTime::<Utc>::from_timestamp_millis(DAY).unwrap().date_naive();
        let points = q.overview_trend(1, TrendMode::Hourly, Some(date)).await;

        assert_eq!(points.len(), 24);
        assert_eq!(points[8], TrendPoint { label: "08:00".into(), pv: 3, uv: 2 });
        assert_eq!(points[9], TrendPoint { label: "09:00".into(), pv: 1, uv: 1 });
        assert_eq!(points[10].pv, 0);
    }

    #[tokio::test]
    async fn aggregate_tier_wins_over_raw_rows() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db.clone());
        insert_fact(&db, &dims, 1, DAY + HOUR_MS, "9.9.9.9", "/raw", "").await;
        // aggregate row with different numbers proves the chain stopped at
        // tier 1
        db.upsert_hourly(&HourlyAggregate {
            source_id: 1,
            bucket_ms: DAY + HOUR_MS,
            total_requests: 50,
            page_views: 40,
            unique_ips: 7,
            ..Default::default()
        })
        .await
        .unwrap();

        let q = QueryEngine::new(db);
        let date = DateTime::<Utc>::from_timestamp_millis(DAY).unwrap().date_naive();
        let points = q.overview_trend(1, TrendMode::Hourly, Some(date)).await;
        assert_eq!(points[1].pv, 40);
        assert_eq!(points[1].uv, 7);
    }

    #[tokio::test]
    async fn zero_valued_aggregate_is_data_not_missing() {
        let db = Database::open_in_memory().await.unwrap();
        legacy_fixture::install(&db).await;
        // legacy says 99; the populated-but-zero aggregate tier must win
        sqlx::query(
            "INSERT INTO hourly_stats (source_id, bucket_ms, total_requests, unique_visitors) \
             VALUES (1, ?, 99, 9)",
        )
        .bind(DAY + 2 * HOUR_MS)
        .execute(db.pool())
        .await
        .unwrap();
        db.upsert_hourly(&HourlyAggregate {
            source_id: 1,
            bucket_ms: DAY + 2 * HOUR_MS,
            total_requests: 0,
            page_views: 0,
            unique_ips: 0,
            ..Default::default()
        })
        .await
        .unwrap();

        let q = QueryEngine::new(db);
        let date = DateTime::<Utc>::from_timestamp_millis(DAY).unwrap().date_naive();
        let points = q.overview_trend(1, TrendMode::Hourly, Some(date)).await;
        assert_eq!(points[2].pv, 0);
        assert_eq!(points[2].uv, 0);
    }

    #[tokio::test]
    async fn new_vs_returning_splits_by_prior_sighting() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db.clone());
        let today = day_bucket(now_ms());

        // "old" appeared two days ago and again today; "fresh" only today
        insert_fact(&db, &dims, 1, today - 2 * DAY_MS, "10.0.0.1", "/a", "").await;
        insert_fact(&db, &dims, 1, today + 1000, "10.0.0.1", "/a", "").await;
        insert_fact(&db, &dims, 1, today + 2000, "77.77.77.77", "/b", "").await;

        let q = QueryEngine::new(db);
        let vc = q.new_vs_returning(1).await;
        assert_eq!(vc.today_returning, 1);
        assert_eq!(vc.today_new, 1);
        assert!((vc.today_new_pct - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn entry_pages_rank_first_page_view_destinations() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db.clone());
        // visitor A enters on /landing then browses; visitor B enters on
        // /landing too; visitor C enters on /other
        insert_fact(&db, &dims, 1, DAY + 100, "1.1.1.1", "/landing", "").await;
        insert_fact(&db, &dims, 1, DAY + 200, "1.1.1.1", "/deep", "").await;
        insert_fact(&db, &dims, 1, DAY + 300, "2.2.2.2", "/landing", "").await;
        insert_fact(&db, &dims, 1, DAY + 400, "3.3.3.3", "/other", "").await;

        let q = QueryEngine::new(db);
        let entries = q.top_entry_pages(1, DAY, DAY + DAY_MS, 10).await;
        assert_eq!(entries[0], PageCount { path: "/landing".into(), count: 2 });
        assert_eq!(entries[1], PageCount { path: "/other".into(), count: 1 });
    }

    #[tokio::test]
    async fn top_pages_count_page_views_only() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db.clone());
        insert_fact(&db, &dims, 1, DAY + 100, "1.1.1.1", "/page", "").await;
        insert_fact(&db, &dims, 1, DAY + 200, "1.1.1.1", "/page", "").await;
        insert_fact(&db, &dims, 1, DAY + 300, "1.1.1.1", "/style.css", "").await;

        let q = QueryEngine::new(db);
        let pages = q.top_pages(1, DAY, DAY + DAY_MS, 10).await;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0], PageCount { path: "/page".into(), count: 2 });
    }

    #[tokio::test]
    async fn top_referers_by_distinct_visitors() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db.clone());
        insert_fact(&db, &dims, 1, DAY + 100, "1.1.1.1", "/a", "https://www.google.com/s").await;
        insert_fact(&db, &dims, 1, DAY + 200, "2.2.2.2", "/a", "https://www.google.com/s").await;
        insert_fact(&db, &dims, 1, DAY + 300, "1.1.1.1", "/b", "https://news.site.org/x").await;

        let q = QueryEngine::new(db);
        let refs = q.top_referers(1, DAY, DAY + DAY_MS, 10).await;
        assert_eq!(refs[0], RefererCount { domain: "www.google.com".into(), visitors: 2 });
        assert_eq!(refs[1], RefererCount { domain: "news.site.org".into(), visitors: 1 });
    }

    #[tokio::test]
    async fn list_requests_applies_typed_filters() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db.clone());
        insert_fact(&db, &dims, 1, DAY + 100, "1.1.1.1", "/match/here", "").await;
        insert_fact(&db, &dims, 1, DAY + 200, "2.2.2.2", "/elsewhere", "").await;

        let q = QueryEngine::new(db);
        let filter = LogFilter {
            uri_contains: Some("match".to_string()),
            ..Default::default()
        };
        let (rows, total) = q.list_requests(1, 1, 50, &filter).await;
        assert_eq!(total, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uri, "/match/here");
        assert_eq!(rows[0].remote_addr, "1.1.1.1");

        let (all, all_total) = q.list_requests(1, 1, 50, &LogFilter::default()).await;
        assert_eq!(all_total, 2);
        assert_eq!(all.len(), 2);
        // newest first
        assert_eq!(all[0].uri, "/elsewhere");
    }

    #[tokio::test]
    async fn day_metrics_fall_back_to_legacy_aggregates() {
        let db = Database::open_in_memory().await.unwrap();
        legacy_fixture::install(&db).await;
        sqlx::query(
            "INSERT INTO daily_stats (source_id, bucket_ms, total_requests, unique_visitors, status_2xx) \
             VALUES (1, ?, 120, 30, 110)",
        )
        .bind(DAY)
        .execute(db.pool())
        .await
        .unwrap();

        let q = QueryEngine::new(db);
        let ms = q.day_metrics(1, DAY).await.unwrap().expect("tier data");
        assert_eq!(ms.hits, 120);
        assert_eq!(ms.uv, 30);
        assert_eq!(ms.status_2xx, 110);
    }

    #[tokio::test]
    async fn empty_window_reports_no_tier() {
        let db = Database::open_in_memory().await.unwrap();
        let q = QueryEngine::new(db);
        assert!(q.day_metrics(1, DAY).await.unwrap().is_none());
        let pages = q.top_pages(1, DAY, DAY + DAY_MS, 10).await;
        assert!(pages.is_empty());
    }
}
