//! Hourly/daily rollups
//!
//! `rollup` recomputes one aggregate row from the fact rows (or, for
//! pre-dimensional installations, the legacy flat rows) inside a bucket and
//! replaces the stored row via upsert. It never merges into an existing row,
//! so re-running a bucket — after a crash, concurrently with collection, or
//! twice in a row — produces the identical result.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{
    day_bucket, hour_bucket, DailyAggregate, Database, HourlyAggregate, DAY_MS, HOUR_MS,
};
use crate::error::EngineError;
use crate::parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    fn span_ms(&self) -> i64 {
        match self {
            Granularity::Hour => HOUR_MS,
            Granularity::Day => DAY_MS,
        }
    }

    fn align(&self, ts_ms: i64) -> i64 {
        match self {
            Granularity::Hour => hour_bucket(ts_ms),
            Granularity::Day => day_bucket(ts_ms),
        }
    }
}

/// Serialized shape of the Top-N blobs.
#[derive(Debug, Serialize)]
struct TopItem {
    name: String,
    value: i64,
}

/// One request's contribution to a bucket, independent of which tier it was
/// read from.
#[derive(Debug, sqlx::FromRow)]
struct BucketFact {
    ts_ms: i64,
    /// distinct-visitor key: surrogate ip id for fact rows, raw address for
    /// legacy rows
    ip_key: String,
    ip_addr: String,
    method: String,
    status: i64,
    body_bytes: i64,
    request_time: f64,
    is_page_view: bool,
    url: String,
    referer_domain: String,
    country: String,
    browser: String,
    device: String,
}

pub struct Aggregator {
    db: Database,
    top_n: usize,
}

impl Aggregator {
    pub fn new(db: Database, top_n: usize) -> Self {
        Self { db, top_n }
    }

    /// Recompute and replace the aggregate row covering `bucket_ms`
    /// (aligned down to the granularity).
    pub async fn rollup(
        &self,
        source_id: i64,
        bucket_ms: i64,
        granularity: Granularity,
    ) -> Result<(), EngineError> {
        let start = granularity.align(bucket_ms);
        self.rollup_inner(source_id, start, granularity)
            .await
            .map_err(|e| EngineError::Aggregation {
                bucket_ms: start,
                source: Box::new(e),
            })
    }

    async fn rollup_inner(
        &self,
        source_id: i64,
        start: i64,
        granularity: Granularity,
    ) -> Result<(), EngineError> {
        let end = start + granularity.span_ms();

        let mut facts = self.load_fact_rows(source_id, start, end).await?;
        if facts.is_empty() && self.db.table_exists("access_logs").await {
            facts = self.load_legacy_rows(source_id, start, end).await?;
        }

        let accum = Accum::collect(start, &facts);
        debug!(
            source_id,
            bucket_ms = start,
            rows = facts.len(),
            "rolled up bucket"
        );

        match granularity {
            Granularity::Hour => self.db.upsert_hourly(&accum.into_hourly(source_id, start)).await,
            Granularity::Day => {
                self.db
                    .upsert_daily(&accum.into_daily(source_id, start, self.top_n))
                    .await
            }
        }
    }

    async fn load_fact_rows(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Result<Vec<BucketFact>, EngineError> {
        Ok(sqlx::query_as::<_, BucketFact>(
            r#"
            SELECT f.ts_ms,
                   CAST(f.ip_id AS TEXT) AS ip_key,
                   COALESCE(i.ip_address, '') AS ip_addr,
                   f.method, f.status, f.body_bytes, f.request_time,
                   f.is_page_view,
                   COALESCE(u.url_normalized, '') AS url,
                   COALESCE(r.referer_domain, '') AS referer_domain,
                   COALESCE(i.country, '') AS country,
                   COALESCE(a.browser, '') AS browser,
                   COALESCE(a.device_type, '') AS device
            FROM fact_requests f
            LEFT JOIN dim_ip i ON f.ip_id = i.id
            LEFT JOIN dim_url u ON f.url_id = u.id
            LEFT JOIN dim_referer r ON f.referer_id = r.id
            LEFT JOIN dim_user_agent a ON f.ua_id = a.id
            WHERE f.source_id = ? AND f.ts_ms >= ? AND f.ts_ms < ?
            ORDER BY f.ts_ms ASC, f.id ASC
            "#,
        )
        .bind(source_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.db.pool())
        .await?)
    }

    /// Legacy flat rows carry the raw strings inline; derive what the star
    /// schema stores in dimensions.
    async fn load_legacy_rows(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Result<Vec<BucketFact>, EngineError> {
        #[derive(sqlx::FromRow)]
        struct LegacyRow {
            ts_ms: i64,
            remote_addr: String,
            method: String,
            uri: String,
            status: i64,
            body_bytes: i64,
            referer: String,
            request_time: f64,
            country: String,
            browser: String,
            device_type: String,
        }

        let rows = sqlx::query_as::<_, LegacyRow>(
            r#"
            SELECT ts_ms, remote_addr, method, uri, status, body_bytes,
                   referer, request_time, country, browser, device_type
            FROM access_logs
            WHERE source_id = ? AND ts_ms >= ? AND ts_ms < ?
            ORDER BY ts_ms ASC, id ASC
            "#,
        )
        .bind(source_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| BucketFact {
                ts_ms: r.ts_ms,
                ip_key: r.remote_addr.clone(),
                ip_addr: r.remote_addr,
                method: r.method,
                status: r.status,
                body_bytes: r.body_bytes,
                request_time: r.request_time,
                is_page_view: parser::is_page_view(&r.uri, r.status),
                url: parser::normalize_url(&r.uri),
                referer_domain: parser::referer_domain(&r.referer),
                country: r.country,
                browser: r.browser,
                device: r.device_type,
            })
            .collect())
    }
}

/// Frequency map that remembers first-seen order so Top-N ties rank by
/// earliest appearance.
#[derive(Default)]
struct CountMap {
    counts: HashMap<String, (i64, usize)>,
    next_order: usize,
}

impl CountMap {
    fn bump(&mut self, key: &str) {
        if key.is_empty() {
            return;
        }
        match self.counts.get_mut(key) {
            Some((count, _)) => *count += 1,
            None => {
                self.counts
                    .insert(key.to_string(), (1, self.next_order));
                self.next_order += 1;
            }
        }
    }

    fn top(&self, n: usize) -> Vec<TopItem> {
        let mut entries: Vec<(&String, &(i64, usize))> = self.counts.iter().collect();
        entries.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        entries
            .into_iter()
            .take(n)
            .map(|(name, (count, _))| TopItem {
                name: name.clone(),
                value: *count,
            })
            .collect()
    }

    fn top_json(&self, n: usize) -> String {
        serde_json::to_string(&self.top(n)).unwrap_or_else(|_| "[]".to_string())
    }
}

#[derive(Default)]
struct Accum {
    total: i64,
    page_views: i64,
    bytes: i64,
    ips: HashSet<String>,
    status_2xx: i64,
    status_3xx: i64,
    status_4xx: i64,
    status_5xx: i64,
    time_sum: f64,
    time_min: f64,
    time_max: f64,
    // BTreeMap keeps the serialized distribution byte-stable across runs
    methods: BTreeMap<String, i64>,
    urls: CountMap,
    top_ips: CountMap,
    referers: CountMap,
    countries: CountMap,
    browsers: CountMap,
    devices: CountMap,
    hourly: [i64; 24],
}

impl Accum {
    fn collect(bucket_start: i64, facts: &[BucketFact]) -> Self {
        let mut a = Accum::default();
        for f in facts {
            a.total += 1;
            a.bytes += f.body_bytes;
            a.ips.insert(f.ip_key.clone());
            if f.is_page_view {
                a.page_views += 1;
            }

            match f.status {
                200..=299 => a.status_2xx += 1,
                300..=399 => a.status_3xx += 1,
                400..=499 => a.status_4xx += 1,
                s if s >= 500 => a.status_5xx += 1,
                _ => {}
            }

            a.time_sum += f.request_time;
            if f.request_time > a.time_max {
                a.time_max = f.request_time;
            }
            if a.time_min == 0.0 || (f.request_time > 0.0 && f.request_time < a.time_min) {
                a.time_min = f.request_time;
            }

            *a.methods.entry(f.method.clone()).or_insert(0) += 1;
            a.urls.bump(&f.url);
            a.top_ips.bump(&f.ip_addr);
            a.referers.bump(&f.referer_domain);
            a.countries.bump(&f.country);
            a.browsers.bump(&f.browser);
            a.devices.bump(&f.device);

            let hour_idx = ((f.ts_ms - bucket_start) / HOUR_MS) as usize;
            if hour_idx < 24 {
                a.hourly[hour_idx] += 1;
            }
        }
        a
    }

    fn avg(&self) -> f64 {
        if self.total > 0 {
            self.time_sum / self.total as f64
        } else {
            0.0
        }
    }

    fn method_json(&self) -> String {
        serde_json::to_string(&self.methods).unwrap_or_else(|_| "{}".to_string())
    }

    fn into_hourly(self, source_id: i64, bucket_ms: i64) -> HourlyAggregate {
        HourlyAggregate {
            source_id,
            bucket_ms,
            total_requests: self.total,
            page_views: self.page_views,
            unique_ips: self.ips.len() as i64,
            total_bytes: self.bytes,
            status_2xx: self.status_2xx,
            status_3xx: self.status_3xx,
            status_4xx: self.status_4xx,
            status_5xx: self.status_5xx,
            min_request_time: self.time_min,
            avg_request_time: self.avg(),
            max_request_time: self.time_max,
            method_distribution: self.method_json(),
        }
    }

    fn into_daily(self, source_id: i64, bucket_ms: i64, top_n: usize) -> DailyAggregate {
        DailyAggregate {
            source_id,
            bucket_ms,
            total_requests: self.total,
            page_views: self.page_views,
            unique_ips: self.ips.len() as i64,
            total_bytes: self.bytes,
            status_2xx: self.status_2xx,
            status_3xx: self.status_3xx,
            status_4xx: self.status_4xx,
            status_5xx: self.status_5xx,
            min_request_time: self.time_min,
            avg_request_time: self.avg(),
            max_request_time: self.time_max,
            method_distribution: self.method_json(),
            top_urls: self.urls.top_json(top_n),
            top_ips: self.top_ips.top_json(top_n),
            top_referers: self.referers.top_json(top_n),
            top_countries: self.countries.top_json(top_n),
            top_browsers: self.browsers.top_json(top_n),
            top_devices: self.devices.top_json(top_n),
            // 24 hourly totals for intra-day sparklines
            hourly_traffic: serde_json::to_string(&self.hourly)
                .unwrap_or_else(|_| "[]".to_string()),
        }
    }
}

/// Hourly sweep dropping rows past each source's retention horizon.
pub fn start_retention_task(
    db: Database,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sources = match db.active_sources().await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("retention sweep could not list sources: {}", e);
                            continue;
                        }
                    };
                    for source in sources {
                        if let Err(e) = db.sweep_retention(&source).await {
                            warn!(source_id = source.id, "retention sweep failed: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("retention task stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dimensions::DimensionStore;
    use crate::db::{legacy_fixture, FactRow};
    use crate::ua::UaParser;

    const BUCKET: i64 = 1_754_560_800_000 - (1_754_560_800_000 % HOUR_MS);

    async fn seed_facts(db: &Database, source_id: i64) {
        let dims = DimensionStore::new(db.clone());
        let ua = UaParser::new();
        let ua_info = ua.parse("Mozilla/5.0 (Windows NT 10.0) Chrome/126.0.0.0 Safari/537.36");

        let mut rows = Vec::new();
        for i in 0..20i64 {
            let addr = format!("203.0.113.{}", i % 5);
            let uri = if i % 2 == 0 { "/home" } else { "/pricing" };
            rows.push(FactRow {
                source_id,
                ts_ms: BUCKET + i * 60_000,
                ip_id: dims.ip_id(&addr).await.unwrap(),
                url_id: dims.url_id(uri, "example.com").await.unwrap(),
                referer_id: dims.referer_id("https://www.google.com/").await.unwrap(),
                ua_id: dims
                    .ua_id("Mozilla/5.0 (Windows NT 10.0) Chrome/126.0.0.0 Safari/537.36", &ua_info)
                    .await
                    .unwrap(),
                method: "GET".to_string(),
                protocol: "HTTP/1.1".to_string(),
                status: if i % 10 == 9 { 500 } else { 200 },
                body_bytes: 1000,
                request_time: 0.010 * (i % 3 + 1) as f64,
                upstream_time: 0.0,
                is_page_view: true,
            });
        }
        db.insert_facts(&rows).await.unwrap();
    }

    #[tokio::test]
    async fn rollup_is_idempotent() {
        let db = Database::open_in_memory().await.unwrap();
        seed_facts(&db, 1).await;
        let agg = Aggregator::new(db.clone(), 10);

        agg.rollup(1, BUCKET, Granularity::Hour).await.unwrap();
        let first = db.hourly_aggregates(1, BUCKET, BUCKET + HOUR_MS).await.unwrap();

        agg.rollup(1, BUCKET + 120_000, Granularity::Hour).await.unwrap();
        let second = db.hourly_aggregates(1, BUCKET, BUCKET + HOUR_MS).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].total_requests, 20);
        assert_eq!(first[0].unique_ips, 5);
        assert_eq!(first[0].status_2xx, 18);
        assert_eq!(first[0].status_5xx, 2);
        assert_eq!(first[0].total_bytes, 20_000);
        assert!(first[0].min_request_time > 0.0);
        assert!(first[0].max_request_time >= first[0].avg_request_time);
    }

    #[tokio::test]
    async fn daily_rollup_embeds_tops_and_sparkline() {
        let db = Database::open_in_memory().await.unwrap();
        seed_facts(&db, 1).await;
        let agg = Aggregator::new(db.clone(), 10);

        agg.rollup(1, BUCKET, Granularity::Day).await.unwrap();
        let day = db
            .get_daily_aggregate(1, day_bucket(BUCKET))
            .await
            .unwrap()
            .expect("daily row");

        assert_eq!(day.total_requests, 20);
        assert_eq!(day.unique_ips, 5);

        let tops: Vec<serde_json::Value> = serde_json::from_str(&day.top_urls).unwrap();
        assert_eq!(tops[0]["name"], "/home");
        assert_eq!(tops[0]["value"], 10);

        let referers: Vec<serde_json::Value> = serde_json::from_str(&day.top_referers).unwrap();
        assert_eq!(referers[0]["name"], "www.google.com");

        let sparkline: Vec<i64> = serde_json::from_str(&day.hourly_traffic).unwrap();
        assert_eq!(sparkline.len(), 24);
        assert_eq!(sparkline.iter().sum::<i64>(), 20);

        let methods: serde_json::Value =
            serde_json::from_str(&day.method_distribution).unwrap();
        assert_eq!(methods["GET"], 20);
    }

    #[tokio::test]
    async fn rollup_falls_back_to_legacy_rows() {
        let db = Database::open_in_memory().await.unwrap();
        legacy_fixture::install(&db).await;
        for i in 0..6i64 {
            legacy_fixture::insert_access_log(
                &db,
                7,
                BUCKET + i * 1000,
                if i < 3 { "198.51.100.1" } else { "198.51.100.2" },
                "GET",
                "/legacy/page",
                200,
                512,
                "",
            )
            .await;
        }

        let agg = Aggregator::new(db.clone(), 10);
        agg.rollup(7, BUCKET, Granularity::Hour).await.unwrap();

        let rows = db.hourly_aggregates(7, BUCKET, BUCKET + HOUR_MS).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_requests, 6);
        assert_eq!(rows[0].unique_ips, 2);
        assert_eq!(rows[0].page_views, 6);
    }

    #[tokio::test]
    async fn empty_bucket_rolls_up_to_zero_row() {
        let db = Database::open_in_memory().await.unwrap();
        let agg = Aggregator::new(db.clone(), 10);
        agg.rollup(1, BUCKET, Granularity::Hour).await.unwrap();

        let rows = db.hourly_aggregates(1, BUCKET, BUCKET + HOUR_MS).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_requests, 0);
        assert_eq!(rows[0].unique_ips, 0);
    }

    #[test]
    fn top_n_breaks_ties_by_first_seen() {
        let mut map = CountMap::default();
        for key in ["/b", "/a", "/b", "/a", "/c"] {
            map.bump(key);
        }
        let top = map.top(3);
        assert_eq!(top[0].name, "/b");
        assert_eq!(top[1].name, "/a");
        assert_eq!(top[2].name, "/c");
    }
}
