//! Incremental log collection
//!
//! One cycle per source: stat the file, detect rotation/truncation against
//! the stored watermark, read the new bytes, parse complete lines, resolve
//! dimension keys, batch-write fact rows, then advance the watermark. The
//! watermark only moves after a successful write, so a crash re-processes an
//! already-written batch at worst (rollups recompute buckets, so that is
//! harmless) and never skips unprocessed bytes.
//!
//! The byte offset always lands on a line boundary: an incomplete trailing
//! line is left beyond the watermark and re-read once the next cycle sees
//! its terminating newline.

use std::collections::{BTreeSet, HashSet};
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregator, Granularity};
use crate::db::dimensions::DimensionStore;
use crate::db::{day_bucket, hour_bucket, now_ms, Database, FactRow, Source};
use crate::error::EngineError;
use crate::events::{CollectEvent, EventBus};
use crate::geoip::SharedGeoIp;
use crate::parser::{self, LogFormat, ParsedLogEntry};
use crate::ua::UaParser;

const MAX_CHUNK_BYTES_DEFAULT: i64 = 100 * 1024 * 1024;

/// What one collection cycle did.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub rows_stored: usize,
    pub parse_errors: usize,
    pub rotated: bool,
    /// Another cycle for this source was already in flight.
    pub skipped: bool,
}

pub struct Collector {
    db: Database,
    dims: Arc<DimensionStore>,
    geo: SharedGeoIp,
    ua: Arc<UaParser>,
    aggregator: Arc<Aggregator>,
    bus: EventBus,
    batch_size: usize,
    max_chunk_bytes: i64,
    // per-source single-flight: a source never has two cycles in flight
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl Collector {
    pub fn new(
        db: Database,
        dims: Arc<DimensionStore>,
        geo: SharedGeoIp,
        ua: Arc<UaParser>,
        aggregator: Arc<Aggregator>,
        bus: EventBus,
        batch_size: usize,
    ) -> Self {
        Self {
            db,
            dims,
            geo,
            ua,
            aggregator,
            bus,
            batch_size,
            max_chunk_bytes: MAX_CHUNK_BYTES_DEFAULT,
            locks: DashMap::new(),
        }
    }

    pub fn with_max_chunk_bytes(mut self, bytes: i64) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    /// Run one collection cycle for a source, on demand or from the
    /// scheduler. Failures are recorded on the source row; other sources are
    /// unaffected.
    pub async fn collect_source(&self, source_id: i64) -> Result<CycleOutcome, EngineError> {
        let lock = self
            .locks
            .entry(source_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let Ok(_guard) = lock.try_lock() else {
            debug!(source_id, "cycle already in flight, skipping");
            return Ok(CycleOutcome {
                skipped: true,
                ..Default::default()
            });
        };

        let source = self.db.get_source(source_id).await?;
        if source.kind != "host" {
            let err = EngineError::Uncollectable(source.kind.clone());
            self.db
                .record_collect_error(source_id, &err.to_string())
                .await?;
            return Err(err);
        }

        match self.run_cycle(&source).await {
            Ok(outcome) => {
                if outcome.parse_errors > 0 {
                    warn!(
                        source_id,
                        dropped = outcome.parse_errors,
                        "dropped malformed log lines"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                // Watermark deliberately untouched: the same bytes are
                // retried next interval.
                let _ = self
                    .db
                    .record_collect_error(source_id, &e.to_string())
                    .await;
                self.bus.publish(CollectEvent::CycleFailed {
                    source_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, source: &Source) -> Result<CycleOutcome, EngineError> {
        let meta = tokio::fs::metadata(&source.log_path)
            .await
            .map_err(EngineError::WatermarkIo)?;
        let size = meta.len() as i64;
        let inode = meta.ino() as i64;

        let mut offset = source.last_file_offset;
        let mut rotated = false;

        if source.last_file_inode != 0 && inode != source.last_file_inode {
            rotated = true;
        } else if size < offset {
            // Same inode but the file shrank below our offset: truncated in
            // place, treat like a rotation.
            rotated = true;
        }

        if rotated {
            info!(
                source_id = source.id,
                old_inode = source.last_file_inode,
                new_inode = inode,
                "log rotation detected, watermark reset"
            );
            self.bus.publish(CollectEvent::Rotation {
                source_id: source.id,
                old_inode: source.last_file_inode,
                new_inode: inode,
            });
            self.db.reset_watermark(source.id, size, inode).await?;
            offset = 0;
        }

        if offset >= size {
            self.db
                .advance_watermark(source.id, size, offset, inode, 0)
                .await?;
            return Ok(CycleOutcome {
                rotated,
                ..Default::default()
            });
        }

        let to_read = (size - offset).min(self.max_chunk_bytes);
        let mut file = tokio::fs::File::open(&source.log_path)
            .await
            .map_err(EngineError::WatermarkIo)?;
        file.seek(SeekFrom::Start(offset as u64))
            .await
            .map_err(EngineError::WatermarkIo)?;
        let mut buf = vec![0u8; to_read as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(EngineError::WatermarkIo)?;

        // Only complete lines are consumed this cycle
        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(CycleOutcome {
                rotated,
                ..Default::default()
            });
        };
        let consumed = (last_newline + 1) as i64;
        let text = String::from_utf8_lossy(&buf[..last_newline + 1]);

        let format = LogFormat::from_name(&source.log_format);
        let mut outcome = CycleOutcome {
            rotated,
            ..Default::default()
        };
        let mut batch: Vec<FactRow> = Vec::with_capacity(self.batch_size);
        let mut geo_seen: HashSet<String> = HashSet::new();
        let mut touched_hours: BTreeSet<i64> = BTreeSet::new();
        let mut touched_days: BTreeSet<i64> = BTreeSet::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry = match parser::parse_line(line, format) {
                Ok(entry) => entry,
                Err(e) => {
                    outcome.parse_errors += 1;
                    debug!(source_id = source.id, error = %e, "dropped line");
                    continue;
                }
            };

            let row = self.build_fact(source, &entry, &mut geo_seen).await?;
            touched_hours.insert(hour_bucket(row.ts_ms));
            touched_days.insert(day_bucket(row.ts_ms));
            batch.push(row);

            if batch.len() >= self.batch_size {
                self.db.insert_facts(&batch).await?;
                outcome.rows_stored += batch.len();
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.db.insert_facts(&batch).await?;
            outcome.rows_stored += batch.len();
        }

        let new_offset = offset + consumed;
        self.db
            .advance_watermark(
                source.id,
                size,
                new_offset,
                inode,
                outcome.rows_stored as i64,
            )
            .await?;
        self.bus.publish(CollectEvent::BatchWritten {
            source_id: source.id,
            rows: outcome.rows_stored,
        });

        // Aggregation failures leave the previous rows in place; the next
        // cycle touching these buckets retries.
        for bucket in touched_hours {
            if let Err(e) = self
                .aggregator
                .rollup(source.id, bucket, Granularity::Hour)
                .await
            {
                warn!(source_id = source.id, error = %e, "hourly rollup failed");
            }
        }
        for bucket in touched_days {
            if let Err(e) = self
                .aggregator
                .rollup(source.id, bucket, Granularity::Day)
                .await
            {
                warn!(source_id = source.id, error = %e, "daily rollup failed");
            }
        }

        Ok(outcome)
    }

    async fn build_fact(
        &self,
        source: &Source,
        entry: &ParsedLogEntry,
        geo_seen: &mut HashSet<String>,
    ) -> Result<FactRow, EngineError> {
        let ip_id = self.dims.ip_id(&entry.remote_addr).await?;
        if source.geo_enabled && geo_seen.insert(entry.remote_addr.clone()) {
            // A failed lookup leaves the dimension unenriched; never blocks
            // ingestion.
            if let Some(info) = self.geo.lookup(&entry.remote_addr) {
                self.dims.backfill_ip_geo(ip_id, &info).await?;
            }
        }

        let url_id = self.dims.url_id(&entry.uri, &entry.host).await?;
        let referer_id = self.dims.referer_id(&entry.referer).await?;
        let ua_info = self.ua.parse(&entry.user_agent);
        let ua_id = self.dims.ua_id(&entry.user_agent, &ua_info).await?;

        Ok(FactRow {
            source_id: source.id,
            ts_ms: entry.timestamp.timestamp_millis(),
            ip_id,
            url_id,
            referer_id,
            ua_id,
            method: entry.method.clone(),
            protocol: entry.protocol.clone(),
            status: entry.status,
            body_bytes: entry.body_bytes,
            request_time: entry.request_time,
            upstream_time: entry.upstream_time,
            is_page_view: parser::is_page_view(&entry.uri, entry.status),
        })
    }

    /// Re-run enrichment for dimension rows that never got it (geo lookups
    /// that failed at ingest time, user agents stored before a parser
    /// update). Targeted updates by surrogate id; no log re-parsing.
    pub async fn backfill_enrichment(&self) -> Result<(usize, usize), EngineError> {
        let mut geo_updates = 0;
        let unresolved: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, ip_address FROM dim_ip WHERE country = ''")
                .fetch_all(self.db.pool())
                .await?;
        for (id, addr) in &unresolved {
            if let Some(info) = self.geo.lookup(addr) {
                self.dims.backfill_ip_geo(*id, &info).await?;
                geo_updates += 1;
            }
        }

        let mut ua_updates = 0;
        let stale: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, user_agent FROM dim_user_agent WHERE browser = '' OR browser = 'Unknown'",
        )
        .fetch_all(self.db.pool())
        .await?;
        for (id, ua) in &stale {
            let info = self.ua.parse(ua);
            if info.browser != "Unknown" {
                self.dims.update_ua_attrs(*id, &info).await?;
                ua_updates += 1;
            }
        }

        info!(geo_updates, ua_updates, "enrichment backfill finished");
        Ok((geo_updates, ua_updates))
    }
}

/// Fixed-interval scheduler: each tick finds sources whose collect interval
/// has elapsed and spawns an independent cycle per source. Per-source
/// single-flight lives in the collector, so a slow cycle simply causes the
/// next tick to skip that source.
pub struct Scheduler {
    collector: Arc<Collector>,
    db: Database,
    tick: Duration,
}

impl Scheduler {
    pub fn new(collector: Arc<Collector>, db: Database, tick: Duration) -> Self {
        Self {
            collector,
            db,
            tick,
        }
    }

    pub fn start(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            // jitter so a restart does not stat every file in lockstep
            let jitter = rand::thread_rng().gen_range(0..self.tick.as_millis().max(1) as u64);
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            let mut interval = tokio::time::interval(self.tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.run_due().await,
                    _ = shutdown.recv() => {
                        info!("collector scheduler stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn run_due(&self) {
        let sources = match self.db.active_sources().await {
            Ok(sources) => sources,
            Err(e) => {
                warn!("could not list active sources: {}", e);
                return;
            }
        };

        let now = now_ms();
        for source in sources {
            if source.kind != "host" {
                debug!(source_id = source.id, kind = %source.kind, "skipping uncollectable source");
                continue;
            }
            let due = source
                .last_collect_at
                .map_or(true, |t| now - t >= source.collect_interval_secs * 1000);
            if !due {
                continue;
            }
            let collector = self.collector.clone();
            let source_id = source.id;
            tokio::spawn(async move {
                if let Err(e) = collector.collect_source(source_id).await {
                    warn!(source_id, error = %e, "collection cycle failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn test_collector(db: &Database, batch_size: usize) -> Collector {
        let dims = Arc::new(DimensionStore::new(db.clone()));
        let geo = Arc::new(crate::geoip::GeoIp::new("/nonexistent.mmdb", ""));
        let ua = Arc::new(UaParser::new());
        let aggregator = Arc::new(Aggregator::new(db.clone(), 10));
        let (tx, _rx) = broadcast::channel(64);
        Collector::new(
            db.clone(),
            dims,
            geo,
            ua,
            aggregator,
            EventBus::new(tx),
            batch_size,
        )
    }

    fn combined_line(addr: &str, hour: u32, minute: u32, uri: &str) -> String {
        format!(
            "{addr} - - [07/Aug/2026:{hour:02}:{minute:02}:00 +0000] \"GET {uri} HTTP/1.1\" 200 512 \"-\" \"Mozilla/5.0 (Windows NT 10.0) Chrome/126.0.0.0 Safari/537.36\"\n"
        )
    }

    #[tokio::test]
    async fn watermark_advances_to_line_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(combined_line("203.0.113.1", 10, 0, "/a").as_bytes())
            .unwrap();
        f.write_all(combined_line("203.0.113.2", 10, 1, "/b").as_bytes())
            .unwrap();
        // incomplete trailing line stays beyond the watermark
        f.write_all(b"203.0.113.3 - - [07/Aug/20").unwrap();
        f.sync_all().unwrap();

        let db = Database::open_in_memory().await.unwrap();
        let id = db
            .create_source(&Source::new("t", path.to_str().unwrap()).with_geo(false))
            .await
            .unwrap();

        let collector = test_collector(&db, 1000);
        let outcome = collector.collect_source(id).await.unwrap();
        assert_eq!(outcome.rows_stored, 2);
        assert_eq!(outcome.parse_errors, 0);

        let src = db.get_source(id).await.unwrap();
        let complete_len = (combined_line("203.0.113.1", 10, 0, "/a").len()
            + combined_line("203.0.113.2", 10, 1, "/b").len()) as i64;
        assert_eq!(src.last_file_offset, complete_len);
        assert!(src.last_file_offset <= src.last_file_size);

        // finish the partial line and add one more; only the new rows land
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"26:10:02:00 +0000] \"GET /c HTTP/1.1\" 200 100 \"-\" \"curl/8.5.0\"\n")
            .unwrap();
        f.sync_all().unwrap();

        let outcome = collector.collect_source(id).await.unwrap();
        assert_eq!(outcome.rows_stored, 1);
        assert_eq!(db.fact_count(id).await.unwrap(), 3);

        let src2 = db.get_source(id).await.unwrap();
        assert!(src2.last_file_offset >= src.last_file_offset);
        assert_eq!(src2.last_file_offset, src2.last_file_size);
    }

    #[tokio::test]
    async fn rotation_resets_offset_and_reads_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, combined_line("203.0.113.1", 9, 0, "/old")).unwrap();

        let db = Database::open_in_memory().await.unwrap();
        let id = db
            .create_source(&Source::new("t", path.to_str().unwrap()).with_geo(false))
            .await
            .unwrap();
        let collector = test_collector(&db, 1000);
        collector.collect_source(id).await.unwrap();
        let before = db.get_source(id).await.unwrap();
        assert!(before.last_file_offset > 0);

        // rotate: new (smaller) file under the same path, different inode
        let rotated = dir.path().join("access.log.new");
        std::fs::write(&rotated, combined_line("203.0.113.9", 9, 30, "/fresh")).unwrap();
        std::fs::rename(&rotated, &path).unwrap();

        let outcome = collector.collect_source(id).await.unwrap();
        assert!(outcome.rotated);
        assert_eq!(outcome.rows_stored, 1);
        assert_eq!(db.fact_count(id).await.unwrap(), 2);

        let after = db.get_source(id).await.unwrap();
        assert_ne!(after.last_file_inode, before.last_file_inode);
        assert_eq!(
            after.last_file_offset,
            combined_line("203.0.113.9", 9, 30, "/fresh").len() as i64
        );
    }

    #[tokio::test]
    async fn unreadable_file_records_error_and_keeps_watermark() {
        let db = Database::open_in_memory().await.unwrap();
        let id = db
            .create_source(&Source::new("t", "/nonexistent/access.log").with_geo(false))
            .await
            .unwrap();
        db.advance_watermark(id, 100, 80, 5, 1).await.unwrap();

        let collector = test_collector(&db, 1000);
        let err = collector.collect_source(id).await.unwrap_err();
        assert!(matches!(err, EngineError::WatermarkIo(_)));

        let src = db.get_source(id).await.unwrap();
        assert!(!src.last_error.is_empty());
        assert_eq!(src.last_file_offset, 80);
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let mut content = combined_line("203.0.113.1", 10, 0, "/ok");
        content.push_str("totally broken line\n");
        content.push_str(&combined_line("203.0.113.2", 10, 1, "/also-ok"));
        std::fs::write(&path, &content).unwrap();

        let db = Database::open_in_memory().await.unwrap();
        let id = db
            .create_source(&Source::new("t", path.to_str().unwrap()).with_geo(false))
            .await
            .unwrap();
        let collector = test_collector(&db, 1000);

        let outcome = collector.collect_source(id).await.unwrap();
        assert_eq!(outcome.rows_stored, 2);
        assert_eq!(outcome.parse_errors, 1);
        // the watermark still covers the malformed line
        let src = db.get_source(id).await.unwrap();
        assert_eq!(src.last_file_offset, content.len() as i64);
    }

    /// 1,000 lines across two hours from 10 distinct addresses produce one
    /// aggregate row per hour, totals matching the per-hour input counts and
    /// 10 unique visitors in each.
    #[tokio::test]
    async fn two_hour_scenario_rolls_up_per_hour() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let mut content = String::new();
        for i in 0..1000u32 {
            let addr = format!("203.0.113.{}", i % 10);
            let hour = if i < 600 { 10 } else { 11 };
            content.push_str(&combined_line(&addr, hour, i % 60, "/page"));
        }
        std::fs::write(&path, &content).unwrap();

        let db = Database::open_in_memory().await.unwrap();
        let id = db
            .create_source(&Source::new("t", path.to_str().unwrap()).with_geo(false))
            .await
            .unwrap();
        let collector = test_collector(&db, 1000);
        let outcome = collector.collect_source(id).await.unwrap();
        assert_eq!(outcome.rows_stored, 1000);

        let day_start = chrono::Utc
            .with_ymd_and_hms(2026, 8, 7, 0, 0, 0)
            .unwrap()
            .timestamp_millis();
        let rows = db
            .hourly_aggregates(id, day_start, day_start + crate::db::DAY_MS)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].total_requests, 600);
        assert_eq!(rows[1].total_requests, 400);
        assert_eq!(rows[0].unique_ips, 10);
        assert_eq!(rows[1].unique_ips, 10);

        let day = db
            .get_daily_aggregate(id, day_start)
            .await
            .unwrap()
            .expect("daily row");
        assert_eq!(day.total_requests, 1000);
        assert_eq!(day.unique_ips, 10);
    }

    #[tokio::test]
    async fn batches_are_split_and_all_rows_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let mut content = String::new();
        for i in 0..25u32 {
            content.push_str(&combined_line("203.0.113.1", 10, i % 60, "/p"));
        }
        std::fs::write(&path, &content).unwrap();

        let db = Database::open_in_memory().await.unwrap();
        let id = db
            .create_source(&Source::new("t", path.to_str().unwrap()).with_geo(false))
            .await
            .unwrap();
        let collector = test_collector(&db, 10);

        let outcome = collector.collect_source(id).await.unwrap();
        assert_eq!(outcome.rows_stored, 25);
        assert_eq!(db.fact_count(id).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn non_host_source_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let mut source = Source::new("ingress", "");
        source.kind = "k8s_ingress".to_string();
        let id = db.create_source(&source).await.unwrap();

        let collector = test_collector(&db, 1000);
        let err = collector.collect_source(id).await.unwrap_err();
        assert!(matches!(err, EngineError::Uncollectable(_)));
        let src = db.get_source(id).await.unwrap();
        assert!(src.last_error.contains("k8s_ingress"));
    }
}
