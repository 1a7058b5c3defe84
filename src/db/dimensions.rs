//! Dimension deduplication
//!
//! Maps raw strings (IP, URL, referer, user-agent) to small stable surrogate
//! ids. Lookup order: in-process cache, then storage by unique business key,
//! then insert-or-ignore. A lost insert race (zero rows affected) falls back
//! to re-reading the winner's id, so concurrent collectors never see a
//! duplicate-key failure. Cached ids are immutable: a surrogate id is never
//! reassigned for the lifetime of the row.

use dashmap::DashMap;

use super::{now_ms, Database};
use crate::error::EngineError;
use crate::geoip::GeoInfo;
use crate::parser::{classify_referer, hash_key, normalize_url, referer_domain};
use crate::ua::UaInfo;

pub struct DimensionStore {
    db: Database,
    ip: DashMap<String, i64>,
    url: DashMap<String, i64>,
    referer: DashMap<String, i64>,
    ua: DashMap<String, i64>,
}

impl DimensionStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            ip: DashMap::new(),
            url: DashMap::new(),
            referer: DashMap::new(),
            ua: DashMap::new(),
        }
    }

    /// Drop all cached ids. Operational recovery only; storage is untouched.
    pub fn clear(&self) {
        self.ip.clear();
        self.url.clear();
        self.referer.clear();
        self.ua.clear();
    }

    /// Get or create the surrogate id for a client address. Geo fields start
    /// empty and are back-filled separately.
    pub async fn ip_id(&self, addr: &str) -> Result<i64, EngineError> {
        if let Some(id) = self.ip.get(addr) {
            return Ok(*id);
        }
        let id = self
            .get_or_create(
                "SELECT id FROM dim_ip WHERE ip_address = ?",
                "INSERT INTO dim_ip (ip_address, created_at, updated_at) \
                 VALUES (?1, ?2, ?2) ON CONFLICT (ip_address) DO NOTHING",
                addr,
            )
            .await?;
        self.ip.insert(addr.to_string(), id);
        Ok(id)
    }

    /// Get or create the surrogate id for a URL. The business key is the
    /// hash of `uri + host`; the normalized path (query stripped) is derived
    /// at creation.
    pub async fn url_id(&self, uri: &str, host: &str) -> Result<i64, EngineError> {
        let key = hash_key(&format!("{uri}{host}"));
        if let Some(id) = self.url.get(&key) {
            return Ok(*id);
        }

        if let Some(id) = self.read_id("SELECT id FROM dim_url WHERE url_hash = ?", &key).await? {
            self.url.insert(key, id);
            return Ok(id);
        }

        let inserted = sqlx::query(
            "INSERT INTO dim_url (url_hash, url_path, url_normalized, host, created_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT (url_hash) DO NOTHING",
        )
        .bind(&key)
        .bind(uri)
        .bind(normalize_url(uri))
        .bind(host)
        .bind(now_ms())
        .execute(self.db.pool())
        .await?;

        let id = if inserted.rows_affected() > 0 {
            inserted.last_insert_rowid()
        } else {
            self.reread("SELECT id FROM dim_url WHERE url_hash = ?", &key).await?
        };
        self.url.insert(key, id);
        Ok(id)
    }

    /// Get or create the surrogate id for a referer URL. Empty referers have
    /// no dimension row; the fact stores 0.
    pub async fn referer_id(&self, referer: &str) -> Result<i64, EngineError> {
        if referer.is_empty() {
            return Ok(0);
        }
        let key = hash_key(referer);
        if let Some(id) = self.referer.get(&key) {
            return Ok(*id);
        }

        if let Some(id) = self
            .read_id("SELECT id FROM dim_referer WHERE referer_hash = ?", &key)
            .await?
        {
            self.referer.insert(key, id);
            return Ok(id);
        }

        let inserted = sqlx::query(
            "INSERT INTO dim_referer (referer_hash, referer_url, referer_domain, referer_type, created_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT (referer_hash) DO NOTHING",
        )
        .bind(&key)
        .bind(referer)
        .bind(referer_domain(referer))
        .bind(classify_referer(referer))
        .bind(now_ms())
        .execute(self.db.pool())
        .await?;

        let id = if inserted.rows_affected() > 0 {
            inserted.last_insert_rowid()
        } else {
            self.reread("SELECT id FROM dim_referer WHERE referer_hash = ?", &key).await?
        };
        self.referer.insert(key, id);
        Ok(id)
    }

    /// Get or create the surrogate id for a user-agent string, storing its
    /// parsed attributes on first sighting.
    pub async fn ua_id(&self, user_agent: &str, info: &UaInfo) -> Result<i64, EngineError> {
        if user_agent.is_empty() {
            return Ok(0);
        }
        let key = hash_key(user_agent);
        if let Some(id) = self.ua.get(&key) {
            return Ok(*id);
        }

        if let Some(id) = self
            .read_id("SELECT id FROM dim_user_agent WHERE ua_hash = ?", &key)
            .await?
        {
            self.ua.insert(key, id);
            return Ok(id);
        }

        let inserted = sqlx::query(
            "INSERT INTO dim_user_agent (ua_hash, user_agent, browser, browser_version, os, os_version, device_type, is_bot, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (ua_hash) DO NOTHING",
        )
        .bind(&key)
        .bind(user_agent)
        .bind(&info.browser)
        .bind(&info.browser_version)
        .bind(&info.os)
        .bind(&info.os_version)
        .bind(&info.device_type)
        .bind(info.is_bot)
        .bind(now_ms())
        .execute(self.db.pool())
        .await?;

        let id = if inserted.rows_affected() > 0 {
            inserted.last_insert_rowid()
        } else {
            self.reread("SELECT id FROM dim_user_agent WHERE ua_hash = ?", &key).await?
        };
        self.ua.insert(key, id);
        Ok(id)
    }

    /// Targeted geo back-fill by surrogate id. Only empty rows are touched,
    /// so the update is idempotent and never fights a concurrent back-fill.
    pub async fn backfill_ip_geo(&self, id: i64, info: &GeoInfo) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE dim_ip SET country = ?, province = ?, city = ?, isp = ?, updated_at = ? \
             WHERE id = ? AND country = ''",
        )
        .bind(&info.country)
        .bind(&info.province)
        .bind(&info.city)
        .bind(&info.isp)
        .bind(now_ms())
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Re-parse stored user-agent attributes by surrogate id (used by the
    /// enrichment backfill job).
    pub async fn update_ua_attrs(&self, id: i64, info: &UaInfo) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE dim_user_agent SET browser = ?, browser_version = ?, os = ?, os_version = ?, \
             device_type = ?, is_bot = ? WHERE id = ?",
        )
        .bind(&info.browser)
        .bind(&info.browser_version)
        .bind(&info.os)
        .bind(&info.os_version)
        .bind(&info.device_type)
        .bind(info.is_bot)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn read_id(&self, sql: &str, key: &str) -> Result<Option<i64>, EngineError> {
        let row: Option<(i64,)> = sqlx::query_as(sql)
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|(id,)| id))
    }

    /// The insert reported zero affected rows, meaning a concurrent worker
    /// created the row between our read and insert. The winner's row must
    /// exist now.
    async fn reread(&self, sql: &str, key: &str) -> Result<i64, EngineError> {
        let (id,): (i64,) = sqlx::query_as(sql)
            .bind(key)
            .fetch_one(self.db.pool())
            .await?;
        Ok(id)
    }

    /// The IP path is simple enough to share between read and insert.
    async fn get_or_create(
        &self,
        select_sql: &str,
        insert_sql: &str,
        key: &str,
    ) -> Result<i64, EngineError> {
        if let Some(id) = self.read_id(select_sql, key).await? {
            return Ok(id);
        }
        let inserted = sqlx::query(insert_sql)
            .bind(key)
            .bind(now_ms())
            .execute(self.db.pool())
            .await?;
        if inserted.rows_affected() > 0 {
            Ok(inserted.last_insert_rowid())
        } else {
            self.reread(select_sql, key).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ua::UaParser;
    use std::sync::Arc;

    #[tokio::test]
    async fn same_key_yields_same_id() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db);

        let a = dims.ip_id("203.0.113.9").await.unwrap();
        let b = dims.ip_id("203.0.113.9").await.unwrap();
        let c = dims.ip_id("203.0.113.10").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn cache_survives_clear_via_storage() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db);

        let a = dims.url_id("/index.html?x=1", "example.com").await.unwrap();
        dims.clear();
        let b = dims.url_id("/index.html?x=1", "example.com").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn concurrent_get_or_create_is_unique() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = Arc::new(DimensionStore::new(db.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let dims = dims.clone();
            handles.push(tokio::spawn(
                async move { dims.ip_id("198.51.100.7").await },
            ));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dim_ip WHERE ip_address = '198.51.100.7'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn empty_referer_and_ua_have_no_row() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db);
        assert_eq!(dims.referer_id("").await.unwrap(), 0);
        let ua = UaParser::new().parse("");
        assert_eq!(dims.ua_id("", &ua).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn geo_backfill_only_fills_empty_rows() {
        let db = Database::open_in_memory().await.unwrap();
        let dims = DimensionStore::new(db.clone());
        let id = dims.ip_id("203.0.113.9").await.unwrap();

        let first = GeoInfo {
            country: "Germany".into(),
            province: "Berlin".into(),
            city: "Berlin".into(),
            isp: "ExampleNet".into(),
        };
        dims.backfill_ip_geo(id, &first).await.unwrap();

        let second = GeoInfo {
            country: "France".into(),
            ..Default::default()
        };
        dims.backfill_ip_geo(id, &second).await.unwrap();

        let (country,): (String,) = sqlx::query_as("SELECT country FROM dim_ip WHERE id = ?")
            .bind(id)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(country, "Germany");
    }
}
