//! Configuration management

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub geoip: GeoIpConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpConfig {
    /// Path to a GeoLite2-City database. A missing file disables geo
    /// enrichment, it is never an error.
    pub database: String,
    /// Optional GeoLite2-ASN database for ISP attribution.
    #[serde(default)]
    pub asn_database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Scheduler tick; each tick checks which sources are due for collection.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Fact rows per insert transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on bytes read from a log file in one cycle. Anything
    /// beyond it is picked up on following cycles via the watermark.
    #[serde(default = "default_max_chunk_mb")]
    pub max_chunk_mb: u64,
    /// Top-N list length used by daily rollups.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_tick_secs() -> u64 {
    10
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_chunk_mb() -> u64 {
    100
}

fn default_top_n() -> usize {
    10
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            batch_size: default_batch_size(),
            max_chunk_mb: default_max_chunk_mb(),
            top_n: default_top_n(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(config::Environment::with_prefix("LOGMILL"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.collector.tick_secs == 0 {
            anyhow::bail!("collector.tick_secs must be at least 1");
        }
        if self.collector.batch_size == 0 {
            anyhow::bail!("collector.batch_size must be at least 1");
        }
        if self.collector.top_n == 0 {
            anyhow::bail!("collector.top_n must be at least 1");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            database: DatabaseConfig {
                url: "logmill.db".into(),
            },
            geoip: GeoIpConfig {
                database: "GeoLite2-City.mmdb".into(),
                asn_database: String::new(),
            },
            logging: LoggingConfig {
                level: "info".into(),
            },
            collector: CollectorConfig::default(),
        }
    }

    #[test]
    fn validates_defaults() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_empty_database_url() {
        let mut cfg = base();
        cfg.database.url.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut cfg = base();
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().is_err());
    }
}
