//! logmill - access-log analytics engine
//!
//! Ingests raw web-server access logs into a star schema and maintains
//! hourly/daily rollups:
//! - Crash-safe incremental collection with file-offset watermarks and
//!   rotation detection
//! - Dimension deduplication mapping raw strings to stable surrogate keys
//! - Idempotent recompute-and-replace aggregation
//! - Tiered query fallback across schema generations
//!
//! HTTP handlers, cluster integration, and alert delivery are external
//! collaborators built on the contracts exposed here.

pub mod aggregate;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod geoip;
pub mod parser;
pub mod query;
pub mod ua;
