//! # Squid Log Exporter
//!
//! Reads a Squid access log incrementally and exposes Prometheus metrics:
//! request counts, latency buckets, cache status, HTTP status classes and
//! per-destination traffic, with optional per-domain latency percentiles and
//! cache hit ratios for monitored domains.
//!
//! Each ingestion pass resumes from a persisted byte offset, detects log
//! rotation and truncation, aggregates the new lines, and turns cumulative
//! observations into non-negative counter increments.

#![warn(rust_2018_idioms)]

pub mod aggregator;
pub mod cli;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod delta;
pub mod domains;
pub mod error;
pub mod host;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod persist;
pub mod position;
pub mod server;
pub mod stats;
pub mod status_store;

pub use aggregator::{RunAggregator, RunReport};
pub use config::ExporterConfig;
pub use daemon::Exporter;
pub use error::{ExporterError, ExporterResult};
pub use metrics::ExporterMetrics;
