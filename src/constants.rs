// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults and limits shared by the configuration layer, the ingestion pass
// and the exposition layer.
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "squid-log-exporter";
pub const EXPORTER_FULL_NAME: &str = "Squid Log Exporter";

// ----------------------------------------------------------------------------
// Paths & Endpoints
// ----------------------------------------------------------------------------

pub const DEFAULT_CONFIG_PATH: &str = "/etc/squid-log-exporter/config.toml";
pub const DEFAULT_LOG_FILE: &str = "/var/log/squid/access.log";
pub const DEFAULT_POSITION_FILE: &str = "/var/lib/squid-log-exporter/position.json";
pub const DEFAULT_KNOWN_STATUS_FILE: &str = "/var/lib/squid-log-exporter/known_statuses";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9448";
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Environment prefix for configuration overrides (`SQUID_EXPORTER_GLOBAL__MAX_DOMAINS=500`)
pub const ENV_PREFIX: &str = "SQUID_EXPORTER_";

// ----------------------------------------------------------------------------
// Timing & Retry
// ----------------------------------------------------------------------------

/// Interval between ingestion passes (seconds)
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Attempts made for a position or textfile write before the failure is surfaced
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Fixed delay between write attempts (milliseconds)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Grace period for the HTTP responder after the final pass (seconds)
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

/// A pass slower than this is reported at warn level (milliseconds)
pub const SLOW_RUN_THRESHOLD_MS: u64 = 5_000;

// ----------------------------------------------------------------------------
// Ingestion Limits
// ----------------------------------------------------------------------------

/// Lines scanned between periodic position checkpoints
pub const DEFAULT_CHECKPOINT_LINES: u64 = 1000;

/// Individually tracked all-domains series before overflow folding starts
pub const DEFAULT_MAX_DOMAINS: usize = 10_000;

/// Lines longer than this are skipped as malformed
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Pseudo-URL prefixes that identify proxy-internal requests
pub const INTERNAL_URL_PREFIXES: &[&str] = &["cache_object://", "mgr://", "internal://", "urn:"];

/// Field names every log format must map to a column
pub const REQUIRED_FIELDS: &[&str] = &["timestamp", "duration", "result_code", "bytes", "method", "url"];

/// Layout used by custom formats that do not configure one
pub const DEFAULT_CUSTOM_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Marker for epoch-seconds timestamps (`1700000000.123`)
pub const UNIX_TIMESTAMP_FORMAT: &str = "unix";

// ----------------------------------------------------------------------------
// Exposition
// ----------------------------------------------------------------------------

/// Synthetic domain absorbing traffic beyond `max_domains`
pub const OVERFLOW_HOST: &str = "__other__";
pub const OVERFLOW_PORT: u16 = 0;

/// Labels owned by the exporter; custom domain labels may not reuse them
pub const RESERVED_LABELS: &[&str] = &["host", "port", "code", "category", "direction"];

/// Latency percentiles exported per monitored domain
pub const PERCENTILES: [f64; 4] = [0.50, 0.90, 0.95, 0.99];
