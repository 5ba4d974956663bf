// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - built-in defaults
// - TOML or JSON file (chosen by extension)
// - SQUID_EXPORTER_* environment overrides (`__` separates sections)
// Everything is validated before the first pass; a bad configuration is
// fatal at startup, never mid-run.
// ============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::domains::{DomainClassifier, LabelSet};
use crate::error::{ConfigError, ConfigResult};
use crate::parser::{DurationUnit, LogFormatSpec, TimestampFormat};
use crate::persist::RetryPolicy;

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Paths, endpoints and scheduling
    #[serde(default)]
    pub exporter: ExporterSettings,

    /// All-domains tracking limits
    #[serde(default)]
    pub global: GlobalSettings,

    /// Access log column layout
    #[serde(default)]
    pub log_format: LogFormatConfig,

    /// Exact monitored domains
    #[serde(default)]
    pub monitored_domains: Vec<MonitoredDomainConfig>,

    /// Wildcard monitored domains
    #[serde(default)]
    pub domain_patterns: Vec<DomainPatternConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::extract(Self::figment(Some(path)))
    }

    /// Like `load`, but a missing file falls back to defaults (environment
    /// overrides still apply). The flag reports whether the file was found.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> ConfigResult<(Self, bool)> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::load(path)?, true))
        } else {
            Ok((Self::extract(Self::figment(None))?, false))
        }
    }

    /// Load from a TOML string (for testing)
    pub fn from_toml_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            let is_json = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
            figment = if is_json {
                figment.merge(Json::file(path))
            } else {
                figment.merge(Toml::file(path))
            };
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> ConfigResult<Self> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let exporter = &self.exporter;

        if exporter.interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "exporter.interval",
                "Interval must be greater than zero",
            ));
        }
        if exporter.checkpoint_lines == 0 {
            return Err(ConfigError::invalid_value(
                "exporter.checkpoint_lines",
                "Checkpoint interval must be at least one line",
            ));
        }
        if exporter.retry_attempts == 0 {
            return Err(ConfigError::invalid_value(
                "exporter.retry_attempts",
                "At least one attempt is required",
            ));
        }
        if !exporter.metrics_path.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "exporter.metrics_path",
                "Metrics path must start with '/'",
            ));
        }
        if matches!(exporter.metrics_path.as_str(), "/" | "/health") {
            return Err(ConfigError::invalid_value(
                "exporter.metrics_path",
                "Metrics path collides with a built-in route",
            ));
        }
        if exporter.listen_address.trim().is_empty() {
            return Err(ConfigError::missing_field("exporter.listen_address"));
        }
        if exporter.log_file.as_os_str().is_empty() {
            return Err(ConfigError::missing_field("exporter.log_file"));
        }
        if exporter.position_file.file_name().is_none() {
            return Err(ConfigError::invalid_value(
                "exporter.position_file",
                "Position file must name a file",
            ));
        }
        if exporter
            .known_status_file
            .as_ref()
            .is_some_and(|p| p.file_name().is_none())
        {
            return Err(ConfigError::invalid_value(
                "exporter.known_status_file",
                "Known status file must name a file",
            ));
        }

        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("Unknown level '{}'", self.logging.level),
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("Unknown format '{}' (expected pretty, compact or json)", self.logging.format),
            ));
        }

        self.log_format.resolve()?;
        self.classifier()?;
        Ok(())
    }

    /// Compile the monitored-domain rules
    pub fn classifier(&self) -> ConfigResult<DomainClassifier> {
        DomainClassifier::from_config(&self.monitored_domains, &self.domain_patterns)
    }

    /// Default configuration rendered as TOML, with one example of each
    /// monitored-domain rule kind
    pub fn generate_default_config() -> ConfigResult<String> {
        let mut config = Self::default();
        config.exporter.known_status_file = Some(PathBuf::from(DEFAULT_KNOWN_STATUS_FILE));
        config.monitored_domains.push(MonitoredDomainConfig {
            host: "api.example.com".into(),
            port: Some(443),
            labels: [("team".to_string(), "platform".to_string())].into_iter().collect(),
        });
        config.domain_patterns.push(DomainPatternConfig {
            pattern: "*.cdn.example.com".into(),
            labels: [("team".to_string(), "web".to_string())].into_iter().collect(),
        });
        toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// Exporter Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterSettings {
    /// Access log to tail
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Where the resume position is persisted
    #[serde(default = "default_position_file")]
    pub position_file: PathBuf,

    /// HTTP listen address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Path serving the text exposition
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Time between ingestion passes
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Lines between periodic position checkpoints
    #[serde(default = "default_checkpoint_lines")]
    pub checkpoint_lines: u64,

    /// Attempts for position and textfile writes
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between attempts of a log read or state write
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Optional file receiving the exposition after every pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub textfile_output: Option<PathBuf>,

    /// Optional file remembering every cache status seen, so their series
    /// are exported from startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_status_file: Option<PathBuf>,

    /// Time the HTTP responder gets to drain after the final pass
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            position_file: default_position_file(),
            listen_address: default_listen_address(),
            metrics_path: default_metrics_path(),
            interval: default_interval(),
            checkpoint_lines: default_checkpoint_lines(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            textfile_output: None,
            known_status_file: None,
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl ExporterSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay)
    }
}

fn default_log_file() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_FILE)
}

fn default_position_file() -> PathBuf {
    PathBuf::from(DEFAULT_POSITION_FILE)
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(DEFAULT_INTERVAL_SECS)
}

fn default_checkpoint_lines() -> u64 {
    DEFAULT_CHECKPOINT_LINES
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(DEFAULT_RETRY_DELAY_MS)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)
}

// ----------------------------------------------------------------------------
// Global Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Export basic per-domain series for every observed domain
    #[serde(default = "default_true")]
    pub track_all_domains: bool,

    /// Individually tracked domains before overflow (0 = default)
    #[serde(default = "default_max_domains")]
    pub max_domains: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            track_all_domains: true,
            max_domains: DEFAULT_MAX_DOMAINS,
        }
    }
}

impl GlobalSettings {
    pub fn effective_max_domains(&self) -> usize {
        if self.max_domains == 0 {
            DEFAULT_MAX_DOMAINS
        } else {
            self.max_domains
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_domains() -> usize {
    DEFAULT_MAX_DOMAINS
}

// ----------------------------------------------------------------------------
// Log Format
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFormatConfig {
    /// squid_native, squid_combined or custom
    #[serde(rename = "type", default = "default_format_type")]
    pub kind: String,

    /// Field name -> column index; replaces the preset when non-empty
    #[serde(default)]
    pub fields: BTreeMap<String, usize>,

    /// "unix" or a strftime layout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_unit: Option<DurationUnit>,
}

impl Default for LogFormatConfig {
    fn default() -> Self {
        Self {
            kind: default_format_type(),
            fields: BTreeMap::new(),
            timestamp_format: None,
            duration_unit: None,
        }
    }
}

fn default_format_type() -> String {
    "squid_native".to_string()
}

const SQUID_NATIVE_FIELDS: &[(&str, usize)] = &[
    ("timestamp", 0),
    ("duration", 1),
    ("client_ip", 2),
    ("result_code", 3),
    ("bytes", 4),
    ("method", 5),
    ("url", 6),
    ("rfc931", 7),
    ("hierarchy", 8),
    ("content_type", 9),
];

const SQUID_COMBINED_EXTRA_FIELDS: &[(&str, usize)] = &[("referer", 10), ("user_agent", 11)];

impl LogFormatConfig {
    /// Resolve presets and defaults into the parser's field map.
    pub fn resolve(&self) -> ConfigResult<LogFormatSpec> {
        let preset: Vec<(&str, usize)> = match self.kind.as_str() {
            "squid_native" => SQUID_NATIVE_FIELDS.to_vec(),
            "squid_combined" => SQUID_NATIVE_FIELDS
                .iter()
                .chain(SQUID_COMBINED_EXTRA_FIELDS)
                .copied()
                .collect(),
            "custom" => Vec::new(),
            other => {
                return Err(ConfigError::UnknownLogFormat {
                    name: other.to_string(),
                })
            }
        };

        let fields: BTreeMap<String, usize> = if self.fields.is_empty() {
            preset.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
        } else {
            self.fields.clone()
        };

        let require = |name: &str| -> ConfigResult<usize> {
            fields
                .get(name)
                .copied()
                .ok_or_else(|| ConfigError::missing_field(format!("log_format.fields.{}", name)))
        };
        // Checked in a fixed order so the error names the first gap
        for &name in REQUIRED_FIELDS {
            require(name)?;
        }

        let timestamp_format = match (&self.timestamp_format, self.kind.as_str()) {
            (Some(fmt), _) if !fmt.trim().is_empty() => fmt.clone(),
            (_, "custom") => DEFAULT_CUSTOM_TIMESTAMP_FORMAT.to_string(),
            _ => UNIX_TIMESTAMP_FORMAT.to_string(),
        };

        Ok(LogFormatSpec {
            timestamp: require("timestamp")?,
            duration: require("duration")?,
            result_code: require("result_code")?,
            bytes: require("bytes")?,
            method: require("method")?,
            url: require("url")?,
            request_bytes: fields.get("request_bytes").copied(),
            max_index: fields.values().copied().max().unwrap_or(0),
            duration_unit: self.duration_unit.unwrap_or_default(),
            timestamp_format: TimestampFormat::from_config(&timestamp_format),
        })
    }
}

// ----------------------------------------------------------------------------
// Monitored Domains
// ----------------------------------------------------------------------------

/// Exact monitored domain; no port means any port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredDomainConfig {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub labels: LabelSet,
}

/// Wildcard monitored domain (`*.example.com`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainPatternConfig {
    pub pattern: String,
    #[serde(default)]
    pub labels: LabelSet,
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
