// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Errors are grouped by the stage that raises them. Each carries enough
// context to decide whether the next scheduled pass can recover on its own.
// ============================================================================

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Top-level Error
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ExporterError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Position Errors ----
    #[error("Position error: {0}")]
    Position(#[from] PositionError),

    // ---- Scan Errors ----
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    // ---- Output Errors ----
    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    // ---- Registry Errors ----
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    pub fn internal(message: impl Into<String>) -> Self {
        ExporterError::Internal(message.into())
    }

    /// Check if the next scheduled pass can be expected to succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Position(e) => e.is_recoverable(),
            ExporterError::Scan(_) => true,
            ExporterError::Output(e) => e.is_recoverable(),
            ExporterError::Metrics(_) => false,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Position(_) => "position",
            ExporterError::Scan(_) => "scan",
            ExporterError::Output(_) => "output",
            ExporterError::Metrics(_) => "metrics",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ExporterError::Config(_) => RecoveryHint::FixConfiguration,
            ExporterError::Position(e) => e.recovery_hint(),
            ExporterError::Output(e) => e.recovery_hint(),
            ExporterError::Metrics(_) | ExporterError::Internal(_) => RecoveryHint::AlertOperator,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Let the next scheduled pass retry
    RetryWithBackoff,
    /// Fix configuration and restart
    FixConfiguration,
    /// Alert operator for manual intervention
    AlertOperator,
}

impl RecoveryHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryHint::RetryWithBackoff => "retry_with_backoff",
            RecoveryHint::FixConfiguration => "fix_configuration",
            RecoveryHint::AlertOperator => "alert_operator",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Unknown log format type '{name}' (expected squid_native, squid_combined or custom)")]
    UnknownLogFormat { name: String },

    #[error("Invalid domain pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidPattern {
            pattern: pattern.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Position Errors
// ----------------------------------------------------------------------------

/// Errors from reading or persisting the position file
#[derive(Error, Debug)]
pub enum PositionError {
    #[error("Failed to read position file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Position file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Failed to write position file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

impl PositionError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PositionError::Corrupt { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PositionError::Corrupt { .. } => RecoveryHint::AlertOperator,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

// ----------------------------------------------------------------------------
// Scan Errors
// ----------------------------------------------------------------------------

/// I/O failures while reading the tracked access log
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to open log file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Failed to seek {path} to offset {offset}: {source}")]
    Seek { path: PathBuf, offset: u64, source: io::Error },

    #[error("Failed to read {path} at offset {offset}: {source}")]
    Read { path: PathBuf, offset: u64, source: io::Error },
}

// ----------------------------------------------------------------------------
// Line Errors
// ----------------------------------------------------------------------------

/// Reasons a single access-log line is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Line has {found} fields, format needs at least {required}")]
    TooFewFields { found: usize, required: usize },

    #[error("Result code '{value}' is not of the form STATUS/CODE")]
    InvalidResultCode { value: String },

    #[error("Line of {length} bytes exceeds the {limit} byte limit")]
    LineTooLong { length: usize, limit: usize },
}

// ----------------------------------------------------------------------------
// Output Errors
// ----------------------------------------------------------------------------

/// Errors from the exposition side: HTTP listener and textfile output
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to bind metrics listener on {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("Metrics server failed: {message}")]
    Serve { message: String },

    #[error("Failed to encode metrics: {message}")]
    Encode { message: String },

    #[error("Failed to write metrics textfile {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

impl OutputError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, OutputError::Bind { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            OutputError::Bind { .. } => RecoveryHint::FixConfiguration,
            OutputError::Serve { .. } => RecoveryHint::AlertOperator,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

// ----------------------------------------------------------------------------
// Result Aliases
// ----------------------------------------------------------------------------

pub type ExporterResult<T> = Result<T, ExporterError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type PositionResult<T> = Result<T, PositionError>;
