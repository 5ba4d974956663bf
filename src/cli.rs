// ============================================================================
// COMMAND LINE INTERFACE
// ============================================================================
// Subcommands:
// - run (default): serve /metrics and ingest on an interval
// - once: a single ingestion pass, report printed to stdout
// - validate / generate-config / version
// Flags override the file and environment layers of the configuration.
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::aggregator::RunReport;
use crate::config::{ExporterConfig, LoggingConfig};
use crate::constants::*;
use crate::error::{ExporterError, ExporterResult};

// ----------------------------------------------------------------------------
// Argument Parser
// ----------------------------------------------------------------------------

/// Squid access log exporter
#[derive(Parser, Debug)]
#[command(
    name = EXPORTER_NAME,
    version,
    about = "Prometheus exporter for Squid access logs",
    long_about = "Reads the Squid access log incrementally, remembers its position across \
                  restarts and log rotation, and exposes request, cache, status and \
                  per-domain metrics for Prometheus."
)]
pub struct Cli {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "SQUID_EXPORTER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Access log to read
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Position file path
    #[arg(long)]
    pub position_file: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    pub listen_address: Option<String>,

    /// HTTP path serving the exposition
    #[arg(long)]
    pub metrics_path: Option<String>,

    /// Time between ingestion passes (e.g. "30s", "1m")
    #[arg(long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Serve metrics and ingest on an interval
    Run,

    /// Run one ingestion pass and exit
    Once,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

impl Cli {
    /// Layer command line flags over the loaded configuration.
    pub fn apply_overrides(&self, config: &mut ExporterConfig) {
        if let Some(path) = &self.log_file {
            config.exporter.log_file = path.clone();
        }
        if let Some(path) = &self.position_file {
            config.exporter.position_file = path.clone();
        }
        if let Some(address) = &self.listen_address {
            config.exporter.listen_address = address.clone();
        }
        if let Some(path) = &self.metrics_path {
            config.exporter.metrics_path = path.clone();
        }
        if let Some(interval) = self.interval {
            config.exporter.interval = interval;
        }
        config.logging = self.logging_config(&config.logging);
    }

    /// `--debug` wins over `--log-level`, which wins over the file
    pub fn logging_config(&self, base: &LoggingConfig) -> LoggingConfig {
        let mut logging = base.clone();
        if self.debug {
            logging.level = "debug".to_string();
        } else if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        logging
    }
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
pub fn handle_validate(config_path: &Path, verbose: bool) -> ExporterResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match ExporterConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration validation failed!");
            println!("Error: {}", e);
            return Err(ExporterError::Config(e));
        }
    };
    let classifier = config.classifier()?;

    println!("Configuration is valid!");

    if verbose {
        println!("\nParsed configuration:");
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!("\nConfiguration Summary:");
    println!("  • Log file: {}", config.exporter.log_file.display());
    println!("  • Position file: {}", config.exporter.position_file.display());
    println!(
        "  • Listen: {}{}",
        config.exporter.listen_address, config.exporter.metrics_path
    );
    println!(
        "  • Interval: {}",
        humantime::format_duration(config.exporter.interval)
    );
    println!("  • Log format: {}", config.log_format.kind);
    println!("  • Monitored rules: {}", classifier.rule_count());
    if config.global.track_all_domains {
        println!(
            "  • All-domains tracking: on (max {} domains)",
            config.global.effective_max_domains()
        );
    } else {
        println!("  • All-domains tracking: off");
    }
    if !classifier.label_keys().is_empty() {
        println!("  • Custom labels: {}", classifier.label_keys().join(", "));
    }

    Ok(())
}

/// Handle the generate-config subcommand
pub fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

/// Handle the version subcommand
pub fn handle_version() {
    println!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Defaults:");
    println!("  • Config: {}", DEFAULT_CONFIG_PATH);
    println!("  • Listen: {}{}", DEFAULT_LISTEN_ADDRESS, DEFAULT_METRICS_PATH);
    println!("  • Interval: {}s", DEFAULT_INTERVAL_SECS);
}

/// Print the outcome of `once`
pub fn print_report(report: &RunReport) {
    println!("Pass complete ({})", report.resume.reason.as_str());
    println!("  • Bytes read: {}", report.bytes_read());
    println!("  • Lines parsed: {}", report.lines_parsed);
    println!("  • Lines malformed: {}", report.lines_malformed);
    println!("  • Domains observed: {}", report.domains_observed);
    println!("  • Tracked domains: {}", report.tracked_domains);
    if report.overflow_domains > 0 {
        println!("  • Folded into {}: {}", OVERFLOW_HOST, report.overflow_domains);
    }
    println!("  • Counter series advanced: {}", report.counters_advanced);
    println!("  • Position: {}", report.end_offset);
    if !report.position_saved {
        println!("  • Position file could not be written");
    }
    if let Some(false) = report.textfile_written {
        println!("  • Textfile output could not be written");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_to_no_subcommand() {
        let cli = Cli::try_parse_from(["squid-log-exporter"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.debug);
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let cli = Cli::try_parse_from([
            "squid-log-exporter",
            "--log-file",
            "/tmp/access.log",
            "--listen-address",
            "127.0.0.1:9999",
            "--interval",
            "15s",
            "once",
        ])
        .unwrap();

        let mut config = ExporterConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(cli.command, Some(Commands::Once));
        assert_eq!(config.exporter.log_file, PathBuf::from("/tmp/access.log"));
        assert_eq!(config.exporter.listen_address, "127.0.0.1:9999");
        assert_eq!(config.exporter.interval, Duration::from_secs(15));
        assert_eq!(config.exporter.metrics_path, DEFAULT_METRICS_PATH);
    }

    #[test]
    fn test_debug_beats_log_level() {
        let cli =
            Cli::try_parse_from(["squid-log-exporter", "--debug", "--log-level", "warn"]).unwrap();
        assert_eq!(cli.logging_config(&LoggingConfig::default()).level, "debug");

        let cli = Cli::try_parse_from(["squid-log-exporter", "-l", "warn"]).unwrap();
        assert_eq!(cli.logging_config(&LoggingConfig::default()).level, "warn");
    }

    #[test]
    fn test_rejects_bad_interval() {
        assert!(Cli::try_parse_from(["squid-log-exporter", "--interval", "soon"]).is_err());
    }

    #[test]
    fn test_generate_config_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        handle_generate_config(Some(&path)).unwrap();

        let config = ExporterConfig::load(&path).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = handle_validate(&dir.path().join("absent.toml"), false).unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
