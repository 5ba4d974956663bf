// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging via tracing-subscriber. The configured level is the
// default directive; RUST_LOG still overrides it per target.
// ============================================================================

use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::level_filters::LevelFilter;
use tracing::{info, trace, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{ExporterError, ExporterResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber and log the settings it was built from.
///
/// Fails if a subscriber is already installed, which in practice means
/// `init_logging` was called twice.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level = level_filter(&config.level);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(output_layer(config))
        .with(env_filter)
        .try_init()
        .map_err(|e| ExporterError::internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "squid_exporter::logging",
        level = %level,
        format = config.format.as_str(),
        colors = config.colors,
        source_location = config.source_location,
        rust_log = std::env::var(EnvFilter::DEFAULT_ENV).is_ok(),
        "Logging initialized"
    );
    Ok(())
}

/// Unknown levels fall back to `info`; config validation rejects them first.
fn level_filter(level: &str) -> LevelFilter {
    LevelFilter::from_str(level).unwrap_or(LevelFilter::INFO)
}

fn output_layer(config: &LoggingConfig) -> BoxedLayer {
    match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
        _ => fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
    }
}

// ----------------------------------------------------------------------------
// Performance Timer
// ----------------------------------------------------------------------------

/// Times one unit of work over the log and reports its throughput.
#[derive(Debug)]
pub struct PerfTimer {
    operation: &'static str,
    started: Instant,
    slow_after: Duration,
}

impl PerfTimer {
    /// Start timing `operation`. `finish` warns when it ran longer than
    /// `slow_after`.
    pub fn start(operation: &'static str, slow_after: Duration) -> Self {
        Self {
            operation,
            started: Instant::now(),
            slow_after,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop the timer. `lines` is how many log lines the operation covered
    /// and is used for the lines-per-second figure in the log event.
    pub fn finish(self, lines: u64) -> Duration {
        let elapsed = self.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        let lines_per_sec = lines_per_second(lines, elapsed);

        if elapsed > self.slow_after {
            warn!(
                target: "squid_exporter::perf",
                operation = self.operation,
                elapsed_ms,
                slow_after_ms = self.slow_after.as_millis() as u64,
                lines,
                lines_per_sec,
                "Slow operation"
            );
        } else {
            trace!(
                target: "squid_exporter::perf",
                operation = self.operation,
                elapsed_ms,
                lines,
                lines_per_sec,
                "Operation completed"
            );
        }

        elapsed
    }
}

fn lines_per_second(lines: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (lines as f64 / secs).round() as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("debug", LevelFilter::DEBUG)]
    #[case("WARN", LevelFilter::WARN)]
    #[case("trace", LevelFilter::TRACE)]
    #[case("verbose", LevelFilter::INFO)]
    fn test_level_filter(#[case] level: &str, #[case] expected: LevelFilter) {
        assert_eq!(level_filter(level), expected);
    }

    #[test]
    fn test_perf_timer_reports_elapsed() {
        let timer = PerfTimer::start("ingestion_pass", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.finish(100) >= Duration::from_millis(5));
    }

    #[test]
    fn test_lines_per_second() {
        assert_eq!(lines_per_second(500, Duration::from_millis(250)), 2000);
        assert_eq!(lines_per_second(500, Duration::ZERO), 0);
    }
}
