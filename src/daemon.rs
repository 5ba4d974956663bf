// ============================================================================
// EXPORTER DAEMON
// ============================================================================
// Scheduling around the run aggregator:
// - one pass at startup, then one per interval tick
// - passes never overlap and run on the blocking pool
// - on SIGINT/SIGTERM: one final pass, then the HTTP responder is stopped
//   within the configured grace period
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::aggregator::{RunAggregator, RunReport};
use crate::config::ExporterConfig;
use crate::constants::EXPORTER_VERSION;
use crate::error::{ExporterError, ExporterResult};
use crate::metrics::ExporterMetrics;
use crate::server;

/// Which trigger started a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTrigger {
    Startup,
    Interval,
    Shutdown,
}

impl PassTrigger {
    /// Label value used in log events
    pub fn as_str(&self) -> &'static str {
        match self {
            PassTrigger::Startup => "startup",
            PassTrigger::Interval => "interval",
            PassTrigger::Shutdown => "shutdown",
        }
    }
}

/// Owns the aggregator, the registry and the shutdown signal.
pub struct Exporter {
    config: ExporterConfig,
    metrics: Arc<ExporterMetrics>,
    aggregator: Arc<Mutex<RunAggregator>>,
    shutdown: Arc<Notify>,
}

impl Exporter {
    /// Build the registry and the aggregator from a validated config.
    ///
    /// Nothing is bound or read yet; the first pass happens in `run` or
    /// `run_once`.
    pub fn new(config: ExporterConfig) -> ExporterResult<Self> {
        let classifier = config.classifier()?;
        let metrics = Arc::new(ExporterMetrics::new(classifier.label_keys())?);
        let aggregator = RunAggregator::new(&config, Arc::clone(&metrics))?;

        info!(
            target: "squid_exporter::engine",
            log_file = %config.exporter.log_file.display(),
            position_file = %config.exporter.position_file.display(),
            monitored_rules = classifier.rule_count(),
            track_all_domains = config.global.track_all_domains,
            max_domains = config.global.effective_max_domains(),
            "Exporter configured"
        );

        Ok(Self {
            config,
            metrics,
            aggregator: Arc::new(Mutex::new(aggregator)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Shared handle to the registry the HTTP responder serves
    pub fn metrics(&self) -> Arc<ExporterMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Request a graceful stop; safe to call before `run` awaits it
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run a single pass on the blocking pool.
    ///
    /// Waits for any pass already in progress, so passes never overlap.
    pub async fn run_once(&self) -> ExporterResult<RunReport> {
        let aggregator = Arc::clone(&self.aggregator);
        tokio::task::spawn_blocking(move || aggregator.lock().run())
            .await
            .map_err(|e| ExporterError::internal(format!("ingestion task failed: {}", e)))?
    }

    /// Run a pass and log the outcome; failures never stop the daemon.
    async fn pass(&self, trigger: PassTrigger) {
        match self.run_once().await {
            Ok(report) if !report.position_saved => {
                warn!(
                    target: "squid_exporter::engine",
                    trigger = trigger.as_str(),
                    "Pass published metrics but the position only lives in memory"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    target: "squid_exporter::engine",
                    trigger = trigger.as_str(),
                    category = e.category(),
                    recoverable = e.is_recoverable(),
                    hint = e.recovery_hint().as_str(),
                    error = %e,
                    "Ingestion pass failed, previous metrics left in place"
                );
            }
        }
    }

    /// Serve metrics and run passes until a shutdown signal arrives.
    ///
    /// Returns early with an error if the listener cannot be bound or the
    /// metrics server stops on its own.
    pub async fn run(&self) -> ExporterResult<()> {
        info!(
            target: "squid_exporter::engine",
            version = EXPORTER_VERSION,
            listen = %self.config.exporter.listen_address,
            interval = %humantime::format_duration(self.config.exporter.interval),
            "Starting exporter"
        );

        let listener = server::bind(&self.config.exporter.listen_address).await?;
        let app = server::router(self.metrics(), &self.config.exporter.metrics_path);
        let server_stop = Arc::new(Notify::new());
        let stop = Arc::clone(&server_stop);
        let mut server_task = tokio::spawn(server::serve(listener, app, async move {
            stop.notified().await;
        }));

        spawn_signal_listener(Arc::clone(&self.shutdown))?;

        self.pass(PassTrigger::Startup).await;

        let mut ticker = interval(self.config.exporter.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the startup pass covered it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.pass(PassTrigger::Interval).await,
                _ = self.shutdown.notified() => {
                    info!(target: "squid_exporter::engine", "Shutdown requested");
                    break;
                }
                result = &mut server_task => {
                    return match result {
                        Ok(Ok(())) => Err(ExporterError::internal("metrics server stopped unexpectedly")),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(ExporterError::internal(format!("metrics server task failed: {}", e))),
                    };
                }
            }
        }

        let shutdown_start = Instant::now();
        self.pass(PassTrigger::Shutdown).await;

        server_stop.notify_one();
        match timeout(self.config.exporter.shutdown_grace, &mut server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(target: "squid_exporter::engine", error = %e, "Metrics server exited with error"),
            Ok(Err(e)) => warn!(target: "squid_exporter::engine", error = %e, "Metrics server task failed"),
            Err(_) => {
                warn!(
                    target: "squid_exporter::engine",
                    grace_ms = self.config.exporter.shutdown_grace.as_millis() as u64,
                    "Metrics server did not drain in time, aborting"
                );
                server_task.abort();
            }
        }

        info!(
            target: "squid_exporter::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Exporter shutdown complete"
        );
        Ok(())
    }
}

#[cfg(unix)]
fn spawn_signal_listener(shutdown: Arc<Notify>) -> ExporterResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!(target: "squid_exporter::engine", "Received SIGTERM"),
            _ = sigint.recv() => info!(target: "squid_exporter::engine", "Received SIGINT"),
        }
        shutdown.notify_one();
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listener(shutdown: Arc<Notify>) -> ExporterResult<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "squid_exporter::engine", "Received Ctrl-C");
        }
        shutdown.notify_one();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn config_for(dir: &std::path::Path) -> ExporterConfig {
        let mut config = ExporterConfig::default();
        config.exporter.log_file = dir.join("access.log");
        config.exporter.position_file = dir.join("position.json");
        config.exporter.listen_address = "127.0.0.1:0".into();
        config.exporter.interval = Duration::from_millis(50);
        config.exporter.retry_delay = Duration::from_millis(10);
        config.exporter.shutdown_grace = Duration::from_secs(1);
        config
    }

    #[tokio::test]
    async fn test_run_once_counts_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("access.log"),
            "1700000000.000 150 10.0.0.1 TCP_MISS/200 1024 GET http://example.com/ - HIER_DIRECT/1.2.3.4 text/html\n",
        )
        .unwrap();

        let exporter = Exporter::new(config_for(dir.path())).unwrap();
        let report = exporter.run_once().await.unwrap();

        assert_eq!(report.lines_parsed, 1);
        assert_eq!(
            exporter.metrics().sample_value("squid_connections_total", &[]),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_shutdown_runs_final_pass() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("access.log");
        fs::write(&log, "").unwrap();

        let exporter = Arc::new(Exporter::new(config_for(dir.path())).unwrap());
        let runner = Arc::clone(&exporter);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(120)).await;
        fs::write(
            &log,
            "1700000000.000 150 10.0.0.1 TCP_HIT/200 10 GET http://example.com/ - HIER_NONE/- -\n",
        )
        .unwrap();
        exporter.shutdown();

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
        assert_eq!(
            exporter
                .metrics()
                .sample_value("squid_cache_status_total", &[("status", "TCP_HIT")]),
            Some(1.0)
        );
        assert!(dir.path().join("position.json").exists());
    }

    #[tokio::test]
    async fn test_missing_log_fails_pass_but_not_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(config_for(dir.path())).unwrap();

        let err = exporter.run_once().await.unwrap_err();
        assert_eq!(err.category(), "scan");
        assert_eq!(
            exporter
                .metrics()
                .sample_value("squid_exporter_runs_total", &[("outcome", "failure")]),
            Some(1.0)
        );
    }
}
