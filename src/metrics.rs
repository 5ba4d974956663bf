// ============================================================================
// METRIC EXPOSITION
// ============================================================================
// Maps pass results onto a prometheus Registry. Counters only move through
// CounterDelta increments; gauges are set to the latest pass's values.
// A publish takes the write side of a lock that scrapes take for reading,
// so a scrape never sees half of a pass.
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::aggregator::RunReport;
use crate::delta::CounterDelta;
use crate::error::{ExporterError, ExporterResult, OutputError};
use crate::parser::{StatusCategory, MILLISECOND_BUCKETS, SECOND_BUCKETS};

// ----------------------------------------------------------------------------
// Series Families
// ----------------------------------------------------------------------------

/// Traffic counters derived from the access log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CounterFamily {
    Connections,
    DurationMilliseconds,
    DurationSeconds,
    CacheStatus,
    HttpResponses,
    HttpResponsesByCategory,
    AllDomainsRequests,
    AllDomainsResponses,
    AllDomainsBytes,
    MonitoredRequests,
    MonitoredResponses,
    MonitoredBytes,
}

impl CounterFamily {
    pub const ALL: [CounterFamily; 12] = [
        CounterFamily::Connections,
        CounterFamily::DurationMilliseconds,
        CounterFamily::DurationSeconds,
        CounterFamily::CacheStatus,
        CounterFamily::HttpResponses,
        CounterFamily::HttpResponsesByCategory,
        CounterFamily::AllDomainsRequests,
        CounterFamily::AllDomainsResponses,
        CounterFamily::AllDomainsBytes,
        CounterFamily::MonitoredRequests,
        CounterFamily::MonitoredResponses,
        CounterFamily::MonitoredBytes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CounterFamily::Connections => "squid_connections_total",
            CounterFamily::DurationMilliseconds => "squid_request_duration_milliseconds_total",
            CounterFamily::DurationSeconds => "squid_request_duration_seconds_total",
            CounterFamily::CacheStatus => "squid_cache_status_total",
            CounterFamily::HttpResponses => "squid_http_responses_total",
            CounterFamily::HttpResponsesByCategory => "squid_http_responses_by_category_total",
            CounterFamily::AllDomainsRequests => "squid_all_domains_requests_total",
            CounterFamily::AllDomainsResponses => "squid_all_domains_http_responses_total",
            CounterFamily::AllDomainsBytes => "squid_all_domains_bytes_total",
            CounterFamily::MonitoredRequests => "squid_monitored_domains_requests_total",
            CounterFamily::MonitoredResponses => "squid_monitored_domains_http_responses_total",
            CounterFamily::MonitoredBytes => "squid_monitored_domains_bytes_total",
        }
    }

    fn help(self) -> &'static str {
        match self {
            CounterFamily::Connections => "Total number of requests logged by the proxy",
            CounterFamily::DurationMilliseconds => "Requests by millisecond latency interval",
            CounterFamily::DurationSeconds => "Requests by second latency interval",
            CounterFamily::CacheStatus => "Requests by cache status",
            CounterFamily::HttpResponses => "Responses by HTTP status code",
            CounterFamily::HttpResponsesByCategory => "Responses by HTTP status class",
            CounterFamily::AllDomainsRequests => "Requests per destination domain",
            CounterFamily::AllDomainsResponses => "Responses per destination domain by status class",
            CounterFamily::AllDomainsBytes => "Bytes per destination domain by direction",
            CounterFamily::MonitoredRequests => "Requests per monitored domain",
            CounterFamily::MonitoredResponses => "Responses per monitored domain by status code",
            CounterFamily::MonitoredBytes => "Bytes per monitored domain by direction",
        }
    }

    fn base_labels(self) -> &'static [&'static str] {
        match self {
            CounterFamily::Connections => &[],
            CounterFamily::DurationMilliseconds | CounterFamily::DurationSeconds => &["interval"],
            CounterFamily::CacheStatus => &["status"],
            CounterFamily::HttpResponses => &["code", "category"],
            CounterFamily::HttpResponsesByCategory => &["category"],
            CounterFamily::AllDomainsRequests | CounterFamily::MonitoredRequests => &["host", "port"],
            CounterFamily::AllDomainsResponses => &["host", "port", "category"],
            CounterFamily::MonitoredResponses => &["host", "port", "code", "category"],
            CounterFamily::AllDomainsBytes | CounterFamily::MonitoredBytes => {
                &["host", "port", "direction"]
            }
        }
    }

    fn carries_custom_labels(self) -> bool {
        matches!(
            self,
            CounterFamily::MonitoredRequests
                | CounterFamily::MonitoredResponses
                | CounterFamily::MonitoredBytes
        )
    }
}

/// Per-monitored-domain gauges, labelled `{host, port, <custom>}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GaugeFamily {
    DurationAvg,
    DurationP50,
    DurationP90,
    DurationP95,
    DurationP99,
    CacheHitRatio,
}

impl GaugeFamily {
    pub const ALL: [GaugeFamily; 6] = [
        GaugeFamily::DurationAvg,
        GaugeFamily::DurationP50,
        GaugeFamily::DurationP90,
        GaugeFamily::DurationP95,
        GaugeFamily::DurationP99,
        GaugeFamily::CacheHitRatio,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GaugeFamily::DurationAvg => "squid_monitored_domains_duration_seconds_avg",
            GaugeFamily::DurationP50 => "squid_monitored_domains_duration_seconds_p50",
            GaugeFamily::DurationP90 => "squid_monitored_domains_duration_seconds_p90",
            GaugeFamily::DurationP95 => "squid_monitored_domains_duration_seconds_p95",
            GaugeFamily::DurationP99 => "squid_monitored_domains_duration_seconds_p99",
            GaugeFamily::CacheHitRatio => "squid_monitored_domains_cache_hit_ratio",
        }
    }

    fn help(self) -> &'static str {
        match self {
            GaugeFamily::DurationAvg => "Mean request duration in the last pass",
            GaugeFamily::DurationP50 => "Median request duration in the last pass",
            GaugeFamily::DurationP90 => "90th percentile request duration in the last pass",
            GaugeFamily::DurationP95 => "95th percentile request duration in the last pass",
            GaugeFamily::DurationP99 => "99th percentile request duration in the last pass",
            GaugeFamily::CacheHitRatio => "Cache hits over hits plus misses in the last pass",
        }
    }
}

/// A gauge value to set
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSample {
    pub family: GaugeFamily,
    pub labels: Vec<String>,
    pub value: f64,
}

/// Everything one pass publishes, applied under a single write lock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishBatch {
    pub counters: Vec<CounterDelta>,
    pub gauges: Vec<GaugeSample>,
}

impl PublishBatch {
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Self Metrics
// ----------------------------------------------------------------------------

struct SelfMetrics {
    runs: IntCounterVec,
    errors: IntCounterVec,
    lines: IntCounterVec,
    rotations: IntCounterVec,
    position_bytes: IntGauge,
    tracked_domains: IntGauge,
    overflow_domains: IntGauge,
    last_run_duration: Gauge,
    last_run_timestamp: Gauge,
    last_entry_timestamp: Gauge,
}

impl SelfMetrics {
    fn register(registry: &Registry) -> ExporterResult<Self> {
        let runs = IntCounterVec::new(
            Opts::new("squid_exporter_runs_total", "Ingestion passes by outcome"),
            &["outcome"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("squid_exporter_errors_total", "Exporter errors by category"),
            &["category"],
        )?;
        let lines = IntCounterVec::new(
            Opts::new("squid_exporter_lines_total", "Access log lines read by result"),
            &["result"],
        )?;
        let rotations = IntCounterVec::new(
            Opts::new(
                "squid_exporter_log_rotations_total",
                "Times the tracked offset was reset",
            ),
            &["kind"],
        )?;
        let position_bytes = IntGauge::new(
            "squid_exporter_position_bytes",
            "Byte offset reached in the access log",
        )?;
        let tracked_domains = IntGauge::new(
            "squid_exporter_tracked_domains",
            "Domains with an individual all-domains series",
        )?;
        let overflow_domains = IntGauge::new(
            "squid_exporter_overflow_domains",
            "Domains folded into the overflow bucket in the last pass",
        )?;
        let last_run_duration = Gauge::new(
            "squid_exporter_last_run_duration_seconds",
            "Wall time of the last pass",
        )?;
        let last_run_timestamp = Gauge::new(
            "squid_exporter_last_run_timestamp_seconds",
            "Unix time the last successful pass finished",
        )?;
        let last_entry_timestamp = Gauge::new(
            "squid_exporter_last_entry_timestamp_seconds",
            "Timestamp of the newest access log entry seen",
        )?;

        for outcome in ["success", "failure"] {
            runs.with_label_values(&[outcome]);
        }
        for result in ["parsed", "malformed"] {
            lines.with_label_values(&[result]);
        }

        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(lines.clone()))?;
        registry.register(Box::new(rotations.clone()))?;
        registry.register(Box::new(position_bytes.clone()))?;
        registry.register(Box::new(tracked_domains.clone()))?;
        registry.register(Box::new(overflow_domains.clone()))?;
        registry.register(Box::new(last_run_duration.clone()))?;
        registry.register(Box::new(last_run_timestamp.clone()))?;
        registry.register(Box::new(last_entry_timestamp.clone()))?;

        Ok(Self {
            runs,
            errors,
            lines,
            rotations,
            position_bytes,
            tracked_domains,
            overflow_domains,
            last_run_duration,
            last_run_timestamp,
            last_entry_timestamp,
        })
    }
}

// ----------------------------------------------------------------------------
// Exporter Metrics
// ----------------------------------------------------------------------------

/// The registry plus handles to every family the exporter writes
pub struct ExporterMetrics {
    registry: Registry,
    counters: HashMap<CounterFamily, IntCounterVec>,
    gauges: HashMap<GaugeFamily, GaugeVec>,
    internal: SelfMetrics,
    publish_lock: RwLock<()>,
}

impl fmt::Debug for ExporterMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterMetrics")
            .field("counter_families", &self.counters.len())
            .field("gauge_families", &self.gauges.len())
            .finish_non_exhaustive()
    }
}

impl ExporterMetrics {
    /// Register all families. `custom_label_keys` extends the label set of
    /// the monitored-domain families and must be the classifier's keys.
    pub fn new(custom_label_keys: &[String]) -> ExporterResult<Self> {
        let registry = Registry::new();

        let mut counters = HashMap::with_capacity(CounterFamily::ALL.len());
        for family in CounterFamily::ALL {
            let mut labels: Vec<&str> = family.base_labels().to_vec();
            if family.carries_custom_labels() {
                labels.extend(custom_label_keys.iter().map(String::as_str));
            }
            let vec = IntCounterVec::new(Opts::new(family.name(), family.help()), &labels)?;
            registry.register(Box::new(vec.clone()))?;
            counters.insert(family, vec);
        }

        let gauge_labels: Vec<&str> = ["host", "port"]
            .into_iter()
            .chain(custom_label_keys.iter().map(String::as_str))
            .collect();
        let mut gauges = HashMap::with_capacity(GaugeFamily::ALL.len());
        for family in GaugeFamily::ALL {
            let vec = GaugeVec::new(Opts::new(family.name(), family.help()), &gauge_labels)?;
            registry.register(Box::new(vec.clone()))?;
            gauges.insert(family, vec);
        }

        let internal = SelfMetrics::register(&registry)?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        let metrics = Self {
            registry,
            counters,
            gauges,
            internal,
            publish_lock: RwLock::new(()),
        };
        metrics.seed_fixed_series()?;
        Ok(metrics)
    }

    /// Series whose label values are known up front exist from the first
    /// scrape, at zero.
    fn seed_fixed_series(&self) -> ExporterResult<()> {
        self.seed(CounterFamily::Connections, &[])?;
        for bucket in MILLISECOND_BUCKETS {
            self.seed(CounterFamily::DurationMilliseconds, &[bucket])?;
        }
        for bucket in SECOND_BUCKETS {
            self.seed(CounterFamily::DurationSeconds, &[bucket])?;
        }
        for category in StatusCategory::ALL {
            self.seed(CounterFamily::HttpResponsesByCategory, &[category.as_str()])?;
        }
        Ok(())
    }

    /// Create a counter series at zero without moving it
    pub fn seed(&self, family: CounterFamily, labels: &[&str]) -> ExporterResult<()> {
        let vec = self.counter_vec(family)?;
        vec.get_metric_with_label_values(labels)?;
        Ok(())
    }

    fn counter_vec(&self, family: CounterFamily) -> ExporterResult<&IntCounterVec> {
        self.counters
            .get(&family)
            .ok_or_else(|| ExporterError::internal(format!("unregistered counter {}", family.name())))
    }

    fn gauge_vec(&self, family: GaugeFamily) -> ExporterResult<&GaugeVec> {
        self.gauges
            .get(&family)
            .ok_or_else(|| ExporterError::internal(format!("unregistered gauge {}", family.name())))
    }

    /// Apply one pass's counter increments and gauge values atomically with
    /// respect to scrapes. Every series is resolved before any is touched,
    /// so a bad label set leaves the registry exactly as it was.
    pub fn publish(&self, batch: &PublishBatch) -> ExporterResult<()> {
        let _guard = self.publish_lock.write();

        let mut counters = Vec::with_capacity(batch.counters.len());
        for CounterDelta { key, delta } in &batch.counters {
            let values: Vec<&str> = key.labels.iter().map(String::as_str).collect();
            let counter = self.counter_vec(key.family)?.get_metric_with_label_values(&values)?;
            counters.push((counter, *delta));
        }

        let mut gauges = Vec::with_capacity(batch.gauges.len());
        for sample in &batch.gauges {
            let values: Vec<&str> = sample.labels.iter().map(String::as_str).collect();
            let gauge = self.gauge_vec(sample.family)?.get_metric_with_label_values(&values)?;
            gauges.push((gauge, sample.value));
        }

        for (counter, delta) in counters {
            counter.inc_by(delta);
        }
        for (gauge, value) in gauges {
            gauge.set(value);
        }

        Ok(())
    }

    /// Update exporter self-metrics after a successful pass
    pub fn record_run(&self, report: &RunReport) {
        let _guard = self.publish_lock.write();
        let m = &self.internal;

        m.runs.with_label_values(&["success"]).inc();
        m.lines.with_label_values(&["parsed"]).inc_by(report.lines_parsed);
        m.lines.with_label_values(&["malformed"]).inc_by(report.lines_malformed);
        if report.resume.is_reset() {
            m.rotations.with_label_values(&[report.resume.reason.as_str()]).inc();
        }
        m.position_bytes.set(clamp_i64(report.end_offset));
        m.tracked_domains.set(clamp_i64(report.tracked_domains as u64));
        m.overflow_domains.set(clamp_i64(report.overflow_domains as u64));
        m.last_run_duration.set(report.elapsed.as_secs_f64());
        m.last_run_timestamp.set(report.finished_at.timestamp_millis() as f64 / 1000.0);
        if let Some(ts) = report.newest_entry {
            m.last_entry_timestamp.set(ts.timestamp_millis() as f64 / 1000.0);
        }
    }

    /// Count a failed pass; exported traffic series stay as they were
    pub fn record_failure(&self, error: &ExporterError, elapsed: Duration) {
        let _guard = self.publish_lock.write();
        self.internal.runs.with_label_values(&["failure"]).inc();
        self.internal.errors.with_label_values(&[error.category()]).inc();
        self.internal.last_run_duration.set(elapsed.as_secs_f64());
    }

    /// Count an error that did not fail the pass
    pub fn record_error(&self, category: &str) {
        self.internal.errors.with_label_values(&[category]).inc();
    }

    /// Text exposition of the whole registry
    pub fn encode_text(&self) -> ExporterResult<String> {
        let families = {
            let _guard = self.publish_lock.read();
            self.registry.gather()
        };

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            OutputError::Encode {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Current value of one series, matched on its full label set
    pub fn sample_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let families = {
            let _guard = self.publish_lock.read();
            self.registry.gather()
        };
        let family = families.iter().find(|f| f.get_name() == name)?;
        family
            .get_metric()
            .iter()
            .find(|m| {
                m.get_label().len() == labels.len()
                    && labels.iter().all(|(k, v)| {
                        m.get_label()
                            .iter()
                            .any(|pair| pair.get_name() == *k && pair.get_value() == *v)
                    })
            })
            .map(|m| {
                if m.has_counter() {
                    m.get_counter().get_value()
                } else {
                    m.get_gauge().get_value()
                }
            })
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::MetricKey;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_publish_counters_and_gauges() {
        let metrics = ExporterMetrics::new(&strings(&["team"])).unwrap();
        let batch = PublishBatch {
            counters: vec![
                CounterDelta {
                    key: MetricKey::new(CounterFamily::Connections, vec![]),
                    delta: 3,
                },
                CounterDelta {
                    key: MetricKey::new(
                        CounterFamily::MonitoredRequests,
                        strings(&["api.example.com", "443", "x"]),
                    ),
                    delta: 2,
                },
            ],
            gauges: vec![GaugeSample {
                family: GaugeFamily::CacheHitRatio,
                labels: strings(&["api.example.com", "443", "x"]),
                value: 0.5,
            }],
        };

        metrics.publish(&batch).unwrap();
        metrics.publish(&batch).unwrap();

        assert_eq!(metrics.sample_value("squid_connections_total", &[]), Some(6.0));
        assert_eq!(
            metrics.sample_value(
                "squid_monitored_domains_requests_total",
                &[("host", "api.example.com"), ("port", "443"), ("team", "x")]
            ),
            Some(4.0)
        );
        assert_eq!(
            metrics.sample_value(
                "squid_monitored_domains_cache_hit_ratio",
                &[("host", "api.example.com"), ("port", "443"), ("team", "x")]
            ),
            Some(0.5)
        );
    }

    #[test]
    fn test_label_arity_mismatch_leaves_registry_untouched() {
        let metrics = ExporterMetrics::new(&[]).unwrap();
        let batch = PublishBatch {
            counters: vec![
                CounterDelta {
                    key: MetricKey::new(CounterFamily::Connections, vec![]),
                    delta: 4,
                },
                CounterDelta {
                    key: MetricKey::new(CounterFamily::CacheStatus, strings(&["TCP_MISS", "extra"])),
                    delta: 1,
                },
            ],
            gauges: vec![],
        };
        assert!(matches!(metrics.publish(&batch), Err(ExporterError::Metrics(_))));
        assert_eq!(metrics.sample_value("squid_connections_total", &[]), Some(0.0));
    }

    #[test]
    fn test_fixed_series_start_at_zero() {
        let metrics = ExporterMetrics::new(&[]).unwrap();

        for bucket in MILLISECOND_BUCKETS {
            assert_eq!(
                metrics.sample_value(
                    "squid_request_duration_milliseconds_total",
                    &[("interval", bucket)]
                ),
                Some(0.0)
            );
        }
        for bucket in SECOND_BUCKETS {
            assert_eq!(
                metrics.sample_value("squid_request_duration_seconds_total", &[("interval", bucket)]),
                Some(0.0)
            );
        }
        for category in StatusCategory::ALL {
            assert_eq!(
                metrics.sample_value(
                    "squid_http_responses_by_category_total",
                    &[("category", category.as_str())]
                ),
                Some(0.0)
            );
        }
        assert_eq!(
            metrics.sample_value("squid_exporter_runs_total", &[("outcome", "success")]),
            Some(0.0)
        );
    }

    #[test]
    fn test_seed_creates_series_without_moving_it() {
        let metrics = ExporterMetrics::new(&[]).unwrap();
        metrics.seed(CounterFamily::CacheStatus, &["TCP_DENIED"]).unwrap();
        assert_eq!(
            metrics.sample_value("squid_cache_status_total", &[("status", "TCP_DENIED")]),
            Some(0.0)
        );
        assert!(metrics.seed(CounterFamily::CacheStatus, &[]).is_err());
    }

    #[test]
    fn test_encode_text_contains_families() {
        let metrics = ExporterMetrics::new(&[]).unwrap();
        metrics
            .publish(&PublishBatch {
                counters: vec![CounterDelta {
                    key: MetricKey::new(CounterFamily::CacheStatus, strings(&["TCP_HIT"])),
                    delta: 1,
                }],
                gauges: vec![],
            })
            .unwrap();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("# TYPE squid_cache_status_total counter"));
        assert!(text.contains("squid_cache_status_total{status=\"TCP_HIT\"} 1"));
    }

    #[test]
    fn test_record_failure_counts_category() {
        let metrics = ExporterMetrics::new(&[]).unwrap();
        let error = ExporterError::internal("boom");
        metrics.record_failure(&error, Duration::from_millis(5));

        assert_eq!(
            metrics.sample_value("squid_exporter_runs_total", &[("outcome", "failure")]),
            Some(1.0)
        );
        assert_eq!(
            metrics.sample_value("squid_exporter_errors_total", &[("category", "internal")]),
            Some(1.0)
        );
    }
}
