// ============================================================================
// RUN STATISTICS
// ============================================================================
// Per-pass accumulation (global and per domain) and the latency summary
// computed for monitored domains. Nothing here outlives a single pass.
// ============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::constants::PERCENTILES;
use crate::domains::DomainClassifier;
use crate::host::Target;
use crate::parser::{millisecond_bucket, second_bucket, CacheOutcome, ParsedEntry, StatusCategory};

// ----------------------------------------------------------------------------
// Percentiles
// ----------------------------------------------------------------------------

/// Nearest-rank percentile: sort ascending, take index `floor(n * p)`
/// clamped to the last element. Empty input yields 0.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * p) as usize).min(sorted.len() - 1);
    sorted[index]
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Latency gauges exported per monitored domain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let [p50, p90, p95, p99] = PERCENTILES.map(|p| percentile_sorted(&sorted, p));

        Some(Self {
            avg: mean(samples),
            p50,
            p90,
            p95,
            p99,
        })
    }
}

// ----------------------------------------------------------------------------
// Domain Accumulator
// ----------------------------------------------------------------------------

/// What one pass saw for a single (host, port)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainAccumulator {
    /// Whether the domain matched a monitored rule when first seen this pass
    pub monitored: bool,
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub responses_by_code: HashMap<String, HashMap<StatusCategory, u64>>,
    pub responses_by_category: HashMap<StatusCategory, u64>,
    /// Latency samples in seconds, monitored domains only
    pub durations: Vec<f64>,
    /// Cache outcomes, monitored domains only
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl DomainAccumulator {
    fn record(&mut self, entry: &ParsedEntry) {
        self.requests += 1;
        self.bytes_in += entry.request_bytes;
        self.bytes_out += entry.bytes;
        *self
            .responses_by_code
            .entry(entry.http_code.clone())
            .or_default()
            .entry(entry.category)
            .or_default() += 1;
        *self.responses_by_category.entry(entry.category).or_default() += 1;

        if self.monitored {
            self.durations.push(entry.duration_seconds);
            match entry.cache_outcome() {
                CacheOutcome::Hit => self.cache_hits += 1,
                CacheOutcome::Miss => self.cache_misses += 1,
                CacheOutcome::Neither => {}
            }
        }
    }

    /// Add another domain's counts, used to build the overflow bucket.
    /// Latency samples are not carried over.
    pub fn merge_counts(&mut self, other: &DomainAccumulator) {
        self.requests += other.requests;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        for (code, by_category) in &other.responses_by_code {
            let slot = self.responses_by_code.entry(code.clone()).or_default();
            for (category, count) in by_category {
                *slot.entry(*category).or_default() += count;
            }
        }
        for (category, count) in &other.responses_by_category {
            *self.responses_by_category.entry(*category).or_default() += count;
        }
    }

    /// Hit ratio over hits and misses, `None` when neither was seen
    pub fn cache_hit_ratio(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        (total > 0).then(|| self.cache_hits as f64 / total as f64)
    }

    pub fn latency(&self) -> Option<LatencySummary> {
        LatencySummary::from_samples(&self.durations)
    }
}

// ----------------------------------------------------------------------------
// Run Accumulator
// ----------------------------------------------------------------------------

/// Everything one pass observed, before any cardinality or delta handling
#[derive(Debug, Clone, Default)]
pub struct RunAccumulator {
    pub connections: u64,
    pub millisecond_buckets: HashMap<&'static str, u64>,
    pub second_buckets: HashMap<&'static str, u64>,
    pub cache_status_counts: HashMap<String, u64>,
    pub http_code_counts: HashMap<String, HashMap<StatusCategory, u64>>,
    pub domains: HashMap<Target, DomainAccumulator>,
    pub lines_parsed: u64,
    pub lines_malformed: u64,
    pub newest_entry: Option<DateTime<Utc>>,
}

impl RunAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one parsed line into the pass totals.
    pub fn record(&mut self, entry: &ParsedEntry, classifier: &DomainClassifier) {
        self.lines_parsed += 1;
        self.connections += 1;

        if !entry.is_tunnel() {
            *self
                .millisecond_buckets
                .entry(millisecond_bucket(entry.duration_millis))
                .or_default() += 1;
            *self
                .second_buckets
                .entry(second_bucket(entry.duration_seconds))
                .or_default() += 1;
        }

        *self
            .cache_status_counts
            .entry(entry.cache_status.clone())
            .or_default() += 1;
        *self
            .http_code_counts
            .entry(entry.http_code.clone())
            .or_default()
            .entry(entry.category)
            .or_default() += 1;

        if let Some(ts) = entry.timestamp {
            if self.newest_entry.map_or(true, |newest| ts > newest) {
                self.newest_entry = Some(ts);
            }
        }

        if let Some(target) = &entry.target {
            let domain = self.domains.entry(target.clone()).or_insert_with(|| DomainAccumulator {
                monitored: classifier.is_monitored(&target.host, target.port),
                ..DomainAccumulator::default()
            });
            domain.record(entry);
        }
    }

    pub fn record_malformed(&mut self) {
        self.lines_malformed += 1;
    }

    /// Observed targets in a stable order
    pub fn sorted_targets(&self) -> Vec<&Target> {
        let mut targets: Vec<_> = self.domains.keys().collect();
        targets.sort();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoredDomainConfig;
    use proptest::prelude::*;

    fn entry(status: &str, code: &str, target: Option<Target>, seconds: f64, bytes: u64) -> ParsedEntry {
        ParsedEntry {
            timestamp: None,
            cache_status: status.to_string(),
            http_code: code.to_string(),
            category: StatusCategory::from_code(code),
            bytes,
            request_bytes: 0,
            method: "GET".to_string(),
            target,
            duration_seconds: seconds,
            duration_millis: seconds * 1000.0,
        }
    }

    fn api_classifier() -> DomainClassifier {
        DomainClassifier::from_config(
            &[MonitoredDomainConfig {
                host: "api.example.com".to_string(),
                port: Some(443),
                labels: [("team".to_string(), "x".to_string())].into_iter().collect(),
            }],
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_percentile_boundaries() {
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[], 0.99), 0.0);
        assert_eq!(percentile(&[5.0], 0.99), 5.0);
        assert_eq!(percentile(&[5.0], 0.5), 5.0);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let samples = [0.4, 0.1, 0.3, 0.2];
        assert_eq!(percentile(&samples, 0.50), 0.3);
        assert_eq!(percentile(&samples, 0.90), 0.4);
        assert_eq!(percentile(&samples, 0.99), 0.4);
    }

    #[test]
    fn test_latency_summary() {
        let summary = LatencySummary::from_samples(&[0.10, 0.30]).unwrap();
        assert!((summary.avg - 0.20).abs() < 1e-9);
        assert!([0.10, 0.30].contains(&summary.p50));
        assert!([0.10, 0.30].contains(&summary.p90));
        assert!(LatencySummary::from_samples(&[]).is_none());
    }

    #[test]
    fn test_unmonitored_domain_skips_cache_and_latency() {
        let mut acc = RunAccumulator::new();
        let target = Target::new("example.com", 80);
        acc.record(
            &entry("TCP_MISS", "200", Some(target.clone()), 0.15, 1024),
            &DomainClassifier::default(),
        );

        assert_eq!(acc.connections, 1);
        assert_eq!(acc.millisecond_buckets.get("0-200"), Some(&1));
        assert_eq!(acc.cache_status_counts.get("TCP_MISS"), Some(&1));
        let domain = &acc.domains[&target];
        assert_eq!(domain.requests, 1);
        assert_eq!(domain.bytes_out, 1024);
        assert_eq!(domain.cache_hits, 0);
        assert_eq!(domain.cache_misses, 0);
        assert!(domain.durations.is_empty());
        assert_eq!(domain.cache_hit_ratio(), None);
    }

    #[test]
    fn test_monitored_domain_collects_extended_stats() {
        let mut acc = RunAccumulator::new();
        let classifier = api_classifier();
        let target = Target::new("api.example.com", 443);
        acc.record(&entry("TCP_HIT", "200", Some(target.clone()), 0.10, 10), &classifier);
        acc.record(&entry("TCP_MISS", "200", Some(target.clone()), 0.30, 20), &classifier);

        let domain = &acc.domains[&target];
        assert!(domain.monitored);
        assert_eq!(domain.requests, 2);
        assert_eq!(domain.cache_hit_ratio(), Some(0.5));
        assert!((domain.latency().unwrap().avg - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_tunnel_not_bucketed() {
        let mut acc = RunAccumulator::new();
        acc.record(
            &entry("TCP_TUNNEL", "200", Some(Target::new("example.com", 443)), 42.0, 5000),
            &DomainClassifier::default(),
        );
        assert_eq!(acc.connections, 1);
        assert!(acc.millisecond_buckets.is_empty());
        assert!(acc.second_buckets.is_empty());
    }

    #[test]
    fn test_merge_counts() {
        let mut overflow = DomainAccumulator::default();
        let mut a = DomainAccumulator::default();
        a.record(&entry("TCP_MISS", "404", None, 0.1, 7));
        let mut b = DomainAccumulator::default();
        b.record(&entry("TCP_MISS", "404", None, 0.1, 3));

        overflow.merge_counts(&a);
        overflow.merge_counts(&b);

        assert_eq!(overflow.requests, 2);
        assert_eq!(overflow.bytes_out, 10);
        assert_eq!(overflow.responses_by_category[&StatusCategory::ClientError], 2);
        assert_eq!(overflow.responses_by_code["404"][&StatusCategory::ClientError], 2);
    }

    proptest! {
        #[test]
        fn prop_percentile_is_a_sample(samples in prop::collection::vec(0.0f64..100.0, 1..200), p in 0.0f64..1.0) {
            let value = percentile(&samples, p);
            prop_assert!(samples.contains(&value));
        }

        #[test]
        fn prop_percentile_monotonic_in_p(samples in prop::collection::vec(0.0f64..100.0, 1..200)) {
            let values: Vec<f64> = PERCENTILES.iter().map(|p| percentile(&samples, *p)).collect();
            prop_assert!(values.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
