// ============================================================================
// RUN AGGREGATOR
// ============================================================================
// One ingestion pass is a self-contained transaction:
//   load position -> detect rotation -> scan new bytes -> classify and
//   accumulate -> emit counter deltas -> persist position
// A pass that fails before publishing leaves exported metrics untouched.
// The aggregator owns every piece of state that outlives a pass.
// ============================================================================

use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::ExporterConfig;
use crate::constants::{MAX_LINE_BYTES, SLOW_RUN_THRESHOLD_MS};
use crate::delta::{CounterLedger, MetricKey};
use crate::domains::{Admission, CardinalityController, DomainClassifier};
use crate::error::{ExporterError, ExporterResult, OutputError, ParseError, ScanError};
use crate::host::Target;
use crate::logging::PerfTimer;
use crate::metrics::{CounterFamily, ExporterMetrics, GaugeFamily, GaugeSample, PublishBatch};
use crate::parser::{parse_line, LogFormatSpec, StatusCategory};
use crate::persist::{atomic_write, RetryPolicy};
use crate::position::{file_inode, PositionTracker, ResumePoint};
use crate::stats::{DomainAccumulator, RunAccumulator};
use crate::status_store::KnownStatuses;

// ----------------------------------------------------------------------------
// Run Report
// ----------------------------------------------------------------------------

/// Summary of a completed pass
#[derive(Debug, Clone)]
pub struct RunReport {
    pub resume: ResumePoint,
    pub end_offset: u64,
    pub inode: u64,
    pub lines_parsed: u64,
    pub lines_malformed: u64,
    /// Distinct (host, port) pairs seen this pass
    pub domains_observed: usize,
    /// Of those, how many were folded into the overflow bucket
    pub overflow_domains: usize,
    /// Size of the process-lifetime all-domains set
    pub tracked_domains: usize,
    pub counters_advanced: usize,
    pub newest_entry: Option<DateTime<Utc>>,
    pub position_saved: bool,
    /// `None` when no textfile output is configured
    pub textfile_written: Option<bool>,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn bytes_read(&self) -> u64 {
        self.end_offset.saturating_sub(self.resume.offset)
    }
}

// ----------------------------------------------------------------------------
// Line Reading
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum LineRead {
    /// A complete line of this many bytes, newline included
    Line(usize),
    /// A complete line longer than the limit; its bytes were discarded
    Oversized(usize),
    /// No complete line left; `pending` bytes of a partial line remain
    End { pending: usize },
}

/// Read up to and including the next newline without buffering more than
/// `MAX_LINE_BYTES`.
fn read_line_bounded<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<LineRead> {
    buf.clear();
    let mut consumed = 0usize;
    let mut oversized = false;

    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(LineRead::End { pending: consumed });
        }

        let (chunk_len, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };

        if !oversized && buf.len() + chunk_len <= MAX_LINE_BYTES + 1 {
            buf.extend_from_slice(&available[..chunk_len]);
        } else {
            oversized = true;
            buf.clear();
        }
        reader.consume(chunk_len);
        consumed += chunk_len;

        if complete {
            return Ok(if oversized {
                LineRead::Oversized(consumed)
            } else {
                LineRead::Line(consumed)
            });
        }
    }
}

/// `read_line_bounded`, but a failed read is retried under `retry` after
/// seeking back to `line_start`, the offset the line began at.
fn read_line_retrying<R: BufRead + Seek>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    line_start: u64,
    retry: &RetryPolicy,
) -> io::Result<LineRead> {
    match read_line_bounded(reader, buf) {
        Ok(read) => Ok(read),
        Err(e) => {
            warn!(
                target: "squid_exporter::scan",
                offset = line_start,
                error = %e,
                "Read failed, retrying from line start"
            );
            std::thread::sleep(retry.delay);
            retry.run("read_log", || {
                reader.seek(SeekFrom::Start(line_start))?;
                read_line_bounded(reader, buf)
            })
        }
    }
}

fn open_log(path: &Path) -> Result<(File, Metadata), ScanError> {
    let open_error = |source| ScanError::Open {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(open_error)?;
    let meta = file.metadata().map_err(open_error)?;
    Ok((file, meta))
}

struct ScanOutcome {
    accumulator: RunAccumulator,
    end_offset: u64,
    /// Whether a checkpoint moved the stored position during the scan
    checkpointed: bool,
}

// ----------------------------------------------------------------------------
// Aggregator
// ----------------------------------------------------------------------------

/// Drives ingestion passes over one access log.
pub struct RunAggregator {
    log_file: PathBuf,
    log_name: String,
    format: LogFormatSpec,
    classifier: DomainClassifier,
    cardinality: CardinalityController,
    track_all_domains: bool,
    tracker: PositionTracker,
    ledger: CounterLedger,
    metrics: Arc<ExporterMetrics>,
    checkpoint_lines: u64,
    retry: RetryPolicy,
    textfile_output: Option<PathBuf>,
    known_statuses: Option<KnownStatuses>,
}

impl RunAggregator {
    /// Build the aggregator. Cache statuses remembered by earlier runs are
    /// seeded into `metrics` here.
    pub fn new(config: &ExporterConfig, metrics: Arc<ExporterMetrics>) -> ExporterResult<Self> {
        let retry = config.exporter.retry_policy();
        let log_file = config.exporter.log_file.clone();

        let known_statuses = match &config.exporter.known_status_file {
            Some(path) => {
                let store = KnownStatuses::load(path, retry)?;
                for status in store.iter() {
                    metrics.seed(CounterFamily::CacheStatus, &[status])?;
                }
                info!(
                    target: "squid_exporter::status_store",
                    path = %store.path().display(),
                    statuses = store.len(),
                    "Seeded known cache statuses"
                );
                Some(store)
            }
            None => None,
        };

        Ok(Self {
            log_name: log_file.to_string_lossy().into_owned(),
            log_file,
            format: config.log_format.resolve()?,
            classifier: config.classifier()?,
            cardinality: CardinalityController::new(config.global.effective_max_domains()),
            track_all_domains: config.global.track_all_domains,
            tracker: PositionTracker::new(&config.exporter.position_file, retry),
            ledger: CounterLedger::new(),
            metrics,
            checkpoint_lines: config.exporter.checkpoint_lines.max(1),
            retry,
            textfile_output: config.exporter.textfile_output.clone(),
            known_statuses,
        })
    }

    /// Run one pass and record its outcome in the self-metrics.
    pub fn run(&mut self) -> ExporterResult<RunReport> {
        let timer = PerfTimer::start("ingestion_pass", Duration::from_millis(SLOW_RUN_THRESHOLD_MS));
        let started = Instant::now();

        let result = match self.execute(started) {
            Ok(mut report) => {
                self.metrics.record_run(&report);
                report.textfile_written = self.write_textfile();
                info!(
                    target: "squid_exporter::run",
                    reason = report.resume.reason.as_str(),
                    start_offset = report.resume.offset,
                    end_offset = report.end_offset,
                    lines_parsed = report.lines_parsed,
                    lines_malformed = report.lines_malformed,
                    domains = report.domains_observed,
                    overflow_domains = report.overflow_domains,
                    counters_advanced = report.counters_advanced,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Ingestion pass complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.record_failure(&e, started.elapsed());
                Err(e)
            }
        };

        timer.finish(
            result
                .as_ref()
                .map_or(0, |report| report.lines_parsed + report.lines_malformed),
        );
        result
    }

    fn execute(&mut self, started: Instant) -> ExporterResult<RunReport> {
        let stored = self.tracker.load()?;

        let (file, meta) = self.retry.run("open_log", || open_log(&self.log_file))?;
        let inode = file_inode(&meta);
        let resume = ResumePoint::resolve(stored.as_ref(), &self.log_name, inode, meta.len());

        if resume.is_reset() {
            info!(
                target: "squid_exporter::position",
                reason = resume.reason.as_str(),
                stored_offset = stored.as_ref().map_or(0, |p| p.offset),
                stored_inode = stored.as_ref().map_or(0, |p| p.inode),
                inode,
                file_len = meta.len(),
                "Log file replaced, reading from the start"
            );
        }

        let outcome = self.scan(file, resume, inode)?;
        let acc = outcome.accumulator;

        if acc.lines_malformed > 0 {
            warn!(
                target: "squid_exporter::parser",
                malformed = acc.lines_malformed,
                parsed = acc.lines_parsed,
                "Skipped malformed access log lines"
            );
        }

        let (gauges, overflow_domains) = self.fold(&acc);
        let batch = PublishBatch {
            counters: self.ledger.pending_deltas(),
            gauges,
        };
        if !batch.is_empty() {
            if let Err(e) = self.metrics.publish(&batch) {
                // Nothing reached the registry: forget the pass and make
                // the next one read the same lines again
                self.ledger.discard();
                if outcome.checkpointed {
                    self.rollback_checkpoint(resume.offset, inode);
                }
                return Err(e);
            }
        }
        self.ledger.commit();
        self.remember_statuses(&acc);

        let position_saved = match self
            .tracker
            .save_with_retry(&self.log_name, outcome.end_offset, inode)
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    target: "squid_exporter::position",
                    path = %self.tracker.path().display(),
                    error = %e,
                    offset = outcome.end_offset,
                    "Failed to persist position, keeping it in memory"
                );
                self.metrics.record_error("position");
                false
            }
        };

        Ok(RunReport {
            resume,
            end_offset: outcome.end_offset,
            inode,
            lines_parsed: acc.lines_parsed,
            lines_malformed: acc.lines_malformed,
            domains_observed: acc.domains.len(),
            overflow_domains,
            tracked_domains: self.cardinality.len(),
            counters_advanced: batch.counters.len(),
            newest_entry: acc.newest_entry,
            position_saved,
            textfile_written: None,
            elapsed: started.elapsed(),
            finished_at: Utc::now(),
        })
    }

    fn remember_statuses(&mut self, acc: &RunAccumulator) {
        let Some(store) = self.known_statuses.as_mut() else {
            return;
        };
        store.extend(acc.cache_status_counts.keys().map(String::as_str));
        if let Err(e) = store.save() {
            error!(
                target: "squid_exporter::status_store",
                path = %store.path().display(),
                error = %e,
                "Failed to save known cache statuses"
            );
            self.metrics.record_error("output");
        }
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// Read complete lines from `resume.offset` to end of file. On an I/O
    /// error any checkpoint written during this scan is rolled back, since
    /// the lines behind it were never published.
    fn scan<R: Read + Seek>(
        &mut self,
        source: R,
        resume: ResumePoint,
        inode: u64,
    ) -> Result<ScanOutcome, ScanError> {
        let mut checkpointed = false;
        let result = self.scan_lines(source, resume.offset, inode, &mut checkpointed);

        if result.is_err() && checkpointed {
            self.rollback_checkpoint(resume.offset, inode);
        }
        result
    }

    fn rollback_checkpoint(&mut self, offset: u64, inode: u64) {
        if let Err(e) = self.tracker.save(&self.log_name, offset, inode) {
            warn!(
                target: "squid_exporter::position",
                error = %e,
                offset,
                "Failed to roll back checkpoint, kept in memory"
            );
        }
    }

    fn scan_lines<R: Read + Seek>(
        &mut self,
        source: R,
        start: u64,
        inode: u64,
        checkpointed: &mut bool,
    ) -> Result<ScanOutcome, ScanError> {
        let retry = self.retry;
        let mut reader = BufReader::new(source);
        retry
            .run("seek_log", || reader.seek(SeekFrom::Start(start)))
            .map_err(|source| ScanError::Seek {
                path: self.log_file.clone(),
                offset: start,
                source,
            })?;

        let mut acc = RunAccumulator::new();
        let mut offset = start;
        let mut lines_since_checkpoint = 0u64;
        let mut buf = Vec::with_capacity(512);

        loop {
            let read = read_line_retrying(&mut reader, &mut buf, offset, &retry).map_err(|source| {
                ScanError::Read {
                    path: self.log_file.clone(),
                    offset,
                    source,
                }
            })?;

            match read {
                LineRead::End { pending } => {
                    if pending > 0 {
                        debug!(
                            target: "squid_exporter::scan",
                            pending,
                            offset,
                            "Leaving partial trailing line for the next pass"
                        );
                    }
                    break;
                }
                LineRead::Oversized(len) => {
                    offset += len as u64;
                    let err = ParseError::LineTooLong {
                        length: len,
                        limit: MAX_LINE_BYTES,
                    };
                    debug!(target: "squid_exporter::parser", error = %err, offset, "Skipping malformed line");
                    acc.record_malformed();
                }
                LineRead::Line(len) => {
                    offset += len as u64;
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_line(line, &self.format) {
                        Ok(entry) => acc.record(&entry, &self.classifier),
                        Err(e) => {
                            debug!(target: "squid_exporter::parser", error = %e, line, "Skipping malformed line");
                            acc.record_malformed();
                        }
                    }
                }
            }

            lines_since_checkpoint += 1;
            if lines_since_checkpoint >= self.checkpoint_lines {
                lines_since_checkpoint = 0;
                *checkpointed = true;
                if let Err(e) = self.tracker.save(&self.log_name, offset, inode) {
                    warn!(target: "squid_exporter::position", error = %e, offset, "Checkpoint failed");
                }
            }
        }

        Ok(ScanOutcome {
            accumulator: acc,
            end_offset: offset,
            checkpointed: *checkpointed,
        })
    }

    // ------------------------------------------------------------------------
    // Folding into Series
    // ------------------------------------------------------------------------

    /// Add this pass's counts to the cumulative ledger and build the gauge
    /// samples. Returns the gauges and how many domains overflowed.
    fn fold(&mut self, acc: &RunAccumulator) -> (Vec<GaugeSample>, usize) {
        let ledger = &mut self.ledger;

        ledger.accumulate(MetricKey::new(CounterFamily::Connections, vec![]), acc.connections);
        for (bucket, count) in &acc.millisecond_buckets {
            ledger.accumulate(
                MetricKey::new(CounterFamily::DurationMilliseconds, vec![bucket.to_string()]),
                *count,
            );
        }
        for (bucket, count) in &acc.second_buckets {
            ledger.accumulate(
                MetricKey::new(CounterFamily::DurationSeconds, vec![bucket.to_string()]),
                *count,
            );
        }
        for (status, count) in &acc.cache_status_counts {
            ledger.accumulate(MetricKey::new(CounterFamily::CacheStatus, vec![status.clone()]), *count);
        }

        let mut by_category: HashMap<StatusCategory, u64> = HashMap::new();
        for (code, categories) in &acc.http_code_counts {
            for (category, count) in categories {
                ledger.accumulate(
                    MetricKey::new(
                        CounterFamily::HttpResponses,
                        vec![code.clone(), category.as_str().to_string()],
                    ),
                    *count,
                );
                *by_category.entry(*category).or_default() += count;
            }
        }
        for (category, count) in by_category {
            ledger.accumulate(
                MetricKey::new(CounterFamily::HttpResponsesByCategory, vec![category.as_str().to_string()]),
                count,
            );
        }

        let mut overflow = DomainAccumulator::default();
        let mut overflow_domains = 0usize;
        let mut gauges = Vec::new();

        for target in acc.sorted_targets() {
            let domain = &acc.domains[target];

            if self.track_all_domains {
                match self.cardinality.admit(target) {
                    Admission::Individual => accumulate_all_domains(ledger, target, domain),
                    Admission::Overflow => {
                        overflow.merge_counts(domain);
                        overflow_domains += 1;
                    }
                }
            }

            if domain.monitored {
                if let Some(labels) = self.classifier.classify(&target.host, target.port) {
                    let custom = self.classifier.label_values(labels);
                    accumulate_monitored(ledger, target, domain, &custom);
                    gauges.extend(monitored_gauges(target, domain, &custom));
                }
            }
        }

        if overflow_domains > 0 {
            warn!(
                target: "squid_exporter::cardinality",
                overflow_domains,
                tracked = self.cardinality.len(),
                requests = overflow.requests,
                "Domain limit reached, folding traffic into the overflow bucket"
            );
            accumulate_all_domains(ledger, &CardinalityController::overflow_target(), &overflow);
        }

        (gauges, overflow_domains)
    }

    // ------------------------------------------------------------------------
    // Textfile Output
    // ------------------------------------------------------------------------

    fn write_textfile(&self) -> Option<bool> {
        let path = self.textfile_output.as_ref()?;

        let result = self.metrics.encode_text().and_then(|text| {
            self.retry
                .run("write_textfile", || atomic_write(path, text.as_bytes()))
                .map_err(|source| {
                    ExporterError::from(OutputError::Write {
                        path: path.clone(),
                        source,
                    })
                })
        });

        match result {
            Ok(()) => Some(true),
            Err(e) => {
                error!(
                    target: "squid_exporter::output",
                    path = %path.display(),
                    error = %e,
                    "Failed to write metrics textfile"
                );
                self.metrics.record_error(e.category());
                Some(false)
            }
        }
    }
}

fn domain_labels(target: &Target) -> Vec<String> {
    vec![target.host.clone(), target.port.to_string()]
}

fn with_labels(base: &[String], extra: &[&str], custom: &[String]) -> Vec<String> {
    base.iter()
        .cloned()
        .chain(extra.iter().map(|s| s.to_string()))
        .chain(custom.iter().cloned())
        .collect()
}

fn accumulate_all_domains(ledger: &mut CounterLedger, target: &Target, domain: &DomainAccumulator) {
    let base = domain_labels(target);
    ledger.accumulate(MetricKey::new(CounterFamily::AllDomainsRequests, base.clone()), domain.requests);
    for (category, count) in &domain.responses_by_category {
        ledger.accumulate(
            MetricKey::new(
                CounterFamily::AllDomainsResponses,
                with_labels(&base, &[category.as_str()], &[]),
            ),
            *count,
        );
    }
    for (direction, bytes) in [("in", domain.bytes_in), ("out", domain.bytes_out)] {
        ledger.accumulate(
            MetricKey::new(CounterFamily::AllDomainsBytes, with_labels(&base, &[direction], &[])),
            bytes,
        );
    }
}

fn accumulate_monitored(
    ledger: &mut CounterLedger,
    target: &Target,
    domain: &DomainAccumulator,
    custom: &[String],
) {
    let base = domain_labels(target);
    ledger.accumulate(
        MetricKey::new(CounterFamily::MonitoredRequests, with_labels(&base, &[], custom)),
        domain.requests,
    );
    for (code, categories) in &domain.responses_by_code {
        for (category, count) in categories {
            ledger.accumulate(
                MetricKey::new(
                    CounterFamily::MonitoredResponses,
                    with_labels(&base, &[code.as_str(), category.as_str()], custom),
                ),
                *count,
            );
        }
    }
    for (direction, bytes) in [("in", domain.bytes_in), ("out", domain.bytes_out)] {
        ledger.accumulate(
            MetricKey::new(CounterFamily::MonitoredBytes, with_labels(&base, &[direction], custom)),
            bytes,
        );
    }
}

fn monitored_gauges(target: &Target, domain: &DomainAccumulator, custom: &[String]) -> Vec<GaugeSample> {
    let labels = with_labels(&domain_labels(target), &[], custom);
    let mut samples = Vec::with_capacity(GaugeFamily::ALL.len());

    if let Some(latency) = domain.latency() {
        for (family, value) in [
            (GaugeFamily::DurationAvg, latency.avg),
            (GaugeFamily::DurationP50, latency.p50),
            (GaugeFamily::DurationP90, latency.p90),
            (GaugeFamily::DurationP95, latency.p95),
            (GaugeFamily::DurationP99, latency.p99),
        ] {
            samples.push(GaugeSample {
                family,
                labels: labels.clone(),
                value,
            });
        }
    }
    if let Some(ratio) = domain.cache_hit_ratio() {
        samples.push(GaugeSample {
            family: GaugeFamily::CacheHitRatio,
            labels,
            value: ratio,
        });
    }

    samples
}
