// ============================================================================
// LINE PARSER
// ============================================================================
// Turns one raw access-log line into a ParsedEntry:
// - quote-aware field splitting
// - result code split into cache status and HTTP status
// - duration normalised to seconds
// - target host/port classification
// ============================================================================

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::UNIX_TIMESTAMP_FORMAT;
use crate::error::ParseError;
use crate::host::{classify_target, Target};

// ----------------------------------------------------------------------------
// Format Description
// ----------------------------------------------------------------------------

/// Unit the duration column is written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    #[default]
    Ms,
    S,
}

impl DurationUnit {
    fn to_seconds(self, value: f64) -> f64 {
        match self {
            DurationUnit::Ms => value / 1000.0,
            DurationUnit::S => value,
        }
    }

    fn to_millis(self, value: f64) -> f64 {
        match self {
            DurationUnit::Ms => value,
            DurationUnit::S => value * 1000.0,
        }
    }
}

/// How the timestamp column is encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampFormat {
    /// Fractional seconds since the epoch
    Unix,
    /// A chrono strftime layout, read as UTC when it carries no offset
    Layout(String),
}

impl TimestampFormat {
    pub fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case(UNIX_TIMESTAMP_FORMAT) {
            TimestampFormat::Unix
        } else {
            TimestampFormat::Layout(value.to_string())
        }
    }

    fn parse(&self, raw: &str) -> Option<DateTime<Utc>> {
        match self {
            TimestampFormat::Unix => {
                let secs: f64 = raw.parse().ok()?;
                if !secs.is_finite() || secs < 0.0 {
                    return None;
                }
                let whole = secs.trunc();
                let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
                DateTime::from_timestamp(whole as i64, nanos)
            }
            TimestampFormat::Layout(layout) => DateTime::parse_from_str(raw, layout)
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| NaiveDateTime::parse_from_str(raw, layout).map(|naive| naive.and_utc()))
                .ok(),
        }
    }
}

/// Resolved, read-only mapping from semantic fields to column indices.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFormatSpec {
    pub timestamp: usize,
    pub duration: usize,
    pub result_code: usize,
    pub bytes: usize,
    pub method: usize,
    pub url: usize,
    /// Optional request size column, feeds inbound byte counts
    pub request_bytes: Option<usize>,
    /// Highest index of any configured field
    pub max_index: usize,
    pub duration_unit: DurationUnit,
    pub timestamp_format: TimestampFormat,
}

impl LogFormatSpec {
    /// Fields a line must have to be accepted
    pub fn required_fields(&self) -> usize {
        self.max_index + 1
    }
}

// ----------------------------------------------------------------------------
// Classification Types
// ----------------------------------------------------------------------------

/// HTTP status class derived from the first digit of the code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusCategory {
    Success,
    Redirect,
    ClientError,
    ServerError,
    Other,
    Unknown,
}

impl StatusCategory {
    pub const ALL: [StatusCategory; 6] = [
        StatusCategory::Success,
        StatusCategory::Redirect,
        StatusCategory::ClientError,
        StatusCategory::ServerError,
        StatusCategory::Other,
        StatusCategory::Unknown,
    ];

    pub fn from_code(code: &str) -> Self {
        match code.as_bytes().first() {
            None => StatusCategory::Unknown,
            Some(b'2') => StatusCategory::Success,
            Some(b'3') => StatusCategory::Redirect,
            Some(b'4') => StatusCategory::ClientError,
            Some(b'5') => StatusCategory::ServerError,
            Some(_) => StatusCategory::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCategory::Success => "2xx",
            StatusCategory::Redirect => "3xx",
            StatusCategory::ClientError => "4xx",
            StatusCategory::ServerError => "5xx",
            StatusCategory::Other => "other",
            StatusCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the proxy answered from cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Neither,
}

impl CacheOutcome {
    pub fn from_status(status: &str) -> Self {
        if status.starts_with("TCP_HIT") || status.starts_with("TCP_MEM_HIT") {
            CacheOutcome::Hit
        } else if status.starts_with("TCP_MISS") {
            CacheOutcome::Miss
        } else {
            CacheOutcome::Neither
        }
    }
}

/// Millisecond latency buckets in exposition order
pub const MILLISECOND_BUCKETS: [&str; 6] =
    ["0-200", "200-400", "400-600", "600-800", "800-1000", "over1000"];

/// Second latency buckets in exposition order
pub const SECOND_BUCKETS: [&str; 6] = ["0-1", "1-2", "2-3", "3-4", "4-5", "over5"];

/// Index of the first bound `value` does not exceed; upper bounds are inclusive
fn bucket_index(value: f64, step: f64) -> usize {
    (1..=5)
        .find(|&i| value <= step * i as f64)
        .map_or(5, |i| i - 1)
}

/// Millisecond-granularity latency bucket, 200ms wide up to one second
pub fn millisecond_bucket(millis: f64) -> &'static str {
    MILLISECOND_BUCKETS[bucket_index(millis, 200.0)]
}

/// Second-granularity latency bucket, one second wide up to five
pub fn second_bucket(seconds: f64) -> &'static str {
    SECOND_BUCKETS[bucket_index(seconds, 1.0)]
}

// ----------------------------------------------------------------------------
// Parsed Line
// ----------------------------------------------------------------------------

/// One successfully parsed access-log line
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub timestamp: Option<DateTime<Utc>>,
    pub cache_status: String,
    pub http_code: String,
    pub category: StatusCategory,
    /// Bytes delivered to the client
    pub bytes: u64,
    /// Bytes received from the client, when the format logs them
    pub request_bytes: u64,
    pub method: String,
    pub target: Option<Target>,
    pub duration_seconds: f64,
    pub duration_millis: f64,
}

impl ParsedEntry {
    pub fn cache_outcome(&self) -> CacheOutcome {
        CacheOutcome::from_status(&self.cache_status)
    }

    /// Tunnelled connections report their lifetime, not a request latency
    pub fn is_tunnel(&self) -> bool {
        self.cache_status == "TCP_TUNNEL"
    }
}

/// Split on runs of whitespace, keeping double-quoted spans together.
/// Quotes are removed; `""` yields an empty field.
pub fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    fields.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        fields.push(current);
    }

    fields
}

/// Parse one line against a resolved format.
pub fn parse_line(line: &str, spec: &LogFormatSpec) -> Result<ParsedEntry, ParseError> {
    let fields = split_fields(line);
    if fields.len() < spec.required_fields() {
        return Err(ParseError::TooFewFields {
            found: fields.len(),
            required: spec.required_fields(),
        });
    }

    let result_code = &fields[spec.result_code];
    let (cache_status, http_code) = match result_code.split('/').collect::<Vec<_>>()[..] {
        [status, code] => (status.to_string(), code.to_string()),
        _ => {
            return Err(ParseError::InvalidResultCode {
                value: result_code.clone(),
            })
        }
    };

    let raw_duration = parse_non_negative(&fields[spec.duration]);
    let method = fields[spec.method].clone();
    let target = classify_target(&method, &fields[spec.url]);

    Ok(ParsedEntry {
        timestamp: spec.timestamp_format.parse(&fields[spec.timestamp]),
        category: StatusCategory::from_code(&http_code),
        cache_status,
        http_code,
        bytes: parse_byte_count(&fields[spec.bytes]),
        request_bytes: spec.request_bytes.map_or(0, |i| parse_byte_count(&fields[i])),
        method,
        target,
        duration_seconds: spec.duration_unit.to_seconds(raw_duration),
        duration_millis: spec.duration_unit.to_millis(raw_duration),
    })
}

/// Unparsable, negative or non-finite values count as zero
fn parse_non_negative(raw: &str) -> f64 {
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}

fn parse_byte_count(raw: &str) -> u64 {
    raw.parse::<i64>().map_or(0, |v| v.max(0) as u64)
}
