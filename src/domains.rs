// ============================================================================
// DOMAIN CLASSIFICATION & CARDINALITY CONTROL
// ============================================================================
// Two orthogonal decisions are made per observed (host, port):
// - is it a monitored domain, and with which labels
// - does it get its own all-domains series or fold into the overflow bucket
// ============================================================================

use std::collections::{BTreeMap, BTreeSet, HashSet};

use regex::Regex;

use crate::config::{DomainPatternConfig, MonitoredDomainConfig};
use crate::constants::{OVERFLOW_HOST, OVERFLOW_PORT, RESERVED_LABELS};
use crate::error::{ConfigError, ConfigResult};
use crate::host::Target;

/// Custom labels attached to a monitored domain
pub type LabelSet = BTreeMap<String, String>;

// ----------------------------------------------------------------------------
// Rules
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ExactRule {
    host: String,
    port: Option<u16>,
    labels: LabelSet,
}

impl ExactRule {
    fn matches(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port.map_or(true, |p| p == port)
    }
}

#[derive(Debug, Clone)]
struct PatternRule {
    matcher: Regex,
    labels: LabelSet,
}

/// Compile a glob host pattern into an anchored regex. `*` spans zero or
/// more characters; everything else matches literally.
pub fn compile_wildcard(pattern: &str) -> ConfigResult<Regex> {
    if pattern.is_empty() {
        return Err(ConfigError::invalid_pattern(pattern, "pattern is empty"));
    }
    if let Some(bad) = pattern
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*')))
    {
        return Err(ConfigError::invalid_pattern(
            pattern,
            format!("invalid character '{}'", bad),
        ));
    }

    let escaped = regex::escape(&pattern.to_ascii_lowercase()).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped))
        .map_err(|e| ConfigError::invalid_pattern(pattern, e.to_string()))
}

/// Prometheus label name: `[a-zA-Z_][a-zA-Z0-9_]*`, not reserved
fn validate_label_key(key: &str, field: &str) -> ConfigResult<()> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid || key.starts_with("__") {
        return Err(ConfigError::invalid_value(
            field,
            format!("'{}' is not a valid label name", key),
        ));
    }
    if RESERVED_LABELS.contains(&key) {
        return Err(ConfigError::invalid_value(
            field,
            format!("'{}' is reserved by the exporter", key),
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Domain Classifier
// ----------------------------------------------------------------------------

/// Matches observed hosts against monitored-domain rules.
///
/// Exact rules win over patterns; within each list the first configured
/// match wins. Patterns are compiled once here, never per line.
#[derive(Debug, Clone, Default)]
pub struct DomainClassifier {
    exact: Vec<ExactRule>,
    patterns: Vec<PatternRule>,
    label_keys: Vec<String>,
}

impl DomainClassifier {
    pub fn from_config(
        domains: &[MonitoredDomainConfig],
        patterns: &[DomainPatternConfig],
    ) -> ConfigResult<Self> {
        let mut keys = BTreeSet::new();

        let mut exact = Vec::with_capacity(domains.len());
        for (i, domain) in domains.iter().enumerate() {
            let host = domain.host.trim().to_ascii_lowercase();
            if host.is_empty() {
                return Err(ConfigError::missing_field(format!("monitored_domains[{}].host", i)));
            }
            for key in domain.labels.keys() {
                validate_label_key(key, &format!("monitored_domains[{}].labels", i))?;
                keys.insert(key.clone());
            }
            exact.push(ExactRule {
                host,
                port: domain.port,
                labels: domain.labels.clone(),
            });
        }

        let mut compiled = Vec::with_capacity(patterns.len());
        for (i, pattern) in patterns.iter().enumerate() {
            for key in pattern.labels.keys() {
                validate_label_key(key, &format!("domain_patterns[{}].labels", i))?;
                keys.insert(key.clone());
            }
            compiled.push(PatternRule {
                matcher: compile_wildcard(pattern.pattern.trim())?,
                labels: pattern.labels.clone(),
            });
        }

        Ok(Self {
            exact,
            patterns: compiled,
            label_keys: keys.into_iter().collect(),
        })
    }

    /// Labels of the first matching rule, `None` when unmonitored.
    pub fn classify(&self, host: &str, port: u16) -> Option<&LabelSet> {
        if let Some(rule) = self.exact.iter().find(|r| r.matches(host, port)) {
            return Some(&rule.labels);
        }
        self.patterns
            .iter()
            .find(|r| r.matcher.is_match(host))
            .map(|r| &r.labels)
    }

    pub fn is_monitored(&self, host: &str, port: u16) -> bool {
        self.classify(host, port).is_some()
    }

    /// Sorted union of every label key used by any rule.
    pub fn label_keys(&self) -> &[String] {
        &self.label_keys
    }

    /// Values in `label_keys` order; keys the rule does not set are empty.
    pub fn label_values(&self, labels: &LabelSet) -> Vec<String> {
        self.label_keys
            .iter()
            .map(|k| labels.get(k).cloned().unwrap_or_default())
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }
}

// ----------------------------------------------------------------------------
// Cardinality Controller
// ----------------------------------------------------------------------------

/// Outcome of asking for an individual all-domains series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Individual,
    Overflow,
}

/// Bounds the set of domains with their own all-domains series.
///
/// The seen set lives for the whole process and only grows; once full,
/// new domains are folded into the overflow bucket.
#[derive(Debug, Clone)]
pub struct CardinalityController {
    seen: HashSet<Target>,
    max_domains: usize,
}

impl CardinalityController {
    pub fn new(max_domains: usize) -> Self {
        Self {
            seen: HashSet::new(),
            max_domains,
        }
    }

    pub fn admit(&mut self, target: &Target) -> Admission {
        if self.seen.contains(target) {
            return Admission::Individual;
        }
        if self.seen.len() < self.max_domains {
            self.seen.insert(target.clone());
            Admission::Individual
        } else {
            Admission::Overflow
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn overflow_target() -> Target {
        Target::new(OVERFLOW_HOST, OVERFLOW_PORT)
    }
}
