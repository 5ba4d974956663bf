// ============================================================================
// COUNTER-DELTA ENGINE
// ============================================================================
// Exported counters are only ever advanced by the difference between the
// absolute value last applied and the new absolute value. The ledger keeps
// the process-lifetime cumulative totals that feed the engine, so the
// values it sees are monotonic by construction.
// ============================================================================

use std::collections::HashMap;

use crate::metrics::CounterFamily;

/// Identity of one exported counter series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub family: CounterFamily,
    pub labels: Vec<String>,
}

impl MetricKey {
    pub fn new(family: CounterFamily, labels: Vec<String>) -> Self {
        Self { family, labels }
    }
}

/// An increment to apply to an exported counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDelta {
    pub key: MetricKey,
    pub delta: u64,
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Last absolute value applied per series.
#[derive(Debug, Clone, Default)]
pub struct CounterDeltaEngine {
    last_applied: HashMap<MetricKey, u64>,
}

impl CounterDeltaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// How much the exported counter would grow if `new_value` were applied
    pub fn pending_delta(&self, key: &MetricKey, new_value: u64) -> u64 {
        let previous = self.last_applied.get(key).copied().unwrap_or(0);
        new_value.saturating_sub(previous)
    }

    /// Record `new_value` as the latest absolute value for `key` and return
    /// how much the exported counter must grow. Regressions yield 0, and
    /// the stored value follows `new_value` either way.
    pub fn apply_delta(&mut self, key: &MetricKey, new_value: u64) -> u64 {
        let delta = self.pending_delta(key, new_value);
        self.last_applied.insert(key.clone(), new_value);
        delta
    }

    pub fn last_applied(&self, key: &MetricKey) -> Option<u64> {
        self.last_applied.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.last_applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_applied.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Ledger
// ----------------------------------------------------------------------------

/// Cumulative per-series totals since process start.
///
/// A pass stages what it newly observed with `accumulate`, reads the
/// resulting increments with `pending_deltas`, and only after they were
/// published calls `commit`. `discard` drops a staged pass, leaving totals
/// and the engine as they were.
#[derive(Debug, Clone, Default)]
pub struct CounterLedger {
    totals: HashMap<MetricKey, u64>,
    staged: HashMap<MetricKey, u64>,
    engine: CounterDeltaEngine,
}

impl CounterLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, key: MetricKey, observed: u64) {
        if observed == 0 {
            return;
        }
        *self.staged.entry(key).or_default() += observed;
    }

    /// Committed total for `key`
    pub fn total(&self, key: &MetricKey) -> u64 {
        self.totals.get(key).copied().unwrap_or(0)
    }

    /// Increments the staged pass would apply, in key order.
    pub fn pending_deltas(&self) -> Vec<CounterDelta> {
        let mut deltas: Vec<CounterDelta> = self
            .staged
            .iter()
            .filter_map(|(key, observed)| {
                let delta = self.engine.pending_delta(key, self.total(key) + observed);
                (delta > 0).then(|| CounterDelta {
                    key: key.clone(),
                    delta,
                })
            })
            .collect();
        deltas.sort_by(|a, b| a.key.cmp(&b.key));
        deltas
    }

    /// Fold the staged pass into the totals and the engine.
    pub fn commit(&mut self) {
        for (key, observed) in self.staged.drain() {
            let total = self.totals.entry(key.clone()).or_default();
            *total += observed;
            self.engine.apply_delta(&key, *total);
        }
    }

    pub fn discard(&mut self) {
        self.staged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(labels: &[&str]) -> MetricKey {
        MetricKey::new(
            CounterFamily::CacheStatus,
            labels.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_first_value_applies_in_full() {
        let mut engine = CounterDeltaEngine::new();
        assert_eq!(engine.apply_delta(&key(&["TCP_MISS"]), 7), 7);
        assert_eq!(engine.last_applied(&key(&["TCP_MISS"])), Some(7));
    }

    #[test]
    fn test_regression_applies_nothing_but_is_stored() {
        let mut engine = CounterDeltaEngine::new();
        let k = key(&["TCP_HIT"]);
        engine.apply_delta(&k, 10);

        assert_eq!(engine.apply_delta(&k, 4), 0);
        assert_eq!(engine.last_applied(&k), Some(4));
        assert_eq!(engine.apply_delta(&k, 6), 2);
    }

    #[test]
    fn test_unchanged_value_applies_nothing() {
        let mut engine = CounterDeltaEngine::new();
        let k = key(&["TCP_HIT"]);
        engine.apply_delta(&k, 3);
        assert_eq!(engine.apply_delta(&k, 3), 0);
    }

    fn publish(ledger: &mut CounterLedger) -> Vec<CounterDelta> {
        let deltas = ledger.pending_deltas();
        ledger.commit();
        deltas
    }

    #[test]
    fn test_ledger_feeds_run_counts() {
        let mut ledger = CounterLedger::new();
        ledger.accumulate(key(&["TCP_MISS"]), 3);
        ledger.accumulate(key(&["TCP_HIT"]), 1);
        let first = publish(&mut ledger);
        assert_eq!(first.len(), 2);
        assert_eq!(first.iter().map(|d| d.delta).sum::<u64>(), 4);

        // A pass with no new lines moves nothing
        assert!(publish(&mut ledger).is_empty());

        ledger.accumulate(key(&["TCP_MISS"]), 2);
        assert_eq!(
            publish(&mut ledger),
            vec![CounterDelta {
                key: key(&["TCP_MISS"]),
                delta: 2
            }]
        );
        assert_eq!(ledger.total(&key(&["TCP_MISS"])), 5);
    }

    #[test]
    fn test_ledger_ignores_zero_counts() {
        let mut ledger = CounterLedger::new();
        ledger.accumulate(key(&["TCP_DENIED"]), 0);
        assert!(ledger.pending_deltas().is_empty());
        ledger.commit();
        assert_eq!(ledger.total(&key(&["TCP_DENIED"])), 0);
    }

    #[test]
    fn test_discarded_pass_leaves_totals_unchanged() {
        let mut ledger = CounterLedger::new();
        ledger.accumulate(key(&["TCP_MISS"]), 3);
        publish(&mut ledger);

        ledger.accumulate(key(&["TCP_MISS"]), 5);
        assert_eq!(ledger.pending_deltas()[0].delta, 5);
        ledger.discard();
        assert_eq!(ledger.total(&key(&["TCP_MISS"])), 3);

        // The next pass only carries its own lines
        ledger.accumulate(key(&["TCP_MISS"]), 1);
        assert_eq!(publish(&mut ledger)[0].delta, 1);
        assert_eq!(ledger.total(&key(&["TCP_MISS"])), 4);
    }

    #[test]
    fn test_pending_deltas_do_not_touch_engine() {
        let mut ledger = CounterLedger::new();
        ledger.accumulate(key(&["TCP_HIT"]), 2);
        assert_eq!(ledger.pending_deltas(), ledger.pending_deltas());
        assert_eq!(ledger.engine.last_applied(&key(&["TCP_HIT"])), None);
        ledger.commit();
        assert_eq!(ledger.engine.last_applied(&key(&["TCP_HIT"])), Some(2));
    }

    proptest! {
        #[test]
        fn prop_exported_value_never_regresses(values in prop::collection::vec(0u64..1_000, 1..50)) {
            let mut engine = CounterDeltaEngine::new();
            let k = key(&["x"]);
            let mut exported = 0u64;
            for v in values {
                let before = exported;
                exported += engine.apply_delta(&k, v);
                prop_assert!(exported >= before);
            }
        }

        #[test]
        fn prop_ledger_export_equals_sum_of_runs(runs in prop::collection::vec(0u64..1_000, 1..50)) {
            let mut ledger = CounterLedger::new();
            let mut exported = 0u64;
            for observed in &runs {
                ledger.accumulate(key(&["x"]), *observed);
                exported += publish(&mut ledger).iter().map(|d| d.delta).sum::<u64>();
            }
            prop_assert_eq!(exported, runs.iter().sum::<u64>());
        }
    }
}
