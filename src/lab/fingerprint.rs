//! Program-state fingerprints and cycle-based liveness detection.
//!
//! At each scheduling point the controlled scheduler can hash the global
//! program state: for every live machine, its cached state-stack hash and
//! operation status, plus every monitor's cached state. Equal fingerprints
//! with equal enabled sets mean the program has revisited a state.
//!
//! A revisit is a *lasso*: if some monitor has been hot continuously since
//! the first visit, the cycle can repeat forever without discharging the
//! obligation. That is a liveness bug.

use crate::util::DetHasher;
use std::collections::VecDeque;
use std::hash::Hasher;

/// A content hash over the program state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

/// Incremental builder for one fingerprint.
#[derive(Debug, Default)]
pub struct FingerprintBuilder {
    hasher: DetHasher,
}

impl FingerprintBuilder {
    /// Starts a fresh fingerprint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one machine: identity value, cached state hash, and the kind of
    /// its next scheduled operation (encoded by the caller).
    pub fn add_machine(&mut self, id_value: u64, state_hash: u64, next_op: u8) {
        self.hasher.write_u64(id_value);
        self.hasher.write_u64(state_hash);
        self.hasher.write_u8(next_op);
    }

    /// Mixes in monitor state via the registry's ordered walk.
    pub(crate) fn hasher(&mut self) -> &mut DetHasher {
        &mut self.hasher
    }

    /// Finishes the fingerprint.
    #[must_use]
    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finish())
    }
}

/// One remembered visit.
#[derive(Debug, Clone, Copy)]
struct Visit {
    fingerprint: Fingerprint,
    enabled_hash: u64,
    step: u64,
}

/// Bounded history of recent program states.
#[derive(Debug)]
pub struct FingerprintCache {
    visits: VecDeque<Visit>,
    capacity: usize,
}

/// A detected revisit of a prior program state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleHit {
    /// Step of the first visit.
    pub first_seen_step: u64,
    /// Step of the revisit.
    pub revisit_step: u64,
}

impl FingerprintCache {
    /// Creates a cache remembering up to `capacity` recent states.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            visits: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records a visit; returns the matching prior visit, if any.
    ///
    /// A match requires both the fingerprint and the enabled-set hash to be
    /// equal; the caller decides whether the cycle is a liveness bug by
    /// consulting monitor hot-since timestamps against `first_seen_step`.
    pub fn observe(
        &mut self,
        fingerprint: Fingerprint,
        enabled_hash: u64,
        step: u64,
    ) -> Option<CycleHit> {
        let hit = self
            .visits
            .iter()
            .find(|v| v.fingerprint == fingerprint && v.enabled_hash == enabled_hash)
            .map(|v| CycleHit {
                first_seen_step: v.step,
                revisit_step: step,
            });

        if self.visits.len() == self.capacity {
            self.visits.pop_front();
        }
        self.visits.push_back(Visit {
            fingerprint,
            enabled_hash,
            step,
        });
        hit
    }

    /// Forgets all remembered states (used across iterations).
    pub fn clear(&mut self) {
        self.visits.clear();
    }

    /// Number of remembered states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.visits.len()
    }

    /// True when nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(machines: &[(u64, u64, u8)]) -> Fingerprint {
        let mut builder = FingerprintBuilder::new();
        for (id, hash, op) in machines {
            builder.add_machine(*id, *hash, *op);
        }
        builder.finish()
    }

    #[test]
    fn same_inputs_same_fingerprint() {
        let a = fp(&[(1, 10, 0), (2, 20, 1)]);
        let b = fp(&[(1, 10, 0), (2, 20, 1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn order_and_content_matter() {
        let a = fp(&[(1, 10, 0), (2, 20, 1)]);
        let b = fp(&[(2, 20, 1), (1, 10, 0)]);
        let c = fp(&[(1, 11, 0), (2, 20, 1)]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn cache_reports_revisit() {
        let mut cache = FingerprintCache::new(8);
        let state = fp(&[(1, 10, 0)]);
        assert!(cache.observe(state, 7, 1).is_none());
        assert!(cache.observe(fp(&[(1, 99, 0)]), 7, 2).is_none());

        let hit = cache.observe(state, 7, 3).expect("revisit detected");
        assert_eq!(hit.first_seen_step, 1);
        assert_eq!(hit.revisit_step, 3);
    }

    #[test]
    fn different_enabled_sets_do_not_match() {
        let mut cache = FingerprintCache::new(8);
        let state = fp(&[(1, 10, 0)]);
        assert!(cache.observe(state, 7, 1).is_none());
        assert!(cache.observe(state, 8, 2).is_none());
    }

    #[test]
    fn history_is_bounded() {
        let mut cache = FingerprintCache::new(2);
        let old = fp(&[(1, 1, 0)]);
        cache.observe(old, 0, 1);
        cache.observe(fp(&[(2, 2, 0)]), 0, 2);
        cache.observe(fp(&[(3, 3, 0)]), 0, 3);
        // `old` fell out of the window.
        assert!(cache.observe(old, 0, 4).is_none());
        assert_eq!(cache.len(), 2);
    }
}
