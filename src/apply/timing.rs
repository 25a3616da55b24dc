//! Per-key wallclock tracking for load balancing (spec.md §4.4.6's last
//! sentence): an exponentially decayed estimate of how long `apply` spends
//! at each source key, updated `s <- s + (y - s) * 0.9` on every sample.

use crate::tree::key::Key;
use dashmap::DashMap;

/// Decayed per-key timing table. A key absent from the map is treated as
/// `s = 0`, matching the decay formula's steady state for a never-seen key.
#[derive(Default)]
pub struct NodeTimer<const D: usize> {
    times: DashMap<Key<D>, f64>,
}

impl<const D: usize> NodeTimer<D> {
    /// An empty timer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            times: DashMap::new(),
        }
    }

    /// Fold a fresh wallclock sample `y` (seconds) into `key`'s estimate.
    pub fn record(&self, key: Key<D>, y: f64) {
        self.times
            .entry(key)
            .and_modify(|s| *s += (y - *s) * 0.9)
            .or_insert(y * 0.9);
    }

    /// The current decayed estimate for `key`, `0.0` if never recorded.
    #[must_use]
    pub fn get(&self, key: Key<D>) -> f64 {
        self.times.get(&key).map_or(0.0, |v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_heavily_decayed() {
        let timer: NodeTimer<1> = NodeTimer::new();
        let key = Key::<1>::root();
        timer.record(key, 1.0);
        assert!((timer.get(key) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn converges_toward_a_steady_sample() {
        let timer: NodeTimer<1> = NodeTimer::new();
        let key = Key::<1>::root();
        for _ in 0..50 {
            timer.record(key, 2.0);
        }
        assert!((timer.get(key) - 2.0).abs() < 1e-6);
    }
}
