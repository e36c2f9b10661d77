//! Reusable weight cache with single-flight computation per key

use super::weights::{Footprint, ResampleWeights, WeightKey};
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

type Slot = Arc<Mutex<Option<Arc<ResampleWeights>>>>;

/// Weights keyed by caller-chosen cache keys.
///
/// Concurrent callers asking for the same key wait for a single computation;
/// different keys compute independently.
#[derive(Debug, Default)]
pub struct WeightCache {
    slots: Mutex<HashMap<String, Slot>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

#[derive(Serialize, Deserialize)]
struct PersistedWeights {
    version: u32,
    entries: BTreeMap<String, ResampleWeights>,
}

const PERSIST_VERSION: u32 = 2;

impl WeightCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, cache_key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(cache_key.to_string()).or_default().clone()
    }

    /// Return the weights stored under `cache_key`, computing them on a miss.
    ///
    /// The boolean is true when cached weights were reused. Cached weights
    /// that were built for a different grid pair than `expected` are refused
    /// with a Resample error rather than applied. Weights of the right shapes
    /// but computed on other coordinates than `footprint` are recomputed and
    /// replaced.
    pub fn get_or_compute(
        &self,
        cache_key: &str,
        expected: &WeightKey,
        footprint: &Footprint,
        compute: impl FnOnce() -> Result<ResampleWeights>,
    ) -> Result<(Arc<ResampleWeights>, bool)> {
        let slot = self.slot(cache_key);
        let mut entry = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(weights) = entry.as_ref() {
            weights.ensure_matches(expected)?;
            if weights.covers(footprint) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key, "Reusing cached resample weights");
                return Ok((Arc::clone(weights), true));
            }
            warn!(cache_key, "Cached weights were computed on other coordinates, recomputing");
        }

        let weights = compute()?;
        weights.ensure_matches(expected)?;
        let weights = Arc::new(weights);
        *entry = Some(Arc::clone(&weights));
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(cache_key, nnz = weights.nnz(), "Computed resample weights");
        Ok((weights, false))
    }

    /// Store weights under `cache_key`, replacing any previous entry.
    pub fn insert(&self, cache_key: impl Into<String>, weights: ResampleWeights) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(cache_key.into(), Arc::new(Mutex::new(Some(Arc::new(weights)))));
    }

    /// Stored weights for `cache_key`, if computed.
    #[must_use]
    pub fn get(&self, cache_key: &str) -> Option<Arc<ResampleWeights>> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.get(cache_key).cloned()
        }?;
        let entry = slot.lock().unwrap_or_else(PoisonError::into_inner);
        entry.clone()
    }

    /// Number of keys holding computed weights
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> BTreeMap<String, Arc<ResampleWeights>> {
        let slots: Vec<(String, Slot)> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };
        slots
            .into_iter()
            .filter_map(|(k, slot)| {
                let entry = slot.lock().unwrap_or_else(PoisonError::into_inner);
                entry.clone().map(|w| (k, w))
            })
            .collect()
    }

    /// Seed the cache from a weights file written by [`WeightCache::save_to`].
    ///
    /// Returns the number of entries loaded. Entries are checked against the
    /// grid pair when they are first reused, not here.
    pub fn load_from(&self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path)?;
        let persisted: PersistedWeights = serde_json::from_str(&text)?;
        if persisted.version != PERSIST_VERSION {
            return Err(crate::errors::FusionError::resample(format!(
                "unsupported weights file version {} in {}",
                persisted.version,
                path.display()
            )));
        }
        let count = persisted.entries.len();
        for (key, weights) in persisted.entries {
            self.insert(key, weights);
        }
        info!(entries = count, "Loaded resample weights from {}", path.display());
        Ok(count)
    }

    /// Persist every computed entry to `path` as JSON.
    pub fn save_to(&self, path: &Path) -> Result<usize> {
        let entries: BTreeMap<String, ResampleWeights> = self
            .snapshot()
            .into_iter()
            .map(|(k, w)| (k, (*w).clone()))
            .collect();
        let count = entries.len();
        let persisted = PersistedWeights {
            version: PERSIST_VERSION,
            entries,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(&persisted)?)?;
        info!(entries = count, "Saved resample weights to {}", path.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FusionError;
    use crate::resample::ResampleMethod;
    use std::sync::atomic::AtomicUsize;

    fn key() -> WeightKey {
        WeightKey::new((1, 2), (1, 1), ResampleMethod::Nearest)
    }

    fn footprint(shift: f64) -> Footprint {
        Footprint {
            source: [[0.0 + shift, 0.0], [1.0 + shift, 0.0], [0.0 + shift, 0.0], [1.0 + shift, 0.0]],
            destination: [0.0, 0.0, 0.5 + shift, 0.5 + shift],
        }
    }

    fn weights() -> ResampleWeights {
        ResampleWeights::from_rows(key(), vec![vec![(1, 1.0)]])
            .unwrap()
            .with_footprint(footprint(0.0))
    }

    #[test]
    fn computes_once_per_key() {
        let cache = WeightCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_compute("k", &key(), &footprint(0.0), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(weights())
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!((cache.hits(), cache.misses()), (2, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_callers_share_one_computation() {
        let cache = WeightCache::new();
        let calls = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache
                        .get_or_compute("k", &key(), &footprint(0.0), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok(weights())
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_computation_leaves_slot_empty() {
        let cache = WeightCache::new();
        let err = cache.get_or_compute("k", &key(), &footprint(0.0), || Err(FusionError::resample("boom")));
        assert!(err.is_err());
        assert!(cache.get("k").is_none());
        let (_, reused) = cache.get_or_compute("k", &key(), &footprint(0.0), || Ok(weights())).unwrap();
        assert!(!reused);
    }

    #[test]
    fn persisted_weights_round_trip_and_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let cache = WeightCache::new();
        cache.insert("k", weights());
        assert_eq!(cache.save_to(&path).unwrap(), 1);

        let reloaded = WeightCache::new();
        assert_eq!(reloaded.load_from(&path).unwrap(), 1);
        assert_eq!(reloaded.get("k").as_deref(), Some(&weights()));

        let other = WeightKey::new((2, 2), (1, 1), ResampleMethod::Nearest);
        let err = reloaded.get_or_compute("k", &other, &footprint(0.0), || unreachable!());
        assert!(matches!(err, Err(FusionError::Resample(_))));
    }

    #[test]
    fn weights_from_another_region_are_recomputed() {
        let cache = WeightCache::new();
        cache.insert("k", weights());

        let moved = footprint(3.0);
        let (w, reused) = cache
            .get_or_compute("k", &key(), &moved, || Ok(weights().with_footprint(moved)))
            .unwrap();
        assert!(!reused);
        assert!(w.covers(&moved));
        assert_eq!((cache.hits(), cache.misses()), (0, 1));

        // the replacement is what later callers see
        let (_, reused) = cache
            .get_or_compute("k", &key(), &moved, || unreachable!())
            .unwrap();
        assert!(reused);
        assert!(cache.get("k").is_some_and(|w| !w.covers(&footprint(0.0))));
    }
}
