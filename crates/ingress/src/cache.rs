//! # Artifact Cache
//!
//! Cost-bounded cache over decoded artifact bodies, keyed by
//! `(identifier, decoded_sha256)`.
//!
//! ## Design
//!
//! - Cost of an entry is the decoded body length in bytes; the cache
//!   evicts in LRU order until `max_cost` holds.
//! - Admission is frequency-based: a compact sketch of 4-bit counters
//!   (`num_counters` of them) estimates how often each key has been
//!   asked for. When the cache is full, a newcomer is admitted only if
//!   its estimated frequency beats the LRU victim's, so one-shot keys
//!   cannot wash out a hot working set.
//! - `set_artifact` may therefore silently reject; callers never depend
//!   on an entry being present.
//!
//! ## Thread Safety
//!
//! All state sits behind one `parking_lot::Mutex` with short critical
//! sections (hash map probe plus deque bookkeeping; no hashing of bodies,
//! no allocation proportional to cost). There is no lock ordering to
//! violate because there is only one lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use tracing::debug;

use fleet_common::model::Artifact;

// ════════════════════════════════════════════════════════════════════════════
// CACHE CONFIG
// ════════════════════════════════════════════════════════════════════════════

/// Sizing for the artifact cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of 4-bit frequency counters for admission decisions.
    pub num_counters: usize,
    /// Maximum total cost in bytes of decoded bodies.
    pub max_cost: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_counters: 100_000,
            max_cost: 50 * 1024 * 1024,
        }
    }
}

impl From<&fleet_common::config::CacheSection> for CacheConfig {
    fn from(section: &fleet_common::config::CacheSection) -> Self {
        Self {
            num_counters: section.num_counters,
            max_cost: section.max_cost,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FREQUENCY SKETCH
// ════════════════════════════════════════════════════════════════════════════

/// Compact 4-bit frequency estimator over hashed keys.
///
/// Four counters per key via double hashing; estimates read the minimum.
/// Counters saturate at 15; when the total number of recorded touches
/// reaches `sample_period`, every counter is halved, so stale popularity
/// decays instead of pinning the cache forever.
#[derive(Debug)]
struct FrequencySketch {
    counters: Vec<u8>, // two 4-bit counters per byte
    touches: u64,
    sample_period: u64,
}

impl FrequencySketch {
    fn new(num_counters: usize) -> Self {
        let slots = num_counters.next_power_of_two().max(64);
        Self {
            counters: vec![0u8; slots / 2],
            touches: 0,
            sample_period: (slots as u64) * 10,
        }
    }

    fn slots(&self) -> u64 {
        (self.counters.len() * 2) as u64
    }

    fn index(&self, hash: u64, probe: u64) -> usize {
        // double hashing over a power-of-two table
        let mixed = hash
            .wrapping_add(probe.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .rotate_left((probe as u32) & 63);
        (mixed % self.slots()) as usize
    }

    fn get_counter(&self, slot: usize) -> u8 {
        let byte = self.counters[slot / 2];
        if slot % 2 == 0 {
            byte & 0x0F
        } else {
            byte >> 4
        }
    }

    fn set_counter(&mut self, slot: usize, value: u8) {
        let byte = &mut self.counters[slot / 2];
        if slot % 2 == 0 {
            *byte = (*byte & 0xF0) | (value & 0x0F);
        } else {
            *byte = (*byte & 0x0F) | (value << 4);
        }
    }

    /// Record one touch of `hash`.
    fn touch(&mut self, hash: u64) {
        for probe in 0..4 {
            let slot = self.index(hash, probe);
            let counter = self.get_counter(slot);
            if counter < 15 {
                self.set_counter(slot, counter + 1);
            }
        }
        self.touches += 1;
        if self.touches >= self.sample_period {
            self.decay();
        }
    }

    /// Estimated touch count of `hash`.
    fn estimate(&self, hash: u64) -> u8 {
        (0..4)
            .map(|probe| self.get_counter(self.index(hash, probe)))
            .min()
            .unwrap_or(0)
    }

    fn decay(&mut self) {
        for byte in &mut self.counters {
            // halve both nibbles in place
            *byte = (*byte >> 1) & 0x77;
        }
        self.touches = 0;
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ARTIFACT CACHE
// ════════════════════════════════════════════════════════════════════════════

type CacheKey = (String, String);

#[derive(Debug)]
struct Entry {
    artifact: Artifact,
    cost: u64,
    /// Stamp of the entry's latest position in the recency deque; older
    /// deque records for the same key are skipped on eviction.
    stamp: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    map: HashMap<CacheKey, Entry>,
    /// Lazy LRU order: `(key, stamp)` records, oldest first.
    recency: VecDeque<(CacheKey, u64)>,
    next_stamp: u64,
    total_cost: u64,
}

impl CacheState {
    fn touch_entry(&mut self, key: &CacheKey) {
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        if let Some(entry) = self.map.get_mut(key) {
            entry.stamp = stamp;
            self.recency.push_back((key.clone(), stamp));
        }
    }

    /// Pop recency records until a live one surfaces; returns its key.
    fn lru_victim(&mut self) -> Option<CacheKey> {
        while let Some((key, stamp)) = self.recency.front().cloned() {
            match self.map.get(&key) {
                Some(entry) if entry.stamp == stamp => return Some(key),
                _ => {
                    self.recency.pop_front();
                }
            }
        }
        None
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.map.remove(key) {
            self.total_cost -= entry.cost;
        }
    }
}

/// Keyed content cache over validated, decoded artifact bodies.
pub struct ArtifactCache {
    state: Mutex<CacheState>,
    sketch: Mutex<FrequencySketch>,
    max_cost: u64,
}

impl ArtifactCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            sketch: Mutex::new(FrequencySketch::new(cfg.num_counters)),
            max_cost: cfg.max_cost,
        }
    }

    fn key_hash(key: &CacheKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Look up a decoded artifact. A hit refreshes recency and feeds the
    /// frequency sketch.
    pub fn get_artifact(&self, identifier: &str, decoded_sha256: &str) -> Option<Artifact> {
        let key = (identifier.to_string(), decoded_sha256.to_string());
        self.sketch.lock().touch(Self::key_hash(&key));

        let mut state = self.state.lock();
        if state.map.contains_key(&key) {
            state.touch_entry(&key);
            return state.map.get(&key).map(|e| e.artifact.clone());
        }
        None
    }

    /// Insert a decoded artifact.
    ///
    /// May silently reject when admission predicts no value: the entry is
    /// larger than the whole cache, or colder than everything it would
    /// evict.
    pub fn set_artifact(&self, artifact: Artifact) {
        let key = (
            artifact.identifier.clone(),
            artifact.decoded_sha256.clone(),
        );
        let cost = artifact.body.len() as u64;
        if cost > self.max_cost {
            debug!(identifier = %key.0, cost, "artifact larger than cache, not admitted");
            return;
        }

        let hash = Self::key_hash(&key);
        let mut sketch = self.sketch.lock();
        sketch.touch(hash);
        let candidate_freq = sketch.estimate(hash);

        let mut state = self.state.lock();
        if state.map.contains_key(&key) {
            // refresh in place
            state.remove(&key);
        }

        // evict until the newcomer fits, but only past victims it beats
        while state.total_cost + cost > self.max_cost {
            let Some(victim) = state.lru_victim() else { break };
            if sketch.estimate(Self::key_hash(&victim)) > candidate_freq {
                debug!(identifier = %key.0, "artifact colder than cache victims, not admitted");
                return;
            }
            state.remove(&victim);
        }

        state.total_cost += cost;
        state.map.insert(
            key.clone(),
            Entry {
                artifact,
                cost,
                stamp: 0,
            },
        );
        state.touch_entry(&key);
    }

    /// Number of cached artifacts.
    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total cost of cached bodies in bytes.
    pub fn total_cost(&self) -> u64 {
        self.state.lock().total_cost
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(identifier: &str, sha2: &str, body: Vec<u8>) -> Artifact {
        Artifact {
            identifier: identifier.to_string(),
            decoded_sha256: sha2.to_string(),
            encoded_sha256: sha2.to_string(),
            decoded_size: body.len() as i64,
            encoded_size: 0,
            compression_algorithm: "none".to_string(),
            encryption_algorithm: "none".to_string(),
            created: 0,
            encoded_body: String::new(),
            body,
        }
    }

    fn small_cache(max_cost: u64) -> ArtifactCache {
        ArtifactCache::new(CacheConfig {
            num_counters: 1024,
            max_cost,
        })
    }

    // ────────────────────────────────────────────────────────────────────
    // A. GET / SET
    // ────────────────────────────────────────────────────────────────────

    #[test]
    fn test_set_then_get_returns_body() {
        let cache = small_cache(1024);
        cache.set_artifact(artifact("a", "s1", vec![1, 2, 3]));

        let hit = cache.get_artifact("a", "s1").expect("hit");
        assert_eq!(hit.body, vec![1, 2, 3]);
        assert_eq!(cache.total_cost(), 3);
    }

    #[test]
    fn test_miss_on_unknown_key_and_key_is_composite() {
        let cache = small_cache(1024);
        cache.set_artifact(artifact("a", "s1", vec![1]));

        assert!(cache.get_artifact("a", "s2").is_none());
        assert!(cache.get_artifact("b", "s1").is_none());
    }

    #[test]
    fn test_reinsert_replaces_cost() {
        let cache = small_cache(1024);
        cache.set_artifact(artifact("a", "s1", vec![0; 100]));
        cache.set_artifact(artifact("a", "s1", vec![0; 10]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 10);
    }

    #[test]
    fn test_oversized_artifact_rejected() {
        let cache = small_cache(16);
        cache.set_artifact(artifact("a", "s1", vec![0; 17]));
        assert!(cache.is_empty());
    }

    // ────────────────────────────────────────────────────────────────────
    // B. EVICTION & ADMISSION
    // ────────────────────────────────────────────────────────────────────

    #[test]
    fn test_cost_bound_holds_under_eviction() {
        let cache = small_cache(30);
        for i in 0..10 {
            cache.set_artifact(artifact(&format!("a{i}"), "s", vec![0; 10]));
        }
        assert!(cache.total_cost() <= 30);
        assert!(cache.len() <= 3);
    }

    #[test]
    fn test_hot_entry_survives_cold_newcomers() {
        let cache = small_cache(20);
        cache.set_artifact(artifact("hot", "s", vec![0; 10]));
        // heat it up
        for _ in 0..8 {
            assert!(cache.get_artifact("hot", "s").is_some());
        }
        // a stream of cold one-shot keys must not wash it out
        for i in 0..20 {
            cache.set_artifact(artifact(&format!("cold{i}"), "s", vec![0; 10]));
        }
        assert!(
            cache.get_artifact("hot", "s").is_some(),
            "hot entry must survive cold insert pressure"
        );
    }

    #[test]
    fn test_lru_order_respected_among_equals() {
        let cache = small_cache(20);
        cache.set_artifact(artifact("a", "s", vec![0; 10]));
        cache.set_artifact(artifact("b", "s", vec![0; 10]));
        // refresh "a" so "b" is the LRU victim, then give the newcomer
        // enough touches to pass admission against "b"
        cache.get_artifact("a", "s");
        cache.get_artifact("a", "s");
        for _ in 0..3 {
            cache.get_artifact("c", "s");
        }
        cache.set_artifact(artifact("c", "s", vec![0; 10]));

        assert!(cache.get_artifact("a", "s").is_some());
        assert!(cache.get_artifact("c", "s").is_some());
        assert!(cache.get_artifact("b", "s").is_none());
    }

    // ────────────────────────────────────────────────────────────────────
    // C. FREQUENCY SKETCH
    // ────────────────────────────────────────────────────────────────────

    #[test]
    fn test_sketch_estimates_grow_and_saturate() {
        let mut sketch = FrequencySketch::new(256);
        assert_eq!(sketch.estimate(42), 0);
        for _ in 0..20 {
            sketch.touch(42);
        }
        assert_eq!(sketch.estimate(42), 15, "counters saturate at 15");
    }

    #[test]
    fn test_sketch_decay_halves_counts() {
        let mut sketch = FrequencySketch::new(64);
        for _ in 0..8 {
            sketch.touch(7);
        }
        let before = sketch.estimate(7);
        sketch.decay();
        let after = sketch.estimate(7);
        assert_eq!(after, before / 2);
    }
}
