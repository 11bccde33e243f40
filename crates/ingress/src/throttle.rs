//! # Throttle Module
//!
//! Token-based concurrency limiter for the artifact fetch path.
//!
//! ## Principles
//!
//! - Thread-safe via a single short `parking_lot::Mutex` critical section
//! - Two concurrent caps: a global maximum and a per-key maximum
//! - Non-blocking: `acquire` returns `None` when saturated, never waits
//! - No panic, unwrap, or silent failure
//!
//! ## Semantics
//!
//! - `acquire(key, ttl)`: reserve a slot for `key`, or `None` when either
//!   cap is saturated
//! - Tokens release on `drop` (or an explicit, idempotent `release()`)
//! - Tokens self-expire after their TTL so a caller that crashes between
//!   acquire and release cannot wedge the slot forever; expiry is swept
//!   lazily on each acquire against the monotonic clock

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

// ════════════════════════════════════════════════════════════════════════════
// DEFAULTS
// ════════════════════════════════════════════════════════════════════════════

/// Default global cap on outstanding tokens.
pub const DEFAULT_MAX_PARALLEL: usize = 8;

/// Default cap per key.
pub const DEFAULT_MAX_PER_KEY: usize = 1;

// ════════════════════════════════════════════════════════════════════════════
// INTERNAL STATE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct Slot {
    token_id: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct ThrottleState {
    /// Outstanding slots per key.
    slots: HashMap<String, Vec<Slot>>,
    /// Total outstanding slots across all keys.
    outstanding: usize,
    next_token_id: u64,
}

impl ThrottleState {
    /// Drop every slot whose TTL elapsed. Called under the lock.
    fn sweep(&mut self, now: Instant) {
        let outstanding = &mut self.outstanding;
        self.slots.retain(|key, slots| {
            let before = slots.len();
            slots.retain(|slot| slot.expires_at > now);
            let expired = before - slots.len();
            if expired > 0 {
                *outstanding -= expired;
                warn!(key = %key, expired, "throttle token expired unreleased");
            }
            !slots.is_empty()
        });
    }

    fn release(&mut self, key: &str, token_id: u64) {
        if let Some(slots) = self.slots.get_mut(key) {
            let before = slots.len();
            slots.retain(|slot| slot.token_id != token_id);
            if slots.len() < before {
                self.outstanding -= 1;
            }
            if slots.is_empty() {
                self.slots.remove(key);
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// THROTTLE
// ════════════════════════════════════════════════════════════════════════════

/// Global + per-key concurrency limiter with TTL-bound tokens.
#[derive(Debug, Clone)]
pub struct Throttle {
    state: Arc<Mutex<ThrottleState>>,
    max_parallel: usize,
    max_per_key: usize,
}

impl Throttle {
    /// Limiter with the given global cap and a per-key cap of 1.
    pub fn new(max_parallel: usize) -> Self {
        Self::with_per_key(max_parallel, DEFAULT_MAX_PER_KEY)
    }

    /// Limiter with explicit global and per-key caps.
    pub fn with_per_key(max_parallel: usize, max_per_key: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ThrottleState::default())),
            max_parallel,
            max_per_key,
        }
    }

    /// Reserve a slot for `key`.
    ///
    /// Returns `None` when the global cap or the per-key cap is
    /// saturated. Never blocks. The returned token releases its slot on
    /// drop, or after `ttl` if the holder disappears.
    pub fn acquire(&self, key: &str, ttl: Duration) -> Option<ThrottleToken> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.sweep(now);

        if state.outstanding >= self.max_parallel {
            debug!(key, outstanding = state.outstanding, "throttle saturated globally");
            return None;
        }
        let held = state.slots.get(key).map_or(0, Vec::len);
        if held >= self.max_per_key {
            debug!(key, held, "throttle saturated for key");
            return None;
        }

        state.next_token_id += 1;
        let token_id = state.next_token_id;
        state
            .slots
            .entry(key.to_string())
            .or_default()
            .push(Slot {
                token_id,
                expires_at: now + ttl,
            });
        state.outstanding += 1;

        Some(ThrottleToken {
            state: Arc::clone(&self.state),
            key: key.to_string(),
            token_id,
            released: false,
        })
    }

    /// Outstanding (unexpired, unreleased) tokens.
    pub fn outstanding(&self) -> usize {
        let mut state = self.state.lock();
        state.sweep(Instant::now());
        state.outstanding
    }
}

// ════════════════════════════════════════════════════════════════════════════
// THROTTLE TOKEN
// ════════════════════════════════════════════════════════════════════════════

/// A revocable capacity reservation. Always safe to drop.
#[derive(Debug)]
pub struct ThrottleToken {
    state: Arc<Mutex<ThrottleState>>,
    key: String,
    token_id: u64,
    released: bool,
}

impl ThrottleToken {
    /// Release the slot. Idempotent; drop does the same.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.state.lock().release(&self.key, self.token_id);
    }
}

impl Drop for ThrottleToken {
    fn drop(&mut self) {
        self.release();
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    // ────────────────────────────────────────────────────────────────────
    // A. CAPS
    // ────────────────────────────────────────────────────────────────────

    #[test]
    fn test_per_key_cap_is_one() {
        let throttle = Throttle::new(8);
        let token = throttle.acquire("sha-a", TTL);
        assert!(token.is_some());
        assert!(throttle.acquire("sha-a", TTL).is_none());
        // a different key is unaffected
        assert!(throttle.acquire("sha-b", TTL).is_some());
    }

    #[test]
    fn test_global_cap_enforced() {
        let throttle = Throttle::new(2);
        let _a = throttle.acquire("a", TTL).unwrap();
        let _b = throttle.acquire("b", TTL).unwrap();
        assert!(throttle.acquire("c", TTL).is_none());
        assert_eq!(throttle.outstanding(), 2);
    }

    #[test]
    fn test_release_frees_slot() {
        let throttle = Throttle::new(1);
        let mut token = throttle.acquire("a", TTL).unwrap();
        token.release();
        assert!(throttle.acquire("b", TTL).is_some());
    }

    #[test]
    fn test_drop_releases() {
        let throttle = Throttle::new(1);
        {
            let _token = throttle.acquire("a", TTL).unwrap();
            assert_eq!(throttle.outstanding(), 1);
        }
        assert_eq!(throttle.outstanding(), 0);
        assert!(throttle.acquire("a", TTL).is_some());
    }

    #[test]
    fn test_release_is_idempotent() {
        let throttle = Throttle::new(2);
        let mut token = throttle.acquire("a", TTL).unwrap();
        token.release();
        token.release();
        // double release must not free a slot it no longer owns
        let _b = throttle.acquire("b", TTL).unwrap();
        let _c = throttle.acquire("c", TTL).unwrap();
        assert!(throttle.acquire("d", TTL).is_none());
    }

    // ────────────────────────────────────────────────────────────────────
    // B. TTL EXPIRY
    // ────────────────────────────────────────────────────────────────────

    #[test]
    fn test_forgotten_token_expires_after_ttl() {
        let throttle = Throttle::new(1);
        let token = throttle.acquire("a", Duration::from_millis(20)).unwrap();
        std::mem::forget(token); // lost release

        assert!(throttle.acquire("a", TTL).is_none());
        std::thread::sleep(Duration::from_millis(30));
        // the expired slot no longer blocks the key
        assert!(throttle.acquire("a", TTL).is_some());
    }

    #[test]
    fn test_expired_token_release_is_harmless() {
        let throttle = Throttle::new(2);
        let mut token = throttle.acquire("a", Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // slot already swept; a new holder owns the key
        let _fresh = throttle.acquire("a", TTL).unwrap();
        token.release();
        assert_eq!(throttle.outstanding(), 1);
    }

    // ────────────────────────────────────────────────────────────────────
    // C. CONCURRENCY
    // ────────────────────────────────────────────────────────────────────

    #[test]
    fn test_concurrent_acquires_respect_global_cap() {
        let throttle = Throttle::new(4);
        // tokens are parked here so successful acquires stay outstanding
        let granted = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let throttle = throttle.clone();
                let granted = Arc::clone(&granted);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    if let Some(token) = throttle.acquire(&format!("key-{i}"), TTL) {
                        granted.lock().push(token);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(granted.lock().len(), 4);
        assert_eq!(throttle.outstanding(), 4);
    }
}
