//! Index Monitor
//!
//! This module provides [`IndexMonitor`], the tailing change-monitor over
//! a document index shared by the whole coordination plane.
//!
//! ## Role
//!
//! The monitor owns a single high-water cursor over the index's global
//! sequence numbers and multiplexes ordered change notifications to any
//! number of subscribers:
//!
//! - Primes from a bounded scan of the most recent documents
//! - Tails with a `seq > cursor` range query on each poll tick
//! - Fans out every document to all live subscriptions
//! - Advances the cursor only after a document has been fanned out
//! - Backs off exponentially on store errors and resumes from the cursor
//!
//! ## Slow consumers
//!
//! Fanout never blocks the poll loop. A subscriber whose buffer is full
//! is dropped: its sender is removed and closed, so the subscriber
//! observes `None` from its channel while every other subscription keeps
//! receiving. The `slow_consumer_drops` counter records each drop.
//!
//! ## State machine
//!
//! ```text
//! Init → Priming → Tailing ⇄ Backoff → Stopped
//! ```
//!
//! Cancellation is not an error: `run` returns `Ok(())` when the shutdown
//! handle fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use fleet_common::config::MonitorSection;
use fleet_common::store::{DocStore, Query, StoreError};

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Initial store-error backoff.
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Backoff cap.
const MAX_BACKOFF_MS: u64 = 30_000;

// ════════════════════════════════════════════════════════════════════════════
// CHANGE & SUBSCRIPTION
// ════════════════════════════════════════════════════════════════════════════

/// One document change delivered to subscribers.
///
/// Within a single subscription, changes arrive in strictly ascending
/// `seq` order. No ordering is promised across subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Document id.
    pub id: String,
    /// Sequence number of the write that produced this change.
    pub seq: u64,
    /// Document body at that write.
    pub body: serde_json::Value,
}

/// Opaque subscription handle, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// A live subscription: one-producer, one-consumer delivery pipe.
///
/// Dropped-and-closed is the slow-consumer signal: `next()` returns
/// `None` once the monitor has evicted this subscriber (or stopped).
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::Receiver<Change>,
}

impl Subscription {
    /// This subscription's handle.
    #[must_use]
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Receive the next change; `None` when dropped or the monitor stopped.
    pub async fn next(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for drain loops.
    pub fn try_next(&mut self) -> Option<Change> {
        self.rx.try_recv().ok()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MONITOR STATE & METRICS
// ════════════════════════════════════════════════════════════════════════════

/// Observable lifecycle state of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Init,
    Priming,
    Tailing,
    Backoff,
    Stopped,
}

/// Counters for monitor operations.
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    /// Documents fanned out (counted once per document, not per subscriber).
    pub docs_delivered: AtomicU64,
    /// Subscriptions evicted for falling behind.
    pub slow_consumer_drops: AtomicU64,
    /// Poll attempts that failed with a transient store error.
    pub poll_errors: AtomicU64,
}

// ════════════════════════════════════════════════════════════════════════════
// MONITOR CONFIG
// ════════════════════════════════════════════════════════════════════════════

/// Tuning for the poll loop and subscriber channels.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between tail polls.
    pub poll_interval: Duration,
    /// Maximum documents per poll and per priming scan.
    pub fetch_size: usize,
    /// Per-subscription channel capacity; a subscriber this far behind
    /// is dropped.
    pub subscriber_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            fetch_size: 512,
            subscriber_buffer: 64,
        }
    }
}

impl From<&MonitorSection> for MonitorConfig {
    fn from(section: &MonitorSection) -> Self {
        Self {
            poll_interval: section.poll_interval(),
            fetch_size: section.fetch_size,
            ..Self::default()
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// INDEX MONITOR
// ════════════════════════════════════════════════════════════════════════════

/// Tails one index and fans out ordered changes to subscribers.
///
/// # Thread Safety
///
/// Subscribe/unsubscribe may be called from any task while `run` is
/// live; the subscriber map sits behind a short `parking_lot::Mutex`
/// that is never held across an await point.
pub struct IndexMonitor {
    index: String,
    store: Arc<dyn DocStore>,
    cfg: MonitorConfig,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Change>>>,
    next_handle: AtomicU64,
    /// High-water cursor: highest seq already fanned out.
    cursor: AtomicU64,
    state: RwLock<MonitorState>,
    metrics: MonitorMetrics,
}

impl IndexMonitor {
    pub fn new(index: impl Into<String>, store: Arc<dyn DocStore>, cfg: MonitorConfig) -> Self {
        Self {
            index: index.into(),
            store,
            cfg,
            subscribers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            cursor: AtomicU64::new(0),
            state: RwLock::new(MonitorState::Init),
            metrics: MonitorMetrics::default(),
        }
    }

    /// Register a new subscription.
    ///
    /// Subscribers registered before `run` receive the priming scan;
    /// later subscribers receive only changes after their registration.
    pub fn subscribe(&self) -> Subscription {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.cfg.subscriber_buffer);
        self.subscribers.lock().insert(handle, tx);
        debug!(index = %self.index, handle, "monitor subscription added");
        Subscription {
            handle: SubscriptionHandle(handle),
            rx,
        }
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self.subscribers.lock().remove(&handle.0).is_some() {
            debug!(index = %self.index, handle = handle.0, "monitor subscription removed");
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Current high-water cursor.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MonitorState {
        *self.state.read()
    }

    /// Operation counters.
    pub fn metrics(&self) -> &MonitorMetrics {
        &self.metrics
    }

    fn set_state(&self, state: MonitorState) {
        *self.state.write() = state;
    }

    // ────────────────────────────────────────────────────────────────────
    // RUN LOOP
    // ────────────────────────────────────────────────────────────────────

    /// Run until `shutdown` fires or the store fails fatally.
    ///
    /// Cancellation returns `Ok(())`; only a fatal store error is an
    /// error. Transient store errors back off exponentially (capped at
    /// 30 s) and resume from the cursor, so no change is skipped.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), StoreError> {
        info!(index = %self.index, "index monitor starting");
        self.set_state(MonitorState::Priming);

        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);

        // Priming: bounded scan of the most recent documents.
        loop {
            match self
                .store
                .search(
                    &self.index,
                    &Query::LatestN {
                        size: self.cfg.fetch_size,
                    },
                )
                .await
            {
                Ok(hits) => {
                    for hit in hits {
                        let seq = hit.seq;
                        self.fan_out(Change {
                            id: hit.id,
                            seq,
                            body: hit.body,
                        });
                        self.cursor.store(seq, Ordering::SeqCst);
                    }
                    break;
                }
                Err(err) if err.is_transient() => {
                    self.metrics.poll_errors.fetch_add(1, Ordering::Relaxed);
                    self.set_state(MonitorState::Backoff);
                    warn!(index = %self.index, error = %err, delay_ms = backoff.as_millis() as u64,
                        "priming scan failed, backing off");
                    if self.sleep_or_shutdown(backoff, &shutdown).await {
                        self.set_state(MonitorState::Stopped);
                        return Ok(());
                    }
                    backoff = next_backoff(backoff);
                    self.set_state(MonitorState::Priming);
                }
                Err(err) => {
                    self.set_state(MonitorState::Stopped);
                    return Err(err);
                }
            }
        }

        self.set_state(MonitorState::Tailing);
        debug!(index = %self.index, cursor = self.cursor(), "priming complete, tailing");

        // Tailing: poll, deliver, advance.
        loop {
            if self.sleep_or_shutdown(self.cfg.poll_interval, &shutdown).await {
                break;
            }

            match self.poll_once().await {
                Ok(_) => {
                    if self.state() != MonitorState::Tailing {
                        self.set_state(MonitorState::Tailing);
                    }
                    backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
                }
                Err(err) if err.is_transient() => {
                    self.metrics.poll_errors.fetch_add(1, Ordering::Relaxed);
                    self.set_state(MonitorState::Backoff);
                    warn!(index = %self.index, error = %err, delay_ms = backoff.as_millis() as u64,
                        "tail poll failed, backing off");
                    if self.sleep_or_shutdown(backoff, &shutdown).await {
                        break;
                    }
                    backoff = next_backoff(backoff);
                }
                Err(err) => {
                    self.set_state(MonitorState::Stopped);
                    self.close_all_subscribers();
                    return Err(err);
                }
            }
        }

        self.set_state(MonitorState::Stopped);
        self.close_all_subscribers();
        info!(index = %self.index, "index monitor stopped");
        Ok(())
    }

    /// One tail poll. The cursor advances per document, after fanout, so
    /// a failure between documents resumes exactly where delivery stopped.
    async fn poll_once(&self) -> Result<usize, StoreError> {
        let cursor = self.cursor.load(Ordering::SeqCst);
        let hits = self
            .store
            .search(
                &self.index,
                &Query::SeqAbove {
                    seq: cursor,
                    size: self.cfg.fetch_size,
                },
            )
            .await?;

        let count = hits.len();
        for hit in hits {
            let seq = hit.seq;
            self.fan_out(Change {
                id: hit.id,
                seq,
                body: hit.body,
            });
            self.cursor.store(seq, Ordering::SeqCst);
        }
        Ok(count)
    }

    /// Deliver one change to every subscriber without blocking.
    ///
    /// A full buffer evicts the subscriber; a closed receiver is pruned
    /// silently.
    fn fan_out(&self, change: Change) {
        let mut dropped: Vec<(u64, bool)> = Vec::new();
        {
            let subscribers = self.subscribers.lock();
            for (&handle, tx) in subscribers.iter() {
                match tx.try_send(change.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => dropped.push((handle, true)),
                    Err(mpsc::error::TrySendError::Closed(_)) => dropped.push((handle, false)),
                }
            }
        }
        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.lock();
            for (handle, slow) in dropped {
                subscribers.remove(&handle);
                if slow {
                    self.metrics
                        .slow_consumer_drops
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(index = %self.index, handle, seq = change.seq,
                        "slow consumer dropped");
                }
            }
        }
        self.metrics.docs_delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn close_all_subscribers(&self) {
        self.subscribers.lock().clear();
    }

    /// Sleep for `dur`, returning `true` if shutdown fired first.
    async fn sleep_or_shutdown(&self, dur: Duration, shutdown: &Notify) -> bool {
        tokio::select! {
            _ = shutdown.notified() => true,
            _ = tokio::time::sleep(dur) => false,
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(Duration::from_millis(MAX_BACKOFF_MS))
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
