//! Replay-defense cache.
//!
//! Every underlay read path fingerprints the first 16 bytes of each
//! ciphertext (the authentication tag region) and asks this cache whether
//! the fingerprint was seen recently. A duplicate on the *first* read of a
//! connection is a replayed handshake and terminates the underlay; a
//! duplicate on a later read is recorded for diagnostics only, because the
//! opposite direction of the same flow legitimately reproduces tags in
//! some modes.
//!
//! The cache is a service passed by dependency, not ambient state: each
//! mux (and each test) owns its own instance.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::crypto::TAG_SIZE;

/// Default memory budget for tracked fingerprints (16 MiB).
pub const DEFAULT_CAPACITY_BYTES: usize = 16 * 1024 * 1024;

/// Default window after which an entry is considered absent.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(120);

/// Approximate per-entry cost: the fingerprint itself plus map and queue
/// bookkeeping.
const ENTRY_COST: usize = TAG_SIZE + 48;

type Fingerprint = [u8; TAG_SIZE];

struct Entries {
    seen: HashMap<Fingerprint, Instant>,
    // Insertion order; the front is always the oldest entry.
    order: VecDeque<(Fingerprint, Instant)>,
}

/// Bounded, time-windowed set of recent ciphertext fingerprints.
///
/// Safe for concurrent lookup and insertion from all underlay read paths.
pub struct ReplayCache {
    entries: Mutex<Entries>,
    max_entries: usize,
    window: Duration,
    new_session: AtomicU64,
    known_session: AtomicU64,
}

impl ReplayCache {
    /// Create a cache with a byte budget and an expiration window.
    pub fn new(capacity_bytes: usize, window: Duration) -> Self {
        Self {
            entries: Mutex::new(Entries {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries: (capacity_bytes / ENTRY_COST).max(1),
            window,
            new_session: AtomicU64::new(0),
            known_session: AtomicU64::new(0),
        }
    }

    /// Check whether a fingerprint was seen within the window, recording
    /// it if it was not.
    ///
    /// `tag` must hold at least [`TAG_SIZE`] bytes; only the leading
    /// [`TAG_SIZE`] bytes participate.
    pub fn is_duplicate(&self, tag: &[u8]) -> bool {
        debug_assert!(tag.len() >= TAG_SIZE);
        let mut fp = [0u8; TAG_SIZE];
        fp.copy_from_slice(&tag[..TAG_SIZE]);

        let now = Instant::now();
        let mut entries = self.entries.lock();

        // Expired entries are absent regardless of capacity.
        while let Some((old, at)) = entries.order.front() {
            if now.duration_since(*at) <= self.window {
                break;
            }
            let old = *old;
            entries.order.pop_front();
            entries.seen.remove(&old);
        }

        if let Some(at) = entries.seen.get(&fp) {
            if now.duration_since(*at) <= self.window {
                return true;
            }
        }

        // Oldest entries make room first.
        while entries.seen.len() >= self.max_entries {
            match entries.order.pop_front() {
                Some((old, _)) => {
                    entries.seen.remove(&old);
                }
                None => break,
            }
        }
        entries.seen.insert(fp, now);
        entries.order.push_back((fp, now));
        false
    }

    /// Record a duplicate observed on the first read of a connection.
    pub fn record_new_session_replay(&self) {
        self.new_session.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duplicate observed after the connection was established.
    pub fn record_known_session_replay(&self) {
        self.known_session.fetch_add(1, Ordering::Relaxed);
    }

    /// Replayed-handshake count across the process.
    pub fn new_session_replays(&self) -> u64 {
        self.new_session.load(Ordering::Relaxed)
    }

    /// Diagnostic duplicate count on established connections.
    pub fn known_session_replays(&self) -> u64 {
        self.known_session.load(Ordering::Relaxed)
    }

    /// Number of fingerprints currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().seen.len()
    }

    /// Whether the cache tracks nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES, DEFAULT_WINDOW)
    }
}
