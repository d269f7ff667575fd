//! In-process backend with the same per-key atomicity as the Redis scripts.
//!
//! Each primitive runs under the `DashMap` shard lock for its key, so
//! concurrent callers on the same key are serialized.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{BucketReply, BucketRequest, WindowReply, WindowRequest, now_ms, ttl_millis};

/// Entries are swept once the map grows past this size
const SWEEP_THRESHOLD: usize = 10_000;
/// Sweep check cadence (operations)
const SWEEP_EVERY: u64 = 1_024;

enum Slot {
    Window(VecDeque<u64>),
    Bucket { tokens: f64, last_ms: u64 },
    Counter(i64),
    Value(String),
}

struct Stored {
    slot: Slot,
    expires_at_ms: u64,
}

impl Stored {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Local store keyed like the shared one
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Stored>>,
    ops: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live and not-yet-swept keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(super) fn sliding_window(&self, req: &WindowRequest) -> WindowReply {
        self.maybe_sweep(req.now_ms);
        let cutoff = req.now_ms.saturating_sub(req.window_ms);

        let mut entry = self.entries.entry(req.key.clone()).or_insert_with(|| Stored {
            slot: Slot::Window(VecDeque::new()),
            expires_at_ms: 0,
        });
        let stored = entry.value_mut();
        let expired = stored.is_expired(req.now_ms);
        let mut stamps = match std::mem::replace(&mut stored.slot, Slot::Counter(0)) {
            Slot::Window(stamps) if !expired => stamps,
            _ => VecDeque::new(),
        };

        // Timestamps are pushed in arrival order, so the oldest are at the front.
        while stamps.front().is_some_and(|&ts| ts <= cutoff) {
            stamps.pop_front();
        }

        let count = stamps.len() as u64;
        let allowed = count + req.cost <= req.limit;
        if allowed {
            for _ in 0..req.cost {
                stamps.push_back(req.now_ms);
            }
        }
        let oldest_ms = stamps.front().copied();
        let room_at_ms = if allowed {
            None
        } else {
            usize::try_from(count + req.cost - req.limit - 1)
                .ok()
                .and_then(|index| stamps.get(index).copied())
        };
        let count = stamps.len() as u64;
        stored.slot = Slot::Window(stamps);
        stored.expires_at_ms = req.now_ms.saturating_add(req.window_ms);

        WindowReply {
            allowed,
            count,
            oldest_ms,
            room_at_ms,
        }
    }

    pub(super) fn token_bucket(&self, req: &BucketRequest) -> BucketReply {
        self.maybe_sweep(req.now_ms);

        let mut entry = self.entries.entry(req.key.clone()).or_insert_with(|| Stored {
            slot: Slot::Bucket {
                tokens: req.burst,
                last_ms: req.now_ms,
            },
            expires_at_ms: u64::MAX,
        });
        let stored = entry.value_mut();
        let expired = stored.is_expired(req.now_ms);
        let (tokens, last_ms) = match stored.slot {
            Slot::Bucket { tokens, last_ms } if !expired => (tokens, last_ms),
            _ => (req.burst, req.now_ms),
        };

        let mut available = refill_tokens(tokens, last_ms, req.now_ms, req.rate_per_sec, req.burst);
        let allowed = available >= req.cost;
        if allowed {
            available -= req.cost;
        }
        let tokens = available.max(0.0);
        stored.slot = Slot::Bucket {
            tokens,
            last_ms: last_ms.max(req.now_ms),
        };
        stored.expires_at_ms = req.now_ms.saturating_add(req.ttl_ms);

        BucketReply { allowed, tokens }
    }

    pub(super) fn incr(&self, key: &str, ttl: Duration) -> i64 {
        let now = now_ms();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Stored {
            slot: Slot::Counter(0),
            expires_at_ms: 0,
        });
        let stored = entry.value_mut();
        let current = match stored.slot {
            Slot::Counter(v) if !stored.is_expired(now) => v,
            _ => 0,
        };
        stored.slot = Slot::Counter(current + 1);
        stored.expires_at_ms = now.saturating_add(ttl_millis(ttl));
        current + 1
    }

    pub(super) fn decr(&self, key: &str) -> i64 {
        let now = now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                let remaining = match stored.slot {
                    Slot::Counter(v) if !stored.is_expired(now) => v - 1,
                    _ => 0,
                };
                stored.slot = Slot::Counter(remaining);
                if remaining <= 0 {
                    occupied.remove();
                    0
                } else {
                    remaining
                }
            }
            Entry::Vacant(_) => 0,
        }
    }

    pub(super) fn get(&self, key: &str) -> Option<String> {
        let now = now_ms();
        let entry = self.entries.get(key)?;
        match &entry.slot {
            Slot::Value(v) if !entry.is_expired(now) => Some(v.clone()),
            _ => None,
        }
    }

    pub(super) fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Stored {
                slot: Slot::Value(value.to_string()),
                expires_at_ms: now_ms().saturating_add(ttl_millis(ttl)),
            },
        );
    }

    pub(super) fn exists(&self, key: &str) -> bool {
        let now = now_ms();
        self.entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    fn maybe_sweep(&self, now: u64) {
        let ops = self.ops.fetch_add(1, Ordering::Relaxed);
        if ops % SWEEP_EVERY == 0 && self.entries.len() > SWEEP_THRESHOLD {
            self.entries.retain(|_, stored| !stored.is_expired(now));
        }
    }
}

/// Tokens after refilling for the time elapsed since `last_ms`, capped at `burst`.
///
/// Time running backwards (clock skew between instances) adds nothing.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn refill_tokens(tokens: f64, last_ms: u64, now_ms: u64, rate_per_sec: f64, burst: f64) -> f64 {
    let elapsed_secs = now_ms.saturating_sub(last_ms) as f64 / 1000.0;
    (tokens + elapsed_secs * rate_per_sec).min(burst)
}
