//! In-flight request cap per caller.

use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use crate::Result;
use crate::store::SharedCache;

/// Upper bound on how long a slot survives if its release is lost
pub const SLOT_TTL: Duration = Duration::from_secs(300);

/// Holds one in-flight slot; releasing it is tied to `Drop` so every exit
/// path (early return, panic, client disconnect) gives the slot back.
pub struct ConcurrencyGuard {
    cache: SharedCache,
    key: String,
}

impl fmt::Debug for ConcurrencyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyGuard").field("key", &self.key).finish()
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = cache.decr(&key).await {
                        warn!(error = %e, key = %key, "Failed to release concurrency slot");
                    }
                });
            }
            Err(_) => debug!(key = %key, "No runtime to release concurrency slot, it expires with its TTL"),
        }
    }
}

/// Take a slot under `key`. `None` means the cap is reached; the increment
/// has already been undone by then.
///
/// The guard is armed before the increment is sent, so an increment whose
/// reply times out, fails or is abandoned mid-flight is undone as well.
pub async fn acquire(cache: &SharedCache, key: String, max_in_flight: u32) -> Result<Option<ConcurrencyGuard>> {
    let guard = ConcurrencyGuard {
        cache: cache.clone(),
        key,
    };
    let in_flight = cache.incr(&guard.key, SLOT_TTL).await?;
    if in_flight > i64::from(max_in_flight) {
        drop(guard);
        return Ok(None);
    }
    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn in_flight(cache: &SharedCache, key: &str) -> i64 {
        // Releases run on spawned tasks; let them finish.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let now = cache.incr(key, SLOT_TTL).await.unwrap() - 1;
        cache.decr(key).await.unwrap();
        now
    }

    #[tokio::test]
    async fn test_cap_is_enforced_and_released() {
        // GIVEN: a cap of two
        let cache = SharedCache::memory(Duration::from_millis(100));
        let key = "gate:conc:user:u1".to_string();

        // WHEN: three slots are requested
        let first = acquire(&cache, key.clone(), 2).await.unwrap();
        let second = acquire(&cache, key.clone(), 2).await.unwrap();
        let third = acquire(&cache, key.clone(), 2).await.unwrap();

        // THEN: the third is refused and its increment undone
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none());
        assert_eq!(in_flight(&cache, &key).await, 2);

        // WHEN: the holders finish
        drop(first);
        drop(second);

        // THEN: every slot is back
        assert_eq!(in_flight(&cache, &key).await, 0);
        assert!(acquire(&cache, key.clone(), 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_increment_with_lost_reply_is_undone() {
        // GIVEN: a store that applies the increment but replies after the call timeout
        let slow = SharedCache::memory_with_latency(Duration::from_millis(20), Duration::from_millis(60));
        let key = "gate:conc:user:u4".to_string();

        // WHEN: a slot is requested
        let err = acquire(&slow, key.clone(), 1).await.unwrap_err();
        assert!(err.is_cache_failure());

        // THEN: the landed increment is released again
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(in_flight(&slow.without_latency(), &key).await, 0);
    }

    #[tokio::test]
    async fn test_abandoned_acquire_is_undone() {
        // GIVEN: a store slower than the caller is willing to wait
        let slow = SharedCache::memory_with_latency(Duration::from_secs(1), Duration::from_millis(100));
        let key = "gate:conc:user:u5".to_string();

        // WHEN: the acquiring future is dropped while the increment is in flight
        let abandoned = tokio::time::timeout(Duration::from_millis(20), acquire(&slow, key.clone(), 1)).await;
        assert!(abandoned.is_err());

        // THEN: the slot does not leak
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(in_flight(&slow.without_latency(), &key).await, 0);
    }

    #[tokio::test]
    async fn test_slot_released_when_holder_panics() {
        let cache = SharedCache::memory(Duration::from_millis(100));
        let key = "gate:conc:user:u2".to_string();

        let held = acquire(&cache, key.clone(), 1).await.unwrap();
        let task = tokio::spawn(async move {
            let _held = held;
            panic!("handler blew up");
        });
        assert!(task.await.is_err());

        assert_eq!(in_flight(&cache, &key).await, 0);
    }
}
