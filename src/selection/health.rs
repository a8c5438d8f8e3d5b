use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::selection::now_unix_ms;

pub const INITIAL_SCORE: f64 = 70.0;
pub const MAX_SCORE: f64 = 100.0;
pub const MIN_USABLE: f64 = 50.0;
pub const SUCCESS_BONUS: f64 = 1.0;
pub const RATE_LIMIT_PENALTY: f64 = 10.0;
pub const FAILURE_PENALTY: f64 = 20.0;
pub const RECOVERY_PER_HOUR: f64 = 10.0;

const READ_CACHE_TTL_MS: u64 = 60_000;

/// Persisted per-(provider, credential) reliability record. `health_score` is the
/// "last known worst" value -- passive recovery is derived on read, never written back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub health_score: f64,
    pub last_failure_at_unix_ms: Option<u64>,
    pub error_count: u32,
    pub last_error: String,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            health_score: INITIAL_SCORE,
            last_failure_at_unix_ms: None,
            error_count: 0,
            last_error: String::new(),
        }
    }
}

/// Storage contract consumed by the health tracker (§6). A `sled`-backed and an
/// in-memory implementation live in [`crate::storage`].
pub trait HealthStore: Send + Sync {
    fn get(&self, provider: &str, id: i64) -> StoreResult<Option<HealthRecord>>;
    fn get_by_provider(&self, provider: &str) -> StoreResult<Vec<(i64, HealthRecord)>>;
    fn record_success(&self, provider: &str, id: i64, bonus: f64) -> StoreResult<()>;
    fn record_failure(
        &self,
        provider: &str,
        id: i64,
        error_message: &str,
        penalty: f64,
    ) -> StoreResult<()>;
    fn record_rate_limit(&self, provider: &str, id: i64, penalty: f64) -> StoreResult<()>;
}

struct CachedScore {
    score: f64,
    cached_at_ms: u64,
}

/// Per-credential reliability score with passive, read-only, time-based recovery.
pub struct HealthTracker {
    store: Arc<dyn HealthStore>,
    cache: RwLock<HashMap<(String, i64), CachedScore>>,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn HealthStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_usable(score: f64) -> bool {
        score >= MIN_USABLE
    }

    /// Returns the live score, applying passive recovery on read. Never mutates the
    /// stored score -- recovery is derived, not persisted.
    pub fn get_score(&self, provider: &str, id: i64) -> StoreResult<f64> {
        let key = (provider.to_string(), id);
        let now = now_unix_ms();

        if let Some(cached) = self.cache.read().get(&key) {
            if now.saturating_sub(cached.cached_at_ms) < READ_CACHE_TTL_MS {
                return Ok(cached.score);
            }
        }

        let record = self.store.get(provider, id)?;
        let score = match record {
            None => INITIAL_SCORE,
            Some(r) => {
                let recovered = r
                    .last_failure_at_unix_ms
                    .map(|t| {
                        let hours_since = now.saturating_sub(t) as f64 / 3_600_000.0;
                        (hours_since * RECOVERY_PER_HOUR).floor()
                    })
                    .unwrap_or(0.0);
                (r.health_score + recovered).min(MAX_SCORE)
            }
        };

        self.cache.write().insert(
            key,
            CachedScore {
                score,
                cached_at_ms: now,
            },
        );
        Ok(score)
    }

    fn invalidate(&self, provider: &str, id: i64) {
        self.cache.write().remove(&(provider.to_string(), id));
    }

    pub fn record_success(&self, provider: &str, id: i64) -> StoreResult<()> {
        self.store.record_success(provider, id, SUCCESS_BONUS)?;
        self.invalidate(provider, id);
        Ok(())
    }

    pub fn record_failure(&self, provider: &str, id: i64, error_message: &str) -> StoreResult<()> {
        self.store
            .record_failure(provider, id, error_message, FAILURE_PENALTY)?;
        self.invalidate(provider, id);
        Ok(())
    }

    pub fn record_rate_limit(&self, provider: &str, id: i64) -> StoreResult<()> {
        self.store
            .record_rate_limit(provider, id, RATE_LIMIT_PENALTY)?;
        self.invalidate(provider, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryHealthStore;

    fn tracker() -> HealthTracker {
        HealthTracker::new(Arc::new(InMemoryHealthStore::new()))
    }

    #[test]
    fn unknown_credential_starts_at_initial_score() {
        let t = tracker();
        assert_eq!(t.get_score("kiro", 1).unwrap(), INITIAL_SCORE);
    }

    #[test]
    fn failure_is_clamped_to_zero_floor() {
        let t = tracker();
        for _ in 0..5 {
            t.record_failure("kiro", 1, "boom").unwrap();
        }
        // 70 - 5*20 would go well below zero without clamping.
        assert_eq!(t.get_score("kiro", 1).unwrap(), 0.0);
        assert!(!HealthTracker::is_usable(t.get_score("kiro", 1).unwrap()));
    }

    #[test]
    fn success_is_clamped_to_max_score() {
        let t = tracker();
        for _ in 0..100 {
            t.record_success("kiro", 1).unwrap();
        }
        assert_eq!(t.get_score("kiro", 1).unwrap(), MAX_SCORE);
    }

    #[test]
    fn recovery_is_read_only_and_monotonic_until_next_write() {
        let store = Arc::new(InMemoryHealthStore::new());
        store
            .seed(
                "kiro",
                1,
                HealthRecord {
                    health_score: 0.0,
                    last_failure_at_unix_ms: Some(now_unix_ms() - 3 * 3_600_000),
                    error_count: 1,
                    last_error: "x".to_string(),
                },
            )
            .unwrap();
        let t = HealthTracker::new(store.clone());
        // 3 hours since failure * 10/hour = 30 recovered points on top of a persisted 0.
        // TTL cache would mask this in production; bypass by using a fresh tracker per read.
        let recovered = HealthTracker::new(store.clone()).get_score("kiro", 1).unwrap();
        assert_eq!(recovered, 30.0);

        // The underlying stored score itself was never bumped by the read.
        let raw = store.get("kiro", 1).unwrap().unwrap();
        assert_eq!(raw.health_score, 0.0);
    }
}
