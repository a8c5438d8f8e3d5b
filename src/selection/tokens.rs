use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

pub const DEFAULT_MAX_TOKENS: f64 = 50.0;
pub const DEFAULT_REGEN_PER_MINUTE: f64 = 6.0;

/// Persisted per-(provider, credential) token bucket state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenRecord {
    pub tokens: f64,
    pub last_updated_unix_ms: u64,
}

impl TokenRecord {
    pub fn full(max_tokens: f64, now_ms: u64) -> Self {
        Self {
            tokens: max_tokens,
            last_updated_unix_ms: now_ms,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumeOutcome {
    pub success: bool,
    pub tokens: f64,
}

/// Storage contract consumed by the token bucket (§6). `consume`/`refund` MUST be atomic
/// per `(provider, id)` -- see §5. A caller-side read cache is explicitly permitted by the
/// contract but not required; this tracker always goes to the store so every read reflects
/// the latest write, which is simpler to reason about and cheap for the in-memory/sled
/// backends this crate ships.
pub trait TokenStore: Send + Sync {
    fn get_tokens(
        &self,
        provider: &str,
        id: i64,
        max_tokens: f64,
        regen_per_minute: f64,
    ) -> StoreResult<f64>;
    fn get_by_provider(&self, provider: &str) -> StoreResult<Vec<(i64, TokenRecord)>>;
    fn consume(
        &self,
        provider: &str,
        id: i64,
        amount: f64,
        max_tokens: f64,
        regen_per_minute: f64,
    ) -> StoreResult<ConsumeOutcome>;
    fn refund(&self, provider: &str, id: i64, amount: f64, max_tokens: f64) -> StoreResult<f64>;
}

/// Regenerates `effective = min(max_tokens, tokens + elapsed_minutes * regen_per_minute)`.
pub fn regenerate(record: TokenRecord, now_ms: u64, max_tokens: f64, regen_per_minute: f64) -> f64 {
    let elapsed_minutes = now_ms.saturating_sub(record.last_updated_unix_ms) as f64 / 60_000.0;
    (record.tokens + elapsed_minutes * regen_per_minute).min(max_tokens)
}

/// Per-credential client-side rate budget with continuous regeneration.
pub struct TokenBucket {
    store: Arc<dyn TokenStore>,
    max_tokens: f64,
    regen_per_minute: f64,
}

impl TokenBucket {
    pub fn new(store: Arc<dyn TokenStore>, max_tokens: f64, regen_per_minute: f64) -> Self {
        Self {
            store,
            max_tokens,
            regen_per_minute,
        }
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn get_tokens(&self, provider: &str, id: i64) -> StoreResult<f64> {
        self.store
            .get_tokens(provider, id, self.max_tokens, self.regen_per_minute)
    }

    pub fn has_tokens(&self, provider: &str, id: i64) -> StoreResult<bool> {
        Ok(self.get_tokens(provider, id)? >= 1.0)
    }

    /// Atomic per `(provider, id)`: recomputes the regenerated value, checks it against
    /// `amount`, and writes the post-consume balance in a single store operation.
    pub fn consume(&self, provider: &str, id: i64, amount: f64) -> StoreResult<ConsumeOutcome> {
        self.store
            .consume(provider, id, amount, self.max_tokens, self.regen_per_minute)
    }

    /// Atomic per `(provider, id)`: used when a request never consumed upstream capacity
    /// (failure, rate limit) to give the local budget back.
    pub fn refund(&self, provider: &str, id: i64, amount: f64) -> StoreResult<f64> {
        self.store.refund(provider, id, amount, self.max_tokens)
    }

    /// Milliseconds until the bucket has at least one token, given a current reading.
    pub fn time_until_next_token(&self, current_tokens: f64) -> u64 {
        if current_tokens >= 1.0 {
            return 0;
        }
        let minutes_needed = (1.0 - current_tokens) / self.regen_per_minute;
        (minutes_needed * 60_000.0).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryTokenStore;
    use std::sync::Barrier;
    use std::thread;

    fn bucket() -> TokenBucket {
        TokenBucket::new(Arc::new(InMemoryTokenStore::new()), 50.0, 6.0)
    }

    #[test]
    fn fresh_bucket_starts_full() {
        let b = bucket();
        assert_eq!(b.get_tokens("kiro", 1).unwrap(), 50.0);
    }

    #[test]
    fn consume_then_refund_round_trips() {
        let b = bucket();
        let before = b.get_tokens("kiro", 1).unwrap();
        let c = b.consume("kiro", 1, 1.0).unwrap();
        assert!(c.success);
        b.refund("kiro", 1, 1.0).unwrap();
        let after = b.get_tokens("kiro", 1).unwrap();
        assert!((after - before).abs() < 0.01);
    }

    #[test]
    fn consume_fails_and_leaves_store_unchanged_when_insufficient() {
        let b = TokenBucket::new(Arc::new(InMemoryTokenStore::new()), 1.0, 0.0);
        let first = b.consume("kiro", 1, 1.0).unwrap();
        assert!(first.success);
        assert_eq!(first.tokens, 0.0);
        let second = b.consume("kiro", 1, 1.0).unwrap();
        assert!(!second.success);
        assert_eq!(second.tokens, 0.0);
    }

    #[test]
    fn time_until_next_token_is_zero_when_available() {
        let b = bucket();
        assert_eq!(b.time_until_next_token(1.0), 0);
        assert_eq!(b.time_until_next_token(50.0), 0);
    }

    #[test]
    fn time_until_next_token_accounts_for_regen_rate() {
        let b = TokenBucket::new(Arc::new(InMemoryTokenStore::new()), 50.0, 6.0);
        // Need 0.5 more tokens at 6/min => 5 seconds.
        assert_eq!(b.time_until_next_token(0.5), 5_000);
    }

    #[test]
    fn concurrent_consume_never_oversells_the_last_token() {
        let store = Arc::new(InMemoryTokenStore::new());
        // Seed exactly one token.
        store.consume("kiro", 1, 49.0, 50.0, 0.0).unwrap();
        let bucket = Arc::new(TokenBucket::new(store, 50.0, 0.0));

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let bucket = bucket.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    bucket.consume("kiro", 1, 1.0).unwrap().success
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(bucket.get_tokens("kiro", 1).unwrap(), 0.0);
    }
}
