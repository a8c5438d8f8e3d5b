use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::credential::Credential;
use crate::error::StoreResult;
use crate::selection::health::HealthTracker;
use crate::selection::strategy::{SelectionContext, SelectionOutcome, SelectionStrategy};
use crate::selection::tokens::TokenBucket;

/// Deterministic ordered rotation (§4.6), gated by health and tokens, with a
/// no-consumption fallback when nothing in the pool passes admission.
pub struct RoundRobinStrategy {
    provider: String,
    health: Arc<HealthTracker>,
    tokens: Arc<TokenBucket>,
    min_health_threshold: f64,
    cursor: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new(
        provider: impl Into<String>,
        health: Arc<HealthTracker>,
        tokens: Arc<TokenBucket>,
        min_health_threshold: f64,
    ) -> Self {
        Self {
            provider: provider.into(),
            health,
            tokens,
            min_health_threshold,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn select(
        &self,
        credentials: &[Credential],
        ctx: &SelectionContext,
    ) -> StoreResult<SelectionOutcome> {
        let mut available: Vec<&Credential> = credentials
            .iter()
            .filter(|c| c.is_usable() && !ctx.exclude_ids.contains(&c.id))
            .collect();
        if available.is_empty() {
            return Ok(SelectionOutcome::empty());
        }
        available.sort_by_key(|c| c.id);

        let len = available.len();
        let start = self.cursor.load(Ordering::SeqCst) % len;

        for offset in 0..len {
            let index = (start + offset) % len;
            let candidate = available[index];
            let healthy = self.health.get_score(&self.provider, candidate.id)? >= self.min_health_threshold;
            let has_tokens = self.tokens.has_tokens(&self.provider, candidate.id)?;
            if healthy && has_tokens {
                self.cursor.store((index + 1) % len, Ordering::SeqCst);
                self.tokens.consume(&self.provider, candidate.id, 1.0)?;
                return Ok(SelectionOutcome {
                    credential: Some(candidate.clone()),
                    wait_ms: 0,
                    fallback_level: None,
                    sticky: None,
                    fallback: Some(false),
                    index: Some(index),
                });
            }
        }

        self.cursor.store((start + 1) % len, Ordering::SeqCst);
        Ok(SelectionOutcome {
            credential: Some(available[start].clone()),
            wait_ms: 0,
            fallback_level: None,
            sticky: None,
            fallback: Some(true),
            index: Some(start),
        })
    }

    fn on_success(&self, credential_id: i64) {
        if let Err(e) = self.health.record_success(&self.provider, credential_id) {
            log::warn!("provider={} credential={credential_id} on_success failed: {e}", self.provider);
        }
    }

    fn on_failure(&self, credential_id: i64, error_kind: &str) {
        if let Err(e) = self.health.record_failure(&self.provider, credential_id, error_kind) {
            log::warn!("provider={} credential={credential_id} on_failure failed: {e}", self.provider);
        }
        if let Err(e) = self.tokens.refund(&self.provider, credential_id, 1.0) {
            log::warn!("provider={} credential={credential_id} refund failed: {e}", self.provider);
        }
    }

    fn on_rate_limit(&self, credential_id: i64, reset_ms: u64) {
        if let Err(e) = self.health.record_rate_limit(&self.provider, credential_id) {
            log::warn!("provider={} credential={credential_id} on_rate_limit failed: {e}", self.provider);
        }
        if let Err(e) = self.tokens.refund(&self.provider, credential_id, 1.0) {
            log::warn!("provider={} credential={credential_id} refund failed: {e}", self.provider);
        }
        log::debug!(
            "provider={} credential={credential_id} rate limited, resets in {reset_ms}ms",
            self.provider
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::QuotaPayload;
    use crate::storage::memory::{InMemoryHealthStore, InMemoryTokenStore};

    fn cred(id: i64) -> Credential {
        Credential {
            id,
            is_active: true,
            is_invalid: false,
            quota: QuotaPayload::None,
        }
    }

    fn strategy() -> RoundRobinStrategy {
        RoundRobinStrategy::new(
            "kiro",
            Arc::new(HealthTracker::new(Arc::new(InMemoryHealthStore::new()))),
            Arc::new(TokenBucket::new(Arc::new(InMemoryTokenStore::new()), 50.0, 6.0)),
            50.0,
        )
    }

    #[test]
    fn s5_four_selections_rotate_one_two_three_one() {
        let s = strategy();
        let pool = vec![cred(1), cred(2), cred(3)];
        let ctx = SelectionContext::new("kiro");
        let ids: Vec<i64> = (0..4)
            .map(|_| s.select(&pool, &ctx).unwrap().credential.unwrap().id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 1]);
    }

    #[test]
    fn distribution_is_balanced_across_many_selections() {
        let s = strategy();
        let pool = vec![cred(1), cred(2), cred(3)];
        let ctx = SelectionContext::new("kiro");
        let mut counts = [0u32; 3];
        for _ in 0..9 {
            let id = s.select(&pool, &ctx).unwrap().credential.unwrap().id;
            counts[(id - 1) as usize] += 1;
        }
        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn unhealthy_credential_is_skipped_without_breaking_rotation() {
        let s = strategy();
        let pool = vec![cred(1), cred(2)];
        for _ in 0..5 {
            s.health.record_failure("kiro", 2, "boom").unwrap();
        }
        let ctx = SelectionContext::new("kiro");
        let first = s.select(&pool, &ctx).unwrap();
        assert_eq!(first.credential.unwrap().id, 1);
        // id 2 is unhealthy, so the cursor skips it and wraps back to 1.
        let second = s.select(&pool, &ctx).unwrap();
        assert_eq!(second.credential.unwrap().id, 1);
    }

    #[test]
    fn nothing_passes_admission_returns_fallback_true_without_consuming() {
        let s = strategy();
        let pool = vec![cred(1)];
        for _ in 0..5 {
            s.health.record_failure("kiro", 1, "boom").unwrap();
        }
        let outcome = s.select(&pool, &SelectionContext::new("kiro")).unwrap();
        assert_eq!(outcome.credential.unwrap().id, 1);
        assert_eq!(outcome.fallback, Some(true));
        assert_eq!(s.tokens.get_tokens("kiro", 1).unwrap(), 50.0);
    }
}
