use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::StrategyConfig;
use crate::credential::Credential;
use crate::error::StoreResult;
use crate::selection::health::HealthTracker;
use crate::selection::now_unix_ms;
use crate::selection::quota::{QuotaStatus, QuotaTracker};
use crate::selection::strategy::{admit_base, SelectionContext, SelectionOutcome, SelectionStrategy};
use crate::selection::tokens::TokenBucket;

/// lastResort is gating-free; every level below it consumes a token on selection.
const LAST_RESORT_LEVEL: u8 = 4;

struct Eval<'a> {
    credential: &'a Credential,
    health_score: f64,
    tokens: f64,
    has_tokens: bool,
    quota_status: QuotaStatus,
    quota_fraction: Option<f64>,
}

/// Weighted scoring across health, tokens, quota, and recency, inside a five-level
/// fallback cascade. The heart of the selection core (§4.4).
pub struct HybridStrategy {
    provider: String,
    health: Arc<HealthTracker>,
    tokens: Arc<TokenBucket>,
    quota: QuotaTracker,
    cfg: StrategyConfig,
    lru: RwLock<HashMap<i64, u64>>,
}

impl HybridStrategy {
    pub fn new(
        provider: impl Into<String>,
        health: Arc<HealthTracker>,
        tokens: Arc<TokenBucket>,
        quota: QuotaTracker,
        cfg: StrategyConfig,
    ) -> Self {
        Self {
            provider: provider.into(),
            health,
            tokens,
            quota,
            cfg,
            lru: RwLock::new(HashMap::new()),
        }
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn tokens(&self) -> &TokenBucket {
        &self.tokens
    }

    pub fn min_health_threshold(&self) -> f64 {
        self.cfg.min_health_threshold
    }

    fn evaluate<'a>(
        &self,
        admitted: &[&'a Credential],
        model: Option<&str>,
    ) -> StoreResult<Vec<Eval<'a>>> {
        admitted
            .iter()
            .map(|&credential| {
                let health_score = self.health.get_score(&self.provider, credential.id)?;
                let tokens = self.tokens.get_tokens(&self.provider, credential.id)?;
                let quota_fraction = self.quota.fraction_for(credential, model);
                let quota_status = self.quota.status_for(quota_fraction);
                Ok(Eval {
                    credential,
                    health_score,
                    tokens,
                    has_tokens: tokens >= 1.0,
                    quota_status,
                    quota_fraction,
                })
            })
            .collect()
    }

    fn cascade<'a, 'b>(&self, evals: &'b [Eval<'a>]) -> (u8, Vec<&'b Eval<'a>>) {
        let min_health = self.cfg.min_health_threshold;
        let levels: [&dyn Fn(&Eval) -> bool; 5] = [
            &|e: &Eval| {
                e.health_score >= min_health && e.has_tokens && e.quota_status == QuotaStatus::Healthy
            },
            &|e: &Eval| {
                e.health_score >= min_health
                    && e.has_tokens
                    && e.quota_status != QuotaStatus::Critical
            },
            &|e: &Eval| e.health_score >= min_health && e.has_tokens,
            &|e: &Eval| e.has_tokens,
            &|_: &Eval| true,
        ];
        for (level, predicate) in levels.iter().enumerate() {
            let admitted: Vec<&Eval> = evals.iter().filter(|e| predicate(e)).collect();
            if !admitted.is_empty() {
                return (level as u8, admitted);
            }
        }
        (LAST_RESORT_LEVEL, Vec::new())
    }

    fn score(&self, eval: &Eval, now_ms: u64) -> f64 {
        let tokens_pct = eval.tokens / self.tokens.max_tokens() * 100.0;
        let quota_score = self.quota.score_for(eval.quota_fraction);
        let last_used = self.lru.read().get(&eval.credential.id).copied();
        let lru_score = match last_used {
            None => 100.0,
            Some(t) => (now_ms.saturating_sub(t) as f64 / 60_000.0).min(100.0),
        };
        eval.health_score * self.cfg.health_weight
            + tokens_pct * self.cfg.token_weight
            + quota_score * self.cfg.quota_weight
            + lru_score * self.cfg.lru_weight
    }
}

impl SelectionStrategy for HybridStrategy {
    fn select(
        &self,
        credentials: &[Credential],
        ctx: &SelectionContext,
    ) -> StoreResult<SelectionOutcome> {
        let admitted_base = admit_base(credentials, &ctx.exclude_ids);
        if admitted_base.is_empty() {
            return Ok(SelectionOutcome::empty());
        }

        let evals = self.evaluate(&admitted_base, ctx.model.as_deref())?;
        let (level, candidates) = self.cascade(&evals);
        if candidates.is_empty() {
            return Ok(SelectionOutcome::empty());
        }

        let now = now_unix_ms();
        let mut best = candidates[0];
        let mut best_score = self.score(best, now);
        for candidate in &candidates[1..] {
            let s = self.score(candidate, now);
            if s > best_score {
                best = candidate;
                best_score = s;
            }
        }

        let chosen_id = best.credential.id;
        self.lru.write().insert(chosen_id, now);

        if level != LAST_RESORT_LEVEL {
            match self.tokens.consume(&self.provider, chosen_id, 1.0) {
                Ok(outcome) if !outcome.success => {
                    log::warn!(
                        "provider={} credential={chosen_id} lost a concurrent race for its last token",
                        self.provider
                    );
                }
                Err(e) => log::warn!(
                    "provider={} credential={chosen_id} token consume failed: {e}",
                    self.provider
                ),
                _ => {}
            }
        }

        Ok(SelectionOutcome {
            credential: Some(best.credential.clone()),
            wait_ms: 0,
            fallback_level: Some(level),
            sticky: None,
            fallback: None,
            index: None,
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
    use crate::selection::quota::QuotaTracker;
    use crate::storage::memory::{InMemoryHealthStore, InMemoryTokenStore};

    fn cred(id: i64) -> Credential {
        Credential {
            id,
            is_active: true,
            is_invalid: false,
            quota: QuotaPayload::None,
        }
    }

    fn strategy(provider: &str) -> HybridStrategy {
        HybridStrategy::new(
            provider,
            Arc::new(HealthTracker::new(Arc::new(InMemoryHealthStore::new()))),
            Arc::new(TokenBucket::new(Arc::new(InMemoryTokenStore::new()), 50.0, 6.0)),
            QuotaTracker::default(),
            StrategyConfig::default(),
        )
    }

    #[test]
    fn s1_healthy_pool_ties_break_on_pool_order_then_lru_alternates() {
        let s = strategy("kiro");
        let pool = vec![cred(1), cred(2)];
        let ctx = SelectionContext::new("kiro");

        let first = s.select(&pool, &ctx).unwrap();
        assert_eq!(first.credential.unwrap().id, 1);

        let second = s.select(&pool, &ctx).unwrap();
        assert_eq!(second.credential.unwrap().id, 2);

        let third = s.select(&pool, &ctx).unwrap();
        assert_eq!(third.credential.unwrap().id, 1);
    }

    #[test]
    fn s2_one_unhealthy_credential_is_skipped_at_level_zero() {
        let s = strategy("kiro");
        let pool = vec![cred(1), cred(2)];
        for _ in 0..5 {
            s.health.record_failure("kiro", 1, "boom").unwrap();
        }
        let outcome = s.select(&pool, &SelectionContext::new("kiro")).unwrap();
        assert_eq!(outcome.credential.unwrap().id, 2);
        assert_eq!(outcome.fallback_level, Some(0));
    }

    #[test]
    fn s3_rate_limit_refunds_the_token_consistent_with_round_trip_invariant() {
        // §8 Invariant 8 (round-trip) takes precedence over the narrative in §8's S3, which
        // would otherwise contradict §4.4's documented onRateLimit -> refund behavior. See
        // DESIGN.md for the resolution.
        let s = strategy("kiro");
        let pool = vec![cred(1)];
        let ctx = SelectionContext::new("kiro");

        let first = s.select(&pool, &ctx).unwrap();
        let id = first.credential.unwrap().id;
        assert_eq!(s.tokens.get_tokens("kiro", id).unwrap(), 49.0);

        s.on_rate_limit(id, 1_000);
        assert_eq!(s.tokens.get_tokens("kiro", id).unwrap(), 50.0);

        // With the token and health restored, the very next select still finds it usable.
        let second = s.select(&pool, &ctx).unwrap();
        assert_eq!(second.credential.unwrap().id, id);
        assert!(second.fallback_level.unwrap() < LAST_RESORT_LEVEL);
    }

    #[test]
    fn s6_critical_quota_is_admitted_only_at_level_two() {
        let s = strategy("kiro");
        let pool = vec![Credential {
            id: 1,
            is_active: true,
            is_invalid: false,
            quota: QuotaPayload::Map(vec![(
                "default".to_string(),
                crate::credential::ModelQuota {
                    remaining_fraction: 0.03,
                },
            )]),
        }];
        let outcome = s.select(&pool, &SelectionContext::new("kiro")).unwrap();
        assert_eq!(outcome.credential.unwrap().id, 1);
        assert_eq!(outcome.fallback_level, Some(2));
    }

    #[test]
    fn empty_pool_returns_none_without_gating() {
        let s = strategy("kiro");
        let outcome = s.select(&[], &SelectionContext::new("kiro")).unwrap();
        assert!(outcome.credential.is_none());
        assert_eq!(outcome.wait_ms, 0);
    }

    #[test]
    fn exclude_ids_are_honored_unless_pool_would_empty() {
        let s = strategy("kiro");
        let pool = vec![cred(1), cred(2)];
        let ctx = SelectionContext::new("kiro").with_exclude_ids(vec![1]);
        let outcome = s.select(&pool, &ctx).unwrap();
        assert_eq!(outcome.credential.unwrap().id, 2);

        // Excluding everything relaxes the filter once rather than returning nothing.
        let ctx_all = SelectionContext::new("kiro").with_exclude_ids(vec![1, 2]);
        let outcome_all = s.select(&pool, &ctx_all).unwrap();
        assert!(outcome_all.credential.is_some());
    }

    #[test]
    fn no_tokens_anywhere_falls_all_the_way_to_last_resort_without_consuming() {
        let s = strategy("kiro");
        let pool = vec![cred(1)];
        s.tokens.consume("kiro", 1, 50.0).unwrap();
        assert!(!s.tokens.has_tokens("kiro", 1).unwrap());

        let outcome = s.select(&pool, &SelectionContext::new("kiro")).unwrap();
        assert_eq!(outcome.fallback_level, Some(LAST_RESORT_LEVEL));
        assert_eq!(outcome.credential.unwrap().id, 1);
        // lastResort never consumes.
        assert_eq!(s.tokens.get_tokens("kiro", 1).unwrap(), 0.0);
    }
}
