use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::config::StrategyConfig;
use crate::credential::Credential;
use crate::error::StoreResult;
use crate::selection::health::HealthTracker;
use crate::selection::hybrid::HybridStrategy;
use crate::selection::now_unix_ms;
use crate::selection::quota::QuotaTracker;
use crate::selection::strategy::{SelectionContext, SelectionOutcome, SelectionStrategy};
use crate::selection::tokens::TokenBucket;

#[derive(Clone, Copy)]
struct Binding {
    credential_id: i64,
    bound_at_unix_ms: u64,
}

/// Wraps a Hybrid instance with session-sticky affinity (§4.5): a conversation keeps its
/// assigned credential as long as it stays healthy and funded, falling through to Hybrid
/// selection (and a fresh binding) the moment it doesn't.
pub struct StickyStrategy {
    provider: String,
    bindings: Arc<RwLock<HashMap<String, Binding>>>,
    hybrid: HybridStrategy,
    stop: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StickyStrategy {
    pub fn new(
        provider: impl Into<String>,
        health: Arc<HealthTracker>,
        tokens: Arc<TokenBucket>,
        quota: QuotaTracker,
        cfg: StrategyConfig,
    ) -> Self {
        let provider = provider.into();
        let session_ttl_ms = cfg.session_ttl_seconds.saturating_mul(1000);
        let bindings: Arc<RwLock<HashMap<String, Binding>>> = Arc::new(RwLock::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let sweeper = spawn_sweeper(bindings.clone(), session_ttl_ms, stop.clone());

        Self {
            hybrid: HybridStrategy::new(provider.clone(), health, tokens, quota, cfg),
            provider,
            bindings,
            stop,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    fn try_reuse_binding(
        &self,
        session_id: &str,
        credentials: &[Credential],
        exclude_ids: &[i64],
    ) -> StoreResult<Option<SelectionOutcome>> {
        let Some(binding) = self.bindings.read().get(session_id).copied() else {
            return Ok(None);
        };

        if exclude_ids.contains(&binding.credential_id) {
            self.bindings.write().remove(session_id);
            return Ok(None);
        }

        let bound_credential = credentials.iter().find(|c| c.id == binding.credential_id);
        let still_good = match bound_credential {
            Some(c) if c.is_usable() => {
                let healthy = self.hybrid.health().get_score(&self.provider, c.id)?
                    >= self.hybrid.min_health_threshold();
                let has_tokens = self.hybrid.tokens().has_tokens(&self.provider, c.id)?;
                healthy && has_tokens
            }
            _ => false,
        };

        if let (true, Some(credential)) = (still_good, bound_credential) {
            self.bindings.write().insert(
                session_id.to_string(),
                Binding {
                    credential_id: credential.id,
                    bound_at_unix_ms: now_unix_ms(),
                },
            );
            self.hybrid.tokens().consume(&self.provider, credential.id, 1.0)?;
            return Ok(Some(SelectionOutcome {
                credential: Some(credential.clone()),
                wait_ms: 0,
                fallback_level: None,
                sticky: Some(true),
                fallback: None,
                index: None,
            }));
        }

        self.bindings.write().remove(session_id);
        Ok(None)
    }
}

impl SelectionStrategy for StickyStrategy {
    fn select(
        &self,
        credentials: &[Credential],
        ctx: &SelectionContext,
    ) -> StoreResult<SelectionOutcome> {
        if let Some(session_id) = ctx.session_id.as_deref() {
            if let Some(reused) = self.try_reuse_binding(session_id, credentials, &ctx.exclude_ids)? {
                return Ok(reused);
            }
        }

        let mut outcome = self.hybrid.select(credentials, ctx)?;
        outcome.sticky = Some(false);
        if let (Some(session_id), Some(credential)) = (ctx.session_id.as_deref(), outcome.credential.as_ref()) {
            self.bindings.write().insert(
                session_id.to_string(),
                Binding {
                    credential_id: credential.id,
                    bound_at_unix_ms: now_unix_ms(),
                },
            );
        }
        Ok(outcome)
    }

    fn on_success(&self, credential_id: i64) {
        self.hybrid.on_success(credential_id);
    }

    fn on_failure(&self, credential_id: i64, error_kind: &str) {
        self.hybrid.on_failure(credential_id, error_kind);
        self.bindings.write().retain(|_, b| b.credential_id != credential_id);
    }

    fn on_rate_limit(&self, credential_id: i64, reset_ms: u64) {
        self.hybrid.on_rate_limit(credential_id, reset_ms);
    }

    fn destroy(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
        self.bindings.write().clear();
    }
}

impl Drop for StickyStrategy {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn spawn_sweeper(
    bindings: Arc<RwLock<HashMap<String, Binding>>>,
    ttl_ms: u64,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        for _ in 0..60 {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
        let now = now_unix_ms();
        bindings
            .write()
            .retain(|_, b| now.saturating_sub(b.bound_at_unix_ms) < ttl_ms);
    })
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

    fn strategy() -> StickyStrategy {
        StickyStrategy::new(
            "kiro",
            Arc::new(HealthTracker::new(Arc::new(InMemoryHealthStore::new()))),
            Arc::new(TokenBucket::new(Arc::new(InMemoryTokenStore::new()), 50.0, 6.0)),
            QuotaTracker::default(),
            StrategyConfig::default(),
        )
    }

    #[test]
    fn s4_same_session_reuses_the_same_credential() {
        let s = strategy();
        let pool = vec![cred(1), cred(2)];
        let ctx = SelectionContext::new("kiro").with_session("conv-1");

        let first = s.select(&pool, &ctx).unwrap();
        let chosen = first.credential.unwrap().id;
        assert_eq!(first.sticky, Some(false)); // first call has no binding yet, falls through to hybrid

        let second = s.select(&pool, &ctx).unwrap();
        assert_eq!(second.credential.unwrap().id, chosen);
        assert_eq!(second.sticky, Some(true));

        s.destroy();
    }

    #[test]
    fn failing_credential_evicts_its_bindings_and_rebinds() {
        let s = strategy();
        let pool = vec![cred(1), cred(2)];
        let ctx = SelectionContext::new("kiro").with_session("conv-1");

        let first = s.select(&pool, &ctx).unwrap();
        let bound_id = first.credential.unwrap().id;

        for _ in 0..5 {
            s.on_failure(bound_id, "boom");
        }

        let second = s.select(&pool, &ctx).unwrap();
        assert_ne!(second.credential.unwrap().id, bound_id);
        assert_eq!(second.sticky, Some(false));

        s.destroy();
    }

    #[test]
    fn no_session_id_falls_straight_through_to_hybrid() {
        let s = strategy();
        let pool = vec![cred(1)];
        let outcome = s.select(&pool, &SelectionContext::new("kiro")).unwrap();
        assert_eq!(outcome.sticky, Some(false));
        s.destroy();
    }

    #[test]
    fn excluded_bound_credential_is_not_reused() {
        let s = strategy();
        let pool = vec![cred(1), cred(2)];
        let ctx = SelectionContext::new("kiro").with_session("conv-1");

        let first = s.select(&pool, &ctx).unwrap();
        let bound_id = first.credential.unwrap().id;

        let excluding_ctx = SelectionContext::new("kiro")
            .with_session("conv-1")
            .with_exclude_ids(vec![bound_id]);
        let second = s.select(&pool, &excluding_ctx).unwrap();
        let second_id = second.credential.unwrap().id;
        assert_ne!(second_id, bound_id);
        assert_eq!(second.sticky, Some(false));

        // The eviction persists: a later call without exclusions rebinds to whatever
        // hybrid picks rather than snapping back to the excluded credential.
        let third = s.select(&pool, &ctx).unwrap();
        assert_eq!(third.credential.unwrap().id, second_id);

        s.destroy();
    }

    #[test]
    fn destroy_clears_bindings() {
        let s = strategy();
        let pool = vec![cred(1)];
        let ctx = SelectionContext::new("kiro").with_session("conv-1");
        s.select(&pool, &ctx).unwrap();
        assert!(!s.bindings.read().is_empty());

        s.destroy();
        assert!(s.bindings.read().is_empty());
    }
}
