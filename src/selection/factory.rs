use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::config::{ConfigStore, StrategyConfig, StrategyConfigOverride, StrategyKind};
use crate::error::StoreResult;
use crate::selection::health::{HealthStore, HealthTracker};
use crate::selection::hybrid::HybridStrategy;
use crate::selection::quota::QuotaTracker;
use crate::selection::round_robin::RoundRobinStrategy;
use crate::selection::sticky::StickyStrategy;
use crate::selection::strategy::SelectionStrategy;
use crate::selection::tokens::{TokenBucket, TokenStore};

/// Pure constructor (§4.7): given a provider and a caller-side override, assembles a fresh
/// strategy instance from `defaults <- dbConfig <- callerConfig`. Holds no per-provider
/// state itself -- that's [`StrategyManager`]'s job.
pub struct StrategyFactory {
    health_store: Arc<dyn HealthStore>,
    token_store: Arc<dyn TokenStore>,
    config_store: Arc<dyn ConfigStore>,
    defaults: StrategyConfig,
}

impl StrategyFactory {
    pub fn new(
        health_store: Arc<dyn HealthStore>,
        token_store: Arc<dyn TokenStore>,
        config_store: Arc<dyn ConfigStore>,
        defaults: StrategyConfig,
    ) -> Self {
        Self {
            health_store,
            token_store,
            config_store,
            defaults,
        }
    }

    pub fn build(
        &self,
        provider: &str,
        caller_config: Option<&StrategyConfigOverride>,
    ) -> StoreResult<Arc<dyn SelectionStrategy>> {
        let db_override = self.config_store.get_override(provider)?;
        let merged = StrategyConfig::merged(&self.defaults, db_override.as_ref(), caller_config);

        let health = Arc::new(HealthTracker::new(self.health_store.clone()));
        let tokens = Arc::new(TokenBucket::new(
            self.token_store.clone(),
            merged.token_bucket_max,
            merged.token_regen_per_minute,
        ));
        let quota = QuotaTracker {
            low_threshold: merged.quota_low_threshold,
            critical_threshold: merged.quota_critical_threshold,
        };

        let strategy: Arc<dyn SelectionStrategy> = match merged.strategy {
            StrategyKind::Hybrid => {
                Arc::new(HybridStrategy::new(provider, health, tokens, quota, merged))
            }
            StrategyKind::Sticky => {
                Arc::new(StickyStrategy::new(provider, health, tokens, quota, merged))
            }
            StrategyKind::RoundRobin => Arc::new(RoundRobinStrategy::new(
                provider,
                health,
                tokens,
                merged.min_health_threshold,
            )),
        };
        Ok(strategy)
    }
}

/// Process-wide `{provider -> strategy}` cache (§4.7). `invalidate`/`invalidate_all` let the
/// admin surface apply strategy or weight changes without a restart.
pub struct StrategyManager {
    factory: StrategyFactory,
    cache: RwLock<HashMap<String, Arc<dyn SelectionStrategy>>>,
}

impl StrategyManager {
    pub fn new(factory: StrategyFactory) -> Self {
        Self {
            factory,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Holds `cache`'s upgradable guard across the miss so two concurrent first-time
    /// callers for the same provider can't both build an instance -- important for
    /// `StickyStrategy`, whose constructor spawns a sweeper thread per instance.
    pub fn get_strategy(&self, provider: &str) -> StoreResult<Arc<dyn SelectionStrategy>> {
        let guard = self.cache.upgradable_read();
        if let Some(strategy) = guard.get(provider) {
            return Ok(strategy.clone());
        }
        let built = self.factory.build(provider, None)?;
        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        Ok(guard
            .entry(provider.to_string())
            .or_insert(built)
            .clone())
    }

    pub fn invalidate(&self, provider: &str) {
        if let Some(old) = self.cache.write().remove(provider) {
            old.destroy();
        }
    }

    pub fn invalidate_all(&self) {
        let drained: Vec<_> = self.cache.write().drain().collect();
        for (_, strategy) in drained {
            strategy.destroy();
        }
    }
}
