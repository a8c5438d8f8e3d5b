use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::{ConfigStore, StrategyConfigOverride};
use crate::error::StoreResult;
use crate::selection::health::{HealthRecord, HealthStore, MAX_SCORE};
use crate::selection::now_unix_ms;
use crate::selection::tokens::{regenerate, ConsumeOutcome, TokenRecord, TokenStore};

/// Process-local health store, used by tests and by the demo binary's `--no-persist` mode.
pub struct InMemoryHealthStore {
    records: Mutex<HashMap<(String, i64), HealthRecord>>,
}

impl InMemoryHealthStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Test-only seam: installs a record directly, bypassing the success/failure deltas.
    pub fn seed(&self, provider: &str, id: i64, record: HealthRecord) -> StoreResult<()> {
        self.records
            .lock()
            .insert((provider.to_string(), id), record);
        Ok(())
    }
}

impl Default for InMemoryHealthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthStore for InMemoryHealthStore {
    fn get(&self, provider: &str, id: i64) -> StoreResult<Option<HealthRecord>> {
        Ok(self.records.lock().get(&(provider.to_string(), id)).cloned())
    }

    fn get_by_provider(&self, provider: &str) -> StoreResult<Vec<(i64, HealthRecord)>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|((p, _), _)| p == provider)
            .map(|((_, id), r)| (*id, r.clone()))
            .collect())
    }

    fn record_success(&self, provider: &str, id: i64, bonus: f64) -> StoreResult<()> {
        let mut records = self.records.lock();
        let record = records.entry((provider.to_string(), id)).or_default();
        record.health_score = (record.health_score + bonus).min(MAX_SCORE);
        Ok(())
    }

    fn record_failure(
        &self,
        provider: &str,
        id: i64,
        error_message: &str,
        penalty: f64,
    ) -> StoreResult<()> {
        let mut records = self.records.lock();
        let record = records.entry((provider.to_string(), id)).or_default();
        record.health_score = (record.health_score - penalty).max(0.0);
        record.last_failure_at_unix_ms = Some(now_unix_ms());
        record.error_count += 1;
        record.last_error = error_message.to_string();
        Ok(())
    }

    fn record_rate_limit(&self, provider: &str, id: i64, penalty: f64) -> StoreResult<()> {
        let mut records = self.records.lock();
        let record = records.entry((provider.to_string(), id)).or_default();
        record.health_score = (record.health_score - penalty).max(0.0);
        record.last_failure_at_unix_ms = Some(now_unix_ms());
        Ok(())
    }
}

/// Process-local token store, mirrored by the `sled`-backed store for persistence.
pub struct InMemoryTokenStore {
    records: Mutex<HashMap<(String, i64), TokenRecord>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for InMemoryTokenStore {
    fn get_tokens(
        &self,
        provider: &str,
        id: i64,
        max_tokens: f64,
        regen_per_minute: f64,
    ) -> StoreResult<f64> {
        let now = now_unix_ms();
        let records = self.records.lock();
        let record = records
            .get(&(provider.to_string(), id))
            .copied()
            .unwrap_or_else(|| TokenRecord::full(max_tokens, now));
        Ok(regenerate(record, now, max_tokens, regen_per_minute))
    }

    fn get_by_provider(&self, provider: &str) -> StoreResult<Vec<(i64, TokenRecord)>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|((p, _), _)| p == provider)
            .map(|((_, id), r)| (*id, *r))
            .collect())
    }

    fn consume(
        &self,
        provider: &str,
        id: i64,
        amount: f64,
        max_tokens: f64,
        regen_per_minute: f64,
    ) -> StoreResult<ConsumeOutcome> {
        let now = now_unix_ms();
        let mut records = self.records.lock();
        let key = (provider.to_string(), id);
        let record = records
            .get(&key)
            .copied()
            .unwrap_or_else(|| TokenRecord::full(max_tokens, now));
        let effective = regenerate(record, now, max_tokens, regen_per_minute);

        let (success, resulting) = if effective >= amount {
            (true, effective - amount)
        } else {
            (false, effective)
        };
        records.insert(
            key,
            TokenRecord {
                tokens: resulting,
                last_updated_unix_ms: now,
            },
        );
        Ok(ConsumeOutcome {
            success,
            tokens: resulting,
        })
    }

    fn refund(&self, provider: &str, id: i64, amount: f64, max_tokens: f64) -> StoreResult<f64> {
        let now = now_unix_ms();
        let mut records = self.records.lock();
        let key = (provider.to_string(), id);
        let record = records
            .get(&key)
            .copied()
            .unwrap_or_else(|| TokenRecord::full(max_tokens, now));
        let new_tokens = (record.tokens + amount).min(max_tokens);
        records.insert(
            key,
            TokenRecord {
                tokens: new_tokens,
                last_updated_unix_ms: record.last_updated_unix_ms,
            },
        );
        Ok(new_tokens)
    }
}

/// Process-local config override store, used by tests and the demo binary's in-memory mode.
pub struct InMemoryConfigStore {
    overrides: Mutex<HashMap<String, StrategyConfigOverride>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self {
            overrides: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn get_override(&self, provider: &str) -> StoreResult<Option<StrategyConfigOverride>> {
        Ok(self.overrides.lock().get(provider).cloned())
    }

    fn set_override(&self, provider: &str, ov: &StrategyConfigOverride) -> StoreResult<()> {
        self.overrides
            .lock()
            .insert(provider.to_string(), ov.clone());
        Ok(())
    }
}
