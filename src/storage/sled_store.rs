use std::path::Path;

use parking_lot::Mutex;

use crate::config::{ConfigStore, StrategyConfigOverride};
use crate::error::StoreResult;
use crate::selection::health::{HealthRecord, HealthStore, MAX_SCORE};
use crate::selection::now_unix_ms;
use crate::selection::tokens::{regenerate, ConsumeOutcome, TokenRecord, TokenStore};

/// Persisted backend for the health, token, and config-override stores, one `sled` tree
/// each. `sled::Tree` operations are individually atomic but the health/token contracts
/// need atomic read-modify-write across a handful of fields, so compound updates take
/// `write_lock` rather than leaning on `compare_and_swap` retry loops.
pub struct SledStore {
    health: sled::Tree,
    tokens: sled::Tree,
    config: sled::Tree,
    write_lock: Mutex<()>,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            health: db.open_tree("health")?,
            tokens: db.open_tree("tokens")?,
            config: db.open_tree("config")?,
            write_lock: Mutex::new(()),
        })
    }

    fn key(provider: &str, id: i64) -> Vec<u8> {
        format!("{provider}:{id}").into_bytes()
    }

    fn read_health(&self, key: &[u8]) -> StoreResult<Option<HealthRecord>> {
        match self.health.get(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    fn write_health(&self, key: &[u8], record: &HealthRecord) -> StoreResult<()> {
        self.health.insert(key, serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn read_tokens(&self, key: &[u8]) -> StoreResult<Option<TokenRecord>> {
        match self.tokens.get(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    fn write_tokens(&self, key: &[u8], record: &TokenRecord) -> StoreResult<()> {
        self.tokens.insert(key, serde_json::to_vec(record)?)?;
        Ok(())
    }
}

impl HealthStore for SledStore {
    fn get(&self, provider: &str, id: i64) -> StoreResult<Option<HealthRecord>> {
        self.read_health(&Self::key(provider, id))
    }

    fn get_by_provider(&self, provider: &str) -> StoreResult<Vec<(i64, HealthRecord)>> {
        let prefix = format!("{provider}:");
        let mut out = Vec::new();
        for item in self.health.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key);
            if let Some(id_str) = key_str.strip_prefix(&prefix) {
                if let Ok(id) = id_str.parse::<i64>() {
                    out.push((id, serde_json::from_slice(&value)?));
                }
            }
        }
        Ok(out)
    }

    fn record_success(&self, provider: &str, id: i64, bonus: f64) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let key = Self::key(provider, id);
        let mut record = self.read_health(&key)?.unwrap_or_default();
        record.health_score = (record.health_score + bonus).min(MAX_SCORE);
        self.write_health(&key, &record)
    }

    fn record_failure(
        &self,
        provider: &str,
        id: i64,
        error_message: &str,
        penalty: f64,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let key = Self::key(provider, id);
        let mut record = self.read_health(&key)?.unwrap_or_default();
        record.health_score = (record.health_score - penalty).max(0.0);
        record.last_failure_at_unix_ms = Some(now_unix_ms());
        record.error_count += 1;
        record.last_error = error_message.to_string();
        self.write_health(&key, &record)
    }

    fn record_rate_limit(&self, provider: &str, id: i64, penalty: f64) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let key = Self::key(provider, id);
        let mut record = self.read_health(&key)?.unwrap_or_default();
        record.health_score = (record.health_score - penalty).max(0.0);
        record.last_failure_at_unix_ms = Some(now_unix_ms());
        self.write_health(&key, &record)
    }
}

impl TokenStore for SledStore {
    fn get_tokens(
        &self,
        provider: &str,
        id: i64,
        max_tokens: f64,
        regen_per_minute: f64,
    ) -> StoreResult<f64> {
        let now = now_unix_ms();
        let key = Self::key(provider, id);
        let record = self
            .read_tokens(&key)?
            .unwrap_or_else(|| TokenRecord::full(max_tokens, now));
        Ok(regenerate(record, now, max_tokens, regen_per_minute))
    }

    fn get_by_provider(&self, provider: &str) -> StoreResult<Vec<(i64, TokenRecord)>> {
        let prefix = format!("{provider}:");
        let mut out = Vec::new();
        for item in self.tokens.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key);
            if let Some(id_str) = key_str.strip_prefix(&prefix) {
                if let Ok(id) = id_str.parse::<i64>() {
                    out.push((id, serde_json::from_slice(&value)?));
                }
            }
        }
        Ok(out)
    }

    fn consume(
        &self,
        provider: &str,
        id: i64,
        amount: f64,
        max_tokens: f64,
        regen_per_minute: f64,
    ) -> StoreResult<ConsumeOutcome> {
        let _guard = self.write_lock.lock();
        let now = now_unix_ms();
        let key = Self::key(provider, id);
        let record = self
            .read_tokens(&key)?
            .unwrap_or_else(|| TokenRecord::full(max_tokens, now));
        let effective = regenerate(record, now, max_tokens, regen_per_minute);

        let (success, resulting) = if effective >= amount {
            (true, effective - amount)
        } else {
            (false, effective)
        };
        self.write_tokens(
            &key,
            &TokenRecord {
                tokens: resulting,
                last_updated_unix_ms: now,
            },
        )?;
        Ok(ConsumeOutcome {
            success,
            tokens: resulting,
        })
    }

    fn refund(&self, provider: &str, id: i64, amount: f64, max_tokens: f64) -> StoreResult<f64> {
        let _guard = self.write_lock.lock();
        let now = now_unix_ms();
        let key = Self::key(provider, id);
        let record = self
            .read_tokens(&key)?
            .unwrap_or_else(|| TokenRecord::full(max_tokens, now));
        let new_tokens = (record.tokens + amount).min(max_tokens);
        self.write_tokens(
            &key,
            &TokenRecord {
                tokens: new_tokens,
                last_updated_unix_ms: record.last_updated_unix_ms,
            },
        )?;
        Ok(new_tokens)
    }
}

impl ConfigStore for SledStore {
    fn get_override(&self, provider: &str) -> StoreResult<Option<StrategyConfigOverride>> {
        match self.config.get(provider.as_bytes())? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    fn set_override(&self, provider: &str, ov: &StrategyConfigOverride) -> StoreResult<()> {
        self.config
            .insert(provider.as_bytes(), serde_json::to_vec(ov)?)?;
        Ok(())
    }
}
