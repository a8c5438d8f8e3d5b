use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// Persists per-provider config override layers (§6's `dbConfig`). A `sled`-backed and an
/// in-memory implementation live in [`crate::storage`].
pub trait ConfigStore: Send + Sync {
    fn get_override(&self, provider: &str) -> StoreResult<Option<StrategyConfigOverride>>;
    fn set_override(&self, provider: &str, ov: &StrategyConfigOverride) -> StoreResult<()>;
}

/// Which concrete strategy a provider is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Hybrid,
    Sticky,
    RoundRobin,
}

impl Default for StrategyKind {
    fn default() -> Self {
        StrategyKind::Hybrid
    }
}

impl StrategyKind {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Some(Self::Hybrid),
            "sticky" => Some(Self::Sticky),
            "round-robin" | "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

/// Hybrid scoring weights, bucket/health thresholds, and sticky TTL -- every knob in
/// §6's configuration surface. Partial overrides (`None` fields) let the factory's
/// `defaults <- dbConfig <- callerConfig` merge skip anything a layer didn't set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy: StrategyKind,
    pub health_weight: f64,
    pub token_weight: f64,
    pub quota_weight: f64,
    pub lru_weight: f64,
    pub min_health_threshold: f64,
    pub token_bucket_max: f64,
    pub token_regen_per_minute: f64,
    pub quota_low_threshold: f64,
    pub quota_critical_threshold: f64,
    pub session_ttl_seconds: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Hybrid,
            health_weight: 2.0,
            token_weight: 5.0,
            quota_weight: 3.0,
            lru_weight: 0.1,
            min_health_threshold: 50.0,
            token_bucket_max: 50.0,
            token_regen_per_minute: 6.0,
            quota_low_threshold: 0.10,
            quota_critical_threshold: 0.05,
            session_ttl_seconds: 30 * 60,
        }
    }
}

/// A partial override layer -- what a persisted config row or a call-site override is
/// allowed to set. Unset fields fall through to whatever the previous layer had.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyConfigOverride {
    pub strategy: Option<String>,
    pub health_weight: Option<f64>,
    pub token_weight: Option<f64>,
    pub quota_weight: Option<f64>,
    pub lru_weight: Option<f64>,
    pub min_health_threshold: Option<f64>,
    pub token_bucket_max: Option<f64>,
    pub token_regen_per_minute: Option<f64>,
    pub quota_low_threshold: Option<f64>,
    pub quota_critical_threshold: Option<f64>,
    pub session_ttl_seconds: Option<u64>,
}

impl StrategyConfig {
    /// Applies `defaults <- dbConfig <- callerConfig`: later layers win field-by-field.
    /// An unknown `strategy` string is a warn-and-fall-back-to-hybrid, never a hard error.
    pub fn merged(
        defaults: &StrategyConfig,
        db_config: Option<&StrategyConfigOverride>,
        caller_config: Option<&StrategyConfigOverride>,
    ) -> StrategyConfig {
        let mut cfg = defaults.clone();
        for layer in [db_config, caller_config].into_iter().flatten() {
            apply_override(&mut cfg, layer);
        }
        cfg
    }
}

fn apply_override(cfg: &mut StrategyConfig, ov: &StrategyConfigOverride) {
    if let Some(s) = ov.strategy.as_deref() {
        match StrategyKind::from_wire(s) {
            Some(kind) => cfg.strategy = kind,
            None => {
                log::warn!("unknown strategy {s:?} in config override, keeping hybrid fallback");
                cfg.strategy = StrategyKind::Hybrid;
            }
        }
    }
    if let Some(v) = ov.health_weight {
        cfg.health_weight = v;
    }
    if let Some(v) = ov.token_weight {
        cfg.token_weight = v;
    }
    if let Some(v) = ov.quota_weight {
        cfg.quota_weight = v;
    }
    if let Some(v) = ov.lru_weight {
        cfg.lru_weight = v;
    }
    if let Some(v) = ov.min_health_threshold {
        cfg.min_health_threshold = v;
    }
    if let Some(v) = ov.token_bucket_max {
        cfg.token_bucket_max = v;
    }
    if let Some(v) = ov.token_regen_per_minute {
        cfg.token_regen_per_minute = v;
    }
    if let Some(v) = ov.quota_low_threshold {
        cfg.quota_low_threshold = v;
    }
    if let Some(v) = ov.quota_critical_threshold {
        cfg.quota_critical_threshold = v;
    }
    if let Some(v) = ov.session_ttl_seconds {
        cfg.session_ttl_seconds = v;
    }
}

/// One upstream provider's connection details -- the ambient, out-of-core collaborator
/// config the demo transport needs to actually dial out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// The credential pool this provider's strategy selects over. Sourcing these from a
    /// real database is out of scope; the demo binary reads them straight out of config.
    #[serde(default)]
    pub credentials: Vec<crate::credential::Credential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub listen: ListenConfig,
    pub providers: std::collections::BTreeMap<String, ProviderEntry>,
    #[serde(default)]
    pub default_strategy: StrategyConfig,
}

impl GatewayConfig {
    pub fn default_config() -> Self {
        let mut providers = std::collections::BTreeMap::new();
        providers.insert(
            "anthropic".to_string(),
            ProviderEntry {
                display_name: "Anthropic".to_string(),
                base_url: "https://api.anthropic.com".to_string(),
                disabled: false,
                api_key: None,
                credentials: Vec::new(),
            },
        );
        providers.insert(
            "kiro".to_string(),
            ProviderEntry {
                display_name: "Kiro / CodeWhisperer".to_string(),
                base_url: String::new(),
                disabled: false,
                api_key: None,
                credentials: Vec::new(),
            },
        );
        providers.insert(
            "gemini".to_string(),
            ProviderEntry {
                display_name: "Gemini".to_string(),
                base_url: String::new(),
                disabled: false,
                api_key: None,
                credentials: Vec::new(),
            },
        );

        Self {
            listen: ListenConfig {
                host: "127.0.0.1".to_string(),
                port: 4000,
            },
            providers,
            default_strategy: StrategyConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_precedence_is_defaults_then_db_then_caller() {
        let defaults = StrategyConfig::default();
        let db = StrategyConfigOverride {
            health_weight: Some(9.0),
            strategy: Some("sticky".to_string()),
            ..Default::default()
        };
        let caller = StrategyConfigOverride {
            health_weight: Some(1.0),
            ..Default::default()
        };

        let merged = StrategyConfig::merged(&defaults, Some(&db), Some(&caller));
        assert_eq!(merged.strategy, StrategyKind::Sticky);
        assert_eq!(merged.health_weight, 1.0);
        assert_eq!(merged.token_weight, defaults.token_weight);
    }

    #[test]
    fn unknown_strategy_falls_back_to_hybrid() {
        let defaults = StrategyConfig {
            strategy: StrategyKind::Sticky,
            ..StrategyConfig::default()
        };
        let caller = StrategyConfigOverride {
            strategy: Some("quantum".to_string()),
            ..Default::default()
        };
        let merged = StrategyConfig::merged(&defaults, None, Some(&caller));
        assert_eq!(merged.strategy, StrategyKind::Hybrid);
    }
}
