use serde::{Deserialize, Serialize};

/// A single authenticated account on a provider; the unit of selection.
///
/// The core only reads these fields -- mutating a credential's identity (deactivating it,
/// marking it invalid, refreshing its quota payload) is the storage layer's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default)]
    pub quota: QuotaPayload,
}

fn default_true() -> bool {
    true
}

impl Credential {
    pub fn is_usable(&self) -> bool {
        self.is_active && !self.is_invalid
    }
}

/// Per-model remaining-quota fraction reported by the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelQuota {
    pub remaining_fraction: f64,
}

/// Free-form quota payload a credential carries. Either a map from model-or-family key to
/// a remaining fraction, or a simple limit/used pair the fraction is derived from.
///
/// The map variant is stored as an insertion-ordered `Vec` rather than a `HashMap` so that
/// substring family-match iteration (§4.3, step 2) is reproducible: the credential's quota
/// map preserves whatever order the collaborator built it in, and ties break on the first
/// match in that order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum QuotaPayload {
    #[default]
    None,
    Map(Vec<(String, ModelQuota)>),
    LimitUsed {
        quota_limit: f64,
        quota_used: f64,
    },
}

impl QuotaPayload {
    pub fn map_get(&self, key: &str) -> Option<ModelQuota> {
        match self {
            QuotaPayload::Map(entries) => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v),
            _ => None,
        }
    }
}
