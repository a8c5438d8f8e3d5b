use crate::credential::{Credential, QuotaPayload};

pub const DEFAULT_LOW_THRESHOLD: f64 = 0.10;
pub const DEFAULT_CRITICAL_THRESHOLD: f64 = 0.05;
const UNKNOWN_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    Healthy,
    Low,
    Critical,
    Unknown,
}

/// Resolves remaining-quota fractions into a categorical status and a ranking score,
/// per §4.3. Pure and stateless -- a credential's quota payload already carries everything
/// needed, so this tracker only holds the two configured thresholds.
#[derive(Debug, Clone, Copy)]
pub struct QuotaTracker {
    pub low_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self {
            low_threshold: DEFAULT_LOW_THRESHOLD,
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
        }
    }
}

impl QuotaTracker {
    /// Priority chain: exact model match, substring family match (insertion order),
    /// `default` key, derived limit/used fraction, else unknown.
    pub fn fraction_for(&self, credential: &Credential, model: Option<&str>) -> Option<f64> {
        match &credential.quota {
            QuotaPayload::Map(entries) => {
                if let Some(model) = model {
                    if let Some(q) = credential.quota.map_get(model) {
                        return Some(q.remaining_fraction);
                    }
                    for (key, value) in entries {
                        if key != "default" && model.contains(key.as_str()) {
                            return Some(value.remaining_fraction);
                        }
                    }
                }
                entries
                    .iter()
                    .find(|(k, _)| k == "default")
                    .map(|(_, v)| v.remaining_fraction)
            }
            QuotaPayload::LimitUsed {
                quota_limit,
                quota_used,
            } => {
                if *quota_limit > 0.0 {
                    Some(((quota_limit - quota_used) / quota_limit).clamp(0.0, 1.0))
                } else {
                    None
                }
            }
            QuotaPayload::None => None,
        }
    }

    pub fn status_for(&self, fraction: Option<f64>) -> QuotaStatus {
        match fraction {
            None => QuotaStatus::Unknown,
            Some(f) if f <= self.critical_threshold => QuotaStatus::Critical,
            Some(f) if f <= self.low_threshold => QuotaStatus::Low,
            _ => QuotaStatus::Healthy,
        }
    }

    pub fn score_for(&self, fraction: Option<f64>) -> f64 {
        match fraction {
            None => UNKNOWN_SCORE,
            Some(f) => (f * 100.0).round(),
        }
    }

    pub fn status(&self, credential: &Credential, model: Option<&str>) -> QuotaStatus {
        self.status_for(self.fraction_for(credential, model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::ModelQuota;

    fn cred_with_map(entries: Vec<(&str, f64)>) -> Credential {
        Credential {
            id: 1,
            is_active: true,
            is_invalid: false,
            quota: QuotaPayload::Map(
                entries
                    .into_iter()
                    .map(|(k, f)| (k.to_string(), ModelQuota { remaining_fraction: f }))
                    .collect(),
            ),
        }
    }

    #[test]
    fn exact_match_wins_over_family_and_default() {
        let tracker = QuotaTracker::default();
        let cred = cred_with_map(vec![
            ("claude-3-opus", 0.5),
            ("claude", 0.2),
            ("default", 0.9),
        ]);
        assert_eq!(
            tracker.fraction_for(&cred, Some("claude-3-opus")),
            Some(0.5)
        );
    }

    #[test]
    fn family_substring_match_in_insertion_order() {
        let tracker = QuotaTracker::default();
        let cred = cred_with_map(vec![("claude", 0.2), ("opus", 0.8)]);
        // "claude-3-opus-20240229" contains both "claude" and "opus"; first entry wins.
        assert_eq!(
            tracker.fraction_for(&cred, Some("claude-3-opus-20240229")),
            Some(0.2)
        );
    }

    #[test]
    fn falls_back_to_default_key() {
        let tracker = QuotaTracker::default();
        let cred = cred_with_map(vec![("default", 0.42)]);
        assert_eq!(tracker.fraction_for(&cred, Some("unrelated-model")), Some(0.42));
    }

    #[test]
    fn derives_fraction_from_limit_used_pair() {
        let tracker = QuotaTracker::default();
        let cred = Credential {
            id: 1,
            is_active: true,
            is_invalid: false,
            quota: QuotaPayload::LimitUsed {
                quota_limit: 1000.0,
                quota_used: 950.0,
            },
        };
        assert_eq!(tracker.fraction_for(&cred, None), Some(0.05));
        assert_eq!(tracker.status_for(Some(0.05)), QuotaStatus::Critical);
    }

    #[test]
    fn zero_limit_is_unknown_not_a_divide_by_zero() {
        let tracker = QuotaTracker::default();
        let cred = Credential {
            id: 1,
            is_active: true,
            is_invalid: false,
            quota: QuotaPayload::LimitUsed {
                quota_limit: 0.0,
                quota_used: 0.0,
            },
        };
        assert_eq!(tracker.fraction_for(&cred, None), None);
        assert_eq!(tracker.status_for(None), QuotaStatus::Unknown);
    }

    #[test]
    fn unknown_scores_fifty_and_counts_as_healthy() {
        let tracker = QuotaTracker::default();
        assert_eq!(tracker.status_for(None), QuotaStatus::Unknown);
        assert_eq!(tracker.score_for(None), 50.0);
    }

    #[test]
    fn status_boundaries_match_thresholds() {
        let tracker = QuotaTracker::default();
        assert_eq!(tracker.status_for(Some(0.05)), QuotaStatus::Critical);
        assert_eq!(tracker.status_for(Some(0.051)), QuotaStatus::Low);
        assert_eq!(tracker.status_for(Some(0.10)), QuotaStatus::Low);
        assert_eq!(tracker.status_for(Some(0.101)), QuotaStatus::Healthy);
    }
}
