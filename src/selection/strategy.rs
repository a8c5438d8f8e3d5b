use crate::credential::Credential;
use crate::error::StoreResult;

/// Inputs the transport layer provides for one selection decision.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub provider: String,
    pub model: Option<String>,
    /// `sessionId`/`conversationId` are the same concept on the wire; callers resolve the
    /// alias before building this context.
    pub session_id: Option<String>,
    pub exclude_ids: Vec<i64>,
}

impl SelectionContext {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: None,
            session_id: None,
            exclude_ids: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_exclude_ids(mut self, ids: Vec<i64>) -> Self {
        self.exclude_ids = ids;
        self
    }
}

/// Result of one `select` call. `credential: None` means the pool was exhausted under
/// every fallback level -- it is a normal outcome, not an error (§7).
#[derive(Debug, Clone, Default)]
pub struct SelectionOutcome {
    pub credential: Option<Credential>,
    pub wait_ms: u64,
    pub fallback_level: Option<u8>,
    pub sticky: Option<bool>,
    pub fallback: Option<bool>,
    pub index: Option<usize>,
}

impl SelectionOutcome {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The abstract contract every strategy implements (§2 row 4). `select` is the only
/// fallible operation -- it is the only one that must read a live health/token/quota
/// snapshot from storage. The outcome callbacks log and swallow storage faults instead of
/// propagating them, matching §7's "cache-related faults must never propagate through the
/// selection path" -- an outcome report arrives after the upstream call already happened
/// and has nothing useful to roll back to.
pub trait SelectionStrategy: Send + Sync {
    fn select(
        &self,
        credentials: &[Credential],
        ctx: &SelectionContext,
    ) -> StoreResult<SelectionOutcome>;

    fn on_success(&self, credential_id: i64);
    fn on_failure(&self, credential_id: i64, error_kind: &str);
    fn on_rate_limit(&self, credential_id: i64, reset_ms: u64);

    fn is_usable(&self, credential: &Credential) -> bool {
        credential.is_usable()
    }

    /// Releases any background resources (Sticky's sweeper task). A no-op for strategies
    /// that hold none.
    fn destroy(&self) {}
}

/// Filters a pool down to usable, non-excluded credentials, relaxing the exclusion filter
/// once if that would otherwise empty the pool (§4.4 Admission).
pub fn admit_base<'a>(credentials: &'a [Credential], exclude_ids: &[i64]) -> Vec<&'a Credential> {
    let strict: Vec<&Credential> = credentials
        .iter()
        .filter(|c| c.is_usable() && !exclude_ids.contains(&c.id))
        .collect();
    if !strict.is_empty() {
        return strict;
    }
    credentials.iter().filter(|c| c.is_usable()).collect()
}
