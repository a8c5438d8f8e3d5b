pub mod config;
pub mod credential;
pub mod error;
pub mod selection;
pub mod server;
pub mod storage;

pub use config::{GatewayConfig, ProviderEntry, StrategyConfig, StrategyConfigOverride, StrategyKind};
pub use credential::{Credential, ModelQuota, QuotaPayload};
pub use error::{StoreError, StoreResult};
pub use selection::factory::{StrategyFactory, StrategyManager};
pub use selection::{SelectionContext, SelectionOutcome, SelectionStrategy};
