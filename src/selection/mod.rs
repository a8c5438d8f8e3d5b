//! The credential-selection core: health scoring, token bucketing, quota awareness, and the
//! three pluggable strategies (hybrid, sticky, round-robin) built on top of them.

pub mod factory;
pub mod health;
pub mod hybrid;
pub mod quota;
pub mod round_robin;
pub mod sticky;
pub mod strategy;
pub mod tokens;

pub use strategy::{SelectionContext, SelectionOutcome, SelectionStrategy};

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}
