//! Storage backends for the selection core's three contracts (health, tokens, config).
//!
//! The in-memory implementations back tests and a `--no-persist` demo mode; the `sled`
//! implementation is what the `gateway` binary runs with by default.

pub mod memory;
pub mod sled_store;

pub use memory::{InMemoryConfigStore, InMemoryHealthStore, InMemoryTokenStore};
pub use sled_store::SledStore;
