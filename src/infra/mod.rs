pub mod memory;
pub mod postgres;

pub use memory::{MemIndexerStore, MemMatcherStore};
pub use postgres::{ConnectConfig, ConnectError, PostgresIndexerStore, PostgresMatcherStore};
