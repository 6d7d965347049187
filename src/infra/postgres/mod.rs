mod codec;
mod connect;
mod indexer;
mod matcher;
mod migrations;
mod observe;
mod queries;

pub use connect::{ConnectConfig, ConnectError, PoolStats};
pub use indexer::PostgresIndexerStore;
pub use matcher::PostgresMatcherStore;
pub use observe::{StoreMetrics, Subsystem};
