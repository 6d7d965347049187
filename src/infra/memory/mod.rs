mod indexer;
mod matcher;

pub use indexer::MemIndexerStore;
pub use matcher::MemMatcherStore;
