mod indexer_store;
mod matcher_store;

pub use indexer_store::{IndexError, IndexerStore, VulnFn};
pub use matcher_store::{GetOpts, MatchConstraint, MatchError, MatcherStore};
