use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::domain::digest::Digest;
use crate::domain::distribution::Distribution;
use crate::domain::file::File;
use crate::domain::package::Package;
use crate::domain::repository::Repository;

/// The coalesced snapshot of everything found in a manifest, stored as an
/// opaque JSON blob in the report cache. Entity maps are keyed by the
/// store-assigned ids so environments can cross-reference them.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct IndexReport {
    pub manifest_hash: Option<Digest>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub packages: HashMap<i64, Package>,
    #[serde(default)]
    pub distributions: HashMap<i64, Distribution>,
    #[serde(default)]
    pub repositories: HashMap<i64, Repository>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub environments: HashMap<i64, Vec<Environment>>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub err: String,
}

/// Terminal state of a finished index run.
pub const INDEX_FINISHED: &str = "IndexFinished";

impl IndexReport {
    pub fn finished(manifest_hash: Digest) -> Self {
        Self {
            manifest_hash: Some(manifest_hash),
            state: INDEX_FINISHED.to_string(),
            success: true,
            ..Default::default()
        }
    }

    /// Flattens the report graph into match-time records: one per
    /// `(package, environment, repository)` combination, deduplicated.
    /// Environments referencing unknown distributions or repositories
    /// contribute `None` for that side.
    pub fn index_records(&self) -> Vec<IndexRecord> {
        let no_envs = Vec::new();
        self.packages
            .iter()
            .sorted_by_key(|(id, _)| **id)
            .flat_map(|(id, pkg)| {
                let envs = self.environments.get(id).unwrap_or(&no_envs);
                if envs.is_empty() {
                    vec![IndexRecord {
                        package: Some(pkg.clone()),
                        distribution: None,
                        repository: None,
                    }]
                } else {
                    envs.iter()
                        .flat_map(|env| self.records_for(pkg, env))
                        .collect()
                }
            })
            .unique()
            .collect()
    }

    fn records_for(&self, pkg: &Package, env: &Environment) -> Vec<IndexRecord> {
        let dist = env
            .distribution_id
            .and_then(|id| self.distributions.get(&id))
            .cloned();
        if env.repository_ids.is_empty() {
            return vec![IndexRecord {
                package: Some(pkg.clone()),
                distribution: dist,
                repository: None,
            }];
        }
        env.repository_ids
            .iter()
            .map(|id| IndexRecord {
                package: Some(pkg.clone()),
                distribution: dist.clone(),
                repository: self.repositories.get(id).cloned(),
            })
            .collect()
    }
}

/// Where a package was found: the database file it came from, the layer that
/// introduced it and the distribution/repository context, by id.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub package_db: String,
    pub introduced_in: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_id: Option<i64>,
    #[serde(default)]
    pub repository_ids: Vec<i64>,
}

/// A `(package, distribution?, repository?)` tuple, used both at match time
/// and during the affected-manifest reverse lookup.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct IndexRecord {
    pub package: Option<Package>,
    pub distribution: Option<Distribution>,
    pub repository: Option<Repository>,
}
