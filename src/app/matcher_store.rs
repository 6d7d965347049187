use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    EnrichmentRecord, IndexRecord, UpdateDiff, UpdateKind, UpdateOperation, Vulnerability,
};

#[derive(Error, Debug)]
pub enum MatchError {
    /// Caller input violated a precondition; no transaction was opened.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{method}: {source}")]
    Store {
        method: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{method}: {message}")]
    Internal { method: &'static str, message: String },
}

/// Which index-record fields constrain the vulnerability lookup in
/// [`MatcherStore::get`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MatchConstraint {
    PackageName,
    PackageSourceName,
    PackageModule,
    DistributionDid,
    DistributionName,
    DistributionVersion,
    DistributionVersionId,
    DistributionVersionCodeName,
    DistributionArch,
    DistributionCpe,
    DistributionPrettyName,
    RepositoryName,
}

#[derive(Clone, Debug, Default)]
pub struct GetOpts {
    pub matchers: Vec<MatchConstraint>,
    pub version_filtering: bool,
}

impl GetOpts {
    /// The effective constraint set: `PackageName` is always enforced, even
    /// when the caller omitted it, and duplicates collapse.
    pub fn normalized_matchers(&self) -> Vec<MatchConstraint> {
        let mut out = vec![MatchConstraint::PackageName];
        for m in &self.matchers {
            if !out.contains(m) {
                out.push(*m);
            }
        }
        out
    }
}

/// Versioned vulnerability corpus and enrichment side-channel, written by
/// updaters and read by the matcher.
///
/// Readers observe only published snapshots: every read joins through the
/// per-updater latest-operation view, which is refreshed strictly after the
/// writing transaction commits.
#[async_trait::async_trait]
pub trait MatcherStore: Send + Sync {
    /// Publishes a new vulnerability snapshot for `updater` and returns the
    /// operation ref. Vulnerabilities with an empty package name are
    /// skipped. Ingest is content-addressed: resubmitting identical content
    /// creates a new operation but no new vulnerability rows.
    async fn update_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &str,
        vulnerabilities: &[Vulnerability],
    ) -> Result<Uuid, MatchError>;

    /// Like [`update_vulnerabilities`](Self::update_vulnerabilities), but
    /// the new snapshot is the previous one minus `deleted_names` minus
    /// names replaced by `vulnerabilities`, plus `vulnerabilities`.
    async fn delta_update_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &str,
        vulnerabilities: &[Vulnerability],
        deleted_names: &[String],
    ) -> Result<Uuid, MatchError>;

    async fn update_enrichments(
        &self,
        updater: &str,
        fingerprint: &str,
        records: &[EnrichmentRecord],
    ) -> Result<Uuid, MatchError>;

    /// Streaming form of [`update_enrichments`](Self::update_enrichments)
    /// for updates too large to materialize. The producer is polled record
    /// by record; dropping the returned future between polls cancels the
    /// ingest and rolls back.
    async fn update_enrichments_iter<'a>(
        &self,
        updater: &str,
        fingerprint: &str,
        records: BoxStream<'a, EnrichmentRecord>,
    ) -> Result<Uuid, MatchError>;

    /// Vulnerabilities from the published snapshots matching each record,
    /// grouped by package id. `PackageName` is always part of the
    /// constraint set, whether or not the caller listed it.
    async fn get(
        &self,
        records: &[IndexRecord],
        opts: &GetOpts,
    ) -> Result<HashMap<i64, Vec<Vulnerability>>, MatchError>;

    /// Enrichment records from the published snapshot of `kind` matching
    /// any of the given tags.
    async fn get_enrichment(
        &self,
        kind: &str,
        tags: &[String],
    ) -> Result<Vec<EnrichmentRecord>, MatchError>;

    /// Update operations of `kind` per updater, most recent first. An empty
    /// `updaters` filter means all known updaters.
    async fn get_update_operations(
        &self,
        kind: UpdateKind,
        updaters: &[String],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>, MatchError>;

    async fn get_latest_update_ref(&self, kind: UpdateKind) -> Result<Option<Uuid>, MatchError>;

    async fn get_latest_update_refs(
        &self,
        kind: UpdateKind,
    ) -> Result<HashMap<String, Uuid>, MatchError>;

    /// The added/removed vulnerability sets between two operations of the
    /// same updater. `prev` may be `None` for an initial diff.
    async fn get_update_diff(
        &self,
        prev: Option<Uuid>,
        cur: Uuid,
    ) -> Result<UpdateDiff, MatchError>;

    /// Deletes operations by ref and returns how many were deleted.
    /// Vulnerability rows are left for [`gc`](Self::gc).
    async fn delete_update_operations(&self, refs: &[Uuid]) -> Result<i64, MatchError>;

    /// One garbage-collection round: deletes at most 50 update operations
    /// beyond the newest `keep` per updater, then sweeps vulnerabilities no
    /// surviving operation references. Returns the count still eligible;
    /// callers loop until it reaches zero.
    async fn gc(&self, keep: usize) -> Result<i64, MatchError>;

    /// True once the corpus is non-empty. Latches: after the first true,
    /// the check short-circuits for the life of the process.
    async fn initialized(&self) -> Result<bool, MatchError>;

    /// Records the outcome of an updater run; `error` selects the failure
    /// path.
    async fn record_updater_status(
        &self,
        updater: &str,
        update_time: DateTime<Utc>,
        fingerprint: &str,
        error: Option<&str>,
    ) -> Result<(), MatchError>;

    /// Marks every updater whose name is prefixed by `updater_set` as
    /// having succeeded at `update_time`.
    async fn record_updater_set_status(
        &self,
        updater_set: &str,
        update_time: DateTime<Utc>,
    ) -> Result<(), MatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_name_is_always_enforced() {
        let opts = GetOpts::default();
        assert_eq!(
            opts.normalized_matchers(),
            vec![MatchConstraint::PackageName]
        );
    }

    #[test]
    fn caller_constraints_keep_their_order_after_package_name() {
        let opts = GetOpts {
            matchers: vec![
                MatchConstraint::RepositoryName,
                MatchConstraint::PackageName,
                MatchConstraint::DistributionDid,
                MatchConstraint::RepositoryName,
            ],
            version_filtering: false,
        };
        assert_eq!(
            opts.normalized_matchers(),
            vec![
                MatchConstraint::PackageName,
                MatchConstraint::RepositoryName,
                MatchConstraint::DistributionDid,
            ]
        );
    }
}
