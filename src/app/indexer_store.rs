use thiserror::Error;

use crate::domain::{
    Digest, Distribution, File, IndexRecord, IndexReport, Manifest, Package, Repository, Scanner,
    Vulnerability,
};

/// Caller-supplied predicate deciding whether a stored index record is
/// affected by a vulnerability. The store never decides applicability
/// itself.
pub type VulnFn<'a> = &'a (dyn Fn(&IndexRecord, &Vulnerability) -> bool + Send + Sync);

#[derive(Error, Debug)]
pub enum IndexError {
    /// Caller input violated a precondition; no transaction was opened.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The vulnerability names a distribution or repository this store has
    /// never indexed. `affected_manifests` maps this to an empty result.
    #[error("vulnerability refers to a distribution or repository unknown to this store")]
    NotIndexed,

    #[error("{method}: {source}")]
    Store {
        method: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{method}: {message}")]
    Internal { method: &'static str, message: String },
}

/// Persistent record of what each versioned scanner saw in each layer of
/// each manifest, plus the coalesced index reports.
///
/// Implementations are safe for concurrent use. Every method observes
/// cancellation by future drop: an abandoned call aborts its in-flight
/// statement and rolls back any open transaction.
#[async_trait::async_trait]
pub trait IndexerStore: Send + Sync {
    /// Records the manifest, its layers and their order. Idempotent.
    async fn persist_manifest(&self, manifest: &Manifest) -> Result<(), IndexError>;

    /// Deletes the given manifests and any layers no other manifest
    /// references, returning the digests actually deleted. A manifest whose
    /// delete lock is contended is skipped, not an error.
    async fn delete_manifests(&self, digests: &[Digest]) -> Result<Vec<Digest>, IndexError>;

    /// Registers scanner identities. Idempotent.
    async fn register_scanners(&self, scanners: &[Scanner]) -> Result<(), IndexError>;

    /// Marks a layer as scanned by the given scanner. Once set, the flag
    /// holds until the layer is deleted.
    async fn set_layer_scanned(&self, layer: &Digest, scanner: &Scanner) -> Result<(), IndexError>;

    async fn layer_scanned(&self, layer: &Digest, scanner: &Scanner) -> Result<bool, IndexError>;

    /// True iff the manifest has been scanned by every scanner in the set.
    async fn manifest_scanned(
        &self,
        manifest: &Digest,
        scanners: &[Scanner],
    ) -> Result<bool, IndexError>;

    /// Records packages found in a layer by a scanner. A package carrying a
    /// source gets both the source and the binary row persisted, tied
    /// together on the artifact.
    async fn index_packages(
        &self,
        packages: &[Package],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError>;

    async fn index_distributions(
        &self,
        distributions: &[Distribution],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError>;

    async fn index_repositories(
        &self,
        repositories: &[Repository],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError>;

    async fn index_files(
        &self,
        files: &[File],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError>;

    /// Persists the coalesced record set of a finished index run. Records
    /// with a source package produce one row for the source and one for the
    /// binary so matching works against either.
    async fn index_manifest(&self, report: &IndexReport) -> Result<(), IndexError>;

    /// Packages some scanner in the set observed in the layer, with source
    /// back-pointers rebuilt.
    async fn packages_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Package>, IndexError>;

    async fn distributions_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Distribution>, IndexError>;

    async fn repositories_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Repository>, IndexError>;

    async fn files_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<File>, IndexError>;

    /// Upserts the report blob for its manifest.
    async fn set_index_report(&self, report: &IndexReport) -> Result<(), IndexError>;

    /// Upserts the report blob and records the manifest as scanned by every
    /// given scanner, in one transaction.
    async fn set_index_finished(
        &self,
        report: &IndexReport,
        scanners: &[Scanner],
    ) -> Result<(), IndexError>;

    async fn index_report(&self, manifest: &Digest) -> Result<Option<IndexReport>, IndexError>;

    /// Reverse lookup: manifests containing a package the predicate deems
    /// affected by `vulnerability`. A vulnerability whose distribution and
    /// repository are both unknown to this store yields an empty set, not
    /// an error. The result is a set; its order is unspecified.
    async fn affected_manifests(
        &self,
        vulnerability: &Vulnerability,
        vuln_fn: VulnFn<'_>,
    ) -> Result<Vec<Digest>, IndexError>;
}
