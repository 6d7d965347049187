mod affected;
mod artifacts;
mod delete;
mod manifests;
mod reports;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use prometheus::Registry;
use sqlx::PgPool;
use tokio::sync::OnceCell;

use crate::app::{IndexError, IndexerStore, VulnFn};
use crate::domain::{
    Digest, Distribution, File, IndexReport, Manifest, Package, Repository, Scanner, Vulnerability,
};

use super::connect::{ConnectConfig, ConnectError, PoolStats, open_pool};
use super::observe::{StoreMetrics, Subsystem, observed};

/// PostgreSQL-backed [`IndexerStore`].
///
/// Owns its connection pool; [`close`](Self::close) must be called before
/// the store is dropped. Methods are safe for concurrent use and each one
/// holds a pooled connection only for the duration of its transaction.
pub struct PostgresIndexerStore {
    pool: PgPool,
    metrics: Arc<StoreMetrics>,
    /// Guards the one-time insert of the zero-source placeholder package.
    sentinel: OnceCell<()>,
    closed: AtomicBool,
}

impl PostgresIndexerStore {
    /// Opens the store. With `run_migrations` set the embedded indexer
    /// migrations are applied first; in any case the schema revision is
    /// checked against the code's minimum.
    pub async fn connect(
        cfg: &ConnectConfig,
        registry: Option<&Registry>,
    ) -> Result<Self, ConnectError> {
        let pool = open_pool(cfg, Subsystem::Indexer).await?;
        let metrics = Arc::new(StoreMetrics::new());
        if let Some(registry) = registry {
            metrics.register(registry);
        }
        Ok(Self {
            pool,
            metrics,
            sentinel: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Closes the pool. Dropping the store without calling this logs an
    /// error: an unclosed pool can strand server-side connections.
    pub async fn close(self) {
        self.closed.store(true, Ordering::Relaxed);
        self.pool.close().await;
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn sentinel_cell(&self) -> &OnceCell<()> {
        &self.sentinel
    }
}

impl Drop for PostgresIndexerStore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Relaxed) && !std::thread::panicking() {
            tracing::error!("PostgresIndexerStore dropped without close()");
        }
    }
}

#[async_trait::async_trait]
impl IndexerStore for PostgresIndexerStore {
    async fn persist_manifest(&self, manifest: &Manifest) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "persist_manifest",
            self.persist_manifest_inner(manifest),
        )
        .await
        .map_err(|e| e.into_index_error("persist_manifest"))
    }

    async fn delete_manifests(&self, digests: &[Digest]) -> Result<Vec<Digest>, IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "delete_manifests",
            self.delete_manifests_inner(digests),
        )
        .await
        .map_err(|e| e.into_index_error("delete_manifests"))
    }

    async fn register_scanners(&self, scanners: &[Scanner]) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "register_scanners",
            self.register_scanners_inner(scanners),
        )
        .await
        .map_err(|e| e.into_index_error("register_scanners"))
    }

    async fn set_layer_scanned(&self, layer: &Digest, scanner: &Scanner) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "set_layer_scanned",
            self.set_layer_scanned_inner(layer, scanner),
        )
        .await
        .map_err(|e| e.into_index_error("set_layer_scanned"))
    }

    async fn layer_scanned(&self, layer: &Digest, scanner: &Scanner) -> Result<bool, IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "layer_scanned",
            self.layer_scanned_inner(layer, scanner),
        )
        .await
        .map_err(|e| e.into_index_error("layer_scanned"))
    }

    async fn manifest_scanned(
        &self,
        manifest: &Digest,
        scanners: &[Scanner],
    ) -> Result<bool, IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "manifest_scanned",
            self.manifest_scanned_inner(manifest, scanners),
        )
        .await
        .map_err(|e| e.into_index_error("manifest_scanned"))
    }

    async fn index_packages(
        &self,
        packages: &[Package],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "index_packages",
            self.index_packages_inner(packages, layer, scanner),
        )
        .await
        .map_err(|e| e.into_index_error("index_packages"))
    }

    async fn index_distributions(
        &self,
        distributions: &[Distribution],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "index_distributions",
            self.index_distributions_inner(distributions, layer, scanner),
        )
        .await
        .map_err(|e| e.into_index_error("index_distributions"))
    }

    async fn index_repositories(
        &self,
        repositories: &[Repository],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "index_repositories",
            self.index_repositories_inner(repositories, layer, scanner),
        )
        .await
        .map_err(|e| e.into_index_error("index_repositories"))
    }

    async fn index_files(
        &self,
        files: &[File],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "index_files",
            self.index_files_inner(files, layer, scanner),
        )
        .await
        .map_err(|e| e.into_index_error("index_files"))
    }

    async fn index_manifest(&self, report: &IndexReport) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "index_manifest",
            self.index_manifest_inner(report),
        )
        .await
        .map_err(|e| e.into_index_error("index_manifest"))
    }

    async fn packages_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Package>, IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "packages_by_layer",
            self.packages_by_layer_inner(layer, scanners),
        )
        .await
        .map_err(|e| e.into_index_error("packages_by_layer"))
    }

    async fn distributions_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Distribution>, IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "distributions_by_layer",
            self.distributions_by_layer_inner(layer, scanners),
        )
        .await
        .map_err(|e| e.into_index_error("distributions_by_layer"))
    }

    async fn repositories_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Repository>, IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "repositories_by_layer",
            self.repositories_by_layer_inner(layer, scanners),
        )
        .await
        .map_err(|e| e.into_index_error("repositories_by_layer"))
    }

    async fn files_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<File>, IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "files_by_layer",
            self.files_by_layer_inner(layer, scanners),
        )
        .await
        .map_err(|e| e.into_index_error("files_by_layer"))
    }

    async fn set_index_report(&self, report: &IndexReport) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "set_index_report",
            self.set_index_report_inner(report),
        )
        .await
        .map_err(|e| e.into_index_error("set_index_report"))
    }

    async fn set_index_finished(
        &self,
        report: &IndexReport,
        scanners: &[Scanner],
    ) -> Result<(), IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "set_index_finished",
            self.set_index_finished_inner(report, scanners),
        )
        .await
        .map_err(|e| e.into_index_error("set_index_finished"))
    }

    async fn index_report(&self, manifest: &Digest) -> Result<Option<IndexReport>, IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "index_report",
            self.index_report_inner(manifest),
        )
        .await
        .map_err(|e| e.into_index_error("index_report"))
    }

    async fn affected_manifests(
        &self,
        vulnerability: &Vulnerability,
        vuln_fn: VulnFn<'_>,
    ) -> Result<Vec<Digest>, IndexError> {
        observed(
            &self.metrics,
            Subsystem::Indexer,
            "affected_manifests",
            self.affected_manifests_inner(vulnerability, vuln_fn),
        )
        .await
        .map_err(|e| e.into_index_error("affected_manifests"))
    }
}
