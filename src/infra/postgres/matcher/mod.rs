mod gc;
mod lookup;
mod ops;
mod status;
mod update;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use prometheus::Registry;
use sqlx::PgPool;
use uuid::Uuid;

use crate::app::{GetOpts, MatchError, MatcherStore};
use crate::domain::{
    EnrichmentRecord, IndexRecord, UpdateDiff, UpdateKind, UpdateOperation, Vulnerability,
};

use super::connect::{ConnectConfig, ConnectError, PoolStats, open_pool};
use super::observe::{StoreMetrics, Subsystem, observed};

/// PostgreSQL-backed [`MatcherStore`].
///
/// Owns its connection pool; [`close`](Self::close) must be called before
/// the store is dropped. Readers join through the materialized
/// `latest_update_operations` view, so a half-finished update is never
/// visible.
pub struct PostgresMatcherStore {
    pool: PgPool,
    metrics: Arc<StoreMetrics>,
    /// One-shot latch for [`MatcherStore::initialized`]: once the corpus
    /// has been seen non-empty it stays that way for this process.
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl PostgresMatcherStore {
    pub async fn connect(
        cfg: &ConnectConfig,
        registry: Option<&Registry>,
    ) -> Result<Self, ConnectError> {
        let pool = open_pool(cfg, Subsystem::Matcher).await?;
        let metrics = Arc::new(StoreMetrics::new());
        if let Some(registry) = registry {
            metrics.register(registry);
        }
        Ok(Self {
            pool,
            metrics,
            initialized: AtomicBool::new(false),
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

    pub(crate) fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub(crate) fn initialized_latch(&self) -> &AtomicBool {
        &self.initialized
    }
}

impl Drop for PostgresMatcherStore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Relaxed) && !std::thread::panicking() {
            tracing::error!("PostgresMatcherStore dropped without close()");
        }
    }
}

#[async_trait::async_trait]
impl MatcherStore for PostgresMatcherStore {
    async fn update_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &str,
        vulnerabilities: &[Vulnerability],
    ) -> Result<Uuid, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "update_vulnerabilities",
            self.update_vulnerabilities_inner(updater, fingerprint, vulnerabilities, &[]),
        )
        .await
        .map_err(|e| e.into_match_error("update_vulnerabilities"))
    }

    async fn delta_update_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &str,
        vulnerabilities: &[Vulnerability],
        deleted_names: &[String],
    ) -> Result<Uuid, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "delta_update_vulnerabilities",
            self.delta_update_vulnerabilities_inner(
                updater,
                fingerprint,
                vulnerabilities,
                deleted_names,
            ),
        )
        .await
        .map_err(|e| e.into_match_error("delta_update_vulnerabilities"))
    }

    async fn update_enrichments(
        &self,
        updater: &str,
        fingerprint: &str,
        records: &[EnrichmentRecord],
    ) -> Result<Uuid, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "update_enrichments",
            self.update_enrichments_inner(
                updater,
                fingerprint,
                Box::pin(futures::stream::iter(records.to_vec())),
            ),
        )
        .await
        .map_err(|e| e.into_match_error("update_enrichments"))
    }

    async fn update_enrichments_iter<'a>(
        &self,
        updater: &str,
        fingerprint: &str,
        records: BoxStream<'a, EnrichmentRecord>,
    ) -> Result<Uuid, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "update_enrichments_iter",
            self.update_enrichments_inner(updater, fingerprint, records),
        )
        .await
        .map_err(|e| e.into_match_error("update_enrichments_iter"))
    }

    async fn get(
        &self,
        records: &[IndexRecord],
        opts: &GetOpts,
    ) -> Result<HashMap<i64, Vec<Vulnerability>>, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "get",
            self.get_inner(records, opts),
        )
        .await
        .map_err(|e| e.into_match_error("get"))
    }

    async fn get_enrichment(
        &self,
        kind: &str,
        tags: &[String],
    ) -> Result<Vec<EnrichmentRecord>, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "get_enrichment",
            self.get_enrichment_inner(kind, tags),
        )
        .await
        .map_err(|e| e.into_match_error("get_enrichment"))
    }

    async fn get_update_operations(
        &self,
        kind: UpdateKind,
        updaters: &[String],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "get_update_operations",
            self.get_update_operations_inner(kind, updaters),
        )
        .await
        .map_err(|e| e.into_match_error("get_update_operations"))
    }

    async fn get_latest_update_ref(&self, kind: UpdateKind) -> Result<Option<Uuid>, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "get_latest_update_ref",
            self.get_latest_update_ref_inner(kind),
        )
        .await
        .map_err(|e| e.into_match_error("get_latest_update_ref"))
    }

    async fn get_latest_update_refs(
        &self,
        kind: UpdateKind,
    ) -> Result<HashMap<String, Uuid>, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "get_latest_update_refs",
            self.get_latest_update_refs_inner(kind),
        )
        .await
        .map_err(|e| e.into_match_error("get_latest_update_refs"))
    }

    async fn get_update_diff(
        &self,
        prev: Option<Uuid>,
        cur: Uuid,
    ) -> Result<UpdateDiff, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "get_update_diff",
            self.get_update_diff_inner(prev, cur),
        )
        .await
        .map_err(|e| e.into_match_error("get_update_diff"))
    }

    async fn delete_update_operations(&self, refs: &[Uuid]) -> Result<i64, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "delete_update_operations",
            self.delete_update_operations_inner(refs),
        )
        .await
        .map_err(|e| e.into_match_error("delete_update_operations"))
    }

    async fn gc(&self, keep: usize) -> Result<i64, MatchError> {
        observed(&self.metrics, Subsystem::Matcher, "gc", self.gc_inner(keep))
            .await
            .map_err(|e| e.into_match_error("gc"))
    }

    async fn initialized(&self) -> Result<bool, MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "initialized",
            self.initialized_inner(),
        )
        .await
        .map_err(|e| e.into_match_error("initialized"))
    }

    async fn record_updater_status(
        &self,
        updater: &str,
        update_time: DateTime<Utc>,
        fingerprint: &str,
        error: Option<&str>,
    ) -> Result<(), MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "record_updater_status",
            self.record_updater_status_inner(updater, update_time, fingerprint, error),
        )
        .await
        .map_err(|e| e.into_match_error("record_updater_status"))
    }

    async fn record_updater_set_status(
        &self,
        updater_set: &str,
        update_time: DateTime<Utc>,
    ) -> Result<(), MatchError> {
        observed(
            &self.metrics,
            Subsystem::Matcher,
            "record_updater_set_status",
            self.record_updater_set_status_inner(updater_set, update_time),
        )
        .await
        .map_err(|e| e.into_match_error("record_updater_set_status"))
    }
}
