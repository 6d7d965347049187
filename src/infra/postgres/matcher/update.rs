use std::collections::HashSet;

use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::PgTransaction;
use tracing::Instrument;
use uuid::Uuid;

use crate::domain::{EnrichmentRecord, Vulnerability};

use super::PostgresMatcherStore;
use super::super::codec;
use super::super::observe::{MethodError, Subsystem};
use super::super::queries;

/// Ingest proceeds in batches of this many rows; a batch boundary is also
/// where progress is logged and where a dropped future is guaranteed to
/// have done nothing partial beyond its open transaction.
pub(super) const BATCH_SIZE: usize = 2_000;

pub(super) const HASH_KIND: &str = "md5";

const REFRESH_VIEW: &str = "REFRESH MATERIALIZED VIEW CONCURRENTLY latest_update_operations;";

impl PostgresMatcherStore {
    /// Publishes the new snapshot view. Best-effort: a failed refresh is
    /// logged and swallowed, the next successful refresh picks the change
    /// up.
    pub(super) async fn refresh_latest(&self) {
        if let Err(error) = sqlx::query(REFRESH_VIEW).execute(self.pool()).await {
            tracing::warn!(%error, "failed to refresh latest_update_operations");
        }
    }

    async fn create_operation(
        &self,
        tx: &mut PgTransaction<'_>,
        template: &str,
        updater: &str,
        fingerprint: &str,
    ) -> Result<(i64, Uuid), MethodError> {
        let reference = Uuid::new_v4();
        let q = queries::matcher(template);
        let (id,): (i64,) = sqlx::query_as(q.sql)
            .bind(reference)
            .bind(updater)
            .bind(fingerprint)
            .fetch_one(&mut **tx)
            .instrument(q.span())
            .await?;
        Ok((id, reference))
    }

    async fn insert_vulnerability(
        &self,
        tx: &mut PgTransaction<'_>,
        operation_id: i64,
        vulnerability: &Vulnerability,
    ) -> Result<(), MethodError> {
        let hash = vulnerability.content_digest().to_vec();
        let Some(package) = vulnerability.package.as_ref() else {
            return Ok(());
        };
        let dist = vulnerability.dist.clone().unwrap_or_default();
        let repo = vulnerability.repo.clone().unwrap_or_default();
        let (lower_kind, lower) = match &vulnerability.range {
            Some(range) => {
                let lower_version = Some(range.lower.clone());
                let (kind, components) = codec::version_to_wire(&lower_version);
                (kind.map(str::to_string), components)
            }
            None => (None, None),
        };
        let upper = vulnerability
            .range
            .as_ref()
            .map(|range| range.upper.v.to_vec());

        let q = queries::matcher("update_vulnerabilities_insert");
        sqlx::query(q.sql)
            .bind(HASH_KIND)
            .bind(&hash)
            .bind(&vulnerability.updater)
            .bind(&vulnerability.name)
            .bind(&vulnerability.description)
            .bind(vulnerability.issued)
            .bind(&vulnerability.links)
            .bind(&vulnerability.severity)
            .bind(vulnerability.normalized_severity.as_str())
            .bind(&package.name)
            .bind(package.kind.as_str())
            .bind(&package.version)
            .bind(&package.module)
            .bind(&package.arch)
            .bind(&dist.did)
            .bind(&dist.name)
            .bind(&dist.version)
            .bind(&dist.version_code_name)
            .bind(&dist.version_id)
            .bind(&dist.arch)
            .bind(codec::cpe_to_wire(&dist.cpe))
            .bind(&dist.pretty_name)
            .bind(&repo.name)
            .bind(&repo.key)
            .bind(&repo.uri)
            .bind(&vulnerability.fixed_in_version)
            .bind(vulnerability.arch_operation.as_str())
            .bind(lower_kind)
            .bind(lower)
            .bind(upper)
            .execute(&mut **tx)
            .instrument(q.span())
            .await?;

        self.associate_vulnerability(tx, operation_id, &hash).await
    }

    async fn associate_vulnerability(
        &self,
        tx: &mut PgTransaction<'_>,
        operation_id: i64,
        hash: &[u8],
    ) -> Result<(), MethodError> {
        let q = queries::matcher("update_vulnerabilities_assoc");
        sqlx::query(q.sql)
            .bind(HASH_KIND)
            .bind(hash)
            .bind(operation_id)
            .execute(&mut **tx)
            .instrument(q.span())
            .await?;
        Ok(())
    }

    pub(super) async fn update_vulnerabilities_inner(
        &self,
        updater: &str,
        fingerprint: &str,
        vulnerabilities: &[Vulnerability],
        carried_hashes: &[Vec<u8>],
    ) -> Result<Uuid, MethodError> {
        if updater.is_empty() {
            return Err(MethodError::Validation("updater name is empty".to_string()));
        }

        let storable: Vec<&Vulnerability> = vulnerabilities
            .iter()
            .filter(|v| v.package.as_ref().is_some_and(|p| !p.name.is_empty()))
            .collect();
        let skipped = (vulnerabilities.len() - storable.len()) as u64;
        if skipped > 0 {
            tracing::debug!(updater, skipped, "dropping vulnerabilities without a package name");
            self.metrics()
                .add_skipped(Subsystem::Matcher, "update_vulnerabilities", skipped);
        }

        let mut tx = self.pool().begin().await?;
        let (operation_id, reference) = self
            .create_operation(&mut tx, "update_vulnerabilities_create", updater, fingerprint)
            .await?;

        for (batch_no, batch) in storable.chunks(BATCH_SIZE).enumerate() {
            for vulnerability in batch {
                self.insert_vulnerability(&mut tx, operation_id, vulnerability)
                    .await?;
            }
            tracing::debug!(
                updater,
                batch = batch_no,
                rows = batch.len(),
                "ingested vulnerability batch"
            );
        }

        for batch in carried_hashes.chunks(BATCH_SIZE) {
            for hash in batch {
                self.associate_vulnerability(&mut tx, operation_id, hash)
                    .await?;
            }
        }

        tx.commit().await?;
        self.refresh_latest().await;
        Ok(reference)
    }

    pub(super) async fn delta_update_vulnerabilities_inner(
        &self,
        updater: &str,
        fingerprint: &str,
        vulnerabilities: &[Vulnerability],
        deleted_names: &[String],
    ) -> Result<Uuid, MethodError> {
        // The new snapshot keeps every previously published vulnerability
        // that is neither deleted nor replaced by name.
        let q = queries::matcher("delta_update_vulnerabilities_load");
        let previous: Vec<(String, Vec<u8>, String)> = sqlx::query_as(q.sql)
            .bind(updater)
            .fetch_all(self.pool())
            .instrument(q.span())
            .await?;

        let hidden: HashSet<&str> = deleted_names
            .iter()
            .map(String::as_str)
            .chain(vulnerabilities.iter().map(|v| v.name.as_str()))
            .collect();
        let carried: Vec<Vec<u8>> = previous
            .into_iter()
            .filter(|(_, _, name)| !hidden.contains(name.as_str()))
            .map(|(_, hash, _)| hash)
            .collect();

        self.update_vulnerabilities_inner(updater, fingerprint, vulnerabilities, &carried)
            .await
    }

    pub(super) async fn update_enrichments_inner(
        &self,
        updater: &str,
        fingerprint: &str,
        mut records: BoxStream<'_, EnrichmentRecord>,
    ) -> Result<Uuid, MethodError> {
        if updater.is_empty() {
            return Err(MethodError::Validation("updater name is empty".to_string()));
        }

        let mut tx: PgTransaction<'_> = self.pool().begin().await?;
        let (operation_id, reference) = self
            .create_operation(&mut tx, "update_enrichments_create", updater, fingerprint)
            .await?;

        let insert = queries::matcher("update_enrichments_insert");
        let assoc = queries::matcher("update_enrichments_assoc");
        let mut count: usize = 0;
        while let Some(record) = records.next().await {
            let hash = record.content_digest().to_vec();
            sqlx::query(insert.sql)
                .bind(HASH_KIND)
                .bind(&hash)
                .bind(updater)
                .bind(&record.tags)
                .bind(&record.enrichment)
                .execute(&mut *tx)
                .instrument(insert.span())
                .await?;
            sqlx::query(assoc.sql)
                .bind(HASH_KIND)
                .bind(&hash)
                .bind(operation_id)
                .execute(&mut *tx)
                .instrument(assoc.span())
                .await?;
            count += 1;
            if count % BATCH_SIZE == 0 {
                tracing::debug!(updater, count, "ingested enrichment batch");
            }
        }

        tx.commit().await?;
        self.refresh_latest().await;
        tracing::debug!(updater, count, "enrichment update committed");
        Ok(reference)
    }
}
