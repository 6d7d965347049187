use tracing::Instrument;

use crate::domain::{Digest, IndexReport, Scanner};

use super::PostgresIndexerStore;
use super::delete::advisory_lock_key;
use super::super::observe::MethodError;
use super::super::queries;

const TAKE_LOCK: &str = "SELECT pg_advisory_xact_lock($1);";

fn manifest_hash(report: &IndexReport) -> Result<&Digest, MethodError> {
    report
        .manifest_hash
        .as_ref()
        .ok_or_else(|| MethodError::Validation("index report carries no manifest hash".to_string()))
}

impl PostgresIndexerStore {
    pub(super) async fn set_index_report_inner(
        &self,
        report: &IndexReport,
    ) -> Result<(), MethodError> {
        let hash = manifest_hash(report)?;
        let blob = serde_json::to_value(report)
            .map_err(|e| MethodError::Internal(format!("failed to serialize report: {e}")))?;

        let q = queries::indexer("set_index_report_upsert");
        sqlx::query(q.sql)
            .bind(hash)
            .bind(blob)
            .execute(self.pool())
            .instrument(q.span())
            .await?;
        Ok(())
    }

    pub(super) async fn set_index_finished_inner(
        &self,
        report: &IndexReport,
        scanners: &[Scanner],
    ) -> Result<(), MethodError> {
        let hash = manifest_hash(report)?;
        let blob = serde_json::to_value(report)
            .map_err(|e| MethodError::Internal(format!("failed to serialize report: {e}")))?;

        let mut tx = self.pool().begin().await?;

        let q = queries::indexer("set_index_report_upsert");
        sqlx::query(q.sql)
            .bind(hash)
            .bind(blob)
            .execute(&mut *tx)
            .instrument(q.span())
            .await?;

        let q = queries::indexer("set_index_finished_scanned");
        for scanner in scanners {
            sqlx::query(q.sql)
                .bind(hash)
                .bind(&scanner.name)
                .bind(&scanner.version)
                .bind(scanner.kind.as_str())
                .execute(&mut *tx)
                .instrument(q.span())
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn index_report_inner(
        &self,
        manifest: &Digest,
    ) -> Result<Option<IndexReport>, MethodError> {
        let q = queries::indexer("index_report_select");
        let row: Option<(serde_json::Value,)> = sqlx::query_as(q.sql)
            .bind(manifest)
            .fetch_optional(self.pool())
            .instrument(q.span())
            .await?;
        let Some((blob,)) = row else {
            return Ok(None);
        };
        let report = serde_json::from_value(blob)
            .map_err(|e| MethodError::Internal(format!("failed to deserialize report: {e}")))?;
        Ok(Some(report))
    }

    pub(super) async fn index_manifest_inner(
        &self,
        report: &IndexReport,
    ) -> Result<(), MethodError> {
        let hash = manifest_hash(report)?;
        let records = report.index_records();

        let mut tx = self.pool().begin().await?;

        // Serializes against delete_manifests on the same digest: a delete
        // in flight blocks indexing until it commits, and vice versa the
        // delete's try-lock skips while this transaction is open.
        sqlx::query(TAKE_LOCK)
            .bind(advisory_lock_key(hash))
            .execute(&mut *tx)
            .await?;

        let q = queries::indexer("index_manifest_select");
        let row: Option<(i64,)> = sqlx::query_as(q.sql)
            .bind(hash)
            .fetch_optional(&mut *tx)
            .instrument(q.span())
            .await?;
        let Some((manifest_id,)) = row else {
            return Err(MethodError::Validation(format!(
                "manifest {hash} has not been persisted"
            )));
        };

        let q = queries::indexer("index_manifest_insert");
        for record in &records {
            let Some(pkg) = &record.package else {
                tracing::debug!(manifest = %hash, "skipping index record with no package");
                continue;
            };
            let dist_id = record.distribution.as_ref().map(|d| d.id);
            let repo_id = record.repository.as_ref().map(|r| r.id);

            // One row for the binary package, one for its source, so a
            // match against either finds this manifest.
            let mut package_ids = vec![pkg.id];
            if let Some(src) = pkg.source.as_deref().filter(|s| s.id != 0) {
                package_ids.push(src.id);
            }
            for package_id in package_ids {
                sqlx::query(q.sql)
                    .bind(manifest_id)
                    .bind(package_id)
                    .bind(dist_id)
                    .bind(repo_id)
                    .execute(&mut *tx)
                    .instrument(q.span())
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
