use futures::TryStreamExt;
use itertools::Itertools;
use tracing::Instrument;

use crate::domain::{Digest, Manifest, Scanner};

use super::PostgresIndexerStore;
use super::super::observe::MethodError;
use super::super::queries;

/// Rotates a scanner slice into the three parallel column arrays the
/// templates take, deduplicated.
pub(super) fn scanner_columns(scanners: &[Scanner]) -> (Vec<&str>, Vec<&str>, Vec<&str>) {
    let unique: Vec<&Scanner> = scanners.iter().unique().collect();
    (
        unique.iter().map(|s| s.name.as_str()).collect(),
        unique.iter().map(|s| s.version.as_str()).collect(),
        unique.iter().map(|s| s.kind.as_str()).collect(),
    )
}

impl PostgresIndexerStore {
    pub(super) async fn persist_manifest_inner(
        &self,
        manifest: &Manifest,
    ) -> Result<(), MethodError> {
        let mut tx = self.pool().begin().await?;

        let q = queries::indexer("persist_manifest_insert");
        sqlx::query(q.sql)
            .bind(&manifest.hash)
            .execute(&mut *tx)
            .instrument(q.span())
            .await?;

        let q = queries::indexer("persist_manifest_select");
        let (manifest_id,): (i64,) = sqlx::query_as(q.sql)
            .bind(&manifest.hash)
            .fetch_one(&mut *tx)
            .instrument(q.span())
            .await?;

        let layer_hashes: Vec<String> =
            manifest.layers.iter().map(Digest::to_string).collect();

        let q = queries::indexer("persist_manifest_layer");
        sqlx::query(q.sql)
            .bind(&layer_hashes)
            .execute(&mut *tx)
            .instrument(q.span())
            .await?;

        let q = queries::indexer("persist_manifest_assoc");
        sqlx::query(q.sql)
            .bind(manifest_id)
            .bind(&layer_hashes)
            .execute(&mut *tx)
            .instrument(q.span())
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn register_scanners_inner(
        &self,
        scanners: &[Scanner],
    ) -> Result<(), MethodError> {
        if scanners.is_empty() {
            return Ok(());
        }
        let (names, versions, kinds) = scanner_columns(scanners);
        let q = queries::indexer("register_scanners_insert");
        sqlx::query(q.sql)
            .bind(names)
            .bind(versions)
            .bind(kinds)
            .execute(self.pool())
            .instrument(q.span())
            .await?;
        Ok(())
    }

    pub(super) async fn set_layer_scanned_inner(
        &self,
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), MethodError> {
        let q = queries::indexer("set_layer_scanned_insert");
        let done = sqlx::query(q.sql)
            .bind(layer)
            .bind(&scanner.name)
            .bind(&scanner.version)
            .bind(scanner.kind.as_str())
            .execute(self.pool())
            .instrument(q.span())
            .await?;
        if done.rows_affected() == 0 {
            // The insert only misses when the scanner row is absent; the
            // layer side is created on demand.
            let exists = self.layer_scanned_inner(layer, scanner).await?;
            if !exists {
                return Err(MethodError::Validation(format!(
                    "scanner {scanner} is not registered"
                )));
            }
        }
        Ok(())
    }

    pub(super) async fn layer_scanned_inner(
        &self,
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<bool, MethodError> {
        let q = queries::indexer("layer_scanned_select");
        let (scanned,): (bool,) = sqlx::query_as(q.sql)
            .bind(layer)
            .bind(&scanner.name)
            .bind(&scanner.version)
            .bind(scanner.kind.as_str())
            .fetch_one(self.pool())
            .instrument(q.span())
            .await?;
        Ok(scanned)
    }

    pub(super) async fn manifest_scanned_inner(
        &self,
        manifest: &Digest,
        scanners: &[Scanner],
    ) -> Result<bool, MethodError> {
        let (names, versions, kinds) = scanner_columns(scanners);
        let expected = names.len() as i64;

        let q = queries::indexer("manifest_scanned_select");
        let (found,): (i64,) = sqlx::query_as(q.sql)
            .bind(manifest)
            .bind(names)
            .bind(versions)
            .bind(kinds)
            .fetch_one(self.pool())
            .instrument(q.span())
            .await?;
        Ok(found == expected)
    }

    /// Resolves a persisted layer's id; indexing against an unknown layer
    /// is a caller error.
    pub(super) async fn resolve_layer(
        &self,
        tx: &mut sqlx::PgConnection,
        layer: &Digest,
    ) -> Result<i64, MethodError> {
        let q = queries::indexer("helper_layer_select");
        let row: Option<(i64,)> = sqlx::query_as(q.sql)
            .bind(layer)
            .fetch_optional(&mut *tx)
            .instrument(q.span())
            .await?;
        row.map(|(id,)| id).ok_or_else(|| {
            MethodError::Validation(format!("layer {layer} has not been persisted"))
        })
    }

    /// Resolves a registered scanner's id.
    pub(super) async fn resolve_scanner(
        &self,
        tx: &mut sqlx::PgConnection,
        scanner: &Scanner,
    ) -> Result<i64, MethodError> {
        let q = queries::indexer("helper_scanner_select");
        let row: Option<(i64,)> = sqlx::query_as(q.sql)
            .bind(&scanner.name)
            .bind(&scanner.version)
            .bind(scanner.kind.as_str())
            .fetch_optional(&mut *tx)
            .instrument(q.span())
            .await?;
        row.map(|(id,)| id).ok_or_else(|| {
            MethodError::Validation(format!("scanner {scanner} is not registered"))
        })
    }

    /// Streams the ids of the given layer hashes; used by manifest
    /// deletion bookkeeping.
    pub(super) async fn collect_manifest_layers(
        &self,
        tx: &mut sqlx::PgConnection,
        manifest_id: i64,
    ) -> Result<Vec<i64>, MethodError> {
        let q = queries::indexer("delete_manifests_layers");
        let ids: Vec<(i64,)> = sqlx::query_as::<_, (i64,)>(q.sql)
            .bind(manifest_id)
            .fetch(&mut *tx)
            .try_collect()
            .instrument(q.span())
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
