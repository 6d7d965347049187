use itertools::Itertools;
use tracing::Instrument;
use xxhash_rust::xxh3::xxh3_64;

use crate::domain::Digest;

use super::PostgresIndexerStore;
use super::super::observe::MethodError;
use super::super::queries;

/// Key for the per-digest delete lock. The derivation must be stable across
/// processes; every participant hashes the textual digest the same way.
pub(super) fn advisory_lock_key(digest: &Digest) -> i64 {
    xxh3_64(digest.to_string().as_bytes()) as i64
}

const TRY_LOCK: &str = "SELECT pg_try_advisory_xact_lock($1);";

impl PostgresIndexerStore {
    pub(super) async fn delete_manifests_inner(
        &self,
        digests: &[Digest],
    ) -> Result<Vec<Digest>, MethodError> {
        let mut deleted = Vec::with_capacity(digests.len());
        let mut failures: Vec<(Digest, MethodError)> = Vec::new();

        for digest in digests {
            match self.delete_one(digest).await {
                Ok(true) => deleted.push(digest.clone()),
                Ok(false) => {}
                Err(error) => failures.push((digest.clone(), error)),
            }
        }

        if deleted.is_empty() && !failures.is_empty() {
            let joined = failures
                .iter()
                .map(|(digest, error)| format!("{digest}: {error:?}"))
                .join("; ");
            return Err(MethodError::Internal(joined));
        }
        for (digest, error) in failures {
            tracing::warn!(manifest = %digest, ?error, "failed to delete manifest");
        }
        Ok(deleted)
    }

    /// One manifest, one transaction, the whole of it under the advisory
    /// lock. Returns false when the manifest is unknown or the lock is
    /// contended; neither is an error.
    async fn delete_one(&self, digest: &Digest) -> Result<bool, MethodError> {
        let mut tx = self.pool().begin().await?;

        let (locked,): (bool,) = sqlx::query_as(TRY_LOCK)
            .bind(advisory_lock_key(digest))
            .fetch_one(&mut *tx)
            .await?;
        if !locked {
            // Somebody else is deleting or indexing this manifest.
            tracing::debug!(manifest = %digest, "delete lock contended, skipping");
            tx.rollback().await?;
            return Ok(false);
        }

        let q = queries::indexer("delete_manifests_select");
        let row: Option<(i64,)> = sqlx::query_as(q.sql)
            .bind(digest)
            .fetch_optional(&mut *tx)
            .instrument(q.span())
            .await?;
        let Some((manifest_id,)) = row else {
            tx.commit().await?;
            return Ok(false);
        };

        let layer_ids = self.collect_manifest_layers(&mut tx, manifest_id).await?;

        let q = queries::indexer("delete_manifests_delete");
        sqlx::query(q.sql)
            .bind(manifest_id)
            .execute(&mut *tx)
            .instrument(q.span())
            .await?;

        let q = queries::indexer("delete_manifests_layer_cleanup");
        sqlx::query(q.sql)
            .bind(&layer_ids)
            .execute(&mut *tx)
            .instrument(q.span())
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lock_key_is_stable_and_digest_dependent() {
        let a = Digest::from_str(&format!("sha256:{}", "a".repeat(64))).unwrap();
        let b = Digest::from_str(&format!("sha256:{}", "b".repeat(64))).unwrap();
        assert_eq!(advisory_lock_key(&a), advisory_lock_key(&a.clone()));
        assert_ne!(advisory_lock_key(&a), advisory_lock_key(&b));
    }
}
