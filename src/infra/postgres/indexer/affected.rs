use std::collections::HashSet;

use tracing::Instrument;

use crate::app::VulnFn;
use crate::domain::{Digest, IndexRecord, Vulnerability};

use super::PostgresIndexerStore;
use super::super::codec;
use super::super::observe::MethodError;
use super::super::queries;

const READ_ONLY: &str = "SET TRANSACTION READ ONLY;";

impl PostgresIndexerStore {
    pub(super) async fn affected_manifests_inner(
        &self,
        vulnerability: &Vulnerability,
        vuln_fn: VulnFn<'_>,
    ) -> Result<Vec<Digest>, MethodError> {
        let package_name = vulnerability
            .package
            .as_ref()
            .map(|p| p.name.as_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                MethodError::Validation("vulnerability carries no package name".to_string())
            })?;

        let mut tx = self.pool().begin().await?;
        sqlx::query(READ_ONLY).execute(&mut *tx).await?;

        // Prototype record: the vulnerability's dist and repo resolved to
        // their stored ids. A miss on either side means nothing indexed
        // here can match.
        let (dist_id, repo_id) = match self.resolve_prototype(&mut tx, vulnerability).await {
            Ok(ids) => ids,
            Err(MethodError::NotIndexed) => {
                tracing::debug!(
                    vulnerability = %vulnerability.name,
                    "distribution and repository unknown to this store"
                );
                tx.commit().await?;
                return Ok(Vec::new());
            }
            Err(error) => return Err(error),
        };

        let q = queries::indexer("affected_manifests_packages");
        let rows = sqlx::query(q.sql)
            .bind(package_name)
            .fetch_all(&mut *tx)
            .instrument(q.span())
            .await?;

        let mut record = IndexRecord {
            package: None,
            distribution: vulnerability.dist.clone(),
            repository: vulnerability.repo.clone(),
        };

        let q = queries::indexer("affected_manifests_select");
        let mut seen: HashSet<Digest> = HashSet::new();
        let mut affected = Vec::new();
        for row in &rows {
            let Some(pkg) = codec::package_at(row, 0)? else {
                continue;
            };
            let package_id = pkg.id;
            record.package = Some(pkg);
            if !vuln_fn(&record, vulnerability) {
                continue;
            }

            let hashes: Vec<(Digest,)> = sqlx::query_as(q.sql)
                .bind(package_id)
                .bind(dist_id)
                .bind(repo_id)
                .fetch_all(&mut *tx)
                .instrument(q.span())
                .await?;
            for (hash,) in hashes {
                if seen.insert(hash.clone()) {
                    affected.push(hash);
                }
            }
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn resolve_prototype(
        &self,
        tx: &mut sqlx::PgConnection,
        vulnerability: &Vulnerability,
    ) -> Result<(Option<i64>, Option<i64>), MethodError> {
        if vulnerability.dist.is_none() && vulnerability.repo.is_none() {
            return Err(MethodError::NotIndexed);
        }

        let dist_id = match &vulnerability.dist {
            None => None,
            Some(dist) => {
                let q = queries::indexer("affected_manifests_dist");
                let row: Option<(i64,)> = sqlx::query_as(q.sql)
                    .bind(&dist.did)
                    .bind(&dist.name)
                    .bind(&dist.version)
                    .bind(&dist.version_code_name)
                    .bind(&dist.version_id)
                    .bind(&dist.arch)
                    .bind(codec::cpe_to_wire(&dist.cpe))
                    .bind(&dist.pretty_name)
                    .fetch_optional(&mut *tx)
                    .instrument(q.span())
                    .await?;
                match row {
                    Some((id,)) => Some(id),
                    None => return Err(MethodError::NotIndexed),
                }
            }
        };

        let repo_id = match &vulnerability.repo {
            None => None,
            Some(repo) => {
                let q = queries::indexer("affected_manifests_repo");
                let row: Option<(i64,)> = sqlx::query_as(q.sql)
                    .bind(&repo.name)
                    .bind(&repo.key)
                    .bind(&repo.uri)
                    .fetch_optional(&mut *tx)
                    .instrument(q.span())
                    .await?;
                match row {
                    Some((id,)) => Some(id),
                    None => return Err(MethodError::NotIndexed),
                }
            }
        };

        Ok((dist_id, repo_id))
    }
}
