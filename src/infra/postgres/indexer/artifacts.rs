use std::collections::HashSet;

use itertools::{Itertools, process_results};
use sqlx::Row as _;
use tracing::Instrument;

use crate::domain::{Digest, Distribution, File, Package, PackageIdentity, Repository, Scanner};

use super::PostgresIndexerStore;
use super::super::codec;
use super::super::observe::MethodError;
use super::super::queries;

use super::manifests::scanner_columns;

impl PostgresIndexerStore {
    /// The zero-source placeholder every sourceless artifact points at.
    /// Inserted at most once per store; the insert itself is idempotent.
    async fn ensure_sentinel_package(&self) -> Result<(), MethodError> {
        self.sentinel_cell()
            .get_or_try_init(|| async {
                let q = queries::indexer("index_packages_insert");
                let zero = Package::default();
                let (norm_kind, norm_version) = codec::version_to_wire(&zero.normalized_version);
                sqlx::query(q.sql)
                    .bind(&zero.name)
                    .bind(zero.kind.as_str())
                    .bind(&zero.version)
                    .bind(norm_kind)
                    .bind(norm_version)
                    .bind(&zero.module)
                    .bind(&zero.arch)
                    .execute(self.pool())
                    .instrument(q.span())
                    .await?;
                Ok::<(), MethodError>(())
            })
            .await?;
        Ok(())
    }

    pub(super) async fn index_packages_inner(
        &self,
        packages: &[Package],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), MethodError> {
        self.ensure_sentinel_package().await?;

        let mut tx = self.pool().begin().await?;
        let layer_id = self.resolve_layer(&mut tx, layer).await?;
        let scanner_id = self.resolve_scanner(&mut tx, scanner).await?;

        // Rotate the input into one insert per distinct identity, sources
        // included: the artifact row ties binary to source, so both rows
        // must exist before association.
        fn with_source<'a>(
            p: &'a Package,
        ) -> std::iter::Chain<std::option::IntoIter<&'a Package>, std::array::IntoIter<&'a Package, 1>>
        {
            p.source.as_deref().into_iter().chain([p])
        }

        let mut seen: HashSet<PackageIdentity<'_>> = HashSet::new();
        let q = queries::indexer("index_packages_insert");
        for pkg in packages.iter().flat_map(with_source) {
            if !seen.insert(pkg.identity()) {
                continue;
            }
            let (norm_kind, norm_version) = codec::version_to_wire(&pkg.normalized_version);
            sqlx::query(q.sql)
                .bind(&pkg.name)
                .bind(pkg.kind.as_str())
                .bind(&pkg.version)
                .bind(norm_kind)
                .bind(norm_version)
                .bind(&pkg.module)
                .bind(&pkg.arch)
                .execute(&mut *tx)
                .instrument(q.span())
                .await?;
        }

        let _ = &packages;

        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn index_distributions_inner(
        &self,
        distributions: &[Distribution],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), MethodError> {
        let mut tx = self.pool().begin().await?;
        let layer_id = self.resolve_layer(&mut tx, layer).await?;
        let scanner_id = self.resolve_scanner(&mut tx, scanner).await?;

        let insert = queries::indexer("helper_distribution_insert");
        let assoc = queries::indexer("helper_distribution_assoc");
        for dist in distributions.iter().unique() {
            sqlx::query(insert.sql)
                .bind(&dist.did)
                .bind(&dist.name)
                .bind(&dist.version)
                .bind(&dist.version_code_name)
                .bind(&dist.version_id)
                .bind(&dist.arch)
                .bind(codec::cpe_to_wire(&dist.cpe))
                .bind(&dist.pretty_name)
                .execute(&mut *tx)
                .instrument(insert.span())
                .await?;
            sqlx::query(assoc.sql)
                .bind(layer_id)
                .bind(scanner_id)
                .bind(&dist.did)
                .bind(&dist.name)
                .bind(&dist.version)
                .bind(&dist.version_code_name)
                .bind(&dist.version_id)
                .bind(&dist.arch)
                .bind(codec::cpe_to_wire(&dist.cpe))
                .bind(&dist.pretty_name)
                .execute(&mut *tx)
                .instrument(assoc.span())
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn index_repositories_inner(
        &self,
        repositories: &[Repository],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), MethodError> {
        let mut tx = self.pool().begin().await?;
        let layer_id = self.resolve_layer(&mut tx, layer).await?;
        let scanner_id = self.resolve_scanner(&mut tx, scanner).await?;

        let insert = queries::indexer("helper_repository_insert");
        let assoc = queries::indexer("helper_repository_assoc");
        for repo in repositories.iter().unique() {
            sqlx::query(insert.sql)
                .bind(&repo.name)
                .bind(&repo.key)
                .bind(&repo.uri)
                .bind(codec::cpe_to_wire(&repo.cpe))
                .execute(&mut *tx)
                .instrument(insert.span())
                .await?;
            sqlx::query(assoc.sql)
                .bind(layer_id)
                .bind(scanner_id)
                .bind(&repo.name)
                .bind(&repo.key)
                .bind(&repo.uri)
                .execute(&mut *tx)
                .instrument(assoc.span())
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn index_files_inner(
        &self,
        files: &[File],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), MethodError> {
        let mut tx = self.pool().begin().await?;
        let layer_id = self.resolve_layer(&mut tx, layer).await?;
        let scanner_id = self.resolve_scanner(&mut tx, scanner).await?;

        let insert = queries::indexer("helper_file_insert");
        let assoc = queries::indexer("helper_file_assoc");
        for file in files.iter().unique() {
            sqlx::query(insert.sql)
                .bind(&file.path)
                .bind(file.kind.as_str())
                .execute(&mut *tx)
                .instrument(insert.span())
                .await?;
            sqlx::query(assoc.sql)
                .bind(layer_id)
                .bind(scanner_id)
                .bind(&file.path)
                .bind(file.kind.as_str())
                .execute(&mut *tx)
                .instrument(assoc.span())
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn packages_by_layer_inner(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Package>, MethodError> {
        let (names, versions, kinds) = scanner_columns(scanners);
        let q = queries::indexer("packages_by_layer_select");
        let rows = sqlx::query(q.sql)
            .bind(layer)
            .bind(names)
            .bind(versions)
            .bind(kinds)
            .fetch_all(self.pool())
            .instrument(q.span())
            .await?;

        let mut packages = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(mut pkg) = codec::package_at(row, 0)? else {
                return Err(MethodError::Internal(
                    "artifact row without a package".to_string(),
                ));
            };
            pkg.source = codec::package_at(row, 8)?.map(Box::new);
            pkg.package_db = row.try_get(16)?;
            pkg.repository_hint = row.try_get(17)?;
            pkg.filepath = row.try_get(18)?;
            packages.push(pkg);
        }
        Ok(packages.into_iter().unique().collect())
    }

    pub(super) async fn distributions_by_layer_inner(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Distribution>, MethodError> {
        let (names, versions, kinds) = scanner_columns(scanners);
        let q = queries::indexer("helper_distribution_select");
        let rows = sqlx::query(q.sql)
            .bind(layer)
            .bind(names)
            .bind(versions)
            .bind(kinds)
            .fetch_all(self.pool())
            .instrument(q.span())
            .await?;
        process_results(rows.iter().map(codec::distribution_from_row), |iter| {
            iter.unique().collect()
        })
    }

    pub(super) async fn repositories_by_layer_inner(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Repository>, MethodError> {
        let (names, versions, kinds) = scanner_columns(scanners);
        let q = queries::indexer("helper_repository_select");
        let rows = sqlx::query(q.sql)
            .bind(layer)
            .bind(names)
            .bind(versions)
            .bind(kinds)
            .fetch_all(self.pool())
            .instrument(q.span())
            .await?;
        process_results(rows.iter().map(codec::repository_from_row), |iter| {
            iter.unique().collect()
        })
    }

    pub(super) async fn files_by_layer_inner(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<File>, MethodError> {
        let (names, versions, kinds) = scanner_columns(scanners);
        let q = queries::indexer("helper_file_select");
        let rows = sqlx::query(q.sql)
            .bind(layer)
            .bind(names)
            .bind(versions)
            .bind(kinds)
            .fetch_all(self.pool())
            .instrument(q.span())
            .await?;
        process_results(rows.iter().map(codec::file_from_row), |iter| {
            iter.unique().collect()
        })
    }
}
