use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::app::{IndexError, IndexerStore, VulnFn};
use crate::domain::{
    Digest, Distribution, File, IndexReport, Manifest, Package, Repository, Scanner, Vulnerability,
};

/// In-memory [`IndexerStore`] with the same observable semantics as the
/// PostgreSQL adapter: content-addressed dedup, reference-counted layers,
/// the same validation failures. Exists for tests and the two-store
/// comparator harness.
#[derive(Default)]
pub struct MemIndexerStore {
    state: RwLock<IndexerState>,
}

#[derive(Default)]
struct IndexerState {
    manifests: HashMap<Digest, Vec<Digest>>,
    layers: HashSet<Digest>,
    scanners: HashSet<Scanner>,
    scanned_layers: HashSet<(Digest, Scanner)>,
    scanned_manifests: HashSet<(Digest, Scanner)>,

    packages: ContentTable<Package>,
    distributions: ContentTable<Distribution>,
    repositories: ContentTable<Repository>,

    pkg_artifacts: HashSet<PkgArtifact>,
    dist_artifacts: HashSet<(Digest, Scanner, i64)>,
    repo_artifacts: HashSet<(Digest, Scanner, i64)>,
    file_artifacts: HashSet<(Digest, Scanner, File)>,

    manifest_index: HashSet<(Digest, i64, Option<i64>, Option<i64>)>,
    reports: HashMap<Digest, IndexReport>,
}

/// Content-addressed id assignment: one row per distinct value, ids are
/// dense and never reused.
struct ContentTable<T> {
    rows: HashMap<i64, T>,
    ids: HashMap<String, i64>,
    next: i64,
}

impl<T> Default for ContentTable<T> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            ids: HashMap::new(),
            next: 1,
        }
    }
}

impl<T: Clone> ContentTable<T> {
    fn upsert(&mut self, key: String, value: T) -> i64 {
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        let id = self.next;
        self.next += 1;
        self.ids.insert(key, id);
        self.rows.insert(id, value);
        id
    }

    fn lookup(&self, key: &str) -> Option<i64> {
        self.ids.get(key).copied()
    }

    fn get(&self, id: i64) -> Option<&T> {
        self.rows.get(&id)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PkgArtifact {
    layer: Digest,
    scanner: Scanner,
    package_id: i64,
    source_id: Option<i64>,
    package_db: String,
    repository_hint: String,
    filepath: String,
}

fn package_key(p: &Package) -> String {
    format!(
        "{}\x00{}\x00{}\x00{}\x00{}",
        p.name,
        p.kind.as_str(),
        p.version,
        p.module,
        p.arch
    )
}

fn distribution_key(d: &Distribution) -> String {
    format!(
        "{}\x00{}\x00{}\x00{}\x00{}\x00{}\x00{}\x00{}",
        d.did,
        d.name,
        d.version,
        d.version_code_name,
        d.version_id,
        d.arch,
        d.cpe.as_ref().map(|c| c.as_str()).unwrap_or(""),
        d.pretty_name
    )
}

fn repository_key(r: &Repository) -> String {
    format!("{}\x00{}\x00{}", r.name, r.key, r.uri)
}

/// A package stripped to its stored columns, with the table id stamped on.
fn stored_package(p: &Package, id: i64) -> Package {
    Package {
        id,
        name: p.name.clone(),
        version: p.version.clone(),
        kind: p.kind,
        normalized_version: p.normalized_version.clone(),
        module: p.module.clone(),
        arch: p.arch.clone(),
        ..Default::default()
    }
}

impl IndexerState {
    fn require_layer(&self, layer: &Digest) -> Result<(), IndexError> {
        if !self.layers.contains(layer) {
            return Err(IndexError::Validation(format!(
                "layer {layer} has not been persisted"
            )));
        }
        Ok(())
    }

    fn require_scanner(&self, scanner: &Scanner) -> Result<(), IndexError> {
        if !self.scanners.contains(scanner) {
            return Err(IndexError::Validation(format!(
                "scanner {scanner} is not registered"
            )));
        }
        Ok(())
    }
}

impl MemIndexerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl IndexerStore for MemIndexerStore {
    async fn persist_manifest(&self, manifest: &Manifest) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        for layer in &manifest.layers {
            state.layers.insert(layer.clone());
        }
        state
            .manifests
            .insert(manifest.hash.clone(), manifest.layers.clone());
        Ok(())
    }

    async fn delete_manifests(&self, digests: &[Digest]) -> Result<Vec<Digest>, IndexError> {
        let mut state = self.state.write().await;
        let mut deleted = Vec::new();
        for digest in digests {
            let Some(layers) = state.manifests.remove(digest) else {
                continue;
            };
            state.reports.remove(digest);
            state.manifest_index.retain(|(m, ..)| m != digest);
            state
                .scanned_manifests
                .retain(|(m, _)| m != digest);

            for layer in layers {
                let still_referenced = state
                    .manifests
                    .values()
                    .any(|ls| ls.contains(&layer));
                if still_referenced {
                    continue;
                }
                state.layers.remove(&layer);
                state.scanned_layers.retain(|(l, _)| *l != layer);
                state.pkg_artifacts.retain(|a| a.layer != layer);
                state.dist_artifacts.retain(|(l, ..)| *l != layer);
                state.repo_artifacts.retain(|(l, ..)| *l != layer);
                state.file_artifacts.retain(|(l, ..)| *l != layer);
            }
            deleted.push(digest.clone());
        }
        Ok(deleted)
    }

    async fn register_scanners(&self, scanners: &[Scanner]) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.scanners.extend(scanners.iter().cloned());
        Ok(())
    }

    async fn set_layer_scanned(&self, layer: &Digest, scanner: &Scanner) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.require_scanner(scanner)?;
        state.layers.insert(layer.clone());
        state
            .scanned_layers
            .insert((layer.clone(), scanner.clone()));
        Ok(())
    }

    async fn layer_scanned(&self, layer: &Digest, scanner: &Scanner) -> Result<bool, IndexError> {
        let state = self.state.read().await;
        Ok(state
            .scanned_layers
            .contains(&(layer.clone(), scanner.clone())))
    }

    async fn manifest_scanned(
        &self,
        manifest: &Digest,
        scanners: &[Scanner],
    ) -> Result<bool, IndexError> {
        let state = self.state.read().await;
        Ok(scanners.iter().all(|scanner| {
            state
                .scanned_manifests
                .contains(&(manifest.clone(), scanner.clone()))
        }))
    }

    async fn index_packages(
        &self,
        packages: &[Package],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.require_layer(layer)?;
        state.require_scanner(scanner)?;

        for pkg in packages {
            let source_id = pkg.source.as_deref().map(|src| {
                let stored = stored_package(src, 0);
                state.packages.upsert(package_key(src), stored)
            });
            let stored = stored_package(pkg, 0);
            let package_id = state.packages.upsert(package_key(pkg), stored);
            // The upserts above ignore the placeholder id; patch the rows.
            if let Some(row) = state.packages.rows.get_mut(&package_id) {
                row.id = package_id;
            }
            if let Some(source_id) = source_id
                && let Some(row) = state.packages.rows.get_mut(&source_id)
            {
                row.id = source_id;
            }
            state.pkg_artifacts.insert(PkgArtifact {
                layer: layer.clone(),
                scanner: scanner.clone(),
                package_id,
                source_id,
                package_db: pkg.package_db.clone(),
                repository_hint: pkg.repository_hint.clone(),
                filepath: pkg.filepath.clone(),
            });
        }
        Ok(())
    }

    async fn index_distributions(
        &self,
        distributions: &[Distribution],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.require_layer(layer)?;
        state.require_scanner(scanner)?;
        for dist in distributions {
            let mut stored = dist.clone();
            stored.id = 0;
            let id = state.distributions.upsert(distribution_key(dist), stored);
            if let Some(row) = state.distributions.rows.get_mut(&id) {
                row.id = id;
            }
            state
                .dist_artifacts
                .insert((layer.clone(), scanner.clone(), id));
        }
        Ok(())
    }

    async fn index_repositories(
        &self,
        repositories: &[Repository],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.require_layer(layer)?;
        state.require_scanner(scanner)?;
        for repo in repositories {
            let mut stored = repo.clone();
            stored.id = 0;
            let id = state.repositories.upsert(repository_key(repo), stored);
            if let Some(row) = state.repositories.rows.get_mut(&id) {
                row.id = id;
            }
            state
                .repo_artifacts
                .insert((layer.clone(), scanner.clone(), id));
        }
        Ok(())
    }

    async fn index_files(
        &self,
        files: &[File],
        layer: &Digest,
        scanner: &Scanner,
    ) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.require_layer(layer)?;
        state.require_scanner(scanner)?;
        for file in files {
            state
                .file_artifacts
                .insert((layer.clone(), scanner.clone(), file.clone()));
        }
        Ok(())
    }

    async fn index_manifest(&self, report: &IndexReport) -> Result<(), IndexError> {
        let hash = report.manifest_hash.clone().ok_or_else(|| {
            IndexError::Validation("index report carries no manifest hash".to_string())
        })?;
        let mut state = self.state.write().await;
        if !state.manifests.contains_key(&hash) {
            return Err(IndexError::Validation(format!(
                "manifest {hash} has not been persisted"
            )));
        }
        for record in report.index_records() {
            let Some(pkg) = &record.package else {
                tracing::debug!(manifest = %hash, "skipping index record with no package");
                continue;
            };
            let dist_id = record.distribution.as_ref().map(|d| d.id);
            let repo_id = record.repository.as_ref().map(|r| r.id);
            state
                .manifest_index
                .insert((hash.clone(), pkg.id, dist_id, repo_id));
            if let Some(src) = pkg.source.as_deref().filter(|s| s.id != 0) {
                state
                    .manifest_index
                    .insert((hash.clone(), src.id, dist_id, repo_id));
            }
        }
        Ok(())
    }

    async fn packages_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Package>, IndexError> {
        let state = self.state.read().await;
        let mut out: Vec<Package> = Vec::new();
        for artifact in &state.pkg_artifacts {
            if artifact.layer != *layer || !scanners.contains(&artifact.scanner) {
                continue;
            }
            let Some(row) = state.packages.get(artifact.package_id) else {
                continue;
            };
            let mut pkg = row.clone();
            pkg.source = artifact
                .source_id
                .and_then(|id| state.packages.get(id))
                .cloned()
                .map(Box::new);
            pkg.package_db = artifact.package_db.clone();
            pkg.repository_hint = artifact.repository_hint.clone();
            pkg.filepath = artifact.filepath.clone();
            if !out.contains(&pkg) {
                out.push(pkg);
            }
        }
        Ok(out)
    }

    async fn distributions_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Distribution>, IndexError> {
        let state = self.state.read().await;
        let mut out: Vec<Distribution> = Vec::new();
        for (l, scanner, id) in &state.dist_artifacts {
            if l == layer
                && scanners.contains(scanner)
                && let Some(dist) = state.distributions.get(*id)
                && !out.contains(dist)
            {
                out.push(dist.clone());
            }
        }
        Ok(out)
    }

    async fn repositories_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<Repository>, IndexError> {
        let state = self.state.read().await;
        let mut out: Vec<Repository> = Vec::new();
        for (l, scanner, id) in &state.repo_artifacts {
            if l == layer
                && scanners.contains(scanner)
                && let Some(repo) = state.repositories.get(*id)
                && !out.contains(repo)
            {
                out.push(repo.clone());
            }
        }
        Ok(out)
    }

    async fn files_by_layer(
        &self,
        layer: &Digest,
        scanners: &[Scanner],
    ) -> Result<Vec<File>, IndexError> {
        let state = self.state.read().await;
        let mut out: Vec<File> = Vec::new();
        for (l, scanner, file) in &state.file_artifacts {
            if l == layer && scanners.contains(scanner) && !out.contains(file) {
                out.push(file.clone());
            }
        }
        Ok(out)
    }

    async fn set_index_report(&self, report: &IndexReport) -> Result<(), IndexError> {
        let hash = report.manifest_hash.clone().ok_or_else(|| {
            IndexError::Validation("index report carries no manifest hash".to_string())
        })?;
        let mut state = self.state.write().await;
        if !state.manifests.contains_key(&hash) {
            return Err(IndexError::Validation(format!(
                "manifest {hash} has not been persisted"
            )));
        }
        state.reports.insert(hash, report.clone());
        Ok(())
    }

    async fn set_index_finished(
        &self,
        report: &IndexReport,
        scanners: &[Scanner],
    ) -> Result<(), IndexError> {
        let hash = report.manifest_hash.clone().ok_or_else(|| {
            IndexError::Validation("index report carries no manifest hash".to_string())
        })?;
        let mut state = self.state.write().await;
        if !state.manifests.contains_key(&hash) {
            return Err(IndexError::Validation(format!(
                "manifest {hash} has not been persisted"
            )));
        }
        state.reports.insert(hash.clone(), report.clone());
        for scanner in scanners {
            state
                .scanned_manifests
                .insert((hash.clone(), scanner.clone()));
        }
        Ok(())
    }

    async fn index_report(&self, manifest: &Digest) -> Result<Option<IndexReport>, IndexError> {
        let state = self.state.read().await;
        Ok(state.reports.get(manifest).cloned())
    }

    async fn affected_manifests(
        &self,
        vulnerability: &Vulnerability,
        vuln_fn: VulnFn<'_>,
    ) -> Result<Vec<Digest>, IndexError> {
        let package_name = vulnerability
            .package
            .as_ref()
            .map(|p| p.name.as_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                IndexError::Validation("vulnerability carries no package name".to_string())
            })?;

        let state = self.state.read().await;

        if vulnerability.dist.is_none() && vulnerability.repo.is_none() {
            return Ok(Vec::new());
        }
        let dist_id = match &vulnerability.dist {
            None => None,
            Some(dist) => match state.distributions.lookup(&distribution_key(dist)) {
                Some(id) => Some(id),
                None => return Ok(Vec::new()),
            },
        };
        let repo_id = match &vulnerability.repo {
            None => None,
            Some(repo) => match state.repositories.lookup(&repository_key(repo)) {
                Some(id) => Some(id),
                None => return Ok(Vec::new()),
            },
        };

        let mut record = crate::domain::IndexRecord {
            package: None,
            distribution: vulnerability.dist.clone(),
            repository: vulnerability.repo.clone(),
        };

        let mut affected = Vec::new();
        let mut candidates: Vec<&Package> = state
            .packages
            .rows
            .values()
            .filter(|p| p.name == package_name)
            .collect();
        candidates.sort_by_key(|p| p.id);
        for pkg in candidates {
            record.package = Some(pkg.clone());
            if !vuln_fn(&record, vulnerability) {
                continue;
            }
            for (manifest, package_id, d, r) in &state.manifest_index {
                if *package_id == pkg.id
                    && *d == dist_id
                    && *r == repo_id
                    && !affected.contains(manifest)
                {
                    affected.push(manifest.clone());
                }
            }
        }
        Ok(affected)
    }
}
