#![allow(dead_code)]

use std::collections::HashMap;

use vulnstore::app::{GetOpts, IndexerStore, MatcherStore};
use vulnstore::domain::{
    Digest, Distribution, Environment, File, FileKind, IndexRecord, IndexReport, Manifest,
    Package, PackageKind, Repository, Scanner, ScannerKind, Severity, Vulnerability,
};

pub fn digest(fill: char) -> Digest {
    let checksum: String = std::iter::repeat_n(fill, 64).collect();
    format!("sha256:{checksum}").parse().unwrap()
}

pub fn package_scanner() -> Scanner {
    Scanner::new("test-package-scanner", "1.0.0", ScannerKind::Package)
}

pub fn dist_scanner() -> Scanner {
    Scanner::new("test-dist-scanner", "1.0.0", ScannerKind::Distribution)
}

pub fn repo_scanner() -> Scanner {
    Scanner::new("test-repo-scanner", "1.0.0", ScannerKind::Repository)
}

pub fn file_scanner() -> Scanner {
    Scanner::new("test-file-scanner", "1.0.0", ScannerKind::File)
}

pub fn all_scanners() -> Vec<Scanner> {
    vec![
        package_scanner(),
        dist_scanner(),
        repo_scanner(),
        file_scanner(),
    ]
}

pub fn package(name: &str, version: &str) -> Package {
    Package {
        name: name.to_string(),
        version: version.to_string(),
        package_db: "var/lib/dpkg/status".to_string(),
        ..Default::default()
    }
}

pub fn package_with_source(name: &str, source_name: &str) -> Package {
    let mut pkg = package(name, "1.0.0");
    pkg.source = Some(Box::new(Package {
        name: source_name.to_string(),
        version: "1.0.0".to_string(),
        kind: PackageKind::Source,
        ..Default::default()
    }));
    pkg
}

pub fn distribution(did: &str) -> Distribution {
    Distribution {
        did: did.to_string(),
        name: did.to_string(),
        version: "22.04".to_string(),
        version_id: "22.04".to_string(),
        pretty_name: format!("{did} 22.04"),
        ..Default::default()
    }
}

pub fn repository(name: &str) -> Repository {
    Repository {
        name: name.to_string(),
        key: format!("{name}-key"),
        uri: format!("https://example.com/{name}"),
        ..Default::default()
    }
}

pub fn a_file(path: &str) -> File {
    File::new(path, FileKind::File)
}

pub fn vulnerability(updater: &str, name: &str, package_name: &str) -> Vulnerability {
    Vulnerability {
        updater: updater.to_string(),
        name: name.to_string(),
        description: format!("{name} in {package_name}"),
        links: format!("https://example.com/{name}"),
        severity: "Important".to_string(),
        normalized_severity: Severity::High,
        package: Some(Package {
            name: package_name.to_string(),
            version: "1.0.0".to_string(),
            ..Default::default()
        }),
        fixed_in_version: "1.0.1".to_string(),
        ..Default::default()
    }
}

/// A finished report whose packages come from the store's own
/// `packages_by_layer` answer, so the ids are valid for that store.
pub async fn finished_report(
    store: &dyn IndexerStore,
    manifest: &Digest,
    layer: &Digest,
) -> IndexReport {
    let packages = store
        .packages_by_layer(layer, &[package_scanner()])
        .await
        .unwrap();
    let distributions = store
        .distributions_by_layer(layer, &[dist_scanner()])
        .await
        .unwrap();
    let repositories = store
        .repositories_by_layer(layer, &[repo_scanner()])
        .await
        .unwrap();

    let mut report = IndexReport::finished(manifest.clone());
    for pkg in packages {
        let env = Environment {
            package_db: pkg.package_db.clone(),
            introduced_in: Some(layer.clone()),
            distribution_id: distributions.first().map(|d| d.id),
            repository_ids: repositories.iter().map(|r| r.id).collect(),
        };
        report.environments.entry(pkg.id).or_default().push(env);
        report.packages.insert(pkg.id, pkg);
    }
    for dist in distributions {
        report.distributions.insert(dist.id, dist);
    }
    for repo in repositories {
        report.repositories.insert(repo.id, repo);
    }
    report
}

/// Runs every public operation against two store implementations and
/// compares the results structurally. Entity equality already ignores
/// server-assigned ids; refs and timestamps are never compared directly.
pub struct Comparator<'a> {
    pub left: &'a dyn IndexerStore,
    pub right: &'a dyn IndexerStore,
}

fn assert_same_set<T: PartialEq + std::fmt::Debug>(left: &[T], right: &[T]) {
    assert_eq!(left.len(), right.len(), "{left:?} vs {right:?}");
    for item in left {
        assert!(right.contains(item), "missing {item:?} in {right:?}");
    }
}

impl Comparator<'_> {
    pub async fn exercise(&self) {
        let m1 = digest('1');
        let m2 = digest('2');
        let (l1, l2, l3) = (digest('a'), digest('b'), digest('c'));

        for store in [self.left, self.right] {
            store.register_scanners(&all_scanners()).await.unwrap();
            store
                .persist_manifest(&Manifest::new(m1.clone(), vec![l1.clone(), l2.clone()]))
                .await
                .unwrap();
            store
                .persist_manifest(&Manifest::new(m2.clone(), vec![l2.clone(), l3.clone()]))
                .await
                .unwrap();
            // Idempotent.
            store
                .persist_manifest(&Manifest::new(m1.clone(), vec![l1.clone(), l2.clone()]))
                .await
                .unwrap();
        }

        // Scan bookkeeping.
        for store in [self.left, self.right] {
            store
                .set_layer_scanned(&l1, &package_scanner())
                .await
                .unwrap();
        }
        for (layer, scanner, expected) in [
            (&l1, package_scanner(), true),
            (&l2, package_scanner(), false),
            (&l1, dist_scanner(), false),
        ] {
            assert_eq!(
                self.left.layer_scanned(layer, &scanner).await.unwrap(),
                expected
            );
            assert_eq!(
                self.right.layer_scanned(layer, &scanner).await.unwrap(),
                expected
            );
        }

        // Artifact indexing plus round trips.
        let packages = vec![
            package_with_source("foo-bin", "foo-src"),
            package("bar", "2.0.0"),
        ];
        let dists = vec![distribution("ubuntu")];
        let repos = vec![repository("main")];
        let files = vec![a_file("/etc/passwd")];
        for store in [self.left, self.right] {
            store
                .index_packages(&packages, &l1, &package_scanner())
                .await
                .unwrap();
            store
                .index_distributions(&dists, &l1, &dist_scanner())
                .await
                .unwrap();
            store
                .index_repositories(&repos, &l1, &repo_scanner())
                .await
                .unwrap();
            store.index_files(&files, &l1, &file_scanner()).await.unwrap();
        }

        let left_pkgs = self
            .left
            .packages_by_layer(&l1, &[package_scanner()])
            .await
            .unwrap();
        let right_pkgs = self
            .right
            .packages_by_layer(&l1, &[package_scanner()])
            .await
            .unwrap();
        assert_same_set(&left_pkgs, &right_pkgs);
        assert_same_set(&left_pkgs, &packages);

        assert_same_set(
            &self
                .left
                .distributions_by_layer(&l1, &[dist_scanner()])
                .await
                .unwrap(),
            &self
                .right
                .distributions_by_layer(&l1, &[dist_scanner()])
                .await
                .unwrap(),
        );
        assert_same_set(
            &self
                .left
                .repositories_by_layer(&l1, &[repo_scanner()])
                .await
                .unwrap(),
            &self
                .right
                .repositories_by_layer(&l1, &[repo_scanner()])
                .await
                .unwrap(),
        );
        assert_same_set(
            &self.left.files_by_layer(&l1, &[file_scanner()]).await.unwrap(),
            &self
                .right
                .files_by_layer(&l1, &[file_scanner()])
                .await
                .unwrap(),
        );

        // Reports: each store gets a report built from its own ids.
        for store in [self.left, self.right] {
            let report = finished_report(store, &m1, &l1).await;
            store.index_manifest(&report).await.unwrap();
            store.set_index_report(&report).await.unwrap();
            store
                .set_index_finished(&report, &all_scanners())
                .await
                .unwrap();
            assert!(store.manifest_scanned(&m1, &all_scanners()).await.unwrap());
            assert!(!store.manifest_scanned(&m2, &all_scanners()).await.unwrap());
            let fetched = store.index_report(&m1).await.unwrap().unwrap();
            assert!(fetched.success);
            assert_eq!(store.index_report(&m2).await.unwrap(), None);
        }

        // Reverse lookup. The indexed records carry both a dist and a repo,
        // and the probe matches NULLs with is-not-distinct semantics, so
        // the vulnerability must name both.
        let mut vuln = vulnerability("test-updater", "CVE-2024-0001", "foo-bin");
        vuln.dist = Some(distribution("ubuntu"));
        vuln.repo = Some(repository("main"));
        let always = |_: &IndexRecord, _: &Vulnerability| true;
        let mut left_affected = self.left.affected_manifests(&vuln, &always).await.unwrap();
        let mut right_affected = self.right.affected_manifests(&vuln, &always).await.unwrap();
        left_affected.sort();
        right_affected.sort();
        assert_eq!(left_affected, right_affected);
        assert_eq!(left_affected, vec![m1.clone()]);

        // Deletion: m1 goes, the shared layer survives.
        for store in [self.left, self.right] {
            let deleted = store.delete_manifests(&[m1.clone()]).await.unwrap();
            assert_eq!(deleted, vec![m1.clone()]);
            assert_eq!(store.index_report(&m1).await.unwrap(), None);
            let deleted_again = store.delete_manifests(&[m1.clone()]).await.unwrap();
            assert!(deleted_again.is_empty());
        }
    }
}

/// Matcher-side comparator: same operations, results compared through
/// shapes that survive server-assigned refs and ids.
pub struct MatcherComparator<'a> {
    pub left: &'a dyn MatcherStore,
    pub right: &'a dyn MatcherStore,
}

fn names(vulns: &[Vulnerability]) -> Vec<&str> {
    let mut names: Vec<&str> = vulns.iter().map(|v| v.name.as_str()).collect();
    names.sort_unstable();
    names
}

fn bucket_names(results: &HashMap<i64, Vec<Vulnerability>>) -> HashMap<i64, Vec<&str>> {
    results.iter().map(|(id, vulns)| (*id, names(vulns))).collect()
}

impl MatcherComparator<'_> {
    pub async fn exercise(&self) {
        for store in [self.left, self.right] {
            assert!(!store.initialized().await.unwrap());
        }

        let v1 = vulnerability("upd", "CVE-2024-0001", "openssl");
        let v2 = vulnerability("upd", "CVE-2024-0002", "openssl");
        let mut record = IndexRecord {
            package: Some(package("openssl", "1.0.0")),
            distribution: None,
            repository: None,
        };
        record.package.as_mut().unwrap().id = 7;
        let opts = GetOpts::default();

        let mut refs = Vec::new();
        for store in [self.left, self.right] {
            let r1 = store
                .update_vulnerabilities("upd", "fp1", std::slice::from_ref(&v1))
                .await
                .unwrap();
            assert!(store.initialized().await.unwrap());

            let results = store.get(std::slice::from_ref(&record), &opts).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[&7].len(), 1);
            assert_eq!(results[&7][0].name, "CVE-2024-0001");

            let r2 = store
                .update_vulnerabilities("upd", "fp2", std::slice::from_ref(&v2))
                .await
                .unwrap();
            let results = store.get(std::slice::from_ref(&record), &opts).await.unwrap();
            assert_eq!(bucket_names(&results)[&7], vec!["CVE-2024-0002"]);

            refs.push((r1, r2));
        }

        // Lifecycle queries, per store against its own refs.
        for (store, (r1, r2)) in [self.left, self.right].into_iter().zip(&refs) {
            let ops = store
                .get_update_operations(vulnstore::domain::UpdateKind::Vulnerability, &[])
                .await
                .unwrap();
            assert_eq!(ops["upd"].len(), 2);
            assert_eq!(ops["upd"][0].reference, *r2, "most recent first");

            let latest = store
                .get_latest_update_ref(vulnstore::domain::UpdateKind::Vulnerability)
                .await
                .unwrap();
            assert_eq!(latest, Some(*r2));
            let latest_refs = store
                .get_latest_update_refs(vulnstore::domain::UpdateKind::Vulnerability)
                .await
                .unwrap();
            assert_eq!(latest_refs["upd"], *r2);

            let diff = store.get_update_diff(Some(*r1), *r2).await.unwrap();
            assert_eq!(names(&diff.added), vec!["CVE-2024-0002"]);
            assert_eq!(names(&diff.removed), vec!["CVE-2024-0001"]);
        }

        // Enrichments.
        let enrichment = vulnstore::domain::EnrichmentRecord {
            tags: vec!["CVE-2024-0001".to_string()],
            enrichment: serde_json::json!({"cvss": 9.8}),
        };
        for store in [self.left, self.right] {
            store
                .update_enrichments("enricher", "fp", std::slice::from_ref(&enrichment))
                .await
                .unwrap();
            let found = store
                .get_enrichment("enricher", &["CVE-2024-0001".to_string()])
                .await
                .unwrap();
            assert_eq!(found, vec![enrichment.clone()]);
        }

        // GC and explicit deletion.
        for (store, (r1, _)) in [self.left, self.right].into_iter().zip(&refs) {
            assert_eq!(store.gc(5).await.unwrap(), 0);
            assert_eq!(store.delete_update_operations(&[*r1]).await.unwrap(), 1);
            assert_eq!(store.delete_update_operations(&[*r1]).await.unwrap(), 0);
        }

        // Status bookkeeping.
        let now = chrono::Utc::now();
        for store in [self.left, self.right] {
            store
                .record_updater_status("upd", now, "fp2", None)
                .await
                .unwrap();
            store
                .record_updater_status("upd", now, "fp3", Some("fetch failed"))
                .await
                .unwrap();
            store.record_updater_set_status("upd", now).await.unwrap();
        }
    }
}
