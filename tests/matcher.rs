mod common;

use common::{package, vulnerability};
use futures::StreamExt;
use rstest::rstest;
use vulnstore::app::{GetOpts, MatchConstraint, MatcherStore};
use vulnstore::domain::{
    EnrichmentRecord, IndexRecord, NormalizedVersion, UpdateKind, VersionRange,
};
use vulnstore::infra::memory::MemMatcherStore;

fn record_for(package_name: &str, package_id: i64) -> IndexRecord {
    let mut pkg = package(package_name, "1.0.0");
    pkg.id = package_id;
    IndexRecord {
        package: Some(pkg),
        distribution: None,
        repository: None,
    }
}

#[tokio::test]
async fn snapshot_readers_only_see_the_latest_operation() {
    let store = MemMatcherStore::new();
    let record = record_for("openssl", 7);
    let opts = GetOpts::default();

    store
        .update_vulnerabilities("upd", "fp1", &[vulnerability("upd", "CVE-1", "openssl")])
        .await
        .unwrap();
    let results = store.get(std::slice::from_ref(&record), &opts).await.unwrap();
    assert_eq!(results[&7].len(), 1);
    assert_eq!(results[&7][0].name, "CVE-1");

    // A second publication replaces the snapshot wholesale.
    store
        .update_vulnerabilities("upd", "fp2", &[vulnerability("upd", "CVE-2", "openssl")])
        .await
        .unwrap();
    let results = store.get(std::slice::from_ref(&record), &opts).await.unwrap();
    assert_eq!(results[&7].len(), 1);
    assert_eq!(results[&7][0].name, "CVE-2");

    // Another updater's snapshot is independent and additive.
    store
        .update_vulnerabilities("other", "fp1", &[vulnerability("other", "CVE-3", "openssl")])
        .await
        .unwrap();
    let results = store.get(std::slice::from_ref(&record), &opts).await.unwrap();
    let mut names: Vec<&str> = results[&7].iter().map(|v| v.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["CVE-2", "CVE-3"]);
}

#[tokio::test]
async fn identical_content_is_stored_once() {
    let store = MemMatcherStore::new();
    let vuln = vulnerability("upd", "CVE-1", "openssl");

    let r1 = store
        .update_vulnerabilities("upd", "fp", &[vuln.clone(), vuln.clone(), vuln.clone()])
        .await
        .unwrap();
    let r2 = store
        .update_vulnerabilities("upd", "fp", &[vuln.clone()])
        .await
        .unwrap();

    assert_ne!(r1, r2, "operations stay distinct");
    assert_eq!(store.operation_count().await, 2);
    assert_eq!(store.vulnerability_count().await, 1);
}

#[tokio::test]
async fn vulnerabilities_without_a_package_name_are_skipped() {
    let store = MemMatcherStore::new();
    let mut nameless = vulnerability("upd", "CVE-1", "");
    nameless.package.as_mut().unwrap().name.clear();

    store
        .update_vulnerabilities(
            "upd",
            "fp",
            &[nameless, vulnerability("upd", "CVE-2", "openssl")],
        )
        .await
        .unwrap();
    assert_eq!(store.vulnerability_count().await, 1);
}

#[tokio::test]
async fn version_filtering_uses_the_ten_component_order() {
    let store = MemMatcherStore::new();
    let mut vuln = vulnerability("upd", "CVE-1", "openssl");
    vuln.range = Some(VersionRange {
        lower: NormalizedVersion::new("semver", [1, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
        upper: NormalizedVersion::new("semver", [2, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
    });
    store
        .update_vulnerabilities("upd", "fp", &[vuln])
        .await
        .unwrap();

    let opts = GetOpts {
        matchers: vec![],
        version_filtering: true,
    };

    let mut inside = record_for("openssl", 1);
    inside.package.as_mut().unwrap().normalized_version = Some(NormalizedVersion::new(
        "semver",
        [1, 5, 0, 0, 0, 0, 0, 0, 0, 0],
    ));
    let results = store.get(std::slice::from_ref(&inside), &opts).await.unwrap();
    assert_eq!(results[&1].len(), 1);

    let mut outside = record_for("openssl", 2);
    outside.package.as_mut().unwrap().normalized_version = Some(NormalizedVersion::new(
        "semver",
        [2, 0, 0, 0, 0, 0, 0, 0, 0, 1],
    ));
    let results = store.get(std::slice::from_ref(&outside), &opts).await.unwrap();
    assert!(results[&2].is_empty());
}

#[tokio::test]
async fn source_name_constraint_matches_through_the_source() {
    let store = MemMatcherStore::new();
    store
        .update_vulnerabilities("upd", "fp", &[vulnerability("upd", "CVE-1", "foo-src")])
        .await
        .unwrap();

    let mut record = record_for("foo-src", 3);
    {
        let pkg = record.package.as_mut().unwrap();
        pkg.name = "foo-bin".to_string();
        pkg.source = Some(Box::new(package("foo-src", "1.0.0")));
    }

    // With only the mandatory package-name constraint the binary name
    // misses; adding the source-name constraint cannot resurrect it
    // because both constraints apply.
    let opts = GetOpts {
        matchers: vec![MatchConstraint::PackageSourceName],
        version_filtering: false,
    };
    let results = store.get(std::slice::from_ref(&record), &opts).await.unwrap();
    assert!(results[&3].is_empty());

    // A record whose package name is the source name matches directly.
    let record = record_for("foo-src", 4);
    let results = store
        .get(std::slice::from_ref(&record), &GetOpts::default())
        .await
        .unwrap();
    assert_eq!(results[&4].len(), 1);
}

#[rstest]
#[case::keeps_newest_five(60, 5, 5)]
#[case::everything_eligible_at_zero(60, 0, 10)]
#[tokio::test]
async fn gc_is_throttled_and_converges(
    #[case] operations: usize,
    #[case] keep: usize,
    #[case] expected_first_round: i64,
) {
    let store = MemMatcherStore::new();
    for i in 0..operations {
        store
            .update_vulnerabilities(
                "upd",
                &format!("fp{i}"),
                &[vulnerability("upd", &format!("CVE-{i}"), "openssl")],
            )
            .await
            .unwrap();
    }

    // First round: eligible = operations - keep, fifty die, the rest is
    // the return value.
    let remaining = store.gc(keep).await.unwrap();
    assert_eq!(remaining, expected_first_round);

    let mut rounds = 0;
    let mut last = remaining;
    while last > 0 {
        last = store.gc(keep).await.unwrap();
        rounds += 1;
        assert!(rounds < 10, "gc must converge");
    }
    assert_eq!(store.gc(keep).await.unwrap(), 0);
    assert_eq!(store.operation_count().await, keep);
}

#[tokio::test]
async fn gc_sweeps_orphaned_vulnerabilities() {
    let store = MemMatcherStore::new();
    for i in 0..3 {
        store
            .update_vulnerabilities(
                "upd",
                &format!("fp{i}"),
                &[vulnerability("upd", &format!("CVE-{i}"), "openssl")],
            )
            .await
            .unwrap();
    }
    assert_eq!(store.vulnerability_count().await, 3);

    while store.gc(1).await.unwrap() > 0 {}
    // Only the newest operation's vulnerability survives.
    assert_eq!(store.operation_count().await, 1);
    assert_eq!(store.vulnerability_count().await, 1);
}

#[tokio::test]
async fn diff_is_antisymmetric() {
    let store = MemMatcherStore::new();
    let a = store
        .update_vulnerabilities(
            "upd",
            "fpa",
            &[
                vulnerability("upd", "CVE-1", "openssl"),
                vulnerability("upd", "CVE-2", "openssl"),
            ],
        )
        .await
        .unwrap();
    let b = store
        .update_vulnerabilities(
            "upd",
            "fpb",
            &[
                vulnerability("upd", "CVE-2", "openssl"),
                vulnerability("upd", "CVE-3", "openssl"),
            ],
        )
        .await
        .unwrap();

    let forward = store.get_update_diff(Some(a), b).await.unwrap();
    let backward = store.get_update_diff(Some(b), a).await.unwrap();

    let names = |vulns: &[vulnstore::domain::Vulnerability]| {
        let mut names: Vec<String> = vulns.iter().map(|v| v.name.clone()).collect();
        names.sort();
        names
    };
    assert_eq!(names(&forward.added), vec!["CVE-3"]);
    assert_eq!(names(&forward.removed), vec!["CVE-1"]);
    assert_eq!(names(&forward.added), names(&backward.removed));
    assert_eq!(names(&forward.removed), names(&backward.added));
}

#[tokio::test]
async fn initial_diff_has_no_previous_side() {
    let store = MemMatcherStore::new();
    let reference = store
        .update_vulnerabilities("upd", "fp", &[vulnerability("upd", "CVE-1", "openssl")])
        .await
        .unwrap();

    let diff = store.get_update_diff(None, reference).await.unwrap();
    assert!(diff.prev.is_none());
    assert_eq!(diff.added.len(), 1);
    assert!(diff.removed.is_empty());

    let unknown = uuid::Uuid::new_v4();
    assert!(store.get_update_diff(None, unknown).await.is_err());
}

#[tokio::test]
async fn delta_updates_carry_the_previous_snapshot() {
    let store = MemMatcherStore::new();
    store
        .update_vulnerabilities(
            "upd",
            "fp1",
            &[
                vulnerability("upd", "CVE-1", "openssl"),
                vulnerability("upd", "CVE-2", "zlib"),
                vulnerability("upd", "CVE-3", "bash"),
            ],
        )
        .await
        .unwrap();

    // CVE-1 is replaced by content, CVE-2 deleted by name, CVE-3 carried.
    let mut replacement = vulnerability("upd", "CVE-1", "openssl");
    replacement.fixed_in_version = "9.9.9".to_string();
    store
        .delta_update_vulnerabilities(
            "upd",
            "fp2",
            &[replacement],
            &["CVE-2".to_string()],
        )
        .await
        .unwrap();

    let opts = GetOpts::default();
    let records = [
        record_for("openssl", 1),
        record_for("zlib", 2),
        record_for("bash", 3),
    ];
    let results = store.get(&records, &opts).await.unwrap();
    assert_eq!(results[&1].len(), 1);
    assert_eq!(results[&1][0].fixed_in_version, "9.9.9");
    assert!(results[&2].is_empty());
    assert_eq!(results[&3].len(), 1);
}

#[tokio::test]
async fn enrichment_ingest_streams_and_joins_on_tags() {
    let store = MemMatcherStore::new();
    let records: Vec<EnrichmentRecord> = (0..5)
        .map(|i| EnrichmentRecord {
            tags: vec![format!("CVE-{i}")],
            enrichment: serde_json::json!({"score": i}),
        })
        .collect();

    store
        .update_enrichments_iter(
            "enricher",
            "fp",
            futures::stream::iter(records.clone()).boxed(),
        )
        .await
        .unwrap();

    let found = store
        .get_enrichment("enricher", &["CVE-3".to_string()])
        .await
        .unwrap();
    assert_eq!(found, vec![records[3].clone()]);

    let none = store
        .get_enrichment("enricher", &["CVE-9".to_string()])
        .await
        .unwrap();
    assert!(none.is_empty());

    // Unknown enrichers have no snapshot at all.
    let none = store
        .get_enrichment("nobody", &["CVE-3".to_string()])
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn initialized_latches_after_first_content() {
    let store = MemMatcherStore::new();
    assert!(!store.initialized().await.unwrap());

    let reference = store
        .update_vulnerabilities("upd", "fp", &[vulnerability("upd", "CVE-1", "openssl")])
        .await
        .unwrap();
    assert!(store.initialized().await.unwrap());

    // Even after the corpus empties again, the latch holds for the
    // process lifetime.
    store.delete_update_operations(&[reference]).await.unwrap();
    while store.gc(0).await.unwrap() > 0 {}
    assert!(store.initialized().await.unwrap());
}

#[tokio::test]
async fn updater_status_has_success_and_failure_paths() {
    let store = MemMatcherStore::new();
    let now = chrono::Utc::now();

    store
        .record_updater_status("upd/ubuntu", now, "fp1", None)
        .await
        .unwrap();
    let status = store.updater_status("upd/ubuntu").await.unwrap();
    assert!(status.last_run_succeeded);
    assert_eq!(status.last_success, Some(now));
    assert_eq!(status.last_error, None);

    store
        .record_updater_status("upd/ubuntu", now, "fp2", Some("fetch failed"))
        .await
        .unwrap();
    let status = store.updater_status("upd/ubuntu").await.unwrap();
    assert!(!status.last_run_succeeded);
    assert_eq!(status.last_error.as_deref(), Some("fetch failed"));
    assert_eq!(status.last_success, Some(now), "success timestamp survives");

    // Set-level success touches every updater sharing the prefix.
    let later = now + chrono::Duration::minutes(5);
    store.record_updater_set_status("upd", later).await.unwrap();
    let status = store.updater_status("upd/ubuntu").await.unwrap();
    assert!(status.last_run_succeeded);
    assert_eq!(status.last_success, Some(later));
}

#[tokio::test]
async fn get_update_operations_enumerates_updaters_when_unfiltered() {
    let store = MemMatcherStore::new();
    for updater in ["alpha", "beta"] {
        store
            .update_vulnerabilities(updater, "fp", &[vulnerability(updater, "CVE-1", "pkg")])
            .await
            .unwrap();
    }

    let all = store
        .get_update_operations(UpdateKind::Vulnerability, &[])
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let filtered = store
        .get_update_operations(UpdateKind::Vulnerability, &["alpha".to_string()])
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert!(filtered.contains_key("alpha"));

    // Enrichment operations do not leak into the vulnerability listing.
    assert!(
        store
            .get_update_operations(UpdateKind::Enrichment, &[])
            .await
            .unwrap()
            .is_empty()
    );
}
