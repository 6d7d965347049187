use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::app::{GetOpts, MatchConstraint, MatchError, MatcherStore};
use crate::domain::{
    EnrichmentRecord, IndexRecord, UpdateDiff, UpdateKind, UpdateOperation, UpdaterStatus,
    Vulnerability,
};

/// In-memory [`MatcherStore`] mirroring the PostgreSQL adapter's
/// semantics: content-hash dedup, snapshot publication, the GC throttle.
/// The snapshot "refresh" is synchronous and never fails, so readers here
/// are simply always up to date.
#[derive(Default)]
pub struct MemMatcherStore {
    state: RwLock<MatcherState>,
    initialized: AtomicBool,
}

#[derive(Default)]
struct MatcherState {
    operations: Vec<OperationRow>,
    next_operation: i64,
    vulns: HashMap<[u8; 16], VulnRow>,
    next_vuln: i64,
    uo_vuln: HashSet<(i64, [u8; 16])>,
    enrichments: HashMap<[u8; 16], EnrichmentRow>,
    uo_enrich: HashSet<(i64, [u8; 16])>,
    /// The published snapshot: newest operation id per (updater, kind).
    latest: HashMap<(String, UpdateKind), i64>,
    statuses: HashMap<String, UpdaterStatus>,
}

#[derive(Clone)]
struct OperationRow {
    id: i64,
    operation: UpdateOperation,
}

#[derive(Clone)]
struct VulnRow {
    id: i64,
    vulnerability: Vulnerability,
}

#[derive(Clone)]
struct EnrichmentRow {
    record: EnrichmentRecord,
}

const GC_THROTTLE: usize = 50;

impl MatcherState {
    fn create_operation(
        &mut self,
        updater: &str,
        fingerprint: &str,
        kind: UpdateKind,
    ) -> (i64, Uuid) {
        self.next_operation += 1;
        let id = self.next_operation;
        let reference = Uuid::new_v4();
        self.operations.push(OperationRow {
            id,
            operation: UpdateOperation {
                reference,
                updater: updater.to_string(),
                fingerprint: fingerprint.to_string(),
                kind,
                date: Utc::now(),
            },
        });
        (id, reference)
    }

    fn refresh_latest(&mut self) {
        self.latest.clear();
        for row in &self.operations {
            let key = (row.operation.updater.clone(), row.operation.kind);
            let entry = self.latest.entry(key).or_insert(row.id);
            if row.id > *entry {
                *entry = row.id;
            }
        }
    }

    fn latest_operation_ids(&self, kind: UpdateKind) -> HashSet<i64> {
        self.latest
            .iter()
            .filter(|((_, k), _)| *k == kind)
            .map(|(_, id)| *id)
            .collect()
    }

    fn insert_vulnerability(&mut self, operation_id: i64, vulnerability: &Vulnerability) {
        let hash = vulnerability.content_digest();
        if !self.vulns.contains_key(&hash) {
            self.next_vuln += 1;
            let mut stored = vulnerability.clone();
            stored.id = self.next_vuln;
            self.vulns.insert(
                hash,
                VulnRow {
                    id: self.next_vuln,
                    vulnerability: stored,
                },
            );
        }
        self.uo_vuln.insert((operation_id, hash));
    }

    fn operation_vuln_hashes(&self, operation_id: i64) -> HashSet<[u8; 16]> {
        self.uo_vuln
            .iter()
            .filter(|(op, _)| *op == operation_id)
            .map(|(_, hash)| *hash)
            .collect()
    }
}

fn matches_constraint(
    vulnerability: &Vulnerability,
    record: &IndexRecord,
    constraint: MatchConstraint,
) -> bool {
    let vuln_pkg_name = vulnerability
        .package
        .as_ref()
        .map(|p| p.name.as_str())
        .unwrap_or("");
    let vuln_pkg_module = vulnerability
        .package
        .as_ref()
        .map(|p| p.module.as_str())
        .unwrap_or("");
    let dist = record.distribution.as_ref();
    let vdist = vulnerability.dist.clone().unwrap_or_default();
    match constraint {
        MatchConstraint::PackageName => {
            record.package.as_ref().map(|p| p.name.as_str()).unwrap_or("") == vuln_pkg_name
        }
        MatchConstraint::PackageSourceName => {
            record
                .package
                .as_ref()
                .and_then(|p| p.source.as_deref())
                .map(|s| s.name.as_str())
                .unwrap_or("")
                == vuln_pkg_name
        }
        MatchConstraint::PackageModule => {
            record.package.as_ref().map(|p| p.module.as_str()).unwrap_or("") == vuln_pkg_module
        }
        MatchConstraint::DistributionDid => {
            dist.map(|d| d.did.as_str()).unwrap_or("") == vdist.did
        }
        MatchConstraint::DistributionName => {
            dist.map(|d| d.name.as_str()).unwrap_or("") == vdist.name
        }
        MatchConstraint::DistributionVersion => {
            dist.map(|d| d.version.as_str()).unwrap_or("") == vdist.version
        }
        MatchConstraint::DistributionVersionId => {
            dist.map(|d| d.version_id.as_str()).unwrap_or("") == vdist.version_id
        }
        MatchConstraint::DistributionVersionCodeName => {
            dist.map(|d| d.version_code_name.as_str()).unwrap_or("") == vdist.version_code_name
        }
        MatchConstraint::DistributionArch => {
            dist.map(|d| d.arch.as_str()).unwrap_or("") == vdist.arch
        }
        MatchConstraint::DistributionCpe => {
            let record_cpe = dist
                .and_then(|d| d.cpe.as_ref())
                .map(|c| c.as_str())
                .unwrap_or("");
            let vuln_cpe = vdist.cpe.as_ref().map(|c| c.as_str()).unwrap_or("");
            record_cpe == vuln_cpe
        }
        MatchConstraint::DistributionPrettyName => {
            dist.map(|d| d.pretty_name.as_str()).unwrap_or("") == vdist.pretty_name
        }
        MatchConstraint::RepositoryName => {
            let record_repo = record
                .repository
                .as_ref()
                .map(|r| r.name.as_str())
                .unwrap_or("");
            let vuln_repo = vulnerability
                .repo
                .as_ref()
                .map(|r| r.name.as_str())
                .unwrap_or("");
            record_repo == vuln_repo
        }
    }
}

fn version_in_range(vulnerability: &Vulnerability, record: &IndexRecord) -> bool {
    let Some(range) = &vulnerability.range else {
        return false;
    };
    let Some(version) = record
        .package
        .as_ref()
        .and_then(|p| p.normalized_version.as_ref())
    else {
        return false;
    };
    range.contains(version)
}

impl MemMatcherStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-run bookkeeping for one updater; test hook.
    pub async fn updater_status(&self, updater: &str) -> Option<UpdaterStatus> {
        let state = self.state.read().await;
        state.statuses.get(updater).cloned()
    }

    /// Distinct vulnerability rows in the corpus; test hook for the
    /// content-address dedup property.
    pub async fn vulnerability_count(&self) -> usize {
        self.state.read().await.vulns.len()
    }

    /// Update operations currently recorded; test hook.
    pub async fn operation_count(&self) -> usize {
        self.state.read().await.operations.len()
    }

    async fn ingest_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &str,
        vulnerabilities: &[Vulnerability],
        carried: &[[u8; 16]],
    ) -> Result<Uuid, MatchError> {
        if updater.is_empty() {
            return Err(MatchError::Validation("updater name is empty".to_string()));
        }
        let mut state = self.state.write().await;
        let (operation_id, reference) =
            state.create_operation(updater, fingerprint, UpdateKind::Vulnerability);
        for vulnerability in vulnerabilities {
            if vulnerability
                .package
                .as_ref()
                .is_none_or(|p| p.name.is_empty())
            {
                continue;
            }
            state.insert_vulnerability(operation_id, vulnerability);
        }
        for hash in carried {
            state.uo_vuln.insert((operation_id, *hash));
        }
        state.refresh_latest();
        Ok(reference)
    }
}

#[async_trait::async_trait]
impl MatcherStore for MemMatcherStore {
    async fn update_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &str,
        vulnerabilities: &[Vulnerability],
    ) -> Result<Uuid, MatchError> {
        self.ingest_vulnerabilities(updater, fingerprint, vulnerabilities, &[])
            .await
    }

    async fn delta_update_vulnerabilities(
        &self,
        updater: &str,
        fingerprint: &str,
        vulnerabilities: &[Vulnerability],
        deleted_names: &[String],
    ) -> Result<Uuid, MatchError> {
        let carried: Vec<[u8; 16]> = {
            let state = self.state.read().await;
            let hidden: HashSet<&str> = deleted_names
                .iter()
                .map(String::as_str)
                .chain(vulnerabilities.iter().map(|v| v.name.as_str()))
                .collect();
            state
                .latest
                .get(&(updater.to_string(), UpdateKind::Vulnerability))
                .map(|operation_id| {
                    state
                        .operation_vuln_hashes(*operation_id)
                        .into_iter()
                        .filter(|hash| {
                            state
                                .vulns
                                .get(hash)
                                .is_some_and(|row| !hidden.contains(row.vulnerability.name.as_str()))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        self.ingest_vulnerabilities(updater, fingerprint, vulnerabilities, &carried)
            .await
    }

    async fn update_enrichments(
        &self,
        updater: &str,
        fingerprint: &str,
        records: &[EnrichmentRecord],
    ) -> Result<Uuid, MatchError> {
        self.update_enrichments_iter(
            updater,
            fingerprint,
            Box::pin(futures::stream::iter(records.to_vec())),
        )
        .await
    }

    async fn update_enrichments_iter<'a>(
        &self,
        updater: &str,
        fingerprint: &str,
        mut records: BoxStream<'a, EnrichmentRecord>,
    ) -> Result<Uuid, MatchError> {
        if updater.is_empty() {
            return Err(MatchError::Validation("updater name is empty".to_string()));
        }
        let mut state = self.state.write().await;
        let (operation_id, reference) =
            state.create_operation(updater, fingerprint, UpdateKind::Enrichment);
        while let Some(record) = records.next().await {
            let hash = record.content_digest();
            state
                .enrichments
                .entry(hash)
                .or_insert_with(|| EnrichmentRow { record });
            state.uo_enrich.insert((operation_id, hash));
        }
        state.refresh_latest();
        Ok(reference)
    }

    async fn get(
        &self,
        records: &[IndexRecord],
        opts: &GetOpts,
    ) -> Result<HashMap<i64, Vec<Vulnerability>>, MatchError> {
        let matchers = opts.normalized_matchers();
        let state = self.state.read().await;
        let published = state.latest_operation_ids(UpdateKind::Vulnerability);
        let visible_hashes: HashSet<[u8; 16]> = state
            .uo_vuln
            .iter()
            .filter(|(op, _)| published.contains(op))
            .map(|(_, hash)| *hash)
            .collect();

        let mut results: HashMap<i64, Vec<Vulnerability>> = HashMap::new();
        for record in records {
            let Some(package) = record.package.as_ref() else {
                continue;
            };
            let bucket = results.entry(package.id).or_default();
            let mut rows: Vec<&VulnRow> = visible_hashes
                .iter()
                .filter_map(|hash| state.vulns.get(hash))
                .collect();
            rows.sort_by_key(|row| row.id);
            for row in rows {
                let matched = matchers
                    .iter()
                    .all(|c| matches_constraint(&row.vulnerability, record, *c))
                    && (!opts.version_filtering || version_in_range(&row.vulnerability, record));
                if matched && !bucket.contains(&row.vulnerability) {
                    bucket.push(row.vulnerability.clone());
                }
            }
        }
        Ok(results)
    }

    async fn get_enrichment(
        &self,
        kind: &str,
        tags: &[String],
    ) -> Result<Vec<EnrichmentRecord>, MatchError> {
        let state = self.state.read().await;
        let Some(operation_id) = state
            .latest
            .get(&(kind.to_string(), UpdateKind::Enrichment))
        else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (op, hash) in &state.uo_enrich {
            if op != operation_id {
                continue;
            }
            if let Some(row) = state.enrichments.get(hash)
                && row.record.tags.iter().any(|t| tags.contains(t))
            {
                out.push(row.record.clone());
            }
        }
        Ok(out)
    }

    async fn get_update_operations(
        &self,
        kind: UpdateKind,
        updaters: &[String],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>, MatchError> {
        let state = self.state.read().await;
        let mut out: HashMap<String, Vec<UpdateOperation>> = HashMap::new();
        let mut rows: Vec<&OperationRow> = state
            .operations
            .iter()
            .filter(|row| row.operation.kind == kind)
            .filter(|row| updaters.is_empty() || updaters.contains(&row.operation.updater))
            .collect();
        // Most recent first.
        rows.sort_by_key(|row| std::cmp::Reverse(row.id));
        for row in rows {
            out.entry(row.operation.updater.clone())
                .or_default()
                .push(row.operation.clone());
        }
        Ok(out)
    }

    async fn get_latest_update_ref(&self, kind: UpdateKind) -> Result<Option<Uuid>, MatchError> {
        let state = self.state.read().await;
        let newest = state
            .latest_operation_ids(kind)
            .into_iter()
            .max();
        Ok(newest.and_then(|id| {
            state
                .operations
                .iter()
                .find(|row| row.id == id)
                .map(|row| row.operation.reference)
        }))
    }

    async fn get_latest_update_refs(
        &self,
        kind: UpdateKind,
    ) -> Result<HashMap<String, Uuid>, MatchError> {
        let state = self.state.read().await;
        let mut out = HashMap::new();
        for ((updater, k), id) in &state.latest {
            if *k != kind {
                continue;
            }
            if let Some(row) = state.operations.iter().find(|row| row.id == *id) {
                out.insert(updater.clone(), row.operation.reference);
            }
        }
        Ok(out)
    }

    async fn get_update_diff(
        &self,
        prev: Option<Uuid>,
        cur: Uuid,
    ) -> Result<UpdateDiff, MatchError> {
        fn find(state: &MatcherState, reference: Uuid) -> Result<&OperationRow, MatchError> {
            state
                .operations
                .iter()
                .find(|row| row.operation.reference == reference)
                .ok_or_else(|| {
                    MatchError::Validation(format!("unknown update operation: {reference}"))
                })
        }

        let state = self.state.read().await;
        let cur_row = find(&state, cur)?;
        let prev_row = match prev {
            Some(reference) => Some(find(&state, reference)?),
            None => None,
        };

        let cur_hashes = state.operation_vuln_hashes(cur_row.id);
        let prev_hashes = prev_row
            .map(|row| state.operation_vuln_hashes(row.id))
            .unwrap_or_default();

        let materialize = |hashes: Vec<&[u8; 16]>| -> Vec<Vulnerability> {
            let mut rows: Vec<&VulnRow> = hashes
                .into_iter()
                .filter_map(|hash| state.vulns.get(hash))
                .collect();
            rows.sort_by_key(|row| row.id);
            rows.into_iter().map(|row| row.vulnerability.clone()).collect()
        };

        Ok(UpdateDiff {
            prev: prev_row.map(|row| row.operation.clone()),
            cur: cur_row.operation.clone(),
            added: materialize(cur_hashes.difference(&prev_hashes).collect()),
            removed: materialize(prev_hashes.difference(&cur_hashes).collect()),
        })
    }

    async fn delete_update_operations(&self, refs: &[Uuid]) -> Result<i64, MatchError> {
        let mut state = self.state.write().await;
        let doomed: HashSet<i64> = state
            .operations
            .iter()
            .filter(|row| refs.contains(&row.operation.reference))
            .map(|row| row.id)
            .collect();
        state.operations.retain(|row| !doomed.contains(&row.id));
        state.uo_vuln.retain(|(op, _)| !doomed.contains(op));
        state.uo_enrich.retain(|(op, _)| !doomed.contains(op));
        state.refresh_latest();
        Ok(doomed.len() as i64)
    }

    async fn gc(&self, keep: usize) -> Result<i64, MatchError> {
        let mut state = self.state.write().await;

        // Rank operations per (updater, kind), newest first; everything
        // past `keep` is eligible.
        let mut by_updater: HashMap<(String, UpdateKind), Vec<i64>> = HashMap::new();
        for row in &state.operations {
            by_updater
                .entry((row.operation.updater.clone(), row.operation.kind))
                .or_default()
                .push(row.id);
        }
        let mut eligible: Vec<(i64, String)> = Vec::new();
        for ((updater, _), mut ids) in by_updater {
            ids.sort_by_key(|id| std::cmp::Reverse(*id));
            for id in ids.into_iter().skip(keep) {
                eligible.push((id, updater.clone()));
            }
        }
        eligible.sort_by_key(|(id, _)| *id);
        if eligible.is_empty() {
            return Ok(0);
        }

        let total = eligible.len();
        let chosen = &eligible[..total.min(GC_THROTTLE)];
        let doomed: HashSet<i64> = chosen.iter().map(|(id, _)| *id).collect();
        let touched: HashSet<String> = chosen.iter().map(|(_, u)| u.clone()).collect();

        state.operations.retain(|row| !doomed.contains(&row.id));
        state.uo_vuln.retain(|(op, _)| !doomed.contains(op));
        state.uo_enrich.retain(|(op, _)| !doomed.contains(op));

        let referenced: HashSet<[u8; 16]> =
            state.uo_vuln.iter().map(|(_, hash)| *hash).collect();
        state.vulns.retain(|hash, row| {
            referenced.contains(hash) || !touched.contains(&row.vulnerability.updater)
        });

        state.refresh_latest();
        Ok((total - chosen.len()) as i64)
    }

    async fn initialized(&self) -> Result<bool, MatchError> {
        if self.initialized.load(Ordering::Relaxed) {
            return Ok(true);
        }
        let state = self.state.read().await;
        let initialized = !state.vulns.is_empty();
        if initialized {
            self.initialized.store(true, Ordering::Relaxed);
        }
        Ok(initialized)
    }

    async fn record_updater_status(
        &self,
        updater: &str,
        update_time: DateTime<Utc>,
        fingerprint: &str,
        error: Option<&str>,
    ) -> Result<(), MatchError> {
        if updater.is_empty() {
            return Err(MatchError::Validation("updater name is empty".to_string()));
        }
        let mut state = self.state.write().await;
        let status = state
            .statuses
            .entry(updater.to_string())
            .or_insert_with(|| UpdaterStatus {
                updater_name: updater.to_string(),
                last_attempt: update_time,
                last_success: None,
                last_run_succeeded: false,
                last_attempt_fingerprint: String::new(),
                last_error: None,
            });
        status.last_attempt = update_time;
        status.last_attempt_fingerprint = fingerprint.to_string();
        match error {
            None => {
                status.last_success = Some(update_time);
                status.last_run_succeeded = true;
                status.last_error = None;
            }
            Some(error) => {
                status.last_run_succeeded = false;
                status.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn record_updater_set_status(
        &self,
        updater_set: &str,
        update_time: DateTime<Utc>,
    ) -> Result<(), MatchError> {
        if updater_set.is_empty() {
            return Err(MatchError::Validation(
                "updater set name is empty".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        for status in state
            .statuses
            .values_mut()
            .filter(|s| s.updater_name.starts_with(updater_set))
        {
            status.last_attempt = update_time;
            status.last_success = Some(update_time);
            status.last_run_succeeded = true;
        }
        Ok(())
    }
}
