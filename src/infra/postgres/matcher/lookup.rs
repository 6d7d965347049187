use std::collections::HashMap;

use tracing::Instrument;

use crate::app::{GetOpts, MatchConstraint};
use crate::domain::{EnrichmentRecord, IndexRecord, Vulnerability};

use super::PostgresMatcherStore;
use super::super::codec;
use super::super::observe::MethodError;
use super::super::queries;

/// The twelve constraint slots of `get_select.sql`, in parameter order
/// after the mandatory package name. An inactive slot binds NULL and its
/// predicate collapses to true.
const SLOTS: [MatchConstraint; 11] = [
    MatchConstraint::PackageSourceName,
    MatchConstraint::PackageModule,
    MatchConstraint::DistributionDid,
    MatchConstraint::DistributionName,
    MatchConstraint::DistributionVersion,
    MatchConstraint::DistributionVersionId,
    MatchConstraint::DistributionVersionCodeName,
    MatchConstraint::DistributionArch,
    MatchConstraint::DistributionCpe,
    MatchConstraint::DistributionPrettyName,
    MatchConstraint::RepositoryName,
];

fn slot_value(record: &IndexRecord, constraint: MatchConstraint) -> String {
    let package = record.package.as_ref();
    let dist = record.distribution.as_ref();
    let repo = record.repository.as_ref();
    match constraint {
        MatchConstraint::PackageName => {
            package.map(|p| p.name.clone()).unwrap_or_default()
        }
        MatchConstraint::PackageSourceName => package
            .and_then(|p| p.source.as_deref())
            .map(|s| s.name.clone())
            .unwrap_or_default(),
        MatchConstraint::PackageModule => {
            package.map(|p| p.module.clone()).unwrap_or_default()
        }
        MatchConstraint::DistributionDid => dist.map(|d| d.did.clone()).unwrap_or_default(),
        MatchConstraint::DistributionName => dist.map(|d| d.name.clone()).unwrap_or_default(),
        MatchConstraint::DistributionVersion => {
            dist.map(|d| d.version.clone()).unwrap_or_default()
        }
        MatchConstraint::DistributionVersionId => {
            dist.map(|d| d.version_id.clone()).unwrap_or_default()
        }
        MatchConstraint::DistributionVersionCodeName => {
            dist.map(|d| d.version_code_name.clone()).unwrap_or_default()
        }
        MatchConstraint::DistributionArch => dist.map(|d| d.arch.clone()).unwrap_or_default(),
        MatchConstraint::DistributionCpe => dist
            .map(|d| codec::cpe_to_wire(&d.cpe).to_string())
            .unwrap_or_default(),
        MatchConstraint::DistributionPrettyName => {
            dist.map(|d| d.pretty_name.clone()).unwrap_or_default()
        }
        MatchConstraint::RepositoryName => repo.map(|r| r.name.clone()).unwrap_or_default(),
    }
}

impl PostgresMatcherStore {
    pub(super) async fn get_inner(
        &self,
        records: &[IndexRecord],
        opts: &GetOpts,
    ) -> Result<HashMap<i64, Vec<Vulnerability>>, MethodError> {
        let matchers = opts.normalized_matchers();
        let q = queries::matcher("get_select");

        // One connection for the whole batch so the prepared statement is
        // reused across records.
        let mut conn = self.pool().acquire().await?;

        let mut results: HashMap<i64, Vec<Vulnerability>> = HashMap::new();
        for record in records {
            let Some(package) = record.package.as_ref() else {
                tracing::debug!("skipping index record with no package");
                continue;
            };

            let mut query = sqlx::query(q.sql).bind(package.name.clone());
            for slot in SLOTS {
                if matchers.contains(&slot) {
                    query = query.bind(Some(slot_value(record, slot)));
                } else {
                    query = query.bind(None::<String>);
                }
            }
            let (version_kind, version) = if opts.version_filtering {
                codec::version_to_wire(&package.normalized_version)
            } else {
                (None, None)
            };
            query = query.bind(version_kind.map(str::to_string)).bind(version);

            let rows = query.fetch_all(&mut *conn).instrument(q.span()).await?;

            // Group by package id: the bucket is set before reading the
            // record's rows, so an empty result still shows up as a key.
            let bucket = results.entry(package.id).or_default();
            for row in &rows {
                bucket.push(codec::vulnerability_from_row(row)?);
            }
        }
        Ok(results)
    }

    pub(super) async fn get_enrichment_inner(
        &self,
        kind: &str,
        tags: &[String],
    ) -> Result<Vec<EnrichmentRecord>, MethodError> {
        let q = queries::matcher("get_enrichment_select");
        let rows: Vec<(Vec<String>, serde_json::Value)> = sqlx::query_as(q.sql)
            .bind(kind)
            .bind(tags)
            .fetch_all(self.pool())
            .instrument(q.span())
            .await?;
        Ok(rows
            .into_iter()
            .map(|(tags, enrichment)| EnrichmentRecord { tags, enrichment })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Distribution, Package};

    #[test]
    fn slot_values_read_the_matching_record_field() {
        let record = IndexRecord {
            package: Some(Package {
                name: "openssl".to_string(),
                module: "security".to_string(),
                source: Some(Box::new(Package {
                    name: "openssl-src".to_string(),
                    ..Default::default()
                })),
                ..Default::default()
            }),
            distribution: Some(Distribution {
                did: "debian".to_string(),
                pretty_name: "Debian GNU/Linux 12".to_string(),
                ..Default::default()
            }),
            repository: None,
        };

        assert_eq!(slot_value(&record, MatchConstraint::PackageName), "openssl");
        assert_eq!(
            slot_value(&record, MatchConstraint::PackageSourceName),
            "openssl-src"
        );
        assert_eq!(slot_value(&record, MatchConstraint::PackageModule), "security");
        assert_eq!(slot_value(&record, MatchConstraint::DistributionDid), "debian");
        assert_eq!(
            slot_value(&record, MatchConstraint::DistributionPrettyName),
            "Debian GNU/Linux 12"
        );
        // Absent sides read as empty, never panic.
        assert_eq!(slot_value(&record, MatchConstraint::RepositoryName), "");
    }

    #[test]
    fn every_slot_is_distinct() {
        let mut seen = std::collections::HashSet::new();
        for slot in SLOTS {
            assert!(seen.insert(slot));
        }
        assert!(!SLOTS.contains(&MatchConstraint::PackageName));
    }
}
