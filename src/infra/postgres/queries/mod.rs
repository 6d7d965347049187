use tracing::Span;

/// A named SQL template plus the metadata stamped onto its query span.
/// Templates live under `queries/<subsystem>/` as `<method>_<step>.sql`,
/// with `helper_<type>_<step>.sql` for the generic per-artifact helpers.
pub(crate) struct Query {
    pub name: &'static str,
    pub sql: &'static str,
    pub table: &'static str,
    pub operation: &'static str,
}

impl Query {
    /// The single-statement scope: a span carrying the table and operation
    /// attributes, entered for exactly one execution of this template.
    pub fn span(&self) -> Span {
        tracing::debug_span!(
            "query",
            query = self.name,
            db.system = "postgresql",
            db.sql.table = self.table,
            db.operation = self.operation,
            db.statement = self.sql,
        )
    }
}

macro_rules! indexer_query {
    ($name:literal, $table:literal, $operation:literal) => {
        Query {
            name: $name,
            sql: include_str!(concat!("indexer/", $name, ".sql")),
            table: $table,
            operation: $operation,
        }
    };
}

macro_rules! matcher_query {
    ($name:literal, $table:literal, $operation:literal) => {
        Query {
            name: $name,
            sql: include_str!(concat!("matcher/", $name, ".sql")),
            table: $table,
            operation: $operation,
        }
    };
}

static INDEXER: &[Query] = &[
    indexer_query!("persist_manifest_insert", "manifest", "INSERT"),
    indexer_query!("persist_manifest_select", "manifest", "SELECT"),
    indexer_query!("persist_manifest_layer", "layer", "INSERT"),
    indexer_query!("persist_manifest_assoc", "manifest_layer", "INSERT"),
    indexer_query!("register_scanners_insert", "scanner", "INSERT"),
    indexer_query!("helper_scanner_select", "scanner", "SELECT"),
    indexer_query!("helper_layer_select", "layer", "SELECT"),
    indexer_query!("set_layer_scanned_insert", "scanned_layer", "INSERT"),
    indexer_query!("layer_scanned_select", "scanned_layer", "SELECT"),
    indexer_query!("manifest_scanned_select", "scanned_manifest", "SELECT"),
    indexer_query!("index_packages_insert", "package", "INSERT"),
    indexer_query!("index_packages_assoc", "pkg_scanartifact", "INSERT"),
    indexer_query!("packages_by_layer_select", "pkg_scanartifact", "SELECT"),
    indexer_query!("helper_distribution_insert", "dist", "INSERT"),
    indexer_query!("helper_distribution_assoc", "dist_scanartifact", "INSERT"),
    indexer_query!("helper_distribution_select", "dist_scanartifact", "SELECT"),
    indexer_query!("helper_repository_insert", "repo", "INSERT"),
    indexer_query!("helper_repository_assoc", "repo_scanartifact", "INSERT"),
    indexer_query!("helper_repository_select", "repo_scanartifact", "SELECT"),
    indexer_query!("helper_file_insert", "file", "INSERT"),
    indexer_query!("helper_file_assoc", "file_scanartifact", "INSERT"),
    indexer_query!("helper_file_select", "file_scanartifact", "SELECT"),
    indexer_query!("index_manifest_select", "manifest", "SELECT"),
    indexer_query!("index_manifest_insert", "manifest_index", "INSERT"),
    indexer_query!("set_index_report_upsert", "indexreport", "INSERT"),
    indexer_query!("set_index_finished_scanned", "scanned_manifest", "INSERT"),
    indexer_query!("index_report_select", "indexreport", "SELECT"),
    indexer_query!("delete_manifests_select", "manifest", "SELECT"),
    indexer_query!("delete_manifests_layers", "manifest_layer", "SELECT"),
    indexer_query!("delete_manifests_delete", "manifest", "DELETE"),
    indexer_query!("delete_manifests_layer_cleanup", "layer", "DELETE"),
    indexer_query!("affected_manifests_dist", "dist", "SELECT"),
    indexer_query!("affected_manifests_repo", "repo", "SELECT"),
    indexer_query!("affected_manifests_packages", "package", "SELECT"),
    indexer_query!("affected_manifests_select", "manifest_index", "SELECT"),
];

static MATCHER: &[Query] = &[
    matcher_query!("update_vulnerabilities_create", "update_operation", "INSERT"),
    matcher_query!("update_vulnerabilities_insert", "vuln", "INSERT"),
    matcher_query!("update_vulnerabilities_assoc", "uo_vuln", "INSERT"),
    matcher_query!("delta_update_vulnerabilities_load", "vuln", "SELECT"),
    matcher_query!("update_enrichments_create", "update_operation", "INSERT"),
    matcher_query!("update_enrichments_insert", "enrichment", "INSERT"),
    matcher_query!("update_enrichments_assoc", "uo_enrich", "INSERT"),
    matcher_query!("get_select", "vuln", "SELECT"),
    matcher_query!("get_enrichment_select", "enrichment", "SELECT"),
    matcher_query!("get_update_operations_updaters", "update_operation", "SELECT"),
    matcher_query!("get_update_operations_select", "update_operation", "SELECT"),
    matcher_query!("get_latest_update_ref_select", "latest_update_operations", "SELECT"),
    matcher_query!("get_latest_update_refs_select", "latest_update_operations", "SELECT"),
    matcher_query!("get_update_diff_op", "update_operation", "SELECT"),
    matcher_query!("get_update_diff_added", "vuln", "SELECT"),
    matcher_query!("delete_update_operations_delete", "update_operation", "DELETE"),
    matcher_query!("gc_eligible", "update_operation", "SELECT"),
    matcher_query!("gc_delete", "update_operation", "DELETE"),
    matcher_query!("gc_orphans", "vuln", "DELETE"),
    matcher_query!("initialized_select", "vuln", "SELECT"),
    matcher_query!("record_updater_status_success", "updater_status", "INSERT"),
    matcher_query!("record_updater_status_failure", "updater_status", "INSERT"),
    matcher_query!("record_updater_set_status_update", "updater_status", "UPDATE"),
];

fn lookup(registry: &'static [Query], name: &str) -> &'static Query {
    registry
        .iter()
        .find(|q| q.name == name)
        .unwrap_or_else(|| panic!("unknown query template: {name}"))
}

/// Panics on an unknown name: template names are compile-time constants and
/// the registry is covered by tests.
pub(crate) fn indexer(name: &str) -> &'static Query {
    lookup(INDEXER, name)
}

pub(crate) fn matcher(name: &str) -> &'static Query {
    lookup(MATCHER, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    #[test]
    fn registry_names_are_unique() {
        for registry in [INDEXER, MATCHER] {
            let unique = registry.iter().map(|q| q.name).unique().count();
            assert_eq!(unique, registry.len());
        }
    }

    #[test]
    fn templates_are_single_terminated_statements() {
        for q in INDEXER.iter().chain(MATCHER) {
            let sql = q.sql.trim();
            assert!(!sql.is_empty(), "{} is empty", q.name);
            assert!(sql.ends_with(';'), "{} is unterminated", q.name);
            assert_eq!(
                sql.matches(';').count(),
                1,
                "{} holds more than one statement",
                q.name
            );
        }
    }

    #[test]
    fn metadata_is_present() {
        for q in INDEXER.iter().chain(MATCHER) {
            assert!(!q.table.is_empty(), "{} has no table", q.name);
            assert!(
                ["SELECT", "INSERT", "UPDATE", "DELETE"].contains(&q.operation),
                "{} has operation {}",
                q.name,
                q.operation
            );
        }
    }

    #[test]
    fn helper_templates_exist_for_every_generic_artifact() {
        for artifact in ["distribution", "repository", "file"] {
            for step in ["insert", "assoc", "select"] {
                indexer(&format!("helper_{artifact}_{step}"));
            }
        }
    }

    #[test]
    #[should_panic(expected = "unknown query template")]
    fn unknown_names_panic() {
        indexer("no_such_template");
    }
}
