use sqlx::PgPool;

use super::observe::Subsystem;

/// One schema revision. Revisions apply in order inside their own
/// transactions and are recorded in the subsystem's migration table.
pub(crate) struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

macro_rules! indexer_migration {
    ($version:literal, $name:literal) => {
        Migration {
            version: $version,
            name: $name,
            sql: include_str!(concat!("indexer/", $name, ".sql")),
        }
    };
}

macro_rules! matcher_migration {
    ($version:literal, $name:literal) => {
        Migration {
            version: $version,
            name: $name,
            sql: include_str!(concat!("matcher/", $name, ".sql")),
        }
    };
}

static INDEXER: &[Migration] = &[
    indexer_migration!(1, "01_init"),
    indexer_migration!(2, "02_packages"),
    indexer_migration!(3, "03_dist_repo"),
    indexer_migration!(4, "04_files"),
    indexer_migration!(5, "05_manifest_index"),
    indexer_migration!(6, "06_index_report"),
    indexer_migration!(7, "07_lookup_indexes"),
];

static MATCHER: &[Migration] = &[
    matcher_migration!(1, "01_update_operation"),
    matcher_migration!(2, "02_vuln"),
    matcher_migration!(3, "03_uo_vuln"),
    matcher_migration!(4, "04_latest_view"),
    matcher_migration!(5, "05_enrichment"),
    matcher_migration!(6, "06_updater_status"),
    matcher_migration!(7, "07_vuln_lookup_idx"),
    matcher_migration!(8, "08_assoc_reverse_idx"),
    matcher_migration!(9, "09_update_operation_idx"),
    matcher_migration!(10, "10_enrichment_tags_idx"),
];

/// The schema revision the code in this crate was written against. Opening
/// a store against anything older fails fast.
pub(crate) const INDEXER_MINIMUM: i32 = 7;
pub(crate) const MATCHER_MINIMUM: i32 = 10;

fn plan(subsystem: Subsystem) -> &'static [Migration] {
    match subsystem {
        Subsystem::Indexer => INDEXER,
        Subsystem::Matcher => MATCHER,
    }
}

fn table(subsystem: Subsystem) -> &'static str {
    match subsystem {
        Subsystem::Indexer => "libindex_migrations",
        Subsystem::Matcher => "libvuln_migrations",
    }
}

/// Applies every revision past the recorded maximum. Idempotent.
pub(crate) async fn run(pool: &PgPool, subsystem: Subsystem) -> Result<(), sqlx::Error> {
    let table = table(subsystem);
    sqlx::raw_sql(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            version    INT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );"
    ))
    .execute(pool)
    .await?;

    let current = current_revision(pool, subsystem).await?;
    for migration in plan(subsystem).iter().filter(|m| m.version > current) {
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query(&format!("INSERT INTO {table} (version) VALUES ($1);"))
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(
            subsystem = subsystem.as_str(),
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
    }
    Ok(())
}

/// The recorded `MAX(version)`; zero when the migration table does not
/// exist yet.
pub(crate) async fn current_revision(
    pool: &PgPool,
    subsystem: Subsystem,
) -> Result<i32, sqlx::Error> {
    let table = table(subsystem);
    let (exists,): (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL;")
        .bind(table)
        .fetch_one(pool)
        .await?;
    if !exists {
        return Ok(0);
    }
    let (version,): (i32,) =
        sqlx::query_as(&format!("SELECT COALESCE(MAX(version), 0) FROM {table};"))
            .fetch_one(pool)
            .await?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_are_dense_and_ordered() {
        for (plan, minimum) in [(INDEXER, INDEXER_MINIMUM), (MATCHER, MATCHER_MINIMUM)] {
            for (i, migration) in plan.iter().enumerate() {
                assert_eq!(migration.version, i as i32 + 1);
                assert!(!migration.sql.trim().is_empty());
            }
            assert_eq!(plan.last().unwrap().version, minimum);
        }
    }
}
