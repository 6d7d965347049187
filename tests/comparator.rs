mod common;

use common::{Comparator, MatcherComparator};
use vulnstore::infra::memory::{MemIndexerStore, MemMatcherStore};
use vulnstore::infra::postgres::{
    ConnectConfig, PostgresIndexerStore, PostgresMatcherStore,
};

#[tokio::test]
async fn indexer_reference_implementations_agree() {
    let left = MemIndexerStore::new();
    let right = MemIndexerStore::new();
    Comparator {
        left: &left,
        right: &right,
    }
    .exercise()
    .await;
}

#[tokio::test]
async fn matcher_reference_implementations_agree() {
    let left = MemMatcherStore::new();
    let right = MemMatcherStore::new();
    MatcherComparator {
        left: &left,
        right: &right,
    }
    .exercise()
    .await;
}

fn test_dsn() -> String {
    std::env::var("VULNSTORE_TEST_DSN").expect("VULNSTORE_TEST_DSN must point at a PostgreSQL")
}

#[tokio::test]
#[ignore = "needs a live PostgreSQL via VULNSTORE_TEST_DSN"]
#[serial_test::file_serial]
async fn postgres_indexer_matches_the_reference_implementation() {
    let cfg = ConnectConfig {
        run_migrations: true,
        ..ConnectConfig::new(test_dsn())
    };
    let postgres = PostgresIndexerStore::connect(&cfg, None).await.unwrap();
    let reference = MemIndexerStore::new();
    Comparator {
        left: &postgres,
        right: &reference,
    }
    .exercise()
    .await;
    postgres.close().await;
}

#[tokio::test]
#[ignore = "needs a live PostgreSQL via VULNSTORE_TEST_DSN"]
#[serial_test::file_serial]
async fn postgres_matcher_matches_the_reference_implementation() {
    let cfg = ConnectConfig {
        run_migrations: true,
        ..ConnectConfig::new(test_dsn())
    };
    let postgres = PostgresMatcherStore::connect(&cfg, None).await.unwrap();
    let reference = MemMatcherStore::new();
    MatcherComparator {
        left: &postgres,
        right: &reference,
    }
    .exercise()
    .await;
    postgres.close().await;
}
