use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use tracing::Instrument;

use super::PostgresMatcherStore;
use super::super::observe::MethodError;
use super::super::queries;

impl PostgresMatcherStore {
    pub(super) async fn initialized_inner(&self) -> Result<bool, MethodError> {
        if self.initialized_latch().load(Ordering::Relaxed) {
            return Ok(true);
        }
        let q = queries::matcher("initialized_select");
        let (initialized,): (bool,) = sqlx::query_as(q.sql)
            .fetch_one(self.pool())
            .instrument(q.span())
            .await?;
        if initialized {
            self.initialized_latch().store(true, Ordering::Relaxed);
        }
        Ok(initialized)
    }

    pub(super) async fn record_updater_status_inner(
        &self,
        updater: &str,
        update_time: DateTime<Utc>,
        fingerprint: &str,
        error: Option<&str>,
    ) -> Result<(), MethodError> {
        if updater.is_empty() {
            return Err(MethodError::Validation("updater name is empty".to_string()));
        }
        match error {
            None => {
                let q = queries::matcher("record_updater_status_success");
                sqlx::query(q.sql)
                    .bind(updater)
                    .bind(update_time)
                    .bind(fingerprint)
                    .execute(self.pool())
                    .instrument(q.span())
                    .await?;
            }
            Some(error) => {
                let q = queries::matcher("record_updater_status_failure");
                sqlx::query(q.sql)
                    .bind(updater)
                    .bind(update_time)
                    .bind(fingerprint)
                    .bind(error)
                    .execute(self.pool())
                    .instrument(q.span())
                    .await?;
            }
        }
        Ok(())
    }

    pub(super) async fn record_updater_set_status_inner(
        &self,
        updater_set: &str,
        update_time: DateTime<Utc>,
    ) -> Result<(), MethodError> {
        if updater_set.is_empty() {
            return Err(MethodError::Validation(
                "updater set name is empty".to_string(),
            ));
        }
        let q = queries::matcher("record_updater_set_status_update");
        let done = sqlx::query(q.sql)
            .bind(updater_set)
            .bind(update_time)
            .execute(self.pool())
            .instrument(q.span())
            .await?;
        tracing::debug!(
            updater_set,
            updated = done.rows_affected(),
            "recorded updater set success"
        );
        Ok(())
    }
}
