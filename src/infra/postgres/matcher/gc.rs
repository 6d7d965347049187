use itertools::Itertools;
use tracing::Instrument;

use super::PostgresMatcherStore;
use super::super::observe::MethodError;
use super::super::queries;

/// At most this many update operations die per GC round; callers loop
/// until the returned eligible count reaches zero.
pub(super) const GC_THROTTLE: usize = 50;

impl PostgresMatcherStore {
    pub(super) async fn gc_inner(&self, keep: usize) -> Result<i64, MethodError> {
        let keep = i64::try_from(keep)
            .map_err(|_| MethodError::Validation(format!("keep count out of range: {keep}")))?;

        let mut tx = self.pool().begin().await?;

        let q = queries::matcher("gc_eligible");
        let eligible: Vec<(i64, String)> = sqlx::query_as(q.sql)
            .bind(keep)
            .fetch_all(&mut *tx)
            .instrument(q.span())
            .await?;
        if eligible.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let total = eligible.len();
        let chosen = &eligible[..total.min(GC_THROTTLE)];
        let ids: Vec<i64> = chosen.iter().map(|(id, _)| *id).collect();

        let q = queries::matcher("gc_delete");
        sqlx::query(q.sql)
            .bind(&ids)
            .execute(&mut *tx)
            .instrument(q.span())
            .await?;

        // Sweep vulnerabilities orphaned by the deletions, per updater that
        // lost operations.
        let q = queries::matcher("gc_orphans");
        fn updater_ref(pair: &(i64, String)) -> &String {
            &pair.1
        }
        for updater in chosen.iter().map(updater_ref).unique() {
            let swept = sqlx::query(q.sql)
                .bind(updater)
                .execute(&mut *tx)
                .instrument(q.span())
                .await?;
            if swept.rows_affected() > 0 {
                tracing::debug!(
                    updater,
                    swept = swept.rows_affected(),
                    "swept orphaned vulnerabilities"
                );
            }
        }

        tx.commit().await?;
        self.refresh_latest().await;
        Ok((total - chosen.len()) as i64)
    }
}
