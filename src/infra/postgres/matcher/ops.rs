use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::Instrument;
use uuid::Uuid;

use crate::domain::{UpdateDiff, UpdateKind, UpdateOperation, Vulnerability};

use super::PostgresMatcherStore;
use super::super::codec;
use super::super::observe::MethodError;
use super::super::queries;

type OperationRow = (i64, Uuid, String, String, String, DateTime<Utc>);

fn operation_from_row(row: OperationRow) -> Result<(i64, UpdateOperation), MethodError> {
    let (id, reference, updater, fingerprint, kind, date) = row;
    let kind = kind
        .parse()
        .map_err(|e| MethodError::Internal(format!("stored update kind failed to decode: {e}")))?;
    Ok((
        id,
        UpdateOperation {
            reference,
            updater,
            fingerprint,
            kind,
            date,
        },
    ))
}

impl PostgresMatcherStore {
    pub(super) async fn get_update_operations_inner(
        &self,
        kind: UpdateKind,
        updaters: &[String],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>, MethodError> {
        let updaters: Vec<String> = if updaters.is_empty() {
            let q = queries::matcher("get_update_operations_updaters");
            let rows: Vec<(String,)> = sqlx::query_as(q.sql)
                .bind(kind.as_str())
                .fetch_all(self.pool())
                .instrument(q.span())
                .await?;
            rows.into_iter().map(|(u,)| u).collect()
        } else {
            updaters.to_vec()
        };

        let q = queries::matcher("get_update_operations_select");
        let mut out = HashMap::with_capacity(updaters.len());
        for updater in updaters {
            let rows: Vec<(Uuid, String, String, String, DateTime<Utc>)> =
                sqlx::query_as(q.sql)
                    .bind(&updater)
                    .bind(kind.as_str())
                    .fetch_all(self.pool())
                    .instrument(q.span())
                    .await?;
            let mut operations = Vec::with_capacity(rows.len());
            for (reference, updater, fingerprint, kind, date) in rows {
                let (_, op) = operation_from_row((0, reference, updater, fingerprint, kind, date))?;
                operations.push(op);
            }
            if let Some(op) = operations.first() {
                out.insert(op.updater.clone(), operations);
            }
        }
        Ok(out)
    }

    pub(super) async fn get_latest_update_ref_inner(
        &self,
        kind: UpdateKind,
    ) -> Result<Option<Uuid>, MethodError> {
        let q = queries::matcher("get_latest_update_ref_select");
        let row: Option<(Uuid,)> = sqlx::query_as(q.sql)
            .bind(kind.as_str())
            .fetch_optional(self.pool())
            .instrument(q.span())
            .await?;
        Ok(row.map(|(reference,)| reference))
    }

    pub(super) async fn get_latest_update_refs_inner(
        &self,
        kind: UpdateKind,
    ) -> Result<HashMap<String, Uuid>, MethodError> {
        let q = queries::matcher("get_latest_update_refs_select");
        let rows: Vec<(String, Uuid)> = sqlx::query_as(q.sql)
            .bind(kind.as_str())
            .fetch_all(self.pool())
            .instrument(q.span())
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn load_operation(&self, reference: Uuid) -> Result<(i64, UpdateOperation), MethodError> {
        let q = queries::matcher("get_update_diff_op");
        let row: Option<OperationRow> = sqlx::query_as(q.sql)
            .bind(reference)
            .fetch_optional(self.pool())
            .instrument(q.span())
            .await?;
        let Some(row) = row else {
            return Err(MethodError::Validation(format!(
                "unknown update operation: {reference}"
            )));
        };
        operation_from_row(row)
    }

    async fn diff_vulnerabilities(
        &self,
        in_op: i64,
        not_in_op: i64,
    ) -> Result<Vec<Vulnerability>, MethodError> {
        let q = queries::matcher("get_update_diff_added");
        let rows = sqlx::query(q.sql)
            .bind(in_op)
            .bind(not_in_op)
            .fetch_all(self.pool())
            .instrument(q.span())
            .await?;
        rows.iter().map(codec::vulnerability_from_row).collect()
    }

    pub(super) async fn get_update_diff_inner(
        &self,
        prev: Option<Uuid>,
        cur: Uuid,
    ) -> Result<UpdateDiff, MethodError> {
        let (cur_id, cur_op) = self.load_operation(cur).await?;
        let prev_loaded = match prev {
            Some(reference) => Some(self.load_operation(reference).await?),
            None => None,
        };

        // Operation ids start at one; zero never matches, so an absent
        // previous side diffs against the empty set.
        let prev_id = prev_loaded.as_ref().map(|(id, _)| *id).unwrap_or(0);
        let added = self.diff_vulnerabilities(cur_id, prev_id).await?;
        let removed = match prev_id {
            0 => Vec::new(),
            _ => self.diff_vulnerabilities(prev_id, cur_id).await?,
        };

        Ok(UpdateDiff {
            prev: prev_loaded.map(|(_, op)| op),
            cur: cur_op,
            added,
            removed,
        })
    }

    pub(super) async fn delete_update_operations_inner(
        &self,
        refs: &[Uuid],
    ) -> Result<i64, MethodError> {
        if refs.is_empty() {
            return Ok(0);
        }
        let q = queries::matcher("delete_update_operations_delete");
        let done = sqlx::query(q.sql)
            .bind(refs)
            .execute(self.pool())
            .instrument(q.span())
            .await?;
        self.refresh_latest().await;
        Ok(done.rows_affected() as i64)
    }
}
