//! Staging inserts with row-level failure isolation.

use chrono::Utc;
use crmload_core::{FailureRecord, RowBatch};
use crmload_storage::{FailureSink, StagingSession, StagingTarget};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::IngestError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub inserted: u64,
    pub failed_rows: usize,
    pub used_row_fallback: bool,
}

pub struct BulkLoader<'a> {
    entity: &'a str,
    target: &'a StagingTarget,
    failures: &'a dyn FailureSink,
}

impl<'a> BulkLoader<'a> {
    pub fn new(entity: &'a str, target: &'a StagingTarget, failures: &'a dyn FailureSink) -> Self {
        Self {
            entity,
            target,
            failures,
        }
    }

    /// Insert `batch` (already aligned to the target's columns) tagged with
    /// `batch_id`.
    ///
    /// One multi-row insert is tried first. If the database refuses it, every
    /// row is retried on its own so that only the offending rows are lost;
    /// each of those produces exactly one failure record. Connection errors
    /// are never attributed to rows and abort the load.
    pub async fn load(
        &self,
        session: &mut dyn StagingSession,
        batch_id: i64,
        batch: &RowBatch,
    ) -> Result<LoadReport, IngestError> {
        let mut report = LoadReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        match session.insert_rows(self.target, batch_id, &batch.rows).await {
            Ok(inserted) => {
                debug!(table = %self.target.table, inserted, "bulk insert");
                report.inserted = inserted;
                return Ok(report);
            }
            Err(err) if err.is_connection() => return Err(err.into()),
            Err(err) => {
                warn!(
                    table = %self.target.table,
                    rows = batch.len(),
                    first_row = batch.first_row,
                    error = %err,
                    "bulk insert failed; retrying row by row"
                );
                report.used_row_fallback = true;
            }
        }

        for (offset, row) in batch.rows.iter().enumerate() {
            match session.insert_row(self.target, batch_id, row).await {
                Ok(()) => report.inserted += 1,
                Err(err) if err.is_connection() => return Err(err.into()),
                Err(err) => {
                    report.failed_rows += 1;
                    let failure = FailureRecord {
                        batch_id: Some(batch_id),
                        entity: self.entity.to_string(),
                        row_index: batch.row_index(offset),
                        row: batch.row_map(offset),
                        cause: err.to_string(),
                        timestamp: Utc::now(),
                    };
                    error!(
                        target: "failed_rows",
                        entity = %self.entity,
                        batch_id,
                        row = failure.row_index,
                        cause = %failure.cause,
                        "row rejected by staging table"
                    );
                    self.failures.record(&failure)?;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmload_core::{Cell, SemanticType};
    use crmload_storage::{MemoryFailureLog, MemoryWarehouse, StagingColumn, Warehouse};

    fn target() -> StagingTarget {
        StagingTarget {
            table: "stg_companies".into(),
            columns: vec![
                StagingColumn {
                    name: "id".into(),
                    semantic_type: SemanticType::String,
                },
                StagingColumn {
                    name: "annual_revenue".into(),
                    semantic_type: SemanticType::Integer,
                },
            ],
        }
    }

    fn batch(revenues: &[&str], first_row: usize) -> RowBatch {
        RowBatch::new(
            vec!["id".into(), "annual_revenue".into()],
            revenues
                .iter()
                .enumerate()
                .map(|(i, r)| vec![Cell::text(format!("c{}", first_row + i)), Cell::text(*r)])
                .collect(),
            first_row,
        )
    }

    #[tokio::test]
    async fn clean_batches_are_written_once() {
        let warehouse = MemoryWarehouse::new();
        let failures = MemoryFailureLog::new();
        let target = target();
        let loader = BulkLoader::new("companies", &target, &failures);
        let mut session = warehouse.session().await.unwrap();

        let report = loader
            .load(session.as_mut(), 1, &batch(&["1", "2", "3"], 0))
            .await
            .unwrap();
        session.commit().await.unwrap();

        assert_eq!(
            report,
            LoadReport {
                inserted: 3,
                failed_rows: 0,
                used_row_fallback: false
            }
        );
        assert_eq!(warehouse.staged_rows("stg_companies").len(), 3);
        assert!(failures.records().is_empty());
    }

    #[tokio::test]
    async fn only_the_bad_row_is_isolated() {
        let warehouse = MemoryWarehouse::new();
        let failures = MemoryFailureLog::new();
        let target = target();
        let loader = BulkLoader::new("companies", &target, &failures);
        let mut session = warehouse.session().await.unwrap();

        let report = loader
            .load(session.as_mut(), 7, &batch(&["10", "ten", "30"], 500))
            .await
            .unwrap();
        session.commit().await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed_rows, 1);
        assert!(report.used_row_fallback);

        let records = failures.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].row_index, 501);
        assert_eq!(records[0].batch_id, Some(7));
        assert_eq!(records[0].row["annual_revenue"], Cell::text("ten"));
        assert!(records[0].cause.contains("bigint"));

        let staged = warehouse.staged_rows("stg_companies");
        assert_eq!(staged.len(), 2);
        assert!(staged.iter().all(|r| r.batch_id == 7));
    }

    #[tokio::test]
    async fn lost_connections_abort_instead_of_blaming_rows() {
        let warehouse = MemoryWarehouse::new();
        let failures = MemoryFailureLog::new();
        let target = target();
        let loader = BulkLoader::new("companies", &target, &failures);

        warehouse.drop_connection_after(0);
        let mut session = warehouse.session().await.unwrap();
        let err = loader
            .load(session.as_mut(), 1, &batch(&["1", "2"], 0))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Store(ref e) if e.is_connection()));

        // bulk attempt and first row go through, then the link drops mid-fallback
        warehouse.drop_connection_after(2);
        let mut session = warehouse.session().await.unwrap();
        let err = loader
            .load(session.as_mut(), 2, &batch(&["10", "ten", "30"], 0))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Store(ref e) if e.is_connection()));
        assert!(failures.records().is_empty());
    }

    #[tokio::test]
    async fn empty_batches_touch_nothing() {
        let warehouse = MemoryWarehouse::new();
        let failures = MemoryFailureLog::new();
        let target = target();
        let loader = BulkLoader::new("companies", &target, &failures);
        let mut session = warehouse.session().await.unwrap();
        let report = loader.load(session.as_mut(), 1, &batch(&[], 0)).await.unwrap();
        assert_eq!(report, LoadReport::default());
    }
}
