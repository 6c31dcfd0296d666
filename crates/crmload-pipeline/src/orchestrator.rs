//! One ledger-tracked run per entity.

use std::sync::Arc;

use crmload_core::{BatchStatus, EntityConfig, EntityRegistry};
use crmload_sources::open_source;
use crmload_storage::{FailureSink, StagingSession, StagingTarget, Warehouse};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::{IngestConfig, ValidationPolicy};
use crate::loader::BulkLoader;
use crate::normalize::normalize;
use crate::reconcile::reconcile;
use crate::validate::{validate, ValidationResult};
use crate::IngestError;

/// Ledger detail written on runs that were still open when a newer run started.
pub const ABANDONED_DETAIL: &str = "abandoned: superseded by a new run";

/// Individual violations logged per chunk before the rest are summarized.
const LOGGED_VIOLATIONS: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub chunks: usize,
    pub rows_read: usize,
    pub rows_inserted: u64,
    pub rows_failed: usize,
    pub rows_rejected: usize,
    pub violations: usize,
    pub shape_warnings: usize,
    pub coerced_timestamps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub entity: String,
    /// `None` when the run failed before its ledger row was committed.
    pub batch_id: Option<i64>,
    pub status: BatchStatus,
    pub error: Option<String>,
    pub stats: RunStats,
}

impl RunOutcome {
    pub fn is_failed(&self) -> bool {
        self.status == BatchStatus::Failed
    }
}

pub struct Orchestrator {
    config: IngestConfig,
    warehouse: Arc<dyn Warehouse>,
    failures: Arc<dyn FailureSink>,
}

impl Orchestrator {
    pub fn new(config: IngestConfig, warehouse: Arc<dyn Warehouse>, failures: Arc<dyn FailureSink>) -> Self {
        Self {
            config,
            warehouse,
            failures,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Run `names` in order, or every registered entity when `names` is empty.
    /// Unknown names are rejected before anything runs.
    pub async fn run_many(&self, registry: &EntityRegistry, names: &[String]) -> Result<Vec<RunOutcome>, IngestError> {
        let selected: Vec<&EntityConfig> = if names.is_empty() {
            registry.entities().iter().collect()
        } else {
            names
                .iter()
                .map(|name| {
                    registry
                        .get(name)
                        .ok_or_else(|| IngestError::UnknownEntity(name.clone()))
                })
                .collect::<Result<_, _>>()?
        };

        let mut outcomes = Vec::with_capacity(selected.len());
        for entity in selected {
            outcomes.push(self.run(entity).await);
        }
        Ok(outcomes)
    }

    /// Fail every `IN_PROGRESS` ledger row of `entity` on demand.
    pub async fn recover(&self, entity: &str) -> Result<Vec<i64>, IngestError> {
        let ids = self
            .warehouse
            .fail_stale_batches(entity, ABANDONED_DETAIL)
            .await?;
        if !ids.is_empty() {
            warn!(entity, ?ids, "marked abandoned runs as FAILED");
        }
        Ok(ids)
    }

    /// Load one entity end to end. Errors never escape: they end up in the
    /// ledger and in the returned outcome.
    pub async fn run(&self, entity: &EntityConfig) -> RunOutcome {
        let span = info_span!(
            "ingest_run",
            entity = %entity.name,
            batch_id = tracing::field::Empty
        );
        self.run_inner(entity).instrument(span).await
    }

    async fn run_inner(&self, entity: &EntityConfig) -> RunOutcome {
        let mut stats = RunStats::default();

        let mut session = match self.warehouse.session().await {
            Ok(session) => session,
            Err(err) => {
                error!(error = %err, "could not reach the warehouse");
                return failed(entity, None, err.into(), stats);
            }
        };

        let batch_id = match self.open_batch(session.as_mut(), entity).await {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "could not open a ledger row");
                if let Err(rollback) = session.rollback().await {
                    warn!(error = %rollback, "rollback after failed ledger open");
                }
                return failed(entity, None, err, stats);
            }
        };
        Span::current().record("batch_id", batch_id);
        info!(table = %entity.staging_table, "ledger row opened");

        match self.load_and_publish(session.as_mut(), entity, batch_id, &mut stats).await {
            Ok(()) => {
                info!(
                    chunks = stats.chunks,
                    rows_read = stats.rows_read,
                    rows_inserted = stats.rows_inserted,
                    rows_failed = stats.rows_failed,
                    rows_rejected = stats.rows_rejected,
                    violations = stats.violations,
                    "run completed"
                );
                RunOutcome {
                    entity: entity.name.clone(),
                    batch_id: Some(batch_id),
                    status: BatchStatus::Completed,
                    error: None,
                    stats,
                }
            }
            Err(err) => {
                error!(error = %err, "run failed; rolling back");
                if let Err(rollback) = session.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                drop(session);
                let detail = err.to_string();
                if let Err(mark) = self.warehouse.mark_failed(batch_id, &detail).await {
                    error!(error = %mark, "could not record FAILED in the ledger");
                }
                failed(entity, Some(batch_id), err, stats)
            }
        }
    }

    /// Stale-run recovery, staging truncate and ledger open, committed together.
    async fn open_batch(&self, session: &mut dyn StagingSession, entity: &EntityConfig) -> Result<i64, IngestError> {
        if self.config.recover_stale_runs {
            let stale = session.fail_stale_batches(&entity.name, ABANDONED_DETAIL).await?;
            if !stale.is_empty() {
                warn!(ids = ?stale, "marked abandoned runs as FAILED");
            }
        }
        session.truncate(&entity.staging_table).await?;
        let batch_id = session.open_batch(&entity.name).await?;
        session.commit().await?;
        Ok(batch_id)
    }

    async fn load_and_publish(
        &self,
        session: &mut dyn StagingSession,
        entity: &EntityConfig,
        batch_id: i64,
        stats: &mut RunStats,
    ) -> Result<(), IngestError> {
        let target = StagingTarget::for_entity(entity);
        let expected = entity.contract.column_names();
        let loader = BulkLoader::new(&entity.name, &target, self.failures.as_ref());

        let source = self.config.source_path(entity);
        info!(source = %source.display(), "reading source");
        let chunks = open_source(&source, entity.shape, self.config.chunk_size)?;

        for chunk in chunks {
            let chunk = chunk?;
            stats.chunks += 1;
            stats.rows_read += chunk.len();

            let (aligned, warnings) = reconcile(chunk, &expected);
            for warning in &warnings {
                warn!(chunk = stats.chunks, "{warning}");
            }
            stats.shape_warnings += warnings.len();

            if let ValidationResult::Invalid(violations) = validate(&entity.contract, &aligned) {
                stats.violations += violations.len();
                for violation in violations.iter().take(LOGGED_VIOLATIONS) {
                    warn!(
                        field = %violation.field,
                        row = violation.row,
                        reason = %violation.reason,
                        "contract violation"
                    );
                }
                if violations.len() > LOGGED_VIOLATIONS {
                    warn!(more = violations.len() - LOGGED_VIOLATIONS, "further violations not shown");
                }
                if self.config.validation_policy == ValidationPolicy::Reject {
                    warn!(
                        chunk = stats.chunks,
                        rows = aligned.len(),
                        "chunk rejected by validation policy"
                    );
                    stats.rows_rejected += aligned.len();
                    continue;
                }
            }

            let (normalized, coerced) = normalize(aligned, &entity.temporal_fields);
            stats.coerced_timestamps += coerced;

            let report = loader.load(session, batch_id, &normalized).await?;
            stats.rows_inserted += report.inserted;
            stats.rows_failed += report.failed_rows;
            debug!(
                chunk = stats.chunks,
                first_row = normalized.first_row,
                inserted = report.inserted,
                failed = report.failed_rows,
                "chunk loaded"
            );
        }

        session.run_validations().await?;
        session.upsert(&entity.upsert_procedure, batch_id).await?;
        session.complete_batch(batch_id).await?;
        session.commit().await?;
        Ok(())
    }
}

fn failed(entity: &EntityConfig, batch_id: Option<i64>, err: IngestError, stats: RunStats) -> RunOutcome {
    RunOutcome {
        entity: entity.name.clone(),
        batch_id,
        status: BatchStatus::Failed,
        error: Some(err.to_string()),
        stats,
    }
}
