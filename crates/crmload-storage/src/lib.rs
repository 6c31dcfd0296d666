//! Warehouse port for the staged-load pipeline: staging tables, the batch
//! ledger, server-side procedures and the failed-row log.

use std::time::Duration;

use async_trait::async_trait;
use crmload_core::{BatchRun, Cell, ContractError, EntityConfig, SemanticType};
use thiserror::Error;

mod failure_log;
mod memory;
mod pg;

pub use failure_log::{FailureSink, JsonlFailureLog, MemoryFailureLog};
pub use memory::{MemoryWarehouse, StagedRow};
pub use pg::{staging_table_ddl, DatabaseTarget, PgWarehouse};

pub const CRATE_NAME: &str = "crmload-storage";

/// PostgreSQL accepts at most this many bind parameters per statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("statement rejected: {0}")]
    Rejected(String),
    #[error("batch {0} is not IN_PROGRESS")]
    LedgerConflict(i64),
    #[error(transparent)]
    Identifier(#[from] ContractError),
    #[error("applying migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("writing failure log {path}: {source}")]
    FailureLog {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding failure record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Connectivity problems escalate to the run; everything else raised by a
    /// single statement is attributable to the data it carried.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err),
            other => StoreError::Database(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingColumn {
    pub name: String,
    pub semantic_type: SemanticType,
}

/// Insert target derived from an entity: table name plus the contract's
/// columns in canonical order. `batch_id` is appended by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTarget {
    pub table: String,
    pub columns: Vec<StagingColumn>,
}

impl StagingTarget {
    pub fn for_entity(entity: &EntityConfig) -> Self {
        Self {
            table: entity.staging_table.clone(),
            columns: entity
                .contract
                .fields()
                .iter()
                .map(|f| StagingColumn {
                    name: f.name.clone(),
                    semantic_type: f.semantic_type,
                })
                .collect(),
        }
    }

    /// Rows per multi-row statement that stay under the bind limit.
    pub fn rows_per_statement(&self) -> usize {
        (MAX_BIND_PARAMS / (self.columns.len() + 1)).max(1)
    }
}

/// One connection plus its current transaction. Statements run inside the
/// transaction opened by the first call after construction or after
/// `commit`/`rollback`.
#[async_trait]
pub trait StagingSession: Send {
    /// Mark every `IN_PROGRESS` ledger row of `entity` as `FAILED`.
    async fn fail_stale_batches(&mut self, entity: &str, detail: &str) -> Result<Vec<i64>, StoreError>;

    async fn truncate(&mut self, table: &str) -> Result<(), StoreError>;

    /// Insert an `IN_PROGRESS` ledger row and return its id.
    async fn open_batch(&mut self, entity: &str) -> Result<i64, StoreError>;

    /// Multi-row insert. Atomic: on error none of `rows` is kept and the
    /// session stays usable.
    async fn insert_rows(
        &mut self,
        target: &StagingTarget,
        batch_id: i64,
        rows: &[Vec<Cell>],
    ) -> Result<u64, StoreError>;

    /// Single-row insert with the same isolation guarantee as `insert_rows`.
    async fn insert_row(&mut self, target: &StagingTarget, batch_id: i64, row: &[Cell]) -> Result<(), StoreError>;

    async fn run_validations(&mut self) -> Result<(), StoreError>;

    async fn upsert(&mut self, procedure: &str, batch_id: i64) -> Result<(), StoreError>;

    async fn complete_batch(&mut self, batch_id: i64) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn session(&self) -> Result<Box<dyn StagingSession>, StoreError>;

    /// Terminal FAILED write, in its own transaction.
    async fn mark_failed(&self, batch_id: i64, detail: &str) -> Result<(), StoreError>;

    async fn fail_stale_batches(&self, entity: &str, detail: &str) -> Result<Vec<i64>, StoreError>;

    async fn recent_batches(&self, entity: Option<&str>, limit: usize) -> Result<Vec<BatchRun>, StoreError>;
}

/// Reconnect pacing for `PgWarehouse::connect`: doubling sleeps from
/// `base_delay`, never longer than `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Default pacing with `DB_CONNECT_RETRIES` retries.
    pub fn with_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|retry| 2u32.checked_pow(retry))
            .map_or(self.max_delay, |factor| self.base_delay.saturating_mul(factor))
            .min(self.max_delay)
    }

    /// Every sleep a connect makes before it gives up.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|retry| self.delay_for_attempt(retry))
    }
}
