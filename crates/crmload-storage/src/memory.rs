//! In-process warehouse with the same transactional and typing behaviour as
//! the PostgreSQL store, used by the pipeline's tests and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use crmload_core::temporal::{parse_timestamp, CANONICAL_FORMAT};
use crmload_core::{ensure_sql_identifier, BatchRun, BatchStatus, Cell, SemanticType};

use crate::{StagingSession, StagingTarget, StoreError, Warehouse};

#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub batch_id: i64,
    pub values: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    batches: Vec<BatchRun>,
    tables: BTreeMap<String, Vec<StagedRow>>,
    procedure_calls: Vec<String>,
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connections: bool,
    /// Insert statements left before the connection drops.
    insert_budget: Option<usize>,
    failing_procedures: HashSet<String>,
    unique_columns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `session()` fails as a connection error.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.faults).refuse_connections = refuse;
    }

    /// Let `statements` more insert statements through, then fail every
    /// insert as a lost connection.
    pub fn drop_connection_after(&self, statements: usize) {
        lock(&self.faults).insert_budget = Some(statements);
    }

    /// Calls to `procedure` (or `run_validations`) raise a database error.
    pub fn fail_procedure(&self, procedure: &str) {
        lock(&self.faults).failing_procedures.insert(procedure.to_string());
    }

    /// Emulate a uniqueness constraint on `table.column`.
    pub fn unique_column(&self, table: &str, column: &str) {
        lock(&self.faults)
            .unique_columns
            .insert(table.to_string(), column.to_string());
    }

    /// Seed a ledger row, e.g. one left behind by an interrupted run.
    pub fn seed_batch(&self, entity: &str, status: BatchStatus) -> i64 {
        let mut state = lock(&self.state);
        let id = state.batches.len() as i64 + 1;
        state.batches.push(BatchRun {
            id,
            entity: entity.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status,
            exceptions: None,
        });
        id
    }

    pub fn batches(&self) -> Vec<BatchRun> {
        lock(&self.state).batches.clone()
    }

    pub fn batch(&self, id: i64) -> Option<BatchRun> {
        lock(&self.state).batches.iter().find(|b| b.id == id).cloned()
    }

    pub fn staged_rows(&self, table: &str) -> Vec<StagedRow> {
        lock(&self.state).tables.get(table).cloned().unwrap_or_default()
    }

    pub fn procedure_calls(&self) -> Vec<String> {
        lock(&self.state).procedure_calls.clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn session(&self) -> Result<Box<dyn StagingSession>, StoreError> {
        if lock(&self.faults).refuse_connections {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(Box::new(MemorySession {
            shared: self.clone(),
            working: None,
        }))
    }

    async fn mark_failed(&self, batch_id: i64, detail: &str) -> Result<(), StoreError> {
        if lock(&self.faults).refuse_connections {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        let mut state = lock(&self.state);
        finish_batch(&mut state, batch_id, BatchStatus::Failed, Some(detail))
    }

    async fn fail_stale_batches(&self, entity: &str, detail: &str) -> Result<Vec<i64>, StoreError> {
        let mut state = lock(&self.state);
        Ok(fail_stale(&mut state, entity, detail))
    }

    async fn recent_batches(&self, entity: Option<&str>, limit: usize) -> Result<Vec<BatchRun>, StoreError> {
        let state = lock(&self.state);
        Ok(state
            .batches
            .iter()
            .rev()
            .filter(|b| entity.map_or(true, |e| b.entity == e))
            .take(limit)
            .cloned()
            .collect())
    }
}

fn finish_batch(
    state: &mut MemoryState,
    batch_id: i64,
    status: BatchStatus,
    detail: Option<&str>,
) -> Result<(), StoreError> {
    let batch = state
        .batches
        .iter_mut()
        .find(|b| b.id == batch_id && b.status == BatchStatus::InProgress)
        .ok_or(StoreError::LedgerConflict(batch_id))?;
    batch.status = status;
    batch.end_time = Some(Utc::now());
    batch.exceptions = detail.map(ToString::to_string);
    Ok(())
}

fn fail_stale(state: &mut MemoryState, entity: &str, detail: &str) -> Vec<i64> {
    let mut ids = Vec::new();
    for batch in state
        .batches
        .iter_mut()
        .filter(|b| b.entity == entity && b.status == BatchStatus::InProgress)
    {
        batch.status = BatchStatus::Failed;
        batch.end_time = Some(Utc::now());
        batch.exceptions = Some(detail.to_string());
        ids.push(batch.id);
    }
    ids
}

/// Mirrors the `CAST(... AS <type>)` the PostgreSQL store applies.
fn cast(cell: &Cell, semantic_type: SemanticType) -> Result<Option<String>, String> {
    let Some(text) = cell.to_sql_text() else {
        return Ok(None);
    };
    match semantic_type {
        SemanticType::String => Ok(Some(text)),
        SemanticType::Integer => text
            .trim()
            .parse::<i64>()
            .map(|i| Some(i.to_string()))
            .map_err(|_| format!("invalid input syntax for type bigint: \"{text}\"")),
        SemanticType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => Ok(Some("true".to_string())),
            "f" | "false" | "n" | "no" | "off" | "0" => Ok(Some("false".to_string())),
            _ => Err(format!("invalid input syntax for type boolean: \"{text}\"")),
        },
        SemanticType::Timestamp => parse_timestamp(&text)
            .map(|dt| Some(dt.format(CANONICAL_FORMAT).to_string()))
            .ok_or_else(|| format!("invalid input syntax for type timestamp: \"{text}\"")),
    }
}

struct MemorySession {
    shared: MemoryWarehouse,
    working: Option<MemoryState>,
}

impl MemorySession {
    fn working(&mut self) -> &mut MemoryState {
        let shared = &self.shared;
        self.working
            .get_or_insert_with(|| lock(&shared.state).clone())
    }

    fn stage(&mut self, target: &StagingTarget, batch_id: i64, rows: &[Vec<Cell>]) -> Result<u64, StoreError> {
        ensure_sql_identifier(&target.table)?;
        let unique = {
            let mut faults = lock(&self.shared.faults);
            match faults.insert_budget.as_mut() {
                Some(0) => {
                    return Err(StoreError::Unavailable(
                        "server closed the connection unexpectedly".to_string(),
                    ))
                }
                Some(left) => *left -= 1,
                None => {}
            }
            faults.unique_columns.get(&target.table).cloned()
        };
        let state = self.working();
        let existing = state.tables.get(&target.table).cloned().unwrap_or_default();

        let mut seen: HashSet<Option<String>> = match &unique {
            Some(column) => existing
                .iter()
                .map(|r| r.values.get(column).cloned().flatten())
                .collect(),
            None => HashSet::new(),
        };

        let mut staged = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = BTreeMap::new();
            for (column, cell) in target.columns.iter().zip(row.iter()) {
                let value = cast(cell, column.semantic_type).map_err(StoreError::Rejected)?;
                values.insert(column.name.clone(), value);
            }
            if let Some(column) = &unique {
                let key = values.get(column).cloned().flatten();
                if key.is_some() && !seen.insert(key.clone()) {
                    return Err(StoreError::Rejected(format!(
                        "duplicate key value violates unique constraint on {column}: {}",
                        key.unwrap_or_default()
                    )));
                }
            }
            staged.push(StagedRow { batch_id, values });
        }

        let inserted = staged.len() as u64;
        state
            .tables
            .entry(target.table.clone())
            .or_default()
            .extend(staged);
        Ok(inserted)
    }

    fn call(&mut self, procedure: &str, batch_id: Option<i64>) -> Result<(), StoreError> {
        if lock(&self.shared.faults).failing_procedures.contains(procedure) {
            return Err(StoreError::Rejected(format!("procedure {procedure} raised an exception")));
        }
        let call = match batch_id {
            Some(id) => format!("{procedure}({id})"),
            None => format!("{procedure}()"),
        };
        self.working().procedure_calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl StagingSession for MemorySession {
    async fn fail_stale_batches(&mut self, entity: &str, detail: &str) -> Result<Vec<i64>, StoreError> {
        Ok(fail_stale(self.working(), entity, detail))
    }

    async fn truncate(&mut self, table: &str) -> Result<(), StoreError> {
        ensure_sql_identifier(table)?;
        self.working().tables.insert(table.to_string(), Vec::new());
        Ok(())
    }

    async fn open_batch(&mut self, entity: &str) -> Result<i64, StoreError> {
        let state = self.working();
        let id = state.batches.iter().map(|b| b.id).max().unwrap_or(0) + 1;
        state.batches.push(BatchRun {
            id,
            entity: entity.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: BatchStatus::InProgress,
            exceptions: None,
        });
        Ok(id)
    }

    async fn insert_rows(
        &mut self,
        target: &StagingTarget,
        batch_id: i64,
        rows: &[Vec<Cell>],
    ) -> Result<u64, StoreError> {
        self.stage(target, batch_id, rows)
    }

    async fn insert_row(&mut self, target: &StagingTarget, batch_id: i64, row: &[Cell]) -> Result<(), StoreError> {
        self.stage(target, batch_id, &[row.to_vec()]).map(|_| ())
    }

    async fn run_validations(&mut self) -> Result<(), StoreError> {
        self.call("run_validations", None)
    }

    async fn upsert(&mut self, procedure: &str, batch_id: i64) -> Result<(), StoreError> {
        ensure_sql_identifier(procedure)?;
        self.call(procedure, Some(batch_id))
    }

    async fn complete_batch(&mut self, batch_id: i64) -> Result<(), StoreError> {
        finish_batch(self.working(), batch_id, BatchStatus::Completed, None)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(working) = self.working.take() {
            *lock(&self.shared.state) = working;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.working = None;
        Ok(())
    }
}
