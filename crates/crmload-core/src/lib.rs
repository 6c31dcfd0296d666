//! Core domain model for crmload: cells, row batches, schema contracts, the
//! batch ledger record and the per-entity registry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod contract;
mod registry;
pub mod temporal;

pub use contract::{Constraint, FieldSpec, SchemaContract, SemanticType};
pub use registry::{EntityConfig, EntityRegistry, SourceShape};

pub const CRATE_NAME: &str = "crmload-core";

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("contract for {entity} declares no fields")]
    Empty { entity: String },
    #[error("contract for {entity} declares field {field} twice")]
    DuplicateField { entity: String, field: String },
    #[error("{0:?} is not a plain SQL identifier")]
    InvalidIdentifier(String),
    #[error("invalid pattern for field {field}: {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
    #[error("temporal field {field} is not part of the {entity} contract")]
    UnknownTemporalField { entity: String, field: String },
    #[error("unknown source format {0:?} (expected csv or json)")]
    UnknownFormat(String),
    #[error("unknown field type {0:?}")]
    UnknownType(String),
    #[error("entity {0} is declared twice")]
    DuplicateEntity(String),
    #[error("parsing entity registry: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A single value read from a source file.
///
/// Delimited text only ever yields `Text` and `Null`; JSON sources yield the
/// variant matching the JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Cell {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Textual form handed to the database driver; the staging insert casts it
    /// to the column's SQL type.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Bool(b) => Some(b.to_string()),
            Cell::Integer(i) => Some(i.to_string()),
            Cell::Float(f) => Some(f.to_string()),
            Cell::Text(s) => Some(s.clone()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => write!(f, "null"),
            Cell::Bool(b) => write!(f, "{b}"),
            Cell::Integer(i) => write!(f, "{i}"),
            Cell::Float(x) => write!(f, "{x}"),
            Cell::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Ephemeral unit of work: one chunk of a source file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    /// Zero-based index of the first row within the source file.
    pub first_row: usize,
}

impl RowBatch {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>, first_row: usize) -> Self {
        Self {
            columns,
            rows,
            first_row,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Absolute source index of the row at `offset` within this batch.
    pub fn row_index(&self, offset: usize) -> usize {
        self.first_row + offset
    }

    pub fn row_map(&self, offset: usize) -> BTreeMap<String, Cell> {
        let Some(row) = self.rows.get(offset) else {
            return BTreeMap::new();
        };
        self.columns
            .iter()
            .cloned()
            .zip(row.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    InProgress,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(BatchStatus::InProgress),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status {other:?}")),
        }
    }
}

/// One row of the `batch` ledger table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: i64,
    pub entity: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub exceptions: Option<String>,
}

/// Append-only diagnostic record for a row the staging table rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub batch_id: Option<i64>,
    pub entity: String,
    pub row_index: usize,
    pub row: BTreeMap<String, Cell>,
    pub cause: String,
    pub timestamp: DateTime<Utc>,
}

/// Accepts `name` or `schema.name` where each part is `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_sql_identifier(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    })
}

pub fn ensure_sql_identifier(value: &str) -> Result<(), ContractError> {
    if is_sql_identifier(value) {
        Ok(())
    } else {
        Err(ContractError::InvalidIdentifier(value.to_string()))
    }
}
