//! Chunked readers for bulk export files.
//!
//! Delimited text is streamed in fixed-size chunks; JSON record documents are
//! materialized whole and handed over as a single batch.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crmload_core::{Cell, RowBatch, SourceShape};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "crmload-sources";

/// Rows per chunk unless the caller asks otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Field spellings treated as missing values in delimited text.
const NA_TOKENS: &[&str] = &["", "NA", "N/A", "NULL", "null", "NaN", "nan"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source file {} does not exist", .0.display())]
    SourceNotFound(PathBuf),
    #[error("chunk size must be at least 1")]
    InvalidChunkSize,
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading delimited record in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },
}

/// Lazy, single-pass sequence of row batches.
pub type ChunkIter = Box<dyn Iterator<Item = Result<RowBatch, SourceError>> + Send>;

/// Open `path` according to `shape`. Fails with [`SourceError::SourceNotFound`]
/// before any chunk is produced when the file is absent.
pub fn open_source(path: impl AsRef<Path>, shape: SourceShape, chunk_size: usize) -> Result<ChunkIter, SourceError> {
    let path = path.as_ref();
    if chunk_size == 0 {
        return Err(SourceError::InvalidChunkSize);
    }
    if !path.exists() {
        return Err(SourceError::SourceNotFound(path.to_path_buf()));
    }
    match shape {
        SourceShape::Delimited { delimiter } => {
            Ok(Box::new(DelimitedChunks::open(path, delimiter, chunk_size)?))
        }
        SourceShape::JsonRecords => {
            let batch = read_json_records(path)?;
            Ok(Box::new(batch.into_iter().map(Ok::<RowBatch, SourceError>)))
        }
    }
}

pub struct DelimitedChunks {
    path: PathBuf,
    reader: csv::Reader<File>,
    columns: Vec<String>,
    chunk_size: usize,
    next_row: usize,
    finished: bool,
}

impl DelimitedChunks {
    pub fn open(path: &Path, delimiter: u8, chunk_size: usize) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| io_error(path, source))?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(file);
        let columns = reader
            .headers()
            .map_err(|source| csv_error(path, source))?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        debug!(path = %path.display(), columns = columns.len(), "opened delimited source");
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            columns,
            chunk_size: chunk_size.max(1),
            next_row: 0,
            finished: false,
        })
    }

    fn read_chunk(&mut self) -> Result<Option<RowBatch>, SourceError> {
        let first_row = self.next_row;
        let width = self.columns.len();
        let mut rows = Vec::with_capacity(self.chunk_size.min(1024));
        let mut record = csv::StringRecord::new();

        while rows.len() < self.chunk_size {
            let more = self
                .reader
                .read_record(&mut record)
                .map_err(|source| csv_error(&self.path, source))?;
            if !more {
                self.finished = true;
                break;
            }
            let row_index = self.next_row;
            self.next_row += 1;

            if record.len() != width {
                warn!(
                    path = %self.path.display(),
                    row_index,
                    expected = width,
                    found = record.len(),
                    "record width differs from header; padding or truncating"
                );
            }
            let mut row = record.iter().take(width).map(delimited_cell).collect::<Vec<_>>();
            row.resize(width, Cell::Null);
            rows.push(row);
        }

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(RowBatch::new(self.columns.clone(), rows, first_row)))
    }
}

impl Iterator for DelimitedChunks {
    type Item = Result<RowBatch, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_chunk() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

fn delimited_cell(field: &str) -> Cell {
    if NA_TOKENS.contains(&field) {
        Cell::Null
    } else {
        Cell::text(field)
    }
}

/// Load a JSON array of flat objects. Column order is first-seen key order;
/// keys absent from an object become `Null` in that row. An empty array yields
/// no batch.
pub fn read_json_records(path: &Path) -> Result<Option<RowBatch>, SourceError> {
    let data = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
    let document: JsonValue = serde_json::from_str(&data).map_err(|source| SourceError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let JsonValue::Array(items) = document else {
        return Err(SourceError::Malformed {
            path: path.to_path_buf(),
            message: "expected a JSON array of records".to_string(),
        });
    };
    if items.is_empty() {
        return Ok(None);
    }

    let mut columns: Vec<String> = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let Some(object) = item.as_object() else {
            return Err(SourceError::Malformed {
                path: path.to_path_buf(),
                message: format!("record {index} is not a JSON object"),
            });
        };
        for key in object.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }

    let rows = items
        .iter()
        .filter_map(JsonValue::as_object)
        .map(|object| {
            columns
                .iter()
                .map(|column| object.get(column).map(json_cell).unwrap_or(Cell::Null))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    debug!(path = %path.display(), rows = rows.len(), columns = columns.len(), "loaded json records");
    Ok(Some(RowBatch::new(columns, rows, 0)))
}

pub fn json_cell(value: &JsonValue) -> Cell {
    match value {
        JsonValue::Null => Cell::Null,
        JsonValue::Bool(b) => Cell::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Cell::Integer(i),
            None => n.as_f64().map(Cell::Float).unwrap_or(Cell::Null),
        },
        JsonValue::String(s) => Cell::Text(s.clone()),
        nested => Cell::Text(nested.to_string()),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SourceError {
    SourceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path, source: csv::Error) -> SourceError {
    SourceError::Csv {
        path: path.to_path_buf(),
        source,
    }
}
