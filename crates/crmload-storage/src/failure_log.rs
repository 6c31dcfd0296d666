use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crmload_core::FailureRecord;

use crate::StoreError;

/// Destination for rows the staging table rejected. Records are appended and
/// never rewritten.
pub trait FailureSink: Send + Sync {
    fn record(&self, failure: &FailureRecord) -> Result<(), StoreError>;
}

/// One JSON object per line, appended to a file that survives across runs.
#[derive(Debug)]
pub struct JsonlFailureLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlFailureLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::FailureLog {
                path: path.display().to_string(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::FailureLog {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FailureSink for JsonlFailureLog {
    fn record(&self, failure: &FailureRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(failure)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|source| StoreError::FailureLog {
                path: self.path.display().to_string(),
                source,
            })
    }
}

#[derive(Debug, Default)]
pub struct MemoryFailureLog {
    records: Mutex<Vec<FailureRecord>>,
}

impl MemoryFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl FailureSink for MemoryFailureLog {
    fn record(&self, failure: &FailureRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(failure.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use crmload_core::Cell;

    use super::*;

    fn failure(row_index: usize) -> FailureRecord {
        FailureRecord {
            batch_id: Some(4),
            entity: "companies".into(),
            row_index,
            row: BTreeMap::from([("annual_revenue".to_string(), Cell::text("lots"))]),
            cause: "invalid input syntax for type bigint".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn appends_one_json_line_per_record_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/failed_rows.log");

        JsonlFailureLog::open(&path).unwrap().record(&failure(3)).unwrap();
        let log = JsonlFailureLog::open(&path).unwrap();
        log.record(&failure(9)).unwrap();
        assert_eq!(log.path(), path.as_path());

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<FailureRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].row_index, 3);
        assert_eq!(lines[1].row_index, 9);
        assert_eq!(lines[1].row["annual_revenue"], Cell::text("lots"));
    }

    #[test]
    fn memory_log_keeps_records_in_order() {
        let log = MemoryFailureLog::new();
        log.record(&failure(1)).unwrap();
        log.record(&failure(2)).unwrap();
        let rows: Vec<usize> = log.records().iter().map(|r| r.row_index).collect();
        assert_eq!(rows, vec![1, 2]);
    }
}
