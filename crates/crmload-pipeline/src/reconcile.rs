//! Aligns a chunk's columns to the contract order.

use std::fmt;

use crmload_core::{Cell, RowBatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeWarning {
    /// Expected column absent from the source; filled with nulls.
    Missing(String),
    /// Source column the contract does not know; dropped.
    Extra(String),
    /// Same columns, different order.
    Reordered,
}

impl fmt::Display for ShapeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeWarning::Missing(column) => write!(f, "missing column {column} filled with nulls"),
            ShapeWarning::Extra(column) => write!(f, "unexpected column {column} dropped"),
            ShapeWarning::Reordered => f.write_str("columns arrive in a different order than the contract"),
        }
    }
}

/// The returned batch has exactly `expected` as its columns, in that order,
/// and keeps `first_row`. Duplicate source headers resolve to the first one.
pub fn reconcile(batch: RowBatch, expected: &[String]) -> (RowBatch, Vec<ShapeWarning>) {
    let mut warnings = Vec::new();

    let sources: Vec<Option<usize>> = expected.iter().map(|name| batch.column_index(name)).collect();
    for (name, source) in expected.iter().zip(&sources) {
        if source.is_none() {
            warnings.push(ShapeWarning::Missing(name.clone()));
        }
    }
    for column in &batch.columns {
        if !expected.contains(column) {
            warnings.push(ShapeWarning::Extra(column.clone()));
        }
    }

    let present: Vec<usize> = sources.iter().flatten().copied().collect();
    if present.windows(2).any(|pair| pair[0] > pair[1]) {
        warnings.push(ShapeWarning::Reordered);
    }

    if batch.columns == expected {
        return (batch, warnings);
    }

    let RowBatch {
        rows, first_row, ..
    } = batch;
    let rows = rows
        .into_iter()
        .map(|mut row| {
            sources
                .iter()
                .map(|source| {
                    source
                        .and_then(|i| row.get_mut(i))
                        .map(std::mem::take)
                        .unwrap_or(Cell::Null)
                })
                .collect()
        })
        .collect();

    (RowBatch::new(expected.to_vec(), rows, first_row), warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn matching_batches_pass_through_untouched() {
        let batch = RowBatch::new(names(&["id", "name"]), vec![vec![Cell::text("1"), Cell::text("a")]], 0);
        let (aligned, warnings) = reconcile(batch.clone(), &names(&["id", "name"]));
        assert_eq!(aligned, batch);
        assert!(warnings.is_empty());
    }

    #[test]
    fn reordered_columns_keep_every_value() {
        let batch = RowBatch::new(
            names(&["name", "id"]),
            vec![
                vec![Cell::text("Acme"), Cell::text("c1")],
                vec![Cell::text("Globex"), Cell::text("c2")],
            ],
            10_000,
        );
        let (aligned, warnings) = reconcile(batch, &names(&["id", "name"]));

        assert_eq!(aligned.columns, names(&["id", "name"]));
        assert_eq!(aligned.rows[1], vec![Cell::text("c2"), Cell::text("Globex")]);
        assert_eq!(aligned.first_row, 10_000);
        assert_eq!(warnings, vec![ShapeWarning::Reordered]);
    }

    #[test]
    fn missing_columns_become_null_and_extras_are_dropped() {
        let batch = RowBatch::new(
            names(&["id", "legacy_code"]),
            vec![vec![Cell::text("c1"), Cell::text("X9")]],
            0,
        );
        let (aligned, warnings) = reconcile(batch, &names(&["id", "name"]));

        assert_eq!(aligned.rows, vec![vec![Cell::text("c1"), Cell::Null]]);
        assert_eq!(
            warnings,
            vec![
                ShapeWarning::Missing("name".into()),
                ShapeWarning::Extra("legacy_code".into()),
            ]
        );
    }

    #[test]
    fn short_rows_are_padded() {
        let batch = RowBatch::new(names(&["name", "id"]), vec![vec![Cell::text("Acme")]], 0);
        let (aligned, _) = reconcile(batch, &names(&["id", "name"]));
        assert_eq!(aligned.rows[0], vec![Cell::Null, Cell::text("Acme")]);
    }
}
