use std::fmt;

use crmload_core::temporal::parse_timestamp;
use crmload_core::{Cell, Constraint, FieldSpec, RowBatch, SchemaContract, SemanticType};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    /// Absolute row index within the source file.
    pub row: usize,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {} field {}: {}", self.row, self.field, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(Vec<Violation>),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            ValidationResult::Valid => &[],
            ValidationResult::Invalid(violations) => violations,
        }
    }
}

/// Check every cell of `batch` against `contract`. Never stops early; the
/// violations come back in row order.
pub fn validate(contract: &SchemaContract, batch: &RowBatch) -> ValidationResult {
    let positions: Vec<Option<usize>> = contract
        .fields()
        .iter()
        .map(|field| batch.column_index(&field.name))
        .collect();

    let mut violations = Vec::new();
    for (offset, row) in batch.rows.iter().enumerate() {
        for (field, position) in contract.fields().iter().zip(&positions) {
            let cell = position.and_then(|i| row.get(i)).unwrap_or(&Cell::Null);
            if let Some(reason) = check_cell(field, cell) {
                violations.push(Violation {
                    field: field.name.clone(),
                    row: batch.row_index(offset),
                    reason,
                });
            }
        }
    }

    if violations.is_empty() {
        ValidationResult::Valid
    } else {
        ValidationResult::Invalid(violations)
    }
}

fn check_cell(field: &FieldSpec, cell: &Cell) -> Option<String> {
    if cell.is_null() {
        return (!field.nullable).then(|| "null value in non-nullable field".to_string());
    }
    if !conforms(cell, field.semantic_type) {
        return Some(format!("expected {}, found {}", field.semantic_type, describe(cell)));
    }
    field
        .constraints
        .iter()
        .find_map(|constraint| check_constraint(constraint, cell))
}

fn conforms(cell: &Cell, semantic_type: SemanticType) -> bool {
    match (semantic_type, cell) {
        (_, Cell::Null) => true,
        (SemanticType::String, Cell::Text(_)) => true,
        (SemanticType::Integer, Cell::Integer(_)) => true,
        (SemanticType::Integer, Cell::Text(s)) => s.trim().parse::<i64>().is_ok(),
        (SemanticType::Boolean, Cell::Bool(_)) => true,
        (SemanticType::Boolean, Cell::Text(s)) => matches!(
            s.as_str(),
            "true" | "false" | "True" | "False" | "TRUE" | "FALSE"
        ),
        (SemanticType::Timestamp, Cell::Text(s)) => parse_timestamp(s).is_some(),
        _ => false,
    }
}

fn check_constraint(constraint: &Constraint, cell: &Cell) -> Option<String> {
    match constraint {
        Constraint::OneOf(allowed) => {
            let value = cell.to_string();
            (!allowed.iter().any(|a| *a == value))
                .then(|| format!("{} is not one of [{}]", describe(cell), allowed.join(", ")))
        }
        Constraint::Pattern(regex) => {
            let value = cell.to_string();
            let anchored = regex.find(&value).is_some_and(|m| m.start() == 0);
            (!anchored).then(|| format!("{} does not match {}", describe(cell), regex.as_str()))
        }
        Constraint::Range { min, max } => {
            let Some(value) = numeric_value(cell) else {
                return Some(format!("{} is not numeric", describe(cell)));
            };
            if let Some(min) = min.filter(|min| value < *min) {
                return Some(format!("{value} is below the minimum {min}"));
            }
            max.filter(|max| value > *max)
                .map(|max| format!("{value} is above the maximum {max}"))
        }
        Constraint::ParseableTimestamp => {
            let parses = cell.as_text().is_some_and(|s| parse_timestamp(s).is_some());
            (!parses).then(|| format!("{} is not a parseable timestamp", describe(cell)))
        }
    }
}

fn numeric_value(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Integer(i) => Some(*i as f64),
        Cell::Float(f) => Some(*f),
        Cell::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn describe(cell: &Cell) -> String {
    match cell {
        Cell::Text(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}
