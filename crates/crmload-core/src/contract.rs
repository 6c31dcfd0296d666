use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ensure_sql_identifier, ContractError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    String,
    Integer,
    Boolean,
    Timestamp,
}

impl SemanticType {
    /// Column type used for the staging table and the insert-time cast.
    pub fn sql_type(self) -> &'static str {
        match self {
            SemanticType::String => "TEXT",
            SemanticType::Integer => "BIGINT",
            SemanticType::Boolean => "BOOLEAN",
            SemanticType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SemanticType::String => "string",
            SemanticType::Integer => "integer",
            SemanticType::Boolean => "boolean",
            SemanticType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

impl FromStr for SemanticType {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Ok(SemanticType::String),
            "integer" | "int" => Ok(SemanticType::Integer),
            "boolean" | "bool" => Ok(SemanticType::Boolean),
            "timestamp" | "datetime" => Ok(SemanticType::Timestamp),
            other => Err(ContractError::UnknownType(other.to_string())),
        }
    }
}

/// Value predicate attached to a field, checked only for non-null cells that
/// already conform to the field's type.
#[derive(Debug, Clone)]
pub enum Constraint {
    OneOf(Vec<String>),
    Pattern(Regex),
    Range { min: Option<f64>, max: Option<f64> },
    ParseableTimestamp,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub constraints: Vec<Constraint>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            nullable: false,
            constraints: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Integer)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Boolean)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Timestamp)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraints
            .push(Constraint::OneOf(values.into_iter().map(Into::into).collect()));
        self
    }

    /// Values must match `pattern` starting at their first character; the
    /// end is left open.
    pub fn matching(mut self, pattern: &str) -> Result<Self, ContractError> {
        let regex = Regex::new(pattern).map_err(|source| ContractError::InvalidPattern {
            field: self.name.clone(),
            source,
        })?;
        self.constraints.push(Constraint::Pattern(regex));
        Ok(self)
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.constraints.push(Constraint::Range { min, max });
        self
    }

    pub fn parseable_timestamp(mut self) -> Self {
        self.constraints.push(Constraint::ParseableTimestamp);
        self
    }
}

/// Immutable per-entity rule set. Field order is the canonical column order.
#[derive(Debug, Clone)]
pub struct SchemaContract {
    entity: String,
    fields: Vec<FieldSpec>,
}

impl SchemaContract {
    pub fn new(entity: impl Into<String>, fields: Vec<FieldSpec>) -> Result<Self, ContractError> {
        let entity = entity.into();
        if fields.is_empty() {
            return Err(ContractError::Empty { entity });
        }
        let mut seen = HashSet::new();
        for field in &fields {
            ensure_sql_identifier(&field.name)?;
            if field.name.contains('.') || field.name.eq_ignore_ascii_case("batch_id") {
                return Err(ContractError::InvalidIdentifier(field.name.clone()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ContractError::DuplicateField {
                    entity,
                    field: field.name.clone(),
                });
            }
        }
        Ok(Self { entity, fields })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}
