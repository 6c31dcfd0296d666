//! Per-entity wiring: which file feeds which staging table under which contract.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::contract::{FieldSpec, SchemaContract};
use crate::{ensure_sql_identifier, ContractError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceShape {
    /// Header row plus delimited records, read in fixed-size chunks.
    Delimited { delimiter: u8 },
    /// A JSON array of flat objects, materialized as one batch.
    JsonRecords,
}

impl SourceShape {
    pub fn csv() -> Self {
        SourceShape::Delimited { delimiter: b',' }
    }

    fn from_format(format: Option<&str>, file: &str, delimiter: Option<char>) -> Result<Self, ContractError> {
        let format = match format {
            Some(f) => f.to_ascii_lowercase(),
            None => Path::new(file)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("csv")
                .to_ascii_lowercase(),
        };
        match format.as_str() {
            "csv" | "tsv" | "delimited" => {
                let default = if format == "tsv" { '\t' } else { ',' };
                let delimiter = delimiter.unwrap_or(default);
                let byte = u8::try_from(delimiter)
                    .map_err(|_| ContractError::UnknownFormat(format!("delimiter {delimiter:?}")))?;
                Ok(SourceShape::Delimited { delimiter: byte })
            }
            "json" => Ok(SourceShape::JsonRecords),
            other => Err(ContractError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntityConfig {
    pub name: String,
    pub source_file: String,
    pub shape: SourceShape,
    pub staging_table: String,
    pub upsert_procedure: String,
    pub contract: SchemaContract,
    pub temporal_fields: Vec<String>,
}

impl EntityConfig {
    pub fn new(
        name: impl Into<String>,
        source_file: impl Into<String>,
        shape: SourceShape,
        contract: SchemaContract,
        temporal_fields: &[&str],
    ) -> Result<Self, ContractError> {
        let name = name.into();
        let staging_table = format!("stg_{name}");
        let upsert_procedure = format!("Upsert{}", capitalize(&name));
        Self {
            name,
            source_file: source_file.into(),
            shape,
            staging_table,
            upsert_procedure,
            contract,
            temporal_fields: temporal_fields.iter().map(|s| s.to_string()).collect(),
        }
        .checked()
    }

    fn checked(self) -> Result<Self, ContractError> {
        ensure_sql_identifier(&self.staging_table)?;
        ensure_sql_identifier(&self.upsert_procedure)?;
        for field in &self.temporal_fields {
            if self.contract.field(field).is_none() {
                return Err(ContractError::UnknownTemporalField {
                    entity: self.name.clone(),
                    field: field.clone(),
                });
            }
        }
        Ok(self)
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone)]
pub struct EntityRegistry {
    entities: Vec<EntityConfig>,
}

impl EntityRegistry {
    pub fn new(entities: Vec<EntityConfig>) -> Result<Self, ContractError> {
        let mut seen = HashSet::new();
        for entity in &entities {
            if !seen.insert(entity.name.clone()) {
                return Err(ContractError::DuplicateEntity(entity.name.clone()));
            }
        }
        Ok(Self { entities })
    }

    /// The four CRM exports: companies and opportunities arrive as CSV,
    /// contacts and activities as JSON.
    pub fn builtin() -> Result<Self, ContractError> {
        Self::new(vec![
            companies()?,
            contacts()?,
            opportunities()?,
            activities()?,
        ])
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ContractError> {
        let file: RegistryFile = serde_yaml::from_str(text)?;
        let entities = file
            .entities
            .into_iter()
            .map(RawEntity::into_config)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(entities)
    }

    pub fn get(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entities(&self) -> &[EntityConfig] {
        &self.entities
    }

    pub fn names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }
}

fn companies() -> Result<EntityConfig, ContractError> {
    let contract = SchemaContract::new(
        "companies",
        vec![
            FieldSpec::string("id"),
            FieldSpec::string("name"),
            FieldSpec::string("domain"),
            FieldSpec::string("industry"),
            FieldSpec::string("size"),
            FieldSpec::string("country"),
            FieldSpec::string("created_date"),
            FieldSpec::boolean("is_customer"),
            FieldSpec::integer("annual_revenue"),
        ],
    )?;
    EntityConfig::new("companies", "companies.csv", SourceShape::csv(), contract, &["created_date"])
}

fn contacts() -> Result<EntityConfig, ContractError> {
    let contract = SchemaContract::new(
        "contacts",
        vec![
            FieldSpec::string("id"),
            FieldSpec::string("email").matching(r"[^@]+@[^@]+\.[^@]+")?,
            FieldSpec::string("first_name"),
            FieldSpec::string("last_name"),
            FieldSpec::string("title"),
            FieldSpec::string("company_id"),
            FieldSpec::string("phone"),
            FieldSpec::string("status").one_of(["Qualified", "Lead", "Customer", "Churned"]),
            FieldSpec::string("created_date"),
            FieldSpec::string("last_modified"),
        ],
    )?;
    EntityConfig::new(
        "contacts",
        "contacts.json",
        SourceShape::JsonRecords,
        contract,
        &["created_date", "last_modified"],
    )
}

fn opportunities() -> Result<EntityConfig, ContractError> {
    let contract = SchemaContract::new(
        "opportunities",
        vec![
            FieldSpec::string("id"),
            FieldSpec::string("name"),
            FieldSpec::string("contact_id"),
            FieldSpec::string("company_id"),
            FieldSpec::integer("amount"),
            FieldSpec::string("stage"),
            FieldSpec::string("product"),
            FieldSpec::integer("probability"),
            FieldSpec::string("created_date").parseable_timestamp(),
            FieldSpec::string("close_date").parseable_timestamp(),
            FieldSpec::boolean("is_closed"),
            FieldSpec::string("forecast_category"),
        ],
    )?;
    EntityConfig::new(
        "opportunities",
        "opportunities.csv",
        SourceShape::csv(),
        contract,
        &["created_date", "close_date"],
    )
}

fn activities() -> Result<EntityConfig, ContractError> {
    let contract = SchemaContract::new(
        "activities",
        vec![
            FieldSpec::string("id"),
            FieldSpec::string("contact_id"),
            FieldSpec::string("opportunity_id").nullable(),
            FieldSpec::string("type"),
            FieldSpec::string("subject"),
            FieldSpec::timestamp("timestamp"),
            FieldSpec::integer("duration_minutes").range(Some(0.0), None),
            FieldSpec::string("outcome").one_of(["Completed", "Rescheduled", "No Show"]),
            FieldSpec::string("notes").nullable(),
        ],
    )?;
    EntityConfig::new(
        "activities",
        "activities.json",
        SourceShape::JsonRecords,
        contract,
        &["timestamp"],
    )
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    entities: Vec<RawEntity>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    source_file: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    delimiter: Option<char>,
    #[serde(default)]
    staging_table: Option<String>,
    #[serde(default)]
    upsert_procedure: Option<String>,
    #[serde(default)]
    temporal_fields: Vec<String>,
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    name: String,
    #[serde(rename = "type", default = "default_type")]
    semantic_type: String,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    one_of: Option<Vec<String>>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    parseable_timestamp: bool,
}

fn default_type() -> String {
    "string".to_string()
}

impl RawField {
    fn into_spec(self) -> Result<FieldSpec, ContractError> {
        let mut spec = FieldSpec::new(self.name, self.semantic_type.parse()?);
        spec.nullable = self.nullable;
        if let Some(values) = self.one_of {
            spec = spec.one_of(values);
        }
        if let Some(pattern) = self.pattern {
            spec = spec.matching(&pattern)?;
        }
        if self.min.is_some() || self.max.is_some() {
            spec = spec.range(self.min, self.max);
        }
        if self.parseable_timestamp {
            spec = spec.parseable_timestamp();
        }
        Ok(spec)
    }
}

impl RawEntity {
    fn into_config(self) -> Result<EntityConfig, ContractError> {
        let shape = SourceShape::from_format(self.format.as_deref(), &self.source_file, self.delimiter)?;
        let fields = self
            .fields
            .into_iter()
            .map(RawField::into_spec)
            .collect::<Result<Vec<_>, _>>()?;
        let contract = SchemaContract::new(self.name.clone(), fields)?;
        let staging_table = self
            .staging_table
            .unwrap_or_else(|| format!("stg_{}", self.name));
        let upsert_procedure = self
            .upsert_procedure
            .unwrap_or_else(|| format!("Upsert{}", capitalize(&self.name)));
        EntityConfig {
            name: self.name,
            source_file: self.source_file,
            shape,
            staging_table,
            upsert_procedure,
            contract,
            temporal_fields: self.temporal_fields,
        }
        .checked()
    }
}
