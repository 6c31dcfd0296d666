use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crmload_core::{EntityConfig, EntityRegistry};
use crmload_sources::DEFAULT_CHUNK_SIZE;
use crmload_storage::DatabaseTarget;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::IngestError;

/// What happens to a chunk that breaks its contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Log the violations and load the chunk anyway; the database procedures
    /// have the final say.
    #[default]
    Warn,
    /// Drop the whole chunk.
    Reject,
}

impl fmt::Display for ValidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPolicy::Warn => f.write_str("warn"),
            ValidationPolicy::Reject => f.write_str("reject"),
        }
    }
}

impl FromStr for ValidationPolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(ValidationPolicy::Warn),
            "reject" => Ok(ValidationPolicy::Reject),
            _ => Err(IngestError::Config {
                key: "VALIDATION_POLICY".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// `DATABASE_URL` when set, otherwise the `DB_*` parts.
    pub database: DatabaseTarget,
    pub source_dir: PathBuf,
    /// Per-entity source paths from `<ENTITY>_FILE`, keyed by entity name.
    pub file_overrides: BTreeMap<String, PathBuf>,
    pub entities_file: Option<PathBuf>,
    pub chunk_size: usize,
    pub validation_policy: ValidationPolicy,
    pub recover_stale_runs: bool,
    pub connect_retries: usize,
    pub failed_rows_log: PathBuf,
    pub scheduler_enabled: bool,
    pub load_cron: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseTarget::Parts {
                host: "localhost".to_string(),
                port: 5432,
                username: "postgres".to_string(),
                password: None,
                database: "crm".to_string(),
            },
            source_dir: PathBuf::from("data/salesforce"),
            file_overrides: BTreeMap::new(),
            entities_file: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            validation_policy: ValidationPolicy::Warn,
            recover_stale_runs: true,
            connect_retries: 3,
            failed_rows_log: PathBuf::from("failed_rows.log"),
            scheduler_enabled: false,
            load_cron: "0 0 2 * * *".to_string(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, IngestError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, IngestError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        config.database = match get("DATABASE_URL") {
            Some(url) => DatabaseTarget::Url(url.to_string()),
            None => DatabaseTarget::Parts {
                host: get("DB_HOST").unwrap_or("localhost").to_string(),
                port: match get("DB_PORT") {
                    Some(port) => port.parse().map_err(|_| invalid("DB_PORT", port))?,
                    None => 5432,
                },
                username: get("DB_USER").unwrap_or("postgres").to_string(),
                // passwords are taken verbatim; surrounding spaces may be significant
                password: vars.get("DB_PASSWORD").filter(|p| !p.is_empty()).cloned(),
                database: get("DB_NAME").unwrap_or("crm").to_string(),
            },
        };
        if let Some(dir) = get("SOURCE_DIR") {
            config.source_dir = PathBuf::from(dir);
        }
        config.entities_file = get("ENTITIES_FILE").map(PathBuf::from);
        if let Some(size) = get("CHUNK_SIZE") {
            config.chunk_size = parse_number("CHUNK_SIZE", size)?;
            if config.chunk_size == 0 {
                return Err(invalid("CHUNK_SIZE", size));
            }
        }
        if let Some(policy) = get("VALIDATION_POLICY") {
            config.validation_policy = policy.parse()?;
        }
        if let Some(flag) = get("RECOVER_STALE_RUNS") {
            config.recover_stale_runs = parse_flag("RECOVER_STALE_RUNS", flag)?;
        }
        if let Some(retries) = get("DB_CONNECT_RETRIES") {
            config.connect_retries = parse_number("DB_CONNECT_RETRIES", retries)?;
        }
        if let Some(path) = get("FAILED_ROWS_LOG") {
            config.failed_rows_log = PathBuf::from(path);
        }
        if let Some(flag) = get("CRMLOAD_SCHEDULER_ENABLED") {
            config.scheduler_enabled = parse_flag("CRMLOAD_SCHEDULER_ENABLED", flag)?;
        }
        if let Some(cron) = get("LOAD_CRON") {
            config.load_cron = cron.to_string();
        }

        for (key, value) in &vars {
            let Some(entity) = key.strip_suffix("_FILE") else {
                continue;
            };
            if entity == "ENTITIES" || entity.is_empty() || value.trim().is_empty() {
                continue;
            }
            config
                .file_overrides
                .insert(entity.to_ascii_lowercase(), PathBuf::from(value.trim()));
        }

        Ok(config)
    }

    /// `<ENTITY>_FILE` when set, otherwise the entity's file under `source_dir`.
    pub fn source_path(&self, entity: &EntityConfig) -> PathBuf {
        self.file_overrides
            .get(&entity.name)
            .cloned()
            .unwrap_or_else(|| self.source_dir.join(&entity.source_file))
    }

    pub async fn load_registry(&self) -> Result<EntityRegistry, IngestError> {
        let Some(path) = &self.entities_file else {
            return Ok(EntityRegistry::builtin()?);
        };
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| IngestError::Registry {
                path: path.clone(),
                source,
            })?;
        Ok(EntityRegistry::from_yaml_str(&text)?)
    }
}

fn invalid(key: &str, value: &str) -> IngestError {
    IngestError::Config {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, IngestError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, IngestError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}
