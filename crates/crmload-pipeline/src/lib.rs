//! Staged-load pipeline: reconcile, validate, normalize and bulk-load source
//! chunks under a batch ledger, then hand the batch to server-side upserts.

use std::path::PathBuf;

use crmload_core::ContractError;
use crmload_sources::SourceError;
use crmload_storage::StoreError;
use thiserror::Error;

pub mod config;
pub mod loader;
pub mod normalize;
pub mod orchestrator;
pub mod reconcile;
pub mod schedule;
pub mod validate;

pub use config::{IngestConfig, ValidationPolicy};
pub use loader::{BulkLoader, LoadReport};
pub use normalize::normalize;
pub use orchestrator::{Orchestrator, RunOutcome, RunStats, ABANDONED_DETAIL};
pub use reconcile::{reconcile, ShapeWarning};
pub use schedule::{maybe_build_scheduler, run_tick, EntityLocks, TickReport};
pub use validate::{validate, ValidationResult, Violation};

pub const CRATE_NAME: &str = "crmload-pipeline";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("unknown entity {0:?}")]
    UnknownEntity(String),
    #[error("invalid value {value:?} for {key}")]
    Config { key: String, value: String },
    #[error("reading entity registry {}: {source}", path.display())]
    Registry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
