use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crmload_core::{EntityRegistry, SourceShape};
use crmload_pipeline::{
    maybe_build_scheduler, EntityLocks, IngestConfig, Orchestrator, RunOutcome, ValidationPolicy,
};
use crmload_storage::{BackoffPolicy, JsonlFailureLog, PgWarehouse, StagingTarget, Warehouse};
use serde::Serialize;
use tracing::{info, warn};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "crmload")]
#[command(about = "Staged loader for CRM bulk exports")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load entities into their staging tables and run the upserts.
    Load(LoadArgs),
    /// Mark runs left IN_PROGRESS by an interrupted process as FAILED.
    Recover {
        entities: Vec<String>,
    },
    /// Create the batch ledger and every registered staging table.
    Migrate,
    /// List the registered entities.
    Entities {
        #[arg(long)]
        json: bool,
    },
    /// Show recent ledger rows.
    Status {
        #[arg(long)]
        entity: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Run loads on the LOAD_CRON schedule until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct LoadArgs {
    /// Entities to load; all registered entities when omitted.
    entities: Vec<String>,
    #[arg(long)]
    source_dir: Option<PathBuf>,
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long, value_parser = parse_policy)]
    policy: Option<ValidationPolicy>,
    /// Print run outcomes as JSON.
    #[arg(long)]
    json: bool,
}

fn parse_policy(value: &str) -> Result<ValidationPolicy, String> {
    value.parse().map_err(|err: crmload_pipeline::IngestError| err.to_string())
}

#[derive(Debug, Serialize)]
struct EntitySummary<'a> {
    name: &'a str,
    source_file: &'a str,
    format: String,
    staging_table: &'a str,
    upsert_procedure: &'a str,
    columns: Vec<String>,
    temporal_fields: &'a [String],
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(&logging::LogConfig::from_env()?)?;

    let config = IngestConfig::from_env().context("reading configuration")?;
    let registry = config.load_registry().await.context("loading entity registry")?;

    match cli.command.unwrap_or(Commands::Load(LoadArgs::default())) {
        Commands::Load(args) => load(config, &registry, args).await,
        Commands::Recover { entities } => {
            let names = selected_names(&registry, &entities)?;
            let orchestrator = orchestrator(config).await?;
            for name in names {
                let ids = orchestrator.recover(&name).await?;
                println!("{name}: {} abandoned run(s) marked FAILED {ids:?}", ids.len());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate => {
            let warehouse = connect(&config).await?;
            warehouse.migrate().await.context("applying ledger migrations")?;
            for entity in registry.entities() {
                let target = StagingTarget::for_entity(entity);
                warehouse
                    .ensure_staging_table(&target)
                    .await
                    .with_context(|| format!("creating {}", target.table))?;
                info!(table = %target.table, "staging table ready");
            }
            println!("migrations applied; {} staging table(s) ready", registry.entities().len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Entities { json } => {
            print_entities(&registry, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { entity, limit, json } => {
            let warehouse = connect(&config).await?;
            let runs = warehouse.recent_batches(entity.as_deref(), limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                for run in runs {
                    println!(
                        "{:>6}  {:<14} {:<11} {}  {}",
                        run.id,
                        run.entity,
                        run.status.as_str(),
                        run.start_time.format("%Y-%m-%d %H:%M:%S"),
                        run.exceptions.unwrap_or_default()
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => schedule(config, registry).await,
    }
}

async fn load(mut config: IngestConfig, registry: &EntityRegistry, args: LoadArgs) -> Result<ExitCode> {
    if let Some(dir) = args.source_dir {
        config.source_dir = dir;
    }
    if let Some(size) = args.chunk_size {
        anyhow::ensure!(size > 0, "--chunk-size must be at least 1");
        config.chunk_size = size;
    }
    if let Some(policy) = args.policy {
        config.validation_policy = policy;
    }

    let orchestrator = orchestrator(config).await?;
    let outcomes = orchestrator.run_many(registry, &args.entities).await?;
    report(&outcomes, args.json)?;

    if outcomes.iter().any(RunOutcome::is_failed) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn schedule(mut config: IngestConfig, registry: EntityRegistry) -> Result<ExitCode> {
    if !config.scheduler_enabled {
        warn!("CRMLOAD_SCHEDULER_ENABLED is not set; enabling for this process");
        config.scheduler_enabled = true;
    }
    let cron = config.load_cron.clone();
    let orchestrator = Arc::new(orchestrator(config).await?);
    let Some(mut sched) = maybe_build_scheduler(orchestrator, Arc::new(registry), EntityLocks::new()).await? else {
        return Ok(ExitCode::SUCCESS);
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(ExitCode::SUCCESS)
}

async fn connect(config: &IngestConfig) -> Result<PgWarehouse> {
    PgWarehouse::connect(&config.database, BackoffPolicy::with_retries(config.connect_retries))
        .await
        .context("connecting to the warehouse")
}

async fn orchestrator(config: IngestConfig) -> Result<Orchestrator> {
    let warehouse = connect(&config).await?;
    let failures = JsonlFailureLog::open(&config.failed_rows_log)
        .with_context(|| format!("opening {}", config.failed_rows_log.display()))?;
    Ok(Orchestrator::new(config, Arc::new(warehouse), Arc::new(failures)))
}

fn selected_names(registry: &EntityRegistry, requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(registry.names().into_iter().map(String::from).collect());
    }
    for name in requested {
        anyhow::ensure!(registry.get(name).is_some(), "unknown entity {name:?}");
    }
    Ok(requested.to_vec())
}

fn report(outcomes: &[RunOutcome], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcomes)?);
        return Ok(());
    }
    for outcome in outcomes {
        let batch = outcome
            .batch_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}: {} batch={} read={} inserted={} failed={} rejected={} violations={}",
            outcome.entity,
            outcome.status,
            batch,
            outcome.stats.rows_read,
            outcome.stats.rows_inserted,
            outcome.stats.rows_failed,
            outcome.stats.rows_rejected,
            outcome.stats.violations,
        );
        if let Some(error) = &outcome.error {
            println!("  error: {error}");
        }
    }
    Ok(())
}

fn print_entities(registry: &EntityRegistry, json: bool) -> Result<()> {
    let summaries: Vec<EntitySummary<'_>> = registry
        .entities()
        .iter()
        .map(|entity| EntitySummary {
            name: &entity.name,
            source_file: &entity.source_file,
            format: match entity.shape {
                SourceShape::Delimited { delimiter } => format!("delimited ({:?})", delimiter as char),
                SourceShape::JsonRecords => "json".to_string(),
            },
            staging_table: &entity.staging_table,
            upsert_procedure: &entity.upsert_procedure,
            columns: entity.contract.column_names(),
            temporal_fields: &entity.temporal_fields,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        for s in summaries {
            println!(
                "{:<14} {:<20} {:<16} -> {} / {}",
                s.name, s.source_file, s.format, s.staging_table, s.upsert_procedure
            );
        }
    }
    Ok(())
}
