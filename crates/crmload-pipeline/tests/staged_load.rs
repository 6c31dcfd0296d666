use std::fmt::Write as _;
use std::sync::Arc;

use crmload_core::{BatchStatus, EntityRegistry};
use crmload_pipeline::{
    run_tick, EntityLocks, IngestConfig, Orchestrator, RunOutcome, ValidationPolicy, ABANDONED_DETAIL,
};
use crmload_storage::{MemoryFailureLog, MemoryWarehouse};
use tempfile::TempDir;

const COMPANIES_HEADER: &str = "id,name,domain,industry,size,country,created_date,is_customer,annual_revenue";

struct Harness {
    dir: TempDir,
    warehouse: MemoryWarehouse,
    failures: Arc<MemoryFailureLog>,
    registry: EntityRegistry,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            warehouse: MemoryWarehouse::new(),
            failures: Arc::new(MemoryFailureLog::new()),
            registry: EntityRegistry::builtin().unwrap(),
        }
    }

    fn write(&self, file: &str, contents: &str) {
        std::fs::write(self.dir.path().join(file), contents).unwrap();
    }

    fn config(&self) -> IngestConfig {
        IngestConfig {
            source_dir: self.dir.path().to_path_buf(),
            ..IngestConfig::default()
        }
    }

    fn orchestrator(&self, config: IngestConfig) -> Orchestrator {
        Orchestrator::new(config, Arc::new(self.warehouse.clone()), self.failures.clone())
    }

    async fn run(&self, entity: &str) -> RunOutcome {
        self.run_with(entity, self.config()).await
    }

    async fn run_with(&self, entity: &str, config: IngestConfig) -> RunOutcome {
        let entity = self.registry.get(entity).unwrap();
        self.orchestrator(config).run(entity).await
    }
}

fn companies_csv(rows: usize, bad_revenue_at: Option<usize>) -> String {
    let mut csv = format!("{COMPANIES_HEADER}\n");
    for i in 0..rows {
        let revenue = if Some(i) == bad_revenue_at {
            "about a million".to_string()
        } else {
            (1_000 * i).to_string()
        };
        writeln!(
            csv,
            "c{i},Company {i},c{i}.example.com,Software,51-200,US,2023-0{}-15,{},{revenue}",
            i % 9 + 1,
            if i % 2 == 0 { "True" } else { "False" },
        )
        .unwrap();
    }
    csv
}

fn contacts_json() -> &'static str {
    r#"[
  {"id": "ct1", "email": "ada@example.com", "first_name": "Ada", "last_name": "Lovelace",
   "title": "CTO", "company_id": "c1", "phone": "555-0100", "status": "Customer",
   "created_date": "2024-01-05T08:00:00Z", "last_modified": "2024-02-01"},
  {"id": "ct2", "email": "", "first_name": "Alan", "last_name": "Turing",
   "title": "Engineer", "company_id": "c1", "phone": "555-0101", "status": "Prospect",
   "created_date": "2024-01-06", "last_modified": "someday"}
]"#
}

#[tokio::test]
async fn large_csv_is_loaded_in_bounded_chunks() {
    let h = Harness::new();
    h.write("companies.csv", &companies_csv(12_500, None));

    let outcome = h.run("companies").await;

    assert_eq!(outcome.status, BatchStatus::Completed, "{:?}", outcome.error);
    assert_eq!(outcome.stats.chunks, 2);
    assert_eq!(outcome.stats.rows_read, 12_500);
    assert_eq!(outcome.stats.rows_inserted, 12_500);
    assert_eq!(outcome.stats.violations, 0);

    let batch_id = outcome.batch_id.unwrap();
    let staged = h.warehouse.staged_rows("stg_companies");
    assert_eq!(staged.len(), 12_500);
    assert!(staged.iter().all(|r| r.batch_id == batch_id));
    assert_eq!(
        staged[0].values["created_date"].as_deref(),
        Some("2023-01-15 00:00:00")
    );

    let ledger = h.warehouse.batch(batch_id).unwrap();
    assert_eq!(ledger.status, BatchStatus::Completed);
    assert!(ledger.end_time.is_some());
    assert_eq!(
        h.warehouse.procedure_calls(),
        vec!["run_validations()".to_string(), format!("UpsertCompanies({batch_id})")]
    );
    assert!(h.failures.records().is_empty());
}

#[tokio::test]
async fn one_bad_row_is_isolated_and_the_rest_are_staged() {
    let h = Harness::new();
    h.write("companies.csv", &companies_csv(100, Some(42)));

    let outcome = h.run("companies").await;

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.stats.violations, 1);
    assert_eq!(outcome.stats.rows_failed, 1);
    assert_eq!(outcome.stats.rows_inserted, 99);
    assert_eq!(h.warehouse.staged_rows("stg_companies").len(), 99);

    let failures = h.failures.records();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].row_index, 42);
    assert_eq!(failures[0].entity, "companies");
    assert_eq!(failures[0].batch_id, outcome.batch_id);
    assert_eq!(failures[0].row["id"].to_string(), "c42");
    // the row as sent to the staging table, timestamps already canonical
    assert_eq!(failures[0].row["created_date"].to_string(), "2023-07-15 00:00:00");
}

#[tokio::test]
async fn missing_source_fails_the_opened_ledger_row() {
    let h = Harness::new();

    let outcome = h.run("companies").await;

    assert_eq!(outcome.status, BatchStatus::Failed);
    let detail = outcome.error.clone().unwrap();
    assert!(detail.contains("companies.csv"), "{detail}");

    let ledger = h.warehouse.batch(outcome.batch_id.unwrap()).unwrap();
    assert_eq!(ledger.status, BatchStatus::Failed);
    assert_eq!(ledger.exceptions.as_deref(), Some(detail.as_str()));
    assert!(h.warehouse.procedure_calls().is_empty());
}

#[tokio::test]
async fn procedure_failure_rolls_back_the_staged_rows() {
    let h = Harness::new();
    h.write("companies.csv", &companies_csv(10, None));
    h.warehouse.fail_procedure("UpsertCompanies");

    let outcome = h.run("companies").await;

    assert!(outcome.is_failed());
    assert_eq!(outcome.stats.rows_inserted, 10);
    let ledger = h.warehouse.batch(outcome.batch_id.unwrap()).unwrap();
    assert_eq!(ledger.status, BatchStatus::Failed);
    assert!(ledger.exceptions.unwrap().contains("UpsertCompanies"));
    assert!(h.warehouse.staged_rows("stg_companies").is_empty());
}

#[tokio::test]
async fn unreachable_warehouse_fails_without_a_ledger_row() {
    let h = Harness::new();
    h.write("companies.csv", &companies_csv(3, None));
    h.warehouse.refuse_connections(true);

    let outcome = h.run("companies").await;

    assert!(outcome.is_failed());
    assert_eq!(outcome.batch_id, None);
    assert!(outcome.error.unwrap().contains("unavailable"));
    assert!(h.warehouse.batches().is_empty());
}

#[tokio::test]
async fn connection_lost_mid_load_fails_the_run_instead_of_rows() {
    let h = Harness::new();
    h.write("companies.csv", &companies_csv(100, Some(42)));
    // the bulk insert is refused on its data, then the link drops during the row retry
    h.warehouse.drop_connection_after(1);

    let outcome = h.run("companies").await;

    assert!(outcome.is_failed());
    assert!(outcome.error.as_deref().unwrap().contains("unavailable"));
    assert_eq!(outcome.stats.rows_failed, 0);
    assert!(h.failures.records().is_empty());

    let ledger = h.warehouse.batch(outcome.batch_id.unwrap()).unwrap();
    assert_eq!(ledger.status, BatchStatus::Failed);
    assert!(ledger.end_time.is_some());
    assert!(h.warehouse.staged_rows("stg_companies").is_empty());
    assert!(h.warehouse.procedure_calls().is_empty());
}

#[tokio::test]
async fn stale_runs_are_superseded() {
    let h = Harness::new();
    h.write("companies.csv", &companies_csv(3, None));
    let stale = h.warehouse.seed_batch("companies", BatchStatus::InProgress);
    let other = h.warehouse.seed_batch("contacts", BatchStatus::InProgress);

    let outcome = h.run("companies").await;

    assert_eq!(outcome.status, BatchStatus::Completed);
    let stale = h.warehouse.batch(stale).unwrap();
    assert_eq!(stale.status, BatchStatus::Failed);
    assert_eq!(stale.exceptions.as_deref(), Some(ABANDONED_DETAIL));
    assert_eq!(h.warehouse.batch(other).unwrap().status, BatchStatus::InProgress);
}

#[tokio::test]
async fn stale_recovery_can_be_disabled_and_run_on_demand() {
    let h = Harness::new();
    h.write("companies.csv", &companies_csv(3, None));
    let stale = h.warehouse.seed_batch("companies", BatchStatus::InProgress);
    let config = IngestConfig {
        recover_stale_runs: false,
        ..h.config()
    };

    h.run_with("companies", config.clone()).await;
    assert_eq!(h.warehouse.batch(stale).unwrap().status, BatchStatus::InProgress);

    let recovered = h.orchestrator(config).recover("companies").await.unwrap();
    assert_eq!(recovered, vec![stale]);
    assert_eq!(h.warehouse.batch(stale).unwrap().status, BatchStatus::Failed);
}

#[tokio::test]
async fn reordered_and_extra_columns_load_without_loss() {
    let h = Harness::new();
    h.write(
        "companies.csv",
        "annual_revenue,id,name,domain,industry,size,country,created_date,is_customer,region\n\
         5000,c1,Acme,acme.io,Retail,1-10,DE,2024-02-29,TRUE,EMEA\n",
    );

    let outcome = h.run("companies").await;

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.stats.shape_warnings, 2);
    let staged = h.warehouse.staged_rows("stg_companies");
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].values["id"].as_deref(), Some("c1"));
    assert_eq!(staged[0].values["annual_revenue"].as_deref(), Some("5000"));
    assert_eq!(staged[0].values["is_customer"].as_deref(), Some("true"));
    assert!(!staged[0].values.contains_key("region"));
}

#[tokio::test]
async fn json_violations_warn_by_default() {
    let h = Harness::new();
    h.write("contacts.json", contacts_json());

    let outcome = h.run("contacts").await;

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.stats.chunks, 1);
    assert_eq!(outcome.stats.violations, 2);
    assert_eq!(outcome.stats.coerced_timestamps, 1);
    assert_eq!(outcome.stats.rows_inserted, 2);

    let staged = h.warehouse.staged_rows("stg_contacts");
    assert_eq!(staged[0].values["created_date"].as_deref(), Some("2024-01-05 08:00:00"));
    assert_eq!(staged[1].values["last_modified"], None);
}

#[tokio::test]
async fn reject_policy_drops_invalid_chunks() {
    let h = Harness::new();
    h.write("contacts.json", contacts_json());
    let config = IngestConfig {
        validation_policy: ValidationPolicy::Reject,
        ..h.config()
    };

    let outcome = h.run_with("contacts", config).await;

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.stats.rows_rejected, 2);
    assert_eq!(outcome.stats.rows_inserted, 0);
    assert!(h.warehouse.staged_rows("stg_contacts").is_empty());
}

#[tokio::test]
async fn a_new_run_replaces_the_previous_staging_contents() {
    let h = Harness::new();
    h.write("companies.csv", &companies_csv(5, None));
    let first = h.run("companies").await;
    h.write("companies.csv", &companies_csv(2, None));
    let second = h.run("companies").await;

    assert_ne!(first.batch_id, second.batch_id);
    let staged = h.warehouse.staged_rows("stg_companies");
    assert_eq!(staged.len(), 2);
    assert!(staged.iter().all(|r| Some(r.batch_id) == second.batch_id));
}

#[tokio::test]
async fn run_many_rejects_unknown_entities_up_front() {
    let h = Harness::new();
    let orchestrator = h.orchestrator(h.config());
    let err = orchestrator
        .run_many(&h.registry, &["companies".to_string(), "leads".to_string()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("leads"));
    assert!(h.warehouse.batches().is_empty());
}

#[tokio::test]
async fn scheduler_tick_skips_entities_still_running() {
    let h = Harness::new();
    h.write("companies.csv", &companies_csv(2, None));
    h.write("contacts.json", contacts_json());
    h.write("opportunities.csv", "id\n");
    h.write("activities.json", "[]");
    let orchestrator = h.orchestrator(h.config());
    let locks = EntityLocks::new();

    let held = locks.try_acquire("companies").unwrap();
    let report = run_tick(&orchestrator, &h.registry, &locks).await;
    drop(held);

    assert_eq!(report.skipped, vec!["companies".to_string()]);
    assert_eq!(report.outcomes.len(), 3);
    assert!(report.outcomes.iter().all(|o| o.entity != "companies"));
    assert!(h.warehouse.staged_rows("stg_companies").is_empty());
    assert!(h.warehouse.batches().iter().all(|b| b.entity != "companies"));
}
