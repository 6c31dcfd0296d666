//! Cron-driven loads with one writer per entity.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use crmload_core::EntityRegistry;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::orchestrator::{Orchestrator, RunOutcome};

/// Entities with a run in flight inside this process.
#[derive(Debug, Default, Clone)]
pub struct EntityLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

/// Releases the entity when dropped.
#[derive(Debug)]
pub struct EntityGuard {
    entity: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while another run holds `entity`.
    pub fn try_acquire(&self, entity: &str) -> Option<EntityGuard> {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.insert(entity.to_string()).then(|| EntityGuard {
            entity: entity.to_string(),
            active: Arc::clone(&self.active),
        })
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.entity);
    }
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub outcomes: Vec<RunOutcome>,
    /// Entities whose previous run was still active.
    pub skipped: Vec<String>,
}

/// One scheduler tick: every registered entity in registry order.
pub async fn run_tick(orchestrator: &Orchestrator, registry: &EntityRegistry, locks: &EntityLocks) -> TickReport {
    let mut report = TickReport::default();
    for entity in registry.entities() {
        let Some(_guard) = locks.try_acquire(&entity.name) else {
            warn!(entity = %entity.name, "previous run still active; skipping tick");
            report.skipped.push(entity.name.clone());
            continue;
        };
        let outcome = orchestrator.run(entity).await;
        if outcome.is_failed() {
            error!(
                entity = %outcome.entity,
                batch_id = ?outcome.batch_id,
                error = outcome.error.as_deref().unwrap_or_default(),
                "scheduled run failed"
            );
        }
        report.outcomes.push(outcome);
    }
    report
}

/// `None` unless scheduling is enabled in the orchestrator's config.
pub async fn maybe_build_scheduler(
    orchestrator: Arc<Orchestrator>,
    registry: Arc<EntityRegistry>,
    locks: EntityLocks,
) -> Result<Option<JobScheduler>> {
    let config = orchestrator.config();
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let cron = config.load_cron.clone();

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        let registry = Arc::clone(&registry);
        let locks = locks.clone();
        Box::pin(async move {
            let report = run_tick(&orchestrator, &registry, &locks).await;
            info!(
                runs = report.outcomes.len(),
                failed = report.outcomes.iter().filter(|o| o.is_failed()).count(),
                skipped = report.skipped.len(),
                "scheduled load finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
