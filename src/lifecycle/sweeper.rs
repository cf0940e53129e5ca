//! Inactivity sweeper and ledger retention job
//!
//! Runs on a tokio-cron-scheduler schedule. Each run abandons flows idle
//! longer than the configured window, then prunes every flow's ledger.

use crate::config::LifecycleConfig;
use crate::error::Result as FlowResult;
use crate::store::FlowStore;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub abandoned: Vec<String>,
    pub pruned_rows: u64,
}

/// One sweep over every flow
///
/// A flow whose prune fails is logged and skipped.
pub async fn sweep(store: &FlowStore, inactivity_days: i64) -> FlowResult<SweepReport> {
    let abandoned = store
        .abandon_inactive(chrono::Duration::days(inactivity_days.max(0)))
        .await?;

    let mut pruned_rows = 0;
    for flow_id in store.flow_ids().await? {
        match store.prune(&flow_id).await {
            Ok(removed) => pruned_rows += removed,
            Err(e) => tracing::warn!("⚠️ Ledger prune of flow {} failed: {}", flow_id, e),
        }
    }

    Ok(SweepReport {
        abandoned,
        pruned_rows,
    })
}

/// Owns the scheduler that runs `sweep`
pub struct LifecycleService {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_id: RwLock<Option<Uuid>>,
    store: Arc<FlowStore>,
    config: LifecycleConfig,
}

impl LifecycleService {
    pub async fn new(store: Arc<FlowStore>, config: LifecycleConfig) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_id: RwLock::new(None),
            store,
            config,
        })
    }

    /// Register the sweep job and start the scheduler
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            "⏰ Starting lifecycle sweeper (schedule: {}, inactivity: {} days)",
            self.config.sweep_schedule,
            self.config.inactivity_days
        );

        let store = Arc::clone(&self.store);
        let inactivity_days = self.config.inactivity_days;
        let job = Job::new_async(self.config.sweep_schedule.as_str(), move |_uuid, _l| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                tracing::debug!("🔔 Lifecycle sweep triggered");
                match sweep(&store, inactivity_days).await {
                    Ok(report) => tracing::info!(
                        "🧹 Sweep finished: {} flows abandoned, {} ledger rows pruned",
                        report.abandoned.len(),
                        report.pruned_rows
                    ),
                    Err(e) => tracing::error!("❌ Lifecycle sweep failed: {}", e),
                }
            })
        })?;

        let scheduler = self.scheduler.read().await;
        let uuid = scheduler.add(job).await?;
        *self.job_id.write().await = Some(uuid);
        scheduler.start().await?;

        tracing::info!("✅ Lifecycle sweeper started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping lifecycle sweeper");
        if let Some(uuid) = self.job_id.write().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&uuid).await {
                tracing::warn!("⚠️ Failed to remove sweep job {}: {}", uuid, e);
            }
        }
        self.scheduler.write().await.shutdown().await?;
        tracing::info!("✅ Lifecycle sweeper stopped");
        Ok(())
    }

    /// Run a sweep immediately, outside the schedule
    pub async fn run_now(&self) -> FlowResult<SweepReport> {
        sweep(&self.store, self.config.inactivity_days).await
    }
}
