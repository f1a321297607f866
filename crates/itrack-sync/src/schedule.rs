use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::reminders::{send_deadline_reminders, ReminderSender};
use crate::SyncPipeline;

/// Builds the sync and reminder cron jobs. `None` when the scheduler is disabled.
pub async fn build_scheduler(
    pipeline: Arc<SyncPipeline>,
    sender: Arc<dyn ReminderSender>,
) -> Result<Option<JobScheduler>> {
    let config = pipeline.config();
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let sync_cron = config.sync_cron.clone();
    let sync_pipeline = Arc::clone(&pipeline);
    let sync_job = Job::new_async(sync_cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&sync_pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    status = ?summary.status,
                    created = summary.totals.created,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating sync job for cron {sync_cron}"))?;
    sched.add(sync_job).await.context("adding sync job")?;

    let reminder_cron = config.reminder_cron.clone();
    let days_before = config.reminder_days_before;
    let reminder_pipeline = Arc::clone(&pipeline);
    let reminder_job = Job::new_async(reminder_cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&reminder_pipeline);
        let sender = Arc::clone(&sender);
        Box::pin(async move {
            let store = pipeline.store();
            if let Err(err) =
                send_deadline_reminders(store.as_ref(), sender.as_ref(), days_before, Utc::now())
                    .await
            {
                error!(error = %err, "scheduled reminders failed");
            }
        })
    })
    .with_context(|| format!("creating reminder job for cron {reminder_cron}"))?;
    sched.add(reminder_job).await.context("adding reminder job")?;

    Ok(Some(sched))
}

/// Runs one sync immediately, then keeps the cron jobs running until ctrl-c.
pub async fn run_scheduler_until_shutdown(
    pipeline: Arc<SyncPipeline>,
    sender: Arc<dyn ReminderSender>,
) -> Result<()> {
    let Some(mut sched) = build_scheduler(Arc::clone(&pipeline), sender).await? else {
        anyhow::bail!("scheduler is disabled; set ITRACK_SCHEDULER_ENABLED=true");
    };

    match pipeline.run_once().await {
        Ok(summary) => info!(run_id = %summary.run_id, status = ?summary.status, "startup sync finished"),
        Err(err) => error!(error = %err, "startup sync failed"),
    }

    sched.start().await.context("starting scheduler")?;
    info!(
        sync_cron = %pipeline.config().sync_cron,
        reminder_cron = %pipeline.config().reminder_cron,
        "scheduler running"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminders::LogReminderSender;
    use crate::SyncConfig;
    use itrack_storage::MemoryStore;

    fn pipeline(enabled: bool) -> Arc<SyncPipeline> {
        let config = SyncConfig {
            scheduler_enabled: enabled,
            ..SyncConfig::default()
        };
        Arc::new(SyncPipeline::new(config, Arc::new(MemoryStore::new())).expect("pipeline"))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let sched = build_scheduler(pipeline(false), Arc::new(LogReminderSender))
            .await
            .expect("build");
        assert!(sched.is_none());
    }

    #[tokio::test]
    async fn enabled_scheduler_accepts_default_crons() {
        let sched = build_scheduler(pipeline(true), Arc::new(LogReminderSender))
            .await
            .expect("build");
        assert!(sched.is_some());
    }
}
