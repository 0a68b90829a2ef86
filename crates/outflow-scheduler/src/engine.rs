//! Scheduler engine — the worker loop that claims and executes due jobs.
//! Uses tokio::interval for zero-overhead ticking (sleeps between checks).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use outflow_core::error::{OutflowError, Result};

use crate::jobs::{Job, JobState, RetryPolicy};
use crate::persistence::JobStore;

/// Executes one job. Implementations must be idempotent: a job may be
/// delivered more than once after a worker crash.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Per-run retry counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryStats {
    pub executed: u32,
    pub retried: u32,
    pub parked: u32,
}

/// The scheduler engine — claims due jobs and dispatches them.
pub struct SchedulerEngine {
    store: Arc<JobStore>,
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
    batch_size: usize,
}

impl SchedulerEngine {
    pub fn new(store: Arc<JobStore>, handler: Arc<dyn JobHandler>, policy: RetryPolicy) -> Self {
        Self {
            store,
            handler,
            policy,
            batch_size: 10,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Run one tick: claim due jobs, execute each, record the outcome.
    pub async fn tick(&self) -> Result<RetryStats> {
        let mut stats = RetryStats::default();
        let due = self.store.claim_due(Utc::now(), self.batch_size)?;

        for job in due {
            stats.executed += 1;
            tracing::debug!(job_id = %job.id, kind = job.kind.as_str(), attempt = job.attempts, "executing job");

            match self.handler.handle(&job).await {
                Ok(()) => {
                    self.store.complete(&job.id)?;
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    // Permanent errors also drop sibling jobs for the same
                    // dead resource instead of letting them retry forever.
                    if let OutflowError::Permanent(_) = err
                        && let Some(account_id) = &job.account_id
                    {
                        let removed = self.store.remove_for_account(account_id)?;
                        if removed > 0 {
                            tracing::warn!(
                                account_id = %account_id,
                                removed,
                                "removed jobs for missing resource"
                            );
                        }
                    }
                    match self.store.fail(&job, &err.to_string(), retryable, &self.policy)? {
                        JobState::Queued => {
                            stats.retried += 1;
                            tracing::warn!(
                                job_id = %job.id,
                                attempt = job.attempts,
                                max = job.max_attempts,
                                error = %err,
                                "job failed, retrying with backoff"
                            );
                        }
                        _ => {
                            stats.parked += 1;
                            tracing::error!(job_id = %job.id, error = %err, "job parked for manual review");
                        }
                    }
                }
            }
        }

        Ok(stats)
    }
}

/// Spawn the scheduler loop as a background tokio task. Runs until the
/// returned handle is aborted or the process shuts down.
pub fn spawn_scheduler(
    engine: Arc<SchedulerEngine>,
    tick_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("⏰ Scheduler started (check every {tick_secs}s)");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match engine.tick().await {
                Ok(stats) if stats.executed > 0 => {
                    tracing::info!(
                        executed = stats.executed,
                        retried = stats.retried,
                        parked = stats.parked,
                        "scheduler tick"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!("scheduler tick failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                Err(OutflowError::ExternalService("first call fails".into()))
            } else {
                Ok(())
            }
        }
    }

    fn due_job() -> Job {
        let mut job = Job::resume("conv-1", "n1", Duration::seconds(0));
        job.run_at = Utc::now() - Duration::seconds(1);
        job
    }

    #[tokio::test]
    async fn test_tick_executes_due_jobs() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: false,
        });
        store.enqueue(&due_job()).unwrap();

        let engine = SchedulerEngine::new(store.clone(), handler.clone(), RetryPolicy::default());
        let stats = engine.tick().await.unwrap();
        assert_eq!(stats.executed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats(Utc::now()).unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off_then_succeeds() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: true,
        });
        store.enqueue(&due_job()).unwrap();

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_secs: 0,
        };
        let engine = SchedulerEngine::new(store.clone(), handler.clone(), policy);

        let stats = engine.tick().await.unwrap();
        assert_eq!(stats.retried, 1);

        // Zero backoff: immediately due again.
        let stats = engine.tick().await.unwrap();
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.retried, 0);
        assert_eq!(store.stats(Utc::now()).unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_recurring_job_survives_completion() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: false,
        });
        let mut sweep = Job::recurring("invite_sweep:global".into(), JobKind::InviteSweep, 3600);
        sweep.run_at = Utc::now() - Duration::seconds(1);
        store.enqueue(&sweep).unwrap();

        let engine = SchedulerEngine::new(store.clone(), handler, RetryPolicy::default());
        engine.tick().await.unwrap();

        let stats = store.stats(Utc::now()).unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.completed, 0);
    }
}
