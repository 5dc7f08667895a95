use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::error::{BillingError, QueueError};
use crate::services::subscription::SubscriptionService;
use crate::services::task_queue::TaskQueue;
use crate::utils::clock::Clock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: usize,
    pub failed: usize,
}

impl WorkerReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// Polls the task queue and runs due tasks through the subscription handlers.
pub struct TaskWorker {
    service: Arc<SubscriptionService>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl TaskWorker {
    pub fn new(
        service: Arc<SubscriptionService>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            service,
            queue,
            clock,
            config,
        }
    }

    /// Runs every task due now, a batch at a time.
    pub fn run_pending(&self) -> Result<WorkerReport, QueueError> {
        let mut report = WorkerReport::default();
        let batch_size = self.config.batch_size.max(1);

        loop {
            let tasks = self.queue.claim_due(self.clock.now(), batch_size)?;
            let claimed = tasks.len();

            for task in tasks {
                match self.service.handle_task(&task) {
                    Ok(()) => {
                        self.queue.mark_complete(task.id)?;
                        report.completed += 1;
                    }
                    Err(e) => {
                        match &e {
                            BillingError::InvalidArgument(_) => log::warn!(
                                "Dropping {} task {}: {}",
                                task.hook,
                                task.id,
                                e
                            ),
                            _ => log::error!(
                                "{} for subscription #{} failed: {}",
                                task.hook,
                                task.args.subscription_id,
                                e
                            ),
                        }
                        self.queue.mark_failed(task.id, &e.to_string())?;
                        report.failed += 1;
                    }
                }
            }

            if claimed < batch_size {
                break;
            }
        }

        Ok(report)
    }

    /// Polls until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(poll_interval);
        tokio::pin!(shutdown);

        log::info!(
            "Task worker polling every {:?}, {} tasks per batch",
            poll_interval,
            self.config.batch_size
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Task worker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_pending() {
                        Ok(report) if report.total() > 0 => log::info!(
                            "Processed {} due task(s), {} failed",
                            report.total(),
                            report.failed
                        ),
                        Ok(_) => {}
                        Err(e) => log::error!("Could not claim due tasks: {}", e),
                    }
                }
            }
        }
    }
}
