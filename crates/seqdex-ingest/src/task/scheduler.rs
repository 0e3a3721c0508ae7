//! Single-worker FIFO task scheduler
//!
//! An explicit poll loop wakes on a fixed interval. When no task is running
//! and no abort has been requested it pops the head of the queue and hands it
//! to a blocking worker thread, so at most one task runs at any time. A task
//! failure or an abort clears whatever is still queued.

use super::{ResumableTask, TaskContext};
use crate::task::IngestJob;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a scheduler run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SchedulerOutcome {
    /// The queue drained with every task succeeding
    Completed,
    /// Abort was requested; the current task unwound and the rest were dropped
    Aborted,
    Failed { task: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerReport {
    pub outcome: SchedulerOutcome,
    /// Names of the tasks that succeeded, in order
    pub executed: Vec<String>,
    /// Tasks removed from the queue without running
    pub dropped: usize,
}

pub struct Scheduler {
    job: Arc<IngestJob>,
    queue: Mutex<VecDeque<ResumableTask>>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(job: Arc<IngestJob>) -> Self {
        let poll_interval = job.config().poll_interval();
        Self {
            job,
            queue: Mutex::new(VecDeque::new()),
            cancel: CancellationToken::new(),
            poll_interval,
        }
    }

    pub fn job(&self) -> &Arc<IngestJob> {
        &self.job
    }

    /// Append a task to the back of the queue
    pub fn enqueue(&self, task: ResumableTask) {
        debug!(task = task.name(), "Task queued");
        self.queue().push_back(task);
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    /// Token that aborts the run when cancelled
    pub fn abort_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn abort(&self) {
        info!(job = self.job.name(), "Abort requested");
        self.cancel.cancel();
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<ResumableTask>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear(&self) -> usize {
        let mut queue = self.queue();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Run queued tasks until the queue drains, a task fails or abort is
    /// signalled
    pub async fn run(&self) -> SchedulerReport {
        let ctx = TaskContext::new(Arc::clone(&self.job), self.cancel.clone());
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut running: Option<JoinHandle<(ResumableTask, bool)>> = None;
        let mut executed = Vec::new();

        info!(job = self.job.name(), queued = self.pending(), "Scheduler started");
        loop {
            ticker.tick().await;

            if let Some(handle) = running.take() {
                if !handle.is_finished() {
                    running = Some(handle);
                    continue;
                }
                match handle.await {
                    Ok((task, true)) => executed.push(task.name().to_string()),
                    Ok((task, false)) => {
                        let cancelled = self.cancel.is_cancelled()
                            || task.last_error().is_some_and(|e| e.is_cancellation());
                        let dropped = self.clear();
                        let outcome = if cancelled {
                            warn!(task = task.name(), dropped, "Task cancelled, queue cleared");
                            SchedulerOutcome::Aborted
                        } else {
                            let message = task.last_error_message().unwrap_or_default();
                            error!(task = task.name(), error = %message, dropped, "Task failed, queue cleared");
                            SchedulerOutcome::Failed {
                                task: task.name().to_string(),
                                message,
                            }
                        };
                        return SchedulerReport {
                            outcome,
                            executed,
                            dropped,
                        };
                    }
                    Err(e) => {
                        let dropped = self.clear();
                        error!(error = %e, dropped, "Task worker panicked, queue cleared");
                        return SchedulerReport {
                            outcome: SchedulerOutcome::Failed {
                                task: "<worker>".to_string(),
                                message: e.to_string(),
                            },
                            executed,
                            dropped,
                        };
                    }
                }
            }

            if self.cancel.is_cancelled() {
                let dropped = self.clear();
                info!(dropped, "Scheduler aborted");
                return SchedulerReport {
                    outcome: SchedulerOutcome::Aborted,
                    executed,
                    dropped,
                };
            }

            let next = self.queue().pop_front();
            let Some(mut task) = next else {
                info!(job = self.job.name(), executed = executed.len(), "Scheduler finished");
                return SchedulerReport {
                    outcome: SchedulerOutcome::Completed,
                    executed,
                    dropped: 0,
                };
            };

            debug!(task = task.name(), "Dispatching task");
            let ctx = ctx.clone();
            running = Some(tokio::task::spawn_blocking(move || {
                let ok = task.execute(&ctx);
                (task, ok)
            }));
        }
    }
}
