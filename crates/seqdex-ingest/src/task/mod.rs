//! Resumable units of work
//!
//! A [`ResumableTask`] wraps a [`TaskBody`] together with the path of the
//! artifact it produces. Success leaves a completion marker `<target>.ok`
//! beside that artifact; a later run of the same task finds the marker and
//! returns immediately, which is what makes an interrupted job restartable.
//! Tasks are run one at a time by the [`Scheduler`].

pub mod job;
pub mod scheduler;
pub mod tasks;

pub use job::{IngestJob, IngestJobBuilder, JobSummary, ProgressEvent, ProgressMonitor};
pub use scheduler::{Scheduler, SchedulerOutcome, SchedulerReport};
pub use tasks::{plan_index_job, ConvertBoldTask, DeletePathsTask, IndexFileTask, MergeIndexTask};

use crate::error::TaskError;
use seqdex_common::SeqdexError;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Suffix of completion markers
pub const MARKER_SUFFIX: &str = "ok";

/// Suffix of entry-count side files
pub const COUNT_SUFFIX: &str = "num";

fn with_suffix(target: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(target.as_os_str());
    path.push(".");
    path.push(suffix);
    PathBuf::from(path)
}

/// `<target>.ok`
pub fn marker_path(target: &Path) -> PathBuf {
    with_suffix(target, MARKER_SUFFIX)
}

/// `<target>.num`
pub fn count_path(target: &Path) -> PathBuf {
    with_suffix(target, COUNT_SUFFIX)
}

/// Record how many entries the artifact at `target` holds
pub fn write_entry_count(target: &Path, entries: u64) -> io::Result<()> {
    fs::write(count_path(target), format!("{entries}\n"))
}

/// Read the count written by [`write_entry_count`]
pub fn read_entry_count(target: &Path) -> Result<u64, SeqdexError> {
    let path = count_path(target);
    let raw = fs::read_to_string(&path)?;
    raw.trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| SeqdexError::InvalidSideFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// What a running task can reach
#[derive(Clone)]
pub struct TaskContext {
    pub job: Arc<IngestJob>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(job: Arc<IngestJob>, cancel: CancellationToken) -> Self {
        Self { job, cancel }
    }
}

/// The work a task performs when its marker is absent
pub trait TaskBody: Send {
    fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// A named, marker-gated unit of work
pub struct ResumableTask {
    name: String,
    owner_job: String,
    parameters: BTreeMap<String, String>,
    target: PathBuf,
    body: Box<dyn TaskBody>,
    last_error: Option<TaskError>,
}

impl std::fmt::Debug for ResumableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableTask")
            .field("name", &self.name)
            .field("owner_job", &self.owner_job)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl ResumableTask {
    pub fn new(
        name: impl Into<String>,
        owner_job: impl Into<String>,
        target: impl Into<PathBuf>,
        body: impl TaskBody + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            owner_job: owner_job.into(),
            parameters: BTreeMap::new(),
            target: target.into(),
            body: Box::new(body),
            last_error: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_job(&self) -> &str {
        &self.owner_job
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn marker(&self) -> PathBuf {
        marker_path(&self.target)
    }

    /// True once the task has completed in this or an earlier run
    pub fn is_done(&self) -> bool {
        self.marker().exists()
    }

    /// Run the body unless the completion marker already exists
    ///
    /// # Returns
    /// `true` on success (including the skipped case). On failure the error
    /// is kept and available through [`last_error`](Self::last_error).
    pub fn execute(&mut self, ctx: &TaskContext) -> bool {
        if self.is_done() {
            info!(task = %self.name, target = %self.target.display(), "Task already complete, skipping");
            return true;
        }
        if ctx.cancel.is_cancelled() {
            self.last_error = Some(TaskError::Cancelled);
            return false;
        }

        debug!(task = %self.name, parameters = ?self.parameters, "Running task");
        let result = self.body.run(ctx).and_then(|()| {
            let stamp = chrono::Utc::now().to_rfc3339();
            fs::write(self.marker(), stamp).map_err(TaskError::from)
        });

        match result {
            Ok(()) => {
                info!(task = %self.name, job = %self.owner_job, "Task complete");
                self.last_error = None;
                true
            }
            Err(e) => {
                if e.is_cancellation() {
                    info!(task = %self.name, "Task cancelled");
                } else {
                    error!(task = %self.name, job = %self.owner_job, error = %e, "Task failed");
                }
                self.last_error = Some(e);
                false
            }
        }
    }

    pub fn last_error(&self) -> Option<&TaskError> {
        self.last_error.as_ref()
    }

    pub fn last_error_message(&self) -> Option<String> {
        self.last_error.as_ref().map(ToString::to_string)
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::test_support::{context, SpyBody};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_side_file_paths() {
        let target = Path::new("/data/idx/part-1");
        assert_eq!(marker_path(target), Path::new("/data/idx/part-1.ok"));
        assert_eq!(count_path(target), Path::new("/data/idx/part-1.num"));
    }

    #[test]
    fn test_entry_count_round_trip_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("merged");
        write_entry_count(&target, 1234).unwrap();
        assert_eq!(read_entry_count(&target).unwrap(), 1234);

        fs::write(count_path(&target), "lots").unwrap();
        assert!(matches!(
            read_entry_count(&target),
            Err(SeqdexError::InvalidSideFile { .. })
        ));
    }

    #[test]
    fn test_resume_runs_body_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let target = dir.path().join("artifact");

        let mut first = ResumableTask::new("spy", "test", &target, SpyBody::new(calls.clone()))
            .with_parameter("file", "a.dat");
        assert!(first.execute(&ctx));
        assert!(first.is_done());
        assert_eq!(first.parameters().get("file").map(String::as_str), Some("a.dat"));

        let mut again = ResumableTask::new("spy", "test", &target, SpyBody::new(calls.clone()));
        assert!(again.execute(&ctx));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let body = SpyBody {
            calls: calls.clone(),
            fail_with: Some("disk on fire".to_string()),
        };

        let mut task = ResumableTask::new("spy", "test", dir.path().join("artifact"), body);
        assert!(!task.execute(&ctx));
        assert!(!task.is_done());
        assert_eq!(task.last_error_message().as_deref(), Some("disk on fire"));
    }

    #[test]
    fn test_cancelled_context_skips_body() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        ctx.cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut task = ResumableTask::new("spy", "test", dir.path().join("artifact"), SpyBody::new(calls.clone()));
        assert!(!task.execute(&ctx));
        assert!(task.last_error().is_some_and(TaskError::is_cancellation));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
