//! Job context shared by the tasks of one ingestion run

use crate::config::IngestConfig;
use crate::detector::{Membership, UniqueIdDetector};
use crate::error::{DetectorError, IndexError, TaskError};
use crate::index::{EntryIndexReader, IndexRegistry};
use crate::parser::{FoundSequence, ParserMonitor, SeqVerdict};
use crate::taxonomy::TaxonomyMatcher;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Progress of the file currently being parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub file: PathBuf,
    pub bytes_done: u64,
    pub size_bytes: u64,
    pub entries_kept: u64,
    pub finished: bool,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// End-of-job report
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub run_id: Uuid,
    pub redundant_found: bool,
    pub detector_used: bool,
    pub detector_time_ms: u64,
    /// Taxon ids missing from the dictionary, with record counts
    pub unknown_taxa: Vec<(String, u64)>,
    pub readers_closed: usize,
}

/// Everything the tasks of one run share
///
/// The unique-identifier detector is created on first use and kept across
/// files so that redundancy is checked job-wide; [`finish`](Self::finish)
/// tears it down.
pub struct IngestJob {
    name: String,
    run_id: Uuid,
    work_dir: PathBuf,
    config: IngestConfig,
    taxonomy: Option<Arc<TaxonomyMatcher>>,
    detector: Mutex<Option<Arc<UniqueIdDetector>>>,
    registry: IndexRegistry,
    progress: Option<ProgressCallback>,
    redundant: AtomicBool,
}

pub struct IngestJobBuilder {
    name: String,
    work_dir: PathBuf,
    config: IngestConfig,
    taxonomy: Option<TaxonomyMatcher>,
    progress: Option<ProgressCallback>,
    rebase: Option<PathBuf>,
}

impl IngestJobBuilder {
    pub fn config(mut self, config: IngestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn taxonomy(mut self, matcher: TaxonomyMatcher) -> Self {
        self.taxonomy = Some(matcher);
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Resolve relocatable source paths against `dir` when reading indexes
    pub fn rebase(mut self, dir: impl Into<PathBuf>) -> Self {
        self.rebase = Some(dir.into());
        self
    }

    /// Validate the configuration and build the job
    ///
    /// Fails before any file is touched when taxonomy filters are set
    /// without a dictionary.
    pub fn build(self) -> Result<IngestJob, TaskError> {
        self.config.validate()?;
        if let Some(matcher) = &self.taxonomy {
            matcher.ensure_ready()?;
        }

        let registry = match self.rebase {
            Some(dir) => IndexRegistry::new().with_rebase(dir),
            None => IndexRegistry::new(),
        };
        let job = IngestJob {
            name: self.name,
            run_id: Uuid::new_v4(),
            work_dir: self.work_dir,
            config: self.config,
            taxonomy: self.taxonomy.map(Arc::new),
            detector: Mutex::new(None),
            registry,
            progress: self.progress,
            redundant: AtomicBool::new(false),
        };
        info!(job = %job.name, run_id = %job.run_id, work_dir = %job.work_dir.display(), "Job created");
        Ok(job)
    }
}

impl IngestJob {
    pub fn builder(name: impl Into<String>, work_dir: impl Into<PathBuf>) -> IngestJobBuilder {
        IngestJobBuilder {
            name: name.into(),
            work_dir: work_dir.into(),
            config: IngestConfig::default(),
            taxonomy: None,
            progress: None,
            rebase: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn taxonomy(&self) -> Option<Arc<TaxonomyMatcher>> {
        self.taxonomy.clone()
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    /// Shared reader on the index at `path`, opened once per job
    pub fn reader(&self, path: &Path) -> Result<Arc<EntryIndexReader>, IndexError> {
        self.registry.open_reader(path, self.config.load_index_in_memory)
    }

    /// The job-wide detector, created on first call and reopened if suspended
    pub fn detector(&self) -> Result<Arc<UniqueIdDetector>, DetectorError> {
        let mut slot = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(detector) = slot.as_ref() {
            if detector.is_closed() {
                detector.reopen()?;
            }
            return Ok(Arc::clone(detector));
        }

        let store = self.work_dir.join(format!(".seqdex-ids-{}.db", self.run_id));
        let detector = Arc::new(UniqueIdDetector::open(store, self.config.detector())?);
        *slot = Some(Arc::clone(&detector));
        Ok(detector)
    }

    /// Release the detector's store handle between files
    pub fn suspend_detector(&self) {
        let slot = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(detector) = slot.as_ref() {
            detector.close();
        }
    }

    /// A parser monitor reporting to this job
    ///
    /// `detector` is consulted for records whose parser asks for redundancy
    /// checks; without one every record is accepted.
    pub fn monitor(self: &Arc<Self>, detector: Option<Arc<UniqueIdDetector>>) -> Arc<ProgressMonitor> {
        Arc::new(ProgressMonitor {
            job: Arc::clone(self),
            detector,
            file: Mutex::new(FileProgress::default()),
        })
    }

    pub fn redundant_sequence_found(&self) -> bool {
        self.redundant.load(Ordering::Relaxed)
    }

    fn report(&self, event: &ProgressEvent) {
        if let Some(callback) = &self.progress {
            callback(event);
        }
    }

    /// Tear down job-wide state and summarise the run
    pub fn finish(&self) -> JobSummary {
        let mut summary = JobSummary {
            name: self.name.clone(),
            run_id: self.run_id,
            redundant_found: self.redundant_sequence_found(),
            ..JobSummary::default()
        };

        let detector = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(detector) = detector {
            summary.detector_used = detector.was_used();
            summary.detector_time_ms = detector.time_in_add().as_millis() as u64;
            if let Err(e) = detector.destroy() {
                warn!(error = %e, store = %detector.store_path().display(), "Failed to remove identifier store");
            }
        }

        if let Some(matcher) = &self.taxonomy {
            matcher.log_not_found_summary();
            summary.unknown_taxa = matcher.not_found_summary();
        }

        summary.readers_closed = match self.registry.close_all() {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to close index readers");
                0
            }
        };

        info!(
            job = %self.name,
            redundant_found = summary.redundant_found,
            detector_time_ms = summary.detector_time_ms,
            "Job finished"
        );
        summary
    }
}

#[derive(Debug, Default)]
struct FileProgress {
    file: PathBuf,
    size_bytes: u64,
    step: u64,
    next_report: u64,
    entries: u64,
}

/// Bridges parser callbacks to the job: redundancy checks and throttled
/// progress reports (about every 5% of the file)
pub struct ProgressMonitor {
    job: Arc<IngestJob>,
    detector: Option<Arc<UniqueIdDetector>>,
    file: Mutex<FileProgress>,
}

impl ProgressMonitor {
    fn progress(&self) -> std::sync::MutexGuard<'_, FileProgress> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ParserMonitor for ProgressMonitor {
    fn start_processing_file(&self, file: &Path, size_bytes: u64) {
        let step = (size_bytes / 20).max(1);
        *self.progress() = FileProgress {
            file: file.to_path_buf(),
            size_bytes,
            step,
            next_report: step,
            entries: 0,
        };
        self.job.report(&ProgressEvent {
            file: file.to_path_buf(),
            bytes_done: 0,
            size_bytes,
            entries_kept: 0,
            finished: false,
        });
    }

    fn seq_found(&self, found: &FoundSequence<'_>, check_redundancy: bool) -> SeqVerdict {
        if check_redundancy {
            if let Some(detector) = &self.detector {
                if detector.add(found.id) == Membership::Duplicate {
                    if !self.job.redundant.swap(true, Ordering::Relaxed) {
                        warn!(id = found.id, file = %found.file.display(), "Redundant sequence identifier found");
                    } else {
                        debug!(id = found.id, "Redundant sequence identifier");
                    }
                    return SeqVerdict::Duplicate;
                }
            }
        }

        let event = {
            let mut progress = self.progress();
            progress.entries += 1;
            if found.stop < progress.next_report {
                None
            } else {
                progress.next_report = found.stop + progress.step;
                Some(ProgressEvent {
                    file: progress.file.clone(),
                    bytes_done: found.stop,
                    size_bytes: progress.size_bytes,
                    entries_kept: progress.entries,
                    finished: false,
                })
            }
        };
        if let Some(event) = event {
            self.job.report(&event);
        }
        SeqVerdict::Accepted
    }

    fn stop_processing_file(&self, file: &Path, entries_kept: u64) {
        let size_bytes = self.progress().size_bytes;
        self.job.report(&ProgressEvent {
            file: file.to_path_buf(),
            bytes_done: size_bytes,
            size_bytes,
            entries_kept,
            finished: true,
        });
    }

    fn redundant_sequence_found(&self) -> bool {
        self.job.redundant_sequence_found()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::taxonomy::InMemoryTaxonomy;

    fn found<'a>(id: &'a str, file: &'a Path, stop: u64) -> FoundSequence<'a> {
        FoundSequence {
            id,
            name: "",
            file,
            start: 0,
            stop,
        }
    }

    #[test]
    fn test_filters_without_dictionary_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut matcher = TaxonomyMatcher::new(None);
        matcher.set_filter(["2759"], Vec::<String>::new());

        let result = IngestJob::builder("job", dir.path()).taxonomy(matcher).build();
        assert!(matches!(result, Err(TaskError::Taxonomy(_))));
    }

    #[test]
    fn test_detector_shared_and_torn_down() {
        let dir = tempfile::tempdir().unwrap();
        let job = Arc::new(IngestJob::builder("job", dir.path()).build().unwrap());

        let detector = job.detector().unwrap();
        let store = detector.store_path().to_path_buf();
        assert!(store.exists());
        assert!(Arc::ptr_eq(&detector, &job.detector().unwrap()));

        job.suspend_detector();
        assert!(detector.is_closed());
        job.detector().unwrap();
        assert!(!detector.is_closed());

        let summary = job.finish();
        assert!(!summary.detector_used);
        assert!(!store.exists());
    }

    #[test]
    fn test_monitor_rejects_duplicates_job_wide() {
        let dir = tempfile::tempdir().unwrap();
        let job = Arc::new(IngestJob::builder("job", dir.path()).build().unwrap());
        let file = dir.path().join("a.fa");

        let first = job.monitor(Some(job.detector().unwrap()));
        first.start_processing_file(&file, 100);
        assert_eq!(first.seq_found(&found("X1", &file, 10), true), SeqVerdict::Accepted);

        // A second file gets a fresh monitor but the same detector
        let second = job.monitor(Some(job.detector().unwrap()));
        second.start_processing_file(&file, 100);
        assert_eq!(second.seq_found(&found("X1", &file, 10), true), SeqVerdict::Duplicate);
        assert_eq!(second.seq_found(&found("X1", &file, 20), false), SeqVerdict::Accepted);
        assert!(second.redundant_sequence_found());
        assert!(job.finish().redundant_found);
    }

    #[test]
    fn test_progress_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let job = Arc::new(
            IngestJob::builder("job", dir.path())
                .on_progress(move |event| sink.lock().unwrap().push(event.clone()))
                .build()
                .unwrap(),
        );
        let file = dir.path().join("big.gb");
        let monitor = job.monitor(None);

        monitor.start_processing_file(&file, 1000);
        for stop in 1..=1000 {
            monitor.seq_found(&found("id", &file, stop), false);
        }
        monitor.stop_processing_file(&file, 1000);

        let events = events.lock().unwrap();
        // start + one per 5% step + finish
        assert_eq!(events.len(), 22);
        assert!(events.last().unwrap().finished);
        assert_eq!(events[1].bytes_done, 50);
    }

    #[test]
    fn test_readers_shared_with_rebase_and_closed_at_finish() {
        use crate::index::{EntryIndexWriter, WriterOptions};

        let dir = tempfile::tempdir().unwrap();
        let moved = dir.path().join("moved");
        std::fs::create_dir(&moved).unwrap();
        std::fs::write(moved.join("seqs.fa"), ">m1\nACGT\n").unwrap();

        let index_dir = dir.path().join("idx");
        let options = WriterOptions {
            relocatable_sources: true,
            ..WriterOptions::default()
        };
        let mut writer = EntryIndexWriter::create(&index_dir, options).unwrap();
        writer
            .add_entry("m1", "", &dir.path().join("gone").join("seqs.fa"), 0, 9)
            .unwrap();
        writer.close().unwrap();

        let job = IngestJob::builder("query", dir.path()).rebase(&moved).build().unwrap();
        let reader = job.reader(&index_dir).unwrap();
        assert!(Arc::ptr_eq(&reader, &job.reader(&index_dir).unwrap()));

        let entry = reader.get_entry("m1").unwrap().remove(0);
        assert_eq!(entry.source_file, moved.join("seqs.fa"));
        assert_eq!(reader.fetch_record(&entry).unwrap(), b">m1\nACGT\n");
        assert_eq!(job.finish().readers_closed, 1);
    }

    #[test]
    fn test_unknown_taxa_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut taxa = InMemoryTaxonomy::new();
        taxa.insert("9606", "1;9606");
        let mut matcher = TaxonomyMatcher::new(Some(Arc::new(taxa)));
        matcher.set_filter(["1"], Vec::<String>::new());

        let job = IngestJob::builder("job", dir.path()).taxonomy(matcher).build().unwrap();
        let matcher = job.taxonomy().unwrap();
        assert!(matcher.is_valid("12345").valid);
        assert_eq!(job.finish().unknown_taxa, vec![("12345".to_string(), 1)]);
    }
}
