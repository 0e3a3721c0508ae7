//! Task bodies provided by the pipeline

use super::{count_path, marker_path, read_entry_count, write_entry_count, ResumableTask, TaskBody, TaskContext};
use crate::error::TaskError;
use crate::index::{merge_indexes, EntryIndexWriter};
use crate::parser::{parser_for, BoldConverter, DbFormat, DbParser, ParseStats};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

fn remove_path(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn discard_partial(path: &Path) {
    if let Err(e) = remove_path(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove partial output");
    }
}

/// Parse one source file into its own index directory
pub struct IndexFileTask {
    pub format: DbFormat,
    pub source: PathBuf,
    pub index_dir: PathBuf,
    pub check_redundancy: bool,
}

impl IndexFileTask {
    pub fn into_task(self, owner_job: &str) -> ResumableTask {
        let name = format!("index {}", self.source.display());
        let target = self.index_dir.clone();
        let format = self.format.to_string();
        let source = self.source.display().to_string();
        ResumableTask::new(name, owner_job, target, self)
            .with_parameter("format", format)
            .with_parameter("source", source)
    }

    fn index(&self, ctx: &TaskContext, parser: &mut dyn DbParser) -> Result<ParseStats, TaskError> {
        let mut writer = EntryIndexWriter::create(&self.index_dir, ctx.job.config().writer())?;
        let stats = parser.parse(&self.source, Some(&mut writer))?;
        let entries = writer.close()?;
        write_entry_count(&self.index_dir, entries)?;
        Ok(stats)
    }
}

impl TaskBody for IndexFileTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        let job = &ctx.job;
        if self.index_dir.exists() {
            debug!(index = %self.index_dir.display(), "Removing unfinished index");
            remove_path(&self.index_dir)?;
        }

        let options = job.config().parser(self.check_redundancy);
        let mut parser = parser_for(self.format, options).ok_or_else(|| {
            TaskError::Failed(format!("{} input must be converted before indexing", self.format))
        })?;
        let detector = if self.check_redundancy {
            Some(job.detector()?)
        } else {
            None
        };
        parser.set_monitor(job.monitor(detector));
        if let Some(matcher) = job.taxonomy() {
            parser.set_taxonomy(matcher);
        }
        parser.set_cancellation(ctx.cancel.clone());

        let result = self.index(ctx, parser.as_mut());
        job.suspend_detector();
        match result {
            Ok(stats) => {
                info!(
                    source = %self.source.display(),
                    kept = stats.kept,
                    discarded = stats.discarded,
                    "File indexed"
                );
                Ok(())
            }
            Err(e) => {
                discard_partial(&self.index_dir);
                discard_partial(&count_path(&self.index_dir));
                Err(e)
            }
        }
    }
}

/// Merge finished indexes into `dest`
pub struct MergeIndexTask {
    pub sources: Vec<PathBuf>,
    pub dest: PathBuf,
}

impl MergeIndexTask {
    pub fn into_task(self, owner_job: &str) -> ResumableTask {
        let name = format!("merge into {}", self.dest.display());
        let target = self.dest.clone();
        let sources = self.sources.len().to_string();
        ResumableTask::new(name, owner_job, target, self).with_parameter("sources", sources)
    }
}

impl TaskBody for MergeIndexTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        if self.dest.exists() {
            // Renamed into place but never marked complete
            debug!(dest = %self.dest.display(), "Removing unconfirmed merge result");
            ctx.job.registry().close(&self.dest)?;
            remove_path(&self.dest)?;
        }

        let stats = merge_indexes(&self.sources, &self.dest, &ctx.job.config().merge(), &ctx.cancel)?;

        let mut expected = 0u64;
        let mut counted = true;
        for source in &self.sources {
            match read_entry_count(source) {
                Ok(count) => expected += count,
                Err(e) => {
                    debug!(source = %source.display(), error = %e, "No entry count for merge source");
                    counted = false;
                }
            }
        }
        if counted && expected != stats.entries {
            warn!(
                dest = %self.dest.display(),
                expected,
                merged = stats.entries,
                "Merged entry count differs from the sum of the sources"
            );
        }

        write_entry_count(&self.dest, stats.entries)?;
        Ok(())
    }
}

/// Convert a BOLD export into a GenBank-style flat file
pub struct ConvertBoldTask {
    pub source: PathBuf,
    pub output: PathBuf,
    pub check_redundancy: bool,
}

impl ConvertBoldTask {
    pub fn into_task(self, owner_job: &str) -> ResumableTask {
        let name = format!("convert {}", self.source.display());
        let target = self.output.clone();
        let source = self.source.display().to_string();
        ResumableTask::new(name, owner_job, target, self).with_parameter("source", source)
    }
}

impl TaskBody for ConvertBoldTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        let job = &ctx.job;
        let mut converter = BoldConverter::new(&self.output, job.config().parser(self.check_redundancy));
        let detector = if self.check_redundancy {
            Some(job.detector()?)
        } else {
            None
        };
        converter.set_monitor(job.monitor(detector));
        if let Some(matcher) = job.taxonomy() {
            converter.set_taxonomy(matcher);
        }
        converter.set_cancellation(ctx.cancel.clone());

        let result = converter.parse(&self.source, None);
        job.suspend_detector();
        match result {
            Ok(stats) => {
                write_entry_count(&self.output, stats.kept)?;
                Ok(())
            }
            Err(e) => {
                discard_partial(&self.output);
                Err(e.into())
            }
        }
    }
}

/// Remove intermediate artifacts together with their side files
pub struct DeletePathsTask {
    pub paths: Vec<PathBuf>,
}

impl DeletePathsTask {
    /// `target` only anchors the completion marker
    pub fn into_task(self, owner_job: &str, target: impl Into<PathBuf>) -> ResumableTask {
        let count = self.paths.len().to_string();
        ResumableTask::new("cleanup", owner_job, target, self).with_parameter("paths", count)
    }
}

impl TaskBody for DeletePathsTask {
    fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        for path in &self.paths {
            if ctx.cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            ctx.job.registry().close(path)?;
            remove_path(path)?;
            remove_path(&marker_path(path))?;
            remove_path(&count_path(path))?;
            debug!(path = %path.display(), "Removed");
        }
        Ok(())
    }
}

/// Plan the tasks that index `files` into a single index at `output`
///
/// Each file is indexed into its own directory under `<output>.parts`; the
/// parts are then merged into `output` and removed. Once the merge has been
/// marked complete the per-file tasks are no longer planned, so a rerun after
/// cleanup does not parse the files again.
pub fn plan_index_job(
    owner_job: &str,
    format: DbFormat,
    files: &[PathBuf],
    output: &Path,
    check_redundancy: bool,
) -> Vec<ResumableTask> {
    let mut parts_name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    parts_name.push(".parts");
    let parts_dir = output.with_file_name(parts_name);

    let parts: Vec<PathBuf> = files
        .iter()
        .enumerate()
        .map(|(n, file)| {
            let stem = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            parts_dir.join(format!("{:04}-{stem}", n + 1))
        })
        .collect();

    let mut tasks = Vec::with_capacity(files.len() + 2);
    if !marker_path(output).exists() {
        for (file, part) in files.iter().zip(&parts) {
            let task = IndexFileTask {
                format,
                source: file.clone(),
                index_dir: part.clone(),
                check_redundancy,
            };
            tasks.push(task.into_task(owner_job));
        }
    }

    tasks.push(
        MergeIndexTask {
            sources: parts.clone(),
            dest: output.to_path_buf(),
        }
        .into_task(owner_job),
    );

    let mut cleanup_paths = parts;
    cleanup_paths.push(parts_dir);
    let mut cleanup_target = output.as_os_str().to_os_string();
    cleanup_target.push(".cleanup");
    tasks.push(DeletePathsTask { paths: cleanup_paths }.into_task(owner_job, PathBuf::from(cleanup_target)));
    tasks
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::index::EntryIndexReader;
    use crate::task::test_support::context;

    const FASTA: &str = ">a1 first\nACGT\n>a2 second\nGGCC\n";

    #[test]
    fn test_index_file_task_writes_count() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let source = dir.path().join("in.fa");
        fs::write(&source, FASTA).unwrap();
        let index_dir = dir.path().join("idx");

        let mut task = IndexFileTask {
            format: DbFormat::Fasta,
            source,
            index_dir: index_dir.clone(),
            check_redundancy: false,
        }
        .into_task("test");
        assert!(task.execute(&ctx));
        assert_eq!(read_entry_count(&index_dir).unwrap(), 2);
        assert_eq!(EntryIndexReader::open(&index_dir, false).unwrap().size(), 2);
    }

    #[test]
    fn test_failed_index_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let source = dir.path().join("broken.gb");
        fs::write(&source, "LOCUS       X1  10 bp\nORIGIN\n").unwrap();
        let index_dir = dir.path().join("idx");

        let mut task = IndexFileTask {
            format: DbFormat::Genbank,
            source,
            index_dir: index_dir.clone(),
            check_redundancy: false,
        }
        .into_task("test");
        assert!(!task.execute(&ctx));
        assert!(!index_dir.exists());
        assert!(!task.is_done());
    }

    #[test]
    fn test_bold_cannot_be_indexed_directly() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut task = IndexFileTask {
            format: DbFormat::Bold,
            source: dir.path().join("x.tsv"),
            index_dir: dir.path().join("idx"),
            check_redundancy: false,
        }
        .into_task("test");
        assert!(!task.execute(&ctx));
        assert!(matches!(task.last_error(), Some(TaskError::Failed(_))));
    }

    #[test]
    fn test_delete_paths_removes_side_files() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let part = dir.path().join("part");
        fs::create_dir(&part).unwrap();
        fs::write(marker_path(&part), "done").unwrap();
        write_entry_count(&part, 3).unwrap();

        let mut task = DeletePathsTask {
            paths: vec![part.clone(), dir.path().join("missing")],
        }
        .into_task("test", dir.path().join("cleanup"));
        assert!(task.execute(&ctx));
        assert!(!part.exists());
        assert!(!marker_path(&part).exists());
        assert!(!count_path(&part).exists());
    }

    #[test]
    fn test_plan_layout() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("db");
        let files = vec![dir.path().join("a.fa"), dir.path().join("b.fa")];

        let tasks = plan_index_job("job", DbFormat::Fasta, &files, &output, true);
        let targets: Vec<_> = tasks.iter().map(|t| t.target().to_path_buf()).collect();
        assert_eq!(
            targets,
            vec![
                dir.path().join("db.parts/0001-a.fa"),
                dir.path().join("db.parts/0002-b.fa"),
                output.clone(),
                dir.path().join("db.cleanup"),
            ]
        );

        fs::write(marker_path(&output), "done").unwrap();
        assert_eq!(plan_index_job("job", DbFormat::Fasta, &files, &output, true).len(), 2);
    }
}
