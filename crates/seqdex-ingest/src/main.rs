//! seqdex-ingest - build and query entry indexes over flat-file databases

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use seqdex_common::logging::{init_logging, LogConfig, LogLevel};
use seqdex_ingest::parser::DbFormat;
use seqdex_ingest::task::{
    plan_index_job, ConvertBoldTask, IngestJob, MergeIndexTask, ProgressEvent, Scheduler, SchedulerOutcome,
};
use seqdex_ingest::taxonomy::{InMemoryTaxonomy, TaxonomyDictionary, TaxonomyMatcher};
use seqdex_ingest::{IngestConfig, ResumableTask};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "seqdex-ingest")]
#[command(author, version, about = "Index flat-file sequence databases")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for scratch files (defaults to the output's directory)
    #[arg(long, global = true, env = "SEQDEX_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Store source paths relative to a rebase directory
    #[arg(long, global = true)]
    relocatable: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index one or more files of the same format into a single index
    Index {
        /// Input format (genbank, swissprot, fasta or bold)
        #[arg(short, long)]
        format: DbFormat,

        /// Index directory to create
        #[arg(short, long)]
        output: PathBuf,

        /// Discard records whose identifier was already seen in this run
        #[arg(long)]
        check_redundancy: bool,

        /// Keep only records under these taxon ids
        #[arg(long, value_delimiter = ',')]
        include: Vec<String>,

        /// Drop records under these taxon ids (wins over --include)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Tab-separated `taxon_id<TAB>lineage` dictionary
        #[arg(long)]
        taxonomy: Option<PathBuf>,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Merge finished indexes into a new one
    Merge {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(required = true)]
        indexes: Vec<PathBuf>,
    },

    /// Look up identifiers in an index
    Query {
        #[arg(short, long)]
        index: PathBuf,

        /// Directory that relocatable source paths are resolved against
        #[arg(long)]
        rebase: Option<PathBuf>,

        /// Print the raw records instead of their locations
        #[arg(long)]
        fetch: bool,

        /// Load the whole index in memory first
        #[arg(long)]
        in_memory: bool,

        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Convert a BOLD tab-separated export into GenBank-style text
    ConvertBold {
        #[arg(short, long)]
        output: PathBuf,

        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("seqdex-ingest")
        .build()
        .merge_env()?;
    init_logging(&log_config)?;

    let mut config = IngestConfig::from_env().context("Invalid SEQDEX_* configuration")?;
    config.verbose |= cli.verbose;
    config.relocatable_sources |= cli.relocatable;

    match cli.command {
        Command::Index {
            format,
            output,
            check_redundancy,
            include,
            exclude,
            taxonomy,
            files,
        } => {
            let matcher = build_matcher(taxonomy.as_deref(), include, exclude)?;
            let work_dir = cli.work_dir.unwrap_or_else(|| parent_dir(&output));
            let mut builder = IngestJob::builder("index", &work_dir)
                .config(config)
                .on_progress(progress_reporter());
            if let Some(matcher) = matcher {
                builder = builder.taxonomy(matcher);
            }
            let job = Arc::new(builder.build()?);

            let mut tasks = Vec::new();
            let (format, files) = if format == DbFormat::Bold {
                let converted = with_suffix(&output, ".converted");
                std::fs::create_dir_all(&converted)
                    .with_context(|| format!("Failed to create {}", converted.display()))?;
                let mut outputs = Vec::with_capacity(files.len());
                for (n, file) in files.into_iter().enumerate() {
                    let target = converted.join(converted_name(n, &file));
                    let task = ConvertBoldTask {
                        source: file,
                        output: target.clone(),
                        check_redundancy: false,
                    };
                    tasks.push(task.into_task(job.name()));
                    outputs.push(target);
                }
                (DbFormat::Genbank, outputs)
            } else {
                (format, files)
            };
            tasks.extend(plan_index_job(job.name(), format, &files, &output, check_redundancy));
            run_job(job, tasks).await
        }

        Command::Merge { output, indexes } => {
            let work_dir = cli.work_dir.unwrap_or_else(|| parent_dir(&output));
            let job = Arc::new(IngestJob::builder("merge", &work_dir).config(config).build()?);
            let task = MergeIndexTask {
                sources: indexes,
                dest: output,
            };
            let tasks = vec![task.into_task(job.name())];
            run_job(job, tasks).await
        }

        Command::Query {
            index,
            rebase,
            fetch,
            in_memory,
            ids,
        } => {
            config.load_index_in_memory |= in_memory;
            let work_dir = cli.work_dir.unwrap_or_else(|| parent_dir(&index));
            let mut builder = IngestJob::builder("query", &work_dir).config(config);
            if let Some(dir) = rebase {
                builder = builder.rebase(dir);
            }
            let job = builder.build()?;
            let result = query(&job, &index, fetch, &ids);
            job.finish();
            result
        }

        Command::ConvertBold { output, file } => {
            let work_dir = cli.work_dir.unwrap_or_else(|| parent_dir(&output));
            let job = Arc::new(
                IngestJob::builder("convert-bold", &work_dir)
                    .config(config)
                    .on_progress(progress_reporter())
                    .build()?,
            );
            let task = ConvertBoldTask {
                source: file,
                output,
                check_redundancy: false,
            };
            let tasks = vec![task.into_task(job.name())];
            run_job(job, tasks).await
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Position-prefixed name, so inputs sharing a stem stay distinct
fn converted_name(n: usize, file: &Path) -> String {
    let stem = file.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    format!("{:04}-{stem}.gb", n + 1)
}

fn build_matcher(
    taxonomy: Option<&Path>,
    include: Vec<String>,
    exclude: Vec<String>,
) -> Result<Option<TaxonomyMatcher>> {
    if taxonomy.is_none() && include.is_empty() && exclude.is_empty() {
        return Ok(None);
    }
    let dictionary = match taxonomy {
        Some(path) => {
            let taxa = InMemoryTaxonomy::from_file(path)?;
            info!(path = %path.display(), taxa = taxa.len(), "Taxonomy dictionary loaded");
            Some(Arc::new(taxa) as Arc<dyn TaxonomyDictionary>)
        }
        None => None,
    };
    let mut matcher = TaxonomyMatcher::new(dictionary);
    matcher.set_filter(include, exclude);
    Ok(Some(matcher))
}

/// Progress bar driven by the job's per-file events
fn progress_reporter() -> impl Fn(&ProgressEvent) + Send + Sync + 'static {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    )
    .map(|style| style.progress_chars("#>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);

    move |event: &ProgressEvent| {
        if event.bytes_done == 0 && !event.finished {
            bar.reset();
            bar.set_length(event.size_bytes);
            bar.set_message(event.file.display().to_string());
        }
        bar.set_position(event.bytes_done);
        if event.finished {
            bar.println(format!(
                "{}: {} entries kept",
                event.file.display(),
                event.entries_kept
            ));
        }
    }
}

async fn run_job(job: Arc<IngestJob>, tasks: Vec<ResumableTask>) -> Result<()> {
    let scheduler = Scheduler::new(Arc::clone(&job));
    for task in tasks {
        scheduler.enqueue(task);
    }

    let abort = scheduler.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current record");
            abort.cancel();
        }
    });

    let report = scheduler.run().await;
    let summary = job.finish();
    let output = serde_json::json!({ "report": report, "summary": summary });
    println!("{}", serde_json::to_string_pretty(&output)?);

    match report.outcome {
        SchedulerOutcome::Completed => {
            info!(tasks = report.executed.len(), "Ingestion complete");
            Ok(())
        }
        SchedulerOutcome::Aborted => bail!("aborted; rerun the same command to resume"),
        SchedulerOutcome::Failed { task, message } => bail!("task '{task}' failed: {message}"),
    }
}

fn query(job: &IngestJob, index: &Path, fetch: bool, ids: &[String]) -> Result<()> {
    let reader = job
        .reader(index)
        .with_context(|| format!("Failed to open index {}", index.display()))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for id in ids {
        let entries = reader.get_entry(id)?;
        if entries.is_empty() {
            warn!(id = %id, "Not found");
        }
        if fetch {
            for entry in &entries {
                out.write_all(&reader.fetch_record(entry)?)?;
            }
        } else {
            let line = serde_json::json!({ "query": id, "entries": entries });
            writeln!(out, "{line}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converted_names_distinct_for_shared_stems() {
        let first = converted_name(0, Path::new("/runs/a/export.tsv"));
        let second = converted_name(1, Path::new("/runs/b/export.tsv"));
        assert_eq!(first, "0001-export.gb");
        assert_eq!(second, "0002-export.gb");
    }
}
