//! Merging several indexes into one
//!
//! The merged index is built in a temporary sibling directory and renamed
//! into place once complete, so the destination either does not exist or is
//! a finished index. Large sources are appended with set-based SQL; small
//! ones are copied entry by entry through the writer. Cancellation is
//! checked between sources and periodically while copying.

use super::reader::EntryIndexReader;
use super::writer::{EntryIndexWriter, WriterOptions};
use crate::error::IndexError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Sources with at least this many entries are appended in bulk
    pub bulk_threshold: u64,
    /// Entries copied between two cancellation checks
    pub check_every: u64,
    pub writer: WriterOptions,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            bulk_threshold: 10_000,
            check_every: 1_000,
            writer: WriterOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub sources: usize,
    pub entries: u64,
    pub bulk_sources: usize,
    pub copied_sources: usize,
}

/// Working directory used while `dest` is being built
pub fn staging_dir(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".merging");
    dest.with_file_name(name)
}

/// Merge `sources` into a new index at `dest`
pub fn merge_indexes(
    sources: &[PathBuf],
    dest: &Path,
    options: &MergeOptions,
    cancel: &CancellationToken,
) -> Result<MergeStats, IndexError> {
    if dest.exists() {
        return Err(IndexError::DestinationExists(dest.to_path_buf()));
    }

    let work = staging_dir(dest);
    if work.exists() {
        debug!(path = %work.display(), "Removing stale merge directory");
        fs::remove_dir_all(&work)?;
    }

    match merge_into(sources, &work, options, cancel) {
        Ok(stats) => {
            fs::rename(&work, dest)?;
            info!(
                dest = %dest.display(),
                sources = stats.sources,
                entries = stats.entries,
                "Indexes merged"
            );
            Ok(stats)
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_dir_all(&work) {
                warn!(path = %work.display(), error = %cleanup, "Failed to remove partial merge");
            }
            Err(e)
        }
    }
}

fn merge_into(
    sources: &[PathBuf],
    work: &Path,
    options: &MergeOptions,
    cancel: &CancellationToken,
) -> Result<MergeStats, IndexError> {
    let mut writer = EntryIndexWriter::create(work, options.writer)?;
    let mut stats = MergeStats::default();
    let check_every = options.check_every.max(1);

    for source in sources {
        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let reader = EntryIndexReader::open(source, false)?;
        if reader.size() >= options.bulk_threshold {
            debug!(source = %source.display(), entries = reader.size(), "Bulk append");
            drop(reader);
            writer.absorb(source)?;
            stats.bulk_sources += 1;
        } else {
            debug!(source = %source.display(), entries = reader.size(), "Copying entries");
            for (n, entry) in reader.stored_entries()?.iter().enumerate() {
                if n as u64 % check_every == 0 && cancel.is_cancelled() {
                    return Err(IndexError::Cancelled);
                }
                let raw = reader
                    .source_raw(&entry.file_key)
                    .ok_or_else(|| IndexError::UnknownSourceKey(entry.file_key.clone()))?;
                writer.add_stored(entry, raw)?;
            }
            stats.copied_sources += 1;
        }
        stats.sources += 1;
    }

    stats.entries = writer.close()?;
    Ok(stats)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn part(dir: &Path, name: &str, source: &str, ids: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut writer = EntryIndexWriter::create(&path, WriterOptions::default()).unwrap();
        for (i, id) in ids.iter().enumerate() {
            let start = i as u64 * 100;
            writer
                .add_entry(id, "entry", Path::new(source), start, start + 50)
                .unwrap();
        }
        writer.close().unwrap();
        path
    }

    fn merge_with_threshold(threshold: u64) {
        let dir = tempfile::tempdir().unwrap();
        let a = part(dir.path(), "a", "/data/one.gb", &["A1", "A2"]);
        let b = part(dir.path(), "b", "/data/two.gb", &["B1", "B2", "B3"]);
        let dest = dir.path().join("merged");
        let options = MergeOptions {
            bulk_threshold: threshold,
            ..MergeOptions::default()
        };

        let stats = merge_indexes(&[a, b], &dest, &options, &CancellationToken::new()).unwrap();
        assert_eq!(stats.sources, 2);
        assert_eq!(stats.entries, 5);
        assert!(!staging_dir(&dest).exists());

        let reader = EntryIndexReader::open(&dest, false).unwrap();
        assert_eq!(reader.size(), 5);
        let a2 = reader.get_entry("A2").unwrap().remove(0);
        assert_eq!(a2.source_file, PathBuf::from("/data/one.gb"));
        assert_eq!((a2.start, a2.stop), (100, 150));
        let b3 = reader.get_entry("b3").unwrap().remove(0);
        assert_eq!(b3.source_file, PathBuf::from("/data/two.gb"));
        assert_eq!(b3.start, 200);
    }

    #[test]
    fn test_merge_entry_by_entry() {
        merge_with_threshold(u64::MAX);
    }

    #[test]
    fn test_merge_bulk() {
        merge_with_threshold(0);
    }

    #[test]
    fn test_merge_shares_source_keys() {
        let dir = tempfile::tempdir().unwrap();
        let a = part(dir.path(), "a", "/data/same.gb", &["A1"]);
        let b = part(dir.path(), "b", "/data/same.gb", &["B1"]);
        let dest = dir.path().join("merged");
        let options = MergeOptions {
            bulk_threshold: 0,
            ..MergeOptions::default()
        };
        merge_indexes(&[a, b], &dest, &options, &CancellationToken::new()).unwrap();

        let keys = fs::read_dir(dest.join(crate::index::sources::SOURCES_DIR))
            .unwrap()
            .count();
        assert_eq!(keys, 1);
    }

    #[test]
    fn test_cancelled_merge_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = part(dir.path(), "a", "/data/one.gb", &["A1"]);
        let dest = dir.path().join("merged");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = merge_indexes(&[a], &dest, &MergeOptions::default(), &cancel).unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));
        assert!(!dest.exists());
        assert!(!staging_dir(&dest).exists());
    }

    #[test]
    fn test_existing_destination_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("merged");
        fs::create_dir_all(&dest).unwrap();
        assert!(matches!(
            merge_indexes(&[], &dest, &MergeOptions::default(), &CancellationToken::new()),
            Err(IndexError::DestinationExists(_))
        ));
    }
}
