//! Write side of an entry index
//!
//! Entries are staged in memory and committed in one SQLite transaction when
//! the staging buffer runs low on its memory budget, on [`flush`] and on
//! [`close`]. Nothing staged is visible to readers until it is committed.
//!
//! [`flush`]: EntryIndexWriter::flush
//! [`close`]: EntryIndexWriter::close

use super::query::analyze;
use super::sources::SourceFiles;
use super::{StoredEntry, ENTRIES_DB, SCHEMA};
use crate::error::IndexError;
use crate::memory::MemoryBudget;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Fixed per-entry overhead of a staged entry beyond its strings
const STAGED_ENTRY_OVERHEAD: u64 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterOptions {
    pub staging_budget: MemoryBudget,
    /// Store source paths so they can be rebased at read time
    pub relocatable_sources: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            staging_budget: MemoryBudget::from_megabytes(64),
            relocatable_sources: false,
        }
    }
}

/// Directory-backed index open for writing
pub struct EntryIndexWriter {
    dir: PathBuf,
    conn: Connection,
    sources: SourceFiles,
    staging: Vec<StoredEntry>,
    staging_bytes: u64,
    options: WriterOptions,
    committed: u64,
}

impl EntryIndexWriter {
    /// Open `dir` for writing, creating the index if it does not exist
    pub fn create(dir: impl AsRef<Path>, options: WriterOptions) -> Result<Self, IndexError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let conn = Connection::open(dir.join(ENTRIES_DB))?;
        conn.execute_batch(SCHEMA)?;
        let committed: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        let sources = SourceFiles::open(&dir, options.relocatable_sources)?;

        debug!(index = %dir.display(), existing = committed, "Opened index for writing");

        Ok(Self {
            dir,
            conn,
            sources,
            staging: Vec::new(),
            staging_bytes: 0,
            options,
            committed: committed.max(0) as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Stage one entry; `start..stop` is its byte range in `source`
    pub fn add_entry(
        &mut self,
        id: &str,
        name: &str,
        source: &Path,
        start: u64,
        stop: u64,
    ) -> Result<(), IndexError> {
        if start >= stop {
            return Err(IndexError::InvalidRange {
                id: id.to_string(),
                start,
                stop,
            });
        }
        let file_key = self.sources.key_for(source)?;
        self.stage(StoredEntry {
            id: id.to_string(),
            name: name.to_string(),
            file_key,
            start,
            stop,
        })
    }

    /// Stage an entry copied from another index, re-keying its source
    pub(crate) fn add_stored(&mut self, entry: &StoredEntry, raw_source: &str) -> Result<(), IndexError> {
        let file_key = self.sources.key_for_raw(raw_source)?;
        self.stage(StoredEntry {
            file_key,
            ..entry.clone()
        })
    }

    fn stage(&mut self, entry: StoredEntry) -> Result<(), IndexError> {
        self.staging_bytes += (entry.id.len() + entry.name.len() + entry.file_key.len()) as u64
            + STAGED_ENTRY_OVERHEAD;
        self.staging.push(entry);
        if self.options.staging_budget.is_low(self.staging_bytes) {
            self.flush()?;
        }
        Ok(())
    }

    /// Commit all staged entries in one transaction
    pub fn flush(&mut self) -> Result<(), IndexError> {
        if self.staging.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut insert_entry = tx.prepare_cached(
                "INSERT INTO entries (id, name, file_key, start, stop) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut insert_term = tx.prepare_cached("INSERT INTO terms (term, entry) VALUES (?1, ?2)")?;

            for entry in &self.staging {
                let rowid = insert_entry.insert(params![
                    entry.id,
                    entry.name,
                    entry.file_key,
                    entry.start.to_string(),
                    entry.stop.to_string(),
                ])?;
                for term in analyze(&entry.id, &entry.name) {
                    insert_term.execute(params![term, rowid])?;
                }
            }
        }
        tx.commit()?;

        debug!(
            index = %self.dir.display(),
            entries = self.staging.len(),
            "Committed staged entries"
        );
        self.committed += self.staging.len() as u64;
        self.staging.clear();
        self.staging_bytes = 0;
        Ok(())
    }

    /// Committed plus staged entries
    pub fn size(&self) -> u64 {
        self.committed + self.staging.len() as u64
    }

    /// Append every entry of the index at `src` with set-based SQL
    ///
    /// Source keys are remapped through this index's table and row ids are
    /// shifted past the current maximum so that term references stay valid.
    pub(crate) fn absorb(&mut self, src: &Path) -> Result<u64, IndexError> {
        self.flush()?;

        let src_sources = SourceFiles::load_existing(src)?;
        let mut key_map = Vec::with_capacity(src_sources.len());
        for (old_key, raw) in src_sources.iter() {
            key_map.push((old_key.to_string(), self.sources.key_for_raw(raw)?));
        }

        let src_db = src.join(ENTRIES_DB);
        if !src_db.is_file() {
            return Err(IndexError::NotFound(src.to_path_buf()));
        }
        self.conn.execute(
            "ATTACH DATABASE ?1 AS src",
            params![src_db.to_string_lossy().into_owned()],
        )?;
        let copied = self.absorb_attached(&key_map);
        let detached = self.conn.execute("DETACH DATABASE src", []);
        let copied = copied?;
        detached?;

        self.committed += copied;
        Ok(copied)
    }

    fn absorb_attached(&mut self, key_map: &[(String, String)]) -> Result<u64, IndexError> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS key_map (old TEXT PRIMARY KEY, new TEXT NOT NULL);
             DELETE FROM key_map;",
        )?;
        {
            let mut insert = tx.prepare("INSERT INTO key_map (old, new) VALUES (?1, ?2)")?;
            for (old, new) in key_map {
                insert.execute(params![old, new])?;
            }
        }

        let unmapped: Option<String> = tx
            .query_row(
                "SELECT e.file_key FROM src.entries e
                 LEFT JOIN key_map k ON k.old = e.file_key
                 WHERE k.old IS NULL LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(key) = unmapped {
            return Err(IndexError::UnknownSourceKey(key));
        }

        let offset: i64 = tx.query_row("SELECT COALESCE(MAX(rowid), 0) FROM main.entries", [], |row| {
            row.get(0)
        })?;
        let copied = tx.execute(
            "INSERT INTO main.entries (rowid, id, name, file_key, start, stop)
             SELECT e.rowid + ?1, e.id, e.name, k.new, e.start, e.stop
             FROM src.entries e JOIN key_map k ON k.old = e.file_key",
            params![offset],
        )?;
        tx.execute(
            "INSERT INTO main.terms (term, entry) SELECT term, entry + ?1 FROM src.terms",
            params![offset],
        )?;
        tx.commit()?;
        Ok(copied as u64)
    }

    /// Commit what is staged and return the final entry count
    pub fn close(mut self) -> Result<u64, IndexError> {
        self.flush()?;
        info!(
            index = %self.dir.display(),
            entries = self.committed,
            sources = self.sources.len(),
            "Index closed"
        );
        Ok(self.committed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = EntryIndexWriter::create(dir.path(), WriterOptions::default()).unwrap();
        let err = writer
            .add_entry("X1", "x", Path::new("/data/x.gb"), 10, 10)
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidRange { start: 10, stop: 10, .. }));
    }

    #[test]
    fn test_staged_entries_are_not_committed_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = EntryIndexWriter::create(dir.path(), WriterOptions::default()).unwrap();
        writer.add_entry("A1", "a", Path::new("/data/x.gb"), 0, 10).unwrap();
        writer.add_entry("A2", "b", Path::new("/data/x.gb"), 10, 20).unwrap();
        assert_eq!(writer.size(), 2);

        let probe = Connection::open(dir.path().join(ENTRIES_DB)).unwrap();
        let count = |conn: &Connection| -> i64 {
            conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0)).unwrap()
        };
        assert_eq!(count(&probe), 0);

        writer.flush().unwrap();
        assert_eq!(count(&probe), 2);
        assert_eq!(writer.close().unwrap(), 2);
    }

    #[test]
    fn test_small_budget_flushes_automatically() {
        let dir = tempfile::tempdir().unwrap();
        let options = WriterOptions {
            staging_budget: MemoryBudget::new(512),
            relocatable_sources: false,
        };
        let mut writer = EntryIndexWriter::create(dir.path(), options).unwrap();
        for i in 0..20u64 {
            writer
                .add_entry(&format!("ID{i}"), "n", Path::new("/data/x.gb"), i * 10, i * 10 + 5)
                .unwrap();
        }
        assert!(writer.committed > 0);
        assert_eq!(writer.size(), 20);
    }

    #[test]
    fn test_bulk_copy_rejects_entries_without_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let mut writer = EntryIndexWriter::create(&src, WriterOptions::default()).unwrap();
        writer.add_entry("A1", "a", Path::new("/data/x.gb"), 0, 10).unwrap();
        writer.close().unwrap();
        std::fs::remove_file(src.join("sources").join("f1")).unwrap();

        let mut dest = EntryIndexWriter::create(dir.path().join("dest"), WriterOptions::default()).unwrap();
        let err = dest.absorb(&src).unwrap_err();
        assert!(matches!(err, IndexError::UnknownSourceKey(ref key) if key == "f1"));
        assert_eq!(dest.close().unwrap(), 0);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = EntryIndexWriter::create(dir.path(), WriterOptions::default()).unwrap();
        writer.add_entry("A1", "a", Path::new("/data/x.gb"), 0, 10).unwrap();
        writer.close().unwrap();

        let mut writer = EntryIndexWriter::create(dir.path(), WriterOptions::default()).unwrap();
        assert_eq!(writer.size(), 1);
        writer.add_entry("A2", "a", Path::new("/data/y.gb"), 0, 10).unwrap();
        assert_eq!(writer.close().unwrap(), 2);
    }
}
