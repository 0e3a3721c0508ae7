//! Read side of an entry index

use super::query::query_terms;
use super::sources::SourceFiles;
use super::{Entry, StoredEntry, ENTRIES_DB};
use crate::error::IndexError;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Whole index held in memory for fast repeated lookups
struct LoadedIndex {
    entries: Vec<StoredEntry>,
    terms: HashMap<String, Vec<usize>>,
}

/// Directory-backed index open for reading
pub struct EntryIndexReader {
    dir: PathBuf,
    conn: Mutex<Connection>,
    sources: SourceFiles,
    rebase: Option<PathBuf>,
    loaded: Option<LoadedIndex>,
    size: u64,
}

impl EntryIndexReader {
    pub fn open(dir: impl AsRef<Path>, load_fully_in_memory: bool) -> Result<Self, IndexError> {
        let dir = dir.as_ref().to_path_buf();
        let db = dir.join(ENTRIES_DB);
        if !db.is_file() {
            return Err(IndexError::NotFound(dir));
        }

        let conn = Connection::open_with_flags(
            &db,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let size: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        let sources = SourceFiles::load_existing(&dir)?;
        let loaded = if load_fully_in_memory {
            Some(load_all(&conn)?)
        } else {
            None
        };

        debug!(
            index = %dir.display(),
            entries = size,
            in_memory = load_fully_in_memory,
            "Opened index for reading"
        );

        Ok(Self {
            dir,
            conn: Mutex::new(conn),
            sources,
            rebase: None,
            loaded,
            size: size.max(0) as u64,
        })
    }

    /// Resolve relocatable source paths against `dir`
    pub fn with_rebase(mut self, dir: impl Into<PathBuf>) -> Self {
        self.rebase = Some(dir.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Look up entries for an identifier or composite identifier query
    pub fn get_entry(&self, query: &str) -> Result<Vec<Entry>, IndexError> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let stored = match &self.loaded {
            Some(loaded) => {
                let mut hits: Vec<usize> = terms
                    .iter()
                    .filter_map(|term| loaded.terms.get(term))
                    .flatten()
                    .copied()
                    .collect();
                hits.sort_unstable();
                hits.dedup();
                hits.into_iter().map(|i| loaded.entries[i].clone()).collect()
            }
            None => self.query_store(&terms)?,
        };

        stored.iter().map(|entry| self.resolve(entry)).collect()
    }

    fn query_store(&self, terms: &[String]) -> Result<Vec<StoredEntry>, IndexError> {
        let placeholders = vec!["?"; terms.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT e.rowid, e.id, e.name, e.file_key, e.start, e.stop
             FROM terms t JOIN entries e ON e.rowid = t.entry
             WHERE t.term IN ({placeholders})
             ORDER BY e.rowid"
        );

        let conn = self.conn.lock().map_err(|_| IndexError::LockPoisoned)?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(terms.iter()), raw_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(parse_row(row?)?);
        }
        Ok(entries)
    }

    fn resolve(&self, entry: &StoredEntry) -> Result<Entry, IndexError> {
        let source_file = self
            .sources
            .resolve(&entry.file_key, self.rebase.as_deref())
            .ok_or_else(|| IndexError::UnknownSourceKey(entry.file_key.clone()))?;
        Ok(Entry {
            id: entry.id.clone(),
            name: entry.name.clone(),
            source_file,
            start: entry.start,
            stop: entry.stop,
        })
    }

    /// Read the raw bytes of `entry` from its source file
    pub fn fetch_record(&self, entry: &Entry) -> Result<Vec<u8>, IndexError> {
        let mut file = File::open(&entry.source_file)?;
        file.seek(SeekFrom::Start(entry.start))?;
        let mut buf = vec![0u8; entry.len() as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Every stored row, in insertion order
    pub(crate) fn stored_entries(&self) -> Result<Vec<StoredEntry>, IndexError> {
        if let Some(loaded) = &self.loaded {
            return Ok(loaded.entries.clone());
        }
        let conn = self.conn.lock().map_err(|_| IndexError::LockPoisoned)?;
        Ok(load_all(&conn)?.entries)
    }

    /// Encoded source path behind `key`
    pub(crate) fn source_raw(&self, key: &str) -> Option<&str> {
        self.sources.raw(key)
    }
}

type RawRow = (i64, String, String, String, String, String);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parse_offset(value: &str) -> Result<u64, IndexError> {
    value
        .parse()
        .map_err(|_| IndexError::CorruptOffset(value.to_string()))
}

fn parse_row((_, id, name, file_key, start, stop): RawRow) -> Result<StoredEntry, IndexError> {
    Ok(StoredEntry {
        id,
        name,
        file_key,
        start: parse_offset(&start)?,
        stop: parse_offset(&stop)?,
    })
}

fn load_all(conn: &Connection) -> Result<LoadedIndex, IndexError> {
    let mut entries = Vec::new();
    let mut position_of_row = HashMap::new();
    {
        let mut stmt =
            conn.prepare("SELECT rowid, id, name, file_key, start, stop FROM entries ORDER BY rowid")?;
        for row in stmt.query_map([], raw_row)? {
            let row = row?;
            position_of_row.insert(row.0, entries.len());
            entries.push(parse_row(row)?);
        }
    }

    let mut terms: HashMap<String, Vec<usize>> = HashMap::new();
    let mut stmt = conn.prepare("SELECT term, entry FROM terms")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (term, rowid) = row?;
        if let Some(&position) = position_of_row.get(&rowid) {
            terms.entry(term).or_default().push(position);
        }
    }

    Ok(LoadedIndex { entries, terms })
}
