//! Persistent entry index
//!
//! An index is a directory holding `entries.db` (SQLite) and a `sources/`
//! folder of path indirection files. Each entry maps an identifier and a
//! display name to a byte range `[start, stop)` inside a source file.
//!
//! Offsets are stored as decimal text so that byte positions beyond the
//! signed 64-bit range used by SQLite integers survive unchanged.

pub mod merge;
pub mod query;
pub mod reader;
pub mod registry;
pub mod sources;
pub mod writer;

pub use merge::{merge_indexes, MergeOptions, MergeStats};
pub use reader::EntryIndexReader;
pub use registry::IndexRegistry;
pub use writer::{EntryIndexWriter, WriterOptions};

use crate::error::IndexError;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const ENTRIES_DB: &str = "entries.db";

pub(crate) const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        id       TEXT NOT NULL,
        name     TEXT NOT NULL,
        file_key TEXT NOT NULL,
        start    TEXT NOT NULL,
        stop     TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS terms (
        term  TEXT NOT NULL,
        entry INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS terms_by_term ON terms (term);
";

/// An indexed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub id: String,
    pub name: String,
    pub source_file: PathBuf,
    pub start: u64,
    pub stop: u64,
}

impl Entry {
    /// Length of the record in bytes
    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop == self.start
    }
}

/// Row as stored, with the source still behind its key
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredEntry {
    pub id: String,
    pub name: String,
    pub file_key: String,
    pub start: u64,
    pub stop: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// An index opened in one mode
pub enum EntryIndex {
    Reader(EntryIndexReader),
    Writer(EntryIndexWriter),
}

impl EntryIndex {
    /// Open the index at `path`
    ///
    /// `load_fully_in_memory` only applies to read mode.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, load_fully_in_memory: bool) -> Result<Self, IndexError> {
        match mode {
            OpenMode::Read => Ok(Self::Reader(EntryIndexReader::open(path, load_fully_in_memory)?)),
            OpenMode::Write => Ok(Self::Writer(EntryIndexWriter::create(path, WriterOptions::default())?)),
        }
    }

    pub fn mode(&self) -> OpenMode {
        match self {
            Self::Reader(_) => OpenMode::Read,
            Self::Writer(_) => OpenMode::Write,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Reader(reader) => reader.path(),
            Self::Writer(writer) => writer.path(),
        }
    }

    pub fn add_entry(&mut self, id: &str, name: &str, source: &Path, start: u64, stop: u64) -> Result<(), IndexError> {
        match self {
            Self::Writer(writer) => writer.add_entry(id, name, source, start, stop),
            Self::Reader(reader) => Err(IndexError::WrongMode {
                path: reader.path().to_path_buf(),
                mode: "reading",
                operation: "add entries",
            }),
        }
    }

    pub fn get_entry(&self, id: &str) -> Result<Vec<Entry>, IndexError> {
        match self {
            Self::Reader(reader) => reader.get_entry(id),
            Self::Writer(writer) => Err(IndexError::WrongMode {
                path: writer.path().to_path_buf(),
                mode: "writing",
                operation: "look up entries",
            }),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Reader(reader) => reader.size(),
            Self::Writer(writer) => writer.size(),
        }
    }

    /// Commit pending writes and release the index; returns its entry count
    pub fn close(self) -> Result<u64, IndexError> {
        match self {
            Self::Reader(reader) => Ok(reader.size()),
            Self::Writer(writer) => writer.close(),
        }
    }
}
