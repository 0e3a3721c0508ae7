//! Error types for the ingestion pipeline
//!
//! One enum per concern. Parser failures always abort the current file;
//! duplicate identifiers are not errors and never show up here.

use std::path::PathBuf;
use thiserror::Error;

/// Failure while scanning one source file
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("I/O error in {} while reading record #{record}: {source}", .file.display())]
    Io {
        file: PathBuf,
        record: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: record #{record} has no identifier on its {marker} line", .file.display())]
    MissingIdentifier {
        file: PathBuf,
        record: u64,
        marker: &'static str,
    },

    #[error("{}: unexpected end of file inside record #{record}", .file.display())]
    UnexpectedEof { file: PathBuf, record: u64 },

    #[error("{}: record #{record} starts before the previous one was closed", .file.display())]
    UnterminatedRecord { file: PathBuf, record: u64 },

    #[error("{}: record #{record} ({id}) has an empty sequence", .file.display())]
    EmptySequence {
        file: PathBuf,
        record: u64,
        id: String,
    },

    #[error("{}: malformed input: {reason}", .file.display())]
    Malformed { file: PathBuf, reason: String },

    #[error("index write failed while parsing {}: {source}", .file.display())]
    Index {
        file: PathBuf,
        #[source]
        source: IndexError,
    },

    #[error("parsing cancelled")]
    Cancelled,
}

/// Failure of the entry index store
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("index {} is open for {mode}, cannot {operation}", .path.display())]
    WrongMode {
        path: PathBuf,
        mode: &'static str,
        operation: &'static str,
    },

    #[error("invalid entry {id}: start {start} must be below stop {stop}")]
    InvalidRange { id: String, start: u64, stop: u64 },

    #[error("unknown source file key {0}")]
    UnknownSourceKey(String),

    #[error("stored offset {0:?} is not a decimal integer")]
    CorruptOffset(String),

    #[error("merge destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("index lock poisoned")]
    LockPoisoned,

    #[error("index operation cancelled")]
    Cancelled,
}

/// Failure of the persistent side of the unique-identifier detector
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Taxonomy configuration or dictionary loading failure
#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("taxonomy filters are configured but no taxonomy dictionary is available")]
    MissingDictionary,

    #[error("cannot read taxonomy dictionary {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: line {line}: expected `taxon_id<TAB>lineage`", .path.display())]
    InvalidLine { path: PathBuf, line: usize },
}

/// Failure of one scheduled unit of work
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),

    #[error(transparent)]
    Common(#[from] seqdex_common::SeqdexError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// True when the failure is a cooperative cancellation rather than a fault
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TaskError::Cancelled
                | TaskError::Parse(ParseError::Cancelled)
                | TaskError::Index(IndexError::Cancelled)
                | TaskError::Common(seqdex_common::SeqdexError::Cancelled)
        )
    }
}
