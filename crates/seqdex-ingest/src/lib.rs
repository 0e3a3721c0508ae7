//! seqdex ingestion library
//!
//! Streams flat-file sequence databases (GenBank, UniProtKB/Swiss-Prot,
//! FASTA, and BOLD tabular exports) and builds an on-disk entry index mapping
//! each record identifier to the byte range of the record in its source file.
//!
//! # Components
//!
//! - [`reader`]: line reader that tracks exact byte offsets
//! - [`parser`]: per-format record scanners with taxonomy screening
//! - [`detector`]: job-wide duplicate identifier detection with disk spill
//! - [`index`]: entry index writer, reader, merge and source indirection
//! - [`task`]: resumable tasks, job context and the FIFO scheduler
//!
//! # Example
//!
//! ```no_run
//! use seqdex_ingest::index::{EntryIndexReader, EntryIndexWriter, WriterOptions};
//! use seqdex_ingest::parser::{DbParser, GenbankParser, ParserOptions};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut writer = EntryIndexWriter::create("gbpln.idx", WriterOptions::default())?;
//!     let mut parser = GenbankParser::new(ParserOptions::default());
//!     parser.parse(Path::new("gbpln1.seq"), Some(&mut writer))?;
//!     writer.close()?;
//!
//!     let reader = EntryIndexReader::open("gbpln.idx", false)?;
//!     for entry in reader.get_entry("U49845")? {
//!         println!("{} {}..{}", entry.id, entry.start, entry.stop);
//!     }
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod detector;
pub mod error;
pub mod index;
pub mod memory;
pub mod parser;
pub mod reader;
pub mod task;
pub mod taxonomy;

pub use config::IngestConfig;
pub use error::{DetectorError, IndexError, ParseError, TaskError, TaxonomyError};
pub use index::{Entry, EntryIndexReader, EntryIndexWriter};
pub use parser::{DbFormat, DbParser, ParserOptions};
pub use task::{IngestJob, ResumableTask, Scheduler};
