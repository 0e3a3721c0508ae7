//! Flat-file database parsers
//!
//! Each parser scans one file line by line through [`OffsetReader`], finds
//! record boundaries, extracts an identifier and display name per record and
//! reports `[start, stop)` byte ranges to an optional [`EntryIndexWriter`].
//! The bookkeeping every format shares (taxonomy screening, redundancy checks
//! through the [`ParserMonitor`], kept/discarded counters and cancellation)
//! lives in [`ParserCore`].
//!
//! [`OffsetReader`]: crate::reader::OffsetReader

pub mod bold;
mod flatfile;
pub mod fasta;
pub mod genbank;
pub mod swissprot;

pub use bold::BoldConverter;
pub use fasta::FastaParser;
pub use genbank::GenbankParser;
pub use swissprot::SwissProtParser;

use crate::error::ParseError;
use crate::index::EntryIndexWriter;
use crate::taxonomy::{TaxonXref, TaxonomyMatcher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Supported input formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbFormat {
    Genbank,
    SwissProt,
    Fasta,
    /// BOLD tab-separated export, converted to GenBank-style text
    Bold,
}

impl DbFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DbFormat::Genbank => "genbank",
            DbFormat::SwissProt => "swissprot",
            DbFormat::Fasta => "fasta",
            DbFormat::Bold => "bold",
        }
    }
}

impl fmt::Display for DbFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "genbank" | "gb" | "gbk" => Ok(DbFormat::Genbank),
            "swissprot" | "uniprot" | "embl" | "dat" => Ok(DbFormat::SwissProt),
            "fasta" | "fa" | "faa" | "fna" => Ok(DbFormat::Fasta),
            "bold" | "tsv" => Ok(DbFormat::Bold),
            other => Err(format!("unknown database format: {other}")),
        }
    }
}

/// What to do with a FASTA record whose sequence has no letters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmptySequencePolicy {
    /// Count the record as discarded and log a warning
    #[default]
    WarnAndSkip,
    /// Abort the file
    Fail,
}

impl FromStr for EmptySequencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" | "warn" | "warn-and-skip" => Ok(Self::WarnAndSkip),
            "fail" | "error" => Ok(Self::Fail),
            other => Err(format!("unknown empty sequence policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserOptions {
    /// Log every record as it is kept or discarded
    pub verbose: bool,
    /// Ask the monitor to reject identifiers seen before in this job
    pub check_redundancy: bool,
    pub empty_sequence: EmptySequencePolicy,
}

/// A record located in a file, as reported to the monitor
#[derive(Debug, Clone, Copy)]
pub struct FoundSequence<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub file: &'a Path,
    pub start: u64,
    pub stop: u64,
}

/// Monitor's decision on a reported sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    Accepted,
    Duplicate,
}

/// Observer of parser progress
///
/// Shared between the parser and the job that owns it, so all methods take
/// `&self`.
pub trait ParserMonitor: Send + Sync {
    fn start_processing_file(&self, file: &Path, size_bytes: u64);

    /// Called once per record that passed taxonomy screening
    ///
    /// # Arguments
    /// * `found` - The record and its byte range
    /// * `check_redundancy` - Whether the identifier must be checked against
    ///   those already seen in the job
    ///
    /// # Returns
    /// [`SeqVerdict::Duplicate`] when the record must be discarded
    fn seq_found(&self, found: &FoundSequence<'_>, check_redundancy: bool) -> SeqVerdict;

    fn stop_processing_file(&self, file: &Path, entries_kept: u64);

    /// True once any duplicate has been reported in the job
    fn redundant_sequence_found(&self) -> bool;
}

/// Per-file record counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseStats {
    pub total: u64,
    pub kept: u64,
    pub discarded: u64,
}

/// Record currently being scanned
#[derive(Debug, Default)]
pub(crate) struct ParseSession {
    /// 1-based ordinal of the current record
    pub ordinal: u64,
    pub in_record: bool,
    pub in_header: bool,
    pub start: u64,
    /// Primary name from the record's first line
    pub id: Option<String>,
    /// Accession, preferred over `id` when present
    pub accession: Option<String>,
    pub name: String,
    pub letters: u64,
    pub seen_taxon: bool,
    pub seen_taxon_valid: bool,
    pub taxon_known: bool,
}

impl ParseSession {
    pub fn begin_record(&mut self, start: u64) {
        self.ordinal += 1;
        self.in_record = true;
        self.in_header = true;
        self.start = start;
        self.id = None;
        self.accession = None;
        self.name.clear();
        self.letters = 0;
        self.seen_taxon = false;
        self.seen_taxon_valid = true;
        self.taxon_known = false;
    }

    pub fn end_record(&mut self) {
        self.in_record = false;
        self.in_header = false;
    }

    pub fn identifier(&self) -> Option<&str> {
        self.accession.as_deref().or(self.id.as_deref())
    }

    pub fn is_valid(&self) -> bool {
        !self.seen_taxon || self.seen_taxon_valid
    }
}

/// State shared by every parser implementation
#[derive(Default)]
pub struct ParserCore {
    options: ParserOptions,
    monitor: Option<Arc<dyn ParserMonitor>>,
    taxonomy: Option<Arc<TaxonomyMatcher>>,
    cancel: CancellationToken,
    stats: ParseStats,
}

impl ParserCore {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    fn filtering(&self) -> Option<&TaxonomyMatcher> {
        self.taxonomy.as_deref().filter(|matcher| matcher.has_filter())
    }

    pub(crate) fn begin_file(&mut self, file: &Path, size_bytes: u64) {
        self.stats = ParseStats::default();
        if let Some(monitor) = &self.monitor {
            monitor.start_processing_file(file, size_bytes);
        }
        info!(file = %file.display(), size_bytes, "Parsing file");
    }

    pub(crate) fn end_file(&self, file: &Path) {
        if let Some(monitor) = &self.monitor {
            monitor.stop_processing_file(file, self.stats.kept);
        }
        info!(
            file = %file.display(),
            total = self.stats.total,
            kept = self.stats.kept,
            discarded = self.stats.discarded,
            "File parsed"
        );
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), ParseError> {
        if self.cancel.is_cancelled() {
            return Err(ParseError::Cancelled);
        }
        Ok(())
    }

    /// Screen a header line for the record's taxon, at most once per record
    pub(crate) fn offer_taxonomy(&self, session: &mut ParseSession, line: &str, xref: TaxonXref) {
        if session.seen_taxon {
            return;
        }
        let Some(matcher) = self.filtering() else {
            return;
        };
        if let Some(taxon_id) = xref.extract(line) {
            let verdict = matcher.is_valid(taxon_id);
            session.seen_taxon = verdict.found_xref;
            session.seen_taxon_valid = verdict.valid;
            session.taxon_known = verdict.known;
        }
    }

    /// Verdict for a record whose taxon id is already known
    ///
    /// Records without a taxon id pass, as do all records when no filter is set.
    pub(crate) fn taxon_allowed(&self, taxon_id: Option<&str>) -> bool {
        match (self.filtering(), taxon_id) {
            (Some(matcher), Some(taxon_id)) => matcher.is_valid(taxon_id).valid,
            _ => true,
        }
    }

    /// Count a record and honour cancellation
    pub(crate) fn record_seen(&mut self) -> Result<(), ParseError> {
        self.check_cancelled()?;
        self.stats.total += 1;
        Ok(())
    }

    pub(crate) fn discard(&mut self, id: &str, reason: &str) {
        self.stats.discarded += 1;
        if self.options.verbose {
            info!(id, reason, "Record discarded");
        } else {
            debug!(id, reason, "Record discarded");
        }
    }

    /// Offer a record to the monitor; false if it was rejected as a duplicate
    pub(crate) fn screen(&mut self, found: &FoundSequence<'_>) -> bool {
        let verdict = match &self.monitor {
            Some(monitor) => monitor.seq_found(found, self.options.check_redundancy),
            None => SeqVerdict::Accepted,
        };
        if verdict == SeqVerdict::Duplicate {
            self.discard(found.id, "duplicate identifier");
            return false;
        }
        true
    }

    pub(crate) fn keep(&mut self, id: &str) {
        self.stats.kept += 1;
        if self.options.verbose {
            info!(id, "Record kept");
        }
    }

    /// Close the record held by `session`, ending at `stop`
    pub(crate) fn close_record(
        &mut self,
        session: &ParseSession,
        file: &Path,
        stop: u64,
        index: Option<&mut EntryIndexWriter>,
    ) -> Result<(), ParseError> {
        self.record_seen()?;

        let id = session.identifier().unwrap_or_default();
        if !session.is_valid() {
            self.discard(id, "excluded by taxonomy filter");
            return Ok(());
        }

        let found = FoundSequence {
            id,
            name: &session.name,
            file,
            start: session.start,
            stop,
        };
        if !self.screen(&found) {
            return Ok(());
        }

        if let Some(index) = index {
            index
                .add_entry(id, &session.name, file, session.start, stop)
                .map_err(|source| ParseError::Index {
                    file: file.to_path_buf(),
                    source,
                })?;
        }
        self.keep(id);
        Ok(())
    }

    /// Apply the empty-sequence policy to a record without sequence letters
    pub(crate) fn reject_empty(&mut self, session: &ParseSession, file: &Path) -> Result<(), ParseError> {
        let id = session.identifier().unwrap_or_default().to_string();
        match self.options.empty_sequence {
            EmptySequencePolicy::Fail => Err(ParseError::EmptySequence {
                file: file.to_path_buf(),
                record: session.ordinal,
                id,
            }),
            EmptySequencePolicy::WarnAndSkip => {
                self.record_seen()?;
                warn!(file = %file.display(), record = session.ordinal, id = %id, "Empty sequence skipped");
                self.stats.discarded += 1;
                Ok(())
            }
        }
    }

    pub(crate) fn io_error(&self, file: &Path, session: &ParseSession, source: std::io::Error) -> ParseError {
        ParseError::Io {
            file: file.to_path_buf(),
            record: session.ordinal,
            source,
        }
    }
}

/// A format-specific scanner
///
/// Implementations provide [`core`](DbParser::core),
/// [`core_mut`](DbParser::core_mut) and [`parse`](DbParser::parse); the
/// setters and counters come for free.
pub trait DbParser: Send {
    fn format(&self) -> DbFormat;

    fn core(&self) -> &ParserCore;

    fn core_mut(&mut self) -> &mut ParserCore;

    /// Scan `file` from start to end
    ///
    /// # Arguments
    /// * `file` - The flat file to scan
    /// * `index` - Destination for kept entries; `None` only counts
    ///
    /// # Returns
    /// Counters for this file. Any error aborts the file; entries already
    /// staged in `index` are left to the caller to discard.
    fn parse(&mut self, file: &Path, index: Option<&mut EntryIndexWriter>) -> Result<ParseStats, ParseError>;

    fn set_verbose(&mut self, verbose: bool) {
        self.core_mut().options.verbose = verbose;
    }

    fn set_check_redundancy(&mut self, check: bool) {
        self.core_mut().options.check_redundancy = check;
    }

    fn set_monitor(&mut self, monitor: Arc<dyn ParserMonitor>) {
        self.core_mut().monitor = Some(monitor);
    }

    fn set_taxonomy(&mut self, matcher: Arc<TaxonomyMatcher>) {
        self.core_mut().taxonomy = Some(matcher);
    }

    fn set_cancellation(&mut self, token: CancellationToken) {
        self.core_mut().cancel = token;
    }

    fn stats(&self) -> ParseStats {
        self.core().stats()
    }

    fn entries_kept(&self) -> u64 {
        self.core().stats.kept
    }

    fn entries_discarded(&self) -> u64 {
        self.core().stats.discarded
    }

    fn entries_total(&self) -> u64 {
        self.core().stats.total
    }
}

/// Build a line-oriented parser for `format`
///
/// BOLD exports are converted rather than indexed in place and need an output
/// path, so they go through [`BoldConverter::new`] instead.
pub fn parser_for(format: DbFormat, options: ParserOptions) -> Option<Box<dyn DbParser>> {
    match format {
        DbFormat::Genbank => Some(Box::new(GenbankParser::new(options))),
        DbFormat::SwissProt => Some(Box::new(SwissProtParser::new(options))),
        DbFormat::Fasta => Some(Box::new(FastaParser::new(options))),
        DbFormat::Bold => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Monitor that records what it sees and rejects listed identifiers
    #[derive(Default)]
    pub struct RecordingMonitor {
        pub found: Mutex<Vec<(String, u64, u64)>>,
        pub reject: Vec<String>,
        pub kept_reports: Mutex<Vec<u64>>,
    }

    impl ParserMonitor for RecordingMonitor {
        fn start_processing_file(&self, _file: &Path, _size_bytes: u64) {}

        fn seq_found(&self, found: &FoundSequence<'_>, _check_redundancy: bool) -> SeqVerdict {
            self.found
                .lock()
                .unwrap()
                .push((found.id.to_string(), found.start, found.stop));
            if self.reject.iter().any(|r| r == found.id) {
                SeqVerdict::Duplicate
            } else {
                SeqVerdict::Accepted
            }
        }

        fn stop_processing_file(&self, _file: &Path, entries_kept: u64) {
            self.kept_reports.lock().unwrap().push(entries_kept);
        }

        fn redundant_sequence_found(&self) -> bool {
            false
        }
    }
}
