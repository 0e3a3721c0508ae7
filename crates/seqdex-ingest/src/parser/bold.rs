//! BOLD Systems tabular export converter
//!
//! BOLD publishes specimen data as tab-separated text with one row per
//! specimen. Rows are rewritten as GenBank-style records into an output file
//! that the GenBank parser can index afterwards; the converter itself never
//! writes to an index. Offsets reported to the monitor refer to the output
//! file.

use super::{DbFormat, DbParser, FoundSequence, ParseStats, ParserCore, ParserOptions};
use crate::error::ParseError;
use crate::index::EntryIndexWriter;
use csv::{ReaderBuilder, StringRecord};
use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Rank columns from the top of the tree down, species last
const RANK_COLUMNS: &[&str] = &[
    "phylum_name",
    "class_name",
    "order_name",
    "family_name",
    "subfamily_name",
    "genus_name",
    "species_name",
];

const AMINO_ACID_COLUMNS: &[&str] = &["aminoacids", "amino_acids", "translation"];

/// NCBI taxon id columns, first match wins
const TAXON_COLUMNS: &[&str] = &["ncbi_taxid", "taxid"];

const BASES_PER_LINE: usize = 60;
const BASES_PER_BLOCK: usize = 10;

/// Positions of the columns the converter reads
#[derive(Debug)]
struct Columns {
    process_id: Option<usize>,
    sample_id: Option<usize>,
    nucleotides: usize,
    amino_acids: Option<usize>,
    marker: Option<usize>,
    bin: Option<usize>,
    taxon: Option<usize>,
    ranks: Vec<usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Result<Self, String> {
        let find = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));

        let nucleotides = find("nucleotides").ok_or("missing `nucleotides` column")?;
        let process_id = find("processid");
        let sample_id = find("sampleid");
        if process_id.is_none() && sample_id.is_none() {
            return Err("missing both `processid` and `sampleid` columns".to_string());
        }

        Ok(Self {
            process_id,
            sample_id,
            nucleotides,
            amino_acids: AMINO_ACID_COLUMNS.iter().find_map(|name| find(*name)),
            marker: find("markercode").or_else(|| find("marker_codes")),
            bin: find("bin_uri"),
            taxon: TAXON_COLUMNS.iter().find_map(|name| find(*name)),
            ranks: RANK_COLUMNS.iter().filter_map(|name| find(*name)).collect(),
        })
    }
}

fn field(record: &StringRecord, column: Option<usize>) -> Option<&str> {
    column
        .and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// One specimen, ready to be rendered
struct Specimen<'a> {
    accession: &'a str,
    sample_id: Option<&'a str>,
    marker: Option<&'a str>,
    bin: Option<&'a str>,
    taxon: Option<&'a str>,
    lineage: Vec<&'a str>,
    organism: &'a str,
    sequence: String,
    translation: Option<&'a str>,
}

impl<'a> Specimen<'a> {
    fn from_record(record: &'a StringRecord, columns: &Columns) -> Option<Self> {
        let accession = field(record, columns.process_id).or_else(|| field(record, columns.sample_id))?;
        let ranks: Vec<&str> = columns
            .ranks
            .iter()
            .filter_map(|&i| field(record, Some(i)))
            .collect();
        let organism = ranks.last().copied().unwrap_or("unidentified");
        let lineage = match ranks.split_last() {
            Some((_, higher)) => higher.to_vec(),
            None => Vec::new(),
        };

        Some(Self {
            accession,
            sample_id: field(record, columns.sample_id),
            marker: field(record, columns.marker),
            bin: field(record, columns.bin),
            taxon: field(record, columns.taxon),
            lineage,
            organism,
            sequence: field(record, Some(columns.nucleotides))
                .unwrap_or_default()
                .chars()
                .filter(char::is_ascii_alphabetic)
                .map(|c| c.to_ascii_lowercase())
                .collect(),
            translation: field(record, columns.amino_acids),
        })
    }

    fn render(&self, date: &str) -> Result<String, fmt::Error> {
        let len = self.sequence.len();
        let mut out = String::with_capacity(len * 2 + 512);

        writeln!(out, "LOCUS       {:<16} {:>11} bp    DNA     linear   INV {}", self.accession, len, date)?;
        writeln!(
            out,
            "DEFINITION  {} {} barcode.",
            self.organism,
            self.marker.unwrap_or("DNA")
        )?;
        writeln!(out, "ACCESSION   {}", self.accession)?;
        writeln!(out, "VERSION     {}", self.accession)?;
        writeln!(out, "KEYWORDS    BARCODE.")?;
        writeln!(out, "SOURCE      {}", self.organism)?;
        writeln!(out, "  ORGANISM  {}", self.organism)?;
        if !self.lineage.is_empty() {
            writeln!(out, "            {}.", self.lineage.join("; "))?;
        }
        writeln!(out, "FEATURES             Location/Qualifiers")?;
        writeln!(out, "     source          1..{len}")?;
        writeln!(out, "                     /organism=\"{}\"", self.organism)?;
        if let Some(sample) = self.sample_id {
            writeln!(out, "                     /specimen_voucher=\"{sample}\"")?;
        }
        if let Some(bin) = self.bin {
            writeln!(out, "                     /db_xref=\"BOLD:{bin}\"")?;
        }
        if let Some(taxon) = self.taxon {
            writeln!(out, "                     /db_xref=\"taxon:{taxon}\"")?;
        }
        if let Some(translation) = self.translation {
            writeln!(out, "     CDS             1..{len}")?;
            writeln!(out, "                     /translation=\"{translation}\"")?;
        }
        writeln!(out, "ORIGIN")?;
        for (line_no, chunk) in self.sequence.as_bytes().chunks(BASES_PER_LINE).enumerate() {
            write!(out, "{:>9}", line_no * BASES_PER_LINE + 1)?;
            for block in chunk.chunks(BASES_PER_BLOCK) {
                out.push(' ');
                out.push_str(&String::from_utf8_lossy(block));
            }
            out.push('\n');
        }
        out.push_str("//\n");
        Ok(out)
    }
}

/// Converts a BOLD export into a GenBank-style flat file
pub struct BoldConverter {
    core: ParserCore,
    output: PathBuf,
}

impl BoldConverter {
    pub fn new(output: impl Into<PathBuf>, options: ParserOptions) -> Self {
        Self {
            core: ParserCore::new(options),
            output: output.into(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

fn csv_error(file: &Path, record: u64, e: csv::Error) -> ParseError {
    let reason = e.to_string();
    match e.into_kind() {
        csv::ErrorKind::Io(source) => ParseError::Io {
            file: file.to_path_buf(),
            record,
            source,
        },
        _ => ParseError::Malformed {
            file: file.to_path_buf(),
            reason,
        },
    }
}

impl DbParser for BoldConverter {
    fn format(&self) -> DbFormat {
        DbFormat::Bold
    }

    fn core(&self) -> &ParserCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParserCore {
        &mut self.core
    }

    /// Convert `file`; `index` is ignored
    fn parse(&mut self, file: &Path, _index: Option<&mut EntryIndexWriter>) -> Result<ParseStats, ParseError> {
        let size = std::fs::metadata(file)
            .map_err(|source| ParseError::Io {
                file: file.to_path_buf(),
                record: 0,
                source,
            })?
            .len();
        self.core.begin_file(file, size);

        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .quoting(false)
            .from_path(file)
            .map_err(|e| csv_error(file, 0, e))?;
        let columns = Columns::from_headers(reader.headers().map_err(|e| csv_error(file, 0, e))?)
            .map_err(|reason| ParseError::Malformed {
                file: file.to_path_buf(),
                reason,
            })?;
        debug!(?columns, "BOLD columns resolved");

        let output_error = |source| ParseError::Io {
            file: self.output.clone(),
            record: 0,
            source,
        };
        let mut out = BufWriter::new(File::create(&self.output).map_err(output_error)?);
        let date = chrono::Utc::now().format("%d-%b-%Y").to_string().to_uppercase();
        let mut offset = 0u64;
        let mut record = StringRecord::new();
        let mut ordinal = 0u64;

        while reader
            .read_record(&mut record)
            .map_err(|e| csv_error(file, ordinal + 1, e))?
        {
            ordinal += 1;
            self.core.record_seen()?;

            let Some(specimen) = Specimen::from_record(&record, &columns) else {
                self.core.discard("", "row without process or sample id");
                continue;
            };
            if specimen.sequence.is_empty() {
                self.core.discard(specimen.accession, "empty nucleotide sequence");
                continue;
            }

            if !self.core.taxon_allowed(specimen.taxon) {
                self.core.discard(specimen.accession, "excluded by taxonomy filter");
                continue;
            }

            let text = specimen.render(&date).map_err(|_| ParseError::Malformed {
                file: file.to_path_buf(),
                reason: format!("failed to render record {ordinal}"),
            })?;
            let stop = offset + text.len() as u64;
            let found = FoundSequence {
                id: specimen.accession,
                name: specimen.accession,
                file: &self.output,
                start: offset,
                stop,
            };
            if !self.core.screen(&found) {
                continue;
            }

            out.write_all(text.as_bytes()).map_err(|source| ParseError::Io {
                file: self.output.clone(),
                record: ordinal,
                source,
            })?;
            offset = stop;
            self.core.keep(specimen.accession);
        }

        out.flush().map_err(|source| ParseError::Io {
            file: self.output.clone(),
            record: ordinal,
            source,
        })?;
        self.core.end_file(file);
        Ok(self.core.stats())
    }
}
