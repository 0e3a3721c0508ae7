//! UniProtKB/Swiss-Prot text parser
//!
//! Records open with `ID`; the entry name on that line is the display name
//! and the fallback identifier. The first accession of the first `AC` line
//! is the identifier. Taxon filtering reads `OX   NCBI_TaxID=N`.

use super::flatfile::{self, FlatFileLayout};
use super::{DbFormat, DbParser, ParseStats, ParserCore, ParserOptions};
use crate::error::ParseError;
use crate::index::EntryIndexWriter;
use crate::taxonomy::TaxonXref;
use std::path::Path;

const LAYOUT: FlatFileLayout = FlatFileLayout {
    start_tag: "ID",
    accession_tag: "AC",
    sequence_tag: "SQ",
    taxon_xref: TaxonXref::SwissProtOx,
    accession_of,
};

/// `AC   P69905; P01922;` -> `P69905`
fn accession_of(line: &str) -> Option<&str> {
    line.get(2..)?
        .split(';')
        .map(str::trim)
        .find(|accession| !accession.is_empty())
}

pub struct SwissProtParser {
    core: ParserCore,
}

impl SwissProtParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            core: ParserCore::new(options),
        }
    }
}

impl DbParser for SwissProtParser {
    fn format(&self) -> DbFormat {
        DbFormat::SwissProt
    }

    fn core(&self) -> &ParserCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParserCore {
        &mut self.core
    }

    fn parse(&mut self, file: &Path, index: Option<&mut EntryIndexWriter>) -> Result<ParseStats, ParseError> {
        flatfile::scan(&mut self.core, &LAYOUT, file, index)
    }
}
