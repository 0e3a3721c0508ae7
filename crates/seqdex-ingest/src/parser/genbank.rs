//! GenBank flat file parser
//!
//! Records open with `LOCUS`. The entry identifier is the first accession of
//! the `ACCESSION` line, falling back to the locus name; the display name is
//! the locus name. Taxon filtering reads `/db_xref="taxon:N"` qualifiers.

use super::flatfile::{self, FlatFileLayout};
use super::{DbFormat, DbParser, ParseStats, ParserCore, ParserOptions};
use crate::error::ParseError;
use crate::index::EntryIndexWriter;
use crate::taxonomy::TaxonXref;
use std::path::Path;

const LAYOUT: FlatFileLayout = FlatFileLayout {
    start_tag: "LOCUS",
    accession_tag: "ACCESSION",
    sequence_tag: "ORIGIN",
    taxon_xref: TaxonXref::GenbankDbXref,
    accession_of,
};

/// `ACCESSION   U49845 U49846` -> `U49845`
fn accession_of(line: &str) -> Option<&str> {
    line.split_whitespace().nth(1)
}

pub struct GenbankParser {
    core: ParserCore,
}

impl GenbankParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            core: ParserCore::new(options),
        }
    }
}

impl DbParser for GenbankParser {
    fn format(&self) -> DbFormat {
        DbFormat::Genbank
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::parser::test_support::RecordingMonitor;
    use crate::taxonomy::{InMemoryTaxonomy, TaxonomyMatcher};
    use std::io::Write;
    use std::sync::Arc;

    const RECORD_A: &str = "LOCUS       SCU49845     5028 bp    DNA             PLN       21-JUN-1999
DEFINITION  Saccharomyces cerevisiae TCP1-beta gene.
ACCESSION   U49845
VERSION     U49845.1
FEATURES             Location/Qualifiers
     source          1..5028
                     /organism=\"Saccharomyces cerevisiae\"
                     /db_xref=\"taxon:4932\"
ORIGIN
        1 gatcctccat atacaacggt
//
";

    const RECORD_B: &str = "LOCUS       HSBGL1       120 bp    DNA             PRI       01-JAN-2000
DEFINITION  Human beta-globin.
ACCESSION   J00179 V00499
FEATURES             Location/Qualifiers
     source          1..120
                     /db_xref=\"taxon:9606\"
ORIGIN
        1 acgtacgtac
//
";

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_identifiers_and_ranges() {
        let content = format!("GBPLN1.SEQ   Genetic Sequence Data Bank\n\n{RECORD_A}{RECORD_B}");
        let file = write_temp(&content);
        let monitor = Arc::new(RecordingMonitor::default());

        let mut parser = GenbankParser::new(ParserOptions::default());
        parser.set_monitor(monitor.clone());
        let stats = parser.parse(file.path(), None).unwrap();

        assert_eq!(stats.total, 2);
        assert_eq!(stats.kept, 2);

        let found = monitor.found.lock().unwrap();
        let preamble = content.find("LOCUS").unwrap() as u64;
        assert_eq!(found[0], ("U49845".to_string(), preamble, preamble + RECORD_A.len() as u64));
        assert_eq!(found[1].0, "J00179");
        assert_eq!(found[1].2, content.len() as u64);
        assert_eq!(*monitor.kept_reports.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_locus_name_is_fallback_identifier() {
        let record = RECORD_A.replace("ACCESSION   U49845\n", "");
        let file = write_temp(&record);
        let monitor = Arc::new(RecordingMonitor::default());

        let mut parser = GenbankParser::new(ParserOptions::default());
        parser.set_monitor(monitor.clone());
        parser.parse(file.path(), None).unwrap();
        assert_eq!(monitor.found.lock().unwrap()[0].0, "SCU49845");
    }

    #[test]
    fn test_missing_locus_name_is_fatal() {
        let file = write_temp("LOCUS\nORIGIN\n//\n");
        let mut parser = GenbankParser::new(ParserOptions::default());
        let err = parser.parse(file.path(), None).unwrap_err();
        assert!(matches!(err, ParseError::MissingIdentifier { record: 1, .. }));
    }

    #[test]
    fn test_truncated_record() {
        let truncated = &RECORD_A[..RECORD_A.len() - 3];
        let file = write_temp(truncated);
        let mut parser = GenbankParser::new(ParserOptions::default());
        let err = parser.parse(file.path(), None).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { record: 1, .. }));
    }

    #[test]
    fn test_taxonomy_exclusion() {
        let file = write_temp(&format!("{RECORD_A}{RECORD_B}"));
        let mut taxa = InMemoryTaxonomy::new();
        taxa.insert("4932", "1;2759;4751;4932");
        taxa.insert("9606", "1;2759;33208;9606");
        let mut matcher = TaxonomyMatcher::new(Some(Arc::new(taxa)));
        matcher.set_filter(["2759"], ["33208"]);

        let mut parser = GenbankParser::new(ParserOptions::default());
        parser.set_taxonomy(Arc::new(matcher));
        let stats = parser.parse(file.path(), None).unwrap();

        assert_eq!(stats.total, 2);
        assert_eq!(stats.kept, 1);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn test_duplicate_from_monitor_is_discarded() {
        let file = write_temp(&format!("{RECORD_A}{RECORD_B}"));
        let monitor = Arc::new(RecordingMonitor {
            reject: vec!["J00179".to_string()],
            ..RecordingMonitor::default()
        });

        let mut parser = GenbankParser::new(ParserOptions::default());
        parser.set_monitor(monitor);
        parser.set_check_redundancy(true);
        let stats = parser.parse(file.path(), None).unwrap();
        assert_eq!((stats.kept, stats.discarded), (1, 1));
        assert_eq!(parser.entries_kept(), 1);
    }

    #[test]
    fn test_cancellation_stops_at_record_boundary() {
        let file = write_temp(RECORD_A);
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();

        let mut parser = GenbankParser::new(ParserOptions::default());
        parser.set_cancellation(token);
        assert!(matches!(
            parser.parse(file.path(), None),
            Err(ParseError::Cancelled)
        ));
        assert_eq!(parser.entries_total(), 0);
    }
}
