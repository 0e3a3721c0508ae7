//! Taxonomic filtering of records
//!
//! A record is screened by the taxon id found in its header. The id is looked
//! up in a [`TaxonomyDictionary`] to obtain its lineage (root first, the id
//! itself last) and the lineage is checked against the include and exclude
//! sets. Exclusion always wins over inclusion.
//!
//! Taxon ids missing from the dictionary let the record pass and are counted
//! so that a summary can be logged once the job finishes.

use crate::error::TaxonomyError;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Lookup from a taxon id to its ancestor chain
pub trait TaxonomyDictionary: Send + Sync {
    /// Semicolon-separated ancestor ids from the root down to and including
    /// `taxon_id`, or `None` if the id is unknown
    fn lineage(&self, taxon_id: &str) -> Option<String>;
}

/// Dictionary held entirely in memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryTaxonomy {
    lineages: HashMap<String, String>,
}

impl InMemoryTaxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, taxon_id: impl Into<String>, lineage: impl Into<String>) {
        self.lineages.insert(taxon_id.into(), lineage.into());
    }

    pub fn len(&self) -> usize {
        self.lineages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lineages.is_empty()
    }

    /// Load a `taxon_id<TAB>lineage` file
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn from_file(path: &Path) -> Result<Self, TaxonomyError> {
        let io_err = |source| TaxonomyError::Io {
            path: path.to_path_buf(),
            source,
        };
        let reader = BufReader::new(File::open(path).map_err(io_err)?);
        let mut dictionary = Self::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (taxon_id, lineage) =
                line.split_once('\t')
                    .ok_or_else(|| TaxonomyError::InvalidLine {
                        path: path.to_path_buf(),
                        line: line_no + 1,
                    })?;
            dictionary.insert(taxon_id.trim(), lineage.trim());
        }

        info!(
            path = %path.display(),
            taxa = dictionary.len(),
            "Loaded taxonomy dictionary"
        );
        Ok(dictionary)
    }
}

impl TaxonomyDictionary for InMemoryTaxonomy {
    fn lineage(&self, taxon_id: &str) -> Option<String> {
        self.lineages.get(taxon_id).cloned()
    }
}

/// Outcome of checking one taxon id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaxonVerdict {
    /// A taxon cross-reference was found in the record
    pub found_xref: bool,
    /// The record passes the filters
    pub valid: bool,
    /// The id was present in the dictionary
    pub known: bool,
}

/// Include/exclude filter over taxon lineages
pub struct TaxonomyMatcher {
    dictionary: Option<Arc<dyn TaxonomyDictionary>>,
    include: HashSet<String>,
    exclude: HashSet<String>,
    not_found: Mutex<BTreeMap<String, u64>>,
}

impl TaxonomyMatcher {
    pub fn new(dictionary: Option<Arc<dyn TaxonomyDictionary>>) -> Self {
        Self {
            dictionary,
            include: HashSet::new(),
            exclude: HashSet::new(),
            not_found: Mutex::new(BTreeMap::new()),
        }
    }

    /// Replace both filter sets
    pub fn set_filter<I, E, S, T>(&mut self, include: I, exclude: E)
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        self.include = include.into_iter().map(Into::into).collect();
        self.exclude = exclude.into_iter().map(Into::into).collect();
    }

    /// True when any include or exclude id is configured
    pub fn has_filter(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }

    /// Filters without a dictionary cannot be evaluated
    pub fn ensure_ready(&self) -> Result<(), TaxonomyError> {
        if self.has_filter() && self.dictionary.is_none() {
            return Err(TaxonomyError::MissingDictionary);
        }
        Ok(())
    }

    /// Screen `taxon_id` against the configured filters
    pub fn is_valid(&self, taxon_id: &str) -> TaxonVerdict {
        let lineage = self
            .dictionary
            .as_ref()
            .and_then(|dictionary| dictionary.lineage(taxon_id));

        let Some(lineage) = lineage else {
            if self.dictionary.is_some() {
                *self
                    .not_found
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(taxon_id.to_string())
                    .or_insert(0) += 1;
            }
            debug!(taxon_id, "Taxon not in dictionary, record passes");
            return TaxonVerdict {
                found_xref: true,
                valid: true,
                known: false,
            };
        };

        let mut included = self.include.is_empty();
        let mut excluded = false;
        for ancestor in lineage.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            if self.exclude.contains(ancestor) {
                excluded = true;
                break;
            }
            if self.include.contains(ancestor) {
                included = true;
            }
        }

        TaxonVerdict {
            found_xref: true,
            valid: included && !excluded,
            known: true,
        }
    }

    /// Taxon ids that were looked up but not found, with their hit counts
    pub fn not_found_summary(&self) -> Vec<(String, u64)> {
        self.not_found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, count)| (id.clone(), *count))
            .collect()
    }

    pub fn log_not_found_summary(&self) {
        let summary = self.not_found_summary();
        if summary.is_empty() {
            return;
        }
        let records: u64 = summary.iter().map(|(_, count)| count).sum();
        warn!(
            taxa = summary.len(),
            records, "Taxon ids missing from the taxonomy dictionary"
        );
        for (taxon_id, count) in summary {
            debug!(taxon_id, count, "Unknown taxon");
        }
    }
}

// Literal patterns, checked by the tests below.
#[allow(clippy::expect_used)]
static GENBANK_TAXON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"/db_xref="taxon:(\d+)""#).expect("valid regex"));
#[allow(clippy::expect_used)]
static SWISSPROT_TAXON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^OX\s+NCBI_TaxID=(\d+)").expect("valid regex"));
#[allow(clippy::expect_used)]
static FASTA_TAXON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:OX|[Tt]ax[Ii][Dd])=(\d+)").expect("valid regex"));

/// Where a format carries its taxon cross-reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxonXref {
    /// `/db_xref="taxon:9606"` in the FEATURES table
    GenbankDbXref,
    /// `OX   NCBI_TaxID=9606;`
    SwissProtOx,
    /// `OX=9606` or `TaxID=9606` in a header line
    FastaHeader,
}

impl TaxonXref {
    /// Extract the taxon id from `line`, if it carries one
    pub fn extract(self, line: &str) -> Option<&str> {
        let pattern = match self {
            TaxonXref::GenbankDbXref => &*GENBANK_TAXON,
            TaxonXref::SwissProtOx => &*SWISSPROT_TAXON,
            TaxonXref::FastaHeader => &*FASTA_TAXON,
        };
        pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn dictionary() -> Arc<dyn TaxonomyDictionary> {
        let mut taxa = InMemoryTaxonomy::new();
        taxa.insert("9606", "1;2759;7742;40674;9443;9606");
        taxa.insert("10090", "1;2759;7742;40674;10090");
        taxa.insert("562", "1;2;1224;562");
        Arc::new(taxa)
    }

    #[test]
    fn test_include_on_ancestor() {
        let mut matcher = TaxonomyMatcher::new(Some(dictionary()));
        matcher.set_filter(["40674"], Vec::<String>::new());

        assert!(matcher.is_valid("9606").valid);
        assert!(matcher.is_valid("10090").valid);
        assert!(!matcher.is_valid("562").valid);
    }

    #[test]
    fn test_exclusion_wins() {
        let mut matcher = TaxonomyMatcher::new(Some(dictionary()));
        matcher.set_filter(["40674"], ["9443"]);

        let human = matcher.is_valid("9606");
        assert!(human.known);
        assert!(!human.valid);
        assert!(matcher.is_valid("10090").valid);
    }

    #[test]
    fn test_unknown_taxon_passes_and_is_counted() {
        let mut matcher = TaxonomyMatcher::new(Some(dictionary()));
        matcher.set_filter(["40674"], Vec::<String>::new());

        let verdict = matcher.is_valid("424242");
        assert!(verdict.valid);
        assert!(!verdict.known);
        matcher.is_valid("424242");

        assert_eq!(matcher.not_found_summary(), vec![("424242".to_string(), 2)]);
    }

    #[test]
    fn test_filters_without_dictionary_are_rejected() {
        let mut matcher = TaxonomyMatcher::new(None);
        assert!(matcher.ensure_ready().is_ok());
        matcher.set_filter(Vec::<String>::new(), ["9606"]);
        assert!(matches!(
            matcher.ensure_ready(),
            Err(TaxonomyError::MissingDictionary)
        ));
    }

    #[test]
    fn test_xref_extraction() {
        assert_eq!(
            TaxonXref::GenbankDbXref.extract(r#"                     /db_xref="taxon:9606""#),
            Some("9606")
        );
        assert_eq!(
            TaxonXref::SwissProtOx.extract("OX   NCBI_TaxID=10090 {ECO:0000313};"),
            Some("10090")
        );
        assert_eq!(
            TaxonXref::FastaHeader.extract(">sp|P1|X_HUMAN Thing OS=Homo sapiens OX=9606 GN=X"),
            Some("9606")
        );
        assert_eq!(
            TaxonXref::FastaHeader.extract(">seq1 TaxID=562 E. coli"),
            Some("562")
        );
        assert_eq!(TaxonXref::SwissProtOx.extract("OS   Homo sapiens."), None);
    }

    #[test]
    fn test_dictionary_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# taxon\tlineage").unwrap();
        writeln!(file, "9606\t1;2759;9606").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "562\t1;2;562").unwrap();
        file.flush().unwrap();

        let taxa = InMemoryTaxonomy::from_file(file.path()).unwrap();
        assert_eq!(taxa.len(), 2);
        assert_eq!(taxa.lineage("562").as_deref(), Some("1;2;562"));
    }

    #[test]
    fn test_dictionary_rejects_malformed_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "9606 no tab here").unwrap();
        file.flush().unwrap();

        let err = InMemoryTaxonomy::from_file(file.path()).unwrap_err();
        assert!(matches!(err, TaxonomyError::InvalidLine { line: 1, .. }));
    }
}
