//! Fixtures shared by the integration tests
//!
//! Builders for small but well-formed GenBank, Swiss-Prot and FASTA records,
//! plus a monitor that records every range a parser reports.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use seqdex_ingest::parser::{FoundSequence, ParserMonitor, SeqVerdict};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Line terminator used when rendering fixtures
#[derive(Debug, Clone, Copy)]
pub enum Eol {
    Lf,
    CrLf,
}

impl Eol {
    pub fn apply(self, text: &str) -> String {
        match self {
            Eol::Lf => text.to_string(),
            Eol::CrLf => text.replace('\n', "\r\n"),
        }
    }
}

pub fn genbank_record(locus: &str, accession: &str, taxon: &str) -> String {
    format!(
        "LOCUS       {locus:<16} 40 bp    DNA     linear   PLN 21-JUN-1999
DEFINITION  Synthetic record {locus}.
ACCESSION   {accession}
VERSION     {accession}.1
FEATURES             Location/Qualifiers
     source          1..40
                     /organism=\"Test organism\"
                     /db_xref=\"taxon:{taxon}\"
ORIGIN
        1 gatcctccat atacaacggt atctccacct caggtttaga
//
"
    )
}

pub fn swissprot_record(name: &str, accession: &str, taxon: &str) -> String {
    format!(
        "ID   {name:<24} Reviewed;          30 AA.
AC   {accession}; Q00000;
DE   RecName: Full=Synthetic protein {name};
OS   Test organism.
OX   NCBI_TaxID={taxon};
SQ   SEQUENCE   30 AA;  3300 MW;  0123456789ABCDEF CRC64;
     MVLSPADKTN VKAAWGKVGA HAGEYGAEAL
//
"
    )
}

pub fn fasta_record(id: &str, description: &str, sequence: &str) -> String {
    format!(">{id} {description}\n{sequence}\n")
}

/// Concatenate `records`, returning the text and each record's `[start, stop)`
pub fn assemble(records: &[String], eol: Eol) -> (String, Vec<(u64, u64)>) {
    let mut text = String::new();
    let mut ranges = Vec::new();
    for record in records {
        let rendered = eol.apply(record);
        let start = text.len() as u64;
        text.push_str(&rendered);
        ranges.push((start, text.len() as u64));
    }
    (text, ranges)
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write fixture");
    path
}

/// Monitor that accepts everything and remembers what it saw
#[derive(Default)]
pub struct CollectingMonitor {
    pub found: Mutex<Vec<(String, u64, u64)>>,
}

impl CollectingMonitor {
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.found
            .lock()
            .unwrap()
            .iter()
            .map(|(_, start, stop)| (*start, *stop))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.found.lock().unwrap().iter().map(|(id, _, _)| id.clone()).collect()
    }
}

impl ParserMonitor for CollectingMonitor {
    fn start_processing_file(&self, _file: &Path, _size_bytes: u64) {}

    fn seq_found(&self, found: &FoundSequence<'_>, _check_redundancy: bool) -> SeqVerdict {
        self.found
            .lock()
            .unwrap()
            .push((found.id.to_string(), found.start, found.stop));
        SeqVerdict::Accepted
    }

    fn stop_processing_file(&self, _file: &Path, _entries_kept: u64) {}

    fn redundant_sequence_found(&self) -> bool {
        false
    }
}
