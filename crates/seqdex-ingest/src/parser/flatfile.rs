//! Scanner for tagged flat files terminated by `//`
//!
//! GenBank and UniProtKB/Swiss-Prot text share one layout: a record opens
//! with a tag line carrying the record name, header lines follow until the
//! sequence section starts, and a `//` line closes the record. The stop
//! offset of a record is the first byte after its `//` line, terminator
//! included. Lines before the first opening tag are ignored.

use super::{ParseSession, ParseStats, ParserCore};
use crate::error::ParseError;
use crate::index::EntryIndexWriter;
use crate::reader::OffsetReader;
use crate::taxonomy::TaxonXref;
use std::path::Path;
use tracing::trace;

const END_OF_RECORD: &str = "//";

/// Tags and extraction rules of one flat-file dialect
pub(crate) struct FlatFileLayout {
    /// Tag of the line opening a record; its second token is the record name
    pub start_tag: &'static str,
    /// Tag of the line carrying the accession
    pub accession_tag: &'static str,
    /// Tag of the line where the header ends and the sequence begins
    pub sequence_tag: &'static str,
    pub taxon_xref: TaxonXref,
    /// Pull the primary accession out of an accession line
    pub accession_of: fn(&str) -> Option<&str>,
}

fn has_tag(line: &str, tag: &str) -> bool {
    line.starts_with(tag)
        && line[tag.len()..]
            .chars()
            .next()
            .map_or(true, char::is_whitespace)
}

pub(crate) fn scan(
    core: &mut ParserCore,
    layout: &FlatFileLayout,
    file: &Path,
    mut index: Option<&mut EntryIndexWriter>,
) -> Result<ParseStats, ParseError> {
    let mut session = ParseSession::default();
    let mut reader = OffsetReader::open(file).map_err(|e| core.io_error(file, &session, e))?;
    core.begin_file(file, reader.size());

    loop {
        let line = match reader.next_line() {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => return Err(core.io_error(file, &session, e)),
        };
        let text = line.text;

        if !session.in_record {
            if has_tag(text, layout.start_tag) {
                session.begin_record(line.start);
                let name = text.split_whitespace().nth(1).ok_or_else(|| {
                    ParseError::MissingIdentifier {
                        file: file.to_path_buf(),
                        record: session.ordinal,
                        marker: layout.start_tag,
                    }
                })?;
                session.id = Some(name.to_string());
                session.name.push_str(name);
            } else if !text.trim().is_empty() {
                trace!(line = reader.lines_read(), "Skipping line outside of a record");
            }
            continue;
        }

        if text.starts_with(END_OF_RECORD) {
            core.close_record(&session, file, line.next, index.as_deref_mut())?;
            session.end_record();
        } else if has_tag(text, layout.start_tag) {
            return Err(ParseError::UnterminatedRecord {
                file: file.to_path_buf(),
                record: session.ordinal,
            });
        } else if session.in_header {
            if has_tag(text, layout.sequence_tag) {
                session.in_header = false;
            } else if has_tag(text, layout.accession_tag) {
                if session.accession.is_none() {
                    session.accession = (layout.accession_of)(text).map(str::to_string);
                }
            } else {
                core.offer_taxonomy(&mut session, text, layout.taxon_xref);
            }
        }
    }

    if session.in_record {
        return Err(ParseError::UnexpectedEof {
            file: file.to_path_buf(),
            record: session.ordinal,
        });
    }

    core.end_file(file);
    Ok(core.stats())
}
