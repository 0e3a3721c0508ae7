//! FASTA parser
//!
//! A record runs from its `>` header line to the next header or the end of
//! the file, so its stop offset is the start of the following header. The
//! identifier is the header text up to the first whitespace and the rest of
//! the line is the display name. Records without any sequence letters are
//! handled according to [`EmptySequencePolicy`](super::EmptySequencePolicy).

use super::{DbFormat, DbParser, ParseSession, ParseStats, ParserCore, ParserOptions};
use crate::error::ParseError;
use crate::index::EntryIndexWriter;
use crate::reader::OffsetReader;
use crate::taxonomy::TaxonXref;
use std::path::Path;
use tracing::trace;

pub struct FastaParser {
    core: ParserCore,
}

impl FastaParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            core: ParserCore::new(options),
        }
    }

    fn finish(
        &mut self,
        session: &mut ParseSession,
        file: &Path,
        stop: u64,
        index: Option<&mut EntryIndexWriter>,
    ) -> Result<(), ParseError> {
        if session.letters == 0 {
            self.core.reject_empty(session, file)?;
        } else {
            self.core.close_record(session, file, stop, index)?;
        }
        session.end_record();
        Ok(())
    }
}

impl DbParser for FastaParser {
    fn format(&self) -> DbFormat {
        DbFormat::Fasta
    }

    fn core(&self) -> &ParserCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParserCore {
        &mut self.core
    }

    fn parse(&mut self, file: &Path, mut index: Option<&mut EntryIndexWriter>) -> Result<ParseStats, ParseError> {
        let mut session = ParseSession::default();
        let mut reader = OffsetReader::open(file).map_err(|e| self.core.io_error(file, &session, e))?;
        self.core.begin_file(file, reader.size());

        loop {
            let line = match reader.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return Err(self.core.io_error(file, &session, e)),
            };

            if let Some(header) = line.text.strip_prefix('>') {
                if session.in_record {
                    self.finish(&mut session, file, line.start, index.as_deref_mut())?;
                }
                session.begin_record(line.start);

                let header = header.trim();
                let (id, name) = match header.split_once(char::is_whitespace) {
                    Some((id, rest)) => (id, rest.trim()),
                    None => (header, ""),
                };
                if id.is_empty() {
                    return Err(ParseError::MissingIdentifier {
                        file: file.to_path_buf(),
                        record: session.ordinal,
                        marker: ">",
                    });
                }
                session.id = Some(id.to_string());
                session.name.push_str(name);
                self.core.offer_taxonomy(&mut session, header, TaxonXref::FastaHeader);
                session.in_header = false;
            } else if session.in_record {
                session.letters += line.text.bytes().filter(u8::is_ascii_alphabetic).count() as u64;
            } else if !line.text.trim().is_empty() {
                trace!(line = reader.lines_read(), "Skipping text before the first header");
            }
        }

        if session.in_record {
            let end = reader.position();
            self.finish(&mut session, file, end, index.as_deref_mut())?;
        }

        self.core.end_file(file);
        Ok(self.core.stats())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::parser::test_support::RecordingMonitor;
    use crate::parser::EmptySequencePolicy;
    use std::io::Write;
    use std::sync::Arc;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn parse_with_monitor(
        content: &str,
        options: ParserOptions,
    ) -> (Result<ParseStats, ParseError>, Arc<RecordingMonitor>) {
        let file = write_temp(content);
        let monitor = Arc::new(RecordingMonitor::default());
        let mut parser = FastaParser::new(options);
        parser.set_monitor(monitor.clone());
        (parser.parse(file.path(), None), monitor)
    }

    #[test]
    fn test_record_ranges() {
        let content = ">sp|P1|A_HUMAN Alpha OX=9606\nMKV\nLLA\n>P2 Beta\nGGG\n>P3\nW\n";
        let (stats, monitor) = parse_with_monitor(content, ParserOptions::default());
        assert_eq!(stats.unwrap().kept, 3);

        let found = monitor.found.lock().unwrap();
        let second = content.find(">P2").unwrap() as u64;
        let third = content.find(">P3").unwrap() as u64;
        assert_eq!(found[0], ("sp|P1|A_HUMAN".to_string(), 0, second));
        assert_eq!(found[1], ("P2".to_string(), second, third));
        assert_eq!(found[2], ("P3".to_string(), third, content.len() as u64));
    }

    #[test]
    fn test_last_record_without_trailing_newline() {
        let content = ">a\nAC\n>b\nGT";
        let (stats, monitor) = parse_with_monitor(content, ParserOptions::default());
        assert_eq!(stats.unwrap().kept, 2);
        assert_eq!(monitor.found.lock().unwrap()[1].2, content.len() as u64);
    }

    #[test]
    fn test_empty_sequence_skipped() {
        let content = ">empty nothing here\n\n>full\nACGT\n";
        let (stats, monitor) = parse_with_monitor(content, ParserOptions::default());
        let stats = stats.unwrap();
        assert_eq!((stats.total, stats.kept, stats.discarded), (2, 1, 1));
        assert_eq!(monitor.found.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_sequence_fails_when_configured() {
        let options = ParserOptions {
            empty_sequence: EmptySequencePolicy::Fail,
            ..ParserOptions::default()
        };
        let (stats, _) = parse_with_monitor(">full\nACGT\n>empty\n", options);
        assert!(matches!(
            stats,
            Err(ParseError::EmptySequence { record: 2, .. })
        ));
    }

    #[test]
    fn test_header_without_identifier() {
        let (stats, _) = parse_with_monitor("> \nACGT\n", ParserOptions::default());
        assert!(matches!(stats, Err(ParseError::MissingIdentifier { .. })));
    }
}
