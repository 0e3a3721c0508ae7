//! Line reader with absolute byte accounting
//!
//! Every parser goes through [`OffsetReader`] so that all components agree on
//! where a line starts and where the next one begins. The terminator width
//! (1 for `\n`, 2 for `\r\n`) is taken from the first terminator in the file
//! and assumed for the whole file; mixed line endings are not supported.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// One line of input and its position in the file
#[derive(Debug, Clone, Copy)]
pub struct Line<'a> {
    /// Line content without its terminator
    pub text: &'a str,
    /// Absolute offset of the first byte of the line
    pub start: u64,
    /// Absolute offset of the first byte of the following line
    pub next: u64,
}

/// Buffered line iterator that tracks absolute byte offsets
pub struct OffsetReader {
    path: PathBuf,
    inner: BufReader<File>,
    buf: Vec<u8>,
    cursor: u64,
    size: u64,
    terminator_width: u8,
    lines_read: u64,
}

impl OffsetReader {
    /// Open `path` and determine its line terminator width
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let terminator_width = detect_terminator_width(File::open(path)?)?;
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: BufReader::with_capacity(READ_BUFFER_SIZE, file),
            buf: Vec::with_capacity(256),
            cursor: 0,
            size,
            terminator_width,
            lines_read: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the file in bytes at open time
    pub fn size(&self) -> u64 {
        self.size
    }

    /// 1 for LF files, 2 for CRLF files
    pub fn terminator_width(&self) -> u8 {
        self.terminator_width
    }

    /// Offset of the next unread byte
    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Read the next line, or `None` at end of file
    ///
    /// The cursor advances by the line length plus the terminator width; a
    /// final line without terminator advances by its length only.
    pub fn next_line(&mut self) -> io::Result<Option<Line<'_>>> {
        self.buf.clear();
        let consumed = self.inner.read_until(b'\n', &mut self.buf)?;
        if consumed == 0 {
            return Ok(None);
        }

        let start = self.cursor;
        let mut end = consumed;
        if self.buf[end - 1] == b'\n' {
            end -= 1;
            if self.terminator_width == 2 && end > 0 && self.buf[end - 1] == b'\r' {
                end -= 1;
            }
        }
        self.cursor += consumed as u64;
        self.lines_read += 1;

        let text = std::str::from_utf8(&self.buf[..end]).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line {} is not valid UTF-8: {}", self.lines_read, e),
            )
        })?;

        Ok(Some(Line {
            text,
            start,
            next: self.cursor,
        }))
    }
}

/// Inspect the first terminator of a stream: `\r\n` gives 2, anything else 1
fn detect_terminator_width<R: Read>(mut source: R) -> io::Result<u8> {
    let mut chunk = [0u8; 8192];
    let mut previous = 0u8;
    loop {
        let n = source.read(&mut chunk)?;
        if n == 0 {
            return Ok(1);
        }
        if let Some(pos) = chunk[..n].iter().position(|&b| b == b'\n') {
            let before = if pos == 0 { previous } else { chunk[pos - 1] };
            return Ok(if before == b'\r' { 2 } else { 1 });
        }
        previous = chunk[n - 1];
    }
}
