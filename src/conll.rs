// reader of dependency-parsed corpora: one token per line, 10 tab-separated columns,
// sentences separated by blank lines, '#' comments, windows line endings tolerated.

use crate::errors::Result;

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// Number of tab-separated fields of a well-formed token line.
pub const CONLL_COLUMNS: usize = 10;

/// Token lines of one sentence, split into fields, in corpus order.
pub type SentenceMatrix = Vec<Vec<String>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SentenceInfo {
    /// false when some token line had a wrong number of columns or was not utf-8
    pub valid: bool,
    /// byte offset of the blank line preceding the sentence, `None` for the first one of a file
    pub separator: Option<u64>,
}

pub struct ConllReader<R> {
    reader: R,
    position: u64,
    last_separator: Option<u64>,
    line: Vec<u8>,
}

impl ConllReader<BufReader<File>> {

    /// Opens `path` and positions the reader at the first sentence whose separating blank line
    /// starts at or after `offset`. Offset 0 starts at the top of the file.
    pub fn open<P: AsRef<Path>>(path: P, offset: u64) -> Result<Self> {

        let mut file = BufReader::new(File::open(path)?);
        if offset == 0 {
            return Ok(ConllReader::new(file));
        }

        // step back one byte, so a seek landing exactly on a line start keeps that line
        file.seek(SeekFrom::Start(offset - 1))?;
        let mut reader = ConllReader {
            reader: file,
            position: offset - 1,
            last_separator: None,
            line: Vec::with_capacity(1024),
        };
        reader.skip_partial_line()?;
        reader.skip_to_separator()?;
        Ok(reader)
    }
}

impl<R: BufRead> ConllReader<R> {

    pub fn new(reader: R) -> Self {
        Self {
            reader,
            position: 0,
            last_separator: None,
            line: Vec::with_capacity(1024),
        }
    }

    /// Byte offset of the next unread line.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next line into `self.line` without its terminator, returns the byte offset
    /// the line starts at, or `None` at end of file.
    fn next_line(&mut self) -> Result<Option<u64>> {
        self.line.clear();
        let start = self.position;
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        if n == 0 {
            return Ok(None);
        }
        self.position += n as u64;
        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        Ok(Some(start))
    }

    fn skip_partial_line(&mut self) -> Result<()> {
        self.next_line()?;
        Ok(())
    }

    fn skip_to_separator(&mut self) -> Result<()> {
        while let Some(start) = self.next_line()? {
            if self.line.is_empty() {
                self.last_separator = Some(start);
                break;
            }
        }
        Ok(())
    }

    /// Reads the next sentence into `result`. Returns `None` at end of file when no
    /// sentence line is left; a last sentence without a trailing blank line is still returned.
    pub fn read_sentence(&mut self, result: &mut SentenceMatrix) -> Result<Option<SentenceInfo>> {

        result.clear();
        let mut info: Option<SentenceInfo> = None;

        loop {

            let start = match self.next_line()? {
                Some(start) => start,
                None => return Ok(info),
            };

            if self.line.is_empty() {
                self.last_separator = Some(start);
                match info {
                    Some(_) => return Ok(info),
                    None => continue,
                }
            }

            let sentence = info.get_or_insert(SentenceInfo { valid: true, separator: self.last_separator });

            // conll comment
            if self.line[0] == b'#' {
                continue;
            }

            // 0x09 never occurs inside a multi-byte utf-8 sequence, so splitting bytes is safe
            let line = match std::str::from_utf8(&self.line) {
                Ok(line) => line,
                Err(_) => {
                    sentence.valid = false;
                    continue;
                }
            };
            let fields: Vec<String> = line.split('\t').map(|x| x.to_string()).collect();
            if fields.len() != CONLL_COLUMNS {
                sentence.valid = false;
            }
            result.push(fields);
        }
    }
}
