use super::{malformed, parse_size};
use preserve_common::{MalformedRecordError, Record};
use regex::Regex;
use std::io::{BufRead, BufReader, Read};
use std::sync::LazyLock;

static ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*([\d,]+)\s+([A-Za-z]+)\s+(\d{1,2}/\d{1,2}/\d{2,4})\s+(\d{1,2}:\d{2}:\d{2})\s+(\S+)\s+([AI])\s+(.+?)\s*$",
    )
    .unwrap()
});

static SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\s-]*-[\s-]*$").unwrap());

const TRAILER_PREFIXES: &[&str] = &["ANS", "Accessing as node"];

/// Reader for fixed-layout backup query listings.
///
/// Everything up to the first dashed separator is preamble. Only active
/// (`A`) versions of files are yielded; directories, inactive versions and
/// repeated page headers are passed over. Sizes must be in plain bytes.
pub struct BackupReader<R: Read> {
    input: String,
    source: BufReader<R>,
    line: u64,
    buffer: Vec<u8>,
    done: bool,
}

impl<R: Read> BackupReader<R> {
    pub fn new(input: &str, source: R) -> Result<Self, MalformedRecordError> {
        let mut reader = Self {
            input: input.to_string(),
            source: BufReader::new(source),
            line: 0,
            buffer: Vec::new(),
            done: false,
        };

        loop {
            match reader.next_line() {
                Ok(Some(line)) if SEPARATOR.is_match(&line) => return Ok(reader),
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(malformed(
                        input,
                        reader.line,
                        "",
                        "no column separator line before end of input",
                    ))
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn next_line(&mut self) -> Result<Option<String>, MalformedRecordError> {
        self.buffer.clear();
        let read = self
            .source
            .read_until(b'\n', &mut self.buffer)
            .map_err(|e| malformed(&self.input, self.line + 1, "", e.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        self.line += 1;
        let text = String::from_utf8_lossy(&self.buffer);
        Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn parse_line(&self, line: &str) -> Option<Result<Record, MalformedRecordError>> {
        let fail = |reason: String| Some(Err(malformed(&self.input, self.line, line, reason)));

        let Some(caps) = ROW.captures(line) else {
            return fail("unrecognized listing row".to_string());
        };

        if &caps[6] == "I" {
            return None;
        }

        let path = &caps[7];
        if path.ends_with('/') || path.ends_with('\\') {
            return None;
        }

        let unit = &caps[2];
        if !unit.eq_ignore_ascii_case("B") {
            return fail(format!("unsupported size unit '{}'", unit));
        }

        let size = match parse_size(&caps[1]) {
            Some(size) => size,
            None => return fail(format!("invalid size '{}'", &caps[1])),
        };

        Some(Ok(Record::new(path, size)))
    }
}

fn is_page_header(line: &str) -> bool {
    line.contains("Backup Date") && line.contains("Size")
}

impl<R: Read> Iterator for BackupReader<R> {
    type Item = Result<Record, MalformedRecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() || is_page_header(trimmed) || SEPARATOR.is_match(trimmed) {
                continue;
            }
            if TRAILER_PREFIXES.iter().any(|prefix| trimmed.starts_with(prefix)) {
                self.done = true;
                return None;
            }
            if let Some(result) = self.parse_line(&line) {
                return Some(result);
            }
        }
        None
    }
}
