use super::{malformed, parse_size, parse_timestamp};
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use preserve_common::{MalformedRecordError, Record};
use std::io::Read;

const PATH_COLUMNS: &[&str] = &["key", "path", "file", "full path", "full name"];
const PARENT_COLUMNS: &[&str] = &["parent dir", "parent directory", "folder"];
const NAME_COLUMNS: &[&str] = &["name", "file name", "filename"];
const SIZE_COLUMNS: &[&str] = &["size", "bytes", "size (bytes)", "file size"];
const MODIFIED_COLUMNS: &[&str] = &["modified date", "last modified", "modified", "date modified"];
const CHECKSUM_COLUMNS: &[&str] = &["checksum", "md5", "sha1", "sha-1", "sha256", "sha-256", "digest", "hash"];
const TYPE_COLUMNS: &[&str] = &["type", "item type"];
const DIRECTORY_TYPES: &[&str] = &["directory", "dir", "folder"];

#[derive(Debug, Clone, Copy)]
enum PathSource {
    Full(usize),
    Split { parent: usize, name: usize },
}

/// Reader for tab-separated storage analyzer exports.
///
/// Column names vary between tool versions, so each field is located by
/// a list of case-insensitive aliases. Directory rows are dropped.
pub struct AnalyzerReader<R: Read> {
    input: String,
    path: PathSource,
    size: usize,
    modified: Option<usize>,
    checksum: Option<usize>,
    kind: Option<usize>,
    rows: StringRecordsIntoIter<R>,
    done: bool,
}

fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| headers.iter().position(|h| h == alias))
}

impl<R: Read> AnalyzerReader<R> {
    pub fn new(input: &str, source: R) -> Result<Self, MalformedRecordError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .has_headers(true)
            .flexible(true)
            .from_reader(source);

        let raw = reader
            .headers()
            .map_err(|e| malformed(input, 1, "", format!("unreadable header: {}", e)))?
            .clone();
        let headers: Vec<String> = raw
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
            .collect();
        let header_line = raw.iter().collect::<Vec<_>>().join("\t");

        let path = match find_column(&headers, PATH_COLUMNS) {
            Some(index) => PathSource::Full(index),
            None => match (
                find_column(&headers, PARENT_COLUMNS),
                find_column(&headers, NAME_COLUMNS),
            ) {
                (Some(parent), Some(name)) => PathSource::Split { parent, name },
                _ => {
                    return Err(malformed(input, 1, header_line, "no path column"));
                }
            },
        };

        let size = find_column(&headers, SIZE_COLUMNS)
            .ok_or_else(|| malformed(input, 1, header_line.clone(), "no size column"))?;

        Ok(Self {
            input: input.to_string(),
            path,
            size,
            modified: find_column(&headers, MODIFIED_COLUMNS),
            checksum: find_column(&headers, CHECKSUM_COLUMNS),
            kind: find_column(&headers, TYPE_COLUMNS),
            rows: reader.into_records(),
            done: false,
        })
    }

    fn is_directory(&self, row: &StringRecord) -> bool {
        self.kind
            .and_then(|i| row.get(i))
            .map(|kind| DIRECTORY_TYPES.contains(&kind.trim().to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    fn parse_row(&self, row: &StringRecord) -> Result<Record, MalformedRecordError> {
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        let content = row.iter().collect::<Vec<_>>().join("\t");
        let fail = |reason: String| malformed(&self.input, line, content.clone(), reason);

        let path = match self.path {
            PathSource::Full(index) => row.get(index).unwrap_or_default().trim().to_string(),
            PathSource::Split { parent, name } => {
                let parent = row.get(parent).unwrap_or_default().trim();
                let name = row.get(name).unwrap_or_default().trim();
                if name.is_empty() {
                    String::new()
                } else if parent.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{}", parent.trim_end_matches(['/', '\\']), name)
                }
            }
        };
        if path.is_empty() {
            return Err(fail("empty path".to_string()));
        }

        let raw_size = row
            .get(self.size)
            .ok_or_else(|| fail("missing size field".to_string()))?;
        let size = parse_size(raw_size).ok_or_else(|| fail(format!("invalid size '{}'", raw_size)))?;

        let modified_time = match self.modified.and_then(|i| row.get(i)) {
            Some(raw) if !raw.trim().is_empty() => Some(
                parse_timestamp(raw).ok_or_else(|| fail(format!("invalid modified date '{}'", raw)))?,
            ),
            _ => None,
        };

        let checksum = self.checksum.and_then(|i| row.get(i)).map(str::to_string);

        Ok(Record::new(&path, size)
            .with_modified_time(modified_time)
            .with_checksum(checksum))
    }
}

impl<R: Read> Iterator for AnalyzerReader<R> {
    type Item = Result<Record, MalformedRecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let row = match self.rows.next()? {
                Ok(row) => row,
                Err(err) => {
                    let line = err.position().map(|p| p.line()).unwrap_or(0);
                    if matches!(err.kind(), csv::ErrorKind::Io(_)) {
                        self.done = true;
                    }
                    return Some(Err(malformed(&self.input, line, "", err.to_string())));
                }
            };
            if row.iter().all(|field| field.trim().is_empty()) || self.is_directory(&row) {
                continue;
            }
            return Some(self.parse_row(&row));
        }
        None
    }
}
