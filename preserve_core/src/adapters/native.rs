use super::{malformed, parse_size, parse_timestamp};
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim, WriterBuilder};
use preserve_common::{format_timestamp, MalformedRecordError, PreserveError, Record};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Column order written by [`CsvRecordWriter`]
pub const NATIVE_HEADER: [&str; 5] = ["path", "size", "modified_time", "checksum", "extension"];

#[derive(Debug, Clone, Copy)]
struct Columns {
    path: usize,
    size: usize,
    modified_time: Option<usize>,
    checksum: Option<usize>,
}

/// Reader for this tool's own CSV inventories
pub struct NativeReader<R: Read> {
    input: String,
    columns: Columns,
    width: usize,
    rows: StringRecordsIntoIter<R>,
    done: bool,
}

impl<R: Read> NativeReader<R> {
    pub fn new(input: &str, source: R) -> Result<Self, MalformedRecordError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(Trim::None)
            .from_reader(source);

        let headers = reader
            .headers()
            .map_err(|e| malformed(input, 1, "", format!("unreadable header: {}", e)))?
            .clone();

        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().trim_start_matches('\u{feff}').to_ascii_lowercase(), i))
            .collect();

        let required = |name: &str| {
            index.get(name).copied().ok_or_else(|| {
                malformed(
                    input,
                    1,
                    join_fields(&headers),
                    format!("missing required column '{}'", name),
                )
            })
        };

        let columns = Columns {
            path: required("path")?,
            size: required("size")?,
            modified_time: index.get("modified_time").copied(),
            checksum: index.get("checksum").copied(),
        };

        Ok(Self {
            input: input.to_string(),
            columns,
            width: headers.len(),
            rows: reader.into_records(),
            done: false,
        })
    }

    fn parse_row(&self, row: &StringRecord) -> Result<Record, MalformedRecordError> {
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        let fail = |reason: String| malformed(&self.input, line, join_fields(row), reason);

        if row.len() != self.width {
            return Err(fail(format!(
                "expected {} fields, found {}",
                self.width,
                row.len()
            )));
        }

        let path = row.get(self.columns.path).unwrap_or_default();
        if path.is_empty() {
            return Err(fail("empty path".to_string()));
        }

        let raw_size = row.get(self.columns.size).unwrap_or_default();
        let size = parse_size(raw_size).ok_or_else(|| fail(format!("invalid size '{}'", raw_size)))?;

        let modified_time = match self.columns.modified_time.and_then(|i| row.get(i)) {
            Some(raw) if !raw.trim().is_empty() => Some(
                parse_timestamp(raw).ok_or_else(|| fail(format!("invalid modified_time '{}'", raw)))?,
            ),
            _ => None,
        };

        let checksum = self
            .columns
            .checksum
            .and_then(|i| row.get(i))
            .map(str::to_string);

        Ok(Record::new(path, size)
            .with_modified_time(modified_time)
            .with_checksum(checksum))
    }
}

impl<R: Read> Iterator for NativeReader<R> {
    type Item = Result<Record, MalformedRecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rows.next()? {
            Ok(row) => Some(self.parse_row(&row)),
            Err(err) => {
                let line = err.position().map(|p| p.line()).unwrap_or(0);
                if matches!(err.kind(), csv::ErrorKind::Io(_)) {
                    self.done = true;
                }
                Some(Err(malformed(&self.input, line, "", err.to_string())))
            }
        }
    }
}

fn join_fields(row: &StringRecord) -> String {
    row.iter().collect::<Vec<_>>().join(",")
}

/// Writes records in the native CSV layout
pub struct CsvRecordWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvRecordWriter<W> {
    /// Start a fresh inventory, writing the header row
    pub fn new(inner: W) -> Result<Self, PreserveError> {
        let mut writer = Self::append_to(inner);
        writer
            .writer
            .write_record(NATIVE_HEADER)
            .map_err(|e| PreserveError::Serialization(e.to_string()))?;
        Ok(writer)
    }

    /// Continue an inventory whose header is already written
    pub fn append_to(inner: W) -> Self {
        Self {
            writer: WriterBuilder::new().has_headers(false).from_writer(inner),
        }
    }

    pub fn write(&mut self, record: &Record) -> Result<(), PreserveError> {
        let size = record.size.to_string();
        let modified = record
            .modified_time
            .as_ref()
            .map(format_timestamp)
            .unwrap_or_default();
        self.writer
            .write_record([
                record.path.as_str(),
                size.as_str(),
                modified.as_str(),
                record.checksum.as_deref().unwrap_or_default(),
                record.extension.as_str(),
            ])
            .map_err(|e| PreserveError::Serialization(e.to_string()))
    }

    pub fn flush(&mut self) -> Result<(), PreserveError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }

    pub fn into_inner(self) -> Result<W, PreserveError> {
        self.writer
            .into_inner()
            .map_err(|e| PreserveError::Io(e.into_error()))
    }
}
