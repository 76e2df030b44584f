pub mod analyzer;
pub mod backup;
pub mod native;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use preserve_common::{
    Inventory, MalformedPolicy, MalformedRecordError, PreserveError, Record, ReportFormat,
};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

pub use analyzer::AnalyzerReader;
pub use backup::BackupReader;
pub use native::{CsvRecordWriter, NativeReader, NATIVE_HEADER};

/// Accepted non-RFC 3339 timestamp layouts, interpreted as UTC
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M",
];

/// Parse a report timestamp. Offsets are honored; naive times are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse a byte count, tolerating thousands separators
pub fn parse_size(raw: &str) -> Option<u64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

pub(crate) fn malformed(input: &str, line: u64, content: impl Into<String>, reason: impl Into<String>) -> MalformedRecordError {
    MalformedRecordError {
        input: input.to_string(),
        line,
        content: content.into(),
        reason: reason.into(),
    }
}

/// A report parser for one of the supported layouts.
///
/// Yields records lazily in input order. The sequence is finite and cannot
/// be restarted. Header validation happens in [`RecordReader::new`].
pub enum RecordReader<R: Read> {
    Native(NativeReader<R>),
    Analyzer(AnalyzerReader<R>),
    Backup(BackupReader<R>),
}

impl<R: Read> RecordReader<R> {
    pub fn new(format: ReportFormat, input: &str, source: R) -> Result<Self, MalformedRecordError> {
        Ok(match format {
            ReportFormat::Native => RecordReader::Native(NativeReader::new(input, source)?),
            ReportFormat::Analyzer => RecordReader::Analyzer(AnalyzerReader::new(input, source)?),
            ReportFormat::Backup => RecordReader::Backup(BackupReader::new(input, source)?),
        })
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record, MalformedRecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RecordReader::Native(reader) => reader.next(),
            RecordReader::Analyzer(reader) => reader.next(),
            RecordReader::Backup(reader) => reader.next(),
        }
    }
}

/// How report rows are turned into an inventory
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub policy: MalformedPolicy,
    /// Root to strip from every parsed path
    pub strip_prefix: Option<String>,
}

/// A parsed inventory plus the rows that were skipped on the way
#[derive(Debug, Clone)]
pub struct LoadedInventory {
    pub inventory: Inventory,
    pub skipped: Vec<MalformedRecordError>,
}

/// Parse a whole report from any reader
pub fn read_inventory<R: Read>(
    source: R,
    input: &str,
    format: ReportFormat,
    options: &ParseOptions,
) -> Result<LoadedInventory, PreserveError> {
    let reader = RecordReader::new(format, input, source)?;
    let mut records = Vec::new();
    let mut skipped = Vec::new();

    for item in reader {
        match item {
            Ok(record) => {
                let record = match &options.strip_prefix {
                    Some(prefix) => record.strip_prefix(prefix),
                    None => record,
                };
                records.push(record);
            }
            Err(err) => match options.policy {
                MalformedPolicy::Abort => return Err(err.into()),
                MalformedPolicy::Skip => {
                    warn!("Skipping malformed row: {}", err);
                    skipped.push(err);
                }
            },
        }
    }

    info!(
        "Loaded {} records from {} ({} format, {} skipped)",
        records.len(),
        input,
        format,
        skipped.len()
    );

    Ok(LoadedInventory {
        inventory: Inventory::new(format, input, records),
        skipped,
    })
}

/// Parse a report file
pub fn load_inventory(
    path: &Path,
    format: ReportFormat,
    options: &ParseOptions,
) -> Result<LoadedInventory, PreserveError> {
    let file = File::open(path)?;
    let input = path.display().to_string();
    read_inventory(BufReader::new(file), &input, format, options)
}
