use crate::adapters::NativeReader;
use preserve_common::{CheckpointCorruptError, PreserveError, Record};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Identifies the build a checkpoint belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub version: u32,
    /// Label of the walked root
    pub root: String,
    /// Inventory file being written
    pub output: String,
    /// Digest algorithm, or `None` when checksums are off
    pub algorithm: Option<String>,
}

impl CheckpointHeader {
    pub fn new(root: impl Into<String>, output: &Path, algorithm: Option<String>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            root: root.into(),
            output: output.display().to_string(),
            algorithm,
        }
    }
}

/// One durably written record: its path and the output length after it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub path: String,
    pub offset: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum LogLine {
    Header(CheckpointHeader),
    Entry(CheckpointEntry),
}

/// Progress log of an interrupted inventory build.
///
/// Stored as JSON lines: a header line, then one entry per record in the
/// order it reached the output. A trailing line without a newline is the
/// remains of an interrupted append and is ignored.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
    header: CheckpointHeader,
    entries: Vec<CheckpointEntry>,
}

impl Checkpoint {
    /// `<output>.checkpoint`
    pub fn default_path(output: &Path) -> PathBuf {
        let mut name = output.as_os_str().to_os_string();
        name.push(".checkpoint");
        PathBuf::from(name)
    }

    /// Load a checkpoint from disk
    pub fn load(path: &Path) -> Result<Self, PreserveError> {
        let data = fs::read(path)?;
        let corrupt = |reason: String| CheckpointCorruptError {
            checkpoint: path.to_path_buf(),
            reason,
        };

        let complete = match data.iter().rposition(|b| *b == b'\n') {
            Some(end) => &data[..=end],
            None => &data[..0],
        };
        if complete.len() < data.len() {
            debug!(
                "Ignoring {} bytes of partial checkpoint line in {}",
                data.len() - complete.len(),
                path.display()
            );
        }

        let text = std::str::from_utf8(complete).map_err(|e| corrupt(format!("not UTF-8: {}", e)))?;
        let mut lines = text.lines().enumerate().filter(|(_, line)| !line.trim().is_empty());

        let header = match lines.next() {
            Some((_, line)) => match serde_json::from_str::<LogLine>(line) {
                Ok(LogLine::Header(header)) => header,
                Ok(LogLine::Entry(_)) => return Err(corrupt("first line is not a header".to_string()).into()),
                Err(e) => return Err(corrupt(format!("line 1: {}", e)).into()),
            },
            None => return Err(corrupt("empty checkpoint".to_string()).into()),
        };

        let mut entries: Vec<CheckpointEntry> = Vec::new();
        for (index, line) in lines {
            let entry = match serde_json::from_str::<LogLine>(line) {
                Ok(LogLine::Entry(entry)) => entry,
                Ok(LogLine::Header(_)) => {
                    return Err(corrupt(format!("line {}: repeated header", index + 1)).into())
                }
                Err(e) => return Err(corrupt(format!("line {}: {}", index + 1, e)).into()),
            };
            if let Some(previous) = entries.last() {
                if entry.offset <= previous.offset {
                    return Err(corrupt(format!(
                        "line {}: offset {} does not advance past {}",
                        index + 1,
                        entry.offset,
                        previous.offset
                    ))
                    .into());
                }
            }
            entries.push(entry);
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &CheckpointHeader {
        &self.header
    }

    pub fn entries(&self) -> &[CheckpointEntry] {
        &self.entries
    }

    /// Output length covered by the log; 0 when nothing was written yet
    pub fn last_offset(&self) -> u64 {
        self.entries.last().map(|e| e.offset).unwrap_or(0)
    }

    pub fn processed(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| e.path.as_str()).collect()
    }

    fn corrupt(&self, reason: impl Into<String>) -> PreserveError {
        CheckpointCorruptError {
            checkpoint: self.path.clone(),
            reason: reason.into(),
        }
        .into()
    }

    /// Check this log against the build about to resume and against the
    /// output file. Returns the records already durably written.
    pub fn validate(&self, expected: &CheckpointHeader, output: &Path) -> Result<Vec<Record>, PreserveError> {
        if self.header.version != expected.version {
            return Err(self.corrupt(format!(
                "version {} is not supported (expected {})",
                self.header.version, expected.version
            )));
        }
        if self.header.root != expected.root {
            return Err(self.corrupt(format!(
                "recorded root '{}' differs from '{}'",
                self.header.root, expected.root
            )));
        }
        if self.header.output != expected.output {
            return Err(self.corrupt(format!(
                "recorded output '{}' differs from '{}'",
                self.header.output, expected.output
            )));
        }
        if self.header.algorithm != expected.algorithm {
            return Err(self.corrupt(format!(
                "recorded algorithm {:?} differs from {:?}",
                self.header.algorithm, expected.algorithm
            )));
        }

        if self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let offset = self.last_offset();
        let data = fs::read(output)
            .map_err(|e| self.corrupt(format!("output {} unreadable: {}", output.display(), e)))?;
        if (data.len() as u64) < offset {
            return Err(self.corrupt(format!(
                "output is {} bytes but {} were checkpointed",
                data.len(),
                offset
            )));
        }

        let label = output.display().to_string();
        let reader = NativeReader::new(&label, &data[..offset as usize])
            .map_err(|e| self.corrupt(format!("output header unreadable: {}", e)))?;
        let records = reader
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.corrupt(format!("output unreadable before offset {}: {}", offset, e)))?;

        let expected_paths = self.processed();
        let mut written_paths = HashSet::with_capacity(records.len());
        for record in &records {
            if !written_paths.insert(record.path.as_str()) {
                return Err(self.corrupt(format!("output repeats '{}'", record.path)));
            }
        }
        if written_paths != expected_paths || records.len() != self.entries.len() {
            return Err(self.corrupt(format!(
                "output holds {} records, checkpoint lists {}",
                records.len(),
                self.entries.len()
            )));
        }

        info!(
            "Checkpoint {} covers {} records ({} bytes)",
            self.path.display(),
            records.len(),
            offset
        );
        Ok(records)
    }
}

/// Append handle for a checkpoint log
pub struct CheckpointLog {
    path: PathBuf,
    file: File,
}

impl CheckpointLog {
    /// Start a new log, replacing any previous file
    pub fn create(path: &Path, header: &CheckpointHeader) -> Result<Self, PreserveError> {
        Self::write_fresh(path, header, &[])
    }

    /// Rewrite a loaded log so appends start on a clean line
    pub fn reopen(checkpoint: &Checkpoint) -> Result<Self, PreserveError> {
        Self::write_fresh(&checkpoint.path, &checkpoint.header, &checkpoint.entries)
    }

    fn write_fresh(
        path: &Path,
        header: &CheckpointHeader,
        entries: &[CheckpointEntry],
    ) -> Result<Self, PreserveError> {
        let staging = Self::staging_path(path);
        let mut buffer = Vec::new();
        write_line(&mut buffer, &LogLine::Header(header.clone()))?;
        for entry in entries {
            write_line(&mut buffer, &LogLine::Entry(entry.clone()))?;
        }

        {
            let mut file = File::create(&staging)?;
            file.write_all(&buffer)?;
            file.sync_all()?;
        }
        fs::rename(&staging, path)?;

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn staging_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    pub fn append(&mut self, path: &str, offset: u64) -> Result<(), PreserveError> {
        let mut buffer = Vec::new();
        write_line(
            &mut buffer,
            &LogLine::Entry(CheckpointEntry {
                path: path.to_string(),
                offset,
            }),
        )?;
        self.file.write_all(&buffer)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Delete the log once the build has finished
    pub fn remove(self) -> Result<(), PreserveError> {
        drop(self.file);
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        debug!("Removed checkpoint {}", self.path.display());
        Ok(())
    }
}

fn write_line(buffer: &mut Vec<u8>, line: &LogLine) -> Result<(), PreserveError> {
    serde_json::to_writer(&mut *buffer, line)
        .map_err(|e| PreserveError::Serialization(format!("Failed to serialize checkpoint: {}", e)))?;
    buffer.push(b'\n');
    Ok(())
}
