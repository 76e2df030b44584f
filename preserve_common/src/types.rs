use crate::{DuplicateKeyError, PreserveError};
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

/// Represents a file or directory entry as listed by a [`crate::Vfs`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Hidden by filesystem attribute (not by name)
    pub is_hidden: bool,
}

/// Metadata for a file or directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub is_hidden: bool,
}

/// Normalized metadata for one file.
///
/// `path` is the identity key. Optional fields stay `None` when the source
/// never provided them; nothing is ever synthesized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub path: String,
    pub size: u64,
    pub modified_time: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub extension: String,
}

impl Record {
    pub fn new(path: &str, size: u64) -> Self {
        let path = normalize_path(path);
        let extension = extension_of(&path);
        Self {
            path,
            size,
            modified_time: None,
            checksum: None,
            extension,
        }
    }

    pub fn with_modified_time(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified_time = modified.map(truncate_to_seconds);
        self
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty());
        self
    }

    /// Value of a match key, if this record carries it
    pub fn value(&self, key: MatchKey) -> Option<FieldValue> {
        match key {
            MatchKey::Size => Some(FieldValue::Size(self.size)),
            MatchKey::ModifiedTime => self.modified_time.map(FieldValue::ModifiedTime),
            MatchKey::Checksum => self.checksum.clone().map(FieldValue::Checksum),
        }
    }

    /// Re-root the record below `prefix`. Paths outside the prefix are kept as-is.
    pub fn strip_prefix(mut self, prefix: &str) -> Self {
        if let Some(rest) = strip_path_prefix(&self.path, prefix) {
            self.path = rest.to_string();
        }
        self
    }
}

/// Normalize a path to forward slashes with no `.` segments or empty segments.
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.trim_end_matches(['\r', '\n']).replace('\\', "/");
    let absolute = unified.starts_with('/');
    let joined = unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Lowercase extension including the leading dot; empty for extensionless
/// names and dotfiles.
pub fn extension_of(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        None | Some(0) => String::new(),
        Some(idx) if idx + 1 == name.len() => String::new(),
        Some(idx) => name[idx..].to_lowercase(),
    }
}

/// Strip a directory prefix from a normalized path.
pub fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = normalize_path(prefix);
    if prefix.is_empty() {
        return Some(path);
    }
    if prefix == "/" {
        return path.strip_prefix('/').filter(|rest| !rest.is_empty());
    }
    path.strip_prefix(prefix.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}

pub fn truncate_to_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_nanosecond(0).unwrap_or(time)
}

pub fn timestamp_from_system_time(time: SystemTime) -> DateTime<Utc> {
    truncate_to_seconds(DateTime::<Utc>::from(time))
}

/// RFC 3339 at whole-second precision, always `Z`
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Record fields that can take part in matching. `path` is always implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKey {
    Size,
    ModifiedTime,
    Checksum,
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchKey::Size => write!(f, "size"),
            MatchKey::ModifiedTime => write!(f, "modified_time"),
            MatchKey::Checksum => write!(f, "checksum"),
        }
    }
}

impl FromStr for MatchKey {
    type Err = PreserveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "size" | "bytes" => Ok(MatchKey::Size),
            "modified_time" | "mtime" | "modified" => Ok(MatchKey::ModifiedTime),
            "checksum" | "hash" => Ok(MatchKey::Checksum),
            other => Err(PreserveError::Config(format!("unknown match key '{other}'"))),
        }
    }
}

/// Set of fields that must agree for a path to count as identical
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchKeys(BTreeSet<MatchKey>);

impl MatchKeys {
    /// Presence only: paths are compared, no other field
    pub fn path_only() -> Self {
        Self(BTreeSet::new())
    }

    pub fn checksum_only() -> Self {
        Self::from_iter([MatchKey::Checksum])
    }

    pub fn contains(&self, key: MatchKey) -> bool {
        self.0.contains(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = MatchKey> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for MatchKeys {
    fn default() -> Self {
        Self::from_iter([MatchKey::Size, MatchKey::Checksum])
    }
}

impl FromIterator<MatchKey> for MatchKeys {
    fn from_iter<I: IntoIterator<Item = MatchKey>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for MatchKeys {
    type Err = PreserveError;

    /// Comma-separated list; `path` is accepted and ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty() && !key.eq_ignore_ascii_case("path"))
            .map(MatchKey::from_str)
            .collect()
    }
}

impl fmt::Display for MatchKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = vec!["path".to_string()];
        keys.extend(self.iter().map(|key| key.to_string()));
        write!(f, "{}", keys.join(","))
    }
}

/// A single match-key value, as reported for mismatches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Size(u64),
    ModifiedTime(DateTime<Utc>),
    Checksum(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Size(size) => write!(f, "{size}"),
            FieldValue::ModifiedTime(time) => write!(f, "{}", format_timestamp(time)),
            FieldValue::Checksum(checksum) => write!(f, "{checksum}"),
        }
    }
}

/// Report layouts the format adapters understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    /// This tool's own CSV inventory
    Native,
    /// Tab-delimited File Analyzer report
    Analyzer,
    /// Backup client query output
    Backup,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Native => write!(f, "native"),
            ReportFormat::Analyzer => write!(f, "analyzer"),
            ReportFormat::Backup => write!(f, "backup"),
        }
    }
}

impl FromStr for ReportFormat {
    type Err = PreserveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "csv" => Ok(ReportFormat::Native),
            "analyzer" | "fileanalyzer" | "tsv" => Ok(ReportFormat::Analyzer),
            "backup" | "tsm" => Ok(ReportFormat::Backup),
            other => Err(PreserveError::Config(format!("unknown report format '{other}'"))),
        }
    }
}

/// One fileset snapshot. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    format: ReportFormat,
    origin: String,
    records: Vec<Record>,
}

impl Inventory {
    pub fn new(format: ReportFormat, origin: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            format,
            origin: origin.into(),
            records,
        }
    }

    pub fn format(&self) -> ReportFormat {
        self.format
    }

    /// Report path or walked root this inventory describes
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Index records by path, refusing duplicates
    pub fn index(&self) -> Result<HashMap<&str, &Record>, DuplicateKeyError> {
        let mut index = HashMap::with_capacity(self.records.len());
        for record in &self.records {
            if index.insert(record.path.as_str(), record).is_some() {
                return Err(DuplicateKeyError {
                    input: self.origin.clone(),
                    path: record.path.clone(),
                });
            }
        }
        Ok(index)
    }
}

impl<'a> IntoIterator for &'a Inventory {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// A path present in only some of the compared inventories
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialPresence {
    pub path: String,
    pub present_in: Vec<String>,
    pub missing_from: Vec<String>,
}

/// The value one input holds for a disagreeing field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributedValue {
    pub input: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMismatch {
    pub key: MatchKey,
    pub values: Vec<AttributedValue>,
}

/// A path present everywhere whose match keys disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub path: String,
    pub fields: Vec<FieldMismatch>,
}

/// Categorized result of comparing two or more inventories.
///
/// All lists are sorted by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonReport {
    /// Input labels, in argument order
    pub inputs: Vec<String>,
    pub match_keys: MatchKeys,
    pub identical: Vec<String>,
    pub partial: Vec<PartialPresence>,
    pub mismatched: Vec<Mismatch>,
}

impl ComparisonReport {
    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            inputs: self.inputs.len(),
            identical: self.identical.len(),
            partial: self.partial.len(),
            mismatched: self.mismatched.len(),
        }
    }

    /// True when every path is present everywhere and agrees
    pub fn is_clean(&self) -> bool {
        self.partial.is_empty() && self.mismatched.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub inputs: usize,
    pub identical: usize,
    pub partial: usize,
    pub mismatched: usize,
}

/// Digest algorithms available to the inventory builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = PreserveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            other => Err(PreserveError::Config(format!("unsupported checksum algorithm '{other}'"))),
        }
    }
}

/// What makes an entry hidden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenRule {
    /// Name starts with a dot
    Name,
    /// Filesystem hidden attribute (Windows)
    Attribute,
    #[default]
    Either,
}

impl HiddenRule {
    pub fn is_hidden(&self, name: &str, hidden_attribute: bool) -> bool {
        let by_name = name.starts_with('.');
        match self {
            HiddenRule::Name => by_name,
            HiddenRule::Attribute => hidden_attribute,
            HiddenRule::Either => by_name || hidden_attribute,
        }
    }
}

/// How the builder treats symbolic links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymlinkPolicy {
    #[default]
    Skip,
    Follow,
}

/// What to do with a report row that cannot be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    #[default]
    Abort,
    Skip,
}

fn default_visible_only() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Fields that must agree for `compare`
    #[serde(default)]
    pub match_keys: MatchKeys,

    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Exclude hidden entries from inventories
    #[serde(default = "default_visible_only")]
    pub visible_only: bool,

    #[serde(default)]
    pub hidden_rule: HiddenRule,

    #[serde(default)]
    pub symlinks: SymlinkPolicy,

    /// Gitignore-style patterns excluded from inventories
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Hashing threads for inventory builds
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub malformed: MalformedPolicy,

    /// Enable portable mode (config alongside binary)
    #[serde(default)]
    pub portable_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            match_keys: MatchKeys::default(),
            checksum_algorithm: ChecksumAlgorithm::default(),
            visible_only: default_visible_only(),
            hidden_rule: HiddenRule::default(),
            symlinks: SymlinkPolicy::default(),
            exclude_patterns: Vec::new(),
            workers: default_workers(),
            malformed: MalformedPolicy::default(),
            portable_mode: false,
        }
    }
}
