use preserve_common::Record;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtensionTotals {
    pub files: u64,
    pub bytes: u64,
}

impl AddAssign<&Record> for ExtensionTotals {
    fn add_assign(&mut self, record: &Record) {
        self.files += 1;
        self.bytes += record.size;
    }
}

/// File and byte totals, grouped by lowercase extension.
///
/// Files without an extension are grouped under the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ByteCount {
    pub by_extension: BTreeMap<String, ExtensionTotals>,
    pub total: ExtensionTotals,
}

impl ByteCount {
    /// Total size rendered for humans
    pub fn human_bytes(&self) -> String {
        human_bytes(self.total.bytes)
    }
}

pub fn summarize<'a, I>(records: I) -> ByteCount
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut count = ByteCount::default();
    for record in records {
        *count
            .by_extension
            .entry(record.extension.to_lowercase())
            .or_default() += record;
        count.total += record;
    }
    count
}

/// Render a byte count in the largest binary unit that keeps it >= 1
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.2} {}", value, unit)
}
