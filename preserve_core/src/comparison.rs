use preserve_common::{
    AttributedValue, ComparisonReport, FieldMismatch, Inventory, MatchKeys, Mismatch, PartialPresence,
    PreserveError, Record,
};
use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Cross-inventory comparison engine
#[derive(Debug, Clone, Default)]
pub struct ComparisonEngine {
    match_keys: MatchKeys,
}

impl ComparisonEngine {
    pub fn new(match_keys: MatchKeys) -> Self {
        Self { match_keys }
    }

    pub fn match_keys(&self) -> &MatchKeys {
        &self.match_keys
    }

    /// Compare two or more inventories by path
    pub fn compare<I: Borrow<Inventory>>(&self, inventories: &[I]) -> Result<ComparisonReport, PreserveError> {
        self.compare_with_cancel(inventories, None)
    }

    pub fn compare_with_cancel<I: Borrow<Inventory>>(
        &self,
        inventories: &[I],
        cancel: Option<&AtomicBool>,
    ) -> Result<ComparisonReport, PreserveError> {
        if inventories.len() < 2 {
            return Err(PreserveError::Config(format!(
                "comparison needs at least two inventories, got {}",
                inventories.len()
            )));
        }

        info!(
            "Comparing {} inventories on {}",
            inventories.len(),
            self.match_keys
        );

        let indexes = inventories
            .iter()
            .map(|inventory| inventory.borrow().index())
            .collect::<Result<Vec<_>, _>>()?;
        let labels = input_labels(inventories.iter().map(|i| i.borrow().origin()));

        let all_paths: BTreeSet<&str> = indexes.iter().flat_map(|index| index.keys().copied()).collect();

        let mut report = ComparisonReport {
            inputs: labels.clone(),
            match_keys: self.match_keys.clone(),
            identical: Vec::new(),
            partial: Vec::new(),
            mismatched: Vec::new(),
        };

        for path in all_paths {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(PreserveError::Comparison("Comparison cancelled".to_string()));
            }

            let found: Vec<Option<&Record>> = indexes.iter().map(|index| index.get(path).copied()).collect();

            if found.iter().any(Option::is_none) {
                let (present, missing): (Vec<_>, Vec<_>) =
                    labels.iter().zip(&found).partition(|(_, record)| record.is_some());
                report.partial.push(PartialPresence {
                    path: path.to_string(),
                    present_in: present.into_iter().map(|(label, _)| label.clone()).collect(),
                    missing_from: missing.into_iter().map(|(label, _)| label.clone()).collect(),
                });
                continue;
            }

            let records: Vec<&Record> = found.into_iter().flatten().collect();
            let fields = self.disagreements(&labels, &records);
            if fields.is_empty() {
                report.identical.push(path.to_string());
            } else {
                report.mismatched.push(Mismatch {
                    path: path.to_string(),
                    fields,
                });
            }
        }

        let summary = report.summary();
        debug!(
            "{} identical, {} partial, {} mismatched",
            summary.identical, summary.partial, summary.mismatched
        );
        Ok(report)
    }

    /// Match keys on which the records disagree. A key missing from any
    /// record is not compared.
    fn disagreements(&self, labels: &[String], records: &[&Record]) -> Vec<FieldMismatch> {
        let mut fields = Vec::new();
        for key in self.match_keys.iter() {
            let values: Option<Vec<_>> = records.iter().map(|record| record.value(key)).collect();
            let Some(values) = values else {
                continue;
            };
            if values.windows(2).all(|pair| pair[0] == pair[1]) {
                continue;
            }
            fields.push(FieldMismatch {
                key,
                values: labels
                    .iter()
                    .zip(values)
                    .map(|(label, value)| AttributedValue {
                        input: label.clone(),
                        value,
                    })
                    .collect(),
            });
        }
        fields
    }
}

/// Origins, with the 1-based input position appended to any that repeat
fn input_labels<'a>(origins: impl Iterator<Item = &'a str> + Clone) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for origin in origins.clone() {
        *counts.entry(origin).or_default() += 1;
    }
    origins
        .enumerate()
        .map(|(i, origin)| match counts.get(origin) {
            Some(&n) if n > 1 => format!("{} [#{}]", origin, i + 1),
            _ => origin.to_string(),
        })
        .collect()
}
