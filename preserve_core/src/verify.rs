use crate::comparison::ComparisonEngine;
use crate::inventory::{BuildOptions, InventoryBuilder};
use crate::vfs::LocalVfs;
use preserve_common::{ComparisonReport, Inventory, MatchKeys, PreserveError, RecordError, Vfs};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One side of a verification
pub enum VerifySide<'a> {
    /// A loaded report
    Inventory(Inventory),
    /// A local directory, hashed now
    Directory(PathBuf),
    /// A tree behind any [`Vfs`], hashed now
    Tree { vfs: &'a dyn Vfs, root: PathBuf },
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub report: ComparisonReport,
    /// Files that could not be read while hashing a live side
    pub errors: Vec<RecordError>,
    /// Paths on both sides where at least one side has no checksum
    pub unverified: Vec<String>,
}

impl VerifyOutcome {
    pub fn is_clean(&self) -> bool {
        self.report.is_clean() && self.errors.is_empty() && self.unverified.is_empty()
    }
}

/// Checksum-only comparison of two filesets
pub struct Verifier {
    options: BuildOptions,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(BuildOptions::default())
    }
}

impl Verifier {
    /// `options` controls how live sides are walked; checksums are always on
    pub fn new(options: BuildOptions) -> Self {
        Self {
            options: BuildOptions {
                compute_checksums: true,
                checkpoint_path: None,
                resume_from: None,
                ..options
            },
        }
    }

    pub fn verify(&self, a: &Inventory, b: &Inventory) -> Result<VerifyOutcome, PreserveError> {
        let engine = ComparisonEngine::new(MatchKeys::checksum_only());
        let report = engine.compare(&[a, b])?;
        let unverified = unverified_paths(a, b)?;
        if !unverified.is_empty() {
            warn!("{} files lack a checksum on at least one side", unverified.len());
        }
        Ok(VerifyOutcome {
            report,
            errors: Vec::new(),
            unverified,
        })
    }

    pub fn verify_at_runtime(&self, a: VerifySide<'_>, b: VerifySide<'_>) -> Result<VerifyOutcome, PreserveError> {
        let mut errors = Vec::new();
        let a = self.resolve(a, &mut errors)?;
        let b = self.resolve(b, &mut errors)?;

        let mut outcome = self.verify(&a, &b)?;
        outcome.errors = errors;
        Ok(outcome)
    }

    fn resolve(&self, side: VerifySide<'_>, errors: &mut Vec<RecordError>) -> Result<Inventory, PreserveError> {
        match side {
            VerifySide::Inventory(inventory) => Ok(inventory),
            VerifySide::Directory(path) => {
                let vfs = LocalVfs::new(path);
                self.build(&vfs, Path::new(""), errors)
            }
            VerifySide::Tree { vfs, root } => self.build(vfs, &root, errors),
        }
    }

    fn build(&self, vfs: &dyn Vfs, root: &Path, errors: &mut Vec<RecordError>) -> Result<Inventory, PreserveError> {
        info!("Hashing {} with {}", vfs.instance_id(), self.options.checksum_algorithm);
        let outcome = InventoryBuilder::new(self.options.clone()).build(vfs, root)?;
        errors.extend(outcome.errors);
        Ok(outcome.inventory)
    }
}

fn unverified_paths(a: &Inventory, b: &Inventory) -> Result<Vec<String>, PreserveError> {
    let other = b.index()?;
    let mut paths: Vec<String> = a
        .iter()
        .filter_map(|record| {
            let counterpart = other.get(record.path.as_str())?;
            (record.checksum.is_none() || counterpart.checksum.is_none()).then(|| record.path.clone())
        })
        .collect();
    paths.sort();
    Ok(paths)
}
