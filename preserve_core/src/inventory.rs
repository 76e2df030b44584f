use crate::adapters::CsvRecordWriter;
use crate::checkpoint::{Checkpoint, CheckpointHeader, CheckpointLog};
use crate::hasher::FileHasher;
use crossbeam::channel;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use preserve_common::{
    normalize_path, timestamp_from_system_time, AppConfig, ChecksumAlgorithm, DirListing, HiddenRule,
    Inventory, PreserveError, Record, RecordError, ReportFormat, SymlinkPolicy, Vfs,
};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Options for building an inventory from a directory tree
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub compute_checksums: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Leave hidden entries out
    pub visible_only: bool,
    pub hidden_rule: HiddenRule,
    pub symlinks: SymlinkPolicy,
    /// Gitignore-style patterns, relative to the walked root
    pub exclude_patterns: Vec<String>,
    /// Where to log progress for [`InventoryBuilder::build_into`]
    pub checkpoint_path: Option<PathBuf>,
    /// Continue an interrupted [`InventoryBuilder::build_into`]
    pub resume_from: Option<Checkpoint>,
    /// 1 hashes on the calling thread; more uses a rayon pool
    pub workers: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            compute_checksums: false,
            checksum_algorithm: ChecksumAlgorithm::default(),
            visible_only: true,
            hidden_rule: HiddenRule::default(),
            symlinks: SymlinkPolicy::default(),
            exclude_patterns: Vec::new(),
            checkpoint_path: None,
            resume_from: None,
            workers: 1,
        }
    }
}

impl BuildOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            checksum_algorithm: config.checksum_algorithm,
            visible_only: config.visible_only,
            hidden_rule: config.hidden_rule,
            symlinks: config.symlinks,
            exclude_patterns: config.exclude_patterns.clone(),
            workers: config.workers.max(1),
            ..Self::default()
        }
    }
}

/// Result of a build. `completed` is false when the build was cancelled;
/// `resumed` counts records carried over from a checkpoint.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub inventory: Inventory,
    pub errors: Vec<RecordError>,
    pub completed: bool,
    pub resumed: usize,
}

/// Destination for finished records
pub trait RecordSink {
    /// Durably append one record, returning the sink length afterwards
    fn append(&mut self, record: &Record) -> Result<u64, PreserveError>;
}

/// Native CSV inventory file, synced after every record
pub struct CsvFileSink {
    writer: CsvRecordWriter<File>,
}

impl CsvFileSink {
    pub fn create(path: &Path) -> Result<Self, PreserveError> {
        let mut writer = CsvRecordWriter::new(File::create(path)?)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(Self { writer })
    }

    /// Reopen an existing inventory, dropping everything past `offset`
    pub fn resume(path: &Path, offset: u64) -> Result<Self, PreserveError> {
        let file = OpenOptions::new().write(true).open(path)?;
        let length = file.metadata()?.len();
        if length > offset {
            debug!(
                "Discarding {} unconfirmed bytes from {}",
                length - offset,
                path.display()
            );
        }
        file.set_len(offset)?;
        file.sync_all()?;
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            writer: CsvRecordWriter::append_to(file),
        })
    }
}

impl RecordSink for CsvFileSink {
    fn append(&mut self, record: &Record) -> Result<u64, PreserveError> {
        self.writer.write(record)?;
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_data()?;
        Ok(file.metadata()?.len())
    }
}

/// Progress callback: records handled so far, records to handle in total
pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, Clone)]
struct PendingFile {
    /// Path as the VFS knows it
    path: PathBuf,
    /// Normalized path relative to the walked root
    key: String,
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Label recorded for a walked root
pub fn root_label(vfs: &dyn Vfs, root: &Path) -> String {
    let root = normalize_path(&root.to_string_lossy());
    if root.is_empty() {
        vfs.instance_id().to_string()
    } else {
        format!("{}/{}", vfs.instance_id().trim_end_matches('/'), root.trim_start_matches('/'))
    }
}

struct Collector<'a> {
    sink: Option<&'a mut dyn RecordSink>,
    log: Option<&'a mut CheckpointLog>,
    progress: Option<&'a ProgressFn>,
    records: Vec<Record>,
    errors: Vec<RecordError>,
    resumed: usize,
    handled: usize,
    total: usize,
}

impl Collector<'_> {
    fn accept(&mut self, outcome: Result<Record, RecordError>) -> Result<(), PreserveError> {
        match outcome {
            Ok(record) => {
                if let Some(sink) = self.sink.as_mut() {
                    let offset = sink.append(&record)?;
                    if let Some(log) = self.log.as_mut() {
                        log.append(&record.path, offset)?;
                    }
                }
                self.records.push(record);
            }
            Err(err) => {
                warn!("Skipping {}", err);
                self.errors.push(err);
            }
        }
        self.handled += 1;
        if let Some(progress) = self.progress {
            progress(self.resumed + self.handled, self.total);
        }
        Ok(())
    }
}

/// Walks a [`Vfs`] and produces one [`Record`] per visible file
pub struct InventoryBuilder {
    options: BuildOptions,
    hasher: Box<dyn FileHasher>,
    exclude: Option<Gitignore>,
    progress: Option<ProgressFn>,
}

impl InventoryBuilder {
    pub fn new(options: BuildOptions) -> Self {
        let exclude = Self::build_exclude(&options.exclude_patterns);
        Self {
            hasher: Box::new(options.checksum_algorithm),
            options,
            exclude,
            progress: None,
        }
    }

    /// Replace the digest function
    pub fn with_hasher(mut self, hasher: impl FileHasher + 'static) -> Self {
        self.hasher = Box::new(hasher);
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    fn build_exclude(patterns: &[String]) -> Option<Gitignore> {
        if patterns.is_empty() {
            return None;
        }

        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            if let Err(err) = builder.add_line(None, pattern) {
                warn!("Ignoring invalid exclude pattern '{}': {}", pattern, err);
            } else {
                debug!("Added exclude pattern: {}", pattern);
            }
        }

        match builder.build() {
            Ok(ignore) => Some(ignore),
            Err(e) => {
                warn!("Failed to build exclude patterns: {}", e);
                None
            }
        }
    }

    fn algorithm_label(&self) -> Option<String> {
        self.options.compute_checksums.then(|| self.hasher.algorithm())
    }

    /// Build an inventory in memory
    pub fn build(&self, vfs: &dyn Vfs, root: &Path) -> Result<BuildOutcome, PreserveError> {
        self.build_with_cancel(vfs, root, None)
    }

    pub fn build_with_cancel(
        &self,
        vfs: &dyn Vfs,
        root: &Path,
        cancel: Option<&AtomicBool>,
    ) -> Result<BuildOutcome, PreserveError> {
        self.run(vfs, root, None, None, Vec::new(), cancel)
    }

    /// Build an inventory into a native CSV file, checkpointing when
    /// `checkpoint_path` or `resume_from` is set
    pub fn build_into(&self, vfs: &dyn Vfs, root: &Path, output: &Path) -> Result<BuildOutcome, PreserveError> {
        self.build_into_with_cancel(vfs, root, output, None)
    }

    pub fn build_into_with_cancel(
        &self,
        vfs: &dyn Vfs,
        root: &Path,
        output: &Path,
        cancel: Option<&AtomicBool>,
    ) -> Result<BuildOutcome, PreserveError> {
        let header = CheckpointHeader::new(root_label(vfs, root), output, self.algorithm_label());

        let (mut sink, mut log, prior) = match &self.options.resume_from {
            Some(checkpoint) => {
                let prior = checkpoint.validate(&header, output)?;
                let sink = if prior.is_empty() {
                    CsvFileSink::create(output)?
                } else {
                    CsvFileSink::resume(output, checkpoint.last_offset())?
                };
                info!(
                    "Resuming {} with {} records already written",
                    output.display(),
                    prior.len()
                );
                (sink, Some(CheckpointLog::reopen(checkpoint)?), prior)
            }
            None => {
                let sink = CsvFileSink::create(output)?;
                let log = match &self.options.checkpoint_path {
                    Some(path) => Some(CheckpointLog::create(path, &header)?),
                    None => None,
                };
                (sink, log, Vec::new())
            }
        };

        let outcome = self.run(vfs, root, Some(&mut sink), log.as_mut(), prior, cancel)?;

        if let Some(log) = log {
            if outcome.completed {
                log.remove()?;
            } else {
                info!("Build interrupted; checkpoint kept for resume");
            }
        }
        Ok(outcome)
    }

    fn run<'a>(
        &'a self,
        vfs: &dyn Vfs,
        root: &Path,
        sink: Option<&'a mut dyn RecordSink>,
        log: Option<&'a mut CheckpointLog>,
        prior: Vec<Record>,
        cancel: Option<&AtomicBool>,
    ) -> Result<BuildOutcome, PreserveError> {
        let mut walk_errors = Vec::new();
        let files = self.collect_files(vfs, root, &mut walk_errors)?;

        let resumed = prior.len();
        let done: HashSet<&str> = prior.iter().map(|r| r.path.as_str()).collect();
        let pending: Vec<PendingFile> = files
            .into_iter()
            .filter(|file| !done.contains(file.key.as_str()))
            .collect();
        drop(done);

        info!(
            "Inventory of {}: {} files to process, {} carried over",
            root_label(vfs, root),
            pending.len(),
            resumed
        );

        let mut collector = Collector {
            sink,
            log,
            progress: self.progress.as_ref(),
            total: pending.len() + resumed,
            records: prior,
            errors: walk_errors,
            resumed,
            handled: 0,
        };

        if self.options.workers > 1 {
            self.process_parallel(vfs, &pending, &mut collector, cancel)?;
        } else {
            for file in &pending {
                if is_cancelled(cancel) {
                    break;
                }
                collector.accept(self.make_record(vfs, file))?;
            }
        }

        let completed = collector.handled == pending.len();
        if !completed {
            info!(
                "Inventory cancelled after {} of {} files",
                collector.handled,
                pending.len()
            );
        }

        info!(
            "Inventory of {}: {} records, {} errors",
            root_label(vfs, root),
            collector.records.len(),
            collector.errors.len()
        );

        Ok(BuildOutcome {
            inventory: Inventory::new(ReportFormat::Native, root_label(vfs, root), collector.records),
            errors: collector.errors,
            completed,
            resumed,
        })
    }

    fn process_parallel(
        &self,
        vfs: &dyn Vfs,
        pending: &[PendingFile],
        collector: &mut Collector<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), PreserveError> {
        let workers = self.options.workers;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| PreserveError::Config(format!("cannot start {} workers: {}", workers, e)))?;

        let (tx, rx) = channel::bounded(workers * 4);
        let stop = AtomicBool::new(false);
        let mut failure = None;

        std::thread::scope(|scope| {
            let stop = &stop;
            scope.spawn(move || {
                pool.install(|| {
                    pending.par_iter().for_each_with(tx, |tx, file| {
                        if stop.load(Ordering::Relaxed) || is_cancelled(cancel) {
                            return;
                        }
                        let _ = tx.send(self.make_record(vfs, file));
                    });
                });
            });

            for outcome in rx.iter() {
                if let Err(err) = collector.accept(outcome) {
                    failure = Some(err);
                    break;
                }
                if is_cancelled(cancel) {
                    break;
                }
            }
            stop.store(true, Ordering::Relaxed);
            drop(rx);
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn make_record(&self, vfs: &dyn Vfs, file: &PendingFile) -> Result<Record, RecordError> {
        let fail = |reason: String| RecordError {
            path: file.key.clone(),
            reason,
        };

        let meta = vfs.metadata(&file.path).map_err(|e| fail(e.to_string()))?;
        if meta.is_dir {
            return Err(fail("became a directory during the walk".to_string()));
        }

        let mut record = Record::new(&file.key, meta.size)
            .with_modified_time(meta.modified.map(timestamp_from_system_time));

        if self.options.compute_checksums {
            let mut reader = vfs.open_file(&file.path).map_err(|e| fail(e.to_string()))?;
            let digest = self
                .hasher
                .digest(&mut reader)
                .map_err(|e| fail(format!("read failed: {}", e)))?;
            record = record.with_checksum(Some(digest));
        }

        debug!("Recorded {} ({} bytes)", record.path, record.size);
        Ok(record)
    }

    fn collect_files(
        &self,
        vfs: &dyn Vfs,
        root: &Path,
        errors: &mut Vec<RecordError>,
    ) -> Result<Vec<PendingFile>, PreserveError> {
        let listing = vfs
            .read_dir(root)
            .map_err(|e| PreserveError::Vfs(format!("cannot read root {}: {}", root.display(), e)))?;

        let mut visited = HashSet::new();
        if let Some(canonical) = vfs.canonicalize(root) {
            visited.insert(canonical);
        }

        let mut files = Vec::new();
        let mut linked = Vec::new();
        self.walk(vfs, root, root, listing, &mut visited, &mut linked, &mut files, errors);

        // Linked directories are walked only once every real directory has
        // claimed its canonical path, so a file keeps its real path.
        while !linked.is_empty() {
            for (path, key) in std::mem::take(&mut linked) {
                self.descend(vfs, root, path, key, &mut visited, &mut linked, &mut files, errors);
            }
        }
        debug!("Collected {} files under {}", files.len(), root.display());
        Ok(files)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        vfs: &dyn Vfs,
        root: &Path,
        dir: &Path,
        listing: DirListing,
        visited: &mut HashSet<PathBuf>,
        linked: &mut Vec<(PathBuf, String)>,
        files: &mut Vec<PendingFile>,
        errors: &mut Vec<RecordError>,
    ) {
        let relative_key = |path: &Path| {
            let relative = path.strip_prefix(root).unwrap_or(path);
            normalize_path(&relative.to_string_lossy())
        };

        let mut entries = Vec::with_capacity(listing.len());
        for item in listing {
            match item {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!("Unreadable entry in {}: {}", dir.display(), err);
                    errors.push(RecordError {
                        path: relative_key(dir),
                        reason: err.to_string(),
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        for entry in entries {
            let key = relative_key(&entry.path);
            if key.is_empty() {
                continue;
            }
            let name = entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut is_dir = entry.is_dir;
            if entry.is_symlink {
                match self.options.symlinks {
                    SymlinkPolicy::Skip => {
                        debug!("Skipping symlink {}", key);
                        continue;
                    }
                    SymlinkPolicy::Follow => match vfs.metadata(&entry.path) {
                        Ok(meta) => is_dir = meta.is_dir,
                        Err(err) => {
                            warn!("Broken symlink {}: {}", key, err);
                            errors.push(RecordError {
                                path: key,
                                reason: format!("broken symlink: {}", err),
                            });
                            continue;
                        }
                    },
                }
            }

            if self.options.visible_only && self.options.hidden_rule.is_hidden(&name, entry.is_hidden) {
                debug!("Skipping hidden {}", key);
                continue;
            }

            if let Some(exclude) = &self.exclude {
                if exclude.matched(Path::new(&key), is_dir).is_ignore() {
                    debug!("Excluded {}", key);
                    continue;
                }
            }

            if !is_dir {
                files.push(PendingFile {
                    path: entry.path,
                    key,
                });
                continue;
            }

            if entry.is_symlink {
                linked.push((entry.path, key));
            } else {
                self.descend(vfs, root, entry.path, key, visited, linked, files, errors);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn descend(
        &self,
        vfs: &dyn Vfs,
        root: &Path,
        dir: PathBuf,
        key: String,
        visited: &mut HashSet<PathBuf>,
        linked: &mut Vec<(PathBuf, String)>,
        files: &mut Vec<PendingFile>,
        errors: &mut Vec<RecordError>,
    ) {
        if let Some(canonical) = vfs.canonicalize(&dir) {
            if !visited.insert(canonical) {
                debug!("Skipping already visited directory {}", key);
                return;
            }
        }

        match vfs.read_dir(&dir) {
            Ok(listing) => self.walk(vfs, root, &dir, listing, visited, linked, files, errors),
            Err(err) => {
                warn!("Unreadable directory {}: {}", key, err);
                errors.push(RecordError {
                    path: key,
                    reason: err.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{load_inventory, ParseOptions};
    use crate::vfs::{LocalVfs, MemoryVfs};
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn sample_vfs() -> MemoryVfs {
        let vfs = MemoryVfs::new("sample");
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        vfs.add_file("b.txt", b"bbb", Some(when));
        vfs.add_file("a/z.CSV", b"zz", Some(when));
        vfs.add_file("a/y.txt", b"y", None);
        vfs.add_file("c/d/e.bin", b"eeeee", None);
        vfs.add_hidden_file("a/secret.txt", b"shh");
        vfs.add_file(".cache/blob", b"123", None);
        vfs
    }

    fn paths(inventory: &Inventory) -> Vec<&str> {
        inventory.iter().map(|r| r.path.as_str()).collect()
    }

    fn sorted_records(inventory: &Inventory) -> Vec<Record> {
        let mut records = inventory.records().to_vec();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }

    #[test]
    fn test_depth_first_sorted_walk() {
        let vfs = sample_vfs();
        let outcome = InventoryBuilder::new(BuildOptions::default())
            .build(&vfs, Path::new(""))
            .unwrap();

        assert!(outcome.completed);
        assert!(outcome.errors.is_empty());
        assert_eq!(paths(&outcome.inventory), vec!["a/y.txt", "a/z.CSV", "b.txt", "c/d/e.bin"]);

        let z = &outcome.inventory.records()[1];
        assert_eq!(z.size, 2);
        assert_eq!(z.extension, ".csv");
        assert_eq!(z.modified_time.unwrap().timestamp(), 1_600_000_000);
        assert!(z.checksum.is_none());
        assert!(outcome.inventory.records()[0].modified_time.is_none());
    }

    #[test]
    fn test_hidden_entries_included_on_request() {
        let vfs = sample_vfs();
        let options = BuildOptions {
            visible_only: false,
            ..BuildOptions::default()
        };
        let outcome = InventoryBuilder::new(options).build(&vfs, Path::new("")).unwrap();
        assert_eq!(outcome.inventory.len(), 6);

        let options = BuildOptions {
            hidden_rule: HiddenRule::Name,
            ..BuildOptions::default()
        };
        let outcome = InventoryBuilder::new(options).build(&vfs, Path::new("")).unwrap();
        assert!(paths(&outcome.inventory).contains(&"a/secret.txt"));
        assert!(!paths(&outcome.inventory).contains(&".cache/blob"));
    }

    #[test]
    fn test_checksums_computed() {
        let vfs = sample_vfs();
        let options = BuildOptions {
            compute_checksums: true,
            ..BuildOptions::default()
        };
        let outcome = InventoryBuilder::new(options).build(&vfs, Path::new("")).unwrap();
        let b = outcome.inventory.iter().find(|r| r.path == "b.txt").unwrap();
        assert_eq!(b.checksum.as_deref(), Some(format!("{:x}", md5::compute(b"bbb")).as_str()));
    }

    #[test]
    fn test_custom_hasher() {
        struct LengthHasher;
        impl FileHasher for LengthHasher {
            fn algorithm(&self) -> String {
                "length".to_string()
            }
            fn digest(&self, reader: &mut dyn Read) -> std::io::Result<String> {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(format!("{:04x}", buf.len()))
            }
        }

        let vfs = sample_vfs();
        let options = BuildOptions {
            compute_checksums: true,
            ..BuildOptions::default()
        };
        let outcome = InventoryBuilder::new(options)
            .with_hasher(LengthHasher)
            .build(&vfs, Path::new(""))
            .unwrap();
        let e = outcome.inventory.iter().find(|r| r.path == "c/d/e.bin").unwrap();
        assert_eq!(e.checksum.as_deref(), Some("0005"));
    }

    #[test]
    fn test_exclude_patterns() {
        let vfs = sample_vfs();
        let options = BuildOptions {
            exclude_patterns: vec!["*.bin".to_string(), "a/".to_string()],
            ..BuildOptions::default()
        };
        let outcome = InventoryBuilder::new(options).build(&vfs, Path::new("")).unwrap();
        assert_eq!(paths(&outcome.inventory), vec!["b.txt"]);
    }

    #[test]
    fn test_unreadable_file_is_recorded_not_fatal() {
        let vfs = sample_vfs();
        vfs.add_unreadable_file("a/locked.txt", b"nope");
        let options = BuildOptions {
            compute_checksums: true,
            ..BuildOptions::default()
        };
        let outcome = InventoryBuilder::new(options).build(&vfs, Path::new("")).unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.inventory.len(), 4);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path, "a/locked.txt");
    }

    #[test]
    fn test_unreadable_root_aborts() {
        let vfs = sample_vfs();
        let result = InventoryBuilder::new(BuildOptions::default()).build(&vfs, Path::new("missing"));
        assert!(matches!(result, Err(PreserveError::Vfs(_))));
    }

    #[test]
    fn test_subdirectory_root() {
        let vfs = sample_vfs();
        let outcome = InventoryBuilder::new(BuildOptions::default())
            .build(&vfs, Path::new("c"))
            .unwrap();
        assert_eq!(paths(&outcome.inventory), vec!["d/e.bin"]);
        assert_eq!(outcome.inventory.origin(), "memory:sample/c");
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let vfs = MemoryVfs::new("many");
        for i in 0..200 {
            vfs.add_file(&format!("dir{}/file{}.dat", i % 7, i), format!("{i}").as_bytes(), None);
        }
        let sequential = BuildOptions {
            compute_checksums: true,
            ..BuildOptions::default()
        };
        let parallel = BuildOptions {
            workers: 4,
            ..sequential.clone()
        };

        let a = InventoryBuilder::new(sequential).build(&vfs, Path::new("")).unwrap();
        let b = InventoryBuilder::new(parallel).build(&vfs, Path::new("")).unwrap();
        assert!(b.completed);
        assert_eq!(b.inventory.len(), 200);
        assert_eq!(sorted_records(&a.inventory), sorted_records(&b.inventory));
    }

    #[test]
    fn test_cancelled_before_start() {
        let vfs = sample_vfs();
        let cancel = AtomicBool::new(true);
        let outcome = InventoryBuilder::new(BuildOptions::default())
            .build_with_cancel(&vfs, Path::new(""), Some(&cancel))
            .unwrap();
        assert!(!outcome.completed);
        assert!(outcome.inventory.is_empty());
    }

    #[test]
    fn test_build_into_writes_csv_and_clears_checkpoint() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("inv.csv");
        let checkpoint = Checkpoint::default_path(&output);
        let vfs = sample_vfs();
        let options = BuildOptions {
            compute_checksums: true,
            checkpoint_path: Some(checkpoint.clone()),
            ..BuildOptions::default()
        };

        let outcome = InventoryBuilder::new(options)
            .build_into(&vfs, Path::new(""), &output)
            .unwrap();
        assert!(outcome.completed);
        assert!(!checkpoint.exists());

        let loaded = load_inventory(&output, ReportFormat::Native, &ParseOptions::default()).unwrap();
        assert_eq!(loaded.inventory.records(), outcome.inventory.records());
    }

    /// Interrupt a checkpointed build after `stop_after` records
    fn interrupted_build(vfs: &MemoryVfs, output: &Path, stop_after: usize, workers: usize) -> BuildOutcome {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let options = BuildOptions {
            compute_checksums: true,
            checkpoint_path: Some(Checkpoint::default_path(output)),
            workers,
            ..BuildOptions::default()
        };
        InventoryBuilder::new(options)
            .with_progress(move |done, _| {
                if done >= stop_after {
                    flag.store(true, Ordering::Relaxed);
                }
            })
            .build_into_with_cancel(vfs, Path::new(""), output, Some(&cancel))
            .unwrap()
    }

    fn resume(vfs: &MemoryVfs, output: &Path, workers: usize) -> BuildOutcome {
        let checkpoint = Checkpoint::load(&Checkpoint::default_path(output)).unwrap();
        let options = BuildOptions {
            compute_checksums: true,
            resume_from: Some(checkpoint),
            workers,
            ..BuildOptions::default()
        };
        InventoryBuilder::new(options)
            .build_into(vfs, Path::new(""), output)
            .unwrap()
    }

    #[test]
    fn test_resume_equals_uninterrupted_build() {
        let temp = TempDir::new().unwrap();
        let vfs = sample_vfs();
        let full = InventoryBuilder::new(BuildOptions {
            compute_checksums: true,
            ..BuildOptions::default()
        })
        .build(&vfs, Path::new(""))
        .unwrap();

        let output = temp.path().join("inv.csv");
        let first = interrupted_build(&vfs, &output, 2, 1);
        assert!(!first.completed);
        assert_eq!(first.inventory.len(), 2);
        assert!(Checkpoint::default_path(&output).exists());

        let second = resume(&vfs, &output, 1);
        assert!(second.completed);
        assert_eq!(second.resumed, 2);
        assert!(!Checkpoint::default_path(&output).exists());
        assert_eq!(sorted_records(&second.inventory), sorted_records(&full.inventory));

        let loaded = load_inventory(&output, ReportFormat::Native, &ParseOptions::default()).unwrap();
        assert_eq!(sorted_records(&loaded.inventory), sorted_records(&full.inventory));
    }

    #[test]
    fn test_resume_discards_unconfirmed_record() {
        let temp = TempDir::new().unwrap();
        let vfs = sample_vfs();
        let output = temp.path().join("inv.csv");
        interrupted_build(&vfs, &output, 1, 1);

        // Record reached the output, crash before its checkpoint entry
        let mut file = OpenOptions::new().append(true).open(&output).unwrap();
        file.write_all(b"b.txt,3,,ffff,.txt\n").unwrap();
        drop(file);

        let outcome = resume(&vfs, &output, 1);
        assert!(outcome.completed);

        let loaded = load_inventory(&output, ReportFormat::Native, &ParseOptions::default()).unwrap();
        assert_eq!(loaded.inventory.len(), 4);
        assert!(loaded.inventory.index().is_ok());
        let b = loaded.inventory.iter().find(|r| r.path == "b.txt").unwrap();
        assert_ne!(b.checksum.as_deref(), Some("ffff"));
    }

    #[test]
    fn test_parallel_resume() {
        let temp = TempDir::new().unwrap();
        let vfs = MemoryVfs::new("many");
        for i in 0..60 {
            vfs.add_file(&format!("f{:02}.txt", i), format!("{i}").as_bytes(), None);
        }
        let output = temp.path().join("inv.csv");

        let first = interrupted_build(&vfs, &output, 10, 3);
        assert!(!first.completed);

        let second = resume(&vfs, &output, 3);
        assert!(second.completed);
        assert_eq!(second.inventory.len(), 60);
        assert!(second.inventory.index().is_ok());
    }

    #[test]
    fn test_resume_with_other_algorithm_is_rejected() {
        let temp = TempDir::new().unwrap();
        let vfs = sample_vfs();
        let output = temp.path().join("inv.csv");
        interrupted_build(&vfs, &output, 1, 1);

        let checkpoint = Checkpoint::load(&Checkpoint::default_path(&output)).unwrap();
        let options = BuildOptions {
            compute_checksums: true,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            resume_from: Some(checkpoint),
            ..BuildOptions::default()
        };
        let result = InventoryBuilder::new(options).build_into(&vfs, Path::new(""), &output);
        assert!(matches!(result, Err(PreserveError::CheckpointCorrupt(_))));
    }

    #[test]
    fn test_local_tree_with_mtimes() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("docs")).unwrap();
        let file = temp.path().join("docs/report.txt");
        std::fs::write(&file, b"hello").unwrap();
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
        filetime::set_file_mtime(&file, filetime::FileTime::from_system_time(when)).unwrap();
        std::fs::write(temp.path().join(".hidden"), b"x").unwrap();

        let vfs = LocalVfs::new(temp.path().to_path_buf());
        let outcome = InventoryBuilder::new(BuildOptions::default())
            .build(&vfs, Path::new(""))
            .unwrap();

        assert_eq!(paths(&outcome.inventory), vec!["docs/report.txt"]);
        let record = &outcome.inventory.records()[0];
        assert_eq!(record.size, 5);
        assert_eq!(record.modified_time.unwrap().timestamp(), 1_500_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_skipped_or_followed_without_cycles() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("real")).unwrap();
        std::fs::write(temp.path().join("real/data.txt"), b"1234").unwrap();
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("alias")).unwrap();
        std::os::unix::fs::symlink(temp.path(), temp.path().join("real/loop")).unwrap();

        let vfs = LocalVfs::new(temp.path().to_path_buf());
        let skipped = InventoryBuilder::new(BuildOptions::default())
            .build(&vfs, Path::new(""))
            .unwrap();
        assert_eq!(paths(&skipped.inventory), vec!["real/data.txt"]);

        let options = BuildOptions {
            symlinks: SymlinkPolicy::Follow,
            ..BuildOptions::default()
        };
        let followed = InventoryBuilder::new(options).build(&vfs, Path::new("")).unwrap();
        assert!(followed.completed);
        assert_eq!(paths(&followed.inventory), vec!["real/data.txt"]);
        assert!(followed.errors.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_followed_links_keep_real_paths_at_any_depth() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("z/deep")).unwrap();
        std::fs::write(temp.path().join("z/deep/data.txt"), b"1234").unwrap();
        std::os::unix::fs::symlink(temp.path().join("z/deep"), temp.path().join("a_link")).unwrap();

        let outside = TempDir::new().unwrap();
        std::fs::create_dir_all(outside.path().join("sub")).unwrap();
        std::fs::write(outside.path().join("sub/ext.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("b_ext")).unwrap();

        let vfs = LocalVfs::new(temp.path().to_path_buf());
        let options = BuildOptions {
            symlinks: SymlinkPolicy::Follow,
            ..BuildOptions::default()
        };
        let outcome = InventoryBuilder::new(options).build(&vfs, Path::new("")).unwrap();
        assert_eq!(paths(&outcome.inventory), vec!["z/deep/data.txt", "b_ext/sub/ext.txt"]);
    }

    #[test]
    fn test_file_vanishing_after_listing_is_recorded() {
        let vfs = Arc::new(sample_vfs());
        let remover = Arc::clone(&vfs);
        let outcome = InventoryBuilder::new(BuildOptions::default())
            .with_progress(move |done, _| {
                if done == 1 {
                    remover.remove_file("b.txt");
                }
            })
            .build(vfs.as_ref(), Path::new(""))
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(paths(&outcome.inventory), vec!["a/y.txt", "a/z.CSV", "c/d/e.bin"]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path, "b.txt");
    }

    #[test]
    fn test_progress_counts_errors() {
        let vfs = sample_vfs();
        vfs.add_unreadable_file("a/locked.txt", b"nope");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let options = BuildOptions {
            compute_checksums: true,
            ..BuildOptions::default()
        };
        InventoryBuilder::new(options)
            .with_progress(move |done, total| sink.lock().unwrap().push((done, total)))
            .build(&vfs, Path::new(""))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last(), Some(&(5, 5)));
    }

    #[test]
    fn test_options_from_config() {
        let config = AppConfig {
            workers: 0,
            visible_only: false,
            exclude_patterns: vec!["*.tmp".to_string()],
            ..AppConfig::default()
        };
        let options = BuildOptions::from_config(&config);
        assert_eq!(options.workers, 1);
        assert!(!options.visible_only);
        assert!(!options.compute_checksums);
        assert_eq!(options.exclude_patterns, vec!["*.tmp".to_string()]);
    }
}
