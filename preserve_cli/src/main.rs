use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use preserve_common::{
    load_config, load_config_from, AppConfig, ChecksumAlgorithm, ComparisonReport, Inventory, MalformedPolicy,
    MalformedRecordError, MatchKey, MatchKeys, RecordError, ReportFormat, ReportSummary, SymlinkPolicy,
};
use preserve_core::{
    human_bytes, load_inventory, summarize, BuildOptions, BuildOutcome, ByteCount, Checkpoint, ComparisonEngine,
    CsvRecordWriter, InventoryBuilder, LocalVfs, ParseOptions, Verifier, VerifyOutcome, VerifySide,
};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "preserve")]
#[command(version)]
#[command(about = "Inventory, compare and verify preserved filesets", long_about = None)]
struct Cli {
    /// Read settings from this preserve.toml instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk a directory and write a CSV inventory
    Inventory(InventoryArgs),

    /// Count files and bytes per extension
    Bytecount(BytecountArgs),

    /// Compare two or more inventories
    Compare(CompareArgs),

    /// Check that two filesets hold the same content
    Verify(VerifyArgs),
}

#[derive(Args)]
struct InventoryArgs {
    /// Directory to inventory
    root: PathBuf,

    /// Output CSV file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Compute a checksum for every file
    #[arg(short, long)]
    checksums: bool,

    /// Checksum algorithm (md5, sha256, blake3); implies --checksums
    #[arg(short, long)]
    algorithm: Option<ChecksumAlgorithm>,

    /// Include hidden files and directories
    #[arg(long)]
    all: bool,

    /// Follow symbolic links
    #[arg(short = 'L', long)]
    follow_symlinks: bool,

    /// Exclude patterns, gitignore syntax (can be specified multiple times)
    #[arg(short, long)]
    exclude: Vec<String>,

    /// Checkpoint file (default: <output>.checkpoint)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Continue an interrupted inventory
    #[arg(long)]
    resume: bool,

    /// Hashing threads
    #[arg(short, long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct InputArgs {
    /// Report format (native, analyzer, backup); detected when omitted
    #[arg(short, long)]
    format: Option<ReportFormat>,

    /// Root prefix removed from every report path
    #[arg(long)]
    strip_prefix: Option<String>,

    /// Skip malformed report rows instead of aborting
    #[arg(long)]
    skip_malformed: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct BytecountArgs {
    /// Report file or directory
    input: PathBuf,

    #[command(flatten)]
    input_args: InputArgs,
}

#[derive(Args)]
struct CompareArgs {
    /// Report files or directories
    #[arg(required = true, num_args = 2..)]
    inputs: Vec<PathBuf>,

    /// Fields that must agree, e.g. size,checksum (path is always used)
    #[arg(short, long)]
    keys: Option<MatchKeys>,

    #[command(flatten)]
    input_args: InputArgs,
}

#[derive(Args)]
struct VerifyArgs {
    /// First report file or directory
    first: PathBuf,

    /// Second report file or directory
    second: PathBuf,

    /// Checksum algorithm used for directories
    #[arg(short, long)]
    algorithm: Option<ChecksumAlgorithm>,

    #[command(flatten)]
    input_args: InputArgs,
}

/// Process exit status for a run that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Clean,
    Differences,
}

impl Status {
    fn code(self) -> i32 {
        match self {
            Status::Clean => 0,
            Status::Differences => 2,
        }
    }
}

fn main() {
    // Initialize tracing to stderr (so reports can go cleanly to stdout)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(status) => status.code(),
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<Status> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?.config,
        None => load_config(false)?.config,
    };

    match cli.command {
        Commands::Inventory(args) => run_inventory(args, &config),
        Commands::Bytecount(args) => run_bytecount(args, &config),
        Commands::Compare(args) => run_compare(args, &config),
        Commands::Verify(args) => run_verify(args, &config),
    }
}

/// Resolve the report format of `path`: an explicit choice wins, then a
/// `.csv` extension, then a tab in the first line.
fn detect_format(path: &Path, explicit: Option<ReportFormat>) -> Result<ReportFormat> {
    if let Some(format) = explicit {
        return Ok(format);
    }

    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        return Ok(ReportFormat::Native);
    }

    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut first_line = Vec::new();
    BufReader::new(file)
        .read_until(b'\n', &mut first_line)
        .with_context(|| format!("cannot read {}", path.display()))?;

    if first_line.contains(&b'\t') {
        Ok(ReportFormat::Analyzer)
    } else {
        Ok(ReportFormat::Backup)
    }
}

fn parse_options(args: &InputArgs, config: &AppConfig) -> ParseOptions {
    ParseOptions {
        policy: if args.skip_malformed {
            MalformedPolicy::Skip
        } else {
            config.malformed
        },
        strip_prefix: args.strip_prefix.clone(),
    }
}

/// An inventory plus everything that was left out while producing it
struct LoadedInput {
    inventory: Inventory,
    skipped: Vec<MalformedRecordError>,
    errors: Vec<RecordError>,
}

fn load_input(path: &Path, args: &InputArgs, config: &AppConfig, build: &BuildOptions) -> Result<LoadedInput> {
    if path.is_dir() {
        let outcome = build_inventory(path, build.clone(), false)?;
        return Ok(LoadedInput {
            inventory: outcome.inventory,
            skipped: Vec::new(),
            errors: outcome.errors,
        });
    }

    let format = detect_format(path, args.format)?;
    info!("Loading {} as {}", path.display(), format);
    let loaded = load_inventory(path, format, &parse_options(args, config))
        .with_context(|| format!("cannot load {}", path.display()))?;
    Ok(LoadedInput {
        inventory: loaded.inventory,
        skipped: loaded.skipped,
        errors: Vec::new(),
    })
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar
}

/// Walk a local directory, in memory or into `output`
fn build_inventory(root: &Path, options: BuildOptions, show_progress: bool) -> Result<BuildOutcome> {
    build_inventory_into(root, options, None, show_progress)
}

fn build_inventory_into(
    root: &Path,
    options: BuildOptions,
    output: Option<&Path>,
    show_progress: bool,
) -> Result<BuildOutcome> {
    let root = fs::canonicalize(root).with_context(|| format!("cannot open {}", root.display()))?;
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let vfs = LocalVfs::new(root.clone());
    let mut builder = InventoryBuilder::new(options);
    let bar = show_progress.then(progress_bar);
    if let Some(bar) = bar.clone() {
        builder = builder.with_progress(move |done, total| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        });
    }

    let outcome = match output {
        Some(output) => builder.build_into(&vfs, Path::new(""), output),
        None => builder.build(&vfs, Path::new("")),
    }
    .with_context(|| format!("inventory of {} failed", root.display()))?;

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    Ok(outcome)
}

fn run_inventory(args: InventoryArgs, config: &AppConfig) -> Result<Status> {
    let mut options = BuildOptions::from_config(config);
    options.compute_checksums = args.checksums || args.algorithm.is_some();
    if let Some(algorithm) = args.algorithm {
        options.checksum_algorithm = algorithm;
    }
    if args.all {
        options.visible_only = false;
    }
    if args.follow_symlinks {
        options.symlinks = SymlinkPolicy::Follow;
    }
    options.exclude_patterns.extend(args.exclude);
    if let Some(workers) = args.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        options.workers = workers;
    }

    let outcome = match &args.output {
        Some(output) => {
            let output = std::path::absolute(output)
                .with_context(|| format!("cannot resolve {}", output.display()))?;
            let checkpoint_path = args
                .checkpoint
                .clone()
                .unwrap_or_else(|| Checkpoint::default_path(&output));

            if args.resume {
                if checkpoint_path.exists() {
                    options.resume_from = Some(
                        Checkpoint::load(&checkpoint_path)
                            .with_context(|| format!("cannot resume from {}", checkpoint_path.display()))?,
                    );
                } else {
                    warn!(
                        "No checkpoint at {}, starting a fresh inventory",
                        checkpoint_path.display()
                    );
                }
            } else if checkpoint_path.exists() {
                warn!("Replacing earlier checkpoint {}", checkpoint_path.display());
            }
            options.checkpoint_path = Some(checkpoint_path);

            let outcome = build_inventory_into(&args.root, options, Some(&output), true)?;
            info!(
                "Wrote {} records to {} ({} carried over)",
                outcome.inventory.len(),
                output.display(),
                outcome.resumed
            );
            outcome
        }
        None => {
            if args.checkpoint.is_some() || args.resume {
                bail!("--checkpoint and --resume require --output");
            }
            let outcome = build_inventory(&args.root, options, false)?;
            let stdout = io::stdout();
            let mut writer = CsvRecordWriter::new(stdout.lock())?;
            for record in &outcome.inventory {
                writer.write(record)?;
            }
            writer.flush()?;
            outcome
        }
    };

    print_skipped(&mut io::stderr(), &[], &outcome.errors)?;
    Ok(Status::Clean)
}

#[derive(Serialize)]
struct BytecountJson<'a> {
    input: &'a str,
    #[serde(flatten)]
    count: &'a ByteCount,
    skipped: &'a [MalformedRecordError],
    errors: &'a [RecordError],
}

fn run_bytecount(args: BytecountArgs, config: &AppConfig) -> Result<Status> {
    let loaded = load_input(
        &args.input,
        &args.input_args,
        config,
        &BuildOptions::from_config(config),
    )?;
    let count = summarize(&loaded.inventory);

    if args.input_args.json {
        let report = BytecountJson {
            input: loaded.inventory.origin(),
            count: &count,
            skipped: &loaded.skipped,
            errors: &loaded.errors,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(Status::Clean);
    }

    let mut out = io::stdout().lock();
    print_bytecount(&mut out, loaded.inventory.origin(), &count)?;
    print_skipped(&mut out, &loaded.skipped, &loaded.errors)?;
    Ok(Status::Clean)
}

fn print_bytecount(out: &mut impl Write, input: &str, count: &ByteCount) -> io::Result<()> {
    writeln!(out, "{}", "=".repeat(80))?;
    writeln!(out, "Byte Count: {}", input)?;
    writeln!(out, "{}", "=".repeat(80))?;
    writeln!(out, "{:<20} {:>12} {:>18} {:>14}", "Extension", "Files", "Bytes", "Size")?;
    writeln!(out, "{}", "-".repeat(80))?;
    for (extension, totals) in &count.by_extension {
        let label = if extension.is_empty() { "(none)" } else { extension.as_str() };
        writeln!(
            out,
            "{:<20} {:>12} {:>18} {:>14}",
            label,
            totals.files,
            totals.bytes,
            human_bytes(totals.bytes)
        )?;
    }
    writeln!(out, "{}", "-".repeat(80))?;
    writeln!(
        out,
        "{:<20} {:>12} {:>18} {:>14}",
        "Total",
        count.total.files,
        count.total.bytes,
        count.human_bytes()
    )?;
    writeln!(out, "{}", "=".repeat(80))
}

#[derive(Serialize)]
struct CompareJson<'a> {
    report: &'a ComparisonReport,
    summary: ReportSummary,
    skipped: &'a [MalformedRecordError],
    errors: &'a [RecordError],
}

fn run_compare(args: CompareArgs, config: &AppConfig) -> Result<Status> {
    let keys = args.keys.clone().unwrap_or_else(|| config.match_keys.clone());
    let mut build = BuildOptions::from_config(config);
    build.compute_checksums = keys.contains(MatchKey::Checksum);

    let mut inventories = Vec::with_capacity(args.inputs.len());
    let mut skipped = Vec::new();
    let mut errors = Vec::new();
    for input in &args.inputs {
        let loaded = load_input(input, &args.input_args, config, &build)?;
        inventories.push(loaded.inventory);
        skipped.extend(loaded.skipped);
        errors.extend(loaded.errors);
    }

    let report = ComparisonEngine::new(keys).compare(&inventories)?;

    if args.input_args.json {
        let json = CompareJson {
            report: &report,
            summary: report.summary(),
            skipped: &skipped,
            errors: &errors,
        };
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        let mut out = io::stdout().lock();
        print_report(&mut out, &report)?;
        print_skipped(&mut out, &skipped, &errors)?;
    }

    Ok(if report.is_clean() {
        Status::Clean
    } else {
        Status::Differences
    })
}

#[derive(Serialize)]
struct VerifyJson<'a> {
    #[serde(flatten)]
    outcome: &'a VerifyOutcome,
    summary: ReportSummary,
    skipped: &'a [MalformedRecordError],
}

fn run_verify(args: VerifyArgs, config: &AppConfig) -> Result<Status> {
    let mut build = BuildOptions::from_config(config);
    if let Some(algorithm) = args.algorithm {
        build.checksum_algorithm = algorithm;
    }

    let mut skipped = Vec::new();
    let mut side = |path: &Path| -> Result<VerifySide<'static>> {
        if path.is_dir() {
            let root = fs::canonicalize(path).with_context(|| format!("cannot open {}", path.display()))?;
            return Ok(VerifySide::Directory(root));
        }
        let loaded = load_input(path, &args.input_args, config, &build)?;
        skipped.extend(loaded.skipped);
        Ok(VerifySide::Inventory(loaded.inventory))
    };
    let first = side(&args.first)?;
    let second = side(&args.second)?;

    let outcome = Verifier::new(build.clone()).verify_at_runtime(first, second)?;

    if args.input_args.json {
        let json = VerifyJson {
            outcome: &outcome,
            summary: outcome.report.summary(),
            skipped: &skipped,
        };
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        let mut out = io::stdout().lock();
        print_report(&mut out, &outcome.report)?;
        if !outcome.unverified.is_empty() {
            writeln!(out, "\nUnverified (no checksum on one side):")?;
            for path in &outcome.unverified {
                writeln!(out, "  {}", path)?;
            }
        }
        print_skipped(&mut out, &skipped, &outcome.errors)?;
    }

    Ok(if outcome.is_clean() {
        Status::Clean
    } else {
        Status::Differences
    })
}

fn print_report(out: &mut impl Write, report: &ComparisonReport) -> io::Result<()> {
    writeln!(out, "{}", "=".repeat(80))?;
    writeln!(out, "Comparison Results (keys: {})", report.match_keys)?;
    writeln!(out, "{}", "=".repeat(80))?;
    writeln!(out, "Inputs:")?;
    for (index, input) in report.inputs.iter().enumerate() {
        writeln!(out, "  [{}] {}", index + 1, input)?;
    }

    if !report.partial.is_empty() {
        writeln!(out, "\nPartial:")?;
        for entry in &report.partial {
            writeln!(
                out,
                "  {}  (in: {}; missing: {})",
                entry.path,
                entry.present_in.join(", "),
                entry.missing_from.join(", ")
            )?;
        }
    }

    if !report.mismatched.is_empty() {
        writeln!(out, "\nMismatched:")?;
        for entry in &report.mismatched {
            writeln!(out, "  {}", entry.path)?;
            for field in &entry.fields {
                let values: Vec<String> = field
                    .values
                    .iter()
                    .map(|v| format!("{}={}", v.input, v.value))
                    .collect();
                writeln!(out, "      {}: {}", field.key, values.join("  "))?;
            }
        }
    }

    let summary = report.summary();
    writeln!(out, "\n{}", "=".repeat(80))?;
    writeln!(out, "Summary:")?;
    writeln!(out, "  Identical:       {}", summary.identical)?;
    writeln!(out, "  Partial:         {}", summary.partial)?;
    writeln!(out, "  Mismatched:      {}", summary.mismatched)?;
    writeln!(out, "{}", "=".repeat(80))
}

fn print_skipped(out: &mut impl Write, skipped: &[MalformedRecordError], errors: &[RecordError]) -> io::Result<()> {
    if skipped.is_empty() && errors.is_empty() {
        return Ok(());
    }
    writeln!(out, "\nSkipped:")?;
    for row in skipped {
        writeln!(out, "  {}", row)?;
    }
    for error in errors {
        writeln!(out, "  {}", error)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use preserve_common::{AttributedValue, FieldMismatch, FieldValue, Mismatch, PartialPresence};
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_compare_needs_two_inputs() {
        assert!(Cli::try_parse_from(["preserve", "compare", "a.csv"]).is_err());
        let cli = Cli::try_parse_from(["preserve", "compare", "a.csv", "b.csv", "c.tsv", "--keys", "size"]).unwrap();
        match cli.command {
            Commands::Compare(args) => {
                assert_eq!(args.inputs.len(), 3);
                assert_eq!(args.keys, Some(MatchKeys::from_iter([MatchKey::Size])));
            }
            _ => panic!("expected compare"),
        }
    }

    #[test]
    fn test_algorithm_flag_parses() {
        let cli = Cli::try_parse_from(["preserve", "verify", "a", "b", "--algorithm", "sha256"]).unwrap();
        match cli.command {
            Commands::Verify(args) => assert_eq!(args.algorithm, Some(ChecksumAlgorithm::Sha256)),
            _ => panic!("expected verify"),
        }
        assert!(Cli::try_parse_from(["preserve", "verify", "a", "b", "--algorithm", "crc"]).is_err());
    }

    #[test]
    fn test_detect_format() {
        let temp = TempDir::new().unwrap();
        let csv = temp.path().join("inv.CSV");
        let tsv = temp.path().join("scan.txt");
        let backup = temp.path().join("query.out");
        fs::write(&csv, "anything").unwrap();
        fs::write(&tsv, "Path\tSize\n").unwrap();
        fs::write(&backup, "Size  Backup Date\n----\n").unwrap();

        assert_eq!(detect_format(&csv, None).unwrap(), ReportFormat::Native);
        assert_eq!(detect_format(&tsv, None).unwrap(), ReportFormat::Analyzer);
        assert_eq!(detect_format(&backup, None).unwrap(), ReportFormat::Backup);
        assert_eq!(
            detect_format(&csv, Some(ReportFormat::Backup)).unwrap(),
            ReportFormat::Backup
        );
        assert!(detect_format(&temp.path().join("missing.out"), None).is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Clean.code(), 0);
        assert_eq!(Status::Differences.code(), 2);
    }

    #[test]
    fn test_print_report_sections() {
        let report = ComparisonReport {
            inputs: vec!["A".to_string(), "B".to_string()],
            match_keys: MatchKeys::default(),
            identical: vec!["same.txt".to_string()],
            partial: vec![PartialPresence {
                path: "only-a.txt".to_string(),
                present_in: vec!["A".to_string()],
                missing_from: vec!["B".to_string()],
            }],
            mismatched: vec![Mismatch {
                path: "changed.txt".to_string(),
                fields: vec![FieldMismatch {
                    key: MatchKey::Size,
                    values: vec![
                        AttributedValue {
                            input: "A".to_string(),
                            value: FieldValue::Size(1),
                        },
                        AttributedValue {
                            input: "B".to_string(),
                            value: FieldValue::Size(2),
                        },
                    ],
                }],
            }],
        };

        let mut out = Vec::new();
        print_report(&mut out, &report).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("keys: path,size,checksum"));
        assert!(text.contains("only-a.txt  (in: A; missing: B)"));
        assert!(text.contains("size: A=1  B=2"));
        assert!(text.contains("Identical:       1"));
    }

    #[test]
    fn test_print_skipped() {
        let mut out = Vec::new();
        print_skipped(&mut out, &[], &[]).unwrap();
        assert!(out.is_empty());

        let row = MalformedRecordError {
            input: "r.csv".to_string(),
            line: 4,
            content: "x,y".to_string(),
            reason: "invalid size 'y'".to_string(),
        };
        let error = RecordError {
            path: "locked.bin".to_string(),
            reason: "permission denied".to_string(),
        };
        print_skipped(&mut out, &[row], &[error]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Skipped:"));
        assert!(text.contains("r.csv, line 4"));
        assert!(text.contains("locked.bin: permission denied"));
    }

    #[test]
    fn test_print_bytecount_none_label() {
        let records = vec![preserve_common::Record::new("README", 10)];
        let count = summarize(&records);
        let mut out = Vec::new();
        print_bytecount(&mut out, "t", &count).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("(none)"));
    }
}
