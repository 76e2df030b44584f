use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use preserve_common::{Inventory, MatchKeys, Record, ReportFormat};
use preserve_core::{
    read_inventory, summarize, BuildOptions, ComparisonEngine, CsvRecordWriter, InventoryBuilder, LocalVfs,
    ParseOptions,
};
use std::fs;
use std::io::Write as IoWrite;
use std::path::Path;
use tempfile::TempDir;

// Helper to create test directory structure
fn create_test_tree(root: &Path, depth: usize, files_per_dir: usize, file_size: usize) {
    if depth == 0 {
        return;
    }

    for i in 0..files_per_dir {
        let file_path = root.join(format!("file_{}.txt", i));
        let mut file = fs::File::create(&file_path).unwrap();
        let content = vec![b'x'; file_size];
        file.write_all(&content).unwrap();
    }

    if depth > 1 {
        for i in 0..3 {
            let dir_path = root.join(format!("subdir_{}", i));
            fs::create_dir(&dir_path).unwrap();
            create_test_tree(&dir_path, depth - 1, files_per_dir, file_size);
        }
    }
}

fn create_inventory(label: &str, count: usize, prefix: &str) -> Inventory {
    let records = (0..count)
        .map(|i| {
            Record::new(&format!("{}_{}.txt", prefix, i), 1024)
                .with_checksum(Some(format!("{:032x}", i)))
        })
        .collect();
    Inventory::new(ReportFormat::Native, label, records)
}

fn bench_build_small(c: &mut Criterion) {
    c.bench_function("build_small_tree_10_files", |b| {
        let temp = TempDir::new().unwrap();
        create_test_tree(temp.path(), 1, 10, 1024);
        let vfs = LocalVfs::new(temp.path().to_path_buf());
        let builder = InventoryBuilder::new(BuildOptions::default());

        b.iter(|| {
            let outcome = builder.build(&vfs, black_box(Path::new(""))).unwrap();
            black_box(outcome);
        });
    });
}

fn bench_build_with_checksums(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    create_test_tree(temp.path(), 3, 10, 16 * 1024);
    let vfs = LocalVfs::new(temp.path().to_path_buf());

    let mut group = c.benchmark_group("build_checksums");

    for workers in [1, 4].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(workers), workers, |b, &workers| {
            let builder = InventoryBuilder::new(BuildOptions {
                compute_checksums: true,
                workers,
                ..BuildOptions::default()
            });

            b.iter(|| {
                let outcome = builder.build(&vfs, black_box(Path::new(""))).unwrap();
                black_box(outcome);
            });
        });
    }

    group.finish();
}

fn bench_comparison_identical(c: &mut Criterion) {
    let engine = ComparisonEngine::new(MatchKeys::default());

    let mut group = c.benchmark_group("comparison_identical");

    for size in [1_000, 10_000, 100_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let inventories = [
                create_inventory("left", size, "file"),
                create_inventory("right", size, "file"),
            ];

            b.iter(|| {
                let report = engine.compare(black_box(&inventories)).unwrap();
                black_box(report);
            });
        });
    }

    group.finish();
}

fn bench_comparison_disjoint(c: &mut Criterion) {
    let engine = ComparisonEngine::new(MatchKeys::default());

    let mut group = c.benchmark_group("comparison_disjoint");

    for size in [1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let inventories = [
                create_inventory("left", size, "file"),
                create_inventory("middle", size, "other"),
                create_inventory("right", size, "different"),
            ];

            b.iter(|| {
                let report = engine.compare(black_box(&inventories)).unwrap();
                black_box(report);
            });
        });
    }

    group.finish();
}

fn bench_parse_and_count(c: &mut Criterion) {
    c.bench_function("parse_native_and_bytecount_10000", |b| {
        let inventory = create_inventory("source", 10_000, "file");
        let mut writer = CsvRecordWriter::new(Vec::new()).unwrap();
        for record in &inventory {
            writer.write(record).unwrap();
        }
        let csv = writer.into_inner().unwrap();

        b.iter(|| {
            let loaded = read_inventory(
                black_box(csv.as_slice()),
                "bench.csv",
                ReportFormat::Native,
                &ParseOptions::default(),
            )
            .unwrap();
            black_box(summarize(&loaded.inventory));
        });
    });
}

criterion_group!(build_benches, bench_build_small, bench_build_with_checksums);

criterion_group!(
    comparison_benches,
    bench_comparison_identical,
    bench_comparison_disjoint
);

criterion_group!(adapter_benches, bench_parse_and_count);

criterion_main!(build_benches, comparison_benches, adapter_benches);
