//! Performance benchmarks for mediaspan
//!
//! Tracks first-fit allocation throughput over large staging lists, the
//! cost of seeding a session from many committed files, and summary
//! aggregation.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mediaspan::summary::ArchiveSummary;
use mediaspan::{Allocator, DestinationUnit, MediaKind, ScanSession, SourceFileRecord, UnitTemplate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::time::Duration;

fn template() -> UnitTemplate {
    UnitTemplate {
        kind: MediaKind::Csd,
        total_space: 4 * 1024u64.pow(4),
        block_size: 4096,
        reserved_capacity_bytes: 1024u64.pow(3),
        blocking_factor: 0,
    }
}

fn records(count: usize, seed: u64) -> Vec<SourceFileRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let mut record = SourceFileRecord::from_clean_path(&format!("/photos/{:03}/IMG_{:06}.jpg", i % 500, i));
            record.size = Some(rng.random_range(1024..64 * 1024 * 1024));
            record
        })
        .collect()
}

/// Units already holding committed files
fn written_units(count: usize) -> Vec<DestinationUnit> {
    let template = template();
    let mut units = Vec::new();
    let mut unit = DestinationUnit::new(1, &template);

    for record in records(count, 7) {
        let size = record.size.unwrap_or(0);
        if !unit.can_accept(size) {
            let next = unit.unit_number + 1;
            units.push(std::mem::replace(&mut unit, DestinationUnit::new(next, &template)));
        }
        let path = record.relative_path.clone();
        unit.add_file(record).unwrap();
        unit.mark_file_copied(&path, None).unwrap();
    }
    units.push(unit);
    units
}

/// Benchmark first-fit allocation of freshly staged files
fn bench_first_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_fit");
    group.measurement_time(Duration::from_secs(3));
    group.sample_size(20);

    for file_count in [1_000usize, 10_000, 100_000].iter() {
        let staged = records(*file_count, 42);
        group.throughput(Throughput::Elements(*file_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(file_count), file_count, |b, _| {
            b.iter(|| {
                let mut session = ScanSession::new(Vec::new());
                for record in staged.iter().cloned() {
                    session.register_new_file(record);
                }
                let report = Allocator::new(template()).allocate(&mut session).unwrap();
                black_box(report);
            });
        });
    }

    group.finish();
}

/// Benchmark backfilling existing units
fn bench_backfill(c: &mut Criterion) {
    let mut group = c.benchmark_group("backfill");
    group.measurement_time(Duration::from_secs(3));
    group.sample_size(20);

    let units = written_units(50_000);
    let staged = records(5_000, 99)
        .into_iter()
        .map(|mut r| {
            r.relative_path = format!("/new{}", r.relative_path);
            r.full_path = r.relative_path.clone();
            r
        })
        .collect::<Vec<_>>();

    group.bench_function("50k_committed_5k_new", |b| {
        b.iter(|| {
            let mut session = ScanSession::new(units.clone());
            for record in staged.iter().cloned() {
                session.register_new_file(record);
            }
            black_box(Allocator::new(template()).allocate(&mut session).unwrap());
        });
    });

    group.finish();
}

/// Benchmark summary aggregation
fn bench_summary(c: &mut Criterion) {
    let units = written_units(100_000);
    c.bench_function("summary_100k_files", |b| {
        b.iter(|| black_box(ArchiveSummary::from_units(&units)));
    });
}

criterion_group!(benches, bench_first_fit, bench_backfill, bench_summary);
criterion_main!(benches);
