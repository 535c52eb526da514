use criterion::{black_box, criterion_group, criterion_main, Criterion};
use firesync_lib::storage::glob::GlobPattern;
use firesync_lib::FileKeyMapper;
use std::path::{Path, PathBuf};

fn sample_paths(count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| PathBuf::from(format!("data/section-{}/entry-{}.json", i % 16, i)))
        .collect()
}

fn bench_mapper_build(c: &mut Criterion) {
    let paths = sample_paths(10_000);
    c.bench_function("mapper_build_10k", |b| {
        b.iter(|| FileKeyMapper::build(black_box(paths.clone())))
    });
}

fn bench_glob_match(c: &mut Criterion) {
    let pattern = GlobPattern::new("./data/**/*.{json,md}").expect("valid pattern");
    let paths = sample_paths(1_000);
    c.bench_function("glob_match_1k", |b| {
        b.iter(|| {
            paths
                .iter()
                .filter(|p| pattern.is_match(black_box(p.as_path())))
                .count()
        })
    });
    c.bench_function("glob_miss", |b| {
        b.iter(|| pattern.is_match(black_box(Path::new("other/entry.txt"))))
    });
}

criterion_group!(benches, bench_mapper_build, bench_glob_match);
criterion_main!(benches);
