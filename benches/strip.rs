//! Criterion benchmarks for hrvstrip.
//!
//! These benchmarks invoke the binary as a subprocess over a generated mod
//! tree, so they include process startup, the directory walk and file I/O.
//! `--dry-run` keeps the tree identical between iterations.

use criterion::{Criterion, criterion_group, criterion_main};
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_hrvstrip");

/// One prototype with a low-res picture and its hr_version
fn prototype(index: usize) -> String {
    format!(
        r#"    {{
        type = "item",
        name = "widget-{index}",
        picture = {{
            filename = "__mod__/graphics/widget-{index}.png",
            width = 32,
            height = 32,
            hr_version = {{
                filename = "__mod__/graphics/hr-widget-{index}.png",
                width = 64,
                height = 64,
                scale = 0.5,
            }},
        }},
    }},
"#
    )
}

fn write_tree(root: &Path, files: usize, prototypes_per_file: usize) {
    for file in 0..files {
        let dir = root.join(format!("prototypes/group-{}", file % 8));
        fs::create_dir_all(&dir).expect("Failed to create bench directory");

        let mut content = String::from("data:extend({\n");
        for index in 0..prototypes_per_file {
            content.push_str(&prototype(index));
        }
        content.push_str("})\n");

        fs::write(dir.join(format!("items-{}.lua", file)), content)
            .expect("Failed to write bench file");
    }
}

fn run_dry(root: &Path) {
    Command::new(BIN)
        .args(["--no-config", "--dry-run", "--quiet"])
        .arg(root)
        .output()
        .expect("Failed to execute hrvstrip");
}

/// Benchmark a small mod: a handful of files
fn bench_small_tree(c: &mut Criterion) {
    let temp = TempDir::new().expect("Failed to create temp dir");
    write_tree(temp.path(), 4, 10);

    c.bench_function("small_tree", |b| b.iter(|| run_dry(temp.path())));
}

/// Benchmark a large mod: many files, many prototypes each
fn bench_large_tree(c: &mut Criterion) {
    let temp = TempDir::new().expect("Failed to create temp dir");
    write_tree(temp.path(), 64, 200);

    c.bench_function("large_tree", |b| b.iter(|| run_dry(temp.path())));
}

criterion_group!(benches, bench_small_tree, bench_large_tree);
criterion_main!(benches);
