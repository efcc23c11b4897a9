//! E2E: full scan pipeline over real temp files.
//!
//! Each test builds a primary store, scans crafted streams through the
//! reader/worker/updater pipeline, merges, and checks the aggregated kv
//! table and reduction figures.

use std::path::{Path, PathBuf};

use qdda::block::{hash_block, Method};
use qdda::ctx::Ctx;
use qdda::db::{staging_path, PrimaryDb};
use qdda::report::Reduction;
use qdda::scan::{analyze, PoolSizes, ScanConfig};
use qdda::stream::{build_filelist, ScanFile};
use tempfile::TempDir;

const BS: usize = 16 * 1024;

fn make_store(dir: &TempDir) -> (PathBuf, PrimaryDb) {
    let path = dir.path().join("qdda.db");
    PrimaryDb::create(&path).unwrap();
    let db = PrimaryDb::open(&path).unwrap();
    let buckets: Vec<u32> = (1..=14).chain([16]).collect();
    db.set_metadata("x2", 16, Method::Lz4, 1, &buckets).unwrap();
    (path, db)
}

fn scan(dbpath: &Path, db: &PrimaryDb, files: Vec<ScanFile>) {
    let ctx = Ctx::new(true);
    let cfg = ScanConfig {
        blocksize_kib: 16,
        method: Method::Lz4,
        interval: 1,
        bandwidth_mibps: 0,
        dryrun: false,
    };
    analyze(dbpath, &files, cfg, PoolSizes::default(), &ctx).unwrap();
    let spath = staging_path(dbpath);
    db.merge_staging(&spath).unwrap();
    std::fs::remove_file(&spath).unwrap();
}

/// A file of `n` blocks, each produced by the closure.
fn write_blocks(path: &Path, n: usize, mut block: impl FnMut(usize) -> Vec<u8>) {
    let mut data = Vec::with_capacity(n * BS);
    for i in 0..n {
        let b = block(i);
        assert_eq!(b.len(), BS);
        data.extend_from_slice(&b);
    }
    std::fs::write(path, data).unwrap();
}

fn unique_block(i: usize) -> Vec<u8> {
    let mut b = vec![0u8; BS];
    b[0] = 1; // never all-zero
    b[1..9].copy_from_slice(&(i as u64).to_le_bytes());
    for (j, byte) in b[9..].iter_mut().enumerate() {
        *byte = ((i * 131 + j * 17) % 251) as u8;
    }
    b
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: 1 MiB of zeroes → a single zero-bucket kv row
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn all_zero_stream_lands_in_the_zero_bucket() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = make_store(&dir);
    let f = dir.path().join("zeros.img");
    write_blocks(&f, 64, |_| vec![0u8; BS]);

    scan(&dbpath, &db, build_filelist(&[f.display().to_string()], false).unwrap());

    assert_eq!(db.kv_row(0).unwrap().unwrap(), (64, Some(0)));
    assert_eq!(db.rows().unwrap(), 1);
    let r = Reduction::gather(&db).unwrap();
    assert_eq!(r.total, 64);
    assert_eq!(r.free, 64);
    assert_eq!(r.used, 0);
    assert_eq!(r.dedup, 0);
    assert_eq!(r.allocated, 0);
    assert_eq!(r.ratio_total, 0.0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: 64 distinct blocks → dedupe ratio 1
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn unique_blocks_have_dedup_ratio_one() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = make_store(&dir);
    let f = dir.path().join("unique.img");
    write_blocks(&f, 64, unique_block);

    scan(&dbpath, &db, build_filelist(&[f.display().to_string()], false).unwrap());

    let r = Reduction::gather(&db).unwrap();
    assert_eq!(r.total, 64);
    assert_eq!(r.dedup, 64);
    assert_eq!(r.unique, 64);
    assert_eq!(r.ratio_dedup, 1.0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: one block written 100 times → one kv row with blocks=100
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn duplicate_stream_collapses_to_one_row() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = make_store(&dir);
    let content = unique_block(42);
    let f = dir.path().join("dup.img");
    write_blocks(&f, 100, |_| content.clone());

    scan(&dbpath, &db, build_filelist(&[f.display().to_string()], false).unwrap());

    let hash = hash_block(&content);
    let (blocks, bytes) = db.kv_row(hash).unwrap().unwrap();
    assert_eq!(blocks, 100);
    assert!(bytes.is_some());
    let r = Reduction::gather(&db).unwrap();
    assert_eq!(r.ratio_dedup, 100.0);
    assert_eq!(r.ratio_thin, 1.0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: 32 zero + 16 unique + 16 duplicates of one block
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn mixed_stream_figures() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = make_store(&dir);
    let dup = unique_block(9999);
    let f = dir.path().join("mixed.img");
    write_blocks(&f, 64, |i| {
        if i < 32 {
            vec![0u8; BS]
        } else if i < 48 {
            unique_block(i)
        } else {
            dup.clone()
        }
    });

    scan(&dbpath, &db, build_filelist(&[f.display().to_string()], false).unwrap());

    let r = Reduction::gather(&db).unwrap();
    assert_eq!(r.free, 32);
    assert_eq!(r.used, 32);
    assert_eq!(r.dedup, 17);
    assert_eq!(r.unique, 16);
    assert_eq!(r.nonunique, 16);
}

// ─────────────────────────────────────────────────────────────────────────────
// Property: scan order does not change the kv table
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn file_order_does_not_change_results() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.img");
    let b = dir.path().join("b.img");
    write_blocks(&a, 16, unique_block);
    write_blocks(&b, 16, |i| unique_block(i + 8)); // overlaps a by 8 blocks

    let mut results = Vec::new();
    for order in [[&a, &b], [&b, &a]] {
        let sub = TempDir::new().unwrap();
        let (dbpath, db) = make_store(&sub);
        let args: Vec<String> = order.iter().map(|p| p.display().to_string()).collect();
        scan(&dbpath, &db, build_filelist(&args, false).unwrap());
        let r = Reduction::gather(&db).unwrap();
        let (shared_refs, _) = db.kv_row(hash_block(&unique_block(10))).unwrap().unwrap();
        results.push((r.total, r.dedup, r.unique, r.nonunique, shared_refs));
    }
    assert_eq!(results[0], results[1]);
    // 8 overlapping hashes counted twice
    assert_eq!(results[0].0, 32);
    assert_eq!(results[0].1, 24);
    assert_eq!(results[0].4, 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Property: the repeat syntax multiplies block counts
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn repeat_syntax_multiplies_reference_counts() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = make_store(&dir);
    let f = dir.path().join("rep.img");
    write_blocks(&f, 8, unique_block);

    let arg = format!("{}:,3", f.display());
    scan(&dbpath, &db, build_filelist(&[arg], false).unwrap());

    for i in 0..8 {
        let hash = hash_block(&unique_block(i));
        assert_eq!(db.kv_row(hash).unwrap().unwrap().0, 3);
    }
    assert_eq!(Reduction::gather(&db).unwrap().total, 24);
}

// ─────────────────────────────────────────────────────────────────────────────
// Property: rescanning the same stream scales counts linearly
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn rescan_scales_counts_linearly() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = make_store(&dir);
    let f = dir.path().join("lin.img");
    write_blocks(&f, 8, unique_block);

    for _ in 0..3 {
        scan(&dbpath, &db, build_filelist(&[f.display().to_string()], false).unwrap());
    }
    for i in 0..8 {
        let hash = hash_block(&unique_block(i));
        assert_eq!(db.kv_row(hash).unwrap().unwrap().0, 3);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Partial tail blocks are zero-padded and counted
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn partial_tail_block_counts_as_one() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = make_store(&dir);
    let f = dir.path().join("tail.img");
    // 2 full blocks plus 100 bytes
    let mut data = Vec::new();
    data.extend_from_slice(&unique_block(0));
    data.extend_from_slice(&unique_block(1));
    data.extend_from_slice(&[0xAAu8; 100]);
    std::fs::write(&f, &data).unwrap();

    scan(&dbpath, &db, build_filelist(&[f.display().to_string()], false).unwrap());

    assert_eq!(Reduction::gather(&db).unwrap().total, 3);
    // the padded tail equals 100 bytes of 0xAA followed by zeroes
    let mut tail = vec![0u8; BS];
    tail[..100].fill(0xAA);
    assert_eq!(db.kv_row(hash_block(&tail)).unwrap().unwrap().0, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Interrupt: an aborted scan leaves no staging file and an empty primary
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn aborted_scan_discards_staging() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = make_store(&dir);
    let f = dir.path().join("big.img");
    write_blocks(&f, 64, unique_block);

    let ctx = Ctx::new(true);
    ctx.raise_abort();
    let cfg = ScanConfig {
        blocksize_kib: 16,
        method: Method::Lz4,
        interval: 1,
        bandwidth_mibps: 0,
        dryrun: false,
    };
    let files = build_filelist(&[f.display().to_string()], false).unwrap();
    let err = analyze(&dbpath, &files, cfg, PoolSizes::default(), &ctx).unwrap_err();
    assert!(matches!(err, qdda::Error::Interrupted));
    assert_eq!(err.exit_code(), 1);

    assert!(!staging_path(&dbpath).exists());
    assert_eq!(db.rows().unwrap(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Dryrun: the pipeline runs but nothing reaches the staging table
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn dryrun_keeps_staging_empty() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = make_store(&dir);
    let f = dir.path().join("dry.img");
    write_blocks(&f, 16, unique_block);

    let ctx = Ctx::new(true);
    let cfg = ScanConfig {
        blocksize_kib: 16,
        method: Method::Lz4,
        interval: 1,
        bandwidth_mibps: 0,
        dryrun: true,
    };
    let files = build_filelist(&[f.display().to_string()], false).unwrap();
    analyze(&dbpath, &files, cfg, PoolSizes::default(), &ctx).unwrap();

    let spath = staging_path(&dbpath);
    db.merge_staging(&spath).unwrap();
    assert_eq!(db.blocks_total().unwrap(), 0);
    let _ = std::fs::remove_file(&spath);
}

// ─────────────────────────────────────────────────────────────────────────────
// Sampling: interval > 1 leaves some blocks unmeasured but counts them all
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn sampling_interval_leaves_nulls_but_counts_blocks() {
    let dir = TempDir::new().unwrap();
    let dbpath = dir.path().join("qdda.db");
    PrimaryDb::create(&dbpath).unwrap();
    let db = PrimaryDb::open(&dbpath).unwrap();
    db.set_metadata("sampled", 16, Method::Lz4, 1000, &[4, 8, 16])
        .unwrap();
    let f = dir.path().join("s.img");
    write_blocks(&f, 64, unique_block);

    let ctx = Ctx::new(true);
    let cfg = ScanConfig {
        blocksize_kib: 16,
        method: Method::Lz4,
        interval: 1000,
        bandwidth_mibps: 0,
        dryrun: false,
    };
    let files = build_filelist(&[f.display().to_string()], false).unwrap();
    analyze(&dbpath, &files, cfg, PoolSizes::default(), &ctx).unwrap();
    let spath = staging_path(&dbpath);
    db.merge_staging(&spath).unwrap();
    std::fs::remove_file(&spath).unwrap();

    let r = Reduction::gather(&db).unwrap();
    assert_eq!(r.total, 64);
    assert_eq!(r.dedup, 64);
    // with a 1/1000 predicate, 64 blocks are (almost surely) not all sampled
    assert!(r.sample_pct < 100.0);
}
