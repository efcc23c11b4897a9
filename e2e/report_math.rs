//! E2E: reduction math against hand-built observation sets.
//!
//! The staging rows are crafted directly so every histogram value is known
//! exactly, then checked against the report figures and the bucket
//! assignment rule.

use std::path::{Path, PathBuf};

use qdda::block::Method;
use qdda::db::{staging_path, PrimaryDb, StagingDb};
use qdda::report::Reduction;
use qdda::util::div_up;
use tempfile::TempDir;

fn store(dir: &TempDir, array: (&str, u32, &[u32])) -> (PathBuf, PrimaryDb) {
    let path = dir.path().join("qdda.db");
    PrimaryDb::create(&path).unwrap();
    let db = PrimaryDb::open(&path).unwrap();
    db.set_metadata(array.0, array.1, Method::Lz4, 1, array.2)
        .unwrap();
    (path, db)
}

fn merge_rows(dbpath: &Path, db: &PrimaryDb, blocksize: u32, rows: &[(u64, Option<u32>)]) {
    let spath = staging_path(dbpath);
    let _ = std::fs::remove_file(&spath);
    StagingDb::create(&spath, blocksize).unwrap();
    let s = StagingDb::open(&spath).unwrap();
    s.begin().unwrap();
    for &(h, b) in rows {
        s.insert_block(h, b).unwrap();
    }
    s.commit().unwrap();
    drop(s);
    db.merge_staging(&spath).unwrap();
    std::fs::remove_file(&spath).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Every histogram row lands in the smallest bucket that holds it
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn bucket_assignment_picks_smallest_fit() {
    let dir = TempDir::new().unwrap();
    let buckets = [2u32, 4, 8, 16];
    let (dbpath, db) = store(&dir, ("x2ish", 16, &buckets));

    // compressed sizes crossing every bucket boundary; hashes distinct
    let sizes_bytes = [100u32, 2048, 2049, 4096, 4097, 8192, 8193, 16384];
    let rows: Vec<(u64, Option<u32>)> = sizes_bytes
        .iter()
        .enumerate()
        .map(|(i, &b)| (i as u64 + 1, Some(b)))
        .collect();
    merge_rows(&dbpath, &db, 16, &rows);

    for row in db.compress_histogram().unwrap() {
        // the row's bucket is the smallest bucket >= any size class in it
        assert!(buckets.contains(&(row.size as u32)));
    }
    // size classes in KiB: 1,2,3,4,5,8,9,16 → buckets 2,2,4,4,8,8,16,16
    let hist = db.compress_histogram().unwrap();
    let by_bucket: Vec<(u64, u64)> = hist.iter().map(|r| (r.size, r.blocks)).collect();
    assert_eq!(by_bucket, vec![(2, 2), (4, 2), (8, 2), (16, 2)]);

    // allocation: ceil(2*2/16) + ceil(4*2/16) + ceil(8*2/16) + ceil(16*2/16)
    let expect: u64 = [2u64, 4, 8, 16].iter().map(|k| div_up(k * 2, 16)).sum();
    assert_eq!(db.allocated_blocks().unwrap(), expect);
}

// ─────────────────────────────────────────────────────────────────────────────
// Dedupe view totals equal the scanned block count
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn dedupe_view_covers_all_blocks() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = store(&dir, ("x2", 16, &[1, 2, 4, 8, 16]));
    let mut rows: Vec<(u64, Option<u32>)> = Vec::new();
    rows.extend((0..13).map(|_| (0u64, Some(0u32))));
    rows.extend((1..=9u64).map(|h| (h, Some(3000u32))));
    rows.extend((0..4).map(|_| (0xAAu64, Some(700u32))));
    rows.extend((0..2).map(|_| (0xBBu64, None)));
    merge_rows(&dbpath, &db, 16, &rows);

    let hist_total: u64 = db.dedupe_histogram().unwrap().iter().map(|r| r.blocks).sum();
    let r = Reduction::gather(&db).unwrap();
    assert_eq!(hist_total, r.total);
    assert_eq!(r.total, 13 + 9 + 4 + 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Ratio definitions
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn ratios_follow_their_definitions() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = store(&dir, ("x2", 16, &[1, 2, 4, 8, 16]));
    // 10 zero, 12 refs over 4 distinct hashes compressing to 4 KiB
    let mut rows: Vec<(u64, Option<u32>)> = Vec::new();
    rows.extend((0..10).map(|_| (0u64, Some(0u32))));
    for h in 1..=4u64 {
        for _ in 0..3 {
            rows.push((h, Some(4096)));
        }
    }
    merge_rows(&dbpath, &db, 16, &rows);

    let r = Reduction::gather(&db).unwrap();
    assert_eq!(r.total, 22);
    assert_eq!(r.free, 10);
    assert_eq!(r.used, 12);
    assert_eq!(r.dedup, 4);
    // 4 blocks at 4 KiB pack into ceil(4*4/16) = 1 blocksize unit
    assert_eq!(r.allocated, 1);
    assert_eq!(r.ratio_dedup, 3.0);
    assert_eq!(r.ratio_compr, 4.0);
    assert!((r.ratio_thin - 22.0 / 12.0).abs() < 1e-9);
    let combined = r.ratio_dedup * r.ratio_compr * r.ratio_thin;
    assert!((r.ratio_total - combined).abs() < 1e-9);

    // raw ratio weighs references, net ratio weighs distinct hashes
    // raw: (12 * 16384) / (12 * 4096) = 4.0
    // net: (4 * 16384) / (4 * 4096) = 4.0
    assert!((r.ratio_raw - 4.0).abs() < 1e-9);
    assert!((r.ratio_net - 4.0).abs() < 1e-9);
}

#[test]
fn incompressible_blocks_allocate_full_buckets() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = store(&dir, ("x2", 16, &[1, 2, 4, 8, 16]));
    let rows: Vec<(u64, Option<u32>)> =
        (1..=5u64).map(|h| (h, Some(16384u32))).collect();
    merge_rows(&dbpath, &db, 16, &rows);

    let r = Reduction::gather(&db).unwrap();
    assert_eq!(r.allocated, 5);
    assert_eq!(r.ratio_compr, 1.0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Safe division: an empty store yields all-zero ratios, not NaN or panic
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn empty_store_reports_zero_ratios() {
    let dir = TempDir::new().unwrap();
    let (_dbpath, db) = store(&dir, ("x2", 16, &[1, 2, 4, 8, 16]));
    let r = Reduction::gather(&db).unwrap();
    assert_eq!(r.ratio_dedup, 0.0);
    assert_eq!(r.ratio_compr, 0.0);
    assert_eq!(r.ratio_thin, 0.0);
    assert_eq!(r.ratio_total, 0.0);
    assert_eq!(r.sample_pct, 0.0);
    assert!(!r.ratio_total.is_nan());
}

// ─────────────────────────────────────────────────────────────────────────────
// Unsampled observations are excluded from compression but not dedupe
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn null_bytes_are_not_measured_but_still_deduped() {
    let dir = TempDir::new().unwrap();
    let (dbpath, db) = store(&dir, ("x2", 16, &[1, 2, 4, 8, 16]));
    let rows = vec![
        (1u64, Some(2048u32)),
        (2, None),
        (3, None),
        (4, Some(2048)),
    ];
    merge_rows(&dbpath, &db, 16, &rows);

    let r = Reduction::gather(&db).unwrap();
    assert_eq!(r.dedup, 4);
    assert_eq!(r.sample_pct, 50.0);
    // only measured blocks allocate buckets
    assert_eq!(db.allocated_blocks().unwrap(), 1); // ceil(2*2/16)
}
