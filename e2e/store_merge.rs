//! E2E: merge and import semantics across stores.
//!
//! Covers the append-scan path, import equivalence with a single combined
//! scan, import associativity, and the refusal paths that must leave the
//! primary untouched.

use std::path::{Path, PathBuf};

use qdda::block::{hash_block, Method};
use qdda::ctx::Ctx;
use qdda::db::{staging_path, PrimaryDb, StagingDb};
use qdda::report::Reduction;
use qdda::scan::{analyze, PoolSizes, ScanConfig};
use qdda::stream::build_filelist;
use tempfile::TempDir;

const BS: usize = 16 * 1024;

fn make_store(path: &Path) -> PrimaryDb {
    PrimaryDb::create(path).unwrap();
    let db = PrimaryDb::open(path).unwrap();
    let buckets: Vec<u32> = (1..=14).chain([16]).collect();
    db.set_metadata("x2", 16, Method::Lz4, 1, &buckets).unwrap();
    db
}

fn scan_into(dbpath: &Path, db: &PrimaryDb, files: &[PathBuf]) {
    let ctx = Ctx::new(true);
    let cfg = ScanConfig {
        blocksize_kib: 16,
        method: Method::Lz4,
        interval: 1,
        bandwidth_mibps: 0,
        dryrun: false,
    };
    let args: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
    let list = build_filelist(&args, false).unwrap();
    analyze(dbpath, &list, cfg, PoolSizes::default(), &ctx).unwrap();
    let spath = staging_path(dbpath);
    db.merge_staging(&spath).unwrap();
    std::fs::remove_file(&spath).unwrap();
}

fn pattern_block(tag: u64) -> Vec<u8> {
    let mut b = vec![0u8; BS];
    b[0] = 1;
    b[1..9].copy_from_slice(&tag.to_le_bytes());
    for (j, byte) in b[9..].iter_mut().enumerate() {
        *byte = ((tag as usize * 31 + j) % 250) as u8;
    }
    b
}

fn write_file(path: &Path, tags: &[u64]) {
    let mut data = Vec::new();
    for &t in tags {
        data.extend_from_slice(&pattern_block(t));
    }
    std::fs::write(path, data).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Two scans with append accumulate into the same kv rows
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn append_scan_accumulates_counts() {
    let dir = TempDir::new().unwrap();
    let dbpath = dir.path().join("qdda.db");
    let db = make_store(&dbpath);

    let a = dir.path().join("a.img");
    let b = dir.path().join("b.img");
    write_file(&a, &vec![7; 32]); // 32 blocks of the same pattern
    write_file(&b, &vec![7; 32]);

    scan_into(&dbpath, &db, &[a]);
    scan_into(&dbpath, &db, &[b]);

    let hash = hash_block(&pattern_block(7));
    assert_eq!(db.kv_row(hash).unwrap().unwrap().0, 64);
    assert_eq!(Reduction::gather(&db).unwrap().total, 64);
}

// ─────────────────────────────────────────────────────────────────────────────
// Import equals scanning the same streams into one store
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn import_equals_combined_scan() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.img");
    let b = dir.path().join("b.img");
    write_file(&a, &[1, 2, 3, 3]);
    write_file(&b, &[3, 4, 4, 5]);

    // combined scan
    let combined_path = dir.path().join("combined.db");
    let combined = make_store(&combined_path);
    scan_into(&combined_path, &combined, &[a.clone(), b.clone()]);

    // separate scans + import
    let main_path = dir.path().join("main.db");
    let main = make_store(&main_path);
    scan_into(&main_path, &main, &[a]);
    let peer_path = dir.path().join("peer.db");
    {
        let peer = make_store(&peer_path);
        scan_into(&peer_path, &peer, &[b]);
    }
    main.import(&peer_path).unwrap();

    for tag in 1..=5u64 {
        let hash = hash_block(&pattern_block(tag));
        assert_eq!(
            combined.kv_row(hash).unwrap(),
            main.kv_row(hash).unwrap(),
            "kv row differs for tag {tag}"
        );
    }
    let rc = Reduction::gather(&combined).unwrap();
    let rm = Reduction::gather(&main).unwrap();
    assert_eq!(rc.total, rm.total);
    assert_eq!(rc.dedup, rm.dedup);
    assert_eq!(rc.allocated, rm.allocated);
}

// ─────────────────────────────────────────────────────────────────────────────
// Import order does not matter (up to file-row ordering)
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn import_is_order_independent() {
    let dir = TempDir::new().unwrap();
    let streams: Vec<PathBuf> = (0..3)
        .map(|i| {
            let p = dir.path().join(format!("s{i}.img"));
            write_file(&p, &[i as u64, 10 + i as u64, 99]);
            p
        })
        .collect();

    let mut stores = Vec::new();
    for (i, s) in streams.iter().enumerate() {
        let p = dir.path().join(format!("store{i}.db"));
        let db = make_store(&p);
        scan_into(&p, &db, std::slice::from_ref(s));
        drop(db);
        stores.push(p);
    }

    // A+B then C
    let ab_path = dir.path().join("ab.db");
    std::fs::copy(&stores[0], &ab_path).unwrap();
    let ab = PrimaryDb::open(&ab_path).unwrap();
    ab.import(&stores[1]).unwrap();
    ab.import(&stores[2]).unwrap();

    // A+C then B
    let ac_path = dir.path().join("ac.db");
    std::fs::copy(&stores[0], &ac_path).unwrap();
    let ac = PrimaryDb::open(&ac_path).unwrap();
    ac.import(&stores[2]).unwrap();
    ac.import(&stores[1]).unwrap();

    let shared = hash_block(&pattern_block(99));
    assert_eq!(ab.kv_row(shared).unwrap().unwrap().0, 3);
    assert_eq!(ac.kv_row(shared).unwrap().unwrap().0, 3);
    for tag in [0u64, 1, 2, 10, 11, 12] {
        let h = hash_block(&pattern_block(tag));
        assert_eq!(ab.kv_row(h).unwrap(), ac.kv_row(h).unwrap());
    }
    let rab = Reduction::gather(&ab).unwrap();
    let rac = Reduction::gather(&ac).unwrap();
    assert_eq!(rab.total, rac.total);
    assert_eq!(rab.dedup, rac.dedup);
}

// ─────────────────────────────────────────────────────────────────────────────
// Refusals must not mutate the primary
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn mismatched_blocksize_merge_leaves_primary_unchanged() {
    let dir = TempDir::new().unwrap();
    let dbpath = dir.path().join("qdda.db");
    let db = make_store(&dbpath);
    let f = dir.path().join("f.img");
    write_file(&f, &[1, 2]);
    scan_into(&dbpath, &db, &[f]);
    let before = Reduction::gather(&db).unwrap();

    // hand-build an 8 KiB staging store
    let alien = dir.path().join("alien-staging.db");
    StagingDb::create(&alien, 8).unwrap();
    let s = StagingDb::open(&alien).unwrap();
    s.insert_block(0xbad, Some(1000)).unwrap();
    drop(s);

    assert!(db.merge_staging(&alien).is_err());
    let after = Reduction::gather(&db).unwrap();
    assert_eq!(before.total, after.total);
    assert_eq!(before.dedup, after.dedup);
    assert!(db.kv_row(0xbad).unwrap().is_none());
}

#[test]
fn mismatched_blocksize_import_leaves_primary_unchanged() {
    let dir = TempDir::new().unwrap();
    let dbpath = dir.path().join("qdda.db");
    let db = make_store(&dbpath);

    let peer_path = dir.path().join("x1.db");
    PrimaryDb::create(&peer_path).unwrap();
    let peer = PrimaryDb::open(&peer_path).unwrap();
    peer.set_metadata("x1", 8, Method::Lz4, 1, &[2, 4, 8]).unwrap();
    drop(peer);

    assert!(db.import(&peer_path).is_err());
    assert_eq!(db.blocks_total().unwrap(), 0);
    assert_eq!(db.blocksize().unwrap(), 16);
}

// ─────────────────────────────────────────────────────────────────────────────
// File rows travel with merges and imports
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn file_rows_are_copied_on_merge_and_import() {
    let dir = TempDir::new().unwrap();
    let dbpath = dir.path().join("qdda.db");
    let db = make_store(&dbpath);
    let a = dir.path().join("a.img");
    write_file(&a, &[1, 2, 3]);
    scan_into(&dbpath, &db, &[a]);
    assert_eq!(db.files().unwrap().len(), 1);

    let peer_path = dir.path().join("peer.db");
    {
        let peer = make_store(&peer_path);
        let b = dir.path().join("b.img");
        write_file(&b, &[4]);
        scan_into(&peer_path, &peer, &[b]);
    }
    db.import(&peer_path).unwrap();
    let files = db.files().unwrap();
    assert_eq!(files.len(), 2);
    assert!(files.iter().any(|f| f.url.ends_with("a.img")));
    assert!(files.iter().any(|f| f.url.ends_with("b.img")));
}
