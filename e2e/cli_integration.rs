//! E2E: the `qdda` binary as a black box.
//!
//! Exercises exit codes, store lifecycle and the report path through
//! `std::process::Command`. Stdin is nulled in every invocation; the binary
//! treats non-tty stdin as a pipe and scans it, which for the null device is
//! an empty stream.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use tempfile::TempDir;

fn qdda_bin() -> PathBuf {
    if let Ok(p) = std::env::var("CARGO_BIN_EXE_qdda") {
        return PathBuf::from(p);
    }
    let mut p = std::env::current_exe().unwrap();
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("qdda");
    p
}

fn run(args: &[&str]) -> std::process::Output {
    Command::new(qdda_bin())
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("qdda binary should run")
}

/// 2 MiB test file: first half zero blocks, second half a repeated pattern.
fn make_input(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("input.img");
    let mut data = vec![0u8; 1024 * 1024];
    let pattern: Vec<u8> = (0..16384u32).map(|i| (i % 7) as u8 + 1).collect();
    for _ in 0..64 {
        data.extend_from_slice(&pattern);
    }
    std::fs::write(&path, &data).unwrap();
    path
}

// ─────────────────────────────────────────────────────────────────────────────
// Version and usage
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn version_flag_exits_zero() {
    let out = run(&["--version"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("qdda"));
}

#[test]
fn list_shows_array_types() {
    let out = run(&["--list"]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("x1"));
    assert!(text.contains("vmax1"));
    assert!(text.contains("buckets"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Scan and report
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn scan_produces_store_and_report() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("scan.db");
    let input = make_input(&dir);

    let out = run(&[
        "-d",
        db.to_str().unwrap(),
        "-b",
        "0",
        input.to_str().unwrap(),
    ]);
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(db.exists());
    // merge deletes the staging file on success
    assert!(!dir.path().join("scan-staging.db").exists());

    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("deduplication ratio"));
    assert!(text.contains("free (zero)"));
    assert!(text.contains("blocks"));
}

#[test]
fn nomerge_retains_staging() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("scan.db");
    let input = make_input(&dir);

    let out = run(&[
        "-d",
        db.to_str().unwrap(),
        "-b",
        "0",
        "--nomerge",
        "-q",
        input.to_str().unwrap(),
    ]);
    assert!(out.status.success());
    assert!(dir.path().join("scan-staging.db").exists());
}

#[test]
fn quiet_scan_suppresses_chatter() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("scan.db");
    let input = make_input(&dir);

    let out = run(&[
        "-d",
        db.to_str().unwrap(),
        "-b",
        "0",
        "-q",
        input.to_str().unwrap(),
    ]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(!text.contains("Scanning"));
    assert!(!text.contains("deduplication ratio"));
}

#[test]
fn append_scan_keeps_existing_store() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("scan.db");
    let input = make_input(&dir);

    assert!(run(&["-d", db.to_str().unwrap(), "-b", "0", "-q", input.to_str().unwrap()])
        .status
        .success());
    let size_after_first = std::fs::metadata(&db).unwrap().len();
    assert!(size_after_first > 0);

    let out = run(&[
        "-d",
        db.to_str().unwrap(),
        "-b",
        "0",
        "-q",
        "-a",
        input.to_str().unwrap(),
    ]);
    assert!(out.status.success());
    assert!(db.exists());
}

#[test]
fn detail_report_shows_histograms() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("scan.db");
    let input = make_input(&dir);

    let out = run(&[
        "-d",
        db.to_str().unwrap(),
        "-b",
        "0",
        "-x",
        input.to_str().unwrap(),
    ]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("Dedupe histogram"));
    assert!(text.contains("Compression histogram"));
    assert!(text.contains("File list"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Store lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn delete_removes_the_store() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("gone.db");
    let input = make_input(&dir);
    assert!(run(&["-d", db.to_str().unwrap(), "-b", "0", "-q", input.to_str().unwrap()])
        .status
        .success());
    assert!(db.exists());

    let out = run(&["-d", db.to_str().unwrap(), "--delete", "-q"]);
    assert!(out.status.success());
    assert!(!db.exists());
}

#[test]
fn delete_refuses_non_store_files() {
    let dir = TempDir::new().unwrap();
    let fake = dir.path().join("precious.db");
    std::fs::write(&fake, b"definitely not a block index").unwrap();

    let out = run(&["-d", fake.to_str().unwrap(), "--delete", "-q"]);
    assert_eq!(out.status.code(), Some(10));
    assert!(fake.exists());
}

#[test]
fn device_store_path_is_refused() {
    let out = run(&["-d", "/dev/null", "--delete", "-q"]);
    assert_eq!(out.status.code(), Some(10));
}

#[test]
fn unknown_option_exits_fatal() {
    let out = run(&["--frobnicate"]);
    assert_eq!(out.status.code(), Some(10));
}

#[test]
fn bad_array_definition_exits_fatal() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("scan.db");
    let input = make_input(&dir);
    let out = run(&[
        "-d",
        db.to_str().unwrap(),
        "--array",
        "name=foo,bs=9999,buckets=8",
        "-q",
        input.to_str().unwrap(),
    ]);
    assert_eq!(out.status.code(), Some(10));
}

#[test]
fn unreadable_stream_exits_fatal_with_hint() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("scan.db");
    let out = run(&["-d", db.to_str().unwrap(), "-q", "/nonexistent/__qdda__.img"]);
    assert_eq!(out.status.code(), Some(10));
    assert!(String::from_utf8_lossy(&out.stderr).contains("setfacl"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Diagnostics
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn tophash_lists_reference_counts() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("scan.db");
    let input = make_input(&dir);
    assert!(run(&["-d", db.to_str().unwrap(), "-b", "0", "-q", input.to_str().unwrap()])
        .status
        .success());

    let out = run(&["-d", db.to_str().unwrap(), "-a", "-q", "--tophash", "3"]);
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let text = String::from_utf8_lossy(&out.stdout);
    // the 64-fold repeated pattern block dominates
    assert!(text.contains("64"));
}

#[test]
fn import_merges_peer_store() {
    let dir = TempDir::new().unwrap();
    let db_a = dir.path().join("a.db");
    let db_b = dir.path().join("b.db");
    let input = make_input(&dir);

    for db in [&db_a, &db_b] {
        assert!(run(&["-d", db.to_str().unwrap(), "-b", "0", "-q", input.to_str().unwrap()])
            .status
            .success());
    }
    let out = run(&[
        "-d",
        db_a.to_str().unwrap(),
        "-a",
        "-q",
        "--import",
        db_b.to_str().unwrap(),
    ]);
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}
