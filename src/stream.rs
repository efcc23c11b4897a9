//! The list of streams to scan and the syntax that selects them.
//!
//! A stream argument is `name[:limit_mib[,repeat]]`. Three pseudo-names map
//! to synthetic streams with a 1 GiB default limit:
//!
//! - `zero`     → `/dev/zero`
//! - `random`   → `/dev/urandom`
//! - `compress` → `/dev/urandom` with a random-length zero prefix written
//!   over every block, giving controllable compressibility
//!
//! `repeat` pushes each read buffer through the ring that many times to
//! simulate duplicate data.
//!
//! Readers claim files through [`ScanFile::claim`]: the file handle is taken
//! out of its slot under a try-lock, so every stream is read end-to-end by
//! exactly one reader.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::util::{GIB, MIB};

/// Default byte limit for the synthetic pseudo-streams.
const SYNTHETIC_LIMIT: u64 = GIB;

#[derive(Debug)]
pub struct ScanFile {
    /// Resolved path recorded in the store's file table.
    pub name: String,
    /// Byte limit; 0 means read to EOF.
    pub limit: u64,
    /// Times each read buffer is pushed through the ring (≥ 1).
    pub repeat: u32,
    /// Overwrite a random-length zero prefix on every block after reading.
    pub zero_fill: bool,
    handle: Mutex<Option<File>>,
}

impl ScanFile {
    /// Parse a stream argument and open the underlying file read-only.
    pub fn open(arg: &str) -> Result<ScanFile> {
        let (name, limit_str) = match arg.split_once(':') {
            Some((n, rest)) => (n, rest),
            None => (arg, ""),
        };
        let (limit_str, repeat_str) = match limit_str.split_once(',') {
            Some((l, r)) => (l, r),
            None => (limit_str, ""),
        };

        let mut zero_fill = false;
        let mut limit = 0u64;
        let path = match name {
            "zero" => {
                limit = SYNTHETIC_LIMIT;
                PathBuf::from("/dev/zero")
            }
            "random" => {
                limit = SYNTHETIC_LIMIT;
                PathBuf::from("/dev/urandom")
            }
            "compress" => {
                zero_fill = true;
                limit = SYNTHETIC_LIMIT;
                PathBuf::from("/dev/urandom")
            }
            other => PathBuf::from(other),
        };

        if !limit_str.is_empty() {
            let mib: u64 = limit_str
                .parse()
                .map_err(|_| Error::usage(format!("bad stream limit '{limit_str}' in '{arg}'")))?;
            limit = mib * MIB;
        }
        let repeat: u32 = if repeat_str.is_empty() {
            1
        } else {
            repeat_str
                .parse::<u32>()
                .map_err(|_| Error::usage(format!("bad repeat count '{repeat_str}' in '{arg}'")))?
                .max(1)
        };

        let file = File::open(&path).map_err(|source| Error::StreamOpen {
            path: path.display().to_string(),
            source,
        })?;

        Ok(ScanFile {
            name: path.to_string_lossy().into_owned(),
            limit,
            repeat,
            zero_fill,
            handle: Mutex::new(Some(file)),
        })
    }

    /// Take the file handle if no other reader has claimed it yet.
    pub fn claim(&self) -> Option<File> {
        match self.handle.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        }
    }
}

/// Build the scan list from positional arguments, prepending stdin when the
/// process is fed through a pipe.
pub fn build_filelist(args: &[String], stdin_piped: bool) -> Result<Vec<ScanFile>> {
    let mut list = Vec::new();
    if stdin_piped {
        list.push(ScanFile::open("/dev/stdin")?);
    }
    for arg in args {
        list.push(ScanFile::open(arg)?);
    }
    Ok(list)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn plain_path_has_no_limit_or_repeat() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abc").unwrap();
        let sf = ScanFile::open(path.to_str().unwrap()).unwrap();
        assert_eq!(sf.limit, 0);
        assert_eq!(sf.repeat, 1);
        assert!(!sf.zero_fill);
    }

    #[test]
    fn limit_and_repeat_parse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abc").unwrap();
        let arg = format!("{}:100,3", path.display());
        let sf = ScanFile::open(&arg).unwrap();
        assert_eq!(sf.limit, 100 * MIB);
        assert_eq!(sf.repeat, 3);
    }

    #[test]
    fn zero_pseudo_stream_defaults_to_one_gib() {
        let sf = ScanFile::open("zero").unwrap();
        assert_eq!(sf.name, "/dev/zero");
        assert_eq!(sf.limit, 1024 * MIB);
    }

    #[test]
    fn compress_pseudo_stream_sets_zero_fill() {
        let sf = ScanFile::open("compress:16").unwrap();
        assert_eq!(sf.name, "/dev/urandom");
        assert!(sf.zero_fill);
        assert_eq!(sf.limit, 16 * MIB);
    }

    #[test]
    fn missing_file_carries_acl_hint() {
        let err = ScanFile::open("/nonexistent/__qdda_stream__").unwrap_err();
        assert!(err.to_string().contains("setfacl"));
    }

    #[test]
    fn bad_limit_is_a_usage_error() {
        assert!(ScanFile::open("zero:notanumber").is_err());
    }

    #[test]
    fn claim_hands_out_the_file_exactly_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"abc").unwrap();
        let sf = ScanFile::open(path.to_str().unwrap()).unwrap();
        assert!(sf.claim().is_some());
        assert!(sf.claim().is_none());
    }
}
