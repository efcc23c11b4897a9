//! Per-block primitives: the zero-aware 60-bit content hash and the bounded
//! compressed-size probe.
//!
//! The store keys blocks by a signed 64-bit integer, so the MD5 digest is
//! folded to 60 bits: the low nibble of digest byte 8 becomes the top 4 bits
//! and bytes 9..15 the low 56. 60 bits keeps the collision probability under
//! 50% up to roughly 1.2e9 blocks while staying positive as an SQLite
//! integer. Hash 0 is reserved for all-zero blocks.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use flate2::write::DeflateEncoder;
use flate2::Compression;
use md5::{Digest, Md5};

use crate::error::Error;

/// Compression method used to probe per-block compressed sizes. Selected
/// once per scan from the store metadata and branched per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    None,
    Lz4,
    Deflate,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Lz4 => "lz4",
            Method::Deflate => "deflate",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "none" => Ok(Method::None),
            "lz4" => Ok(Method::Lz4),
            "deflate" => Ok(Method::Deflate),
            other => Err(Error::usage(format!(
                "unknown compression method '{other}' (expected none, lz4 or deflate)"
            ))),
        }
    }
}

/// Hash one block. Returns 0 if the block is all zeroes, otherwise the MD5
/// digest folded to 60 bits.
pub fn hash_block(buf: &[u8]) -> u64 {
    if buf.iter().all(|&b| b == 0) {
        return 0;
    }
    let d = Md5::digest(buf);
    ((d[8] & 0x0F) as u64) << 56
        | (d[9] as u64) << 48
        | (d[10] as u64) << 40
        | (d[11] as u64) << 32
        | (d[12] as u64) << 24
        | (d[13] as u64) << 16
        | (d[14] as u64) << 8
        | (d[15] as u64)
}

/// Compressed size of one block under `method`, capped at the block length.
/// A block whose compressed form would not be smaller than the original is
/// deemed incompressible and reported at full size.
pub fn compress_block(method: Method, buf: &[u8]) -> u32 {
    let len = buf.len() as u32;
    let compressed = match method {
        Method::None => return len,
        Method::Lz4 => lz4::block::compress(buf, None, false)
            .map(|v| v.len() as u32)
            .unwrap_or(len),
        Method::Deflate => {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::fast());
            let written = enc.write_all(buf).is_ok();
            match enc.finish() {
                Ok(v) if written => v.len() as u32,
                _ => len,
            }
        }
    };
    compressed.min(len)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_block_hashes_to_zero() {
        assert_eq!(hash_block(&[0u8; 4096]), 0);
        assert_eq!(hash_block(&[0u8; 1]), 0);
    }

    #[test]
    fn nonzero_block_never_hashes_to_zero() {
        let mut buf = vec![0u8; 4096];
        buf[4095] = 1;
        assert_ne!(hash_block(&buf), 0);
    }

    #[test]
    fn hash_is_deterministic() {
        let buf: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(hash_block(&buf), hash_block(&buf));
    }

    #[test]
    fn hash_fits_in_60_bits() {
        for seed in 0u8..32 {
            let buf = vec![seed + 1; 8192];
            assert!(hash_block(&buf) < 1u64 << 60);
        }
    }

    #[test]
    fn hash_differs_per_content() {
        let a = vec![1u8; 8192];
        let b = vec![2u8; 8192];
        assert_ne!(hash_block(&a), hash_block(&b));
    }

    #[test]
    fn compress_never_exceeds_input_length() {
        let random: Vec<u8> = {
            // xorshift fill; incompressible enough to hit the cap
            let mut x = 0x243f_6a88_85a3_08d3u64;
            (0..16384)
                .map(|_| {
                    x ^= x << 13;
                    x ^= x >> 7;
                    x ^= x << 17;
                    x as u8
                })
                .collect()
        };
        for method in [Method::None, Method::Lz4, Method::Deflate] {
            assert!(compress_block(method, &random) <= random.len() as u32);
        }
    }

    #[test]
    fn compressible_data_shrinks() {
        let buf = vec![b'A'; 16384];
        assert!(compress_block(Method::Lz4, &buf) < 16384);
        assert!(compress_block(Method::Deflate, &buf) < 16384);
    }

    #[test]
    fn method_none_reports_full_size() {
        let buf = vec![b'A'; 16384];
        assert_eq!(compress_block(Method::None, &buf), 16384);
    }

    #[test]
    fn method_parses_and_prints() {
        assert_eq!("lz4".parse::<Method>().unwrap(), Method::Lz4);
        assert_eq!("deflate".parse::<Method>().unwrap(), Method::Deflate);
        assert_eq!("none".parse::<Method>().unwrap(), Method::None);
        assert!("gzip".parse::<Method>().is_err());
        assert_eq!(Method::Lz4.to_string(), "lz4");
    }
}
