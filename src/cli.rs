//! Command-line surface and array-definition parsing.
//!
//! The array definition selects the storage-array model being simulated:
//! either one of the predefined ids (`x1`, `x2`, `vmax1`) or a custom
//! definition of the form
//!
//! ```text
//! name=<id>,bs=<blocksize_kib>,buckets=<k1+k2+...>[,comp=<method>][,interval=<n>]
//! ```
//!
//! Bucket sizes are KiB, ascending, at most the blocksize. The definition
//! only takes effect on a store without metadata; an existing store keeps
//! its array.

use clap::Parser;

use crate::block::Method;
use crate::error::{Error, Result};

pub const DEFAULT_ARRAY: &str = "x2";
pub const DEFAULT_BANDWIDTH: u64 = 200;

#[derive(Parser, Debug)]
#[command(
    name = "qdda",
    version,
    about = "The Quick & Dirty Dedupe Analyzer",
    after_help = "Use for educational purposes only - actual array reduction results may vary"
)]
pub struct Cli {
    /// Database file path (default $HOME/qdda.db)
    #[arg(short = 'd', long = "db", value_name = "file")]
    pub db: Option<String>,

    /// Append data instead of deleting the database before the scan
    #[arg(short = 'a', long)]
    pub append: bool,

    /// Delete the database and exit
    #[arg(long)]
    pub delete: bool,

    /// Don't show progress indicator or intermediate results
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Throttle bandwidth in MiB/s (0 disables)
    #[arg(short = 'b', long, value_name = "mib/s", default_value_t = DEFAULT_BANDWIDTH)]
    pub bandwidth: u64,

    /// Array type or custom definition <x1|x2|vmax1|definition>
    #[arg(long, value_name = "id|def")]
    pub array: Option<String>,

    /// List supported array types and the custom definition syntax
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Detailed report (file list and dedupe/compression histograms)
    #[arg(short = 'x', long)]
    pub detail: bool,

    /// Scan without staging-store updates (pipeline exercise only)
    #[arg(short = 'n', long)]
    pub dryrun: bool,

    /// Reclaim unused space in the database
    #[arg(long)]
    pub purge: bool,

    /// Import another database (must have the same blocksize)
    #[arg(long, value_name = "file")]
    pub import: Option<String>,

    /// Single-thread CPU performance test
    #[arg(long)]
    pub cputest: bool,

    /// Skip staging merge and report, keep the staging database
    #[arg(long)]
    pub nomerge: bool,

    /// Enable debug output
    #[arg(long)]
    pub debug: bool,

    /// Show store queries as they execute
    #[arg(long)]
    pub queries: bool,

    /// Directory for temporary store files (sets SQLITE_TMPDIR)
    #[arg(long, value_name = "dir")]
    pub tmpdir: Option<String>,

    /// Number of worker threads (default: core count)
    #[arg(long, value_name = "n")]
    pub workers: Option<usize>,

    /// Maximum number of reader threads
    #[arg(long, value_name = "n")]
    pub readers: Option<usize>,

    /// Number of ring buffers (default: workers + readers + 32)
    #[arg(long, value_name = "n")]
    pub buffers: Option<usize>,

    /// Find blocks with this hash (hex) in the staging database
    #[arg(long, value_name = "hex")]
    pub findhash: Option<String>,

    /// Show the top <n> hashes by reference count
    #[arg(long, value_name = "n")]
    pub tophash: Option<u64>,

    /// Streams to scan (files, block devices, pipes)
    #[arg(value_name = "FILE")]
    pub files: Vec<String>,
}

/// A parsed array definition: blocksize, bucket list and scan parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayDef {
    pub id: String,
    pub blocksize_kib: u32,
    pub buckets: Vec<u32>,
    pub method: Method,
    pub interval: u32,
}

/// Resolve a predefined array id or parse a custom definition.
pub fn parse_array(s: &str) -> Result<ArrayDef> {
    match s {
        "x1" => Ok(ArrayDef {
            id: "x1".into(),
            blocksize_kib: 8,
            buckets: vec![2, 4, 8],
            method: Method::Lz4,
            interval: 1,
        }),
        "x2" => Ok(ArrayDef {
            id: "x2".into(),
            blocksize_kib: 16,
            buckets: (1..=14).chain([16]).collect(),
            method: Method::Lz4,
            interval: 1,
        }),
        "vmax1" => Ok(ArrayDef {
            id: "vmax1".into(),
            blocksize_kib: 128,
            buckets: (1..=16).map(|i| i * 8).collect(),
            method: Method::Deflate,
            interval: 1,
        }),
        custom if custom.contains('=') => parse_custom(custom),
        other => Err(Error::usage(format!(
            "unknown array '{other}' (try --list)"
        ))),
    }
}

fn parse_custom(s: &str) -> Result<ArrayDef> {
    let mut id = None;
    let mut blocksize = None;
    let mut buckets: Option<Vec<u32>> = None;
    let mut method = Method::Lz4;
    let mut interval = 1u32;

    for field in s.split(',') {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| Error::usage(format!("bad array field '{field}' in '{s}'")))?;
        match key {
            "name" => id = Some(value.to_owned()),
            "bs" => {
                blocksize = Some(value.parse::<u32>().map_err(|_| {
                    Error::usage(format!("bad blocksize '{value}' in '{s}'"))
                })?)
            }
            "buckets" => {
                let list = value
                    .split('+')
                    .map(|b| {
                        b.parse::<u32>()
                            .map_err(|_| Error::usage(format!("bad bucket size '{b}' in '{s}'")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                buckets = Some(list);
            }
            "comp" => method = value.parse()?,
            "interval" => {
                interval = value
                    .parse::<u32>()
                    .map_err(|_| Error::usage(format!("bad interval '{value}' in '{s}'")))?
                    .max(1)
            }
            other => {
                return Err(Error::usage(format!(
                    "unknown array field '{other}' in '{s}'"
                )))
            }
        }
    }

    let id = id.ok_or_else(|| Error::usage(format!("array definition needs name= in '{s}'")))?;
    let blocksize_kib =
        blocksize.ok_or_else(|| Error::usage(format!("array definition needs bs= in '{s}'")))?;
    let buckets =
        buckets.ok_or_else(|| Error::usage(format!("array definition needs buckets= in '{s}'")))?;

    if !(1..=128).contains(&blocksize_kib) {
        return Err(Error::usage(format!(
            "blocksize {blocksize_kib} KiB out of range (1..128)"
        )));
    }
    if buckets.is_empty() {
        return Err(Error::usage(format!("empty bucket list in '{s}'")));
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::usage(format!("bucket list must be ascending in '{s}'")));
    }
    if *buckets.last().unwrap() > blocksize_kib {
        return Err(Error::usage(format!(
            "bucket sizes must not exceed the blocksize in '{s}'"
        )));
    }

    Ok(ArrayDef {
        id,
        blocksize_kib,
        buckets,
        method,
        interval,
    })
}

/// The `--list` output.
pub fn show_array_list() {
    println!(
        "\narray options:\n\n  \
         --array x1    - XtremIO X1\n  \
         --array x2    - XtremIO X2\n  \
         --array vmax1 - VMAX All Flash (experimental)\n  \
         --array name=<name>,bs=<blocksize>,buckets=<bucketlist>\n\n  \
         blocksize in KiB between 1 and 128, buckets in KiB separated by +\n  \
         optional fields: comp=<none|lz4|deflate>, interval=<n>\n  \
         example: --array name=foo,bs=32,buckets=8+16+24+32"
    );
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_arrays() {
        let x1 = parse_array("x1").unwrap();
        assert_eq!(x1.blocksize_kib, 8);
        assert_eq!(x1.buckets, vec![2, 4, 8]);

        let x2 = parse_array("x2").unwrap();
        assert_eq!(x2.blocksize_kib, 16);
        assert_eq!(
            x2.buckets,
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 16]
        );
        assert_eq!(x2.method, Method::Lz4);

        let vmax = parse_array("vmax1").unwrap();
        assert_eq!(vmax.blocksize_kib, 128);
        assert_eq!(vmax.buckets.first(), Some(&8));
        assert_eq!(vmax.buckets.last(), Some(&128));
        assert_eq!(vmax.buckets.len(), 16);
        assert_eq!(vmax.method, Method::Deflate);
    }

    #[test]
    fn custom_definition() {
        let def = parse_array("name=foo,bs=32,buckets=8+16+24+32").unwrap();
        assert_eq!(def.id, "foo");
        assert_eq!(def.blocksize_kib, 32);
        assert_eq!(def.buckets, vec![8, 16, 24, 32]);
        assert_eq!(def.method, Method::Lz4);
        assert_eq!(def.interval, 1);
    }

    #[test]
    fn custom_definition_with_optional_fields() {
        let def =
            parse_array("name=foo,bs=64,buckets=16+32+64,comp=deflate,interval=10").unwrap();
        assert_eq!(def.method, Method::Deflate);
        assert_eq!(def.interval, 10);
    }

    #[test]
    fn custom_definition_rejects_bad_input() {
        assert!(parse_array("unknown").is_err());
        assert!(parse_array("name=foo,bs=256,buckets=8").is_err()); // blocksize range
        assert!(parse_array("name=foo,bs=16,buckets=8+4").is_err()); // not ascending
        assert!(parse_array("name=foo,bs=16,buckets=8+32").is_err()); // bucket > blocksize
        assert!(parse_array("name=foo,bs=16").is_err()); // missing buckets
        assert!(parse_array("bs=16,buckets=8").is_err()); // missing name
        assert!(parse_array("name=foo,bs=16,buckets=8,comp=zstd").is_err());
    }

    #[test]
    fn cli_parses_typical_invocations() {
        let cli = Cli::parse_from(["qdda", "-d", "/tmp/x.db", "-b", "0", "a.img", "b.img"]);
        assert_eq!(cli.db.as_deref(), Some("/tmp/x.db"));
        assert_eq!(cli.bandwidth, 0);
        assert_eq!(cli.files, vec!["a.img", "b.img"]);

        let cli = Cli::parse_from(["qdda", "--append", "-x", "--nomerge"]);
        assert!(cli.append && cli.detail && cli.nomerge);

        let cli = Cli::parse_from(["qdda"]);
        assert_eq!(cli.bandwidth, DEFAULT_BANDWIDTH);
        assert!(cli.files.is_empty());
    }
}
