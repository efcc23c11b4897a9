//! Binary entry point for the `qdda` command-line tool.
//!
//! Dispatch order after parsing: delete, scan, then exactly one of purge /
//! import / cputest / findhash / tophash, and otherwise the default
//! merge-and-report path. A scan followed by `--nomerge` leaves the staging
//! store in place for later inspection or a manual merge.

use std::io::{IsTerminal, Write};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use log::debug;

use qdda::cli::{parse_array, show_array_list, Cli, DEFAULT_ARRAY};
use qdda::cputest::cputest;
use qdda::ctx::Ctx;
use qdda::db::{
    delete_store, is_store_file, sanitize_store_path, staging_path, PrimaryDb, StagingDb,
};
use qdda::error::{Error, Result};
use qdda::report;
use qdda::scan::{analyze, PoolSizes, ScanConfig};
use qdda::stream::build_filelist;
use qdda::util::Stopwatch;

fn main() -> ExitCode {
    // usage failures exit 10 like every other fatal error; help and version
    // remain exit 0
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let code = match e.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
            _ => qdda::error::EXIT_FATAL,
        };
        let _ = e.print();
        std::process::exit(code);
    });

    let mut logger = env_logger::Builder::from_default_env();
    if cli.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("qdda: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if !cli.quiet {
        println!("qdda {} - The Quick & Dirty Dedupe Analyzer", qdda::VERSION);
    }
    if cli.list {
        show_array_list();
        return Ok(());
    }
    if let Some(dir) = &cli.tmpdir {
        std::env::set_var("SQLITE_TMPDIR", dir);
    }

    let dbpath = sanitize_store_path(cli.db.as_deref().unwrap_or(""))?;
    let spath = staging_path(&dbpath);

    if cli.delete {
        if !cli.quiet {
            println!("Deleting database {}", dbpath.display());
        }
        delete_store(&dbpath)?;
        return Ok(());
    }

    let ctx = Ctx::new(cli.quiet);

    // stdin joins the scan when it is fed through a pipe
    let stdin_piped = !std::io::stdin().is_terminal();
    let files = if !cli.files.is_empty() || stdin_piped {
        build_filelist(&cli.files, stdin_piped)?
    } else {
        Vec::new()
    };

    // a fresh scan or cputest replaces the store unless --append is given
    if (!files.is_empty() || cli.cputest) && !cli.append && dbpath.exists() {
        if !cli.quiet {
            println!("Creating new database {}", dbpath.display());
        }
        delete_store(&dbpath)?;
    }
    if !dbpath.exists() {
        PrimaryDb::create(&dbpath)?;
    }
    let mut db = PrimaryDb::open(&dbpath)?;
    if cli.queries {
        db.trace();
    }

    let array = parse_array(cli.array.as_deref().unwrap_or(DEFAULT_ARRAY))?;
    db.set_metadata(
        &array.id,
        array.blocksize_kib,
        array.method,
        array.interval,
        &array.buckets,
    )?;

    if !files.is_empty() {
        let cfg = ScanConfig {
            blocksize_kib: db.blocksize()?,
            method: db.method()?,
            interval: db.interval()?,
            bandwidth_mibps: cli.bandwidth,
            dryrun: cli.dryrun,
        };
        let pools = PoolSizes {
            workers: cli.workers.unwrap_or(0),
            readers: cli.readers.unwrap_or(0),
            buffers: cli.buffers.unwrap_or(0),
        };
        analyze(&dbpath, &files, cfg, pools, &ctx)?;
    }

    if cli.purge {
        db.vacuum()?;
    } else if let Some(peer) = &cli.import {
        import(&db, Path::new(peer), cli.quiet)?;
    } else if cli.cputest {
        cputest(&db)?;
    } else if let Some(hex) = &cli.findhash {
        find_hash(&spath, hex)?;
    } else if let Some(n) = cli.tophash {
        top_hash(&db, n)?;
    } else {
        if !cli.nomerge {
            merge(&db, &spath, cli.quiet)?;
        }
        if cli.detail {
            report::report_detail(&db)?;
        } else if !cli.nomerge && !cli.quiet {
            report::report(&db)?;
        }
    }
    Ok(())
}

/// Fold the staging store into the primary, with a timing line, then delete
/// the staging file. Nothing happens if no staging store exists.
fn merge(db: &PrimaryDb, staging: &Path, quiet: bool) -> Result<()> {
    if !staging.exists() || !is_store_file(staging) {
        return Ok(());
    }
    let rows = StagingDb::open(staging)?.rows()?;
    let blocksize = db.blocksize()? as u64;
    let dbrows = db.rows()?;

    if rows > 0 {
        let mib_staging = rows * blocksize / 1024;
        let mib_database = dbrows * blocksize / 1024;
        if !quiet {
            print!(
                "Merging {rows} blocks ({mib_staging} MiB) with {dbrows} blocks ({mib_database} MiB)"
            );
            let _ = std::io::stdout().flush();
        }
        let mut sw = Stopwatch::new();
        db.merge_staging(staging)?;
        let usec = sw.lap().max(1);
        if !quiet {
            let rps = (rows + dbrows) * 1_000_000 / usec;
            let mbps = (mib_staging + mib_database) * 1_000_000 / usec;
            println!(" in {} sec ({rps} blocks/s, {mbps} MiB/s)", sw.seconds());
        }
    } else {
        db.merge_staging(staging)?;
    }
    delete_store(staging)?;
    Ok(())
}

/// Fold another primary store into this one (`--import`).
fn import(db: &PrimaryDb, peer: &Path, quiet: bool) -> Result<()> {
    let peer_rows = PrimaryDb::open(peer)?.rows()?;
    if !quiet {
        println!(
            "Adding {} blocks from {} to {} existing blocks",
            peer_rows,
            peer.display(),
            db.rows()?
        );
    }
    db.import(peer)
}

/// Show all staging occurrences of one hash (`--findhash`).
fn find_hash(staging: &Path, hex: &str) -> Result<()> {
    let hash = u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|_| Error::usage(format!("bad hash '{hex}' (expected hex)")))?;
    if !staging.exists() {
        return Err(Error::Store(format!(
            "no staging database at {}",
            staging.display()
        )));
    }
    let sdb = StagingDb::open(staging)?;
    println!("{:<20}{:<20}{:>10}", "hexhash", "offset", "bytes");
    for (hexhash, offset, bytes) in sdb.find_hash(hash)? {
        println!("{hexhash:<20}{offset:<20}{bytes:>10}");
    }
    Ok(())
}

/// Show the most-referenced hashes (`--tophash`).
fn top_hash(db: &PrimaryDb, n: u64) -> Result<()> {
    debug!("tophash over {} kv rows", db.rows()?);
    println!("{:<20}{:>10}", "hash", "blocks");
    for (hash, blocks) in db.top_hash(n)? {
        println!("{hash:<#20x}{blocks:>10}");
    }
    Ok(())
}
