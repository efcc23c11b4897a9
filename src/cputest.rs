//! Synthetic single-thread throughput test (`--cputest`).
//!
//! Fills 1 GiB with compressible pseudo-random data, then times three passes
//! over it: hashing, compression probing, and staging inserts inside one
//! transaction. Gives a quick upper bound for what one core contributes to
//! scan throughput.

use std::io::Write;

use rand::Rng;

use crate::block::{compress_block, hash_block};
use crate::db::{delete_store, staging_path, PrimaryDb, StagingDb};
use crate::error::Result;
use crate::util::{Stopwatch, KIB, MIB};

const TEST_MIB: u64 = 1024;

fn show(label: &str, usec: u64, bufsize: u64, rows: u64) {
    println!(
        "{label:<13}{usec:>15} usec, {:>10.2} MB/s, {:>11.2} rows/s",
        bufsize as f64 / usec.max(1) as f64,
        rows as f64 * 1_000_000.0 / usec.max(1) as f64
    );
}

pub fn cputest(db: &PrimaryDb) -> Result<()> {
    let blocksize_kib = db.blocksize()? as u64;
    let blocksize = (blocksize_kib * KIB) as usize;
    let method = db.method()?;
    let rows = (TEST_MIB * KIB / blocksize_kib) as usize;
    let bufsize = (TEST_MIB * MIB) as usize;

    let spath = staging_path(db.path());
    if spath.exists() {
        delete_store(&spath)?;
    }
    StagingDb::create(&spath, blocksize_kib as u32)?;
    let staging = StagingDb::open(&spath)?;

    println!("*** Synthetic performance test, 1 thread ***");
    print!("Initializing: ");
    let _ = std::io::stdout().flush();
    let mut rng = rand::thread_rng();
    let mut testdata = vec![0u8; bufsize];
    for b in testdata.iter_mut() {
        // low-entropy bytes so the compressor has something to chew on
        *b = rng.gen_range(0..8);
    }
    println!(
        "{rows:>14} blocks, {blocksize_kib}k ({} MiB)",
        bufsize / MIB as usize
    );

    let mut hashes = vec![0u64; rows];
    let mut bytes = vec![0u32; rows];
    let mut sw = Stopwatch::new();

    for i in 0..rows {
        hashes[i] = hash_block(&testdata[i * blocksize..(i + 1) * blocksize]);
    }
    show("Hashing:", sw.lap(), bufsize as u64, rows as u64);

    sw.reset();
    for i in 0..rows {
        bytes[i] = compress_block(method, &testdata[i * blocksize..(i + 1) * blocksize]);
    }
    show("Compressing:", sw.lap(), bufsize as u64, rows as u64);

    sw.reset();
    staging.begin()?;
    for i in 0..rows {
        staging.insert_block(hashes[i], Some(bytes[i]))?;
    }
    staging.commit()?;
    show("DB insert:", sw.lap(), bufsize as u64, rows as u64);

    staging.remove()?;
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_survives_zero_duration() {
        show("Hashing:", 0, 1024, 1);
    }
}
