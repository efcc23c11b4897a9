//! The concurrent scan pipeline: reader threads fill ring-buffer slots from
//! the streams, worker threads hash and compression-probe each block, and a
//! single updater thread drains the results into the staging store inside
//! one transaction.
//!
//! Join order matters: readers first, then the ring is marked done so the
//! workers drain the remaining slots, then the updater. Within one slot the
//! read → process → persist order is enforced by the slot mutex; across
//! slots and files ordering is free, which is sound because the merge step
//! is a commutative group-by-sum over hashes.

use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use log::{debug, error};
use rand::Rng;

use crate::block::{compress_block, hash_block, Method};
use crate::ctx::Ctx;
use crate::db::{delete_store, staging_path, StagingDb};
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::ring::{Acquire, RingBuffer};
use crate::stream::ScanFile;
use crate::throttle::Throttle;
use crate::util::{Stopwatch, KIB, MIB};

/// Slots beyond the thread count, so readers stay ahead of a bursty updater.
const EXTRA_BUFFERS: usize = 32;
/// Hard cap on reader threads.
pub const MAX_READERS: usize = 32;
/// Bytes read from a stream per I/O cycle.
const CYCLE_BYTES: usize = MIB as usize;

/// One I/O cycle of block data plus the per-block result arrays filled by
/// the workers.
pub struct DataBuffer {
    pub buf: Vec<u8>,
    /// Blocks occupied by the current cycle.
    pub used: usize,
    pub hashes: Vec<u64>,
    /// Compressed size per block; `None` when the sampling predicate
    /// skipped the block.
    pub cbytes: Vec<Option<u32>>,
    /// Lifetime accounting for the debug summary.
    pub blockcount: u64,
    pub bytes: u64,
}

impl DataBuffer {
    fn new(blocksize: usize, blocks_per_cycle: usize) -> Self {
        DataBuffer {
            buf: vec![0u8; blocksize * blocks_per_cycle],
            used: 0,
            hashes: vec![0; blocks_per_cycle],
            cbytes: vec![None; blocks_per_cycle],
            blockcount: 0,
            bytes: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    blocks: u64,
    bytes: u64,
}

/// Everything the pipeline threads share. The staging store sits behind a
/// mutex because its connection is single-threaded; the updater and the
/// readers' file-row inserts serialize on it.
struct Shared {
    ring: RingBuffer,
    buffers: Vec<Mutex<DataBuffer>>,
    blocksize: usize,
    blocks_per_cycle: usize,
    method: Method,
    interval: u32,
    dryrun: bool,
    throttle: Throttle,
    counters: Mutex<Counters>,
    progress: Mutex<Progress>,
    staging: Mutex<StagingDb>,
}

/// Pool-size overrides from the command line; 0 selects the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolSizes {
    pub workers: usize,
    pub readers: usize,
    pub buffers: usize,
}

/// Scan configuration resolved from the primary store metadata.
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    pub blocksize_kib: u32,
    pub method: Method,
    pub interval: u32,
    pub bandwidth_mibps: u64,
    pub dryrun: bool,
}

// ─── Reader ───────────────────────────────────────────────────────────────────

/// Fill one block cycle from `file`, capped at `remaining`. Short reads are
/// retried until the cap, EOF or an error.
fn read_cycle(file: &mut std::fs::File, buf: &mut [u8], remaining: u64) -> std::io::Result<usize> {
    let want = buf.len().min(remaining as usize);
    let mut total = 0;
    while total < want {
        match file.read(&mut buf[total..want]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Overwrite a random-length zero prefix on every block, making synthetic
/// random data compressible to a controllable degree.
fn zero_fill_blocks(buf: &mut [u8], blocks: usize, blocksize: usize, rng: &mut impl Rng) {
    for i in 0..blocks {
        let n = rng.gen_range(0..blocksize);
        buf[i * blocksize..i * blocksize + n].fill(0);
    }
}

/// Read one stream end-to-end, pushing cycles through the ring. Returns the
/// bytes consumed from the stream.
fn read_stream(shared: &Shared, ctx: &Ctx, sf: &ScanFile, mut file: std::fs::File) -> Result<u64> {
    let blocksize = shared.blocksize;
    let cycle_bytes = shared.blocks_per_cycle * blocksize;
    let mut rng = rand::thread_rng();
    let mut total: u64 = 0;

    // repeat>1 needs the cycle in a scratch buffer so it can be pushed
    // through the ring more than once
    let mut scratch = if sf.repeat > 1 {
        Some(vec![0u8; cycle_bytes])
    } else {
        None
    };

    loop {
        if ctx.aborted() {
            break;
        }
        shared.throttle.request((cycle_bytes as u64) / KIB);

        let remaining = if sf.limit > 0 {
            sf.limit.saturating_sub(total)
        } else {
            u64::MAX
        };
        if remaining == 0 {
            break;
        }

        let bytes = match scratch.as_mut() {
            Some(buf) => {
                let n = read_cycle(&mut file, buf, remaining).map_err(|source| Error::Io {
                    context: format!("reading {}", sf.name),
                    source,
                })?;
                if n == 0 {
                    break;
                }
                let blocks = blocks_in(n, blocksize);
                buf[n..blocks * blocksize].fill(0);
                if sf.zero_fill {
                    zero_fill_blocks(buf, blocks, blocksize, &mut rng);
                }
                for _ in 0..sf.repeat {
                    let ix = match shared.ring.acquire_free(ctx) {
                        Acquire::Slot(ix) => ix,
                        Acquire::Done | Acquire::Aborted => return Ok(total),
                    };
                    let mut slot = shared.buffers[ix].lock().unwrap();
                    slot.buf[..blocks * blocksize]
                        .copy_from_slice(&buf[..blocks * blocksize]);
                    slot.used = blocks;
                }
                n
            }
            None => {
                let ix = match shared.ring.acquire_free(ctx) {
                    Acquire::Slot(ix) => ix,
                    Acquire::Done | Acquire::Aborted => break,
                };
                let mut slot = shared.buffers[ix].lock().unwrap();
                let n = read_cycle(&mut file, &mut slot.buf, remaining).map_err(|source| {
                    Error::Io {
                        context: format!("reading {}", sf.name),
                        source,
                    }
                })?;
                let blocks = blocks_in(n, blocksize);
                slot.buf[n..blocks * blocksize].fill(0);
                if sf.zero_fill {
                    zero_fill_blocks(&mut slot.buf, blocks, blocksize, &mut rng);
                }
                slot.used = blocks;
                if n == 0 {
                    break;
                }
                n
            }
        };
        total += bytes as u64;
        if bytes < cycle_bytes {
            break; // EOF
        }
    }
    Ok(total)
}

/// Number of blocks covering `bytes`, counting a partial tail as one.
#[inline]
fn blocks_in(bytes: usize, blocksize: usize) -> usize {
    bytes / blocksize + usize::from(bytes % blocksize != 0)
}

/// Reader thread body: claim unclaimed files and scan each end-to-end; on
/// EOF record the stream's block and byte counts in the staging store.
fn reader(shared: &Shared, ctx: &Ctx, files: &[ScanFile]) {
    for sf in files {
        if ctx.aborted() {
            return;
        }
        let Some(file) = sf.claim() else { continue };
        match read_stream(shared, ctx, sf, file) {
            Ok(bytes) => {
                let blocks = bytes / shared.blocksize as u64;
                let db = shared.staging.lock().unwrap();
                if let Err(e) = db.insert_file(&sf.name, blocks, bytes) {
                    error!("recording {}: {e}", sf.name);
                    ctx.raise_abort();
                }
            }
            Err(e) => {
                error!("{e}");
                ctx.raise_abort();
                return;
            }
        }
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────────

/// Worker thread body: hash every block of every full slot, probe the
/// compressed size of sampled non-zero blocks, and bump the shared counters.
fn worker(shared: &Shared, ctx: &Ctx) {
    let blocksize = shared.blocksize;
    let interval = shared.interval;
    let method = shared.method;
    let mut rng = rand::thread_rng();

    loop {
        let ix = match shared.ring.acquire_full(ctx) {
            Acquire::Slot(ix) => ix,
            Acquire::Done | Acquire::Aborted => return,
        };
        let mut slot = shared.buffers[ix].lock().unwrap();
        let DataBuffer {
            buf,
            used,
            hashes,
            cbytes,
            blockcount,
            bytes,
        } = &mut *slot;
        for j in 0..*used {
            if ctx.aborted() {
                return;
            }
            let block = &buf[j * blocksize..(j + 1) * blocksize];
            let hash = hash_block(block);
            let cb = if rng.gen_range(0..interval) == 0 {
                Some(if hash != 0 {
                    compress_block(method, block)
                } else {
                    0
                })
            } else {
                None
            };
            hashes[j] = hash;
            cbytes[j] = cb;
            *blockcount += 1;
            *bytes += blocksize as u64;

            let total_blocks;
            let total_bytes;
            {
                let mut c = shared.counters.lock().unwrap();
                c.blocks += 1;
                c.bytes += blocksize as u64;
                total_blocks = c.blocks;
                total_bytes = c.bytes;
            }
            if total_blocks % 10_000 == 0 || total_blocks == 10 {
                shared.progress.lock().unwrap().update(
                    total_blocks,
                    blocksize as u64,
                    total_bytes,
                    None,
                );
            }
        }
    }
}

// ─── Updater ──────────────────────────────────────────────────────────────────

/// Updater thread body: single writer draining processed slots into the
/// staging table. All inserts ride one transaction; an aborted scan rolls
/// back instead of committing.
fn updater(shared: &Shared, ctx: &Ctx) {
    if let Err(e) = shared.staging.lock().unwrap().begin() {
        error!("opening staging transaction: {e}");
        ctx.raise_abort();
        return;
    }
    loop {
        let ix = match shared.ring.acquire_used(ctx) {
            Acquire::Slot(ix) => ix,
            Acquire::Done | Acquire::Aborted => break,
        };
        let mut slot = shared.buffers[ix].lock().unwrap();
        if !shared.dryrun {
            let db = shared.staging.lock().unwrap();
            for j in 0..slot.used {
                if let Err(e) = db.insert_block(slot.hashes[j], slot.cbytes[j]) {
                    error!("staging insert: {e}");
                    ctx.raise_abort();
                    break;
                }
            }
        }
        slot.used = 0;
    }
    let db = shared.staging.lock().unwrap();
    let end = if ctx.aborted() { db.rollback() } else { db.commit() };
    if let Err(e) = end {
        error!("closing staging transaction: {e}");
        ctx.raise_abort();
    }
}

// ─── Orchestration ────────────────────────────────────────────────────────────

/// Scan all streams into a fresh staging store next to the primary. On
/// interrupt the staging file is deleted and `Error::Interrupted` returned.
pub fn analyze(
    primary_path: &Path,
    files: &[ScanFile],
    cfg: ScanConfig,
    pools: PoolSizes,
    ctx: &Ctx,
) -> Result<()> {
    let staging_file = staging_path(primary_path);
    if staging_file.exists() {
        delete_store(&staging_file)?;
    }
    StagingDb::create(&staging_file, cfg.blocksize_kib)?;
    let sdb = StagingDb::open(&staging_file)?;

    let workers = if pools.workers > 0 {
        pools.workers
    } else {
        num_cpus::get()
    };
    let readers = if pools.readers > 0 {
        pools.readers.min(files.len())
    } else {
        files.len().min(MAX_READERS)
    };
    let buffers = if pools.buffers > 0 {
        pools.buffers.max(2)
    } else {
        workers + readers + EXTRA_BUFFERS
    };

    let blocksize = cfg.blocksize_kib as usize * KIB as usize;
    let blocks_per_cycle = CYCLE_BYTES / blocksize;

    let shared = Shared {
        ring: RingBuffer::new(buffers),
        buffers: (0..buffers)
            .map(|_| Mutex::new(DataBuffer::new(blocksize, blocks_per_cycle)))
            .collect(),
        blocksize,
        blocks_per_cycle,
        method: cfg.method,
        interval: cfg.interval,
        dryrun: cfg.dryrun,
        throttle: Throttle::new(cfg.bandwidth_mibps),
        counters: Mutex::new(Counters::default()),
        progress: Mutex::new(Progress::new(ctx.quiet)),
        staging: Mutex::new(sdb),
    };

    if !ctx.quiet {
        println!(
            "Scanning {} files, {} readers, {} workers, {} buffers, {} MB/s max",
            files.len(),
            readers,
            workers,
            buffers,
            cfg.bandwidth_mibps
        );
    }

    ctx.arm();
    let mut stopwatch = Stopwatch::new();

    std::thread::scope(|s| {
        let updater_handle = s.spawn(|| updater(&shared, ctx));
        let worker_handles: Vec<_> = (0..workers).map(|_| s.spawn(|| worker(&shared, ctx))).collect();
        let reader_handles: Vec<_> = (0..readers)
            .map(|_| s.spawn(|| reader(&shared, ctx, files)))
            .collect();

        for h in reader_handles {
            let _ = h.join();
        }
        shared.ring.set_done();
        for h in worker_handles {
            let _ = h.join();
        }
        let _ = updater_handle.join();
    });

    stopwatch.lap();
    {
        let c = shared.counters.lock().unwrap();
        let note = format!(" Scanned in {} seconds", stopwatch.seconds());
        let mut progress = shared.progress.lock().unwrap();
        progress.update(c.blocks, blocksize as u64, c.bytes, Some(&note));
        progress.finish();
    }
    if log::log_enabled!(log::Level::Debug) {
        // per-buffer accounting cross-checks the shared counters
        let (mut sum_blocks, mut sum_bytes) = (0u64, 0u64);
        for b in &shared.buffers {
            let b = b.lock().unwrap();
            sum_blocks += b.blockcount;
            sum_bytes += b.bytes;
        }
        debug!(
            "blocks processed {sum_blocks}, bytes {sum_bytes} ({:.2} MiB)",
            sum_bytes as f64 / MIB as f64
        );
    }

    let sdb = shared.staging.into_inner().unwrap();
    if ctx.aborted() {
        sdb.remove()?;
        ctx.disarm();
        return Err(Error::Interrupted);
    }
    ctx.disarm();
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_in_counts_partial_tail() {
        assert_eq!(blocks_in(0, 16384), 0);
        assert_eq!(blocks_in(1, 16384), 1);
        assert_eq!(blocks_in(16384, 16384), 1);
        assert_eq!(blocks_in(16385, 16384), 2);
        assert_eq!(blocks_in(1048576, 16384), 64);
    }

    #[test]
    fn zero_fill_prefixes_only() {
        let blocksize = 1024;
        let mut buf = vec![0xffu8; 4 * blocksize];
        let mut rng = rand::thread_rng();
        zero_fill_blocks(&mut buf, 4, blocksize, &mut rng);
        // each block must end with untouched bytes or be fully 0xff at the tail
        for i in 0..4 {
            let block = &buf[i * blocksize..(i + 1) * blocksize];
            assert_eq!(block[blocksize - 1], 0xff, "prefix fill must not reach block end");
        }
    }

    #[test]
    fn data_buffer_sizes_match_cycle() {
        let b = DataBuffer::new(16384, 64);
        assert_eq!(b.buf.len(), 1048576);
        assert_eq!(b.hashes.len(), 64);
        assert_eq!(b.cbytes.len(), 64);
    }
}
