//! Reduction math and report rendering.
//!
//! All figures derive from the primary store's materialized histograms;
//! [`Reduction::gather`] pulls them into one struct so the arithmetic is
//! testable apart from the printing. Ratios are zero-safe: an empty store
//! reports 0 everywhere instead of dividing by zero.

use crate::db::PrimaryDb;
use crate::error::Result;
use crate::util::{safe_div, MIB};

/// The complete set of reduction figures for one store.
#[derive(Debug, Clone, Copy)]
pub struct Reduction {
    pub blocksize_kib: u32,
    /// Logical blocks scanned.
    pub total: u64,
    /// All-zero blocks.
    pub free: u64,
    /// Non-zero blocks.
    pub used: u64,
    /// Distinct non-zero hashes.
    pub dedup: u64,
    /// Hashes seen exactly once.
    pub unique: u64,
    /// Blocks whose hash was seen more than once.
    pub nonunique: u64,
    /// Blocks removed by dedupe (`used - dedup`).
    pub merged: u64,
    /// Blocksize units after bucket packing.
    pub allocated: u64,
    /// Percentage of non-zero blocks with a measured compressed size.
    pub sample_pct: f64,
    /// Logical/compressed over all references.
    pub ratio_raw: f64,
    /// Logical/compressed over distinct hashes.
    pub ratio_net: f64,
    pub ratio_dedup: f64,
    pub ratio_compr: f64,
    pub ratio_thin: f64,
    /// Overall reduction: dedupe × compression × thin.
    pub ratio_total: f64,
}

impl Reduction {
    pub fn gather(db: &PrimaryDb) -> Result<Reduction> {
        let blocksize_kib = db.blocksize()?;
        let blocksize = blocksize_kib as u64 * 1024;

        let total = db.blocks_total()?;
        let free = db.blocks_free()?;
        let used = db.blocks_used()?;
        let dedup = db.blocks_deduped()?;
        let unique = db.blocks_unique()?;
        let nonunique = db.blocks_nonunique()?;
        let allocated = db.allocated_blocks()?;
        let sums = db.compressed_sums()?;

        let ratio_raw = safe_div((sums.totblocks * blocksize) as f64, sums.raw as f64);
        let ratio_net = safe_div((sums.blocks * blocksize) as f64, sums.bytes as f64);
        let ratio_dedup = safe_div(used as f64, dedup as f64);
        let ratio_compr = safe_div(dedup as f64, allocated as f64);
        let ratio_thin = safe_div(total as f64, used as f64);

        Ok(Reduction {
            blocksize_kib,
            total,
            free,
            used,
            dedup,
            unique,
            nonunique,
            merged: used.saturating_sub(dedup),
            allocated,
            sample_pct: db.sample_pct()?,
            ratio_raw,
            ratio_net,
            ratio_dedup,
            ratio_compr,
            ratio_thin,
            ratio_total: ratio_dedup * ratio_compr * ratio_thin,
        })
    }
}

// ─── Rendering ────────────────────────────────────────────────────────────────

fn mib(v: f64) -> String {
    format!("{v:>11.2} MiB")
}

fn blocks(v: u64) -> String {
    format!(" ({v:>10} blocks)")
}

fn pct(v: f64) -> String {
    format!(" ({v:>10.2} %)")
}

fn line(label: &str, value: &str) {
    println!("{label:<19} = {value}");
}

/// The standard reduction report.
pub fn report(db: &PrimaryDb) -> Result<()> {
    let r = Reduction::gather(db)?;
    let to_mib = r.blocksize_kib as f64 / 1024.0;

    let blocks_raw = safe_div(r.used as f64, r.ratio_raw);
    let blocks_net = safe_div(r.dedup as f64, r.ratio_net);
    let perc_raw = safe_div(100.0, r.ratio_raw);
    let perc_net = safe_div(100.0, r.ratio_net);
    let perc_compr = safe_div(100.0, r.ratio_compr);
    let perc_used = 100.0 * safe_div(r.used as f64, r.total as f64);
    let perc_free = 100.0 * safe_div(r.free as f64, r.total as f64);
    let filesize = db.filesize() as f64 / MIB as f64;

    println!("\nDatabase info ({}):", db.path().display());
    line("database size", &format!("{filesize:>11.2} MiB"));
    line("array id", &db.array_id()?);
    line("blocksize", &format!("{:>11} KiB", r.blocksize_kib));
    line("compression", db.method()?.as_str());
    line("sample percentage", &format!("{:>11.2} %", r.sample_pct));

    println!("\nOverview:");
    line("total", &format!("{}{}", mib(r.total as f64 * to_mib), blocks(r.total)));
    line("free (zero)", &format!("{}{}", mib(r.free as f64 * to_mib), blocks(r.free)));
    line("used", &format!("{}{}", mib(r.used as f64 * to_mib), blocks(r.used)));
    line("dedupe savings", &format!("{}{}", mib(r.merged as f64 * to_mib), blocks(r.merged)));
    line("deduped", &format!("{}{}", mib(r.dedup as f64 * to_mib), blocks(r.dedup)));
    line("compressed", &format!("{}{}", mib(blocks_net * to_mib), pct(100.0 - perc_compr)));
    line("allocated", &format!("{}{}", mib(r.allocated as f64 * to_mib), blocks(r.allocated)));

    println!("\nDetails:");
    line("used", &format!("{}{}", mib(r.used as f64 * to_mib), blocks(r.used)));
    line("unique data", &format!("{}{}", mib(r.unique as f64 * to_mib), blocks(r.unique)));
    line("non-unique data", &format!("{}{}", mib(r.nonunique as f64 * to_mib), blocks(r.nonunique)));
    line("compressed raw", &format!("{}{}", mib(blocks_raw * to_mib), pct(100.0 - perc_raw)));
    line("compressed net", &format!("{}{}", mib(blocks_net * to_mib), pct(100.0 - perc_net)));

    println!("\nSummary:");
    line("percentage used", &format!("{perc_used:>11.2} %"));
    line("percentage free", &format!("{perc_free:>11.2} %"));
    line("deduplication ratio", &format!("{:>11.2}", r.ratio_dedup));
    line("compression ratio", &format!("{:>11.2}", r.ratio_compr));
    line("thin ratio", &format!("{:>11.2}", r.ratio_thin));
    line("combined", &format!("{:>11.2}", r.ratio_total));
    line("raw capacity", &mib(r.total as f64 * to_mib));
    line("net capacity", &mib(r.allocated as f64 * to_mib));
    println!();
    Ok(())
}

/// Extended report: file list plus dedupe and compression histograms.
pub fn report_detail(db: &PrimaryDb) -> Result<()> {
    println!("File list:");
    println!(
        "{:<8}{:>6}{:>10}{:>11} {:<18}{}",
        "file", "blksz", "blocks", "MiB", "date", "url"
    );
    for f in db.files()? {
        println!(
            "{:<8}{:>6}{:>10}{:>11} {:<18}{}",
            f.file, f.blksz, f.blocks, f.mib, f.date, f.url
        );
    }

    println!("\nDedupe histogram:");
    println!("{:<8}{:>12}{:>12}{:>12}", "dup", "blocks", "perc", "MiB");
    let mut tot = (0u64, 0.0f64, 0.0f64);
    for row in db.dedupe_histogram()? {
        println!(
            "{:<8}{:>12}{:>12.2}{:>12.2}",
            row.dup, row.blocks, row.perc, row.mib
        );
        tot = (tot.0 + row.blocks, tot.1 + row.perc, tot.2 + row.mib);
    }
    println!("{:<8}{:>12}{:>12.2}{:>12.2}", "Total:", tot.0, tot.1, tot.2);

    println!("\nCompression histogram ({}):", db.array_id()?);
    println!(
        "{:<8}{:>12}{:>12}{:>12}{:>12}{:>14}",
        "size", "buckets", "RawMiB", "perc", "blocks", "MiB"
    );
    let mut tot = (0u64, 0.0f64, 0.0f64, 0u64, 0.0f64);
    for row in db.compress_histogram()? {
        println!(
            "{:<8}{:>12}{:>12.2}{:>12.2}{:>12}{:>14.2}",
            row.size, row.buckets, row.alloc_mib, row.perc, row.blocks, row.data_mib
        );
        tot = (
            tot.0 + row.buckets,
            tot.1 + row.alloc_mib,
            tot.2 + row.perc,
            tot.3 + row.blocks,
            tot.4 + row.data_mib,
        );
    }
    println!(
        "{:<8}{:>12}{:>12.2}{:>12.2}{:>12}{:>14.2}",
        "Total:", tot.0, tot.1, tot.2, tot.3, tot.4
    );
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Method;
    use crate::db::{staging_path, StagingDb};
    use tempfile::TempDir;

    fn store_with(dir: &TempDir, rows: &[(u64, Option<u32>)]) -> PrimaryDb {
        let path = dir.path().join("qdda.db");
        PrimaryDb::create(&path).unwrap();
        let db = PrimaryDb::open(&path).unwrap();
        db.set_metadata("x2", 16, Method::Lz4, 1, &[1, 2, 4, 8, 16])
            .unwrap();
        let spath = staging_path(&path);
        StagingDb::create(&spath, 16).unwrap();
        let s = StagingDb::open(&spath).unwrap();
        s.begin().unwrap();
        for &(h, b) in rows {
            s.insert_block(h, b).unwrap();
        }
        s.commit().unwrap();
        drop(s);
        db.merge_staging(&spath).unwrap();
        db
    }

    #[test]
    fn empty_store_reports_zeroes() {
        let dir = TempDir::new().unwrap();
        let db = store_with(&dir, &[]);
        let r = Reduction::gather(&db).unwrap();
        assert_eq!(r.total, 0);
        assert_eq!(r.ratio_dedup, 0.0);
        assert_eq!(r.ratio_total, 0.0);
    }

    #[test]
    fn all_zero_blocks_have_no_used_capacity() {
        let dir = TempDir::new().unwrap();
        let rows: Vec<_> = (0..64).map(|_| (0u64, Some(0u32))).collect();
        let db = store_with(&dir, &rows);
        let r = Reduction::gather(&db).unwrap();
        assert_eq!(r.total, 64);
        assert_eq!(r.free, 64);
        assert_eq!(r.used, 0);
        assert_eq!(r.dedup, 0);
        assert_eq!(r.allocated, 0);
        assert_eq!(r.ratio_total, 0.0);
    }

    #[test]
    fn unique_blocks_have_dedup_ratio_one() {
        let dir = TempDir::new().unwrap();
        // 64 distinct incompressible hashes
        let rows: Vec<_> = (1..=64u64).map(|h| (h, Some(16384u32))).collect();
        let db = store_with(&dir, &rows);
        let r = Reduction::gather(&db).unwrap();
        assert_eq!(r.total, 64);
        assert_eq!(r.used, 64);
        assert_eq!(r.dedup, 64);
        assert_eq!(r.unique, 64);
        assert_eq!(r.ratio_dedup, 1.0);
        assert_eq!(r.ratio_thin, 1.0);
    }

    #[test]
    fn repeated_block_has_dedup_ratio_of_repeat_count() {
        let dir = TempDir::new().unwrap();
        let rows: Vec<_> = (0..100).map(|_| (0xfeedu64, Some(16384u32))).collect();
        let db = store_with(&dir, &rows);
        let r = Reduction::gather(&db).unwrap();
        assert_eq!(r.used, 100);
        assert_eq!(r.dedup, 1);
        assert_eq!(r.ratio_dedup, 100.0);
        assert_eq!(r.ratio_thin, 1.0);
    }

    #[test]
    fn mixed_scenario_counts() {
        let dir = TempDir::new().unwrap();
        // 32 zero + 16 unique + 16 copies of one block
        let mut rows: Vec<(u64, Option<u32>)> = Vec::new();
        rows.extend((0..32).map(|_| (0u64, Some(0u32))));
        rows.extend((1..=16u64).map(|h| (h, Some(16384u32))));
        rows.extend((0..16).map(|_| (0x4242u64, Some(16384u32))));
        let db = store_with(&dir, &rows);
        let r = Reduction::gather(&db).unwrap();
        assert_eq!(r.free, 32);
        assert_eq!(r.used, 32);
        assert_eq!(r.dedup, 17);
        assert_eq!(r.unique, 16);
        assert_eq!(r.nonunique, 16);
    }

    #[test]
    fn compression_fills_buckets() {
        let dir = TempDir::new().unwrap();
        // 8 distinct blocks compressing to 4 KiB → bucket 4, two per 16 KiB unit...
        // ceil(4*8/16) = 2 allocated units
        let rows: Vec<_> = (1..=8u64).map(|h| (h, Some(4096u32))).collect();
        let db = store_with(&dir, &rows);
        let r = Reduction::gather(&db).unwrap();
        assert_eq!(r.allocated, 2);
        assert_eq!(r.ratio_compr, 4.0);
        assert_eq!(r.sample_pct, 100.0);
    }

    #[test]
    fn dedupe_histogram_total_equals_scanned_blocks() {
        let dir = TempDir::new().unwrap();
        let mut rows: Vec<(u64, Option<u32>)> = Vec::new();
        rows.extend((0..10).map(|_| (0u64, Some(0u32))));
        rows.extend((1..=5u64).map(|h| (h, Some(8000u32))));
        rows.extend((0..7).map(|_| (0x7777u64, Some(1000u32))));
        let db = store_with(&dir, &rows);
        let total: u64 = db
            .dedupe_histogram()
            .unwrap()
            .iter()
            .map(|r| r.blocks)
            .sum();
        assert_eq!(total, 22);
    }

    #[test]
    fn unsampled_blocks_lower_the_sample_percentage() {
        let dir = TempDir::new().unwrap();
        let mut rows: Vec<(u64, Option<u32>)> = Vec::new();
        rows.extend((1..=2u64).map(|h| (h, Some(4096u32))));
        rows.extend((3..=4u64).map(|h| (h, None)));
        let db = store_with(&dir, &rows);
        let r = Reduction::gather(&db).unwrap();
        assert_eq!(r.sample_pct, 50.0);
    }
}
