//! Primary store: the persistent aggregated block index.
//!
//! One row per distinct hash in `kv`, metadata locked to a single immutable
//! row, the bucket list for the simulated array, and two materialized
//! histograms (`m_sums_deduped`, `m_sums_compressed`) refreshed after every
//! merge or import. All reduction reporting reads from the views defined
//! here.
//!
//! Schema notes:
//! - `kv.hash` doubles as the primary key; `WITHOUT ROWID` keeps the table a
//!   clustered b-tree over the hash.
//! - `v_bucket_compressed` assigns each compressed-size class to the
//!   smallest bucket that holds it; `v_compressed` turns that into
//!   blocksize-unit allocation counts.

use std::path::Path;

use gethostname::gethostname;
use log::debug;
use rusqlite::params;

use crate::block::Method;
use crate::db::{is_store_file, Db};
use crate::error::{Error, Result};
use crate::util::epoch;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS metadata(lock char(1) not null default 1
, version text
, blksz integer
, compression text check (compression in ('none', 'lz4', 'deflate')) default 'none'
, interval integer default 1
, arrayid text
, created integer
, constraint pk_meta primary key(lock), constraint ck_meta_lock check (lock=1));

CREATE TABLE IF NOT EXISTS files(id integer primary key autoincrement
, name TEXT
, hostname TEXT
, timestamp integer
, blocks integer
, bytes integer);

CREATE TABLE IF NOT EXISTS kv(hash unsigned integer primary key, blocks integer, bytes integer) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS buckets(bucksz integer primary key NOT NULL);

CREATE VIEW IF NOT EXISTS v_files as
select id as file
, bytes/blocks as blksz
, blocks
, bytes/1024/1024 as mib
, strftime('%Y%m%d_%H%M', timestamp, 'unixepoch', 'utc') as date
, hostname || ':' || name as url
from files;

CREATE VIEW IF NOT EXISTS v_sums_deduped as
select blocks ref, count(blocks) blocks
from kv where hash != 0 group by 1 order by ref;

CREATE VIEW IF NOT EXISTS v_sums_compressed as
select ((bytes-1)/1024)+1 size, count(*) blocks
, sum(blocks) totblocks
, sum(bytes) bytes
, sum(bytes*blocks) raw
from kv where hash != 0 and bytes not NULL group by (bytes-1)/1024;

CREATE TABLE m_sums_deduped as select * from v_sums_deduped where 1=0;
CREATE TABLE m_sums_compressed as select * from v_sums_compressed where 1=0;

CREATE VIEW IF NOT EXISTS v_bucket_compressed as
WITH data(blksz, total) as (
  select (select max(bucksz) from buckets), (select sum(blocks) from m_sums_compressed))
select (select min(bucksz) from buckets where bucksz >= m_sums_compressed.size) size
, blksz
, total
, sum(blocks) blocks
from m_sums_compressed, data group by 1;

CREATE VIEW IF NOT EXISTS v_deduped as
WITH data(blksz, sum) as (
  select (select blksz*1024 from metadata), (select sum(blocks) from kv))
select 0 dup
, blocks
, 100.0*blocks/sum perc
, blksz*blocks/1048576.0 mib
from kv, data where hash = 0
union all
select ref
, blocks*ref blocks
, 100.0*blocks*ref/sum
, blksz*ref*blocks/1048576.0 mib
from m_sums_deduped, data;

CREATE VIEW IF NOT EXISTS v_compressed as
select size
, (size*blocks + blksz - 1)/blksz buckets
, ((size*blocks + blksz - 1)/blksz)*blksz/1024.0 alloc_mib
, 100.0*blocks/total perc
, blocks
, blocks*blksz/1024.0 data_mib
from v_bucket_compressed;
";

/// Sums over the compression histogram, used by the report ratios.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompressedSums {
    /// Distinct measured hashes.
    pub blocks: u64,
    /// Measured hashes weighted by reference count.
    pub totblocks: u64,
    /// Compressed bytes, one observation per hash.
    pub bytes: u64,
    /// Compressed bytes weighted by reference count.
    pub raw: u64,
}

#[derive(Debug)]
pub struct FileRow {
    pub file: u64,
    pub blksz: u64,
    pub blocks: u64,
    pub mib: u64,
    pub date: String,
    pub url: String,
}

#[derive(Debug)]
pub struct DedupeRow {
    /// Reference count; 0 labels the zero-block row.
    pub dup: u64,
    pub blocks: u64,
    pub perc: f64,
    pub mib: f64,
}

#[derive(Debug)]
pub struct CompressRow {
    /// Bucket size in KiB.
    pub size: u64,
    /// Blocksize units needed for this bucket's blocks.
    pub buckets: u64,
    pub alloc_mib: f64,
    pub perc: f64,
    /// Distinct blocks assigned to this bucket.
    pub blocks: u64,
    pub data_mib: f64,
}

pub struct PrimaryDb {
    db: Db,
}

impl PrimaryDb {
    pub fn create(path: &Path) -> Result<()> {
        Db::create(path, SCHEMA)
    }

    pub fn open(path: &Path) -> Result<PrimaryDb> {
        Ok(PrimaryDb {
            db: Db::open(path)?,
        })
    }

    pub fn trace(&mut self) {
        self.db.trace();
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    pub fn filesize(&self) -> u64 {
        self.db.filesize()
    }

    pub fn vacuum(&self) -> Result<()> {
        self.db.vacuum()
    }

    // ── Metadata ──────────────────────────────────────────────────────────────

    /// Blocksize in KiB; 0 when metadata has not been set yet.
    pub fn blocksize(&self) -> Result<u32> {
        Ok(self.db.get_u64("select blksz from metadata")? as u32)
    }

    pub fn method(&self) -> Result<Method> {
        let s: String = self
            .db
            .conn()
            .query_row("select compression from metadata", [], |r| r.get(0))
            .unwrap_or_else(|_| "none".into());
        s.parse()
    }

    /// Compression sampling interval; 1 measures every non-zero block.
    pub fn interval(&self) -> Result<u32> {
        let v = self.db.get_u64("select interval from metadata")?;
        Ok((v as u32).max(1))
    }

    pub fn array_id(&self) -> Result<String> {
        Ok(self
            .db
            .conn()
            .query_row("select arrayid from metadata", [], |r| r.get(0))
            .unwrap_or_else(|_| "-".into()))
    }

    pub fn rows(&self) -> Result<u64> {
        self.db.get_u64("select count(*) from kv")
    }

    /// Set the metadata row and the bucket list. A no-op if metadata already
    /// exists: blocksize and method are immutable once a store has data.
    pub fn set_metadata(
        &self,
        array_id: &str,
        blocksize_kib: u32,
        method: Method,
        interval: u32,
        buckets: &[u32],
    ) -> Result<()> {
        if self.blocksize()? != 0 {
            debug!("metadata already set, keeping existing array definition");
            return Ok(());
        }
        if !(1..=128).contains(&blocksize_kib) {
            return Err(Error::usage(format!(
                "blocksize {blocksize_kib} KiB out of range (1..128)"
            )));
        }
        self.db.conn().execute(
            "insert into metadata (version, blksz, compression, interval, arrayid, created) \
             values (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                VERSION,
                blocksize_kib,
                method.as_str(),
                interval.max(1),
                array_id,
                epoch() as i64
            ],
        )?;
        self.load_buckets(buckets)
    }

    /// Replace the bucket list. 0 and the blocksize are always present; a
    /// bucket larger than the blocksize is refused.
    pub fn load_buckets(&self, sizes: &[u32]) -> Result<()> {
        let blocksize = self.blocksize()?;
        for &s in sizes {
            if s == 0 || s > blocksize {
                return Err(Error::usage(format!(
                    "bucket size {s} KiB out of range (1..{blocksize})"
                )));
            }
        }
        self.db.conn().execute("delete from buckets", [])?;
        let mut stmt = self
            .db
            .conn()
            .prepare("insert or replace into buckets values (?1)")?;
        stmt.execute(params![0u32])?;
        for &s in sizes {
            stmt.execute(params![s])?;
        }
        stmt.execute(params![blocksize])?;
        Ok(())
    }

    /// The bucket list in ascending order (excluding the 0 sentinel).
    pub fn buckets(&self) -> Result<Vec<u32>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("select bucksz from buckets where bucksz > 0 order by bucksz")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, u32>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Merge & import ────────────────────────────────────────────────────────

    /// Fold a staging store into `kv` and append its file rows, then refresh
    /// the materialized histograms. The staging file itself is left in place
    /// for the caller to delete.
    pub fn merge_staging(&self, staging: &Path) -> Result<()> {
        let theirs = super::StagingDb::open(staging)?.blocksize()?;
        let ours = self.blocksize()?;
        if theirs != ours {
            return Err(Error::Blocksize { ours, theirs });
        }
        self.db.attach("tmpdb", staging)?;
        let merged = (|| -> Result<()> {
            self.db.conn().execute_batch(
                "with t(hash, blocks, bytes) as (
                   select hash, blocks, bytes from kv union all
                   select hash, 1, bytes from tmpdb.staging)
                 insert or replace into kv
                 select hash, sum(blocks), max(bytes) from t group by hash;
                 insert into files (name, hostname, timestamp, blocks, bytes)
                 select name, hostname, timestamp, blocks, bytes from tmpdb.files;",
            )?;
            Ok(())
        })();
        self.db.detach("tmpdb")?;
        merged?;
        self.update()
    }

    /// Fold another primary store into this one. The peer carries
    /// pre-aggregated reference counts which add into existing counts.
    pub fn import(&self, peer: &Path) -> Result<()> {
        if !is_store_file(peer) {
            return Err(Error::Store(format!(
                "not a store file: {}",
                peer.display()
            )));
        }
        let theirs = PrimaryDb::open(peer)?.blocksize()?;
        let ours = self.blocksize()?;
        if theirs != ours {
            return Err(Error::Blocksize { ours, theirs });
        }
        self.db.attach("impdb", peer)?;
        let imported = (|| -> Result<()> {
            self.db.conn().execute_batch(
                "insert or replace into main.kv
                 select i.hash
                 , coalesce(m.blocks, 0) + i.blocks
                 , coalesce(i.bytes, m.bytes)
                 from impdb.kv i left outer join main.kv m on m.hash = i.hash;
                 insert into files (name, hostname, timestamp, blocks, bytes)
                 select name, hostname, timestamp, blocks, bytes from impdb.files;",
            )?;
            Ok(())
        })();
        self.db.detach("impdb")?;
        imported?;
        self.update()
    }

    /// Re-materialize the histogram tables from their views.
    pub fn update(&self) -> Result<()> {
        self.db.conn().execute_batch(
            "delete from m_sums_compressed;
             delete from m_sums_deduped;
             insert into m_sums_compressed select * from v_sums_compressed;
             insert into m_sums_deduped select * from v_sums_deduped;",
        )?;
        Ok(())
    }

    /// Record a synthetic file row (used by self tests and imports of raw
    /// observation sets).
    pub fn insert_file(&self, name: &str, blocks: u64, bytes: u64) -> Result<()> {
        self.db.conn().execute(
            "insert into files (name, hostname, timestamp, blocks, bytes) values (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                gethostname().to_string_lossy().into_owned(),
                epoch() as i64,
                blocks as i64,
                bytes as i64
            ],
        )?;
        Ok(())
    }

    // ── Report scalars ────────────────────────────────────────────────────────

    pub fn blocks_total(&self) -> Result<u64> {
        self.db.get_u64("select sum(blocks) from kv")
    }

    pub fn blocks_free(&self) -> Result<u64> {
        self.db.get_u64("select blocks from kv where hash = 0")
    }

    pub fn blocks_used(&self) -> Result<u64> {
        self.db.get_u64("select sum(ref*blocks) from m_sums_deduped")
    }

    pub fn blocks_deduped(&self) -> Result<u64> {
        self.db.get_u64("select sum(blocks) from m_sums_deduped")
    }

    pub fn blocks_unique(&self) -> Result<u64> {
        self.db.get_u64("select blocks from m_sums_deduped where ref = 1")
    }

    pub fn blocks_nonunique(&self) -> Result<u64> {
        self.db
            .get_u64("select sum(ref*blocks) from m_sums_deduped where ref > 1")
    }

    /// Percentage of non-zero blocks that carry a measured compressed size.
    pub fn sample_pct(&self) -> Result<f64> {
        self.db.get_f64(
            "select 100.0*(select sum(blocks) from m_sums_compressed)\
             /(select sum(blocks) from m_sums_deduped)",
        )
    }

    pub fn compressed_sums(&self) -> Result<CompressedSums> {
        let row = self.db.conn().query_row(
            "select coalesce(sum(blocks),0), coalesce(sum(totblocks),0), \
             coalesce(sum(bytes),0), coalesce(sum(raw),0) from m_sums_compressed",
            [],
            |r| {
                Ok(CompressedSums {
                    blocks: r.get::<_, i64>(0)? as u64,
                    totblocks: r.get::<_, i64>(1)? as u64,
                    bytes: r.get::<_, i64>(2)? as u64,
                    raw: r.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(row)
    }

    /// Blocksize units needed after packing compressed blocks into buckets.
    pub fn allocated_blocks(&self) -> Result<u64> {
        self.db.get_u64("select sum(buckets) from v_compressed")
    }

    // ── Histograms & diagnostics ──────────────────────────────────────────────

    pub fn files(&self) -> Result<Vec<FileRow>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("select file, blksz, blocks, mib, date, url from v_files")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(FileRow {
                    file: r.get::<_, i64>(0)? as u64,
                    blksz: r.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                    blocks: r.get::<_, i64>(2)? as u64,
                    mib: r.get::<_, i64>(3)? as u64,
                    date: r.get(4)?,
                    url: r.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn dedupe_histogram(&self) -> Result<Vec<DedupeRow>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("select dup, blocks, perc, mib from v_deduped")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(DedupeRow {
                    dup: r.get::<_, i64>(0)? as u64,
                    blocks: r.get::<_, i64>(1)? as u64,
                    perc: r.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    mib: r.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn compress_histogram(&self) -> Result<Vec<CompressRow>> {
        let mut stmt = self.db.conn().prepare(
            "select size, buckets, alloc_mib, perc, blocks, data_mib from v_compressed order by size",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(CompressRow {
                    size: r.get::<_, i64>(0)? as u64,
                    buckets: r.get::<_, i64>(1)? as u64,
                    alloc_mib: r.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    perc: r.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    blocks: r.get::<_, i64>(4)? as u64,
                    data_mib: r.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The `n` hashes with the highest reference counts.
    pub fn top_hash(&self, n: u64) -> Result<Vec<(u64, u64)>> {
        let mut stmt = self.db.conn().prepare(
            "select hash, blocks from kv where hash != 0 order by blocks desc limit ?1",
        )?;
        let rows = stmt
            .query_map(params![n as i64], |r| {
                Ok((r.get::<_, i64>(0)? as u64, r.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Direct kv access for tests and diagnostics.
    pub fn kv_row(&self, hash: u64) -> Result<Option<(u64, Option<u32>)>> {
        let row = self
            .db
            .conn()
            .query_row(
                "select blocks, bytes from kv where hash = ?1",
                params![hash as i64],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)? as u64,
                        r.get::<_, Option<u32>>(1)?,
                    ))
                },
            );
        match row {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{staging_path, StagingDb};
    use tempfile::TempDir;

    fn primary(dir: &TempDir) -> PrimaryDb {
        let path = dir.path().join("qdda.db");
        PrimaryDb::create(&path).unwrap();
        let db = PrimaryDb::open(&path).unwrap();
        db.set_metadata("x2", 16, Method::Lz4, 1, &[1, 2, 4, 8, 16])
            .unwrap();
        db
    }

    fn stage(dir: &TempDir, rows: &[(u64, Option<u32>)]) -> std::path::PathBuf {
        let path = staging_path(dir.path().join("qdda.db").as_path());
        let _ = std::fs::remove_file(&path);
        StagingDb::create(&path, 16).unwrap();
        let s = StagingDb::open(&path).unwrap();
        s.begin().unwrap();
        for &(h, b) in rows {
            s.insert_block(h, b).unwrap();
        }
        s.commit().unwrap();
        path
    }

    #[test]
    fn metadata_is_set_exactly_once() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        assert_eq!(db.blocksize().unwrap(), 16);
        assert_eq!(db.method().unwrap(), Method::Lz4);
        // second definition is ignored
        db.set_metadata("x1", 8, Method::None, 4, &[2, 4, 8]).unwrap();
        assert_eq!(db.blocksize().unwrap(), 16);
        assert_eq!(db.array_id().unwrap(), "x2");
        assert_eq!(db.interval().unwrap(), 1);
    }

    #[test]
    fn blocksize_out_of_range_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qdda.db");
        PrimaryDb::create(&path).unwrap();
        let db = PrimaryDb::open(&path).unwrap();
        assert!(db
            .set_metadata("big", 256, Method::Lz4, 1, &[256])
            .is_err());
    }

    #[test]
    fn buckets_include_blocksize_and_reject_oversize() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        assert_eq!(db.buckets().unwrap(), vec![1, 2, 4, 8, 16]);
        assert!(db.load_buckets(&[32]).is_err());
        // blocksize is re-added even when the list omits it
        db.load_buckets(&[4, 8]).unwrap();
        assert_eq!(db.buckets().unwrap(), vec![4, 8, 16]);
    }

    #[test]
    fn merge_folds_and_counts_references() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        let staging = stage(
            &dir,
            &[
                (0, Some(0)),
                (0, Some(0)),
                (0xa, Some(2048)),
                (0xa, None),
                (0xb, Some(9000)),
            ],
        );
        db.merge_staging(&staging).unwrap();
        assert_eq!(db.kv_row(0).unwrap().unwrap(), (2, Some(0)));
        // the sampled observation survives the NULL one
        assert_eq!(db.kv_row(0xa).unwrap().unwrap(), (2, Some(2048)));
        assert_eq!(db.kv_row(0xb).unwrap().unwrap(), (1, Some(9000)));
        assert_eq!(db.blocks_total().unwrap(), 5);
    }

    #[test]
    fn merge_accumulates_across_scans() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        let s1 = stage(&dir, &[(0xa, Some(2048))]);
        db.merge_staging(&s1).unwrap();
        std::fs::remove_file(&s1).unwrap();
        let s2 = stage(&dir, &[(0xa, Some(2048)), (0xa, Some(2048))]);
        db.merge_staging(&s2).unwrap();
        assert_eq!(db.kv_row(0xa).unwrap().unwrap(), (3, Some(2048)));
    }

    #[test]
    fn merge_refuses_blocksize_mismatch_without_mutation() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        let s1 = stage(&dir, &[(0xa, Some(2048))]);
        db.merge_staging(&s1).unwrap();
        std::fs::remove_file(&s1).unwrap();

        let bad = dir.path().join("bad-staging.db");
        StagingDb::create(&bad, 8).unwrap();
        let s = StagingDb::open(&bad).unwrap();
        s.insert_block(0xdead, Some(100)).unwrap();
        drop(s);

        assert!(matches!(
            db.merge_staging(&bad),
            Err(Error::Blocksize { ours: 16, theirs: 8 })
        ));
        assert_eq!(db.blocks_total().unwrap(), 1);
        assert!(db.kv_row(0xdead).unwrap().is_none());
    }

    #[test]
    fn merge_of_empty_staging_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        let s1 = stage(&dir, &[(0xa, Some(2048)), (0xb, None)]);
        db.merge_staging(&s1).unwrap();
        std::fs::remove_file(&s1).unwrap();
        let before: Vec<_> = [0xa, 0xb]
            .iter()
            .map(|&h| db.kv_row(h).unwrap())
            .collect();

        let empty = stage(&dir, &[]);
        db.merge_staging(&empty).unwrap();
        let after: Vec<_> = [0xa, 0xb]
            .iter()
            .map(|&h| db.kv_row(h).unwrap())
            .collect();
        assert_eq!(format!("{before:?}"), format!("{after:?}"));
        assert_eq!(db.blocks_total().unwrap(), 2);
    }

    #[test]
    fn import_adds_preaggregated_counts() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        let s1 = stage(&dir, &[(0xa, Some(2048)), (0xc, Some(512))]);
        db.merge_staging(&s1).unwrap();
        std::fs::remove_file(&s1).unwrap();

        let peer_path = dir.path().join("peer.db");
        PrimaryDb::create(&peer_path).unwrap();
        let peer = PrimaryDb::open(&peer_path).unwrap();
        peer.set_metadata("x2", 16, Method::Lz4, 1, &[1, 2, 4, 8, 16])
            .unwrap();
        let s2 = stage(&dir, &[(0xa, Some(2048)), (0xa, Some(2048)), (0xd, None)]);
        peer.merge_staging(&s2).unwrap();
        drop(peer);

        db.import(&peer_path).unwrap();
        assert_eq!(db.kv_row(0xa).unwrap().unwrap(), (3, Some(2048)));
        assert_eq!(db.kv_row(0xc).unwrap().unwrap(), (1, Some(512)));
        assert_eq!(db.kv_row(0xd).unwrap().unwrap(), (1, None));
    }

    #[test]
    fn import_refuses_blocksize_mismatch() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        let peer_path = dir.path().join("peer.db");
        PrimaryDb::create(&peer_path).unwrap();
        let peer = PrimaryDb::open(&peer_path).unwrap();
        peer.set_metadata("x1", 8, Method::Lz4, 1, &[2, 4, 8]).unwrap();
        drop(peer);
        assert!(db.import(&peer_path).is_err());
    }

    #[test]
    fn import_refuses_non_store_files() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        let bogus = dir.path().join("bogus.db");
        std::fs::write(&bogus, b"not a database at all").unwrap();
        assert!(db.import(&bogus).is_err());
    }

    #[test]
    fn histograms_count_references_and_sizes() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        // 2 zero blocks, one unique block at 2 KiB, one triple block at 5 KiB
        let s = stage(
            &dir,
            &[
                (0, Some(0)),
                (0, Some(0)),
                (0xa, Some(2048)),
                (0xb, Some(5000)),
                (0xb, Some(5000)),
                (0xb, Some(5000)),
            ],
        );
        db.merge_staging(&s).unwrap();

        assert_eq!(db.blocks_total().unwrap(), 6);
        assert_eq!(db.blocks_free().unwrap(), 2);
        assert_eq!(db.blocks_used().unwrap(), 4);
        assert_eq!(db.blocks_deduped().unwrap(), 2);
        assert_eq!(db.blocks_unique().unwrap(), 1);
        assert_eq!(db.blocks_nonunique().unwrap(), 3);

        // 2 KiB → bucket 2 (1 block), 5 KiB → bucket 8 (1 block)
        let hist = db.compress_histogram().unwrap();
        let sizes: Vec<(u64, u64)> = hist.iter().map(|r| (r.size, r.blocks)).collect();
        assert_eq!(sizes, vec![(2, 1), (8, 1)]);
        // ceil(2*1/16) = 1, ceil(8*1/16) = 1
        assert_eq!(db.allocated_blocks().unwrap(), 2);
    }

    #[test]
    fn top_hash_orders_by_refcount() {
        let dir = TempDir::new().unwrap();
        let db = primary(&dir);
        let s = stage(
            &dir,
            &[(0xa, None), (0xb, None), (0xb, None), (0xb, None), (0xc, None), (0xc, None)],
        );
        db.merge_staging(&s).unwrap();
        let top = db.top_hash(2).unwrap();
        assert_eq!(top, vec![(0xb, 3), (0xc, 2)]);
    }
}
