//! Per-scan staging store: an append-only log of `(hash, compressed bytes)`
//! observations plus one file row per scanned stream.
//!
//! The staging store lives for a single scan. It is created fresh before the
//! pipeline starts, folded into the primary store by the merge step, and
//! deleted afterwards, or deleted unmerged if the scan was interrupted.

use std::path::Path;

use gethostname::gethostname;
use rusqlite::params;

use crate::db::{delete_store, Db};
use crate::error::Result;
use crate::util::epoch;

const SCHEMA: &str = "\
PRAGMA journal_mode = off;
PRAGMA synchronous = off;
CREATE TABLE IF NOT EXISTS metadata(lock char(1) not null default 1
, blksz integer
, constraint pk_meta primary key(lock), constraint ck_meta_lock check (lock=1));
CREATE TABLE IF NOT EXISTS files(id integer primary key autoincrement
, name TEXT, hostname TEXT, timestamp integer, blocks integer, bytes integer);
CREATE TABLE IF NOT EXISTS staging(id integer primary key autoincrement, hash integer, bytes integer);
CREATE VIEW IF NOT EXISTS offsets as
  with m(b) as (select blksz from metadata)
  select hash, printf('%0#16x', hash) hexhash, (id-1) offset, (id-1)*m.b*1024 bytes
  from staging, m;
";

pub struct StagingDb {
    db: Db,
}

impl StagingDb {
    /// Create a fresh staging store for the given blocksize (KiB).
    pub fn create(path: &Path, blocksize_kib: u32) -> Result<()> {
        Db::create(path, SCHEMA)?;
        let db = Db::open(path)?;
        db.conn().execute(
            "insert into metadata (blksz) values (?1)",
            params![blocksize_kib],
        )?;
        Ok(())
    }

    pub fn open(path: &Path) -> Result<StagingDb> {
        Ok(StagingDb {
            db: Db::open(path)?,
        })
    }

    pub fn blocksize(&self) -> Result<u32> {
        Ok(self.db.get_u64("select blksz from metadata")? as u32)
    }

    pub fn rows(&self) -> Result<u64> {
        self.db.get_u64("select count(*) from staging")
    }

    pub fn filesize(&self) -> u64 {
        self.db.filesize()
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    pub fn begin(&self) -> Result<()> {
        self.db.begin()
    }

    pub fn commit(&self) -> Result<()> {
        self.db.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.db.rollback()
    }

    /// Append one observation. `bytes` is `None` for blocks the sampling
    /// predicate skipped; those land as NULL and are excluded from the
    /// compression histogram.
    pub fn insert_block(&self, hash: u64, bytes: Option<u32>) -> Result<()> {
        let mut stmt = self
            .db
            .conn()
            .prepare_cached("insert into staging(hash, bytes) values (?1, ?2)")?;
        stmt.execute(params![hash as i64, bytes])?;
        Ok(())
    }

    /// Record a finished stream.
    pub fn insert_file(&self, name: &str, blocks: u64, bytes: u64) -> Result<()> {
        let mut stmt = self.db.conn().prepare_cached(
            "insert into files (name, hostname, timestamp, blocks, bytes) values (?1, ?2, ?3, ?4, ?5)",
        )?;
        stmt.execute(params![
            name,
            gethostname().to_string_lossy().into_owned(),
            epoch() as i64,
            blocks as i64,
            bytes as i64,
        ])?;
        Ok(())
    }

    /// Occurrences of one hash with their block and byte offsets
    /// (the `--findhash` diagnostic).
    pub fn find_hash(&self, hash: u64) -> Result<Vec<(String, u64, u64)>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("select hexhash, offset, bytes from offsets where hash = ?1")?;
        let rows = stmt
            .query_map(params![hash as i64], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)? as u64,
                    r.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Close and delete the staging file (interrupted or merged scan).
    pub fn remove(self) -> Result<()> {
        let path = self.db.path().to_path_buf();
        drop(self);
        delete_store(&path)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staging(dir: &TempDir) -> StagingDb {
        let path = dir.path().join("scan-staging.db");
        StagingDb::create(&path, 16).unwrap();
        StagingDb::open(&path).unwrap()
    }

    #[test]
    fn blocksize_is_persisted() {
        let dir = TempDir::new().unwrap();
        let db = staging(&dir);
        assert_eq!(db.blocksize().unwrap(), 16);
    }

    #[test]
    fn inserts_accumulate_rows() {
        let dir = TempDir::new().unwrap();
        let db = staging(&dir);
        db.begin().unwrap();
        db.insert_block(0, Some(0)).unwrap();
        db.insert_block(0xabc, Some(4096)).unwrap();
        db.insert_block(0xabc, None).unwrap();
        db.commit().unwrap();
        assert_eq!(db.rows().unwrap(), 3);
    }

    #[test]
    fn rollback_discards_observations() {
        let dir = TempDir::new().unwrap();
        let db = staging(&dir);
        db.begin().unwrap();
        db.insert_block(1, Some(100)).unwrap();
        db.rollback().unwrap();
        assert_eq!(db.rows().unwrap(), 0);
    }

    #[test]
    fn find_hash_reports_offsets() {
        let dir = TempDir::new().unwrap();
        let db = staging(&dir);
        db.insert_block(0x1234, Some(2048)).unwrap();
        db.insert_block(0x9999, None).unwrap();
        db.insert_block(0x1234, None).unwrap();
        let hits = db.find_hash(0x1234).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1, 0); // first row, block offset 0
        assert_eq!(hits[1].1, 2);
        assert_eq!(hits[1].2, 2 * 16 * 1024); // byte offset
    }

    #[test]
    fn remove_deletes_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan-staging.db");
        StagingDb::create(&path, 16).unwrap();
        let db = StagingDb::open(&path).unwrap();
        db.remove().unwrap();
        assert!(!path.exists());
    }
}
