//! Store layer: a thin wrapper over file-backed SQLite plus the two store
//! types built on it.
//!
//! - [`StagingDb`]: per-scan append-only observation log
//! - [`PrimaryDb`]: persistent aggregated store
//!
//! The wrapper owns path hygiene (device/proc/sys refusal, `.db` suffix),
//! the magic-string check that gates deletion, and the pragmas both stores
//! run with (journal and sync off; a half-written store is deleted, never
//! repaired).

pub mod primary;
pub mod staging;

pub use primary::PrimaryDb;
pub use staging::StagingDb;

use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;
use rusqlite::Connection;

use crate::error::{Error, Result};

const SQLITE_MAGIC: &[u8] = b"SQLite format 3";

pub struct Db {
    conn: Connection,
    path: PathBuf,
}

impl Db {
    /// Open an existing store file read-write.
    pub fn open(path: &Path) -> Result<Db> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
        )?;
        conn.execute_batch(
            "PRAGMA journal_mode = off;\n\
             PRAGMA synchronous = off;\n\
             PRAGMA mmap_size = 65536;",
        )?;
        debug!("store opened: {}", path.display());
        Ok(Db {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Create a new store file and run `schema` on it. Refuses to overwrite.
    /// The initial vacuum forces the file header to be written so the magic
    /// check recognizes even an otherwise empty store.
    pub fn create(path: &Path, schema: &str) -> Result<()> {
        if path.exists() {
            return Err(Error::Store(format!(
                "file already exists: {}",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("vacuum")?;
        conn.execute_batch(schema)?;
        debug!("store created: {}", path.display());
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filesize(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Echo every statement to stderr (the `--queries` switch).
    pub fn trace(&mut self) {
        self.conn.trace(Some(|sql| eprintln!("{sql}")));
    }

    pub fn attach(&self, alias: &str, path: &Path) -> Result<()> {
        self.conn.execute(
            "attach database ?1 as ?2",
            rusqlite::params![path.to_string_lossy().into_owned(), alias],
        )?;
        Ok(())
    }

    pub fn detach(&self, alias: &str) -> Result<()> {
        self.conn.execute("detach database ?1", [alias])?;
        Ok(())
    }

    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("begin")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("commit")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("rollback")?;
        Ok(())
    }

    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("vacuum")?;
        Ok(())
    }

    /// Scalar query returning 0 when the result set is empty or NULL.
    pub fn get_u64(&self, sql: &str) -> Result<u64> {
        let v: Option<i64> = self
            .conn
            .query_row(sql, [], |r| r.get(0))
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(v.unwrap_or(0) as u64)
    }

    /// Scalar query returning 0.0 when the result set is empty or NULL.
    pub fn get_f64(&self, sql: &str) -> Result<f64> {
        let v: Option<f64> = self
            .conn
            .query_row(sql, [], |r| r.get(0))
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(v.unwrap_or(0.0))
    }
}

/// True if the file starts with the SQLite magic string. A zero-length file
/// also passes: a store created but never written still belongs to us.
pub fn is_store_file(path: &Path) -> bool {
    let mut buf = [0u8; 15];
    let Ok(mut f) = std::fs::File::open(path) else {
        return false;
    };
    match f.read(&mut buf) {
        Ok(0) => true,
        Ok(n) => n == SQLITE_MAGIC.len() && buf[..] == *SQLITE_MAGIC,
        Err(_) => false,
    }
}

/// Delete a store file, but only if the magic check confirms it is one.
pub fn delete_store(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if !is_store_file(path) {
        return Err(Error::Store(format!(
            "not a store file, refusing to delete: {}",
            path.display()
        )));
    }
    std::fs::remove_file(path).map_err(|source| Error::Io {
        context: format!("deleting {}", path.display()),
        source,
    })?;
    debug!("store deleted: {}", path.display());
    Ok(())
}

/// Resolve and sanity-check a store path. Relative paths are anchored at the
/// current directory, an empty name falls back to `$HOME/qdda.db`, and a
/// `.db` suffix is appended when missing. Paths under `/dev`, `/proc`,
/// `/sys` or directly in `/` are refused, since SQLite would happily scribble
/// over a device node.
pub fn sanitize_store_path(name: &str) -> Result<PathBuf> {
    let mut name = name.to_owned();
    if name.is_empty() {
        let home = std::env::var("HOME")
            .map_err(|_| Error::usage("cannot determine $HOME for the default store path"))?;
        name = format!("{home}/qdda.db");
    }
    if !name.starts_with('/') {
        let cwd = std::env::current_dir().map_err(|source| Error::Io {
            context: "getting current directory".into(),
            source,
        })?;
        name = format!("{}/{}", cwd.display(), name);
    }
    while name.contains("//") {
        name = name.replace("//", "/");
    }
    for refused in ["/dev", "/proc", "/sys"] {
        if name.starts_with(refused) {
            return Err(Error::Store(format!("{refused} not allowed in store path: {name}")));
        }
    }
    if name.rfind('/') == Some(0) {
        return Err(Error::Store(format!("root directory not allowed: {name}")));
    }
    if !name.contains(".db") {
        name.push_str(".db");
    }
    Ok(PathBuf::from(name))
}

/// The staging store path that belongs to a primary store path:
/// `foo.db` → `foo-staging.db`.
pub fn staging_path(primary: &Path) -> PathBuf {
    let s = primary.to_string_lossy();
    let base = match s.find(".db") {
        Some(ix) => &s[..ix],
        None => &s,
    };
    PathBuf::from(format!("{base}-staging.db"))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_refuses_device_paths() {
        assert!(sanitize_store_path("/dev/sda").is_err());
        assert!(sanitize_store_path("/proc/self/mem").is_err());
        assert!(sanitize_store_path("/sys/kernel").is_err());
        assert!(sanitize_store_path("/rootfile").is_err());
    }

    #[test]
    fn sanitize_appends_db_suffix() {
        let p = sanitize_store_path("/tmp/scans/mydata").unwrap();
        assert_eq!(p, PathBuf::from("/tmp/scans/mydata.db"));
    }

    #[test]
    fn sanitize_keeps_existing_suffix() {
        let p = sanitize_store_path("/tmp/scans/mydata.db").unwrap();
        assert_eq!(p, PathBuf::from("/tmp/scans/mydata.db"));
    }

    #[test]
    fn sanitize_collapses_double_slashes() {
        let p = sanitize_store_path("/tmp//scans///x.db").unwrap();
        assert_eq!(p, PathBuf::from("/tmp/scans/x.db"));
    }

    #[test]
    fn staging_path_derives_from_primary() {
        assert_eq!(
            staging_path(Path::new("/tmp/qdda.db")),
            PathBuf::from("/tmp/qdda-staging.db")
        );
    }

    #[test]
    fn magic_check_accepts_real_store_and_rejects_others() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("s.db");
        Db::create(&store, "create table t(x);").unwrap();
        assert!(is_store_file(&store));

        let other = dir.path().join("plain.txt");
        std::fs::write(&other, b"hello world, definitely not a store").unwrap();
        assert!(!is_store_file(&other));
        assert!(delete_store(&other).is_err());
        assert!(other.exists());

        delete_store(&store).unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn empty_file_counts_as_store() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.db");
        std::fs::write(&empty, b"").unwrap();
        assert!(is_store_file(&empty));
        delete_store(&empty).unwrap();
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("s.db");
        Db::create(&store, "create table t(x);").unwrap();
        assert!(Db::create(&store, "create table t(x);").is_err());
    }
}
