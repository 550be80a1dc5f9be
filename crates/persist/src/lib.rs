//! Ordo persistence: durable key-value storage for caches that must survive
//! a restart. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Durable key -> blob mapping. Implementations are synchronous; async callers
/// should hop onto a blocking thread.
pub trait KvStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// SQLite-backed store. Simple, synchronous.
pub struct SqliteKv {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteKv {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("ORDO_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY NOT NULL,
                value BLOB NOT NULL,
                ts    INTEGER NOT NULL
            )",
            [],
        )
        .context("creating kv table")?;
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KvStore for SqliteKv {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let started = std::time::Instant::now();
        let db = self.conn();
        let mut stmt = db.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        let out = match rows.next()? {
            Some(row) => {
                let blob: Vec<u8> = row.get(0)?;
                Some(maybe_decompress(&blob))
            }
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO kv(key, value, ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, ts = excluded.ts",
            (key, maybe_compress(value), now_ts()),
        )
        .with_context(|| format!("writing key {}", key))?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.conn().execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// Process-local store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self { Self::default() }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KvStore for MemoryKv {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> { Ok(self.map().get(key).cloned()) }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map().remove(key);
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".ordo");
        let _ = std::fs::create_dir_all(&p);
        p.push("ordo.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "ordo.db".to_string()
}

fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(bytes: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("ORDO_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(bytes, lvl).unwrap_or_else(|_| bytes.to_vec());
    }
    #[allow(unreachable_code)]
    bytes.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("ordo-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    #[test]
    fn put_get_overwrite() {
        let path = temp_db();
        let s = SqliteKv::open(&path).unwrap();
        assert_eq!(s.read("counts").unwrap(), None);
        s.write("counts", b"{\"a\":1}").unwrap();
        s.write("counts", b"{\"a\":2}").unwrap();
        assert_eq!(s.read("counts").unwrap().as_deref(), Some(&b"{\"a\":2}"[..]));
        s.delete("counts").unwrap();
        assert_eq!(s.read("counts").unwrap(), None);
    }

    #[test]
    fn survives_reopen() {
        let path = temp_db();
        {
            let s = SqliteKv::open(&path).unwrap();
            s.write("k", b"v").unwrap();
        }
        let s = SqliteKv::open(&path).unwrap();
        assert_eq!(s.read("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn memory_kv_roundtrip() {
        let m = MemoryKv::new();
        m.write("k", b"v").unwrap();
        assert_eq!(m.read("k").unwrap(), Some(b"v".to_vec()));
        m.delete("k").unwrap();
        assert_eq!(m.read("k").unwrap(), None);
    }
}
