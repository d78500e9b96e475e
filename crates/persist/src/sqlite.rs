use anyhow::{Context, Result};
use metrics::{counter, histogram};
use serde_json::Value;

use crate::{ContextDb, DocStore, Versioned};

/// Document and context store over a single SQLite connection.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        if let Some(dir) = std::path::Path::new(path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))?;
            }
        }
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        Self::init(db, started)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db, std::time::Instant::now())
    }

    fn init(db: rusqlite::Connection, started: std::time::Instant) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS docs (
                coll    TEXT NOT NULL,
                key     TEXT NOT NULL,
                tag     TEXT NOT NULL,
                version INTEGER NOT NULL,
                doc     TEXT NOT NULL,
                PRIMARY KEY (coll, key, tag)
            )",
            [],
        ).context("creating docs table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS ctx (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        ).context("creating ctx table")?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> { self.db.lock().unwrap_or_else(|e| e.into_inner()) }
}

fn parse(text: &str) -> Result<Value> { serde_json::from_str(text).context("decoding stored json") }

impl DocStore for SqliteStore {
    fn insert(&self, collection: &str, key: &str, tag: &str, doc: Value) -> Result<()> {
        let started = std::time::Instant::now();
        self.conn().execute(
            "INSERT INTO docs(coll, key, tag, version, doc) VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(coll, key, tag) DO UPDATE SET version = version + 1, doc = excluded.doc",
            (collection, key, tag, doc.to_string()),
        ).with_context(|| format!("inserting {}/{}", collection, tag))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn find(&self, collection: &str, key: &str, tag: &str) -> Result<Vec<Value>> {
        Ok(self.find_versioned(collection, key, tag)?.map(|v| vec![v.doc]).unwrap_or_default())
    }

    fn remove(&self, collection: &str, key: &str) -> Result<()> {
        self.conn().execute("DELETE FROM docs WHERE coll = ?1 AND key = ?2", (collection, key))?;
        Ok(())
    }

    fn find_versioned(&self, collection: &str, key: &str, tag: &str) -> Result<Option<Versioned>> {
        let started = std::time::Instant::now();
        let db = self.conn();
        let mut stmt = db.prepare("SELECT version, doc FROM docs WHERE coll = ?1 AND key = ?2 AND tag = ?3")?;
        let mut rows = stmt.query((collection, key, tag))?;
        let out = match rows.next()? {
            Some(row) => {
                let version: i64 = row.get(0)?;
                let text: String = row.get(1)?;
                Some(Versioned { version: version as u64, doc: parse(&text)? })
            }
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn insert_if_version(&self, collection: &str, key: &str, tag: &str, doc: Value, expected: Option<u64>) -> Result<bool> {
        let db = self.conn();
        let changed = match expected {
            None => db.execute(
                "INSERT OR IGNORE INTO docs(coll, key, tag, version, doc) VALUES (?1, ?2, ?3, 1, ?4)",
                (collection, key, tag, doc.to_string()),
            )?,
            Some(v) => db.execute(
                "UPDATE docs SET version = version + 1, doc = ?4 WHERE coll = ?1 AND key = ?2 AND tag = ?3 AND version = ?5",
                (collection, key, tag, doc.to_string(), v as i64),
            )?,
        };
        if changed == 1 {
            counter!("persist_put_total", 1u64);
            Ok(true)
        } else {
            counter!("persist_cas_conflict_total", 1u64);
            Ok(false)
        }
    }
}

impl ContextDb for SqliteStore {
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let started = std::time::Instant::now();
        self.conn().execute(
            "INSERT INTO ctx(key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (key, value.to_string()),
        ).with_context(|| format!("writing {}", key))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT value FROM ctx WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => {
                let text: String = row.get(0)?;
                Ok(Some(parse(&text)?))
            }
            None => Ok(None),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT key FROM ctx WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")?;
        let mut rows = stmt.query([prefix])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.conn().execute("DELETE FROM ctx WHERE key = ?1", [key])?;
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.conn().execute("DELETE FROM ctx WHERE substr(key, 1, length(?1)) = ?1", [prefix])?;
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        self.conn().query_row("SELECT 1", [], |_| Ok(())).context("sqlite health check")
    }
}
