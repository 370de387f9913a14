//! SQLite-backed persistent embedding store.
//!
//! Each vector is keyed by embedder identity and content fingerprint and
//! stored as a little-endian `f32` blob. The storage layer is opt-in via the
//! `cache` feature. Rows are write-once: a second insert for a key is
//! ignored, so concurrent runs sharing the file never disagree on a vector.
//! Only [`EmbeddingStore::replace`] overwrites.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::embedding::{EmbeddingEntry, EmbeddingStore};
use crate::error::StoreError;

/// SQLite-backed embedding store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path. `:memory:` works for tests.
    pub fn open_or_create(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        drop_unkeyed_table(&conn)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS embeddings (
                model        TEXT NOT NULL,
                fingerprint  TEXT NOT NULL,
                dims         INTEGER NOT NULL,
                vector       BLOB NOT NULL,
                created_at   TEXT NOT NULL,
                PRIMARY KEY (model, fingerprint)
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Summary of the store (for `ticket-topology cache info`).
    pub fn info(&self) -> Result<StoreInfo, StoreError> {
        let conn = self.conn()?;
        let (entries, oldest, newest): (i64, Option<String>, Option<String>) = conn.query_row(
            "SELECT COUNT(*), MIN(created_at), MAX(created_at) FROM embeddings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let mut stmt = conn.prepare(
            "SELECT model, dims, COUNT(*) FROM embeddings
             GROUP BY model, dims ORDER BY model, dims",
        )?;
        let models = stmt
            .query_map([], |row| {
                Ok(ModelSummary {
                    model: row.get(0)?,
                    dimensions: row.get::<_, i64>(1)? as usize,
                    entries: row.get::<_, i64>(2)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        Ok(StoreInfo {
            entries: entries as usize,
            models,
            oldest: oldest.and_then(|s| parse_timestamp(&s)),
            newest: newest.and_then(|s| parse_timestamp(&s)),
            size_bytes: db_size_bytes(&conn)?,
        })
    }

    /// Delete every entry. Returns the number of rows removed.
    pub fn clear(&self) -> Result<usize, StoreError> {
        Ok(self.conn()?.execute("DELETE FROM embeddings", [])?)
    }

    fn insert(&self, entry: &EmbeddingEntry, conflict: &str) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO embeddings (model, fingerprint, dims, vector, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(model, fingerprint) {conflict}"
        );
        self.conn()?.execute(
            &sql,
            params![
                entry.model,
                entry.fingerprint,
                entry.vector.len() as i64,
                encode_vector(&entry.vector),
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

/// Files written before vectors were keyed by model cannot tell which
/// embedder produced a row; their table is dropped and rebuilt.
fn drop_unkeyed_table(conn: &Connection) -> Result<(), StoreError> {
    let columns: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('embeddings')",
        [],
        |row| row.get(0),
    )?;
    let keyed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('embeddings') WHERE name = 'model'",
        [],
        |row| row.get(0),
    )?;
    if columns > 0 && keyed == 0 {
        warn!("embedding cache predates model keys, discarding it");
        conn.execute_batch("DROP TABLE embeddings;")?;
    }
    Ok(())
}

impl EmbeddingStore for SqliteStore {
    fn get(&self, model: &str, fingerprint: &str) -> Result<Option<EmbeddingEntry>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT dims, vector, created_at FROM embeddings
                 WHERE model = ?1 AND fingerprint = ?2",
                params![model, fingerprint],
                |row| {
                    let dims: i64 = row.get(0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    let created_at: String = row.get(2)?;
                    Ok((dims, blob, created_at))
                },
            )
            .optional()?;

        let Some((dims, blob, created_at)) = row else {
            return Ok(None);
        };
        let corrupt = |reason: String| StoreError::Corrupt {
            fingerprint: fingerprint.to_string(),
            reason,
        };
        let vector = decode_vector(&blob).ok_or_else(|| corrupt("blob length".into()))?;
        if vector.len() as i64 != dims {
            return Err(corrupt(format!("{} values, header says {dims}", vector.len())));
        }
        let created_at =
            parse_timestamp(&created_at).ok_or_else(|| corrupt("bad created_at".into()))?;
        Ok(Some(EmbeddingEntry {
            model: model.to_string(),
            fingerprint: fingerprint.to_string(),
            vector,
            created_at,
        }))
    }

    fn put(&self, entry: &EmbeddingEntry) -> Result<(), StoreError> {
        self.insert(entry, "DO NOTHING")
    }

    fn replace(&self, entry: &EmbeddingEntry) -> Result<(), StoreError> {
        self.insert(
            entry,
            "DO UPDATE SET dims = excluded.dims, vector = excluded.vector,
             created_at = excluded.created_at",
        )
    }

    fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Summary returned by [`SqliteStore::info`].
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub entries: usize,
    pub models: Vec<ModelSummary>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

/// Entry count of one (model, dimensions) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub model: String,
    pub dimensions: usize,
    pub entries: usize,
}

/// Total size of the database in bytes (approximate).
fn db_size_bytes(conn: &Connection) -> Result<u64, StoreError> {
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    Ok((page_count * page_size) as u64)
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "hashing/4";

    fn test_db() -> SqliteStore {
        SqliteStore::open_or_create(":memory:").unwrap()
    }

    fn entry(fp: &str, vector: Vec<f32>) -> EmbeddingEntry {
        entry_for(MODEL, fp, vector)
    }

    fn entry_for(model: &str, fp: &str, vector: Vec<f32>) -> EmbeddingEntry {
        EmbeddingEntry {
            model: model.into(),
            fingerprint: fp.into(),
            vector,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn open_or_create_in_memory() {
        let db = test_db();
        assert_eq!(db.len().unwrap(), 0);
        assert_eq!(db.info().unwrap().entries, 0);
    }

    #[test]
    fn put_and_get_roundtrip() {
        let db = test_db();
        db.put(&entry("abc", vec![0.25, -1.5, 3.0])).unwrap();
        let got = db.get(MODEL, "abc").unwrap().unwrap();
        assert_eq!(got.vector, vec![0.25, -1.5, 3.0]);
        assert_eq!(got.fingerprint, "abc");
        assert_eq!(got.model, MODEL);
    }

    #[test]
    fn get_miss_returns_none() {
        assert!(test_db().get(MODEL, "missing").unwrap().is_none());
    }

    #[test]
    fn put_is_write_once() {
        let db = test_db();
        db.put(&entry("abc", vec![1.0])).unwrap();
        db.put(&entry("abc", vec![2.0])).unwrap();
        assert_eq!(db.get(MODEL, "abc").unwrap().unwrap().vector, vec![1.0]);
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn replace_overwrites_dimensions() {
        let db = test_db();
        db.put(&entry("abc", vec![1.0, 0.0])).unwrap();
        db.replace(&entry("abc", vec![0.0, 0.0, 1.0])).unwrap();
        assert_eq!(db.get(MODEL, "abc").unwrap().unwrap().vector, vec![0.0, 0.0, 1.0]);
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn models_are_separate_namespaces() {
        let db = test_db();
        db.put(&entry_for("hashing/256", "abc", vec![1.0])).unwrap();
        db.put(&entry_for("openai/text-embedding-3-small", "abc", vec![2.0, 3.0]))
            .unwrap();
        assert_eq!(db.get("hashing/256", "abc").unwrap().unwrap().vector, vec![1.0]);
        assert_eq!(
            db.get("openai/text-embedding-3-small", "abc").unwrap().unwrap().vector,
            vec![2.0, 3.0]
        );
        assert!(db.get("other", "abc").unwrap().is_none());
        assert_eq!(db.len().unwrap(), 2);
    }

    #[test]
    fn info_groups_models_and_dimensions() {
        let db = test_db();
        db.put(&entry("a", vec![1.0, 2.0])).unwrap();
        db.put(&entry("b", vec![1.0, 2.0])).unwrap();
        db.put(&entry_for("aaa/1", "c", vec![1.0])).unwrap();
        let info = db.info().unwrap();
        assert_eq!(info.entries, 3);
        assert_eq!(
            info.models,
            vec![
                ModelSummary {
                    model: "aaa/1".into(),
                    dimensions: 1,
                    entries: 1
                },
                ModelSummary {
                    model: MODEL.into(),
                    dimensions: 2,
                    entries: 2
                },
            ]
        );
        assert!(info.oldest.is_some());
        assert!(info.size_bytes > 0);
    }

    #[test]
    fn clear_removes_everything() {
        let db = test_db();
        db.put(&entry("a", vec![1.0])).unwrap();
        db.put(&entry("b", vec![1.0])).unwrap();
        assert_eq!(db.clear().unwrap(), 2);
        assert!(db.is_empty().unwrap());
    }

    #[test]
    fn persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();
        SqliteStore::open_or_create(path)
            .unwrap()
            .put(&entry("abc", vec![4.0, 5.0]))
            .unwrap();
        let reopened = SqliteStore::open_or_create(path).unwrap();
        assert_eq!(reopened.get(MODEL, "abc").unwrap().unwrap().vector, vec![4.0, 5.0]);
    }

    #[test]
    fn unkeyed_cache_file_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE embeddings (
                    fingerprint TEXT PRIMARY KEY, dims INTEGER NOT NULL,
                    vector BLOB NOT NULL, created_at TEXT NOT NULL
                 );
                 INSERT INTO embeddings VALUES ('abc', 1, x'0000803f', '2024-01-01T00:00:00Z');",
            )
            .unwrap();
        }
        let db = SqliteStore::open_or_create(path.to_str().unwrap()).unwrap();
        assert_eq!(db.len().unwrap(), 0);
        db.put(&entry("abc", vec![2.0])).unwrap();
        assert_eq!(db.get(MODEL, "abc").unwrap().unwrap().vector, vec![2.0]);
    }

    #[test]
    fn decode_rejects_truncated_blob() {
        assert!(decode_vector(&[0, 0, 0]).is_none());
        assert_eq!(decode_vector(&encode_vector(&[1.5])).unwrap(), vec![1.5]);
    }
}
