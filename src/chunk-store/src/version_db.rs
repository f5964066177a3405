use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{ChunkId, StoreError, StoreResult};

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One historical snapshot of a directory: a monotonic index paired with
/// the content hash of the serialized blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionName {
    pub index: u64,
    pub id: ChunkId,
}

impl VersionName {
    pub fn new(index: u64, id: ChunkId) -> Self {
        Self { index, id }
    }
}

/// Append-only per-directory version chain with bounded history.
///
/// Each `record` call appends one `(old_head, new_head)` transition. The
/// old head must match the stored head; a mismatch means the caller lost a
/// race it was supposed to be protected against.
pub struct StructuredVersions {
    conn: Mutex<Connection>,
    max_versions: usize,
}

impl StructuredVersions {
    pub fn open(db_path: &Path, max_versions: usize) -> StoreResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::DbError(format!("open version db failed: {}", e)))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS version_chain (
                directory_id TEXT NOT NULL,
                version_index INTEGER NOT NULL,
                version_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (directory_id, version_index)
            )",
            [],
        )
        .map_err(|e| StoreError::DbError(format!("create version table failed: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_versions: max_versions.max(1),
        })
    }

    /// Append `new_head` for `directory_id`. `old_head` is `None` for the
    /// first version of a directory.
    pub fn record(
        &self,
        directory_id: &str,
        old_head: Option<&VersionName>,
        new_head: &VersionName,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let current = Self::head_locked(&conn, directory_id)?;
        match (&current, old_head) {
            (None, None) => {}
            (Some(cur), Some(old)) if cur == old => {}
            _ => {
                return Err(StoreError::InvalidData(format!(
                    "version head mismatch for {}: have {:?}, caller expected {:?}",
                    directory_id, current, old_head
                )));
            }
        }
        conn.execute(
            "INSERT INTO version_chain (directory_id, version_index, version_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                directory_id,
                new_head.index as i64,
                new_head.id.as_str(),
                unix_timestamp() as i64
            ],
        )
        .map_err(|e| StoreError::DbError(format!("insert version failed: {}", e)))?;
        // evict the oldest rows past the bound
        conn.execute(
            "DELETE FROM version_chain WHERE directory_id = ?1 AND version_index <= ?2",
            params![
                directory_id,
                new_head.index as i64 - self.max_versions as i64
            ],
        )
        .map_err(|e| StoreError::DbError(format!("trim versions failed: {}", e)))?;
        debug!(
            "recorded version {} of {} as {}",
            new_head.index, directory_id, new_head.id
        );
        Ok(())
    }

    pub fn head(&self, directory_id: &str) -> StoreResult<Option<VersionName>> {
        let conn = self.conn.lock().unwrap();
        Self::head_locked(&conn, directory_id)
    }

    /// All retained versions, most recent first.
    pub fn versions(&self, directory_id: &str) -> StoreResult<Vec<VersionName>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT version_index, version_id FROM version_chain
                 WHERE directory_id = ?1 ORDER BY version_index DESC",
            )
            .map_err(|e| StoreError::DbError(format!("prepare versions failed: {}", e)))?;
        let rows = stmt
            .query_map(params![directory_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| StoreError::DbError(format!("query versions failed: {}", e)))?;
        let mut result = Vec::new();
        for row in rows {
            let (index, id_str) =
                row.map_err(|e| StoreError::DbError(format!("read version row failed: {}", e)))?;
            result.push(VersionName::new(index as u64, ChunkId::new(&id_str)?));
        }
        Ok(result)
    }

    fn head_locked(conn: &Connection, directory_id: &str) -> StoreResult<Option<VersionName>> {
        let row = conn
            .query_row(
                "SELECT version_index, version_id FROM version_chain
                 WHERE directory_id = ?1 ORDER BY version_index DESC LIMIT 1",
                params![directory_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| StoreError::DbError(format!("query head failed: {}", e)))?;
        match row {
            Some((index, id_str)) => Ok(Some(VersionName::new(index as u64, ChunkId::new(&id_str)?))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn version(index: u64, seed: u8) -> VersionName {
        VersionName::new(index, ChunkId::hash_bytes(&[seed]))
    }

    #[test]
    fn test_chain_advances_and_serves_head() {
        let dir = tempdir().unwrap();
        let db = StructuredVersions::open(&dir.path().join("v.db"), 100).unwrap();
        let v0 = version(0, 1);
        let v1 = version(1, 2);
        db.record("dir-a", None, &v0).unwrap();
        db.record("dir-a", Some(&v0), &v1).unwrap();
        assert_eq!(db.head("dir-a").unwrap(), Some(v1.clone()));
        assert_eq!(db.versions("dir-a").unwrap(), vec![v1, v0]);
        assert_eq!(db.head("dir-b").unwrap(), None);
    }

    #[test]
    fn test_head_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let db = StructuredVersions::open(&dir.path().join("v.db"), 100).unwrap();
        let v0 = version(0, 1);
        db.record("dir-a", None, &v0).unwrap();
        let stale = version(5, 9);
        let v1 = version(1, 2);
        assert!(matches!(
            db.record("dir-a", Some(&stale), &v1),
            Err(StoreError::InvalidData(_))
        ));
        assert!(matches!(
            db.record("dir-a", None, &v1),
            Err(StoreError::InvalidData(_))
        ));
    }

    #[test]
    fn test_history_is_bounded() {
        let dir = tempdir().unwrap();
        let db = StructuredVersions::open(&dir.path().join("v.db"), 2).unwrap();
        let mut prev: Option<VersionName> = None;
        for i in 0..5u64 {
            let v = version(i, i as u8 + 10);
            db.record("dir-a", prev.as_ref(), &v).unwrap();
            prev = Some(v);
        }
        let versions = db.versions("dir-a").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].index, 4);
        assert_eq!(versions[1].index, 3);
    }
}
