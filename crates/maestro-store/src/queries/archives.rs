//! Archive rows.

use chrono::Utc;
use maestro_core::{ArchiveId, ManifestEntry, SessionId};
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{StoreError, StoreResult};
use crate::records::{compression_parse, ArchiveRecord, ArchiveStatus};
use crate::store::{col_u64, de, json_col, parse_opt_ts, parse_ts, to_i64, uuid_col, Store};

const ARCHIVE_SELECT: &str = r#"
    SELECT id, session_id, path, size_bytes, compression, manifest, status,
           error, created_at, archived_at
    FROM archives
"#;

impl Store {
    /// Create an archive row (normally in PENDING).
    ///
    /// The `UNIQUE(session_id)` constraint makes a second archive for the
    /// same session a [`StoreError::Conflict`].
    pub fn insert_archive(&self, record: &ArchiveRecord) -> StoreResult<()> {
        let manifest = serde_json::to_string(&record.manifest)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO archives (
                    id, session_id, path, size_bytes, compression, manifest,
                    status, error, created_at, archived_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    record.id.to_string(),
                    record.session_id.to_string(),
                    record.path,
                    to_i64(record.size_bytes),
                    record.compression.to_string(),
                    manifest,
                    record.status.as_str(),
                    record.error,
                    crate::store::ts(record.created_at),
                    record.archived_at.map(crate::store::ts),
                ],
            )?;
            Ok(())
        })
    }

    /// Move an archive to IN_PROGRESS.
    pub fn mark_archive_in_progress(&self, id: ArchiveId) -> StoreResult<()> {
        self.set_archive_status(id, "UPDATE archives SET status = 'in_progress' WHERE id = ?1")
    }

    /// Finish an archive with its blob location, size, and manifest.
    pub fn complete_archive(
        &self,
        id: ArchiveId,
        path: &str,
        size_bytes: u64,
        manifest: &[ManifestEntry],
    ) -> StoreResult<()> {
        let manifest = serde_json::to_string(manifest)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                r#"
                UPDATE archives
                SET status = 'completed', path = ?2, size_bytes = ?3, manifest = ?4,
                    error = NULL, archived_at = ?5
                WHERE id = ?1
                "#,
                params![
                    id.to_string(),
                    path,
                    to_i64(size_bytes),
                    manifest,
                    crate::store::ts(Utc::now()),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("archive", id));
            }
            Ok(())
        })
    }

    /// Record an archival failure.
    pub fn fail_archive(&self, id: ArchiveId, error: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE archives SET status = 'failed', error = ?2 WHERE id = ?1",
                params![id.to_string(), error],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("archive", id));
            }
            Ok(())
        })
    }

    /// The archive of a session, if any.
    pub fn archive_by_session(&self, session_id: SessionId) -> StoreResult<Option<ArchiveRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("{ARCHIVE_SELECT} WHERE session_id = ?1"),
                    [session_id.to_string()],
                    row_to_archive,
                )
                .optional()?)
        })
    }

    /// Oldest archives still waiting to be produced.
    pub fn pending_archives(&self, limit: usize) -> StoreResult<Vec<ArchiveRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{ARCHIVE_SELECT} WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(
                [i64::try_from(limit).unwrap_or(i64::MAX)],
                row_to_archive,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn set_archive_status(&self, id: ArchiveId, sql: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(sql, [id.to_string()])?;
            if updated == 0 {
                return Err(StoreError::not_found("archive", id));
            }
            Ok(())
        })
    }
}

fn row_to_archive(row: &Row<'_>) -> rusqlite::Result<ArchiveRecord> {
    let compression: String = row.get(4)?;
    let manifest: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(ArchiveRecord {
        id: uuid_col(&row.get::<_, String>(0)?)?,
        session_id: uuid_col(&row.get::<_, String>(1)?)?,
        path: row.get(2)?,
        size_bytes: col_u64(row.get(3)?),
        compression: compression_parse(&compression).map_err(de)?,
        manifest: json_col(&manifest)?,
        status: ArchiveStatus::parse(&status).map_err(de)?,
        error: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
        archived_at: parse_opt_ts(row.get(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::Compression;

    fn pending(session_id: SessionId) -> ArchiveRecord {
        ArchiveRecord {
            id: ArchiveId::new(),
            session_id,
            path: String::new(),
            size_bytes: 0,
            compression: Compression::Gzip,
            manifest: Vec::new(),
            status: ArchiveStatus::Pending,
            error: None,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    #[test]
    fn archive_lifecycle() {
        let store = Store::open_in_memory().expect("store");
        let session_id = SessionId::new();
        let record = pending(session_id);
        store.insert_archive(&record).expect("insert");
        store.mark_archive_in_progress(record.id).expect("progress");

        let manifest = vec![ManifestEntry {
            relpath: "a.txt".into(),
            size: 100,
            sha256: "ab".repeat(32),
        }];
        store
            .complete_archive(record.id, "/archives/x.tar.gz", 512, &manifest)
            .expect("complete");

        let loaded = store
            .archive_by_session(session_id)
            .expect("query")
            .expect("present");
        assert_eq!(loaded.status, ArchiveStatus::Completed);
        assert_eq!(loaded.size_bytes, 512);
        assert_eq!(loaded.manifest, manifest);
        assert!(loaded.archived_at.is_some());
    }

    #[test]
    fn one_archive_per_session() {
        let store = Store::open_in_memory().expect("store");
        let session_id = SessionId::new();
        store.insert_archive(&pending(session_id)).expect("first");
        let err = store.insert_archive(&pending(session_id)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn pending_listing_respects_limit() {
        let store = Store::open_in_memory().expect("store");
        for _ in 0..3 {
            store.insert_archive(&pending(SessionId::new())).expect("insert");
        }
        let failed = pending(SessionId::new());
        store.insert_archive(&failed).expect("insert");
        store.fail_archive(failed.id, "disk full").expect("fail");

        assert_eq!(store.pending_archives(2).expect("page").len(), 2);
        assert_eq!(store.pending_archives(10).expect("all").len(), 3);
    }
}
