//! Periodic metric snapshots (time-series reporting).

use chrono::Utc;
use maestro_core::{SessionId, SessionMetrics};
use rusqlite::{params, Row};

use crate::error::StoreResult;
use crate::records::MetricsSnapshotRecord;
use crate::store::{json_col, parse_ts, uuid_col, Store};

impl Store {
    /// Copy a session's current counters into the snapshot table.
    pub fn insert_metrics_snapshot(
        &self,
        session_id: SessionId,
        metrics: &SessionMetrics,
    ) -> StoreResult<MetricsSnapshotRecord> {
        let payload = serde_json::to_string(metrics)?;
        let captured_at = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO metrics_snapshots (session_id, metrics, captured_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    session_id.to_string(),
                    payload,
                    crate::store::ts(captured_at)
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(MetricsSnapshotRecord {
                id,
                session_id,
                metrics: *metrics,
                captured_at,
            })
        })
    }

    /// Snapshot history of a session, oldest first.
    pub fn snapshots_by_session(
        &self,
        session_id: SessionId,
        limit: Option<usize>,
    ) -> StoreResult<Vec<MetricsSnapshotRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, metrics, captured_at
                 FROM metrics_snapshots
                 WHERE session_id = ?1
                 ORDER BY id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![
                    session_id.to_string(),
                    limit.map_or(i64::MAX, |l| i64::try_from(l).unwrap_or(i64::MAX)),
                ],
                row_to_snapshot,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<MetricsSnapshotRecord> {
    let metrics: String = row.get(2)?;
    Ok(MetricsSnapshotRecord {
        id: row.get(0)?,
        session_id: uuid_col(&row.get::<_, String>(1)?)?,
        metrics: json_col(&metrics)?,
        captured_at: parse_ts(&row.get::<_, String>(3)?)?,
    })
}
