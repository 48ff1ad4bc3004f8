//! Tool execution rows.

use chrono::Utc;
use maestro_core::{SessionId, ToolExecutionId};
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{StoreError, StoreResult};
use crate::records::{PermissionVerdict, ToolExecutionRecord, ToolStatus};
use crate::store::{de, json_col, opt_col_u64, parse_opt_ts, parse_ts, to_i64, uuid_col, Store};

const TOOL_SELECT: &str = r#"
    SELECT id, session_id, tool_use_id, tool_name, input, output, status,
           error_message, duration_ms, permission_decision, permission_reason,
           started_at, completed_at
    FROM tool_executions
"#;

impl Store {
    /// Record a newly observed tool call.
    ///
    /// Exactly one row may exist per `(session_id, tool_use_id)`; a second
    /// insert surfaces as [`StoreError::Conflict`]. Bumps
    /// `total_tool_calls` in the same transaction.
    pub fn record_tool_start(&self, record: &ToolExecutionRecord) -> StoreResult<()> {
        let input = serde_json::to_string(&record.input)?;
        let output = record
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO tool_executions (
                    id, session_id, tool_use_id, tool_name, input, output, status,
                    error_message, duration_ms, permission_decision, permission_reason,
                    started_at, completed_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    record.id.to_string(),
                    record.session_id.to_string(),
                    record.tool_use_id,
                    record.tool_name,
                    input,
                    output,
                    record.status.as_str(),
                    record.error_message,
                    record.duration_ms.map(to_i64),
                    record.permission_decision.as_str(),
                    record.permission_reason,
                    crate::store::ts(record.started_at),
                    record.completed_at.map(crate::store::ts),
                ],
            )?;
            tx.execute(
                "UPDATE sessions SET total_tool_calls = total_tool_calls + 1, updated_at = ?2
                 WHERE id = ?1",
                params![record.session_id.to_string(), crate::store::ts(Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Record the permission layer's verdict for a pending call.
    pub fn update_tool_permission(
        &self,
        session_id: SessionId,
        tool_use_id: &str,
        verdict: PermissionVerdict,
        reason: Option<&str>,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                r#"
                UPDATE tool_executions
                SET permission_decision = ?3, permission_reason = ?4
                WHERE session_id = ?1 AND tool_use_id = ?2
                "#,
                params![
                    session_id.to_string(),
                    tool_use_id,
                    verdict.as_str(),
                    reason
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("tool_execution", tool_use_id));
            }
            Ok(())
        })
    }

    /// Move a pending call to RUNNING.
    pub fn mark_tool_running(&self, session_id: SessionId, tool_use_id: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tool_executions SET status = 'running'
                 WHERE session_id = ?1 AND tool_use_id = ?2",
                params![session_id.to_string(), tool_use_id],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("tool_execution", tool_use_id));
            }
            Ok(())
        })
    }

    /// Finish a call with a terminal status; computes `duration_ms` from
    /// the recorded start time.
    pub fn complete_tool_execution(
        &self,
        session_id: SessionId,
        tool_use_id: &str,
        status: ToolStatus,
        output: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        debug_assert!(status.is_terminal());
        let output = output.map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let started: Option<String> = tx
                .query_row(
                    "SELECT started_at FROM tool_executions
                     WHERE session_id = ?1 AND tool_use_id = ?2",
                    params![session_id.to_string(), tool_use_id],
                    |row| row.get(0),
                )
                .optional()?;
            let started =
                started.ok_or_else(|| StoreError::not_found("tool_execution", tool_use_id))?;
            let started_at = chrono::DateTime::parse_from_rfc3339(&started)
                .map_err(|e| StoreError::Fatal(format!("bad started_at column: {e}")))?
                .with_timezone(&Utc);
            let now = Utc::now();
            let duration_ms = u64::try_from((now - started_at).num_milliseconds().max(0))
                .unwrap_or(0);

            tx.execute(
                r#"
                UPDATE tool_executions
                SET status = ?3, output = ?4, error_message = ?5,
                    completed_at = ?6, duration_ms = ?7
                WHERE session_id = ?1 AND tool_use_id = ?2
                "#,
                params![
                    session_id.to_string(),
                    tool_use_id,
                    status.as_str(),
                    output,
                    error_message,
                    crate::store::ts(now),
                    to_i64(duration_ms),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// One call by its agent-side correlation id.
    pub fn get_tool_execution(
        &self,
        session_id: SessionId,
        tool_use_id: &str,
    ) -> StoreResult<ToolExecutionRecord> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{TOOL_SELECT} WHERE session_id = ?1 AND tool_use_id = ?2"),
                params![session_id.to_string(), tool_use_id],
                row_to_tool,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("tool_execution", tool_use_id))
        })
    }

    /// All of a session's tool calls, in observation order.
    pub fn tool_executions_by_session(
        &self,
        session_id: SessionId,
    ) -> StoreResult<Vec<ToolExecutionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{TOOL_SELECT} WHERE session_id = ?1 ORDER BY started_at ASC, tool_use_id ASC"
            ))?;
            let rows = stmt.query_map([session_id.to_string()], row_to_tool)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

fn row_to_tool(row: &Row<'_>) -> rusqlite::Result<ToolExecutionRecord> {
    let input: String = row.get(4)?;
    let output: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;
    let verdict: String = row.get(9)?;
    Ok(ToolExecutionRecord {
        id: uuid_col(&row.get::<_, String>(0)?)?,
        session_id: uuid_col(&row.get::<_, String>(1)?)?,
        tool_use_id: row.get(2)?,
        tool_name: row.get(3)?,
        input: json_col(&input)?,
        output: output.as_deref().map(json_col).transpose()?,
        status: ToolStatus::parse(&status).map_err(de)?,
        error_message: row.get(7)?,
        duration_ms: opt_col_u64(row.get(8)?),
        permission_decision: PermissionVerdict::parse(&verdict).map_err(de)?,
        permission_reason: row.get(10)?,
        started_at: parse_ts(&row.get::<_, String>(11)?)?,
        completed_at: parse_opt_ts(row.get(12)?)?,
    })
}
