//! Hook execution and permission decision audit rows.

use chrono::Utc;
use maestro_core::{HookKind, SessionId};
use rusqlite::{params, Row};

use crate::error::StoreResult;
use crate::records::{hook_kind_parse, HookExecutionRecord, PermissionDecisionRecord};
use crate::store::{col_u64, de, json_col, parse_ts, to_i64, uuid_col, Store};

const HOOK_SELECT: &str = r#"
    SELECT id, session_id, hook_kind, hook_name, tool_use_id, input_snapshot,
           output_snapshot, continue_execution, duration_ms, executed_at
    FROM hook_executions
"#;

const PERMISSION_SELECT: &str = r#"
    SELECT id, session_id, tool_name, input_snapshot, decision, policy_name,
           reason, interrupted, decided_at
    FROM permission_decisions
"#;

impl Store {
    /// Record one hook invocation; bumps `total_hook_executions`.
    pub fn insert_hook_execution(&self, record: &HookExecutionRecord) -> StoreResult<()> {
        let input = serde_json::to_string(&record.input_snapshot)?;
        let output = serde_json::to_string(&record.output_snapshot)?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO hook_executions (
                    id, session_id, hook_kind, hook_name, tool_use_id, input_snapshot,
                    output_snapshot, continue_execution, duration_ms, executed_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    record.id.to_string(),
                    record.session_id.to_string(),
                    record.hook_kind.to_string(),
                    record.hook_name,
                    record.tool_use_id,
                    input,
                    output,
                    record.continue_execution,
                    to_i64(record.duration_ms),
                    crate::store::ts(record.executed_at),
                ],
            )?;
            tx.execute(
                "UPDATE sessions
                 SET total_hook_executions = total_hook_executions + 1, updated_at = ?2
                 WHERE id = ?1",
                params![record.session_id.to_string(), crate::store::ts(Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// A session's hook invocations, optionally filtered by kind.
    pub fn hooks_by_session(
        &self,
        session_id: SessionId,
        kind: Option<HookKind>,
    ) -> StoreResult<Vec<HookExecutionRecord>> {
        self.with_conn(|conn| {
            let mut sql = format!("{HOOK_SELECT} WHERE session_id = ?");
            let mut bind: Vec<String> = vec![session_id.to_string()];
            if let Some(kind) = kind {
                sql.push_str(" AND hook_kind = ?");
                bind.push(kind.to_string());
            }
            sql.push_str(" ORDER BY executed_at ASC, id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(bind), row_to_hook)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Record one policy evaluation; bumps `total_permission_checks`.
    pub fn insert_permission_decision(
        &self,
        record: &PermissionDecisionRecord,
    ) -> StoreResult<()> {
        let input = serde_json::to_string(&record.input_snapshot)?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO permission_decisions (
                    id, session_id, tool_name, input_snapshot, decision, policy_name,
                    reason, interrupted, decided_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    record.id.to_string(),
                    record.session_id.to_string(),
                    record.tool_name,
                    input,
                    if record.allowed { "allow" } else { "deny" },
                    record.policy_name,
                    record.reason,
                    record.interrupted,
                    crate::store::ts(record.decided_at),
                ],
            )?;
            tx.execute(
                "UPDATE sessions
                 SET total_permission_checks = total_permission_checks + 1, updated_at = ?2
                 WHERE id = ?1",
                params![record.session_id.to_string(), crate::store::ts(Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// A session's permission decisions, optionally filtered by outcome.
    pub fn permissions_by_session(
        &self,
        session_id: SessionId,
        allowed: Option<bool>,
    ) -> StoreResult<Vec<PermissionDecisionRecord>> {
        self.with_conn(|conn| {
            let mut sql = format!("{PERMISSION_SELECT} WHERE session_id = ?");
            let mut bind: Vec<String> = vec![session_id.to_string()];
            if let Some(allowed) = allowed {
                sql.push_str(" AND decision = ?");
                bind.push(if allowed { "allow" } else { "deny" }.to_string());
            }
            sql.push_str(" ORDER BY decided_at ASC, id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(bind), row_to_permission)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

fn row_to_hook(row: &Row<'_>) -> rusqlite::Result<HookExecutionRecord> {
    let kind: String = row.get(2)?;
    let input: String = row.get(5)?;
    let output: String = row.get(6)?;
    Ok(HookExecutionRecord {
        id: uuid_col(&row.get::<_, String>(0)?)?,
        session_id: uuid_col(&row.get::<_, String>(1)?)?,
        hook_kind: hook_kind_parse(&kind).map_err(de)?,
        hook_name: row.get(3)?,
        tool_use_id: row.get(4)?,
        input_snapshot: json_col(&input)?,
        output_snapshot: json_col(&output)?,
        continue_execution: row.get(7)?,
        duration_ms: col_u64(row.get(8)?),
        executed_at: parse_ts(&row.get::<_, String>(9)?)?,
    })
}

fn row_to_permission(row: &Row<'_>) -> rusqlite::Result<PermissionDecisionRecord> {
    let decision: String = row.get(4)?;
    let input: String = row.get(3)?;
    Ok(PermissionDecisionRecord {
        id: uuid_col(&row.get::<_, String>(0)?)?,
        session_id: uuid_col(&row.get::<_, String>(1)?)?,
        tool_name: row.get(2)?,
        input_snapshot: json_col(&input)?,
        allowed: decision == "allow",
        policy_name: row.get(5)?,
        reason: row.get(6)?,
        interrupted: row.get(7)?,
        decided_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::SessionRecord;
    use maestro_core::{
        HookExecutionId, PermissionDecisionId, SessionMode, UserId,
    };
    use serde_json::json;

    fn store_with_session() -> (Store, SessionId) {
        let store = Store::open_in_memory().expect("store");
        let session = SessionRecord::new(UserId::new(), SessionMode::Background, "/tmp/w".into());
        store.insert_session(&session).expect("session");
        (store, session.id)
    }

    fn hook(session_id: SessionId, kind: HookKind) -> HookExecutionRecord {
        HookExecutionRecord {
            id: HookExecutionId::new(),
            session_id,
            hook_kind: kind,
            hook_name: "audit".into(),
            tool_use_id: Some("tu_1".into()),
            input_snapshot: json!({"tool_name": "Read"}),
            output_snapshot: json!({}),
            continue_execution: true,
            duration_ms: 2,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn hook_rows_roundtrip_and_filter() {
        let (store, session_id) = store_with_session();
        store
            .insert_hook_execution(&hook(session_id, HookKind::PreToolUse))
            .expect("pre");
        store
            .insert_hook_execution(&hook(session_id, HookKind::PostToolUse))
            .expect("post");

        let all = store.hooks_by_session(session_id, None).expect("all");
        assert_eq!(all.len(), 2);
        let pre = store
            .hooks_by_session(session_id, Some(HookKind::PreToolUse))
            .expect("pre");
        assert_eq!(pre.len(), 1);
        assert_eq!(pre[0].hook_kind, HookKind::PreToolUse);

        let session = store.get_session(session_id).expect("session");
        assert_eq!(session.metrics.total_hook_executions, 2);
    }

    #[test]
    fn permission_rows_roundtrip_and_filter() {
        let (store, session_id) = store_with_session();
        for (allowed, policy) in [(true, None), (false, Some("file_access".to_string()))] {
            store
                .insert_permission_decision(&PermissionDecisionRecord {
                    id: PermissionDecisionId::new(),
                    session_id,
                    tool_name: "Read".into(),
                    input_snapshot: json!({"path": "/etc/passwd"}),
                    allowed,
                    policy_name: policy,
                    reason: (!allowed).then(|| "restricted path /etc".to_string()),
                    interrupted: false,
                    decided_at: Utc::now(),
                })
                .expect("insert");
        }

        let denied = store
            .permissions_by_session(session_id, Some(false))
            .expect("denied");
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].policy_name.as_deref(), Some("file_access"));
        assert!(denied[0].reason.as_deref().unwrap_or("").contains("/etc"));

        let session = store.get_session(session_id).expect("session");
        assert_eq!(session.metrics.total_permission_checks, 2);
    }
}
