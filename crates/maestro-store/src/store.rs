//! The store handle and its session/message operations.

use chrono::{DateTime, SecondsFormat, Utc};
use maestro_core::{
    ArchiveId, MessageId, SessionId, SessionMetrics, SessionStatus, TokenUsage, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::records::{
    session_mode_parse, session_status_parse, session_status_to_str, MessageRecord, NewMessage,
    SessionConfig, SessionFilter, SessionRecord,
};
use crate::schema;

/// Handle to the SQLite database.
///
/// The connection is serialized behind a mutex; all statements are short
/// in-process writes, so contention is the per-session ordering we want
/// anyway. Long work (archival) never happens under this lock.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Fatal(format!("create store dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        schema::init(&conn)?;
        debug!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Fatal("store mutex poisoned".into()))?;
        f(&mut guard)
    }

    // -- sessions --

    /// Insert a new session row.
    pub fn insert_session(&self, session: &SessionRecord) -> StoreResult<()> {
        let config = serde_json::to_string(&session.config)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO sessions (
                    id, user_id, mode, status, workdir_path, parent_session_id, config,
                    cost_usd, created_at, started_at, completed_at, updated_at, archive_id
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    session.id.to_string(),
                    session.user_id.to_string(),
                    session.mode.to_string(),
                    session_status_to_str(session.status),
                    session.workdir_path,
                    session.parent_session_id.map(|p| p.to_string()),
                    config,
                    session.metrics.cost_usd,
                    ts(session.created_at),
                    session.started_at.map(ts),
                    session.completed_at.map(ts),
                    ts(session.updated_at),
                    session.archive_id.map(|a| a.to_string()),
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch one session.
    pub fn get_session(&self, id: SessionId) -> StoreResult<SessionRecord> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{SESSION_SELECT} WHERE id = ?1"),
                [id.to_string()],
                row_to_session,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("session", id))
        })
    }

    /// Sessions belonging to a user, optionally filtered, newest first.
    pub fn sessions_by_user(
        &self,
        user_id: UserId,
        filter: SessionFilter,
    ) -> StoreResult<Vec<SessionRecord>> {
        self.with_conn(|conn| {
            let mut sql = format!("{SESSION_SELECT} WHERE user_id = ?");
            let mut bind: Vec<String> = vec![user_id.to_string()];
            if let Some(status) = filter.status {
                sql.push_str(" AND status = ?");
                bind.push(session_status_to_str(status));
            }
            if let Some(mode) = filter.mode {
                sql.push_str(" AND mode = ?");
                bind.push(mode.to_string());
            }
            sql.push_str(" ORDER BY created_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(bind), row_to_session)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Direct forks of a session, oldest first.
    pub fn forks_of(&self, parent: SessionId) -> StoreResult<Vec<SessionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SESSION_SELECT} WHERE parent_session_id = ?1 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([parent.to_string()], row_to_session)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Sessions counting against the user's concurrency quota.
    pub fn count_quota_sessions(&self, user_id: UserId) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                r#"
                SELECT COUNT(*) FROM sessions
                WHERE user_id = ?1
                  AND status NOT IN ('completed', 'failed', 'terminated', 'archived')
                "#,
                [user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    /// Transition a session, enforcing the state graph.
    ///
    /// Sets `started_at` on the first transition to ACTIVE and
    /// `completed_at` on the first terminal transition. Returns the prior
    /// status. Illegal edges surface as [`StoreError::Conflict`].
    pub fn transition_session(
        &self,
        id: SessionId,
        to: SessionStatus,
    ) -> StoreResult<SessionStatus> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let row: Option<(String, Option<String>, Option<String>)> = tx
                .query_row(
                    "SELECT status, started_at, completed_at FROM sessions WHERE id = ?1",
                    [id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let (status_str, started_at, completed_at) =
                row.ok_or_else(|| StoreError::not_found("session", id))?;
            let current = session_status_parse(&status_str)?;
            current
                .transition(to)
                .map_err(|e| StoreError::Conflict(e.to_string()))?;

            let now = ts(Utc::now());
            let set_started = to == SessionStatus::Active && started_at.is_none();
            let set_completed = to.is_terminal() && completed_at.is_none();
            tx.execute(
                r#"
                UPDATE sessions SET
                    status = ?2,
                    started_at = CASE WHEN ?3 THEN ?4 ELSE started_at END,
                    completed_at = CASE WHEN ?5 THEN ?4 ELSE completed_at END,
                    updated_at = ?4
                WHERE id = ?1
                "#,
                params![
                    id.to_string(),
                    session_status_to_str(to),
                    set_started,
                    now,
                    set_completed
                ],
            )?;
            tx.commit()?;
            Ok(current)
        })
    }

    /// Transition a terminal session to ARCHIVED and link its archive,
    /// atomically (the invariant: `archive_id` non-null iff ARCHIVED).
    pub fn mark_session_archived(&self, id: SessionId, archive_id: ArchiveId) -> StoreResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let status_str: Option<String> = tx
                .query_row(
                    "SELECT status FROM sessions WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let current =
                session_status_parse(&status_str.ok_or_else(|| StoreError::not_found("session", id))?)?;
            current
                .transition(SessionStatus::Archived)
                .map_err(|e| StoreError::Conflict(e.to_string()))?;
            tx.execute(
                "UPDATE sessions SET status = 'archived', archive_id = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), archive_id.to_string(), ts(Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Replace a session's configuration snapshot.
    pub fn update_session_config(&self, id: SessionId, config: &SessionConfig) -> StoreResult<()> {
        let json = serde_json::to_string(config)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE sessions SET config = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), json, ts(Utc::now())],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("session", id));
            }
            Ok(())
        })
    }

    /// Atomically add a delta to a session's counters.
    ///
    /// Message/tool/hook/permission totals are maintained by their insert
    /// paths; this covers errors, retries, cost, tokens, and duration.
    pub fn increment_session_metrics(
        &self,
        id: SessionId,
        delta: &SessionMetrics,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                r#"
                UPDATE sessions SET
                    total_errors = total_errors + ?2,
                    total_retries = total_retries + ?3,
                    cost_usd = cost_usd + ?4,
                    tokens_in = tokens_in + ?5,
                    tokens_out = tokens_out + ?6,
                    tokens_cache_write = tokens_cache_write + ?7,
                    tokens_cache_read = tokens_cache_read + ?8,
                    duration_ms = duration_ms + ?9,
                    updated_at = ?10
                WHERE id = ?1
                "#,
                params![
                    id.to_string(),
                    to_i64(delta.total_errors),
                    to_i64(delta.total_retries),
                    delta.cost_usd,
                    to_i64(delta.usage.input_tokens),
                    to_i64(delta.usage.output_tokens),
                    to_i64(delta.usage.cache_creation_tokens),
                    to_i64(delta.usage.cache_read_tokens),
                    to_i64(delta.duration_ms),
                    ts(Utc::now()),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("session", id));
            }
            Ok(())
        })
    }

    // -- messages --

    /// Append a message, allocating the next sequence number inside the
    /// insert transaction. Non-partial inserts bump `total_messages`.
    pub fn insert_message(&self, new: NewMessage) -> StoreResult<MessageRecord> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE session_id = ?1",
                [new.session_id.to_string()],
                |row| row.get(0),
            )?;
            let record = MessageRecord {
                id: MessageId::new(),
                session_id: new.session_id,
                sequence: u64::try_from(sequence).unwrap_or(1),
                direction: new.direction,
                blocks: new.blocks,
                model: new.model,
                tokens_in: new.tokens_in,
                tokens_out: new.tokens_out,
                cost_usd: new.cost_usd,
                is_partial: new.is_partial,
                parent_message_id: None,
                created_at: Utc::now(),
            };
            insert_message_row(&tx, &record)?;
            if !record.is_partial {
                tx.execute(
                    "UPDATE sessions SET total_messages = total_messages + 1, updated_at = ?2
                     WHERE id = ?1",
                    params![record.session_id.to_string(), ts(record.created_at)],
                )?;
            }
            tx.commit()?;
            Ok(record)
        })
    }

    /// Ordered page of a session's messages.
    pub fn messages_by_session(
        &self,
        session_id: SessionId,
        after_seq: Option<u64>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<MessageRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, session_id, sequence, direction, blocks, model, tokens_in,
                       tokens_out, cost_usd, is_partial, parent_message_id, created_at
                FROM messages
                WHERE session_id = ?1 AND sequence > ?2
                ORDER BY sequence ASC
                LIMIT ?3
                "#,
            )?;
            let rows = stmt.query_map(
                params![
                    session_id.to_string(),
                    to_i64(after_seq.unwrap_or(0)),
                    limit.map_or(i64::MAX, |l| i64::try_from(l).unwrap_or(i64::MAX)),
                ],
                row_to_message,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Count a session's messages.
    pub fn count_messages(&self, session_id: SessionId, include_partial: bool) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE session_id = ?1 AND (?2 OR is_partial = 0)",
                params![session_id.to_string(), include_partial],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    /// Link orphaned partials of a session to their completion message.
    ///
    /// Returns the number of rows adopted.
    pub fn adopt_orphan_partials(
        &self,
        session_id: SessionId,
        parent: MessageId,
    ) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                r#"
                UPDATE messages SET parent_message_id = ?2
                WHERE session_id = ?1 AND is_partial = 1 AND parent_message_id IS NULL
                "#,
                params![session_id.to_string(), parent.to_string()],
            )?;
            Ok(u64::try_from(updated).unwrap_or(0))
        })
    }

    /// Copy the first `up_to_seq` messages of `parent` into `child`,
    /// preserving sequence numbers and block content (fork support).
    ///
    /// Returns the number of messages copied.
    pub fn copy_message_prefix(
        &self,
        parent: SessionId,
        child: SessionId,
        up_to_seq: u64,
    ) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut copied: u64 = 0;
            {
                // Partials are stream artifacts of the parent's turns; only
                // the non-partial history is meaningful to a fork.
                let mut stmt = tx.prepare(
                    r#"
                    SELECT id, session_id, sequence, direction, blocks, model, tokens_in,
                           tokens_out, cost_usd, is_partial, parent_message_id, created_at
                    FROM messages
                    WHERE session_id = ?1 AND sequence <= ?2 AND is_partial = 0
                    ORDER BY sequence ASC
                    "#,
                )?;
                let rows = stmt.query_map(
                    params![parent.to_string(), to_i64(up_to_seq)],
                    row_to_message,
                )?;
                for row in rows {
                    let mut record = row?;
                    record.id = MessageId::new();
                    record.session_id = child;
                    record.parent_message_id = None;
                    insert_message_row(&tx, &record)?;
                    copied += 1;
                }
            }
            tx.execute(
                "UPDATE sessions SET total_messages = total_messages + ?2, updated_at = ?3
                 WHERE id = ?1",
                params![child.to_string(), to_i64(copied), ts(Utc::now())],
            )?;
            tx.commit()?;
            Ok(copied)
        })
    }
}

// -- row plumbing --

const SESSION_SELECT: &str = r#"
    SELECT id, user_id, mode, status, workdir_path, parent_session_id, config,
           total_messages, total_tool_calls, total_hook_executions,
           total_permission_checks, total_errors, total_retries, cost_usd,
           tokens_in, tokens_out, tokens_cache_write, tokens_cache_read,
           duration_ms, created_at, started_at, completed_at, updated_at, archive_id
    FROM sessions
"#;

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| de(StoreError::Fatal(format!("bad timestamp column: {e}"))))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Wrap a [`StoreError`] for use inside a `query_map` closure.
pub(crate) fn de(err: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn uuid_col<T: From<Uuid>>(s: &str) -> rusqlite::Result<T> {
    Uuid::parse_str(s)
        .map(T::from)
        .map_err(|e| de(StoreError::Fatal(format!("bad uuid column: {e}"))))
}

pub(crate) fn opt_uuid_col<T: From<Uuid>>(s: Option<String>) -> rusqlite::Result<Option<T>> {
    s.as_deref().map(uuid_col).transpose()
}

pub(crate) fn json_col<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| de(StoreError::from(e)))
}

pub(crate) fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

pub(crate) fn col_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

pub(crate) fn opt_col_u64(v: Option<i64>) -> Option<u64> {
    v.map(col_u64)
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(3)?;
    let mode: String = row.get(2)?;
    let config: String = row.get(6)?;
    Ok(SessionRecord {
        id: uuid_col(&row.get::<_, String>(0)?)?,
        user_id: uuid_col(&row.get::<_, String>(1)?)?,
        mode: session_mode_parse(&mode).map_err(de)?,
        status: session_status_parse(&status).map_err(de)?,
        workdir_path: row.get(4)?,
        parent_session_id: opt_uuid_col(row.get(5)?)?,
        config: json_col(&config)?,
        metrics: SessionMetrics {
            total_messages: col_u64(row.get(7)?),
            total_tool_calls: col_u64(row.get(8)?),
            total_hook_executions: col_u64(row.get(9)?),
            total_permission_checks: col_u64(row.get(10)?),
            total_errors: col_u64(row.get(11)?),
            total_retries: col_u64(row.get(12)?),
            cost_usd: row.get(13)?,
            usage: TokenUsage {
                input_tokens: col_u64(row.get(14)?),
                output_tokens: col_u64(row.get(15)?),
                cache_creation_tokens: col_u64(row.get(16)?),
                cache_read_tokens: col_u64(row.get(17)?),
            },
            duration_ms: col_u64(row.get(18)?),
        },
        created_at: parse_ts(&row.get::<_, String>(19)?)?,
        started_at: parse_opt_ts(row.get(20)?)?,
        completed_at: parse_opt_ts(row.get(21)?)?,
        updated_at: parse_ts(&row.get::<_, String>(22)?)?,
        archive_id: opt_uuid_col(row.get(23)?)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let direction: String = row.get(3)?;
    let blocks: String = row.get(4)?;
    Ok(MessageRecord {
        id: uuid_col(&row.get::<_, String>(0)?)?,
        session_id: uuid_col(&row.get::<_, String>(1)?)?,
        sequence: col_u64(row.get(2)?),
        direction: crate::records::direction_parse(&direction).map_err(de)?,
        blocks: json_col(&blocks)?,
        model: row.get(5)?,
        tokens_in: opt_col_u64(row.get(6)?),
        tokens_out: opt_col_u64(row.get(7)?),
        cost_usd: row.get(8)?,
        is_partial: row.get(9)?,
        parent_message_id: opt_uuid_col(row.get(10)?)?,
        created_at: parse_ts(&row.get::<_, String>(11)?)?,
    })
}

fn insert_message_row(conn: &Connection, record: &MessageRecord) -> StoreResult<()> {
    let blocks = serde_json::to_string(&record.blocks)?;
    conn.execute(
        r#"
        INSERT INTO messages (
            id, session_id, sequence, direction, blocks, model, tokens_in,
            tokens_out, cost_usd, is_partial, parent_message_id, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            record.id.to_string(),
            record.session_id.to_string(),
            to_i64(record.sequence),
            record.direction.to_string(),
            blocks,
            record.model,
            record.tokens_in.map(to_i64),
            record.tokens_out.map(to_i64),
            record.cost_usd,
            record.is_partial,
            record.parent_message_id.map(|p| p.to_string()),
            ts(record.created_at),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::{ContentBlock, SessionMode};

    fn store() -> Store {
        Store::open_in_memory().expect("in-memory store")
    }

    fn session(store: &Store) -> SessionRecord {
        let record = SessionRecord::new(
            UserId::new(),
            SessionMode::Interactive,
            "/tmp/maestro/s1".into(),
        );
        store.insert_session(&record).expect("insert session");
        record
    }

    #[test]
    fn session_roundtrips() {
        let store = store();
        let record = session(&store);
        let loaded = store.get_session(record.id).expect("get");
        assert_eq!(loaded, record);
    }

    #[test]
    fn missing_session_is_not_found() {
        let store = store();
        let err = store.get_session(SessionId::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn sequences_are_contiguous_per_session() {
        let store = store();
        let a = session(&store);
        let b = session(&store);

        for i in 0..3 {
            let m = store
                .insert_message(NewMessage::user_prompt(a.id, format!("a{i}")))
                .expect("insert");
            assert_eq!(m.sequence, i + 1);
        }
        let m = store
            .insert_message(NewMessage::user_prompt(b.id, "b0"))
            .expect("insert");
        assert_eq!(m.sequence, 1);

        let messages = store.messages_by_session(a.id, None, None).expect("list");
        assert_eq!(
            messages.iter().map(|m| m.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn message_pagination_after_seq() {
        let store = store();
        let s = session(&store);
        for i in 0..5 {
            store
                .insert_message(NewMessage::user_prompt(s.id, format!("m{i}")))
                .expect("insert");
        }
        let page = store
            .messages_by_session(s.id, Some(2), Some(2))
            .expect("page");
        assert_eq!(page.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn partials_do_not_count_toward_totals() {
        let store = store();
        let s = session(&store);
        let mut partial = NewMessage::agent(s.id, vec![ContentBlock::text("par")]);
        partial.is_partial = true;
        store.insert_message(partial).expect("partial");
        store
            .insert_message(NewMessage::agent(s.id, vec![ContentBlock::text("full")]))
            .expect("full");

        let loaded = store.get_session(s.id).expect("get");
        assert_eq!(loaded.metrics.total_messages, 1);
        assert_eq!(store.count_messages(s.id, true).expect("count"), 2);
        assert_eq!(store.count_messages(s.id, false).expect("count"), 1);
    }

    #[test]
    fn orphan_partials_get_adopted() {
        let store = store();
        let s = session(&store);
        let mut partial = NewMessage::agent(s.id, vec![ContentBlock::text("p")]);
        partial.is_partial = true;
        store.insert_message(partial.clone()).expect("p1");
        store.insert_message(partial).expect("p2");
        let full = store
            .insert_message(NewMessage::agent(s.id, vec![ContentBlock::text("f")]))
            .expect("full");

        let adopted = store.adopt_orphan_partials(s.id, full.id).expect("adopt");
        assert_eq!(adopted, 2);

        let messages = store.messages_by_session(s.id, None, None).expect("list");
        for m in messages.iter().filter(|m| m.is_partial) {
            assert_eq!(m.parent_message_id, Some(full.id));
        }
    }

    #[test]
    fn transition_enforces_graph() {
        let store = store();
        let s = session(&store);

        let prev = store
            .transition_session(s.id, SessionStatus::Connecting)
            .expect("created -> connecting");
        assert_eq!(prev, SessionStatus::Created);
        store
            .transition_session(s.id, SessionStatus::Active)
            .expect("connecting -> active");

        // Illegal edge.
        let err = store
            .transition_session(s.id, SessionStatus::Connecting)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let loaded = store.get_session(s.id).expect("get");
        assert_eq!(loaded.status, SessionStatus::Active);
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_none());
    }

    #[test]
    fn terminal_transition_sets_completed_at() {
        let store = store();
        let s = session(&store);
        store
            .transition_session(s.id, SessionStatus::Connecting)
            .expect("t");
        store
            .transition_session(s.id, SessionStatus::Active)
            .expect("t");
        store
            .transition_session(s.id, SessionStatus::Completed)
            .expect("t");
        let loaded = store.get_session(s.id).expect("get");
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn metrics_increment_is_cumulative() {
        let store = store();
        let s = session(&store);
        let delta = SessionMetrics {
            total_errors: 1,
            total_retries: 2,
            cost_usd: 0.125,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                cache_creation_tokens: 10,
                cache_read_tokens: 5,
            },
            duration_ms: 1500,
            ..SessionMetrics::default()
        };
        store.increment_session_metrics(s.id, &delta).expect("inc");
        store.increment_session_metrics(s.id, &delta).expect("inc");

        let loaded = store.get_session(s.id).expect("get");
        assert_eq!(loaded.metrics.total_retries, 4);
        assert!((loaded.metrics.cost_usd - 0.25).abs() < f64::EPSILON);
        assert_eq!(loaded.metrics.usage.input_tokens, 200);
        assert_eq!(loaded.metrics.duration_ms, 3000);
    }

    #[test]
    fn fork_prefix_copy_preserves_sequences_and_blocks() {
        let store = store();
        let parent = session(&store);
        for i in 0..5 {
            store
                .insert_message(NewMessage::user_prompt(parent.id, format!("m{i}")))
                .expect("insert");
        }
        let child = session(&store);
        let copied = store
            .copy_message_prefix(parent.id, child.id, 3)
            .expect("copy");
        assert_eq!(copied, 3);

        let parent_messages = store
            .messages_by_session(parent.id, None, Some(3))
            .expect("parent");
        let child_messages = store.messages_by_session(child.id, None, None).expect("child");
        assert_eq!(child_messages.len(), 3);
        for (p, c) in parent_messages.iter().zip(&child_messages) {
            assert_eq!(p.sequence, c.sequence);
            assert_eq!(p.blocks, c.blocks);
            assert_ne!(p.id, c.id);
        }
        // Continuing the fork picks up after the copied prefix.
        let next = store
            .insert_message(NewMessage::user_prompt(child.id, "continue"))
            .expect("next");
        assert_eq!(next.sequence, 4);
    }
}
