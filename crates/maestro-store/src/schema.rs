//! SQLite schema.
//!
//! Tables map one-to-one onto the entity records. Two constraints back
//! the hard invariants: `UNIQUE(session_id, sequence)` on messages and
//! `UNIQUE(session_id, tool_use_id)` on tool executions.

use rusqlite::Connection;

use crate::error::StoreResult;

pub(crate) fn init(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL,
            max_concurrent_sessions INTEGER NOT NULL,
            monthly_budget_usd REAL NOT NULL,
            created_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS user_costs (
            user_id TEXT NOT NULL,
            month TEXT NOT NULL,
            cost_usd REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, month)
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            workdir_path TEXT NOT NULL,
            parent_session_id TEXT,
            config TEXT NOT NULL,
            total_messages INTEGER NOT NULL DEFAULT 0,
            total_tool_calls INTEGER NOT NULL DEFAULT 0,
            total_hook_executions INTEGER NOT NULL DEFAULT 0,
            total_permission_checks INTEGER NOT NULL DEFAULT 0,
            total_errors INTEGER NOT NULL DEFAULT 0,
            total_retries INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            tokens_in INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            tokens_cache_write INTEGER NOT NULL DEFAULT 0,
            tokens_cache_read INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            updated_at TEXT NOT NULL,
            archive_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, status);
        CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            direction TEXT NOT NULL,
            blocks TEXT NOT NULL,
            model TEXT,
            tokens_in INTEGER,
            tokens_out INTEGER,
            cost_usd REAL,
            is_partial INTEGER NOT NULL DEFAULT 0,
            parent_message_id TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (session_id, sequence)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, sequence);

        CREATE TABLE IF NOT EXISTS tool_executions (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            tool_use_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            input TEXT NOT NULL,
            output TEXT,
            status TEXT NOT NULL,
            error_message TEXT,
            duration_ms INTEGER,
            permission_decision TEXT NOT NULL,
            permission_reason TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            UNIQUE (session_id, tool_use_id)
        );
        CREATE INDEX IF NOT EXISTS idx_tools_session ON tool_executions(session_id, started_at);

        CREATE TABLE IF NOT EXISTS hook_executions (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            hook_kind TEXT NOT NULL,
            hook_name TEXT NOT NULL,
            tool_use_id TEXT,
            input_snapshot TEXT NOT NULL,
            output_snapshot TEXT NOT NULL,
            continue_execution INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            executed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_hooks_session ON hook_executions(session_id, executed_at);

        CREATE TABLE IF NOT EXISTS permission_decisions (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            input_snapshot TEXT NOT NULL,
            decision TEXT NOT NULL,
            policy_name TEXT,
            reason TEXT,
            interrupted INTEGER NOT NULL DEFAULT 0,
            decided_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_permissions_session
            ON permission_decisions(session_id, decided_at);

        CREATE TABLE IF NOT EXISTS archives (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL UNIQUE,
            path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            compression TEXT NOT NULL,
            manifest TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            created_at TEXT NOT NULL,
            archived_at TEXT
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            prompt_template TEXT NOT NULL,
            sdk_options TEXT NOT NULL,
            allowed_tools TEXT NOT NULL,
            variables TEXT NOT NULL,
            schedule_cron TEXT,
            schedule_enabled INTEGER NOT NULL DEFAULT 0,
            generate_report INTEGER NOT NULL DEFAULT 0,
            report_format TEXT,
            tags TEXT NOT NULL,
            next_fire_at TEXT,
            exec_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(schedule_enabled, next_fire_at);

        CREATE TABLE IF NOT EXISTS task_executions (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            trigger_kind TEXT NOT NULL,
            variables TEXT NOT NULL,
            status TEXT NOT NULL,
            result TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_task_executions_task
            ON task_executions(task_id, created_at);

        CREATE TABLE IF NOT EXISTS metrics_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            metrics TEXT NOT NULL,
            captured_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_session
            ON metrics_snapshots(session_id, captured_at);
        "#,
    )?;
    Ok(())
}
