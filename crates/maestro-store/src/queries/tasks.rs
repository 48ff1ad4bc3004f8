//! Task and task-execution rows.

use chrono::{DateTime, Utc};
use maestro_core::{SessionId, TaskExecutionId, TaskId, UserId};
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{StoreError, StoreResult};
use crate::records::{TaskExecutionRecord, TaskExecutionStatus, TaskRecord, TaskTrigger};
use crate::store::{de, json_col, parse_opt_ts, parse_ts, to_i64, uuid_col, Store};

const TASK_SELECT: &str = r#"
    SELECT id, user_id, name, prompt_template, sdk_options, allowed_tools, variables,
           schedule_cron, schedule_enabled, generate_report, report_format, tags,
           next_fire_at, exec_count, success_count, failure_count,
           created_at, updated_at, deleted_at
    FROM tasks
"#;

const EXECUTION_SELECT: &str = r#"
    SELECT id, task_id, session_id, trigger_kind, variables, status, result, error,
           created_at, started_at, completed_at, retry_count
    FROM task_executions
"#;

impl Store {
    /// Insert a task.
    pub fn insert_task(&self, task: &TaskRecord) -> StoreResult<()> {
        let sdk_options = serde_json::to_string(&task.sdk_options)?;
        let allowed_tools = serde_json::to_string(&task.allowed_tools)?;
        let variables = serde_json::to_string(&task.variables)?;
        let tags = serde_json::to_string(&task.tags)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO tasks (
                    id, user_id, name, prompt_template, sdk_options, allowed_tools,
                    variables, schedule_cron, schedule_enabled, generate_report,
                    report_format, tags, next_fire_at, exec_count, success_count,
                    failure_count, created_at, updated_at, deleted_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                        ?14, ?15, ?16, ?17, ?18, ?19)
                "#,
                params![
                    task.id.to_string(),
                    task.user_id.to_string(),
                    task.name,
                    task.prompt_template,
                    sdk_options,
                    allowed_tools,
                    variables,
                    task.schedule_cron,
                    task.schedule_enabled,
                    task.generate_report,
                    task.report_format,
                    tags,
                    task.next_fire_at.map(crate::store::ts),
                    to_i64(task.exec_count),
                    to_i64(task.success_count),
                    to_i64(task.failure_count),
                    crate::store::ts(task.created_at),
                    crate::store::ts(task.updated_at),
                    task.deleted_at.map(crate::store::ts),
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch one task; soft-deleted tasks are not found.
    pub fn get_task(&self, id: TaskId) -> StoreResult<TaskRecord> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{TASK_SELECT} WHERE id = ?1 AND deleted_at IS NULL"),
                [id.to_string()],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("task", id))
        })
    }

    /// Replace the mutable fields of a task.
    pub fn update_task(&self, task: &TaskRecord) -> StoreResult<()> {
        let sdk_options = serde_json::to_string(&task.sdk_options)?;
        let allowed_tools = serde_json::to_string(&task.allowed_tools)?;
        let variables = serde_json::to_string(&task.variables)?;
        let tags = serde_json::to_string(&task.tags)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                r#"
                UPDATE tasks SET
                    name = ?2, prompt_template = ?3, sdk_options = ?4, allowed_tools = ?5,
                    variables = ?6, schedule_cron = ?7, schedule_enabled = ?8,
                    generate_report = ?9, report_format = ?10, tags = ?11,
                    next_fire_at = ?12, updated_at = ?13
                WHERE id = ?1 AND deleted_at IS NULL
                "#,
                params![
                    task.id.to_string(),
                    task.name,
                    task.prompt_template,
                    sdk_options,
                    allowed_tools,
                    variables,
                    task.schedule_cron,
                    task.schedule_enabled,
                    task.generate_report,
                    task.report_format,
                    tags,
                    task.next_fire_at.map(crate::store::ts),
                    crate::store::ts(Utc::now()),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("task", task.id));
            }
            Ok(())
        })
    }

    /// Soft-delete a task. Running executions are untouched.
    pub fn soft_delete_task(&self, id: TaskId) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tasks SET deleted_at = ?2, schedule_enabled = 0, updated_at = ?2
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id.to_string(), crate::store::ts(Utc::now())],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("task", id));
            }
            Ok(())
        })
    }

    /// A user's live tasks, newest first.
    pub fn tasks_by_user(&self, user_id: UserId) -> StoreResult<Vec<TaskRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{TASK_SELECT} WHERE user_id = ?1 AND deleted_at IS NULL
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([user_id.to_string()], row_to_task)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// All live tasks with scheduling enabled (scheduler startup load).
    pub fn enabled_scheduled_tasks(&self) -> StoreResult<Vec<TaskRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{TASK_SELECT} WHERE schedule_enabled = 1 AND deleted_at IS NULL"
            ))?;
            let rows = stmt.query_map([], row_to_task)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Enabled tasks whose fire time has passed.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{TASK_SELECT}
                 WHERE schedule_enabled = 1 AND deleted_at IS NULL
                   AND next_fire_at IS NOT NULL AND next_fire_at <= ?1
                 ORDER BY next_fire_at ASC"
            ))?;
            let rows = stmt.query_map([crate::store::ts(now)], row_to_task)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Update a task's next scheduled fire time.
    pub fn set_next_fire_at(
        &self,
        id: TaskId,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tasks SET next_fire_at = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    next_fire_at.map(crate::store::ts),
                    crate::store::ts(Utc::now()),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("task", id));
            }
            Ok(())
        })
    }

    /// Atomically bump a task's execution statistics.
    pub fn record_task_outcome(&self, id: TaskId, success: bool) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                r#"
                UPDATE tasks SET
                    exec_count = exec_count + 1,
                    success_count = success_count + ?2,
                    failure_count = failure_count + ?3,
                    updated_at = ?4
                WHERE id = ?1
                "#,
                params![
                    id.to_string(),
                    i64::from(success),
                    i64::from(!success),
                    crate::store::ts(Utc::now()),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("task", id));
            }
            Ok(())
        })
    }

    /// Insert a task execution row.
    pub fn insert_task_execution(&self, record: &TaskExecutionRecord) -> StoreResult<()> {
        let variables = serde_json::to_string(&record.variables)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO task_executions (
                    id, task_id, session_id, trigger_kind, variables, status, result,
                    error, created_at, started_at, completed_at, retry_count
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    record.id.to_string(),
                    record.task_id.to_string(),
                    record.session_id.to_string(),
                    record.trigger.as_str(),
                    variables,
                    record.status.as_str(),
                    record.result,
                    record.error,
                    crate::store::ts(record.created_at),
                    record.started_at.map(crate::store::ts),
                    record.completed_at.map(crate::store::ts),
                    i64::from(record.retry_count),
                ],
            )?;
            Ok(())
        })
    }

    /// Move an execution to RUNNING.
    pub fn mark_task_execution_running(&self, id: TaskExecutionId) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE task_executions SET status = 'running', started_at = ?2 WHERE id = ?1",
                params![id.to_string(), crate::store::ts(Utc::now())],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("task_execution", id));
            }
            Ok(())
        })
    }

    /// Finish an execution with a terminal status.
    pub fn complete_task_execution(
        &self,
        id: TaskExecutionId,
        status: TaskExecutionStatus,
        result: Option<&str>,
        error: Option<&str>,
        retry_count: u32,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                r#"
                UPDATE task_executions
                SET status = ?2, result = ?3, error = ?4, completed_at = ?5, retry_count = ?6
                WHERE id = ?1
                "#,
                params![
                    id.to_string(),
                    status.as_str(),
                    result,
                    error,
                    crate::store::ts(Utc::now()),
                    i64::from(retry_count),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("task_execution", id));
            }
            Ok(())
        })
    }

    /// Fetch one execution.
    pub fn get_task_execution(&self, id: TaskExecutionId) -> StoreResult<TaskExecutionRecord> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{EXECUTION_SELECT} WHERE id = ?1"),
                [id.to_string()],
                row_to_execution,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("task_execution", id))
        })
    }

    /// Executions of a task, newest first.
    pub fn executions_by_task(&self, task_id: TaskId) -> StoreResult<Vec<TaskExecutionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{EXECUTION_SELECT} WHERE task_id = ?1 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([task_id.to_string()], row_to_execution)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let sdk_options: String = row.get(4)?;
    let allowed_tools: String = row.get(5)?;
    let variables: String = row.get(6)?;
    let tags: String = row.get(11)?;
    Ok(TaskRecord {
        id: uuid_col(&row.get::<_, String>(0)?)?,
        user_id: uuid_col(&row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        prompt_template: row.get(3)?,
        sdk_options: json_col(&sdk_options)?,
        allowed_tools: json_col(&allowed_tools)?,
        variables: json_col(&variables)?,
        schedule_cron: row.get(7)?,
        schedule_enabled: row.get(8)?,
        generate_report: row.get(9)?,
        report_format: row.get(10)?,
        tags: json_col(&tags)?,
        next_fire_at: parse_opt_ts(row.get(12)?)?,
        exec_count: crate::store::col_u64(row.get(13)?),
        success_count: crate::store::col_u64(row.get(14)?),
        failure_count: crate::store::col_u64(row.get(15)?),
        created_at: parse_ts(&row.get::<_, String>(16)?)?,
        updated_at: parse_ts(&row.get::<_, String>(17)?)?,
        deleted_at: parse_opt_ts(row.get(18)?)?,
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<TaskExecutionRecord> {
    let trigger: String = row.get(3)?;
    let variables: String = row.get(4)?;
    let status: String = row.get(5)?;
    let retry_count: i64 = row.get(11)?;
    Ok(TaskExecutionRecord {
        id: uuid_col(&row.get::<_, String>(0)?)?,
        task_id: uuid_col(&row.get::<_, String>(1)?)?,
        session_id: uuid_col::<SessionId>(&row.get::<_, String>(2)?)?,
        trigger: TaskTrigger::parse(&trigger).map_err(de)?,
        variables: json_col(&variables)?,
        status: TaskExecutionStatus::parse(&status).map_err(de)?,
        result: row.get(6)?,
        error: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
        started_at: parse_opt_ts(row.get(9)?)?,
        completed_at: parse_opt_ts(row.get(10)?)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn scheduled_task(store: &Store, cron: &str, next: DateTime<Utc>) -> TaskRecord {
        let mut task = TaskRecord::new(UserId::new(), "health check", "Check {{env}}");
        task.schedule_cron = Some(cron.to_string());
        task.schedule_enabled = true;
        task.next_fire_at = Some(next);
        task.variables = BTreeMap::from([("env".to_string(), "staging".to_string())]);
        store.insert_task(&task).expect("insert");
        task
    }

    #[test]
    fn task_roundtrip_and_soft_delete() {
        let store = Store::open_in_memory().expect("store");
        let task = scheduled_task(&store, "*/5 * * * * *", Utc::now());

        let loaded = store.get_task(task.id).expect("get");
        assert_eq!(loaded.name, "health check");
        assert_eq!(loaded.variables.get("env").map(String::as_str), Some("staging"));

        store.soft_delete_task(task.id).expect("delete");
        assert!(matches!(
            store.get_task(task.id).unwrap_err(),
            StoreError::NotFound { .. }
        ));
        // Soft-deleted tasks leave the schedule.
        assert!(store.enabled_scheduled_tasks().expect("enabled").is_empty());
    }

    #[test]
    fn due_tasks_only_past_fire_times() {
        let store = Store::open_in_memory().expect("store");
        let now = Utc::now();
        let due = scheduled_task(&store, "* * * * * *", now - Duration::seconds(5));
        let _future = scheduled_task(&store, "* * * * * *", now + Duration::seconds(3600));

        let found = store.due_tasks(now).expect("due");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);

        store
            .set_next_fire_at(due.id, Some(now + Duration::seconds(300)))
            .expect("reschedule");
        assert!(store.due_tasks(now).expect("due").is_empty());
    }

    #[test]
    fn outcome_counters_accumulate() {
        let store = Store::open_in_memory().expect("store");
        let task = scheduled_task(&store, "* * * * * *", Utc::now());
        store.record_task_outcome(task.id, true).expect("ok");
        store.record_task_outcome(task.id, false).expect("fail");
        store.record_task_outcome(task.id, true).expect("ok");

        let loaded = store.get_task(task.id).expect("get");
        assert_eq!(loaded.exec_count, 3);
        assert_eq!(loaded.success_count, 2);
        assert_eq!(loaded.failure_count, 1);
    }

    #[test]
    fn execution_lifecycle() {
        let store = Store::open_in_memory().expect("store");
        let task = scheduled_task(&store, "* * * * * *", Utc::now());
        let execution = TaskExecutionRecord {
            id: TaskExecutionId::new(),
            task_id: task.id,
            session_id: SessionId::new(),
            trigger: TaskTrigger::Scheduled,
            variables: task.variables.clone(),
            status: TaskExecutionStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
        };
        store.insert_task_execution(&execution).expect("insert");
        store
            .mark_task_execution_running(execution.id)
            .expect("running");
        store
            .complete_task_execution(
                execution.id,
                TaskExecutionStatus::Completed,
                Some("all green"),
                None,
                1,
            )
            .expect("complete");

        let loaded = store.get_task_execution(execution.id).expect("get");
        assert_eq!(loaded.status, TaskExecutionStatus::Completed);
        assert_eq!(loaded.result.as_deref(), Some("all green"));
        assert_eq!(loaded.retry_count, 1);
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_some());

        assert_eq!(store.executions_by_task(task.id).expect("list").len(), 1);
    }
}
