//! The scheduler: next-fire computation, ticker loop, and task firing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use maestro_agent::TransportFactory;
use maestro_core::{SessionMode, TaskExecutionId};
use maestro_events::MaestroEvent;
use maestro_runtime::{CreateSession, SessionCoordinator};
use maestro_store::{
    SessionConfig, TaskExecutionRecord, TaskExecutionStatus, TaskRecord, TaskTrigger, UserRole,
};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::template::render_template;

/// Ticker resolution; due tasks fire within one second of their time.
const TICK: Duration = Duration::from_secs(1);

/// Hand-off for `generate_report` tasks. Rendering itself is an external
/// concern; the scheduler only delivers the finished execution.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Deliver a finished execution for report rendering.
    async fn deliver(&self, task: &TaskRecord, execution: &TaskExecutionRecord);
}

/// Compute the next fire time strictly after `now`.
///
/// Accepts standard five-field cron; a seconds field of `0` is implied.
pub fn next_fire_after(expr: &str, now: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;
    schedule
        .after(&now)
        .next()
        .ok_or_else(|| SchedulerError::NoFutureOccurrence(expr.to_string()))
}

/// Cron-driven task scheduler over the session coordinator.
pub struct TaskScheduler<F: TransportFactory + 'static> {
    coordinator: Arc<SessionCoordinator<F>>,
    report_sink: Option<Arc<dyn ReportSink>>,
    cancel: CancellationToken,
}

impl<F: TransportFactory + 'static> TaskScheduler<F> {
    /// Create a scheduler over the coordinator.
    #[must_use]
    pub fn new(coordinator: Arc<SessionCoordinator<F>>) -> Self {
        Self {
            coordinator,
            report_sink: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a report sink for `generate_report` tasks.
    #[must_use]
    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.report_sink = Some(sink);
        self
    }

    /// Token that stops the run loop.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Startup load: ensure every enabled task has a `next_fire_at`.
    ///
    /// Returns the number of scheduled tasks.
    pub fn load(&self) -> SchedulerResult<usize> {
        let tasks = self.coordinator.store().enabled_scheduled_tasks()?;
        let count = tasks.len();
        for task in tasks {
            if task.next_fire_at.is_some() {
                continue;
            }
            match self.reschedule(&task, Utc::now()) {
                Ok(next) => {
                    info!(task_id = %task.id, next_fire_at = %next, "task scheduled");
                },
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "task could not be scheduled");
                },
            }
        }
        Ok(count)
    }

    /// Recompute and persist a task's next fire time.
    pub fn reschedule(
        &self,
        task: &TaskRecord,
        now: DateTime<Utc>,
    ) -> SchedulerResult<DateTime<Utc>> {
        let expr = task
            .schedule_cron
            .as_deref()
            .ok_or_else(|| SchedulerError::NotSchedulable("no cron expression".into()))?;
        let next = next_fire_after(expr, now)?;
        self.coordinator
            .store()
            .set_next_fire_at(task.id, Some(next))?;
        Ok(next)
    }

    /// The ticker loop; runs until the cancel token fires.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("scheduler running");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            if let Err(e) = self.poll_once(Utc::now()).await {
                error!(error = %e, "scheduler poll failed");
            }
        }
        info!("scheduler stopped");
    }

    /// One poll: fire everything due at `now`.
    ///
    /// The next occurrence is persisted *before* the fire so a slow
    /// execution can never double-fire its task.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let due = self.coordinator.store().due_tasks(now)?;
        let fired = due.len();
        for task in due {
            match self.reschedule(&task, now) {
                Ok(next) => {
                    info!(task_id = %task.id, next_fire_at = %next, "task due; firing");
                },
                Err(e) => {
                    // Unschedulable from here on; disable further fires.
                    warn!(task_id = %task.id, error = %e, "disabling unschedulable task");
                    self.coordinator.store().set_next_fire_at(task.id, None)?;
                },
            }
            if let Err(e) = self
                .fire(&task, TaskTrigger::Scheduled, BTreeMap::new())
                .await
            {
                error!(task_id = %task.id, error = %e, "scheduled fire failed");
            }
        }
        Ok(fired)
    }

    /// Fire one task: create a background session, render the template,
    /// execute, record the outcome.
    ///
    /// `overrides` take precedence over the task's stored variables.
    /// Execution-level failures are recorded as FAILED and not re-fired.
    pub async fn fire(
        &self,
        task: &TaskRecord,
        trigger: TaskTrigger,
        overrides: BTreeMap<String, String>,
    ) -> SchedulerResult<TaskExecutionRecord> {
        let store = Arc::clone(self.coordinator.store());

        let mut variables = task.variables.clone();
        variables.extend(overrides);

        // System tasks of admins bypass the session quota.
        let owner = store.get_user(task.user_id)?;
        let skip_quota = owner.role == UserRole::Admin;

        let mut session_config = SessionConfig {
            allowed_tools: task.allowed_tools.clone(),
            sdk_options: task.sdk_options.clone(),
            ..SessionConfig::default()
        };
        // Retry/timeout knobs may ride along in the task's sdk options.
        if let Some(v) = task.sdk_options.get("max_retries").and_then(serde_json::Value::as_u64) {
            session_config.max_retries = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = task
            .sdk_options
            .get("retry_delay_ms")
            .and_then(serde_json::Value::as_u64)
        {
            session_config.retry_delay_ms = v;
        }
        if let Some(v) = task.sdk_options.get("timeout_ms").and_then(serde_json::Value::as_u64) {
            session_config.timeout_ms = v;
        }

        let session = self
            .coordinator
            .create(CreateSession {
                user_id: task.user_id,
                mode: SessionMode::Background,
                config: session_config,
                parent_session_id: None,
                fork_at_message: None,
                skip_quota,
            })
            .await?;

        let mut execution = TaskExecutionRecord {
            id: TaskExecutionId::new(),
            task_id: task.id,
            session_id: session.id,
            trigger,
            variables: variables.clone(),
            status: TaskExecutionStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
        };
        store.insert_task_execution(&execution)?;
        self.coordinator.bus().publish(MaestroEvent::TaskFired {
            task_id: task.id,
            execution_id: execution.id,
            session_id: session.id,
        });

        // Template failure fails the execution before the agent spawns.
        let prompt = match render_template(&task.prompt_template, &variables) {
            Ok(prompt) => prompt,
            Err(e) => {
                store.complete_task_execution(
                    execution.id,
                    TaskExecutionStatus::Failed,
                    None,
                    Some(&e.to_string()),
                    0,
                )?;
                store.record_task_outcome(task.id, false)?;
                let _ = self.coordinator.terminate(session.id).await;
                return Err(e);
            },
        };

        store.mark_task_execution_running(execution.id)?;

        let run = async {
            self.coordinator.start(session.id).await?;
            self.coordinator
                .execute_background(session.id, &prompt)
                .await
        };
        match run.await {
            Ok(result) => {
                let status = if result.success {
                    TaskExecutionStatus::Completed
                } else {
                    TaskExecutionStatus::Failed
                };
                store.complete_task_execution(
                    execution.id,
                    status,
                    result.data.as_deref(),
                    result.error.as_deref(),
                    result.retry_count,
                )?;
                store.record_task_outcome(task.id, result.success)?;
            },
            Err(e) => {
                store.complete_task_execution(
                    execution.id,
                    TaskExecutionStatus::Failed,
                    None,
                    Some(&e.to_string()),
                    0,
                )?;
                store.record_task_outcome(task.id, false)?;
            },
        }

        execution = store.get_task_execution(execution.id)?;
        if task.generate_report
            && execution.status == TaskExecutionStatus::Completed
            && let Some(sink) = &self.report_sink
        {
            sink.deliver(task, &execution).await;
        }
        Ok(execution)
    }
}
