//! The session coordinator: state-machine owner and lifecycle operations.

use dashmap::DashMap;
use maestro_agent::TransportFactory;
use maestro_config::Config;
use maestro_core::{
    ArchiveId, InvalidStateTransition, SessionId, SessionMode, SessionStatus, UserId,
};
use maestro_events::{EventBus, MaestroEvent};
use maestro_hooks::HookDispatcher;
use maestro_store::{
    ArchiveRecord, ArchiveStatus, MessageRecord, SessionConfig, SessionRecord, Store,
};
use maestro_workdir::WorkdirManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::accountant::{BudgetStatus, CostAccountant, RateTable};
use crate::error::{RuntimeError, RuntimeResult};
use crate::executor::{fork_history_seed, ExecutionResult, SessionRuntime, STREAM_BUFFER};
use crate::options;
use crate::pipeline::{MessagePipeline, TurnOutcome};

/// How long `terminate` waits for an in-flight turn to unwind.
const TERMINATE_DRAIN: Duration = Duration::from_secs(5);

/// Request shape for [`SessionCoordinator::create`].
#[derive(Debug, Clone)]
pub struct CreateSession {
    /// Owning user.
    pub user_id: UserId,
    /// Execution mode.
    pub mode: SessionMode,
    /// Session configuration.
    pub config: SessionConfig,
    /// Parent session (forks only).
    pub parent_session_id: Option<SessionId>,
    /// Copy the parent's history up to this sequence (forks only;
    /// defaults to the whole history).
    pub fork_at_message: Option<u64>,
    /// Bypass the quota check (system tasks).
    pub skip_quota: bool,
}

impl CreateSession {
    /// A plain session for a user.
    #[must_use]
    pub fn new(user_id: UserId, mode: SessionMode) -> Self {
        Self {
            user_id,
            mode,
            config: SessionConfig::default(),
            parent_session_id: None,
            fork_at_message: None,
            skip_quota: false,
        }
    }
}

/// Owns every live session and enforces the lifecycle graph.
pub struct SessionCoordinator<F: TransportFactory + 'static> {
    config: Config,
    store: Arc<Store>,
    workdirs: WorkdirManager,
    bus: EventBus,
    accountant: Arc<CostAccountant>,
    factory: Arc<F>,
    live: DashMap<SessionId, LiveEntry<F>>,
}

/// A live session: its runtime behind the turn lock, plus the cancel
/// token kept outside the lock so terminate never waits for a turn.
struct LiveEntry<F: TransportFactory + 'static> {
    runtime: Arc<Mutex<SessionRuntime<F>>>,
    cancel: tokio_util::sync::CancellationToken,
}

impl<F: TransportFactory + 'static> SessionCoordinator<F> {
    /// Assemble the coordinator.
    pub fn new(
        config: Config,
        store: Arc<Store>,
        factory: F,
    ) -> RuntimeResult<Self> {
        let workdirs = WorkdirManager::new(config.active_root(), config.archive_store.clone())?;
        let accountant = Arc::new(CostAccountant::new(
            Arc::clone(&store),
            RateTable::builtin(),
        ));
        Ok(Self {
            config,
            store,
            workdirs,
            bus: EventBus::new(),
            accountant,
            factory: Arc::new(factory),
            live: DashMap::new(),
        })
    }

    /// The store behind this coordinator.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The event bus transports subscribe to.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The cost accountant.
    #[must_use]
    pub fn accountant(&self) -> &Arc<CostAccountant> {
        &self.accountant
    }

    /// Create a session (and its workdir), enforcing the quota.
    pub async fn create(&self, request: CreateSession) -> RuntimeResult<SessionRecord> {
        let user = self.store.get_user(request.user_id)?;

        if !request.skip_quota {
            let active = self.store.count_quota_sessions(request.user_id)?;
            let limit = user.quotas.max_concurrent_sessions;
            if active >= u64::from(limit) {
                return Err(RuntimeError::QuotaExceeded {
                    user_id: request.user_id,
                    active,
                    limit,
                });
            }
        }

        match (request.mode, request.parent_session_id) {
            (SessionMode::Forked, None) => {
                return Err(RuntimeError::Validation(
                    "forked sessions require a parent".into(),
                ));
            },
            (SessionMode::Interactive | SessionMode::Background, Some(_)) => {
                return Err(RuntimeError::Validation(
                    "parent_session_id is only valid for forks".into(),
                ));
            },
            _ => {},
        }

        // Validate configuration before any side effects.
        let _ = options::build_policy_engine(&request.config, &self.config)?;

        let mut record = SessionRecord::new(request.user_id, request.mode, String::new());
        record.config = request.config;
        record.parent_session_id = request.parent_session_id;

        let mut fork_messages: Vec<MessageRecord> = Vec::new();
        if let Some(parent_id) = request.parent_session_id {
            let parent = self.store.get_session(parent_id)?;
            // Forks inherit the parent's configuration wholesale; only the
            // workdir is their own.
            record.config = parent.config.clone();
            let workdir = self
                .workdirs
                .clone_into(std::path::Path::new(&parent.workdir_path), record.id)
                .await?;
            record.workdir_path = workdir.display().to_string();
            self.store.insert_session(&record)?;

            let up_to = request.fork_at_message.unwrap_or(u64::MAX);
            let copied = self.store.copy_message_prefix(parent_id, record.id, up_to)?;
            fork_messages = self.store.messages_by_session(record.id, None, None)?;
            info!(
                session_id = %record.id,
                parent_id = %parent_id,
                copied,
                "fork created"
            );
        } else {
            let workdir = self.workdirs.create(record.id)?;
            record.workdir_path = workdir.display().to_string();
            self.store.insert_session(&record)?;
            info!(session_id = %record.id, mode = %record.mode, "session created");
        }

        // Re-read so counters reflect the copied prefix.
        let record = self.store.get_session(record.id)?;
        self.install_runtime(&record, fork_history_seed(&fork_messages))?;
        Ok(record)
    }

    fn install_runtime(
        &self,
        record: &SessionRecord,
        fork_seed: Option<String>,
    ) -> RuntimeResult<()> {
        let dispatcher = HookDispatcher::new(
            options::build_hook_registry(&record.config, &self.config, &self.store, &self.bus),
            Arc::clone(&self.store),
        );
        let policy = options::build_policy_engine(&record.config, &self.config)?;
        let agent_config = options::build_agent_config(record, &self.config);

        // Interactive and forked sessions stream partials when asked to;
        // background sessions never do.
        let include_partials = record.config.include_partial_messages
            && record.mode != SessionMode::Background;

        let pipeline = MessagePipeline::new(
            record.id,
            record.user_id,
            agent_config.model.clone(),
            include_partials,
            Arc::clone(&self.store),
            dispatcher,
            policy,
            self.bus.clone(),
            Arc::clone(&self.accountant),
        );
        let runtime = SessionRuntime::new(
            record.id,
            agent_config,
            Arc::clone(&self.factory),
            pipeline,
            Duration::from_millis(record.config.timeout_ms),
            record.config.max_retries,
            record.config.retry_delay_ms,
            fork_seed,
        );
        let cancel = runtime.cancel.clone();
        self.live.insert(
            record.id,
            LiveEntry {
                runtime: Arc::new(Mutex::new(runtime)),
                cancel,
            },
        );
        Ok(())
    }

    fn runtime(&self, session_id: SessionId) -> RuntimeResult<Arc<Mutex<SessionRuntime<F>>>> {
        self.live
            .get(&session_id)
            .map(|entry| Arc::clone(&entry.runtime))
            .ok_or_else(|| RuntimeError::not_found("live session", session_id))
    }

    /// Validated state transition with event broadcast.
    fn transition(&self, session_id: SessionId, to: SessionStatus) -> RuntimeResult<SessionStatus> {
        let record = self.store.get_session(session_id)?;
        record.status.transition(to)?;
        let from = self.store.transition_session(session_id, to)?;
        self.bus.publish(MaestroEvent::SessionStatusChanged {
            session_id,
            from,
            to,
        });
        Ok(from)
    }

    /// Connect the agent subprocess: CREATED → CONNECTING → ACTIVE.
    pub async fn start(&self, session_id: SessionId) -> RuntimeResult<()> {
        self.transition(session_id, SessionStatus::Connecting)?;
        let runtime = self.runtime(session_id)?;
        let mut runtime = runtime.lock().await;
        match runtime.connect().await {
            Ok(()) => {
                self.transition(session_id, SessionStatus::Active)?;
                Ok(())
            },
            Err(e) => {
                error!(session_id = %session_id, error = %e, "connect failed");
                self.transition(session_id, SessionStatus::Failed)?;
                Err(e)
            },
        }
    }

    fn check_budget_for_turn(&self, user_id: UserId) -> RuntimeResult<()> {
        let (status, spent_usd, budget_usd) = self.accountant.check_budget(user_id)?;
        match status {
            BudgetStatus::Over => Err(RuntimeError::BudgetExceeded {
                user_id,
                spent_usd,
                budget_usd,
            }),
            BudgetStatus::Near => {
                warn!(user_id = %user_id, spent_usd, budget_usd, "user nearing budget");
                Ok(())
            },
            BudgetStatus::Under => Ok(()),
        }
    }

    /// Run one interactive turn, streaming persisted messages.
    ///
    /// Returns the live stream immediately; the turn runs on its own
    /// task. The session is PROCESSING for the duration of the turn and
    /// returns to ACTIVE afterwards, whatever the turn's outcome —
    /// failures land the session in FAILED.
    pub async fn start_query(
        self: &Arc<Self>,
        session_id: SessionId,
        prompt: String,
    ) -> RuntimeResult<mpsc::Receiver<MessageRecord>> {
        let record = self.store.get_session(session_id)?;
        self.check_budget_for_turn(record.user_id)?;

        let runtime = self.runtime(session_id)?;
        let guard = runtime.clone().try_lock_owned().map_err(|_| RuntimeError::Busy(session_id))?;

        self.transition(session_id, SessionStatus::Processing)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut guard = guard;
            let result = guard.execute_interactive(&prompt, Some(tx)).await;
            drop(guard);
            coordinator.finish_interactive_turn(session_id, result);
        });
        Ok(rx)
    }

    /// Run one interactive turn to completion (no live stream).
    pub async fn query_and_wait(
        &self,
        session_id: SessionId,
        prompt: &str,
    ) -> RuntimeResult<TurnOutcome> {
        let record = self.store.get_session(session_id)?;
        self.check_budget_for_turn(record.user_id)?;

        let runtime = self.runtime(session_id)?;
        let mut guard = runtime
            .try_lock()
            .map_err(|_| RuntimeError::Busy(session_id))?;
        self.transition(session_id, SessionStatus::Processing)?;
        let result = guard.execute_interactive(prompt, None).await;
        drop(guard);
        match result {
            Ok(outcome) => {
                self.transition(session_id, SessionStatus::Active)?;
                Ok(outcome)
            },
            Err(e) => {
                self.settle_failed_turn(session_id, &e);
                Err(e)
            },
        }
    }

    fn finish_interactive_turn(
        &self,
        session_id: SessionId,
        result: RuntimeResult<TurnOutcome>,
    ) {
        match result {
            Ok(_) => {
                if let Err(e) = self.transition(session_id, SessionStatus::Active) {
                    warn!(session_id = %session_id, error = %e, "post-turn transition failed");
                }
            },
            Err(e) => self.settle_failed_turn(session_id, &e),
        }
    }

    /// A cancelled turn leaves the session ACTIVE (terminate finishes the
    /// job separately); anything else is a failed session.
    fn settle_failed_turn(&self, session_id: SessionId, error: &RuntimeError) {
        let to = match error {
            RuntimeError::Cancelled(_) => SessionStatus::Active,
            _ => SessionStatus::Failed,
        };
        if let Err(e) = self.transition(session_id, to) {
            warn!(session_id = %session_id, error = %e, "failed-turn transition failed");
        }
        if !matches!(error, RuntimeError::Cancelled(_)) {
            error!(session_id = %session_id, error = %error, "turn failed");
        }
    }

    /// Run a background execution: one turn, retry-wrapped, terminal.
    pub async fn execute_background(
        &self,
        session_id: SessionId,
        prompt: &str,
    ) -> RuntimeResult<ExecutionResult> {
        let record = self.store.get_session(session_id)?;
        self.check_budget_for_turn(record.user_id)?;

        let runtime = self.runtime(session_id)?;
        let mut guard = runtime
            .try_lock()
            .map_err(|_| RuntimeError::Busy(session_id))?;
        self.transition(session_id, SessionStatus::Processing)?;

        let result = guard.execute_background(prompt, &self.store).await;
        guard.shutdown().await;
        drop(guard);
        self.live.remove(&session_id);

        let to = if result.success {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        self.transition(session_id, to)?;
        Ok(result)
    }

    /// ACTIVE → PAUSED.
    pub fn pause(&self, session_id: SessionId) -> RuntimeResult<()> {
        self.transition(session_id, SessionStatus::Paused)?;
        Ok(())
    }

    /// PAUSED → ACTIVE.
    pub fn resume(&self, session_id: SessionId) -> RuntimeResult<()> {
        let record = self.store.get_session(session_id)?;
        if record.status != SessionStatus::Paused {
            return Err(RuntimeError::InvalidStateTransition(InvalidStateTransition {
                from: record.status,
                to: SessionStatus::Active,
            }));
        }
        self.transition(session_id, SessionStatus::Active)?;
        Ok(())
    }

    /// Best-effort termination: cancel the in-flight turn, interrupt the
    /// subprocess, transition to TERMINATED.
    pub async fn terminate(&self, session_id: SessionId) -> RuntimeResult<()> {
        // Cancel without taking the turn lock; the in-flight turn observes
        // the token between frames.
        if let Some(entry) = self.live.get(&session_id) {
            entry.cancel.cancel();
        }

        // Wait for an in-flight turn to unwind (PROCESSING has no edge to
        // TERMINATED; the turn first settles back to ACTIVE).
        let deadline = tokio::time::Instant::now() + TERMINATE_DRAIN;
        loop {
            let record = self.store.get_session(session_id)?;
            if record.status != SessionStatus::Processing {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                // The turn is stuck somewhere that never observes the
                // cancel token (hook dispatch, a store write). Force the
                // session out of PROCESSING so termination still
                // completes; when the stuck turn eventually settles, its
                // own transition becomes a logged no-op.
                warn!(
                    session_id = %session_id,
                    "turn did not unwind before terminate deadline; forcing"
                );
                if let Err(e) = self.transition(session_id, SessionStatus::Active) {
                    // The turn settled concurrently; proceed either way.
                    warn!(session_id = %session_id, error = %e, "forced settle raced the turn");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let record = self.store.get_session(session_id)?;
        if record.status.is_terminal() {
            return Ok(());
        }
        self.transition(session_id, SessionStatus::Terminated)?;

        if let Some((_, entry)) = self.live.remove(&session_id) {
            match entry.runtime.try_lock() {
                Ok(mut runtime) => runtime.shutdown().await,
                Err(_) => {
                    // A stuck turn still holds the turn lock; reap the
                    // subprocess as soon as it lets go instead of
                    // blocking terminate on it.
                    let runtime = Arc::clone(&entry.runtime);
                    tokio::spawn(async move {
                        runtime.lock().await.shutdown().await;
                    });
                },
            }
        }
        info!(session_id = %session_id, "session terminated");
        Ok(())
    }

    /// Archive a terminal session's workdir.
    ///
    /// On success the session transitions to ARCHIVED and its workdir is
    /// consumed. On failure the archive row records FAILED and the
    /// session stays in its terminal state.
    pub async fn archive(&self, session_id: SessionId) -> RuntimeResult<ArchiveRecord> {
        let record = self.store.get_session(session_id)?;
        // Fail fast on sessions that cannot be archived.
        record.status.transition(SessionStatus::Archived)?;

        let archive_id = ArchiveId::new();
        let compression = self.config.archive_compression;
        let pending = ArchiveRecord {
            id: archive_id,
            session_id,
            path: String::new(),
            size_bytes: 0,
            compression,
            manifest: Vec::new(),
            status: ArchiveStatus::Pending,
            error: None,
            created_at: chrono::Utc::now(),
            archived_at: None,
        };
        self.store.insert_archive(&pending)?;
        self.store.mark_archive_in_progress(archive_id)?;

        match self.workdirs.archive(session_id, compression).await {
            Ok(output) => {
                self.store.complete_archive(
                    archive_id,
                    &output.path.display().to_string(),
                    output.size_bytes,
                    &output.manifest,
                )?;
                self.store.mark_session_archived(session_id, archive_id)?;
                self.bus.publish(MaestroEvent::SessionStatusChanged {
                    session_id,
                    from: record.status,
                    to: SessionStatus::Archived,
                });
                // Archival consumes the workdir; a failed delete is not
                // worth failing an otherwise completed archive.
                if let Err(e) = self
                    .workdirs
                    .delete(std::path::Path::new(&record.workdir_path))
                {
                    warn!(session_id = %session_id, error = %e, "workdir cleanup failed");
                }
                info!(
                    session_id = %session_id,
                    archive_id = %archive_id,
                    size_bytes = output.size_bytes,
                    "session archived"
                );
                self.store
                    .archive_by_session(session_id)?
                    .ok_or_else(|| RuntimeError::Fatal("archive row vanished".into()))
            },
            Err(e) => {
                self.store.fail_archive(archive_id, &e.to_string())?;
                error!(session_id = %session_id, error = %e, "archival failed");
                Err(e.into())
            },
        }
    }

    /// Fork a session: copied history, cloned workdir, FORKED mode.
    pub async fn fork(
        &self,
        parent_session_id: SessionId,
        fork_at_message: Option<u64>,
    ) -> RuntimeResult<SessionRecord> {
        let parent = self.store.get_session(parent_session_id)?;
        self.create(CreateSession {
            user_id: parent.user_id,
            mode: SessionMode::Forked,
            config: parent.config.clone(),
            parent_session_id: Some(parent_session_id),
            fork_at_message,
            skip_quota: false,
        })
        .await
    }

    /// Periodic metric snapshots of live sessions.
    pub fn spawn_snapshotter(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let interval = Duration::from_millis(coordinator.config.metrics_snapshot_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let ids: Vec<SessionId> =
                    coordinator.live.iter().map(|e| *e.key()).collect();
                for session_id in ids {
                    match coordinator.store.get_session(session_id) {
                        Ok(record)
                            if matches!(
                                record.status,
                                SessionStatus::Active
                                    | SessionStatus::Processing
                                    | SessionStatus::WaitingUser
                            ) =>
                        {
                            if let Err(e) = coordinator
                                .store
                                .insert_metrics_snapshot(session_id, &record.metrics)
                            {
                                warn!(session_id = %session_id, error = %e, "snapshot failed");
                            }
                        },
                        Ok(_) => {},
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "snapshot lookup failed");
                        },
                    }
                }
            }
        })
    }
}
