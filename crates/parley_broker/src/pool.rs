//! Reviewer subprocess pool.
//!
//! The pool owns the in-memory map of live worker handles and the
//! draining set; the `reviewers` table is their persisted shadow. The two
//! sides are reconciled by the reapers. All DB writes here go through the
//! store's write token.

use crate::audit::record_event;
use crate::config::PoolConfig;
use crate::error::OpError;
use crate::spawn::{
    build_worker_argv, load_prompt_template, resolve_prompt_template_path, SpawnTemplateError,
};
use crate::store::{now_iso, Store};
use parley_protocol::{AuditEventType, ReviewerStatus};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

const TERMINATE_GRACE: Duration = Duration::from_secs(10);
const SPAWN_FAILURE_REAP_GRACE: Duration = Duration::from_secs(2);

pub const POOL_ACTOR: &str = "pool-manager";

/// Argv construction and prompt rendering for worker subprocesses.
///
/// Platform-specific; injected so tests can launch inert commands.
pub trait WorkerLauncher: Send + Sync {
    fn build_argv(&self, config: &PoolConfig) -> Vec<String>;
    fn render_prompt(
        &self,
        config: &PoolConfig,
        reviewer_id: &str,
    ) -> Result<String, SpawnTemplateError>;
}

/// Production launcher: codex argv + prompt template from disk.
pub struct CodexLauncher;

impl WorkerLauncher for CodexLauncher {
    fn build_argv(&self, config: &PoolConfig) -> Vec<String> {
        build_worker_argv(config)
    }

    fn render_prompt(
        &self,
        config: &PoolConfig,
        reviewer_id: &str,
    ) -> Result<String, SpawnTemplateError> {
        let path = resolve_prompt_template_path(config);
        load_prompt_template(&path, reviewer_id)
    }
}

struct PoolState {
    counter: u64,
    processes: HashMap<String, Child>,
    /// Project scope each worker was spawned for (None = unscoped).
    projects: HashMap<String, Option<String>>,
    draining: HashSet<String>,
    last_spawn: Option<Instant>,
}

/// In-memory reviewer subprocess registry with DB persistence hooks.
pub struct ReviewerPool {
    pub session_token: String,
    pub config: PoolConfig,
    launcher: Box<dyn WorkerLauncher>,
    state: Mutex<PoolState>,
    /// Serializes whole spawn attempts so the cap check stays accurate
    /// (the process lands in the map only after the subprocess starts).
    spawn_lock: Mutex<()>,
    /// Serializes reactive scaling passes.
    scale_lock: Mutex<()>,
}

impl ReviewerPool {
    pub fn new(session_token: String, config: PoolConfig) -> Self {
        Self::with_launcher(session_token, config, Box::new(CodexLauncher))
    }

    pub fn with_launcher(
        session_token: String,
        config: PoolConfig,
        launcher: Box<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            session_token,
            config,
            launcher,
            state: Mutex::new(PoolState {
                counter: 0,
                processes: HashMap::new(),
                projects: HashMap::new(),
                draining: HashSet::new(),
                last_spawn: None,
            }),
            spawn_lock: Mutex::new(()),
            scale_lock: Mutex::new(()),
        }
    }

    /// Hold this across a reactive scaling pass; passes triggered from
    /// create/requeue/startup/periodic may otherwise interleave and
    /// overshoot a bucket.
    pub async fn scale_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.scale_lock.lock().await
    }

    /// Count running, non-draining reviewer subprocesses.
    pub async fn active_count(&self) -> usize {
        let mut state = self.state.lock().await;
        let draining = state.draining.clone();
        let mut count = 0;
        for (id, child) in state.processes.iter_mut() {
            if !draining.contains(id) && matches!(child.try_wait(), Ok(None)) {
                count += 1;
            }
        }
        count
    }

    pub async fn is_draining(&self, reviewer_id: &str) -> bool {
        self.state.lock().await.draining.contains(reviewer_id)
    }

    /// Count running, non-draining workers spawned for a given project
    /// bucket (None = unscoped).
    pub async fn active_count_for_project(&self, project: Option<&str>) -> usize {
        let mut state = self.state.lock().await;
        let draining = state.draining.clone();
        let projects = state.projects.clone();
        let mut count = 0;
        for (id, child) in state.processes.iter_mut() {
            if !draining.contains(id)
                && projects.get(id).map(Option::as_deref).unwrap_or(None) == project
                && matches!(child.try_wait(), Ok(None))
            {
                count += 1;
            }
        }
        count
    }

    /// True when the pool holds a live handle for this reviewer under the
    /// current session. Used to decide whether a claim reservation is
    /// still enforceable.
    pub async fn process_alive(&self, reviewer_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.processes.get_mut(reviewer_id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Reviewer ids whose subprocess has exited, with the exit code.
    pub async fn dead_processes(&self) -> Vec<(String, Option<i32>)> {
        let mut state = self.state.lock().await;
        let mut dead = Vec::new();
        for (id, child) in state.processes.iter_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                dead.push((id.clone(), status.code()));
            }
        }
        dead
    }

    /// Spawn and persist a reviewer subprocess.
    ///
    /// `ignore_cooldown` is set by reactive scaling passes, whose cadence
    /// is already throttled by the periodic interval; the cooldown gates
    /// manual spawns.
    pub async fn spawn_reviewer(
        &self,
        store: &Store,
        project: Option<&str>,
        ignore_cooldown: bool,
    ) -> Result<Value, OpError> {
        let _spawn_guard = self.spawn_lock.lock().await;
        let (reviewer_id, display_name, argv) = {
            let mut state = self.state.lock().await;

            if !ignore_cooldown {
                if let Some(last) = state.last_spawn {
                    let elapsed = last.elapsed().as_secs_f64();
                    if elapsed < self.config.spawn_cooldown_seconds {
                        let retry_after = ((self.config.spawn_cooldown_seconds - elapsed)
                            * 1000.0)
                            .round()
                            / 1000.0;
                        info!(retry_after, "spawn_reviewer blocked by cooldown");
                        return Err(OpError::CooldownActive {
                            retry_after_seconds: retry_after,
                        });
                    }
                }
            }

            let draining = state.draining.clone();
            let mut active = 0;
            for (id, child) in state.processes.iter_mut() {
                if !draining.contains(id) && matches!(child.try_wait(), Ok(None)) {
                    active += 1;
                }
            }
            if active >= self.config.max_pool_size as usize {
                info!(active, max = self.config.max_pool_size, "spawn_reviewer blocked by cap");
                return Err(OpError::PoolCapReached {
                    max_pool_size: self.config.max_pool_size,
                });
            }

            state.counter += 1;
            let display_name = format!("codex-r{}", state.counter);
            let reviewer_id = format!("{}-{}", display_name, self.session_token);
            let argv = self.launcher.build_argv(&self.config);
            (reviewer_id, display_name, argv)
        };

        let prompt = self
            .launcher
            .render_prompt(&self.config, &reviewer_id)
            .map_err(|err| OpError::internal("spawn_reviewer", err.to_string()))?;

        info!(
            reviewer_id = %reviewer_id,
            model = %self.config.model,
            "spawning reviewer worker"
        );

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| {
            warn!(reviewer_id = %reviewer_id, %err, "failed to start reviewer subprocess");
            OpError::internal("spawn_reviewer", format!("Failed to spawn reviewer: {err}"))
        })?;
        let pid = child.id().map(|p| p as i64);

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                reap_spawn_failure(&mut child).await;
                return Err(OpError::internal(
                    "spawn_reviewer",
                    format!("Failed to write worker prompt: {err}"),
                ));
            }
            drop(stdin);
        }

        self.attach_stdio_capture(&reviewer_id, &mut child);

        {
            let mut state = self.state.lock().await;
            state.processes.insert(reviewer_id.clone(), child);
            state
                .projects
                .insert(reviewer_id.clone(), project.map(str::to_string));
            state.last_spawn = Some(Instant::now());
        }

        // Persist the reviewer row + audit event atomically. A DB failure
        // must not leave an orphaned subprocess behind.
        let persisted: Result<(), OpError> = async {
            let mut tx = store
                .begin_write()
                .await
                .map_err(|e| OpError::store("spawn_reviewer", e))?;
            let result: Result<(), sqlx::Error> = async {
                sqlx::query(
                    "INSERT INTO reviewers (
                         id, display_name, session_token, status, pid,
                         spawned_at, last_active_at
                     ) VALUES (?, ?, ?, 'active', ?, ?, ?)",
                )
                .bind(&reviewer_id)
                .bind(&display_name)
                .bind(&self.session_token)
                .bind(pid)
                .bind(now_iso())
                .bind(now_iso())
                .execute(tx.conn())
                .await?;
                record_event(
                    &mut tx,
                    None,
                    AuditEventType::ReviewerSpawned,
                    Some(POOL_ACTOR),
                    None,
                    Some(ReviewerStatus::Active.as_str()),
                    Some(json!({
                        "reviewer_id": &reviewer_id,
                        "display_name": &display_name,
                        "pid": pid,
                        "project_scope": project,
                    })),
                )
                .await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => tx
                    .commit()
                    .await
                    .map_err(|e| OpError::store("spawn_reviewer", e)),
                Err(err) => {
                    tx.rollback_quietly().await;
                    Err(OpError::store("spawn_reviewer", err))
                }
            }
        }
        .await;

        if let Err(err) = persisted {
            let mut state = self.state.lock().await;
            state.projects.remove(&reviewer_id);
            if let Some(mut child) = state.processes.remove(&reviewer_id) {
                reap_spawn_failure(&mut child).await;
            }
            warn!(reviewer_id = %reviewer_id, %err, "spawn_reviewer rollback: reaped subprocess");
            return Err(err);
        }

        info!(reviewer_id = %reviewer_id, ?pid, "reviewer worker spawned");
        Ok(json!({
            "reviewer_id": reviewer_id,
            "display_name": display_name,
            "pid": pid,
            "status": "active",
            "project_scope": project,
        }))
    }

    /// Copy the worker's stdout/stderr into its rotating JSONL log.
    fn attach_stdio_capture(&self, reviewer_id: &str, child: &mut Child) {
        let sink = match parley_logging::WorkerLogSink::open(reviewer_id) {
            Ok(sink) => sink,
            Err(err) => {
                warn!(reviewer_id, %err, "worker log sink unavailable; discarding stdio");
                return;
            }
        };
        if let Some(stdout) = child.stdout.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.record_line("stdout", &line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.record_line("stderr", &line);
                }
            });
        }
    }

    /// Mark reviewer as draining and terminate if no active claims remain.
    pub async fn drain_reviewer(
        &self,
        reviewer_id: &str,
        store: &Store,
        reason: &str,
    ) -> Result<Value, OpError> {
        {
            let mut state = self.state.lock().await;
            state.draining.insert(reviewer_id.to_string());
        }

        let mut tx = store
            .begin_write()
            .await
            .map_err(|e| OpError::store("drain_reviewer", e))?;
        let remaining: Result<i64, sqlx::Error> = async {
            sqlx::query(
                "UPDATE reviewers
                 SET status = 'draining', last_active_at = ?
                 WHERE id = ?",
            )
            .bind(now_iso())
            .bind(reviewer_id)
            .execute(tx.conn())
            .await?;
            record_event(
                &mut tx,
                None,
                AuditEventType::ReviewerDrainStart,
                Some(POOL_ACTOR),
                Some(ReviewerStatus::Active.as_str()),
                Some(ReviewerStatus::Draining.as_str()),
                Some(json!({ "reviewer_id": reviewer_id, "reason": reason })),
            )
            .await?;
            let remaining: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM reviews WHERE status = 'claimed' AND claimed_by = ?",
            )
            .bind(reviewer_id)
            .fetch_one(tx.conn())
            .await?;
            Ok(remaining)
        }
        .await;

        let remaining = match remaining {
            Ok(remaining) => {
                tx.commit()
                    .await
                    .map_err(|e| OpError::store("drain_reviewer", e))?;
                remaining
            }
            Err(err) => {
                tx.rollback_quietly().await;
                return Err(OpError::store("drain_reviewer", err));
            }
        };

        info!(reviewer_id, reason, remaining, "reviewer draining");
        let mut terminated = false;
        if remaining == 0 {
            self.terminate_reviewer(reviewer_id, store).await;
            terminated = true;
        }
        Ok(json!({
            "reviewer_id": reviewer_id,
            "status": "draining",
            "remaining_claims": remaining,
            "terminated": terminated,
        }))
    }

    /// Mark a dead-process reviewer as draining without touching the
    /// subprocess (it already exited). Used by the dead-process reaper
    /// when open reviews are still attached.
    pub async fn mark_dead_process_draining(
        &self,
        reviewer_id: &str,
        store: &Store,
        exit_code: Option<i32>,
        open_reviews: i64,
    ) -> Result<(), OpError> {
        {
            let mut state = self.state.lock().await;
            state.draining.insert(reviewer_id.to_string());
        }

        let mut tx = store
            .begin_write()
            .await
            .map_err(|e| OpError::store("dead_process_sweep", e))?;
        let result: Result<(), sqlx::Error> = async {
            sqlx::query(
                "UPDATE reviewers
                 SET status = 'draining', last_active_at = ?
                 WHERE id = ?",
            )
            .bind(now_iso())
            .bind(reviewer_id)
            .execute(tx.conn())
            .await?;
            record_event(
                &mut tx,
                None,
                AuditEventType::ReviewerDrainStart,
                Some(POOL_ACTOR),
                Some(ReviewerStatus::Active.as_str()),
                Some(ReviewerStatus::Draining.as_str()),
                Some(json!({
                    "reviewer_id": reviewer_id,
                    "reason": "process_exit",
                    "exit_code": exit_code,
                    "open_reviews": open_reviews,
                })),
            )
            .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| OpError::store("dead_process_sweep", e)),
            Err(err) => {
                tx.rollback_quietly().await;
                Err(OpError::store("dead_process_sweep", err))
            }
        }
    }

    /// Terminate a reviewer subprocess and persist the lifecycle state.
    ///
    /// Polite termination first, 10s grace, then kill. DB failures here
    /// are logged and swallowed: the process is already gone and the
    /// startup sweep repairs stale rows.
    pub async fn terminate_reviewer(&self, reviewer_id: &str, store: &Store) {
        let child = {
            let mut state = self.state.lock().await;
            state.draining.remove(reviewer_id);
            state.projects.remove(reviewer_id);
            state.processes.remove(reviewer_id)
        };

        let mut exit_code: Option<i32> = None;
        if let Some(mut child) = child {
            match child.try_wait() {
                Ok(Some(status)) => exit_code = status.code(),
                _ => {
                    terminate_politely(&child);
                    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                        Ok(Ok(status)) => exit_code = status.code(),
                        _ => {
                            let _ = child.start_kill();
                            if let Ok(status) = child.wait().await {
                                exit_code = status.code();
                            }
                        }
                    }
                }
            }
        }

        let result: Result<(), sqlx::Error> = async {
            let mut tx = store.begin_write().await?;
            let inner: Result<(), sqlx::Error> = async {
                let reviews_completed: Option<i64> =
                    sqlx::query_scalar("SELECT reviews_completed FROM reviewers WHERE id = ?")
                        .bind(reviewer_id)
                        .fetch_optional(tx.conn())
                        .await?;
                sqlx::query(
                    "UPDATE reviewers
                     SET status = 'terminated', terminated_at = ?
                     WHERE id = ?",
                )
                .bind(now_iso())
                .bind(reviewer_id)
                .execute(tx.conn())
                .await?;
                record_event(
                    &mut tx,
                    None,
                    AuditEventType::ReviewerTerminated,
                    Some(POOL_ACTOR),
                    Some(ReviewerStatus::Draining.as_str()),
                    Some(ReviewerStatus::Terminated.as_str()),
                    Some(json!({
                        "reviewer_id": reviewer_id,
                        "exit_code": exit_code,
                        "reviews_completed": reviews_completed.unwrap_or(0),
                    })),
                )
                .await?;
                Ok(())
            }
            .await;
            match inner {
                Ok(()) => tx.commit().await,
                Err(err) => {
                    tx.rollback_quietly().await;
                    Err(err)
                }
            }
        }
        .await;

        if let Err(err) = result {
            warn!(reviewer_id, %err, "failed to persist reviewer termination");
        } else {
            info!(reviewer_id, ?exit_code, "reviewer terminated");
        }
    }

    /// Terminate all tracked reviewers. Called from lifespan teardown.
    pub async fn shutdown_all(&self, store: &Store) {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state.processes.keys().cloned().collect()
        };
        for reviewer_id in ids {
            self.terminate_reviewer(&reviewer_id, store).await;
        }
    }

    /// Increment reviewer performance counters after a verdict.
    pub async fn update_reviewer_stats(
        &self,
        reviewer_id: &str,
        store: &Store,
        verdict: &str,
        review_duration_seconds: f64,
    ) {
        let result: Result<(), sqlx::Error> = async {
            let mut tx = store.begin_write().await?;
            let inner = sqlx::query(
                "UPDATE reviewers
                 SET reviews_completed = reviews_completed + 1,
                     total_review_seconds = total_review_seconds + ?,
                     approvals = approvals + CASE WHEN ? = 'approved' THEN 1 ELSE 0 END,
                     rejections = rejections + CASE WHEN ? = 'changes_requested' THEN 1 ELSE 0 END,
                     last_active_at = ?
                 WHERE id = ?",
            )
            .bind(review_duration_seconds)
            .bind(verdict)
            .bind(verdict)
            .bind(now_iso())
            .bind(reviewer_id)
            .execute(tx.conn())
            .await;
            match inner {
                Ok(_) => tx.commit().await,
                Err(err) => {
                    tx.rollback_quietly().await;
                    Err(err)
                }
            }
        }
        .await;
        if let Err(err) = result {
            warn!(reviewer_id, %err, "failed to update reviewer stats");
        }
    }
}

/// Ask the child to exit without force. SIGTERM on unix; elsewhere the
/// grace period falls through to kill.
fn terminate_politely(child: &Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

async fn reap_spawn_failure(child: &mut Child) {
    if matches!(child.try_wait(), Ok(None)) {
        terminate_politely(child);
        if tokio::time::timeout(SPAWN_FAILURE_REAP_GRACE, child.wait())
            .await
            .is_err()
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}
