//! Script name → child process table.
//!
//! Every mutating operation for a name runs under that name's async lock; the
//! table lock itself is only held for bookkeeping, never across a process
//! wait. Each entry owns two background tasks: a crash monitor that restarts
//! the script under the restart policy, and a shipper that periodically
//! forwards fresh log output to the owning chat.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use hostbot_process::{
    ProcessState, ProcessStatus, REQUIREMENTS_FILE, RunId, ScriptKind, ScriptName,
};
use tokio::{
    process::{Child, Command},
    sync::Mutex,
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::SupervisorConfig,
    error::{SupervisorError, format_error_chain},
    logfile,
    notify::Outbox,
    restart::{GiveUpReason, RestartDecision, RestartTracker},
};

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub name: ScriptName,
    pub chat_id: i64,
    pub owner_id: i64,
    pub key_used: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub status: ProcessStatus,
    /// A previous run of the same name was torn down first.
    pub replaced: bool,
    /// Non-fatal problems, e.g. a failed `pip install`.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub was_running: bool,
    pub removed_script: bool,
    pub removed_log: bool,
}

struct ProcessEntry {
    run_id: RunId,
    state: ProcessState,
    pid: Option<u32>,
    pgid: Option<i32>,
    /// `None` while waiting out a restart delay.
    child: Option<Child>,
    chat_id: i64,
    owner_id: i64,
    key_used: Option<String>,
    started_at: DateTime<Utc>,
    spawned_at: Instant,
    restart: RestartTracker,
    monitor: Option<JoinHandle<()>>,
    shipper: Option<JoinHandle<()>>,
}

impl ProcessEntry {
    fn status(&self, name: &ScriptName) -> ProcessStatus {
        ProcessStatus {
            name: name.clone(),
            run_id: self.run_id.clone(),
            state: self.state,
            pid: self.pid,
            chat_id: self.chat_id,
            owner_id: self.owner_id,
            key_used: self.key_used.clone(),
            started_at: self.started_at,
            restarts_in_window: self.restart.restarts_in_window(Instant::now()),
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(h) = self.monitor.take() {
            h.abort();
        }
        if let Some(h) = self.shipper.take() {
            h.abort();
        }
    }
}

struct Spawned {
    child: Child,
    pid: Option<u32>,
    pgid: Option<i32>,
    /// Log length right before the child started writing.
    log_offset: u64,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    cfg: Arc<SupervisorConfig>,
    inner: Arc<Mutex<HashMap<ScriptName, ProcessEntry>>>,
    name_locks: Arc<std::sync::Mutex<HashMap<ScriptName, Arc<Mutex<()>>>>>,
    outbox: Outbox,
    admin_chat_id: i64,
}

impl ProcessSupervisor {
    pub fn new(cfg: SupervisorConfig, outbox: Outbox, admin_chat_id: i64) -> Self {
        Self {
            cfg: Arc::new(cfg),
            inner: Arc::new(Mutex::new(HashMap::new())),
            name_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            outbox,
            admin_chat_id,
        }
    }

    pub fn script_path(&self, name: &ScriptName) -> PathBuf {
        self.cfg.uploads_dir.join(name.as_str())
    }

    pub fn log_path(&self, name: &ScriptName) -> PathBuf {
        logfile::log_path(&self.cfg.logs_dir, name)
    }

    fn name_lock(&self, name: &ScriptName) -> Arc<Mutex<()>> {
        let mut locks = self.name_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.clone()).or_default().clone()
    }

    /// Drops the lock entry for a deleted name unless another task holds it.
    fn release_name_lock(&self, name: &ScriptName) {
        let mut locks = self.name_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(name).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(name);
        }
    }

    /// Runs `f` while holding the per-name lock, so no start/stop/restart for
    /// the same name can interleave (used for uploads replacing a script).
    pub async fn with_name_locked<F, Fut, T>(&self, name: &ScriptName, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        f().await
    }

    pub async fn start(&self, req: StartRequest) -> Result<StartOutcome, SupervisorError> {
        let lock = self.name_lock(&req.name);
        let _guard = lock.lock().await;
        self.start_locked(req).await
    }

    /// Stop-then-start. Keeps the previous run's key when none is given.
    pub async fn restart(&self, mut req: StartRequest) -> Result<StartOutcome, SupervisorError> {
        let lock = self.name_lock(&req.name);
        let _guard = lock.lock().await;
        if req.key_used.is_none() {
            req.key_used = self
                .inner
                .lock()
                .await
                .get(&req.name)
                .and_then(|e| e.key_used.clone());
        }
        self.start_locked(req).await
    }

    async fn start_locked(&self, req: StartRequest) -> Result<StartOutcome, SupervisorError> {
        let name = req.name.clone();
        if !name.kind().is_runnable() {
            return Err(SupervisorError::NotRunnable(name));
        }
        if !tokio::fs::try_exists(self.script_path(&name))
            .await
            .unwrap_or(false)
        {
            return Err(SupervisorError::NotFound(name));
        }

        let previous = self.inner.lock().await.remove(&name);
        let replaced = previous.is_some();
        if let Some(entry) = previous {
            self.teardown(&name, entry).await;
        }

        let mut warnings = Vec::new();
        if name.kind() == ScriptKind::Python
            && self.cfg.install_requirements
            && let Some(w) = self.install_requirements(&name).await
        {
            warnings.push(w);
        }

        let mut inner = self.inner.lock().await;
        if inner.len() >= self.cfg.max_running {
            return Err(SupervisorError::TooManyRunning(self.cfg.max_running));
        }

        let spawned = spawn_child(&self.cfg, &name)?;
        let run_id = RunId::new();
        let mut entry = ProcessEntry {
            run_id: run_id.clone(),
            state: ProcessState::Running,
            pid: spawned.pid,
            pgid: spawned.pgid,
            child: Some(spawned.child),
            chat_id: req.chat_id,
            owner_id: req.owner_id,
            key_used: req.key_used,
            started_at: Utc::now(),
            spawned_at: Instant::now(),
            restart: RestartTracker::new(self.cfg.restart),
            monitor: None,
            shipper: None,
        };
        entry.monitor = Some(tokio::spawn(
            self.clone().monitor(name.clone(), run_id.clone()),
        ));
        entry.shipper = Some(tokio::spawn(self.clone().ship_logs(
            name.clone(),
            run_id.clone(),
            spawned.log_offset,
        )));

        let status = entry.status(&name);
        inner.insert(name.clone(), entry);
        drop(inner);

        tracing::info!(
            name = %name,
            run_id = %run_id.short(),
            pid = ?status.pid,
            replaced,
            "script started"
        );
        Ok(StartOutcome {
            status,
            replaced,
            warnings,
        })
    }

    pub async fn stop(&self, name: &ScriptName) -> Result<ProcessStatus, SupervisorError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let entry = self
            .inner
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| SupervisorError::NotRunning(name.clone()))?;
        let status = entry.status(name);
        self.teardown(name, entry).await;
        tracing::info!(name = %name, run_id = %status.run_id.short(), "script stopped");
        Ok(status)
    }

    /// Stops the script if it runs, then removes the script and its log.
    pub async fn delete(&self, name: &ScriptName) -> Result<DeleteOutcome, SupervisorError> {
        let lock = self.name_lock(name);
        let result = {
            let _guard = lock.lock().await;
            self.delete_locked(name).await
        };
        drop(lock);
        self.release_name_lock(name);
        result
    }

    async fn delete_locked(&self, name: &ScriptName) -> Result<DeleteOutcome, SupervisorError> {
        let mut out = DeleteOutcome::default();
        let entry = self.inner.lock().await.remove(name);
        if let Some(entry) = entry {
            out.was_running = true;
            self.teardown(name, entry).await;
        }

        let script = self.script_path(name);
        out.removed_script = remove_if_exists(&script)
            .await
            .map_err(SupervisorError::io(format!("remove {}", script.display())))?;
        let log = self.log_path(name);
        out.removed_log = remove_if_exists(&log)
            .await
            .map_err(SupervisorError::io(format!("remove {}", log.display())))?;

        tracing::info!(name = %name, was_running = out.was_running, "script deleted");
        Ok(out)
    }

    pub async fn status(&self) -> Vec<ProcessStatus> {
        let inner = self.inner.lock().await;
        let mut out: Vec<ProcessStatus> = inner.iter().map(|(n, e)| e.status(n)).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn get(&self, name: &ScriptName) -> Option<ProcessStatus> {
        self.inner.lock().await.get(name).map(|e| e.status(name))
    }

    pub async fn is_running(&self, name: &ScriptName) -> bool {
        self.inner.lock().await.contains_key(name)
    }

    pub async fn tail_log(
        &self,
        name: &ScriptName,
        max_bytes: usize,
    ) -> Result<Option<String>, SupervisorError> {
        let path = self.log_path(name);
        logfile::tail(&path, max_bytes)
            .await
            .map_err(SupervisorError::io(format!("read {}", path.display())))
    }

    /// Called once on service exit. Children are left running unless
    /// `stop_children` is set.
    pub async fn shutdown(&self, stop_children: bool) {
        let entries: Vec<(ScriptName, ProcessEntry)> = self.inner.lock().await.drain().collect();
        for (name, mut entry) in entries {
            if stop_children {
                self.teardown(&name, entry).await;
            } else {
                entry.abort_tasks();
                tracing::info!(name = %name, pid = ?entry.pid, "leaving script running");
            }
        }
    }

    async fn teardown(&self, name: &ScriptName, mut entry: ProcessEntry) {
        entry.abort_tasks();
        let Some(mut child) = entry.child.take() else {
            return;
        };

        let exit = terminate(&mut child, entry.pgid, self.cfg.stop_timeout).await;
        let note = match exit {
            Some(status) => format!("stopped ({})", describe_exit(&status)),
            None => "stopped".to_string(),
        };
        if let Err(e) = logfile::append_marker(&self.log_path(name), &note) {
            tracing::warn!(name = %name, error = %e, "failed to write log marker");
        }
    }

    async fn install_requirements(&self, name: &ScriptName) -> Option<String> {
        let manifest = self.cfg.uploads_dir.join(REQUIREMENTS_FILE);
        if !tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            return None;
        }

        match self.run_pip(&self.log_path(name)).await {
            Ok(()) => {
                tracing::info!(name = %name, "requirements installed");
                None
            }
            Err(e) => {
                let msg = format_error_chain(&e);
                tracing::warn!(name = %name, error = %msg, "requirements install failed");
                Some(format!("{REQUIREMENTS_FILE}: {msg}"))
            }
        }
    }

    async fn run_pip(&self, log_path: &Path) -> anyhow::Result<()> {
        let mut log = logfile::open_append(log_path).context("open log")?;
        logfile::write_marker(&mut log, "installing requirements.txt").context("write log")?;
        let out = log.try_clone().context("clone log handle")?;

        let mut child = Command::new(&self.cfg.python_bin)
            .args(["-m", "pip", "install", "-r", REQUIREMENTS_FILE])
            .current_dir(&self.cfg.uploads_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("run {} -m pip", self.cfg.python_bin))?;

        match tokio::time::timeout(self.cfg.install_timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => anyhow::bail!("pip install failed ({})", describe_exit(&status)),
            Ok(Err(e)) => Err(e).context("wait for pip install"),
            Err(_) => {
                let _ = child.start_kill();
                anyhow::bail!(
                    "pip install timed out after {}s",
                    self.cfg.install_timeout.as_secs()
                )
            }
        }
    }

    async fn monitor(self, name: ScriptName, run_id: RunId) {
        loop {
            tokio::time::sleep(self.cfg.monitor_interval).await;

            let (status, decision, chat_id) = {
                let mut inner = self.inner.lock().await;
                let Some(entry) = inner.get_mut(&name) else {
                    return;
                };
                if entry.run_id != run_id {
                    return;
                }
                let Some(child) = entry.child.as_mut() else {
                    return;
                };
                let status = match child.try_wait() {
                    Ok(Some(status)) => status,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(name = %name, error = %e, "try_wait failed");
                        continue;
                    }
                };

                entry.child = None;
                entry.pid = None;
                entry.pgid = None;
                let uptime = entry.spawned_at.elapsed();
                entry.restart.note_uptime(uptime);
                let decision = entry.restart.decide(status.code(), Instant::now());
                let chat_id = entry.chat_id;

                match decision {
                    RestartDecision::Restart { .. } => entry.state = ProcessState::Restarting,
                    RestartDecision::GiveUp(_) => {
                        if let Some(mut gone) = inner.remove(&name) {
                            // Only the shipper; this task is the monitor.
                            if let Some(h) = gone.shipper.take() {
                                h.abort();
                            }
                        }
                    }
                }
                (status, decision, chat_id)
            };

            let exit = describe_exit(&status);
            let chats = [self.admin_chat_id, chat_id];
            match decision {
                RestartDecision::Restart { attempt, delay } => {
                    tracing::warn!(
                        name = %name,
                        run_id = %run_id.short(),
                        exit = %exit,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "script exited; restarting"
                    );
                    self.mark(&name, &format!("exited ({exit}); restart {attempt} in {}", fmt_delay(delay)));
                    self.outbox.send_many(
                        &chats,
                        &format!(
                            "⚠️ {name} exited ({exit}). Restart {attempt} in {}.",
                            fmt_delay(delay)
                        ),
                    );

                    tokio::time::sleep(delay).await;
                    match self.respawn(&name, &run_id).await {
                        Ok(true) => continue,
                        Ok(false) => return,
                        Err(e) => {
                            tracing::error!(name = %name, error = %e, "restart failed");
                            self.outbox
                                .send_many(&chats, &format!("🛑 {name} could not be restarted: {e}"));
                            return;
                        }
                    }
                }
                RestartDecision::GiveUp(GiveUpReason::CleanExit) => {
                    tracing::info!(name = %name, run_id = %run_id.short(), "script finished");
                    self.mark(&name, &format!("finished ({exit})"));
                    self.outbox
                        .send_many(&chats, &format!("✅ {name} finished ({exit})."));
                    return;
                }
                RestartDecision::GiveUp(GiveUpReason::CircuitOpen { restarts, window }) => {
                    tracing::warn!(
                        name = %name,
                        run_id = %run_id.short(),
                        exit = %exit,
                        restarts,
                        "restart limit reached; giving up"
                    );
                    self.mark(&name, &format!("exited ({exit}); giving up"));
                    self.outbox.send_many(
                        &chats,
                        &format!(
                            "🛑 {name} exited ({exit}) after {restarts} restarts in {}s. Gave up; use /run {name} to start it again.",
                            window.as_secs()
                        ),
                    );
                    return;
                }
            }
        }
    }

    /// Re-launches a crashed run in place. Returns false if the entry was
    /// stopped or replaced while the restart delay ran.
    async fn respawn(&self, name: &ScriptName, run_id: &RunId) -> Result<bool, SupervisorError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let script_exists = tokio::fs::try_exists(self.script_path(name))
            .await
            .unwrap_or(false);

        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.get_mut(name) else {
            return Ok(false);
        };
        if entry.run_id != *run_id || entry.state != ProcessState::Restarting {
            return Ok(false);
        }

        let spawned = if script_exists {
            spawn_child(&self.cfg, name)
        } else {
            Err(SupervisorError::NotFound(name.clone()))
        };
        match spawned {
            Ok(sp) => {
                entry.child = Some(sp.child);
                entry.pid = sp.pid;
                entry.pgid = sp.pgid;
                entry.state = ProcessState::Running;
                entry.spawned_at = Instant::now();
                tracing::info!(name = %name, run_id = %run_id.short(), pid = ?sp.pid, "script restarted");
                Ok(true)
            }
            Err(e) => {
                if let Some(mut gone) = inner.remove(name)
                    && let Some(h) = gone.shipper.take()
                {
                    h.abort();
                }
                Err(e)
            }
        }
    }

    async fn ship_logs(self, name: ScriptName, run_id: RunId, mut offset: u64) {
        let path = self.log_path(&name);
        let max = self.cfg.log_ship_max_bytes;
        loop {
            tokio::time::sleep(self.cfg.log_ship_interval).await;

            let chat_id = {
                let inner = self.inner.lock().await;
                match inner.get(&name) {
                    Some(e) if e.run_id == run_id => e.chat_id,
                    _ => return,
                }
            };

            match logfile::read_since(&path, offset, max).await {
                Ok((chunk, next)) => {
                    offset = next;
                    let text = logfile::trailing_text(&chunk, max);
                    if !text.trim().is_empty() {
                        self.outbox.send(chat_id, format!("📄 {name}\n{text}"));
                    }
                }
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "log ship read failed");
                }
            }
        }
    }

    fn mark(&self, name: &ScriptName, message: &str) {
        if let Err(e) = logfile::append_marker(&self.log_path(name), message) {
            tracing::warn!(name = %name, error = %e, "failed to write log marker");
        }
    }
}

fn spawn_child(cfg: &SupervisorConfig, name: &ScriptName) -> Result<Spawned, SupervisorError> {
    let (program, extra): (&str, &[&str]) = match name.kind() {
        ScriptKind::Python => (cfg.python_bin.as_str(), &["-u"]),
        ScriptKind::Node => (cfg.node_bin.as_str(), &[]),
        ScriptKind::Shell => (cfg.shell_bin.as_str(), &[]),
        ScriptKind::Requirements => return Err(SupervisorError::NotRunnable(name.clone())),
    };

    let log_path = logfile::log_path(&cfg.logs_dir, name);
    let ctx = format!("open {}", log_path.display());
    let mut log = logfile::open_append(&log_path).map_err(SupervisorError::io(ctx.clone()))?;
    logfile::write_marker(&mut log, &format!("start: {program} {name}"))
        .map_err(SupervisorError::io(ctx.clone()))?;
    let log_offset = log.metadata().map(|m| m.len()).unwrap_or(0);
    let out = log.try_clone().map_err(SupervisorError::io(ctx))?;

    let mut cmd = Command::new(program);
    cmd.args(extra)
        .arg(cfg.uploads_dir.join(name.as_str()))
        .current_dir(&cfg.uploads_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(log))
        .kill_on_drop(false);

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // New session so the whole process tree can be signalled.
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        name: name.clone(),
        source,
    })?;
    let pid = child.id();
    Ok(Spawned {
        child,
        pid,
        pgid: pid.map(|p| p as i32),
        log_offset,
    })
}

#[cfg(unix)]
fn signal_group(child: &mut Child, pgid: Option<i32>, force: bool) {
    let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
    match pgid {
        Some(pgid) => unsafe {
            libc::kill(-pgid, sig);
        },
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pgid: Option<i32>, _force: bool) {
    let _ = child.start_kill();
}

/// SIGTERM the group, then SIGKILL once `grace` runs out.
async fn terminate(child: &mut Child, pgid: Option<i32>, grace: Duration) -> Option<ExitStatus> {
    signal_group(child, pgid, false);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return Some(status),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "wait after SIGTERM failed");
            return None;
        }
        Err(_) => {}
    }

    tracing::warn!(pgid = ?pgid, "stop timed out; sending SIGKILL");
    signal_group(child, pgid, true);
    child.wait().await.ok()
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}

fn fmt_delay(d: Duration) -> String {
    if d.as_millis() < 10_000 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}s", d.as_secs())
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
