//! Lifecycle of the external client process.
//!
//! The launcher (optionally a terminal emulator) is spawned first; the real
//! client is then discovered by name in the process table. Its pid is
//! persisted to a plain-text pid file so the next run can find it again.

use crate::config::SupervisorConfig;
use crate::process_table::{lowest_match, ProcessTable};
use async_trait::async_trait;
use std::{fs, io, path::Path, process::Stdio};
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    sync::Mutex,
    time::Instant,
};
use tracing::{debug, info, warn};

/// Liveness polls after SIGKILL before giving up on a pid.
const KILL_POLLS: u32 = 10;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("client process not found after {attempts} discovery attempts")]
    StartTimeout { attempts: u32 },
    #[error("failed to terminate pid {pid}: {reason}")]
    KillFailure { pid: u32, reason: String },
    #[error("failed to write pid file {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "process_spawn",
            Self::StartTimeout { .. } => "process_start_timeout",
            Self::KillFailure { .. } => "process_kill_failure",
            Self::Persist { .. } => "process_persist",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedProcess {
    pub launch_command: Vec<String>,
    pub pid: Option<u32>,
    pub host_pid: Option<u32>,
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Unmanaged,
    Started { pid: u32, host_pid: Option<u32> },
}

/// What the session needs from the client supervisor.
#[async_trait]
pub trait ClientProcess: Send + Sync {
    fn is_managed(&self) -> bool;
    async fn restart(&self) -> Result<StartOutcome, SupervisorError>;
}

struct SupervisorState {
    record: ManagedProcess,
    host: Option<Child>,
}

pub struct ProcessSupervisor<T> {
    config: SupervisorConfig,
    table: T,
    state: Mutex<SupervisorState>,
}

impl<T: ProcessTable> ProcessSupervisor<T> {
    pub fn new(config: SupervisorConfig, table: T) -> Self {
        let pid = read_pid_file(&config.pid_file);
        let alive = pid.is_some_and(signals::is_alive);
        if let Some(pid) = pid {
            info!(event = "supervisor_pid_loaded", pid, alive);
        }
        let record = ManagedProcess {
            launch_command: config.launch_command.clone(),
            pid,
            host_pid: None,
            alive,
        };
        Self {
            config,
            table,
            state: Mutex::new(SupervisorState { record, host: None }),
        }
    }

    pub fn is_managed(&self) -> bool {
        self.config.is_managed()
    }

    pub async fn record(&self) -> ManagedProcess {
        self.state.lock().await.record.clone()
    }

    /// Scans the process table. Idempotent, never fails: scan errors are
    /// logged and reported as "nothing running".
    pub fn current_alive_id(&self) -> Option<u32> {
        self.scan(None)
    }

    /// Records an already running client (found by scan) as managed.
    pub async fn adopt_running(&self) -> Option<u32> {
        let pid = self.current_alive_id()?;
        let mut state = self.state.lock().await;
        if state.record.pid != Some(pid) {
            info!(event = "supervisor_adopted", pid);
            state.record.pid = Some(pid);
            self.persist(pid);
        }
        state.record.alive = true;
        Some(pid)
    }

    pub async fn start(&self) -> Result<StartOutcome, SupervisorError> {
        if !self.is_managed() {
            debug!(event = "supervisor_unmanaged");
            return Ok(StartOutcome::Unmanaged);
        }
        let mut state = self.state.lock().await;
        self.start_locked(&mut state).await
    }

    /// Safe to call when nothing is running. The pid file is cleared even
    /// when termination fails.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await
    }

    pub async fn restart(&self) -> Result<StartOutcome, SupervisorError> {
        let mut state = self.state.lock().await;
        if let Err(err) = self.stop_locked(&mut state).await {
            warn!(event = "supervisor_stop_failed", kind = err.kind(), error = %err);
        }
        if !self.is_managed() {
            return Ok(StartOutcome::Unmanaged);
        }
        self.start_locked(&mut state).await
    }

    async fn start_locked(&self, state: &mut SupervisorState) -> Result<StartOutcome, SupervisorError> {
        if let Some(previous) = state.record.pid.filter(|pid| signals::is_alive(*pid)) {
            info!(event = "supervisor_replacing", pid = previous);
            if let Err(err) = self.stop_locked(state).await {
                warn!(event = "supervisor_stop_failed", kind = err.kind(), error = %err);
            }
        }

        let argv = self.config.launch_argv();
        let Some((program, args)) = argv.split_first() else {
            return Ok(StartOutcome::Unmanaged);
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(workdir) = &self.config.workdir {
            command.current_dir(workdir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let host_pid = child.id();
        state.host = Some(child);
        state.record.host_pid = host_pid;
        state.record.alive = false;
        info!(event = "supervisor_spawned", program = %program, host_pid = ?host_pid);

        // Without a terminal the spawned process is the client itself.
        let exclude = if self.config.terminal_command.is_empty() {
            None
        } else {
            host_pid
        };
        let attempts = self.config.discovery_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(pid) = self.scan(exclude) {
                state.record.pid = Some(pid);
                state.record.alive = true;
                self.persist(pid);
                info!(event = "supervisor_started", pid, host_pid = ?host_pid, attempt);
                return Ok(StartOutcome::Started { pid, host_pid });
            }
            debug!(event = "supervisor_discovery_pending", attempt, attempts);
            tokio::time::sleep(self.config.discovery_interval).await;
        }
        warn!(event = "supervisor_start_timeout", attempts, host_pid = ?host_pid);
        Err(SupervisorError::StartTimeout { attempts })
    }

    async fn stop_locked(&self, state: &mut SupervisorState) -> Result<(), SupervisorError> {
        let target = match state.record.pid {
            Some(pid) => Some(pid),
            None if self.is_managed() => {
                let found = self.scan(state.record.host_pid);
                if let Some(pid) = found {
                    info!(event = "supervisor_adopted_for_stop", pid);
                }
                found
            }
            None => None,
        };
        let host_pid = state.record.host_pid;
        let mut failure = None;

        if let Some(pid) = target {
            let child = state.host.as_mut().filter(|child| child.id() == Some(pid));
            if let Err(err) = self.terminate(pid, child).await {
                warn!(event = "supervisor_kill_failed", pid, error = %err);
                failure = Some(err);
            }
        }
        if let Some(host) = host_pid.filter(|host| Some(*host) != target) {
            if let Err(err) = self.terminate(host, state.host.as_mut()).await {
                warn!(event = "supervisor_kill_failed", pid = host, error = %err);
                failure.get_or_insert(err);
            }
        }
        if let Some(mut child) = state.host.take() {
            if let Ok(Some(status)) = child.try_wait() {
                debug!(event = "supervisor_host_reaped", status = %status);
            }
        }

        state.record.pid = None;
        state.record.host_pid = None;
        state.record.alive = false;
        clear_pid_file(&self.config.pid_file);
        if target.is_some() || host_pid.is_some() {
            info!(event = "supervisor_stopped", pid = ?target, host_pid = ?host_pid);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// SIGTERM, poll until `stop_grace` runs out, then SIGKILL.
    async fn terminate(&self, pid: u32, mut child: Option<&mut Child>) -> Result<(), SupervisorError> {
        if pid <= 1 {
            return Err(SupervisorError::KillFailure {
                pid,
                reason: "refusing to signal a protected pid".to_string(),
            });
        }
        let delivered = signals::send_terminate(pid)
            .map_err(|reason| SupervisorError::KillFailure { pid, reason })?;
        if !delivered {
            debug!(event = "supervisor_already_exited", pid);
            return Ok(());
        }

        let deadline = Instant::now() + self.config.stop_grace;
        loop {
            if !process_alive(pid, child.as_deref_mut()) {
                debug!(event = "supervisor_terminated", pid);
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.stop_poll).await;
        }

        warn!(event = "supervisor_escalating", pid, grace_ms = self.config.stop_grace.as_millis() as u64);
        signals::send_kill(pid).map_err(|reason| SupervisorError::KillFailure { pid, reason })?;
        for _ in 0..KILL_POLLS {
            tokio::time::sleep(self.config.stop_poll).await;
            if !process_alive(pid, child.as_deref_mut()) {
                debug!(event = "supervisor_killed", pid);
                return Ok(());
            }
        }
        Err(SupervisorError::KillFailure {
            pid,
            reason: "still alive after SIGKILL".to_string(),
        })
    }

    fn scan(&self, exclude: Option<u32>) -> Option<u32> {
        match self.table.snapshot() {
            Ok(entries) => lowest_match(&entries, &self.config.process_names, exclude),
            Err(err) => {
                warn!(event = "supervisor_scan_failed", error = %err);
                None
            }
        }
    }

    fn persist(&self, pid: u32) {
        if let Err(err) = write_pid_file(&self.config.pid_file, pid) {
            warn!(event = "supervisor_persist_failed", kind = err.kind(), error = %err);
        }
    }
}

#[async_trait]
impl<T: ProcessTable> ClientProcess for ProcessSupervisor<T> {
    fn is_managed(&self) -> bool {
        ProcessSupervisor::is_managed(self)
    }

    async fn restart(&self) -> Result<StartOutcome, SupervisorError> {
        ProcessSupervisor::restart(self).await
    }
}

/// Direct children must be reaped before they stop looking alive.
fn process_alive(pid: u32, child: Option<&mut Child>) -> bool {
    if let Some(child) = child {
        match child.try_wait() {
            Ok(Some(_)) => return false,
            Ok(None) => return true,
            Err(_) => {}
        }
    }
    signals::is_alive(pid)
}

fn read_pid_file(path: &Path) -> Option<u32> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

fn write_pid_file(path: &Path, pid: u32) -> Result<(), SupervisorError> {
    let persist_err = |source| SupervisorError::Persist {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(persist_err)?;
    }
    fs::write(path, pid.to_string()).map_err(persist_err)
}

fn clear_pid_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(event = "supervisor_pid_clear_failed", path = %path.display(), error = %err),
    }
}

#[cfg(unix)]
mod signals {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    pub fn is_alive(pid: u32) -> bool {
        let Some(target) = to_pid(pid) else {
            return false;
        };
        // EPERM: exists but belongs to someone else.
        matches!(kill(target, None), Ok(()) | Err(Errno::EPERM))
    }

    pub fn send_terminate(pid: u32) -> Result<bool, String> {
        send(pid, Signal::SIGTERM)
    }

    pub fn send_kill(pid: u32) -> Result<bool, String> {
        send(pid, Signal::SIGKILL)
    }

    /// `Ok(false)` when the process is already gone.
    fn send(pid: u32, signal: Signal) -> Result<bool, String> {
        let Some(target) = to_pid(pid) else {
            return Err(format!("pid {pid} out of range"));
        };
        match kill(target, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(err) => Err(format!("{signal:?}: {err}")),
        }
    }

    fn to_pid(pid: u32) -> Option<Pid> {
        i32::try_from(pid).ok().map(Pid::from_raw)
    }
}

#[cfg(not(unix))]
mod signals {
    pub fn is_alive(_pid: u32) -> bool {
        false
    }

    pub fn send_terminate(_pid: u32) -> Result<bool, String> {
        Err("process signals are not supported on this platform".to_string())
    }

    pub fn send_kill(_pid: u32) -> Result<bool, String> {
        Err("process signals are not supported on this platform".to_string())
    }
}
