//! Start and stop of the agent, whether we launched it or found it running.
//!
//! At most one managed process exists at a time. It is spawned as the leader
//! of its own process group so that stop can reach every descendant with one
//! signal.
use crate::config::{AgentConfig, LifecycleConfig};
use crate::discovery::{ProcessDiscovery, ProcessRecord, Role};
use crate::signals::{self, SignalTarget, Signaller};
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;
const OUTPUT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Per-start launcher options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartOptions {
    pub single_iteration: bool,
    pub max_iterations: Option<u32>,
    pub auto_commit: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            single_iteration: false,
            max_iterations: None,
            auto_commit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of raw output from the managed process, newline included.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Started {
        pid: u32,
    },
    Exited {
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

#[derive(Debug)]
pub enum LifecycleError {
    /// `stop()` with nothing managed.
    NotRunning,
    /// `stop(pid)` for a pid that is not an agent process.
    ProcessNotFound { pid: u32 },
    /// `start()` while an agent is already up.
    AlreadyRunning { pid: u32, managed: bool },
    Spawn {
        command: PathBuf,
        source: std::io::Error,
    },
    Signal {
        target: SignalTarget,
        source: nix::Error,
    },
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::NotRunning => write!(f, "no managed agent is running"),
            LifecycleError::ProcessNotFound { pid } => {
                write!(f, "pid {} is not a running agent process", pid)
            }
            LifecycleError::AlreadyRunning { pid, managed: true } => {
                write!(f, "agent already running (managed, pid {})", pid)
            }
            LifecycleError::AlreadyRunning { pid, managed: false } => {
                write!(f, "agent already running outside this server (pid {})", pid)
            }
            LifecycleError::Spawn { command, source } => {
                write!(f, "failed to spawn {}: {}", command.display(), source)
            }
            LifecycleError::Signal { target, source } => {
                write!(f, "failed to signal {}: {}", target, source)
            }
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LifecycleError::Spawn { source, .. } => Some(source),
            LifecycleError::Signal { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Launcher arguments: configured args first, then the per-start flags.
fn build_args(agent: &AgentConfig, options: &StartOptions) -> Vec<String> {
    let mut args = agent.args.clone();
    if options.single_iteration {
        args.push("--once".to_string());
    }
    if let Some(n) = options.max_iterations {
        args.push("--max-iterations".to_string());
        args.push(n.to_string());
    }
    if !options.auto_commit {
        args.push("--no-commit".to_string());
    }
    args
}

#[derive(Debug, Clone, Copy)]
struct ManagedProcess {
    pid: u32,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ControllerState {
    phase: Phase,
    managed: Option<ManagedProcess>,
    /// Stopped pids (and their groups) inside the kill grace period.
    draining: HashSet<u32>,
}

fn lock(state: &Mutex<ControllerState>) -> MutexGuard<'_, ControllerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Controller {
    agent: AgentConfig,
    kill_grace: Duration,
    discovery: Arc<ProcessDiscovery>,
    signaller: Arc<dyn Signaller>,
    state: Arc<Mutex<ControllerState>>,
    /// Serialises start and stop.
    ops: tokio::sync::Mutex<()>,
    events: broadcast::Sender<LifecycleEvent>,
    output: broadcast::Sender<OutputLine>,
}

impl Controller {
    pub fn new(
        agent: &AgentConfig,
        config: &LifecycleConfig,
        discovery: Arc<ProcessDiscovery>,
        signaller: Arc<dyn Signaller>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self {
            agent: agent.clone(),
            kill_grace: config.kill_grace(),
            discovery,
            signaller,
            state: Arc::new(Mutex::new(ControllerState {
                phase: Phase::Stopped,
                managed: None,
                draining: HashSet::new(),
            })),
            ops: tokio::sync::Mutex::new(()),
            events,
            output,
        }
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    pub fn managed_pid(&self) -> Option<u32> {
        lock(&self.state).managed.map(|m| m.pid)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.output.subscribe()
    }

    /// Launch the agent and return its pid.
    pub async fn start(&self, options: &StartOptions) -> Result<u32, LifecycleError> {
        let _op = self.ops.lock().await;

        {
            let mut state = lock(&self.state);
            if let Some(managed) = state.managed {
                return Err(LifecycleError::AlreadyRunning {
                    pid: managed.pid,
                    managed: true,
                });
            }
            state.phase = Phase::Starting;
        }

        let records = self.discovery.enumerate(true).await;
        let draining = lock(&self.state).draining.clone();
        if let Some(pid) = conflicting_pid(&records, &draining) {
            lock(&self.state).phase = Phase::Stopped;
            tracing::info!(pid, "refusing to start, agent already running");
            return Err(LifecycleError::AlreadyRunning {
                pid,
                managed: false,
            });
        }

        let args = build_args(&self.agent, options);
        tracing::info!(
            command = %self.agent.script.display(),
            args = ?args,
            "spawning agent"
        );
        let spawned = Command::new(&self.agent.script)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                lock(&self.state).phase = Phase::Stopped;
                return Err(LifecycleError::Spawn {
                    command: self.agent.script.clone(),
                    source,
                });
            }
        };
        let Some(pid) = child.id() else {
            lock(&self.state).phase = Phase::Stopped;
            return Err(LifecycleError::Spawn {
                command: self.agent.script.clone(),
                source: std::io::Error::other("process exited before its pid was known"),
            });
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_lines(stdout, pid, OutputStream::Stdout, self.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_lines(stderr, pid, OutputStream::Stderr, self.output.clone()));
        }

        {
            let mut state = lock(&self.state);
            state.managed = Some(ManagedProcess {
                pid,
                started_at: Utc::now(),
            });
            state.phase = Phase::Running;
        }
        self.discovery.set_managed_pid(Some(pid));
        self.discovery.invalidate();
        tracing::info!(pid, "agent started");
        let _ = self.events.send(LifecycleEvent::Started { pid });

        tokio::spawn(wait_for_exit(
            child,
            pid,
            Arc::clone(&self.state),
            Arc::clone(&self.discovery),
            self.events.clone(),
        ));
        Ok(pid)
    }

    /// Stop the managed agent (`None`) or any discovered agent process.
    ///
    /// Returns the pid that was signalled.
    pub async fn stop(&self, pid: Option<u32>) -> Result<u32, LifecycleError> {
        let _op = self.ops.lock().await;
        match pid {
            None => self.stop_managed(),
            Some(pid) => {
                let records = self.discovery.enumerate(true).await;
                let Some(record) = records.iter().find(|r| r.pid == pid) else {
                    return Err(LifecycleError::ProcessNotFound { pid });
                };
                if self.managed_pid() == Some(pid) {
                    return self.stop_managed();
                }
                // The pid may have been reused since the snapshot was taken.
                if !self.discovery.verify(pid).await {
                    return Err(LifecycleError::ProcessNotFound { pid });
                }
                self.stop_external(record, &records)
            }
        }
    }

    fn stop_managed(&self) -> Result<u32, LifecycleError> {
        let managed = {
            let mut state = lock(&self.state);
            let Some(managed) = state.managed.take() else {
                return Err(LifecycleError::NotRunning);
            };
            state.phase = Phase::Stopping;
            state.draining.insert(managed.pid);
            managed
        };
        let pid = managed.pid;
        self.discovery.clear_managed_pid(pid);

        let target = SignalTarget::Group(pid);
        let result = self.terminate(&[target]);
        {
            let mut state = lock(&self.state);
            state.phase = Phase::Stopped;
            if result.is_err() {
                // No kill is scheduled, so nothing would ever drain it.
                state.draining.remove(&pid);
            }
        }
        self.discovery.invalidate();
        result?;

        let uptime_secs = (Utc::now() - managed.started_at).num_seconds();
        tracing::info!(pid, uptime_secs, "agent stop requested");
        self.schedule_kill(pid, vec![target]);
        Ok(pid)
    }

    fn stop_external(
        &self,
        record: &ProcessRecord,
        records: &[ProcessRecord],
    ) -> Result<u32, LifecycleError> {
        let pid = record.pid;
        let pgid = record.process_group_id;
        let targets = if pgid > 1 && pgid != signals::own_process_group() {
            vec![SignalTarget::Group(pgid)]
        } else {
            std::iter::once(pid)
                .chain(descendants_of(pid, records))
                .map(SignalTarget::Process)
                .collect()
        };

        lock(&self.state).draining.insert(pid);
        let result = self.terminate(&targets);
        self.discovery.invalidate();
        if let Err(e) = result {
            lock(&self.state).draining.remove(&pid);
            return Err(e);
        }

        tracing::info!(pid, pgid, "external agent stop requested");
        self.schedule_kill(pid, targets);
        Ok(pid)
    }

    /// SIGTERM each target. A target that is already gone is not an error.
    fn terminate(&self, targets: &[SignalTarget]) -> Result<(), LifecycleError> {
        for &target in targets {
            match self.signaller.signal(target, Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(source) => return Err(LifecycleError::Signal { target, source }),
            }
        }
        Ok(())
    }

    fn schedule_kill(&self, pid: u32, targets: Vec<SignalTarget>) {
        let signaller = Arc::clone(&self.signaller);
        let state = Arc::clone(&self.state);
        let discovery = Arc::clone(&self.discovery);
        let grace = self.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for target in targets {
                if !signaller.is_alive(target) {
                    continue;
                }
                tracing::warn!(%target, grace_secs = grace.as_secs(), "still alive after SIGTERM, sending SIGKILL");
                if let Err(e) = signaller.signal(target, Signal::SIGKILL) {
                    tracing::warn!(%target, error = %e, "SIGKILL failed");
                }
            }
            lock(&state).draining.remove(&pid);
            discovery.invalidate();
        });
    }
}

/// The pid to report when discovery finds an agent that is not draining.
fn conflicting_pid(records: &[ProcessRecord], draining: &HashSet<u32>) -> Option<u32> {
    let live: Vec<&ProcessRecord> = records
        .iter()
        .filter(|r| !draining.contains(&r.pid) && !draining.contains(&r.process_group_id))
        .collect();
    live.iter()
        .find(|r| r.role == Role::Main)
        .or_else(|| live.first())
        .map(|r| r.pid)
}

fn descendants_of(root: u32, records: &[ProcessRecord]) -> Vec<u32> {
    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for r in records.iter().filter(|r| r.parent_pid == parent) {
            if r.pid != root && !found.contains(&r.pid) {
                found.push(r.pid);
                frontier.push(r.pid);
            }
        }
    }
    found
}

/// Forward output line by line. Invalid UTF-8 is replaced, never fatal.
async fn relay_lines<R>(reader: R, pid: u32, stream: OutputStream, tx: broadcast::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).into_owned();
                // No receivers is fine; output is only relayed while someone listens.
                let _ = tx.send(OutputLine { stream, text });
            }
            Err(e) => {
                tracing::debug!(pid, ?stream, error = %e, "output relay ended");
                break;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    pid: u32,
    state: Arc<Mutex<ControllerState>>,
    discovery: Arc<ProcessDiscovery>,
    events: broadcast::Sender<LifecycleEvent>,
) {
    let (code, signal) = match child.wait().await {
        Ok(status) => (status.code(), status.signal()),
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to wait for agent");
            (None, None)
        }
    };
    tracing::info!(pid, exit_code = ?code, signal = ?signal, "agent exited");

    {
        let mut state = lock(&state);
        if state.managed.map(|m| m.pid) == Some(pid) {
            state.managed = None;
            state.phase = Phase::Stopped;
        }
    }
    discovery.clear_managed_pid(pid);
    discovery.invalidate();
    let _ = events.send(LifecycleEvent::Exited { pid, code, signal });
}
