//! Agent process discovery.
//!
//! Finds the processes that make up "the agent" (the launcher script plus
//! the interpreter workers it spawns) regardless of who started them, and
//! caches the result for a short TTL so that frequent status polling does
//! not hammer the process table.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::{AgentConfig, DiscoveryConfig};
use crate::process_table::{basename, OsProcess, ProcessEnumerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Main,
    SubWorker,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Managed,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent_pid: u32,
    pub process_group_id: u32,
    pub command_name: String,
    pub full_command_line: String,
    pub elapsed_secs: u64,
    pub role: Role,
    pub origin: Origin,
}

/// Keyword-based agent process predicates.
#[derive(Debug, Clone)]
pub struct ProcessMatcher {
    launcher: String,
    interpreters: Vec<String>,
    markers: Vec<String>,
    shells: Vec<String>,
}

impl ProcessMatcher {
    pub fn new(config: &DiscoveryConfig, agent: &AgentConfig) -> Self {
        Self {
            launcher: config.launcher_name(agent),
            interpreters: config.worker_interpreters.clone(),
            markers: config.worker_markers.clone(),
            shells: config.shells.clone(),
        }
    }

    /// argv[0] is the launcher, or a shell running the launcher.
    pub fn matches_launcher(&self, proc: &OsProcess) -> bool {
        if self.launcher.is_empty() {
            return false;
        }
        let argv = proc.argv();
        match argv.as_slice() {
            [first, ..] if basename(first) == self.launcher => true,
            [first, second, ..] if self.is_shell(first) => basename(second) == self.launcher,
            _ => false,
        }
    }

    /// argv[0] is a known worker interpreter.
    pub fn is_interpreter(&self, proc: &OsProcess) -> bool {
        let name = proc.command_name();
        self.interpreters.iter().any(|i| i == name)
    }

    /// Interpreter invocation carrying one of the agent markers.
    pub fn matches_worker(&self, proc: &OsProcess) -> bool {
        if !self.is_interpreter(proc) {
            return false;
        }
        proc.argv()
            .iter()
            .skip(1)
            .any(|arg| self.markers.iter().any(|m| arg == m || arg.ends_with(m.as_str())))
    }

    /// Predicate for descendants of an already-matched agent process. The
    /// marker requirement is dropped: sitting under the agent is evidence enough.
    pub fn is_agent_descendant(&self, proc: &OsProcess) -> bool {
        self.matches_launcher(proc) || self.is_interpreter(proc)
    }

    pub fn classify(&self, proc: &OsProcess) -> Role {
        if self.matches_launcher(proc) && !self.is_interpreter(proc) {
            Role::Main
        } else if self.is_interpreter(proc) {
            Role::SubWorker
        } else {
            Role::Unknown
        }
    }

    fn is_shell(&self, token: &str) -> bool {
        let name = basename(token);
        self.shells.iter().any(|s| s == name)
    }
}

/// The single process-table snapshot shared by status reads and control decisions.
#[derive(Debug)]
pub struct ProcessSnapshotCache {
    records: Vec<ProcessRecord>,
    captured_at: Option<Instant>,
    ttl: Duration,
}

impl ProcessSnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Vec::new(),
            captured_at: None,
            ttl,
        }
    }

    fn fresh(&self, now: Instant) -> Option<&[ProcessRecord]> {
        let at = self.captured_at?;
        (now.duration_since(at) < self.ttl).then_some(self.records.as_slice())
    }

    fn store(&mut self, records: Vec<ProcessRecord>, now: Instant) {
        self.records = records;
        self.captured_at = Some(now);
    }

    fn invalidate(&mut self) {
        self.captured_at = None;
    }
}

pub struct ProcessDiscovery {
    enumerator: Arc<dyn ProcessEnumerator>,
    matcher: ProcessMatcher,
    max_depth: usize,
    cache: Mutex<ProcessSnapshotCache>,
    /// 0 when nothing is managed.
    managed_pid: AtomicU32,
    self_pid: u32,
}

impl ProcessDiscovery {
    pub fn new(
        enumerator: Arc<dyn ProcessEnumerator>,
        config: &DiscoveryConfig,
        agent: &AgentConfig,
    ) -> Self {
        Self {
            enumerator,
            matcher: ProcessMatcher::new(config, agent),
            max_depth: config.max_depth,
            cache: Mutex::new(ProcessSnapshotCache::new(config.cache_ttl())),
            managed_pid: AtomicU32::new(0),
            self_pid: std::process::id(),
        }
    }

    /// Agent processes, served from cache unless stale or `force_refresh`.
    ///
    /// On enumeration failure the last good snapshot is returned.
    pub async fn enumerate(&self, force_refresh: bool) -> Vec<ProcessRecord> {
        if !force_refresh {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(records) = cache.fresh(Instant::now()) {
                return self.stamp_origin(records.to_vec());
            }
        }

        match self.enumerator.list().await {
            Ok(table) => {
                let records = self.classify_table(&table);
                tracing::debug!(count = records.len(), "process table refreshed");
                self.cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .store(records.clone(), Instant::now());
                self.stamp_origin(records)
            }
            Err(e) => {
                tracing::warn!(error = %e, "process enumeration failed, serving last snapshot");
                let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                self.stamp_origin(cache.records.clone())
            }
        }
    }

    /// True if `pid` is alive and still looks like an agent process.
    ///
    /// Bare interpreters without a marker only pass when the last snapshot
    /// found this exact command line under an agent.
    pub async fn verify(&self, pid: u32) -> bool {
        if !self.enumerator.is_alive(pid) {
            return false;
        }
        match self.enumerator.describe(pid).await {
            Ok(Some(proc)) => {
                self.matcher.matches_launcher(&proc)
                    || self.matcher.matches_worker(&proc)
                    || (self.matcher.is_agent_descendant(&proc) && self.in_snapshot(&proc))
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to describe process");
                false
            }
        }
    }

    pub fn invalidate(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .invalidate();
    }

    pub fn set_managed_pid(&self, pid: Option<u32>) {
        self.managed_pid.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    /// Clear the managed pid only if it still equals `pid`.
    pub fn clear_managed_pid(&self, pid: u32) {
        let _ = self
            .managed_pid
            .compare_exchange(pid, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn managed_pid(&self) -> Option<u32> {
        match self.managed_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn classify_table(&self, table: &[OsProcess]) -> Vec<ProcessRecord> {
        let by_pid: HashMap<u32, &OsProcess> = table.iter().map(|p| (p.pid, p)).collect();
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for p in table {
            if p.ppid != p.pid {
                children.entry(p.ppid).or_default().push(p.pid);
            }
        }

        let candidates: Vec<&OsProcess> = table
            .iter()
            .filter(|p| p.pid != self.self_pid)
            .filter(|p| self.matcher.matches_launcher(p) || self.matcher.matches_worker(p))
            .collect();

        let mut found: BTreeMap<u32, &OsProcess> = BTreeMap::new();
        for candidate in &candidates {
            found.insert(candidate.pid, candidate);
            for pid in descendants(candidate.pid, &children, self.max_depth) {
                if pid == self.self_pid {
                    continue;
                }
                if let Some(p) = by_pid.get(&pid) {
                    if self.matcher.is_agent_descendant(p) {
                        found.insert(pid, p);
                    }
                }
            }
        }

        found
            .into_values()
            .filter_map(|p| {
                let role = self.matcher.classify(p);
                if role == Role::Unknown {
                    return None;
                }
                Some(ProcessRecord {
                    pid: p.pid,
                    parent_pid: p.ppid,
                    process_group_id: p.pgid,
                    command_name: p.command_name().to_string(),
                    full_command_line: p.command_line.clone(),
                    elapsed_secs: p.elapsed_secs,
                    role,
                    origin: Origin::External,
                })
            })
            .collect()
    }

    fn in_snapshot(&self, proc: &OsProcess) -> bool {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .records
            .iter()
            .any(|r| r.pid == proc.pid && r.full_command_line == proc.command_line)
    }

    fn stamp_origin(&self, mut records: Vec<ProcessRecord>) -> Vec<ProcessRecord> {
        let managed = self.managed_pid();
        for r in &mut records {
            r.origin = match managed {
                Some(m) if r.pid == m || r.process_group_id == m => Origin::Managed,
                _ => Origin::External,
            };
        }
        records
    }
}

/// Breadth-first descendants of `root`, at most `max_depth` levels down.
fn descendants(root: u32, children: &HashMap<u32, Vec<u32>>, max_depth: usize) -> Vec<u32> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([(root, 0usize)]);
    while let Some((pid, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !out.contains(&kid) {
                    out.push(kid);
                    queue.push_back((kid, depth + 1));
                }
            }
        }
    }
    out
}
