/// Status and health reports served over HTTP and pushed as `status` events.
use crate::discovery::{Origin, ProcessRecord, Role};
use crate::lifecycle::Phase;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of the agent.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// True when any agent process is alive, managed or not.
    pub running: bool,
    pub phase: Phase,
    pub managed_pid: Option<u32>,
    /// Main agent process started outside this server, if any.
    pub external_pid: Option<u32>,
    pub main_processes: Vec<ProcessRecord>,
    pub sub_workers: Vec<ProcessRecord>,
    pub captured_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(records: Vec<ProcessRecord>, phase: Phase, managed_pid: Option<u32>) -> Self {
        let (main_processes, sub_workers): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.role == Role::Main);
        let external_pid = main_processes
            .iter()
            .chain(sub_workers.iter())
            .find(|r| r.origin == Origin::External)
            .map(|r| r.pid);
        let running =
            managed_pid.is_some() || !main_processes.is_empty() || !sub_workers.is_empty();
        Self {
            running,
            phase,
            managed_pid,
            external_pid,
            main_processes,
            sub_workers,
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub main_processes: usize,
    pub sub_workers: usize,
    pub active_log_files: usize,
    pub subscriptions: usize,
}
