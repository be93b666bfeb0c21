//! Signal delivery to agent processes, and shutdown signals for the server.
//!
//! Agent processes are signalled by process group where possible so that
//! every descendant sees the signal at once.
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgrp, Pid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalTarget {
    /// Every process in the group.
    Group(u32),
    /// A single process.
    Process(u32),
}

impl std::fmt::Display for SignalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalTarget::Group(pgid) => write!(f, "process group {pgid}"),
            SignalTarget::Process(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// Delivers signals to agent processes.
pub trait Signaller: Send + Sync {
    fn signal(&self, target: SignalTarget, signal: Signal) -> nix::Result<()>;

    /// Signal-0 probe of the target.
    fn is_alive(&self, target: SignalTarget) -> bool;
}

/// Real signal delivery via kill(2) / killpg(2).
#[derive(Debug, Default, Clone)]
pub struct OsSignaller;

impl Signaller for OsSignaller {
    fn signal(&self, target: SignalTarget, signal: Signal) -> nix::Result<()> {
        send(target, Some(signal))
    }

    fn is_alive(&self, target: SignalTarget) -> bool {
        matches!(send(target, None), Ok(()) | Err(nix::errno::Errno::EPERM))
    }
}

/// Send `signal` to `target`; `None` only probes for existence.
pub fn send(target: SignalTarget, signal: Option<Signal>) -> nix::Result<()> {
    let raw = match target {
        SignalTarget::Group(id) | SignalTarget::Process(id) => {
            i32::try_from(id).map_err(|_| nix::errno::Errno::EINVAL)?
        }
    };
    // 0 and 1 would address our own group or init.
    if raw <= 1 {
        return Err(nix::errno::Errno::EINVAL);
    }
    match target {
        SignalTarget::Group(_) => match signal {
            Some(sig) => killpg(Pid::from_raw(raw), sig),
            None => kill(Pid::from_raw(-raw), None),
        },
        SignalTarget::Process(_) => kill(Pid::from_raw(raw), signal),
    }
}

/// Process group of this server; never signalled as a whole.
pub fn own_process_group() -> u32 {
    getpgrp().as_raw() as u32
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = ctrl_c.await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_reserved_targets() {
        assert_eq!(
            send(SignalTarget::Group(0), Some(Signal::SIGTERM)),
            Err(nix::errno::Errno::EINVAL)
        );
        assert_eq!(
            send(SignalTarget::Process(1), Some(Signal::SIGTERM)),
            Err(nix::errno::Errno::EINVAL)
        );
    }

    #[test]
    fn test_missing_pid_reports_esrch() {
        assert_eq!(
            send(SignalTarget::Process(4_194_304 + 7), Some(Signal::SIGTERM)),
            Err(nix::errno::Errno::ESRCH)
        );
    }

    #[test]
    fn test_target_display() {
        assert_eq!(SignalTarget::Group(12).to_string(), "process group 12");
        assert_eq!(SignalTarget::Process(7).to_string(), "pid 7");
    }

    #[tokio::test]
    async fn test_group_signal_reaches_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let signaller = OsSignaller;
        assert!(signaller.is_alive(SignalTarget::Group(pid)));
        signaller
            .signal(SignalTarget::Group(pid), Signal::SIGKILL)
            .unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert!(!signaller.is_alive(SignalTarget::Process(pid)));
    }
}
