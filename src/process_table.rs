//! Raw OS process enumeration.
//!
//! `ProcessEnumerator` is the seam between discovery and the host. The
//! default adapter shells out to `ps`, which behaves the same on Linux and
//! macOS for the columns used here. Tests substitute a scripted table.

use std::future::Future;
use std::pin::Pin;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::Command;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One row of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsProcess {
    pub pid: u32,
    pub ppid: u32,
    pub pgid: u32,
    pub elapsed_secs: u64,
    pub command_line: String,
}

impl OsProcess {
    /// Whitespace-split argv. Quoting is lost, which is fine for matching.
    pub fn argv(&self) -> Vec<&str> {
        self.command_line.split_whitespace().collect()
    }

    /// Basename of argv[0].
    pub fn command_name(&self) -> &str {
        self.command_line
            .split_whitespace()
            .next()
            .map(basename)
            .unwrap_or("")
    }
}

pub fn basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

/// Errors from enumerating the process table.
#[derive(Debug)]
pub enum EnumerationError {
    /// The listing tool could not be spawned.
    Spawn { tool: String, source: std::io::Error },
    /// The listing tool exited unsuccessfully.
    Failed { tool: String, status: Option<i32>, stderr: String },
}

impl std::fmt::Display for EnumerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnumerationError::Spawn { tool, source } => {
                write!(f, "failed to run {tool}: {source}")
            }
            EnumerationError::Failed {
                tool,
                status,
                stderr,
            } => {
                write!(f, "{tool} exited with {status:?}: {}", stderr.trim())
            }
        }
    }
}

impl std::error::Error for EnumerationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EnumerationError::Spawn { source, .. } => Some(source),
            EnumerationError::Failed { .. } => None,
        }
    }
}

/// Source of process table snapshots.
pub trait ProcessEnumerator: Send + Sync {
    /// Every process visible to this user.
    fn list(&self) -> BoxFuture<'_, Result<Vec<OsProcess>, EnumerationError>>;

    /// A single process, or `None` if it does not exist.
    fn describe(&self, pid: u32) -> BoxFuture<'_, Result<Option<OsProcess>, EnumerationError>>;

    /// Signal-0 liveness probe.
    fn is_alive(&self, pid: u32) -> bool;
}

const PS_COLUMNS: &str = "pid=,ppid=,pgid=,etime=,args=";

/// `ps`-backed enumerator.
#[derive(Debug, Default, Clone)]
pub struct PsEnumerator;

impl PsEnumerator {
    async fn run_ps(args: &[&str]) -> Result<std::process::Output, EnumerationError> {
        Command::new("ps")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EnumerationError::Spawn {
                tool: "ps".to_string(),
                source: e,
            })
    }
}

impl ProcessEnumerator for PsEnumerator {
    fn list(&self) -> BoxFuture<'_, Result<Vec<OsProcess>, EnumerationError>> {
        Box::pin(async move {
            let output = Self::run_ps(&["-eo", PS_COLUMNS]).await?;
            if !output.status.success() {
                return Err(EnumerationError::Failed {
                    tool: "ps".to_string(),
                    status: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
        })
    }

    fn describe(&self, pid: u32) -> BoxFuture<'_, Result<Option<OsProcess>, EnumerationError>> {
        Box::pin(async move {
            let pid_arg = pid.to_string();
            let output = Self::run_ps(&["-o", PS_COLUMNS, "-p", &pid_arg]).await?;
            // ps exits 1 with empty output when the pid is gone.
            let rows = parse_ps_output(&String::from_utf8_lossy(&output.stdout));
            Ok(rows.into_iter().find(|p| p.pid == pid))
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_is_alive(pid)
    }
}

/// `kill(pid, 0)`: true if the process exists, even when owned by another user.
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Parse `ps -o pid=,ppid=,pgid=,etime=,args=` output. Malformed rows are skipped.
pub fn parse_ps_output(text: &str) -> Vec<OsProcess> {
    text.lines().filter_map(parse_ps_line).collect()
}

fn parse_ps_line(line: &str) -> Option<OsProcess> {
    let mut rest = line.trim_start();
    let mut fields = [""; 4];
    for field in fields.iter_mut() {
        let end = rest.find(char::is_whitespace)?;
        *field = &rest[..end];
        rest = rest[end..].trim_start();
    }
    let command_line = rest.trim_end();
    if command_line.is_empty() {
        return None;
    }
    Some(OsProcess {
        pid: fields[0].parse().ok()?,
        ppid: fields[1].parse().ok()?,
        pgid: fields[2].parse().ok()?,
        elapsed_secs: parse_etime(fields[3])?,
        command_line: command_line.to_string(),
    })
}

/// Parse `ps` etime: `[[dd-]hh:]mm:ss`.
pub fn parse_etime(etime: &str) -> Option<u64> {
    let (days, clock) = match etime.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, etime),
    };
    let parts: Vec<u64> = clock
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<_>>()?;
    let (h, m, s) = match parts.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    Some(days * 86_400 + h * 3_600 + m * 60 + s)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_etime_forms() {
        assert_eq!(parse_etime("00:05"), Some(5));
        assert_eq!(parse_etime("12:34"), Some(12 * 60 + 34));
        assert_eq!(parse_etime("01:00:00"), Some(3600));
        assert_eq!(parse_etime("2-03:04:05"), Some(2 * 86_400 + 3 * 3600 + 4 * 60 + 5));
        assert_eq!(parse_etime("garbage"), None);
        assert_eq!(parse_etime("1:2:3:4"), None);
    }

    #[test]
    fn test_parse_ps_output() {
        let text = "    1     0     1    10-00:00:00 /sbin/init splash\n\
                    4242     1  4242       01:02 bash ./agent-loop.sh --once\n\
                    4250  4242  4242       00:30 claude -p do the thing --dangerously-skip-permissions\n";
        let rows = parse_ps_output(text);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].pid, 4242);
        assert_eq!(rows[1].ppid, 1);
        assert_eq!(rows[1].pgid, 4242);
        assert_eq!(rows[1].elapsed_secs, 62);
        assert_eq!(rows[1].command_line, "bash ./agent-loop.sh --once");
        assert_eq!(rows[2].command_name(), "claude");
        assert_eq!(rows[0].command_name(), "init");
    }

    #[test]
    fn test_parse_ps_skips_malformed_rows() {
        let text = "abc def\n  12 1 12 00:01\n 13 1 13 00:01 ok\n";
        let rows = parse_ps_output(text);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, 13);
    }

    #[test]
    fn test_pid_is_alive_for_self_and_dead_pid() {
        assert!(pid_is_alive(std::process::id()));
        assert!(!pid_is_alive(0));
        // Above the default Linux pid_max; never allocated.
        assert!(!pid_is_alive(4_194_304 + 7));
    }

    #[tokio::test]
    async fn test_ps_enumerator_lists_self() {
        let table = PsEnumerator.list().await.unwrap();
        let me = std::process::id();
        assert!(table.iter().any(|p| p.pid == me));
    }

    #[tokio::test]
    async fn test_ps_describe_missing_pid() {
        let found = PsEnumerator.describe(4_194_304 + 7).await.unwrap();
        assert!(found.is_none());
    }
}
