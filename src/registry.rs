//! Log file inventory.
//!
//! Lists the agent's log files with activity metadata and links each file to
//! the running process working on the same task, if any.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use glob::Pattern;
use regex::Regex;
use serde::Serialize;

use crate::config::LogsConfig;
use crate::discovery::{ProcessDiscovery, ProcessRecord};
use crate::tail::read_capped;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogFileDescriptor {
    pub filename: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub age_secs: u64,
    pub is_active: bool,
    pub is_currently_active: bool,
    pub associated_task_id: Option<String>,
    pub associated_pid: Option<u32>,
}

/// Full (capped) content of one log file.
#[derive(Debug, Clone, Serialize)]
pub struct LogContent {
    pub filename: String,
    pub size: u64,
    pub truncated: bool,
    pub content: String,
}

#[derive(Debug)]
pub enum RegistryError {
    InvalidGlob {
        pattern: String,
        source: glob::PatternError,
    },
    InvalidTaskPattern {
        pattern: String,
        source: regex::Error,
    },
    /// Name is not a plain file name matching the log pattern.
    InvalidName { name: String },
    FileNotFound { name: String },
    Io { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::InvalidGlob { pattern, source } => {
                write!(f, "invalid log file pattern '{pattern}': {source}")
            }
            RegistryError::InvalidTaskPattern { pattern, source } => {
                write!(f, "invalid task id pattern '{pattern}': {source}")
            }
            RegistryError::InvalidName { name } => write!(f, "invalid log file name '{name}'"),
            RegistryError::FileNotFound { name } => write!(f, "log file '{name}' not found"),
            RegistryError::Io { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::InvalidGlob { source, .. } => Some(source),
            RegistryError::InvalidTaskPattern { source, .. } => Some(source),
            RegistryError::Io { source, .. } => Some(source),
            RegistryError::InvalidName { .. } | RegistryError::FileNotFound { .. } => None,
        }
    }
}

struct FileEntry {
    filename: String,
    size: u64,
    modified: SystemTime,
}

pub struct LogRegistry {
    dir: PathBuf,
    pattern: Pattern,
    task_id: Regex,
    current_window: Duration,
    max_listing: usize,
    full_read_cap: u64,
    discovery: Arc<ProcessDiscovery>,
}

impl LogRegistry {
    pub fn new(config: &LogsConfig, discovery: Arc<ProcessDiscovery>) -> Result<Self, RegistryError> {
        let pattern = Pattern::new(&config.pattern).map_err(|e| RegistryError::InvalidGlob {
            pattern: config.pattern.clone(),
            source: e,
        })?;
        let task_id =
            Regex::new(&config.task_id_pattern).map_err(|e| RegistryError::InvalidTaskPattern {
                pattern: config.task_id_pattern.clone(),
                source: e,
            })?;
        Ok(Self {
            dir: config.dir.clone(),
            pattern,
            task_id,
            current_window: config.current_window(),
            max_listing: config.max_listing,
            full_read_cap: config.full_read_cap_bytes,
            discovery,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log files ordered for display: currently active, then active, then newest.
    pub async fn list(&self, max_age_for_active: Duration) -> Vec<LogFileDescriptor> {
        let records = self.discovery.enumerate(false).await;
        let entries = self.scan().await;
        self.describe(entries, &records, SystemTime::now(), max_age_for_active)
    }

    /// The most recently modified log file.
    pub async fn latest(&self) -> Option<LogFileDescriptor> {
        self.list(Duration::ZERO)
            .await
            .into_iter()
            .max_by_key(|d| d.modified_at)
    }

    /// Full content of `name`, keeping only the trailing window when oversized.
    pub async fn read_full(&self, name: &str) -> Result<LogContent, RegistryError> {
        let path = self.resolve(name)?;
        let read = match read_capped(&path, self.full_read_cap).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::FileNotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(RegistryError::Io { path, source: e }),
        };
        let content = match read.notice() {
            Some(notice) => format!("{notice}{}", read.content),
            None => read.content,
        };
        Ok(LogContent {
            filename: name.to_string(),
            size: read.total_len,
            truncated: read.truncated,
            content,
        })
    }

    /// Map a client-supplied file name to a path inside the log directory.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, RegistryError> {
        let mut components = Path::new(name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain || name.contains('\\') || !self.pattern.matches(name) {
            return Err(RegistryError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.dir.join(name))
    }

    async fn scan(&self) -> Vec<FileEntry> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(error = %e, dir = %self.dir.display(), "log directory not readable");
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, dir = %self.dir.display(), "failed to read log directory entry");
                    break;
                }
            };
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !self.pattern.matches(&filename) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, file = %filename, "failed to stat log file");
                    continue;
                }
            };
            entries.push(FileEntry {
                filename,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        entries
    }

    fn describe(
        &self,
        entries: Vec<FileEntry>,
        records: &[ProcessRecord],
        now: SystemTime,
        max_age_for_active: Duration,
    ) -> Vec<LogFileDescriptor> {
        let mut out: Vec<LogFileDescriptor> = entries
            .into_iter()
            .map(|e| {
                // Files stamped in the future count as brand new.
                let age = now.duration_since(e.modified).unwrap_or(Duration::ZERO);
                let task_id = self.task_id_in(&e.filename);
                let associated_pid = task_id.as_deref().and_then(|id| {
                    records
                        .iter()
                        .find(|r| self.task_id_in(&r.full_command_line).as_deref() == Some(id))
                        .map(|r| r.pid)
                });
                LogFileDescriptor {
                    filename: e.filename,
                    size: e.size,
                    modified_at: DateTime::<Utc>::from(e.modified),
                    age_secs: age.as_secs(),
                    is_active: age < max_age_for_active,
                    is_currently_active: age < self.current_window,
                    associated_task_id: task_id,
                    associated_pid,
                }
            })
            .collect();

        out.sort_by(|a, b| {
            b.is_currently_active
                .cmp(&a.is_currently_active)
                .then(b.is_active.cmp(&a.is_active))
                .then(b.modified_at.cmp(&a.modified_at))
        });
        out.truncate(self.max_listing);
        out
    }

    fn task_id_in(&self, text: &str) -> Option<String> {
        self.task_id
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}
