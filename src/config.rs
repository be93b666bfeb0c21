use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from agentwatch.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WatchConfig {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub logs: LogsConfig,
    pub discovery: DiscoveryConfig,
    pub tail: TailConfig,
    pub stream: StreamConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub log_level: String,
}

/// How the managed agent is launched.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Launcher script (or binary) spawned by `start`.
    pub script: PathBuf,
    /// Arguments always passed before the per-start options.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub dir: PathBuf,
    /// Glob applied inside `dir`.
    pub pattern: String,
    /// Regex with one capture group yielding the task id.
    pub task_id_pattern: String,
    pub active_window_secs: u64,
    pub current_window_secs: u64,
    pub max_listing: usize,
    pub full_read_cap_bytes: u64,
}

/// Keyword lists for agent process classification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Launcher basename. Empty means "derive from `agent.script`".
    pub launcher: String,
    pub worker_interpreters: Vec<String>,
    pub worker_markers: Vec<String>,
    /// Interpreters that may sit in argv[0] in front of the launcher.
    pub shells: Vec<String>,
    pub cache_ttl_ms: u64,
    pub max_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    pub poll_interval_ms: u64,
    pub initial_cap_bytes: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub heartbeat_secs: u64,
    pub queue_capacity: usize,
    pub send_timeout_ms: u64,
    pub exit_requery_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub kill_grace_secs: u64,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3030,
            log_level: "info".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::from("./agent-loop.sh"),
            args: Vec::new(),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            pattern: "*.log".to_string(),
            task_id_pattern: r"task-(\d+(?:\.\d+)*)".to_string(),
            active_window_secs: 600,
            current_window_secs: 30,
            max_listing: 100,
            full_read_cap_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            launcher: String::new(),
            worker_interpreters: vec!["claude".to_string()],
            worker_markers: vec![
                "--dangerously-skip-permissions".to_string(),
                "tasks.md".to_string(),
            ],
            shells: vec![
                "sh".to_string(),
                "bash".to_string(),
                "zsh".to_string(),
                "dash".to_string(),
            ],
            cache_ttl_ms: 5_000,
            max_depth: 10,
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            initial_cap_bytes: 10 * 1024 * 1024,
            max_retries: 10,
            retry_base_ms: 1_000,
            retry_max_ms: 10_000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            queue_capacity: 256,
            send_timeout_ms: 5_000,
            exit_requery_ms: 1_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 10_000,
            reconnect_max_attempts: 10,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { kill_grace_secs: 5 }
    }
}

// --- Derived values ---

impl DiscoveryConfig {
    /// The launcher basename, falling back to the basename of the agent script.
    pub fn launcher_name(&self, agent: &AgentConfig) -> String {
        if !self.launcher.is_empty() {
            return self.launcher.clone();
        }
        agent
            .script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl LogsConfig {
    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }

    pub fn current_window(&self) -> Duration {
        Duration::from_secs(self.current_window_secs)
    }
}

impl TailConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn exit_requery(&self) -> Duration {
        Duration::from_millis(self.exit_requery_ms)
    }
}

impl LifecycleConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Parse the config file at `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<WatchConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(WatchConfig::default()),
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl WatchConfig {
    /// Apply `AGENTWATCH_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("AGENTWATCH_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid AGENTWATCH_PORT"),
            }
        }
        if let Some(dir) = lookup("AGENTWATCH_LOG_DIR") {
            self.logs.dir = PathBuf::from(dir);
        }
        if let Some(script) = lookup("AGENTWATCH_SCRIPT") {
            self.agent.script = PathBuf::from(script);
        }
        if let Some(level) = lookup("AGENTWATCH_LOG") {
            self.server.log_level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_constants() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.discovery.cache_ttl(), Duration::from_secs(5));
        assert_eq!(cfg.discovery.max_depth, 10);
        assert_eq!(cfg.tail.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.tail.initial_cap_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.logs.full_read_cap_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.tail.max_retries, 10);
        assert_eq!(cfg.stream.heartbeat(), Duration::from_secs(30));
        assert_eq!(cfg.lifecycle.kill_grace(), Duration::from_secs(5));
        assert_eq!(cfg.logs.max_listing, 100);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let cfg: WatchConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [discovery]
            worker_interpreters = ["node"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.discovery.worker_interpreters, vec!["node"]);
        assert_eq!(cfg.discovery.max_depth, 10);
        assert_eq!(cfg.tail.max_retries, 10);
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.server.port, 3030);
    }

    #[test]
    fn test_load_config_invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentwatch.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("agentwatch.toml"));
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentwatch.toml");
        std::fs::write(&path, "[lifecycle]\nkill_grace_secs = 2\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.lifecycle.kill_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_launcher_name_derived_from_script() {
        let agent = AgentConfig {
            script: PathBuf::from("/opt/agent/run-loop.sh"),
            args: vec![],
        };
        let discovery = DiscoveryConfig::default();
        assert_eq!(discovery.launcher_name(&agent), "run-loop.sh");

        let explicit = DiscoveryConfig {
            launcher: "other.sh".to_string(),
            ..Default::default()
        };
        assert_eq!(explicit.launcher_name(&agent), "other.sh");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AGENTWATCH_PORT", "4100"),
            ("AGENTWATCH_LOG_DIR", "/var/log/agent"),
            ("AGENTWATCH_SCRIPT", "/usr/local/bin/loop.sh"),
            ("AGENTWATCH_LOG", "debug"),
        ]);
        let mut cfg = WatchConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.server.port, 4100);
        assert_eq!(cfg.logs.dir, PathBuf::from("/var/log/agent"));
        assert_eq!(cfg.agent.script, PathBuf::from("/usr/local/bin/loop.sh"));
        assert_eq!(cfg.server.log_level, "debug");
    }

    #[test]
    fn test_invalid_port_override_is_ignored() {
        let mut cfg = WatchConfig::default();
        cfg.apply_overrides(|k| (k == "AGENTWATCH_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(cfg.server.port, 3030);
    }
}
