use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::ConfigError;

pub const DEFAULT_ROOT: &str = "./.darwinflow";
pub const PLUGINS_FILE: &str = "plugins.yaml";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1;
pub const DEFAULT_EVENT_RETENTION: usize = 10_000;

/// Shape of `<root>/plugins.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginsFile {
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
}

/// One subprocess plugin entry, as written by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub restart_on_crash: bool,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Forwarded verbatim in the `init` request.
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

/// Everything needed to launch one subprocess plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct SubprocessConfig {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub restart_on_crash: bool,
    pub max_in_flight: usize,
    pub config: Map<String, Value>,
}

impl SubprocessConfig {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: PathBuf::from("."),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            restart_on_crash: false,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            config: Map::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Host-wide settings: root layout, logging and the plugins to launch.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub root: PathBuf,
    pub log_level: String,
    pub otel_endpoint: Option<String>,
    /// JSON-lines bus log. Replay is only possible when set.
    pub event_log: Option<PathBuf>,
    /// Events kept by the in-memory repository; `0` keeps everything.
    pub event_retention: usize,
    pub plugins: Vec<SubprocessConfig>,
}

impl HostConfig {
    /// `--root`, then `DW_ROOT`, then `./.darwinflow`.
    pub fn resolve_root(cli_root: Option<PathBuf>) -> PathBuf {
        cli_root
            .or_else(|| env::var_os("DW_ROOT").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT))
    }

    /// Load `.env`, the `DW_*` overrides and `plugins.yaml` from `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let env_file = root.join(".env");
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        }

        let event_log = env::var_os("DW_EVENT_LOG").map(|p| {
            let p = PathBuf::from(p);
            if p.is_relative() { root.join(p) } else { p }
        });

        Ok(Self {
            root: root.to_path_buf(),
            log_level: env::var("DW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otel_endpoint: env::var("DW_OTEL_ENDPOINT").ok().filter(|s| !s.is_empty()),
            event_log,
            event_retention: env::var("DW_EVENT_RETENTION")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_EVENT_RETENTION),
            plugins: load_plugins(&root.join(PLUGINS_FILE), root)?,
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Parse a plugins file into launchable entries.
///
/// A missing file means no plugins. Disabled entries and entries whose
/// executable can't be found are skipped with a log line, not an error.
pub fn load_plugins(path: &Path, working_dir: &Path) -> Result<Vec<SubprocessConfig>, ConfigError> {
    if !path.exists() {
        info!("no plugin config at {}", path.display());
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    let file: PluginsFile = serde_yaml_bw::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
    let base = path.parent().unwrap_or(Path::new("."));

    let mut out = Vec::new();
    for (name, entry) in file.plugins {
        if !entry.enabled {
            info!(plugin = %name, "plugin disabled, skipping");
            continue;
        }
        let Some(program) = resolve_command(base, &entry.command) else {
            warn!(plugin = %name, command = %entry.command, "plugin executable not found, skipping");
            continue;
        };
        out.push(SubprocessConfig {
            name,
            program,
            args: entry.args,
            env: entry.env,
            working_dir: working_dir.to_path_buf(),
            timeout: Duration::from_secs(entry.timeout.max(1)),
            restart_on_crash: entry.restart_on_crash,
            max_in_flight: entry.max_in_flight.max(1),
            config: entry.config,
        });
    }
    Ok(out)
}

/// Paths are taken relative to `base`; bare names are looked up on `PATH`.
pub fn resolve_command(base: &Path, command: &str) -> Option<PathBuf> {
    let command = command.trim();
    if command.is_empty() {
        return None;
    }
    let as_path = Path::new(command);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        let full = if as_path.is_absolute() { as_path.to_path_buf() } else { base.join(as_path) };
        return full.is_file().then_some(full);
    }
    let local = base.join(command);
    if local.is_file() {
        return Some(local);
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path).map(|dir| dir.join(command)).find(|candidate| candidate.is_file())
}
