use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::ClientInfo;

/// Default deadline for one request/response exchange (5 seconds).
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Default time the peer gets to exit after its stdin is closed.
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

const DEFAULT_EXECUTABLE: &str = "goose";
const DEFAULT_SERVER_NAME: &str = "ultrathink";
const DEFAULT_PROJECT: &str = "general";

/// Environment variable carrying the project scope to the peer.
pub const PROJECT_ENV: &str = "GOOSE_PROJECT";
/// Environment variable carrying the per-project memory directory to the peer.
pub const MEMORY_DIR_ENV: &str = "MEMORY_DIR";

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub executable: PathBuf,
    pub server_name: String,
    pub project: String,
    pub memory_root: PathBuf,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub quirk_compensation: bool,
    pub client_name: String,
    pub client_version: String,
}

/// How to start the peer: `<program> <args...>` with `env` layered on top of
/// the inherited environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_EXECUTABLE),
            server_name: DEFAULT_SERVER_NAME.into(),
            project: DEFAULT_PROJECT.into(),
            memory_root: default_memory_root(std::env::var_os("HOME").map(PathBuf::from)),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            quirk_compensation: true,
            client_name: env!("CARGO_PKG_NAME").into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment.
    ///
    /// - `ULTRATHINK_EXECUTABLE` (optional, default `goose`): peer executable
    /// - `ULTRATHINK_SERVER` (optional, default `ultrathink`): server name passed after `mcp`
    /// - `GOOSE_PROJECT` (optional, default `general`): project scope
    /// - `ULTRATHINK_MEMORY_ROOT` (optional, default `$HOME/.goose/memory`)
    /// - `ULTRATHINK_REQUEST_TIMEOUT_SECS` (optional, default 5)
    /// - `ULTRATHINK_SHUTDOWN_GRACE_MS` (optional, default 2000)
    /// - `ULTRATHINK_QUIRK_COMPENSATION` (optional, default true)
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            memory_root: default_memory_root(lookup("HOME").map(PathBuf::from)),
            ..Self::default()
        };

        if let Some(executable) = lookup("ULTRATHINK_EXECUTABLE") {
            config.executable = PathBuf::from(executable);
        }
        if let Some(server) = lookup("ULTRATHINK_SERVER") {
            config.server_name = server;
        }
        if let Some(project) = lookup(PROJECT_ENV) {
            config.project = project;
        }
        if let Some(root) = lookup("ULTRATHINK_MEMORY_ROOT") {
            config.memory_root = PathBuf::from(root);
        }

        if let Some(val) = lookup("ULTRATHINK_REQUEST_TIMEOUT_SECS") {
            let secs = val
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| {
                    "ULTRATHINK_REQUEST_TIMEOUT_SECS must be a positive integer".to_string()
                })?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("ULTRATHINK_SHUTDOWN_GRACE_MS") {
            let ms = val.parse::<u64>().map_err(|_| {
                "ULTRATHINK_SHUTDOWN_GRACE_MS must be a non-negative integer".to_string()
            })?;
            config.shutdown_grace = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("ULTRATHINK_QUIRK_COMPENSATION") {
            config.quirk_compensation = parse_bool(&val).ok_or_else(|| {
                "ULTRATHINK_QUIRK_COMPENSATION must be true or false".to_string()
            })?;
        }

        if config.project.is_empty() {
            return Err(format!("{PROJECT_ENV} must not be empty"));
        }

        Ok(config)
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Per-project memory directory handed to the peer as `MEMORY_DIR`.
    pub fn memory_dir(&self) -> PathBuf {
        self.memory_root.join(&self.project)
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            name: self.client_name.clone(),
            version: self.client_version.clone(),
        }
    }

    /// `<executable> mcp <server-name>` plus the two environment overrides.
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            program: self.executable.clone(),
            args: vec!["mcp".into(), self.server_name.clone()],
            env: vec![
                (PROJECT_ENV.into(), self.project.clone()),
                (
                    MEMORY_DIR_ENV.into(),
                    self.memory_dir().to_string_lossy().into_owned(),
                ),
            ],
        }
    }
}

fn default_memory_root(home: Option<PathBuf>) -> PathBuf {
    home.unwrap_or_else(|| PathBuf::from("."))
        .join(".goose")
        .join("memory")
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
