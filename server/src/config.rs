use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use dtf_common::SocketAddress;
use serde::Deserialize;

use crate::{auth::PeerPolicy, executor::default_shell};

const SHELL_ENV: &str = "DTF_SHELL";
const IO_TIMEOUT_ENV: &str = "DTF_IO_TIMEOUT_SECS";

/// Pause between stop and start on restart, so the OS releases the address
pub const DEFAULT_RESTART_COOLDOWN: Duration = Duration::from_secs(2);

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub address:          SocketAddress,
    /// Which peers are let in
    pub policy:           PeerPolicy,
    /// Shell used to run execute requests
    pub shell:            PathBuf,
    /// Read/write timeout on accepted connections, none by default
    pub io_timeout:       Option<Duration>,
    /// Delay between stop and start when restarting
    pub restart_cooldown: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address:          SocketAddress::default(),
            policy:           PeerPolicy::default(),
            shell:            default_shell(),
            io_timeout:       None,
            restart_cooldown: DEFAULT_RESTART_COOLDOWN,
        }
    }
}

/// On-disk form of [`ServerConfig`]; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    socket:              Option<String>,
    shell:               Option<PathBuf>,
    io_timeout_secs:     Option<u64>,
    restart_cooldown_ms: Option<u64>,
    policy:              Option<PeerPolicy>,
}

impl ConfigFile {
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(socket) = self.socket {
            config.address = SocketAddress::parse(&socket);
        }
        if let Some(shell) = self.shell {
            config.shell = shell;
        }
        if let Some(secs) = self.io_timeout_secs {
            config.io_timeout = timeout_from_secs(secs);
        }
        if let Some(ms) = self.restart_cooldown_ms {
            config.restart_cooldown = Duration::from_millis(ms);
        }
        if let Some(policy) = self.policy {
            config.policy = policy;
        }
        config
    }
}

/// Zero disables the timeout
fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl ServerConfig {
    /// Creates a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, then the optional JSON file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Reads a JSON configuration file on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn from_json(raw: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(raw)?;
        Ok(file.apply(Self::default()))
    }

    /// Applies `DTF_SOCKET`, `DTF_SHELL` and `DTF_IO_TIMEOUT_SECS`
    pub fn with_env_overrides(mut self) -> Self {
        if env::var_os(dtf_common::config::SOCKET_ENV).is_some() {
            self.address = SocketAddress::from_env();
        }
        if let Some(shell) = env::var_os(SHELL_ENV).filter(|s| !s.is_empty()) {
            self.shell = PathBuf::from(shell);
        }
        if let Ok(raw) = env::var(IO_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.io_timeout = timeout_from_secs(secs),
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", IO_TIMEOUT_ENV, raw, e),
            }
        }
        self
    }

    /// Set the listening address
    pub fn with_address(mut self, address: SocketAddress) -> Self {
        self.address = address;
        self
    }

    /// Set the peer policy
    pub fn with_policy(mut self, policy: PeerPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the shell used for execute requests
    pub fn with_shell<P: Into<PathBuf>>(mut self, shell: P) -> Self {
        self.shell = shell.into();
        self
    }

    /// Set the per-connection read/write timeout
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the restart cooldown
    pub fn with_restart_cooldown(mut self, cooldown: Duration) -> Self {
        self.restart_cooldown = cooldown;
        self
    }
}
