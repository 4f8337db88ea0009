//! Configuration types and loading
//!
//! One TOML file with two tables: `[session]` is handed to the session
//! manager unchanged, `[agent]` configures this process.
//! Path precedence: `--config` flag > `CONFIG_PATH` env var > default.

use serde::Deserialize;
use session::SessionConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// File name of the durable storage tier inside `state_dir`.
pub const STORE_FILE: &str = "session-store.json";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub session: SessionConfig,
    pub agent: AgentConfig,
}

/// Agent process settings
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Directory for the durable storage tier. Without it the durable tier
    /// lives in memory and nothing survives a restart.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// How long a login window may stay open before it counts as cancelled
    #[serde(default = "default_popup_timeout")]
    pub popup_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Report an embedded host context to the session (disables redirect)
    #[serde(default)]
    pub embedded: bool,
}

fn default_popup_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    64
}

impl AgentConfig {
    pub fn store_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join(STORE_FILE))
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> common::Result<Self> {
        let config: Config = toml::from_str(contents)?;

        config.session.validate()?;

        if config.agent.popup_timeout_secs == 0 {
            return Err(common::Error::Config(
                "popup_timeout_secs must be greater than 0".into(),
            ));
        }

        if config.agent.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-agent.toml")
    }
}
