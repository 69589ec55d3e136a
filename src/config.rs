//! Configuration management for kubelinkr.
//!
//! Handles loading configuration from `<config dir>/kubelinkr/config.toml`:
//! engine tuning, the kubeconfig location and the project catalog.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tunnel::Project;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Kubeconfig location; `$KUBECONFIG` / `~/.kube/config` when unset
    pub kubeconfig: Option<PathBuf>,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub projects: Vec<Project>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "kubelinkr")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }
}

/// What a local client receives when its session is torn down by force
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureResponse {
    /// Abort the connection so the client sees a reset
    #[default]
    Reset,
    /// Write a minimal HTTP 502/504 response before closing
    Http,
}

/// Tuning knobs of the tunnel engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Address local listeners bind to
    pub bind_address: String,
    /// Time allowed for the remote side to answer after a local send
    pub response_timeout_ms: u64,
    /// Total connection attempts per session before giving up
    pub max_connect_attempts: u32,
    /// Pause before each retry
    pub retry_delay_ms: u64,
    /// Cap on waiting for the remote channel to open
    pub open_timeout_ms: u64,
    /// Gap between consecutive forward stops of one project
    pub stop_stagger_ms: u64,
    /// Wait after stopping staging-group siblings before binding again
    pub settle_delay_ms: u64,
    /// Traffic snapshot cadence
    pub traffic_interval_ms: u64,
    pub failure_response: FailureResponse,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            response_timeout_ms: 20_000,
            max_connect_attempts: 4,
            retry_delay_ms: 250,
            open_timeout_ms: 10_000,
            stop_stagger_ms: 30,
            settle_delay_ms: 500,
            // Off the one-second grid so pushes don't beat against bucket rollover
            traffic_interval_ms: 1_100,
            failure_response: FailureResponse::Reset,
        }
    }
}

impl EngineSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn stop_stagger(&self) -> Duration {
        Duration::from_millis(self.stop_stagger_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn traffic_interval(&self) -> Duration {
        Duration::from_millis(self.traffic_interval_ms)
    }

    /// Attempt budget, never below one
    pub fn max_attempts(&self) -> u32 {
        self.max_connect_attempts.max(1)
    }
}
