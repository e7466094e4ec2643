//! Cascade configuration loaded from TOML, and per-plan options.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, CascadeResult};

/// Hard bounds on per-layer concurrency.
pub const MIN_PARALLEL: usize = 1;
pub const MAX_PARALLEL: usize = 20;

/// CI polling knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiConfig {
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            max_attempts: 80,
        }
    }
}

impl CiConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Process-wide cascade settings.
///
/// ```toml
/// parallel_limit = 4
/// install_command = ["pnpm", "install"]
///
/// [ci]
/// poll_interval_secs = 30
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub parallel_limit: usize,
    pub install_command: Vec<String>,
    pub test_command: Vec<String>,
    pub registry_url: String,
    pub history_dir: PathBuf,
    pub commit_prefix: String,
    pub ci: CiConfig,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            parallel_limit: 6,
            install_command: vec!["npm".to_string(), "install".to_string()],
            test_command: vec!["npm".to_string(), "test".to_string()],
            registry_url: "https://registry.npmjs.org".to_string(),
            history_dir: PathBuf::from(".ripple/history"),
            commit_prefix: "chore(deps):".to_string(),
            ci: CiConfig::default(),
        }
    }
}

impl CascadeConfig {
    /// Parse TOML; missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> CascadeResult<Self> {
        let config: CascadeConfig =
            toml::from_str(raw).map_err(|e| CascadeError::Config(e.to_string()))?;
        config.validated()
    }

    pub fn load(path: &Path) -> CascadeResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CascadeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Clamp the parallel limit and reject empty commands.
    pub fn validated(mut self) -> CascadeResult<Self> {
        self.parallel_limit = self.parallel_limit.clamp(MIN_PARALLEL, MAX_PARALLEL);
        if self.install_command.is_empty() {
            return Err(CascadeError::Config("install_command is empty".to_string()));
        }
        if self.test_command.is_empty() {
            return Err(CascadeError::Config("test_command is empty".to_string()));
        }
        Ok(self)
    }
}

/// Options captured in a plan at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeOptions {
    pub wait_for_ci: bool,
    pub run_tests: bool,
    pub commit_prefix: String,
    /// Message of the source change, carried for display.
    #[serde(default)]
    pub source_message: Option<String>,
}

impl Default for CascadeOptions {
    fn default() -> Self {
        Self {
            wait_for_ci: false,
            run_tests: true,
            commit_prefix: CascadeConfig::default().commit_prefix,
            source_message: None,
        }
    }
}

impl CascadeOptions {
    /// Defaults with the configured commit prefix.
    pub fn from_config(config: &CascadeConfig) -> Self {
        Self {
            commit_prefix: config.commit_prefix.clone(),
            ..Self::default()
        }
    }
}
