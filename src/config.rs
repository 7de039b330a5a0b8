//! Configuration types for Rewind

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, RewindError};

/// How the session starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// A recording child is live at the frontier
    Record,
    /// An existing recording is replayed; a replaying child holds the frontier
    Replay,
}

impl Mode {
    /// Check if mode is Record
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Mode::Record)
    }

    /// Check if mode is Replay
    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, Mode::Replay)
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Operating mode
    pub mode: Mode,
    /// Number of replaying children spawned at startup
    #[serde(default = "default_replaying_children")]
    pub replaying_children: usize,
    /// Maximum number of child crashes recovered per session
    #[serde(default = "default_crash_budget")]
    pub crash_budget: usize,
    /// Base hang timeout per manifest, added to its expected duration
    #[serde(default = "default_hang_timeout_ms")]
    pub hang_timeout_ms: u64,
    /// How often the driver checks for hung manifests
    #[serde(default = "default_hang_check_interval_ms")]
    pub hang_check_interval_ms: u64,
    /// Minimum execution time between consecutive saved checkpoints
    #[serde(default = "default_saved_checkpoint_interval_ms")]
    pub saved_checkpoint_interval_ms: u64,
    /// Speculative pause data budgets
    #[serde(default)]
    pub prefetch: PrefetchConfig,
}

fn default_replaying_children() -> usize {
    4
}

fn default_crash_budget() -> usize {
    8
}

fn default_hang_timeout_ms() -> u64 {
    30_000
}

fn default_hang_check_interval_ms() -> u64 {
    1_000
}

fn default_saved_checkpoint_interval_ms() -> u64 {
    500
}

/// Prefetch budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Breakpoint hits prefetched on each side of a pause point
    pub hits_per_side: usize,
    /// Total step targets prefetched
    pub steps: usize,
    /// How many steps away from the pause point to look
    pub depth: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            hits_per_side: 3,
            steps: 4,
            depth: 2,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Record,
            replaying_children: default_replaying_children(),
            crash_budget: default_crash_budget(),
            hang_timeout_ms: default_hang_timeout_ms(),
            hang_check_interval_ms: default_hang_check_interval_ms(),
            saved_checkpoint_interval_ms: default_saved_checkpoint_interval_ms(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RewindError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| RewindError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.replaying_children == 0 {
            return Err(RewindError::ConfigError(
                "At least one replaying child must be configured".to_string(),
            ));
        }

        if self.hang_timeout_ms == 0 {
            return Err(RewindError::ConfigError(
                "hang_timeout_ms cannot be 0".to_string(),
            ));
        }

        if self.hang_check_interval_ms == 0 {
            return Err(RewindError::ConfigError(
                "hang_check_interval_ms cannot be 0".to_string(),
            ));
        }

        let prefetch = &self.prefetch;
        if prefetch.hits_per_side == 0 || prefetch.steps == 0 || prefetch.depth == 0 {
            return Err(RewindError::ConfigError(
                "Prefetch budgets must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Base hang timeout
    #[must_use]
    pub fn hang_timeout(&self) -> Duration {
        Duration::from_millis(self.hang_timeout_ms)
    }

    /// Hang check interval for the driver loop
    #[must_use]
    pub fn hang_check_interval(&self) -> Duration {
        Duration::from_millis(self.hang_check_interval_ms)
    }

    /// Minimum spacing between saved checkpoints
    #[must_use]
    pub fn saved_checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.saved_checkpoint_interval_ms)
    }
}
