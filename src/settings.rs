//! Runtime tunables for the swarm.
//!
//! Loaded from `{working_dir}/.blockswarm/settings.json` when present,
//! otherwise built from defaults. Every duration knob has a millisecond
//! field in the file and a `Duration` accessor for callers.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunable timings and paths shared by the agent engine and the bots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Poll interval of a paused PDA loop.
    pub pause_poll_ms: u64,
    /// How long `stop()` waits for a loop to exit before aborting it.
    pub stop_grace_ms: u64,
    /// Backoff used by agents when a cycle has nothing to do.
    pub idle_backoff_ms: u64,
    /// Delay between height samples during a scan.
    pub scan_delay_ms: u64,
    /// Delay per mining step.
    pub mine_delay_ms: u64,
    /// Delay per placed block.
    pub block_delay_ms: u64,
    /// Timeout for sector lock acquisition.
    pub lock_timeout_ms: u64,
    /// Interval between periodic inventory publishes.
    pub inventory_publish_ms: u64,
    /// Optional directory with JSON structure templates.
    pub template_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pause_poll_ms: 100,
            stop_grace_ms: 2_000,
            idle_backoff_ms: 100,
            scan_delay_ms: 5,
            mine_delay_ms: 20,
            block_delay_ms: 5,
            lock_timeout_ms: 500,
            inventory_publish_ms: 1_000,
            template_dir: None,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults when the
    /// file is missing or malformed (a malformed file is logged, not fatal).
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("no settings file at {}, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        {
            Ok(settings) => {
                tracing::info!("loaded settings from {}", path.display());
                settings
            }
            Err(err) => {
                tracing::warn!("failed to load settings from {}: {err}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn scan_delay(&self) -> Duration {
        Duration::from_millis(self.scan_delay_ms)
    }

    pub fn mine_delay(&self) -> Duration {
        Duration::from_millis(self.mine_delay_ms)
    }

    pub fn block_delay(&self) -> Duration {
        Duration::from_millis(self.block_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn inventory_publish(&self) -> Duration {
        Duration::from_millis(self.inventory_publish_ms)
    }

    /// A variant with all delays collapsed, used by tests so missions run
    /// in milliseconds instead of seconds.
    pub fn fast() -> Self {
        Self {
            pause_poll_ms: 10,
            stop_grace_ms: 500,
            idle_backoff_ms: 5,
            scan_delay_ms: 0,
            mine_delay_ms: 0,
            block_delay_ms: 0,
            lock_timeout_ms: 100,
            inventory_publish_ms: 20,
            template_dir: None,
        }
    }
}
