// heapdbg - Heap origin debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Engine configuration.
//!
//! Settings are grouped per subsystem and stored as TOML in `~/.heapdbg.toml`.
//! Every field has a default, so a partial file is valid.
//!
//! ```toml
//! [bdhs]
//! max_steps = 5000
//! after = 3
//!
//! [blackbox]
//! manual_add = ["cdn.example.com"]
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// File name of the configuration file inside the home directory
pub const CONFIG_FILE_NAME: &str = ".heapdbg.toml";

/// URL substrings of frameworks and bundlers whose scripts are blackboxed by default
pub const DEFAULT_VENDOR_PATTERNS: &[&str] = &[
    "react",
    "react-dom",
    "redux",
    "vue",
    "angular",
    "jquery",
    "moment",
    "lodash",
    "immer",
    "rxjs",
    "core-js",
    "regenerator-runtime",
    "polyfill",
    "babel",
    "webpack",
    "vite",
    "rollup",
    "parcel",
    "zone.js",
];

/// Configuration for the heapdbg engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Breakpoint-driven heap search
    pub bdhs: BdhsConfig,
    /// Heap graph model and searches
    pub heap: HeapConfig,
    /// Object similarity
    pub similarity: SimilarityConfig,
    /// Heuristic blackboxing of vendor scripts
    pub blackbox: BlackboxConfig,
}

/// Breakpoint-driven heap search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BdhsConfig {
    /// Hard cap on the number of steps of a single run
    pub max_steps: u64,
    /// Period of the idle watchdog
    pub watchdog_interval_ms: u64,
    /// Consecutive idle observations after which the watchdog finalises the run
    pub watchdog_idle_ticks: u32,
    /// Steps kept in the result before the first match
    pub before: usize,
    /// Steps run after the first match before finalising
    pub after: usize,
    /// Finalise as soon as a step after the first match finds nothing
    pub stop_on_match_loss: bool,
}

impl Default for BdhsConfig {
    fn default() -> Self {
        Self {
            max_steps: 5000,
            watchdog_interval_ms: 500,
            watchdog_idle_ticks: 4,
            before: 2,
            after: 3,
            stop_on_match_loss: false,
        }
    }
}

impl BdhsConfig {
    /// Watchdog period as a duration
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Number of history entries reported in a result
    pub fn result_window(&self) -> usize {
        self.before + self.after + 1
    }
}

/// Heap graph settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Depth at which materialisation stops
    pub inspect_depth: usize,
    /// Result cap of snapshot searches
    pub max_results: usize,
    /// Depth cap of by-root live searches
    pub live_max_depth: usize,
    /// Result cap of global live searches
    pub live_max_results: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self { inspect_depth: 15, max_results: 500, live_max_depth: 125, live_max_results: 100 }
    }
}

/// Similarity engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Tokenization depth
    pub depth: usize,
    /// Shingle width of fingerprints
    pub shingle_window: usize,
    /// Default weight of the Jaccard term
    pub alpha: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self { depth: 3, shingle_window: 4, alpha: heapdbg_common::DEFAULT_ALPHA }
    }
}

/// Blackboxing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackboxConfig {
    /// Case-insensitive URL substrings identifying vendor code
    pub vendor_patterns: Vec<String>,
    /// URL substrings that are always blackboxed
    pub manual_add: Vec<String>,
    /// URL substrings that are never blackboxed; wins over everything else
    pub manual_remove: Vec<String>,
}

impl Default for BlackboxConfig {
    fn default() -> Self {
        Self {
            vendor_patterns: DEFAULT_VENDOR_PATTERNS.iter().map(|p| p.to_string()).collect(),
            manual_add: Vec::new(),
            manual_remove: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Get the config file path (~/.heapdbg.toml)
    pub fn config_path() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| eyre::eyre!("Unable to determine home directory"))?;
        Ok(home.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found, creating default at {:?}", config_path);
            let default_config = Self::default();
            default_config.save_to(&config_path)?;
            return Ok(default_config);
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path:?}"))?;

        let config: Self =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {path:?}"))?;

        debug!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Set the step cap of breakpoint-driven searches
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.bdhs.max_steps = max_steps;
        self
    }

    /// Set the tolerance window around the first match
    pub fn with_tolerance_window(mut self, before: usize, after: usize) -> Self {
        self.bdhs.before = before;
        self.bdhs.after = after;
        self
    }

    /// Set the watchdog period
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.bdhs.watchdog_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the result cap of snapshot searches
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.heap.max_results = max_results;
        self
    }
}
