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


use std::{fs, time::Duration};

use heapdbg_engine::{EngineConfig, ObjectSimilarity, SearchOptions};
use tempfile::TempDir;
use tracing::info;

#[test]
fn test_default_config() {
    heapdbg_common::logging::ensure_test_logging(None);
    info!("Running test");
    let config = EngineConfig::default();

    assert_eq!(config.bdhs.max_steps, 5000);
    assert_eq!((config.bdhs.before, config.bdhs.after), (2, 3));
    assert!(!config.bdhs.stop_on_match_loss);
    assert_eq!(config.bdhs.watchdog_idle_ticks, 4);
    assert_eq!(config.heap.max_results, 500);
    assert_eq!(config.heap.live_max_depth, 125);
    assert_eq!(config.heap.live_max_results, 100);
    assert_eq!(config.similarity.depth, 3);
    assert!(config.blackbox.manual_add.is_empty());
}

#[test]
fn test_config_with_custom_values() {
    heapdbg_common::logging::ensure_test_logging(None);
    info!("Running test");
    let config = EngineConfig::default()
        .with_max_steps(10)
        .with_tolerance_window(0, 1)
        .with_watchdog_interval(Duration::from_millis(20))
        .with_max_results(3);

    assert_eq!(config.bdhs.max_steps, 10);
    assert_eq!(config.bdhs.result_window(), 2);
    assert_eq!(config.bdhs.watchdog_interval(), Duration::from_millis(20));
    assert_eq!(SearchOptions::from_config(&config).max_results, 3);
}

#[test]
fn test_partial_file_keeps_defaults() {
    heapdbg_common::logging::ensure_test_logging(None);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("heapdbg.toml");
    fs::write(&path, "[bdhs]\nafter = 5\n\n[similarity]\ndepth = 6\n").unwrap();

    let config = EngineConfig::load_from(&path).unwrap();
    assert_eq!(config.bdhs.after, 5);
    assert_eq!(config.bdhs.before, 2);
    assert_eq!(config.bdhs.max_steps, 5000);
    assert_eq!(ObjectSimilarity::from_config(&config.similarity, false).depth, 6);
}

#[test]
fn test_config_clone() {
    heapdbg_common::logging::ensure_test_logging(None);
    info!("Running test");
    let config = EngineConfig::default().with_max_steps(1);

    let cloned = config.clone();

    assert_eq!(config, cloned);
    assert_eq!(cloned.bdhs.max_steps, 1);
}
