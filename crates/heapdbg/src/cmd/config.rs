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


//! Config command - show or create the configuration file

use std::path::{Path, PathBuf};

use eyre::Result;
use heapdbg_engine::EngineConfig;

/// Print the effective configuration as TOML.
///
/// With `init`, the default configuration is written first unless the file
/// already exists.
pub fn show_config(path: Option<&Path>, init: bool) -> Result<()> {
    let path: PathBuf = match path {
        Some(path) => path.to_path_buf(),
        None => EngineConfig::config_path()?,
    };

    if init {
        if path.exists() {
            tracing::info!("Config file already exists at {:?}", path);
        } else {
            EngineConfig::default().save_to(&path)?;
            tracing::info!("Created default config at {:?}", path);
        }
    }

    let config =
        if path.exists() { EngineConfig::load_from(&path)? } else { EngineConfig::default() };
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
