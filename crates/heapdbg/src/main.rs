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


//! heapdbg - Heap origin debugger
//!
//! Offline tools over heap snapshots and JSON values: snapshot search,
//! similarity scoring, fingerprinting and configuration management.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use eyre::Result;
use heapdbg_common::{MatchOptions, SearchQuery, TextFilter};
use heapdbg_engine::EngineConfig;

mod cmd;

/// Command-line interface for heapdbg
#[derive(Debug, Parser)]
#[command(name = "heapdbg")]
#[command(about = "Heap origin debugger - search heap snapshots and find where values come from")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ~/.heapdbg.toml)
    #[arg(long, global = true, env = "HEAPDBG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also write logs to the temporary directory
    #[arg(long, global = true)]
    pub log_file: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Search a heap snapshot file and print the matches as JSON
    Search(SearchArgs),
    /// Compare two JSON values
    Similarity {
        /// First JSON file
        a: PathBuf,
        /// Second JSON file
        b: PathBuf,
        /// Weight of structural overlap against key naming (default from config)
        #[arg(long)]
        alpha: Option<f64>,
        /// Compare primitive values verbatim instead of by type
        #[arg(long)]
        include_values: bool,
    },
    /// Print the 64-bit structural fingerprint of a JSON value
    Fingerprint {
        /// JSON file
        value: PathBuf,
        /// Fingerprint primitive values verbatim instead of by type
        #[arg(long)]
        include_values: bool,
    },
    /// Show the configuration, or create the configuration file
    Config {
        /// Write the default configuration if the file does not exist
        #[arg(long)]
        init: bool,
    },
}

/// Arguments of the `search` command
#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Heap snapshot file (.heapsnapshot)
    pub snapshot: PathBuf,

    /// Property name filter
    #[arg(long)]
    pub property: Option<String>,

    /// Primitive value filter
    #[arg(long)]
    pub value: Option<String>,

    /// Constructor name filter
    #[arg(long = "class")]
    pub class_name: Option<String>,

    /// Treat filters as regular expressions
    #[arg(long)]
    pub regex: bool,

    /// Case-sensitive matching
    #[arg(long)]
    pub match_case: bool,

    /// Filters must match the whole text
    #[arg(long)]
    pub exact: bool,

    /// Reference JSON value for similarity matching
    #[arg(long, value_name = "JSON")]
    pub like: Option<String>,

    /// Minimum similarity score
    #[arg(long, requires = "like")]
    pub threshold: Option<f64>,

    /// Weight of structural overlap against key naming
    #[arg(long, requires = "like")]
    pub alpha: Option<f64>,

    /// Compare primitive values verbatim instead of by type
    #[arg(long, requires = "like")]
    pub include_values: bool,

    /// Maximum number of results (default from config)
    #[arg(long)]
    pub limit: Option<usize>,

    /// Depth of the materialised objects (default from config)
    #[arg(long)]
    pub depth: Option<usize>,
}

impl SearchArgs {
    /// The query described by the flags
    pub fn query(&self) -> SearchQuery {
        let options = MatchOptions {
            match_case: self.match_case,
            use_regexp: self.regex,
            exact_match: self.exact,
        };
        let filter = |pattern: &Option<String>| {
            pattern.as_ref().map(|pattern| TextFilter::new(pattern.clone(), options))
        };

        SearchQuery {
            property_search: filter(&self.property),
            value_search: filter(&self.value),
            class_search: filter(&self.class_name),
            os_enabled: self.like.is_some(),
            os_object: self.like.clone(),
            os_threshold: self.threshold,
            os_alpha: self.alpha,
            os_include_values: self.include_values,
        }
    }
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => EngineConfig::load_from(path),
            None => EngineConfig::load(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    heapdbg_common::logging::init_logging("heapdbg", cli.log_file)?;

    match &cli.command {
        Commands::Search(args) => {
            let config = cli.engine_config()?;
            cmd::search_snapshot(args, &config)
        }
        Commands::Similarity { a, b, alpha, include_values } => {
            let config = cli.engine_config()?;
            cmd::compare_values(a, b, *alpha, *include_values, &config)
        }
        Commands::Fingerprint { value, include_values } => {
            let config = cli.engine_config()?;
            cmd::fingerprint_value(value, *include_values, &config)
        }
        Commands::Config { init } => cmd::show_config(cli.config.as_deref(), *init),
    }
}
