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


//! Search command - offline search over a heap snapshot file

use std::time::Instant;

use eyre::{Context, Result};
use heapdbg_engine::{scan, EngineConfig, RawSnapshot, SearchOptions};

use crate::SearchArgs;

/// Decode `args.snapshot`, run the query and print the [`heapdbg_engine::ScanResult`] as JSON
pub fn search_snapshot(args: &SearchArgs, config: &EngineConfig) -> Result<()> {
    let started = Instant::now();
    let raw = RawSnapshot::load(&args.snapshot)
        .with_context(|| format!("Failed to load snapshot {:?}", args.snapshot))?;
    let graph = raw.decode()?;
    tracing::info!(
        nodes = graph.len(),
        edges = graph.edge_count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Snapshot decoded"
    );

    let mut options = SearchOptions::from_config(config);
    if let Some(limit) = args.limit {
        options.max_results = limit;
    }
    if let Some(depth) = args.depth {
        options.inspect_depth = depth;
    }

    let result = scan(&graph, &args.query(), &options)?;
    tracing::info!(
        matches = result.results.len(),
        limit_reached = result.limit_reached,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Search complete"
    );

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
