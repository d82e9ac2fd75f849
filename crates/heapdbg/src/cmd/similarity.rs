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


//! Similarity and fingerprint commands

use std::{fs, path::Path};

use eyre::{Context, Result};
use heapdbg_engine::{
    fuzzy_key_similarity, hybrid_similarity, jaccard, similarity_simhash, simhash64, EngineConfig,
    ObjectSimilarity,
};
use serde_json::{json, Value};

fn read_json(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    serde_json::from_str(&text).with_context(|| format!("{path:?} is not valid JSON"))
}

/// Print every similarity measure between two JSON files
pub fn compare_values(
    a: &Path,
    b: &Path,
    alpha: Option<f64>,
    include_values: bool,
    config: &EngineConfig,
) -> Result<()> {
    let similarity = ObjectSimilarity::from_config(&config.similarity, include_values);
    let alpha = alpha.unwrap_or(config.similarity.alpha);
    if !(0.0..=1.0).contains(&alpha) {
        eyre::bail!("alpha must be between 0 and 1, got {alpha}");
    }

    let left = similarity.tokens(&read_json(a)?);
    let right = similarity.tokens(&read_json(b)?);
    tracing::debug!(left = left.len(), right = right.len(), "Tokenized values");

    let window = similarity.shingle_window;
    let report = json!({
        "alpha": alpha,
        "jaccard": jaccard(&left, &right),
        "fuzzy": fuzzy_key_similarity(&left, &right),
        "hybrid": hybrid_similarity(&left, &right, alpha),
        "simhash": similarity_simhash(simhash64(&left, window), simhash64(&right, window)),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Print the 64-bit fingerprint of a JSON file as 16 hex digits
pub fn fingerprint_value(path: &Path, include_values: bool, config: &EngineConfig) -> Result<()> {
    let similarity = ObjectSimilarity::from_config(&config.similarity, include_values);
    let value = read_json(path)?;
    println!("{:016x}", similarity.simhash(&value));
    Ok(())
}
