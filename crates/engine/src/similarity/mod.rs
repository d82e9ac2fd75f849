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


//! Graded structural similarity between two JSON values.
//!
//! Values are flattened into path-qualified tokens ([`tokenize`]) and compared
//! with a mix of set overlap ([`jaccard`]) and fuzzy key naming
//! ([`fuzzy_key_similarity`]). [`simhash64`] provides a 64-bit fingerprint for
//! cheap candidate filtering over large value sets.

mod score;
pub use score::*;

mod simhash;
pub use simhash::*;

mod tokens;
pub use tokens::*;

use itertools::Itertools;
use serde_json::Value;

use crate::SimilarityConfig;

/// Similarity engine with fixed tokenization settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectSimilarity {
    /// Maximum tokenization depth
    pub depth: usize,
    /// Shingle width used by fingerprints
    pub shingle_window: usize,
    /// How primitive leaves are rendered
    pub mode: TokenMode,
}

impl Default for ObjectSimilarity {
    fn default() -> Self {
        Self::from_config(&SimilarityConfig::default(), false)
    }
}

impl ObjectSimilarity {
    /// Build from configuration; `include_values` selects [`TokenMode::Values`].
    pub fn from_config(config: &SimilarityConfig, include_values: bool) -> Self {
        let mode = if include_values { TokenMode::Values } else { TokenMode::PrimitiveType };
        Self { depth: config.depth, shingle_window: config.shingle_window, mode }
    }

    /// Sorted tokens of `value`
    pub fn tokens(&self, value: &Value) -> Vec<String> {
        tokenize(value, self.depth, self.mode).into_iter().sorted().collect()
    }

    /// `alpha · jaccard + (1 - alpha) · fuzzy key similarity`
    pub fn hybrid(&self, a: &Value, b: &Value, alpha: f64) -> f64 {
        hybrid_similarity(&self.tokens(a), &self.tokens(b), alpha)
    }

    /// Pure token-set overlap
    pub fn jaccard(&self, a: &Value, b: &Value) -> f64 {
        jaccard(&self.tokens(a), &self.tokens(b))
    }

    /// 64-bit fingerprint of `value`
    pub fn simhash(&self, value: &Value) -> u64 {
        simhash64(&self.tokens(value), self.shingle_window)
    }
}
