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


use heapdbg_common::{CompiledQuery, SearchQuery};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{
    build_path, inspect, ClassMeta, EdgeKind, HeapError, HeapGraph, HeapNode, Inspected, NodeKind,
    ReverseIndex,
};
use crate::{EngineConfig, ObjectSimilarity, SimilarityConfig};

/// Limits applied by a heap search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    /// Materialisation depth for class and similarity checks
    pub inspect_depth: usize,
    /// Maximum number of matches before the search stops
    pub max_results: usize,
    /// Tokenisation settings of the similarity gate
    pub similarity: SimilarityConfig,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl SearchOptions {
    /// Limits taken from the engine configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            inspect_depth: config.heap.inspect_depth,
            max_results: config.heap.max_results,
            similarity: config.similarity.clone(),
        }
    }
}

/// A node accepted by [`search_nodes`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchMatch {
    /// Index of the matching node
    pub index: usize,
    /// Materialised value, when the filters needed it
    pub inspected: Option<Inspected>,
    /// Similarity score, when the similarity gate is active
    pub similarity: Option<f64>,
}

/// Matches of one pass over the graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSearch {
    /// Accepted nodes in graph order
    pub matches: Vec<SearchMatch>,
    /// The result cap stopped the pass early
    pub limit_reached: bool,
}

fn is_string(node: &HeapNode) -> bool {
    matches!(node.kind, NodeKind::String | NodeKind::ConcatenatedString | NodeKind::SlicedString)
}

/// Filter every node of `graph` against `query`.
///
/// String nodes are tested against the value filter only. Objects must pass
/// each enabled filter: the class filter on their constructor name, the
/// property filter on one of their property names and the value filter on one
/// of their primitive property values. When a similarity sub-query is present
/// the materialised object must also score at least the threshold.
pub fn search_nodes(
    graph: &HeapGraph,
    query: &CompiledQuery,
    options: &SearchOptions,
) -> NodeSearch {
    let similarity = query.similarity.as_ref().map(|sim| {
        (sim, ObjectSimilarity::from_config(&options.similarity, sim.include_values))
    });

    let mut search = NodeSearch::default();
    for node in graph.nodes() {
        if search.matches.len() >= options.max_results {
            search.limit_reached = true;
            break;
        }

        if is_string(node) {
            if let Some(filter) = &query.value {
                let text = node.name.as_text().unwrap_or_default();
                if !text.is_empty() && filter.matches(text) {
                    search.matches.push(SearchMatch {
                        index: node.index,
                        inspected: None,
                        similarity: None,
                    });
                }
            }
            continue;
        }
        if node.kind != NodeKind::Object {
            continue;
        }

        let mut inspected = None;
        if query.class.is_some() {
            let materialised = inspect(graph, node.index, options.inspect_depth);
            if !query.class_passes(&materialised.class_name) {
                continue;
            }
            inspected = Some(materialised);
        }

        if !owns_matching_property(graph, node, query) {
            continue;
        }

        let mut score = None;
        if let Some((sim, engine)) = &similarity {
            let materialised =
                inspected.get_or_insert_with(|| inspect(graph, node.index, options.inspect_depth));
            let value = engine.hybrid(&materialised.object, &sim.reference, sim.alpha);
            if value < sim.threshold {
                continue;
            }
            score = Some(value);
        }

        search.matches.push(SearchMatch { index: node.index, inspected, similarity: score });
    }

    debug!(
        matches = search.matches.len(),
        limit_reached = search.limit_reached,
        "Heap search finished"
    );
    search
}

fn owns_matching_property(graph: &HeapGraph, node: &HeapNode, query: &CompiledQuery) -> bool {
    let mut key_match = query.property.is_none();
    let mut value_match = query.value.is_none();

    let named = node
        .edges
        .iter()
        .filter(|e| matches!(e.kind, EdgeKind::Property | EdgeKind::Element));
    for edge in named {
        if key_match && value_match {
            break;
        }
        if !key_match && !edge.name.is_empty() && query.property_passes(&edge.name) {
            key_match = true;
        }
        if !value_match {
            let child = graph.target(edge);
            if child.is_primitive() && query.value_passes(&child.name.to_string()) {
                value_match = true;
            }
        }
    }

    key_match && value_match
}

/// One match with its accessor path and materialised value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    /// Index of the node in the graph
    pub node_index: usize,
    /// Stable node id
    pub node_id: u64,
    /// Snapshot type name of the node
    pub node_type: String,
    /// Accessor path from a root, if one is reachable
    pub path: Option<String>,
    /// Materialised value
    pub object: Value,
    /// Constructor name
    pub class_name: String,
    /// Constructor names of nested objects
    pub meta: Vec<ClassMeta>,
    /// Similarity score against the reference, when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

impl ScanEntry {
    /// Identity used to compare results across steps
    pub fn key(&self) -> (Option<&str>, &Value) {
        (self.path.as_deref(), &self.object)
    }
}

/// Outcome of one heap pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    /// Matches in graph order
    pub results: Vec<ScanEntry>,
    /// The result cap stopped the pass early
    pub limit_reached: bool,
    /// Number of nodes in the searched graph
    pub total_nodes: usize,
}

impl ScanResult {
    /// Whether nothing matched
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Validate `query`, search `graph` and reconstruct a path for every match.
pub fn scan(
    graph: &HeapGraph,
    query: &SearchQuery,
    options: &SearchOptions,
) -> Result<ScanResult, HeapError> {
    let compiled = query.compile()?;
    Ok(scan_compiled(graph, &compiled, options))
}

/// [`scan`] with an already validated query.
pub fn scan_compiled(
    graph: &HeapGraph,
    query: &CompiledQuery,
    options: &SearchOptions,
) -> ScanResult {
    let search = search_nodes(graph, query, options);
    if search.matches.is_empty() {
        return ScanResult { results: Vec::new(), limit_reached: false, total_nodes: graph.len() };
    }

    let reverse = ReverseIndex::build(graph);
    let results = search
        .matches
        .into_iter()
        .filter_map(|found| {
            let node = graph.node(found.index)?;
            let inspected = found
                .inspected
                .unwrap_or_else(|| inspect(graph, found.index, options.inspect_depth));
            Some(ScanEntry {
                node_index: found.index,
                node_id: node.id,
                node_type: node.kind.to_string(),
                path: build_path(graph, &reverse, found.index),
                object: inspected.object,
                class_name: inspected.class_name,
                meta: inspected.meta,
                similarity: found.similarity,
            })
        })
        .collect();

    ScanResult { results, limit_reached: search.limit_reached, total_nodes: graph.len() }
}
