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


//! Heap graph model.
//!
//! A raw snapshot (captured over the protocol or read from a `.heapsnapshot`
//! file) is decoded into a [`HeapGraph`]. On top of the graph sit value
//! materialisation ([`inspect`]), accessor-path reconstruction
//! ([`build_path`]) and filtered search ([`scan`]). Live searches run the
//! same filters inside the target through a [`ProbeEvaluator`].

mod graph;
pub use graph::*;

mod inspect;
pub use inspect::*;

mod live;
pub use live::*;

mod path;
pub use path::*;

mod search;
pub use search::*;

mod snapshot;
pub use snapshot::*;

use heapdbg_common::QueryError;
use thiserror::Error;

use crate::ProtocolError;

/// Errors raised while capturing, decoding or searching a heap.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The snapshot metadata lacks a required field
    #[error("snapshot meta.{table} lacks the `{field}` field")]
    MissingField {
        /// `node_fields` or `edge_fields`
        table: &'static str,
        /// Missing field name
        field: &'static str,
    },
    /// The first entry of a type table is not a list of names
    #[error("snapshot meta.{table} has no type name list")]
    InvalidTypeTable {
        /// `node_types` or `edge_types`
        table: &'static str,
    },
    /// The node array is not a whole number of records
    #[error("node array length {len} is not a multiple of the node width {width}")]
    MisalignedNodes {
        /// Length of the node array
        len: usize,
        /// Fields per node
        width: usize,
    },
    /// The edge array does not hold exactly the edges the nodes declare
    #[error("edge array holds {actual} values, node records declare {expected}")]
    EdgeArrayMismatch {
        /// Values expected from the edge counts
        expected: usize,
        /// Values present
        actual: usize,
    },
    /// An edge target is not the start of a node record
    #[error("edge {edge} of node {node} points at offset {offset}, which is not a node boundary")]
    MisalignedEdge {
        /// Source node index
        node: usize,
        /// Edge position within the node
        edge: usize,
        /// Offending offset in the node array
        offset: u64,
    },
    /// An edge target is outside the node array
    #[error("edge {edge} of node {node} points at missing node {target}")]
    DanglingEdge {
        /// Source node index
        node: usize,
        /// Edge position within the node
        edge: usize,
        /// Offending target index
        target: u64,
    },
    /// A type index is outside its table
    #[error("type index {index} is outside meta.{table}")]
    InvalidTypeIndex {
        /// `node_types` or `edge_types`
        table: &'static str,
        /// Offending index
        index: u64,
    },
    /// A string index is outside the string table
    #[error("string index {0} is outside the string table")]
    InvalidStringIndex(u64),
    /// Snapshot chunks were dropped by a lagging event receiver
    #[error("{0} snapshot chunks were lost")]
    ChunksLost(u64),
    /// A live probe failed or returned malformed data
    #[error("live probe failed: {0}")]
    Probe(String),
    /// A by-root live search was given an empty root expression
    #[error("root expression is empty")]
    EmptyRoot,
    /// The name is not a valid JavaScript identifier
    #[error("invalid variable name: {0:?}")]
    InvalidVariableName(String),
    /// The search query was rejected
    #[error(transparent)]
    Query(#[from] QueryError),
    /// A protocol round-trip failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Malformed snapshot JSON
    #[error("malformed snapshot: {0}")]
    Json(#[from] serde_json::Error),
    /// Snapshot file could not be read
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
