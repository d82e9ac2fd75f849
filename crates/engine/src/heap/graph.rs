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


use std::fmt;

use num_bigint::BigInt;

use crate::{format_js_number, HeapError};

/// Type tag of a heap node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Engine-internal object
    Hidden,
    /// Internal array storage
    Array,
    /// Flat string
    String,
    /// JavaScript object
    Object,
    /// Compiled code
    Code,
    /// Function closure
    Closure,
    /// Regular expression
    RegExp,
    /// Boxed number
    Number,
    /// Native (embedder) object
    Native,
    /// Synthetic root
    Synthetic,
    /// Rope string
    ConcatenatedString,
    /// Substring view
    SlicedString,
    /// Symbol
    Symbol,
    /// Big integer
    BigInt,
    /// Hidden class / map
    ObjectShape,
    /// Any type name this decoder does not know
    Other(String),
}

impl NodeKind {
    /// Map a snapshot type name to a kind
    pub fn from_name(name: &str) -> Self {
        match name {
            "hidden" => Self::Hidden,
            "array" => Self::Array,
            "string" => Self::String,
            "object" => Self::Object,
            "code" => Self::Code,
            "closure" => Self::Closure,
            "regexp" => Self::RegExp,
            "number" => Self::Number,
            "native" => Self::Native,
            "synthetic" => Self::Synthetic,
            "concatenated string" => Self::ConcatenatedString,
            "sliced string" => Self::SlicedString,
            "symbol" => Self::Symbol,
            "bigint" => Self::BigInt,
            "object shape" => Self::ObjectShape,
            other => Self::Other(other.to_string()),
        }
    }

    /// The snapshot type name
    pub fn as_str(&self) -> &str {
        match self {
            Self::Hidden => "hidden",
            Self::Array => "array",
            Self::String => "string",
            Self::Object => "object",
            Self::Code => "code",
            Self::Closure => "closure",
            Self::RegExp => "regexp",
            Self::Number => "number",
            Self::Native => "native",
            Self::Synthetic => "synthetic",
            Self::ConcatenatedString => "concatenated string",
            Self::SlicedString => "sliced string",
            Self::Symbol => "symbol",
            Self::BigInt => "bigint",
            Self::ObjectShape => "object shape",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a heap edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Closure context variable
    Context,
    /// Indexed element
    Element,
    /// Named property
    Property,
    /// Engine-internal link
    Internal,
    /// Hidden link, addressed by index
    Hidden,
    /// Shortcut used by the snapshot generator
    Shortcut,
    /// Weak reference
    Weak,
    /// Any edge type this decoder does not know
    Other(String),
}

impl EdgeKind {
    /// Map a snapshot edge type name to a kind
    pub fn from_name(name: &str) -> Self {
        match name {
            "context" => Self::Context,
            "element" => Self::Element,
            "property" => Self::Property,
            "internal" => Self::Internal,
            "hidden" => Self::Hidden,
            "shortcut" => Self::Shortcut,
            "weak" => Self::Weak,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the edge name is an index rather than a string-table entry
    pub fn is_indexed(&self) -> bool {
        matches!(self, Self::Element | Self::Hidden)
    }
}

/// Name of a node, or its primitive value once recovered.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    /// Plain name (constructor name, string contents, code name...)
    Text(String),
    /// `true` / `false`
    Bool(bool),
    /// `null`
    Null,
    /// `undefined`
    Undefined,
    /// Recovered boxed number
    Number(f64),
    /// Recovered big integer
    BigInt(BigInt),
}

impl NodeValue {
    /// The text, if this is a plain name
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Whether this value is a literal rather than a name
    pub fn is_literal(&self) -> bool {
        !matches!(self, Self::Text(_))
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Null => f.write_str("null"),
            Self::Undefined => f.write_str("undefined"),
            Self::Number(value) => f.write_str(&format_js_number(*value)),
            Self::BigInt(value) => write!(f, "{value}"),
        }
    }
}

/// Outgoing edge of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapEdge {
    /// Edge kind
    pub kind: EdgeKind,
    /// Property name, or the index rendered as text for indexed edges
    pub name: String,
    /// Index of the target node
    pub to: usize,
}

/// A decoded heap node.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapNode {
    /// Position in the graph
    pub index: usize,
    /// Type tag
    pub kind: NodeKind,
    /// Name or recovered primitive
    pub name: NodeValue,
    /// Identifier that is stable across snapshots of the same heap
    pub id: u64,
    /// Shallow size in bytes
    pub self_size: u64,
    /// Outgoing edges in snapshot order
    pub edges: Vec<HeapEdge>,
}

impl HeapNode {
    /// Whether the node holds a primitive JavaScript value
    pub fn is_primitive(&self) -> bool {
        match self.kind {
            NodeKind::String
            | NodeKind::ConcatenatedString
            | NodeKind::SlicedString
            | NodeKind::Number
            | NodeKind::BigInt
            | NodeKind::Symbol => true,
            NodeKind::Hidden => self.name.is_literal(),
            _ => false,
        }
    }

    /// Whether the node's plain name equals `name`
    pub fn is_named(&self, name: &str) -> bool {
        self.name.as_text() == Some(name)
    }
}

/// An immutable decoded heap graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeapGraph {
    nodes: Vec<HeapNode>,
}

impl HeapGraph {
    /// Build a graph, checking that node indices are positional and every edge
    /// targets an existing node.
    pub fn new(nodes: Vec<HeapNode>) -> Result<Self, HeapError> {
        for (index, node) in nodes.iter().enumerate() {
            debug_assert_eq!(node.index, index);
            for (position, edge) in node.edges.iter().enumerate() {
                if edge.to >= nodes.len() {
                    return Err(HeapError::DanglingEdge {
                        node: index,
                        edge: position,
                        target: edge.to as u64,
                    });
                }
            }
        }
        Ok(Self { nodes })
    }

    /// Node at `index`
    pub fn node(&self, index: usize) -> Option<&HeapNode> {
        self.nodes.get(index)
    }

    /// All nodes in snapshot order
    pub fn nodes(&self) -> &[HeapNode] {
        &self.nodes
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total number of edges
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.edges.len()).sum()
    }

    /// Look a node up by its stable id
    pub fn find_by_id(&self, id: u64) -> Option<&HeapNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Target of an edge
    pub fn target(&self, edge: &HeapEdge) -> &HeapNode {
        // `new` guarantees every edge target exists
        &self.nodes[edge.to]
    }
}

/// Hand-assembled graphs for unit tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct GraphBuilder {
    nodes: Vec<HeapNode>,
}

#[cfg(test)]
impl GraphBuilder {
    pub(crate) fn node(&mut self, kind: NodeKind, name: &str) -> usize {
        self.value(kind, NodeValue::Text(name.to_string()))
    }

    pub(crate) fn value(&mut self, kind: NodeKind, name: NodeValue) -> usize {
        let index = self.nodes.len();
        self.nodes.push(HeapNode {
            index,
            kind,
            name,
            id: index as u64 * 2 + 1,
            self_size: 16,
            edges: Vec::new(),
        });
        index
    }

    pub(crate) fn edge(&mut self, from: usize, kind: EdgeKind, name: &str, to: usize) {
        self.nodes[from].edges.push(HeapEdge { kind, name: name.to_string(), to });
    }

    pub(crate) fn build(self) -> HeapGraph {
        HeapGraph::new(self.nodes).unwrap()
    }
}
