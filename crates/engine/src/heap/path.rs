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


//! Accessor-path reconstruction.
//!
//! Paths are found by walking the reverse edge index from a node towards a
//! root: the global object (`window`, `globalThis`) or a lexical scope
//! (`<lexical NAME>`). The first root found by the depth-first walk wins.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{EdgeKind, HeapGraph, HeapNode, NodeKind, NodeValue};

/// Edges that link objects to their machinery rather than their data.
const LINKAGE_EDGES: &[&str] = &["__proto__", "constructor", "prototype", "context", "extension"];

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z_$][0-9a-zA-Z_$]*$").unwrap());

static LEXICAL_ROOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"Script|Context|Module").unwrap());

/// Whether `name` can be written as `.name`
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// One incoming edge of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct ReverseEdge {
    /// Source node index
    pub from: usize,
    /// Edge name
    pub name: String,
    /// Edge kind
    pub kind: EdgeKind,
}

/// For every node, the edges pointing at it.
#[derive(Debug, Clone, Default)]
pub struct ReverseIndex {
    parents: Vec<Vec<ReverseEdge>>,
}

impl ReverseIndex {
    /// Index every edge of `graph` by its target
    pub fn build(graph: &HeapGraph) -> Self {
        let mut parents = vec![Vec::new(); graph.len()];
        for node in graph.nodes() {
            for edge in &node.edges {
                parents[edge.to].push(ReverseEdge {
                    from: node.index,
                    name: edge.name.clone(),
                    kind: edge.kind.clone(),
                });
            }
        }
        Self { parents }
    }

    /// Edges pointing at `index`
    pub fn parents(&self, index: usize) -> &[ReverseEdge] {
        self.parents.get(index).map_or(&[], Vec::as_slice)
    }
}

/// Root expression for `node`, if it is a root.
pub fn root_label(node: &HeapNode) -> Option<String> {
    let name = node.name.as_text()?;
    match node.kind {
        NodeKind::Object if name == "Window" || name.starts_with("Window /") => {
            Some("window".to_string())
        }
        NodeKind::Object if name == "global" => Some("globalThis".to_string()),
        NodeKind::Closure => Some(format!("<lexical {name}>")),
        NodeKind::Object if LEXICAL_ROOT.is_match(name) => Some(format!("<lexical {name}>")),
        _ => None,
    }
}

/// Path segment contributed by an edge.
pub fn edge_segment(edge: &ReverseEdge) -> String {
    if LINKAGE_EDGES.contains(&edge.name.as_str()) {
        return String::new();
    }
    match edge.kind {
        EdgeKind::Property if is_identifier(&edge.name) => format!(".{}", edge.name),
        EdgeKind::Property => format!("[{}]", quote(&edge.name)),
        EdgeKind::Element => format!("[{}]", edge.name),
        _ => String::new(),
    }
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{text}\""))
}

/// `.get(key)` when `table` is the hash table of a `Map` entered through a
/// value slot.
///
/// Entries are stored as consecutive slots, so the key of value slot `n` sits
/// in slot `n - 1`.
fn map_lookup(
    graph: &HeapGraph,
    table: &HeapNode,
    parent: &ReverseEdge,
    came_from: Option<&ReverseEdge>,
) -> Option<String> {
    let came_from = came_from?;
    let owner = graph.node(parent.from)?;
    let is_table = owner.is_named("Map")
        && table.kind == NodeKind::Array
        && parent.kind == EdgeKind::Internal
        && parent.name == "table";
    if !is_table || !is_slot(&came_from.kind) {
        return None;
    }

    let value_slot: usize = came_from.name.parse().ok()?;
    let key_slot = value_slot.checked_sub(1)?.to_string();
    let key_edge = table.edges.iter().find(|e| is_slot(&e.kind) && e.name == key_slot)?;
    Some(format!(".get({})", key_literal(graph.target(key_edge))))
}

fn is_slot(kind: &EdgeKind) -> bool {
    matches!(kind, EdgeKind::Internal | EdgeKind::Element | EdgeKind::Hidden)
}

fn key_literal(key: &HeapNode) -> String {
    match (&key.kind, &key.name) {
        (NodeKind::String, NodeValue::Text(text)) => quote(text),
        (_, NodeValue::Text(_)) => "/*unknownKey*/".to_string(),
        (_, literal) => literal.to_string(),
    }
}

struct Frame<'a> {
    index: usize,
    came_from: Option<&'a ReverseEdge>,
    next: usize,
}

/// Reconstruct an accessor expression leading from a root to node `target`.
///
/// Returns `None` when no root is reachable.
pub fn build_path(graph: &HeapGraph, reverse: &ReverseIndex, target: usize) -> Option<String> {
    let node = graph.node(target)?;
    if let Some(label) = root_label(node) {
        return Some(label);
    }

    let mut visited: HashSet<u64> = HashSet::from([node.id]);
    // segments[i] is the segment of the edge entering stack[i].
    let mut segments: Vec<String> = Vec::new();
    let mut stack = vec![Frame { index: target, came_from: None, next: 0 }];

    while let Some(frame) = stack.last_mut() {
        let parents = reverse.parents(frame.index);
        let Some(parent) = parents.get(frame.next) else {
            stack.pop();
            segments.pop();
            continue;
        };
        frame.next += 1;

        let current = graph.node(frame.index)?;
        let came_from = frame.came_from;
        let source = graph.node(parent.from)?;
        if !visited.insert(source.id) {
            continue;
        }

        let mut segment = edge_segment(parent);
        if let Some(lookup) = map_lookup(graph, current, parent, came_from) {
            segment.push_str(&lookup);
        }

        if let Some(label) = root_label(source) {
            let mut path = label;
            path.push_str(&segment);
            for segment in segments.iter().rev() {
                path.push_str(segment);
            }
            return Some(path);
        }

        segments.push(segment);
        stack.push(Frame { index: parent.from, came_from: Some(parent), next: 0 });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GraphBuilder;

    fn path_of(graph: &HeapGraph, target: usize) -> Option<String> {
        build_path(graph, &ReverseIndex::build(graph), target)
    }

    #[test]
    fn test_property_path() {
        let mut b = GraphBuilder::default();
        let window = b.node(NodeKind::Object, "Window");
        let foo = b.node(NodeKind::Object, "Object");
        let value = b.node(NodeKind::String, "top-level testValue");
        b.edge(window, EdgeKind::Property, "foo", foo);
        b.edge(foo, EdgeKind::Property, "testKeyTop", value);
        let graph = b.build();

        assert_eq!(path_of(&graph, value).as_deref(), Some("window.foo.testKeyTop"));
        assert_eq!(path_of(&graph, window).as_deref(), Some("window"));
    }

    #[test]
    fn test_element_and_quoted_property() {
        let mut b = GraphBuilder::default();
        let global = b.node(NodeKind::Object, "global");
        let list = b.node(NodeKind::Object, "Array");
        let item = b.node(NodeKind::Object, "Object");
        let value = b.node(NodeKind::String, "v");
        b.edge(global, EdgeKind::Property, "list", list);
        b.edge(list, EdgeKind::Element, "2", item);
        b.edge(item, EdgeKind::Property, "my-key", value);
        let graph = b.build();

        assert_eq!(path_of(&graph, value).as_deref(), Some("globalThis.list[2][\"my-key\"]"));
    }

    #[test]
    fn test_linkage_and_internal_edges_are_silent() {
        let mut b = GraphBuilder::default();
        let window = b.node(NodeKind::Object, "Window / https://app.test");
        let obj = b.node(NodeKind::Object, "Widget");
        let proto = b.node(NodeKind::Object, "Object");
        let store = b.node(NodeKind::Array, "(object properties)");
        let value = b.node(NodeKind::Object, "Object");
        b.edge(window, EdgeKind::Property, "widget", obj);
        b.edge(obj, EdgeKind::Property, "__proto__", proto);
        b.edge(proto, EdgeKind::Internal, "properties", store);
        b.edge(store, EdgeKind::Property, "shared", value);
        let graph = b.build();

        assert_eq!(path_of(&graph, value).as_deref(), Some("window.widget.shared"));
    }

    #[test]
    fn test_lexical_roots() {
        let mut b = GraphBuilder::default();
        let closure = b.node(NodeKind::Closure, "init");
        let context = b.node(NodeKind::Object, "system / Context");
        let value = b.node(NodeKind::Object, "Object");
        b.edge(closure, EdgeKind::Internal, "context", context);
        b.edge(context, EdgeKind::Context, "state", value);
        let graph = b.build();

        assert_eq!(path_of(&graph, value).as_deref(), Some("<lexical system / Context>"));
    }

    #[test]
    fn test_unreachable_node() {
        let mut b = GraphBuilder::default();
        let orphan_parent = b.node(NodeKind::Object, "Object");
        let orphan = b.node(NodeKind::Object, "Object");
        b.edge(orphan_parent, EdgeKind::Property, "x", orphan);
        b.edge(orphan, EdgeKind::Property, "back", orphan_parent);
        let graph = b.build();

        assert_eq!(path_of(&graph, orphan), None);
    }

    #[test]
    fn test_dead_end_branch_backtracks() {
        let mut b = GraphBuilder::default();
        let window = b.node(NodeKind::Object, "Window");
        let dead = b.node(NodeKind::Object, "Object");
        let live = b.node(NodeKind::Object, "Object");
        let value = b.node(NodeKind::String, "v");
        b.edge(dead, EdgeKind::Property, "deadEnd", value);
        b.edge(window, EdgeKind::Property, "live", live);
        b.edge(live, EdgeKind::Property, "kept", value);
        let graph = b.build();

        assert_eq!(path_of(&graph, value).as_deref(), Some("window.live.kept"));
    }

    #[test]
    fn test_map_entry_path() {
        let mut b = GraphBuilder::default();
        let window = b.node(NodeKind::Object, "Window");
        let map = b.node(NodeKind::Object, "Map");
        let table = b.node(NodeKind::Array, "(object elements)");
        let key = b.node(NodeKind::String, "session");
        let value = b.node(NodeKind::Object, "Object");
        b.edge(window, EdgeKind::Property, "cache", map);
        b.edge(map, EdgeKind::Internal, "table", table);
        b.edge(table, EdgeKind::Internal, "5", key);
        b.edge(table, EdgeKind::Internal, "6", value);
        let graph = b.build();

        assert_eq!(path_of(&graph, value).as_deref(), Some("window.cache.get(\"session\")"));
    }

    #[test]
    fn test_map_entry_numeric_key() {
        let mut b = GraphBuilder::default();
        let window = b.node(NodeKind::Object, "Window");
        let map = b.node(NodeKind::Object, "Map");
        let table = b.node(NodeKind::Array, "(object elements)");
        let key = b.value(NodeKind::Number, NodeValue::Number(7.0));
        let value = b.node(NodeKind::Object, "Object");
        b.edge(window, EdgeKind::Property, "byId", map);
        b.edge(map, EdgeKind::Internal, "table", table);
        b.edge(table, EdgeKind::Internal, "8", key);
        b.edge(table, EdgeKind::Internal, "9", value);
        let graph = b.build();

        assert_eq!(path_of(&graph, value).as_deref(), Some("window.byId.get(7)"));
    }
}
