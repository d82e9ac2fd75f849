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


use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::{EdgeKind, HeapGraph, HeapNode, NodeKind, NodeValue};
use crate::format_js_number;

/// Default materialisation depth.
pub const DEFAULT_INSPECT_DEPTH: usize = 15;

/// Path of the inspected node itself.
const ROOT_PATH: &str = "root";

/// Element indices above this are dropped when building arrays.
const MAX_DENSE_INDEX: usize = 100_000;

/// Constructor name recorded for a nested object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "classType")]
pub struct ClassMeta {
    /// Accessor path from the inspected root, e.g. `root.user`
    pub field: String,
    /// Constructor name
    pub class: String,
}

/// A node materialised into a JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inspected {
    /// The materialised value
    pub object: Value,
    /// Constructor names of nested objects
    pub meta: Vec<ClassMeta>,
    /// Constructor name of the root, `Object` when generic
    pub class_name: String,
}

/// Materialise the subtree under node `index` up to `depth` levels.
///
/// Primitives become literals, nodes reached a second time become circular
/// labels and nodes beyond the depth cutoff become truncation labels.
pub fn inspect(graph: &HeapGraph, index: usize, depth: usize) -> Inspected {
    let mut walker = Walker { graph, seen: HashSet::new(), meta: Vec::new() };
    let object = match graph.node(index) {
        Some(node) => walker.walk(node, ROOT_PATH, depth),
        None => Value::Null,
    };

    let class_name = graph
        .node(index)
        .filter(|n| n.kind == NodeKind::Object)
        .and_then(|n| n.name.as_text())
        .filter(|name| !name.is_empty())
        .unwrap_or("Object")
        .to_string();

    Inspected { object, meta: walker.meta, class_name }
}

/// JSON rendering of a primitive node.
pub fn primitive_value(node: &HeapNode) -> Value {
    match &node.name {
        NodeValue::Bool(value) => Value::Bool(*value),
        NodeValue::Null | NodeValue::Undefined => Value::Null,
        NodeValue::Number(value) => number_value(*value),
        NodeValue::BigInt(value) => Value::String(format!("{value}n")),
        NodeValue::Text(text) => Value::String(text.clone()),
    }
}

fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(format_js_number(value)))
    }
}

/// Label used for a node that was already materialised.
pub fn circular_label(node: &HeapNode) -> String {
    let name = &node.name;
    match node.kind {
        NodeKind::Object => format!("[Circular Object:{name}]"),
        NodeKind::Array => "[Circular Array]".to_string(),
        NodeKind::String => format!("[Circular String:\"{name}\"]"),
        NodeKind::Number => format!("[Circular Number:{name}]"),
        NodeKind::RegExp => format!("[Circular RegExp:{name}]"),
        ref kind => format!("[Circular {kind}]"),
    }
}

struct Walker<'a> {
    graph: &'a HeapGraph,
    seen: HashSet<u64>,
    meta: Vec<ClassMeta>,
}

impl Walker<'_> {
    fn walk(&mut self, node: &HeapNode, path: &str, depth: usize) -> Value {
        if node.is_primitive() {
            return primitive_value(node);
        }
        if !self.seen.insert(node.id) {
            return Value::String(circular_label(node));
        }
        if depth == 0 {
            return Value::String(format!("[Max depth reached {}]", node.name));
        }
        if node.kind != NodeKind::Object {
            return Value::String(node.name.to_string());
        }

        if node.is_named("Array") {
            return self.walk_array(node, path, depth);
        }

        if let Some(class) = node.name.as_text().filter(|c| !c.is_empty() && *c != "Object") {
            if path != ROOT_PATH {
                self.meta.push(ClassMeta { field: path.to_string(), class: class.to_string() });
            }
        }

        let graph = self.graph;
        let mut map = Map::new();
        for edge in node.edges.iter().filter(|e| is_value_edge(&e.kind) && !e.name.is_empty()) {
            let child = graph.target(edge);
            let value = self.walk(child, &format!("{path}.{}", edge.name), depth - 1);
            map.insert(edge.name.clone(), value);
        }
        Value::Object(map)
    }

    fn walk_array(&mut self, node: &HeapNode, path: &str, depth: usize) -> Value {
        let graph = self.graph;
        let mut slots: Vec<(usize, Value)> = Vec::new();
        for edge in node.edges.iter().filter(|e| is_value_edge(&e.kind)) {
            let Ok(slot) = edge.name.parse::<usize>() else {
                continue;
            };
            if slot > MAX_DENSE_INDEX {
                continue;
            }
            let child = graph.target(edge);
            slots.push((slot, self.walk(child, &format!("{path}[{slot}]"), depth - 1)));
        }

        let len = slots.iter().map(|(slot, _)| slot + 1).max().unwrap_or(0);
        let mut items = vec![Value::Null; len];
        for (slot, value) in slots {
            items[slot] = value;
        }
        Value::Array(items)
    }
}

fn is_value_edge(kind: &EdgeKind) -> bool {
    matches!(kind, EdgeKind::Property | EdgeKind::Element)
}
