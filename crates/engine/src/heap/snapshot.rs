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


//! Raw snapshot wire format, decoding and capture.

use std::{fs::File, io::BufReader, path::Path, str::FromStr};

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info};

use super::{EdgeKind, HeapEdge, HeapError, HeapGraph, HeapNode, NodeKind, NodeValue};
use crate::{ProtocolClient, ProtocolEvent};

const CHUNK_EVENT: &str = "HeapProfiler.addHeapSnapshotChunk";

/// A heap snapshot exactly as the profiler serialises it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    /// Header with the field layout
    pub snapshot: SnapshotHeader,
    /// Flattened node records
    pub nodes: Vec<u64>,
    /// Flattened edge records
    pub edges: Vec<u64>,
    /// String table
    pub strings: Vec<String>,
}

/// Snapshot header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Field layout
    pub meta: SnapshotMeta,
    /// Declared node count
    #[serde(default)]
    pub node_count: usize,
    /// Declared edge count
    #[serde(default)]
    pub edge_count: usize,
}

/// Record layout of nodes and edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Names of the fields of one node record
    pub node_fields: Vec<String>,
    /// Per-field type descriptions; the entry of the `type` field is the list of type names
    pub node_types: Vec<Value>,
    /// Names of the fields of one edge record
    pub edge_fields: Vec<String>,
    /// Per-field type descriptions; the entry of the `type` field is the list of type names
    pub edge_types: Vec<Value>,
}

impl RawSnapshot {
    /// Parse snapshot JSON
    pub fn from_json(text: &str) -> Result<Self, HeapError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read a `.heapsnapshot` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HeapError> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Decode into a [`HeapGraph`]
    pub fn decode(&self) -> Result<HeapGraph, HeapError> {
        decode_snapshot(self)
    }
}

fn field_position(
    fields: &[String],
    table: &'static str,
    field: &'static str,
) -> Result<usize, HeapError> {
    fields.iter().position(|f| f == field).ok_or(HeapError::MissingField { table, field })
}

fn type_names(
    types: &[Value],
    position: usize,
    table: &'static str,
) -> Result<Vec<String>, HeapError> {
    types
        .get(position)
        .and_then(Value::as_array)
        .and_then(|names| names.iter().map(|n| n.as_str().map(str::to_string)).collect())
        .ok_or(HeapError::InvalidTypeTable { table })
}

fn lookup<'a>(
    names: &'a [String],
    index: u64,
    table: &'static str,
) -> Result<&'a str, HeapError> {
    names
        .get(index as usize)
        .map(String::as_str)
        .ok_or(HeapError::InvalidTypeIndex { table, index })
}

fn string_at(strings: &[String], index: u64) -> Result<&str, HeapError> {
    strings.get(index as usize).map(String::as_str).ok_or(HeapError::InvalidStringIndex(index))
}

/// Decode a raw snapshot into a [`HeapGraph`].
///
/// Hidden nodes named `true`, `false`, `null` or `undefined` become literals and
/// boxed numbers and big integers recover their value from their `value` edge.
pub fn decode_snapshot(raw: &RawSnapshot) -> Result<HeapGraph, HeapError> {
    let meta = &raw.snapshot.meta;

    let node_width = meta.node_fields.len();
    let type_pos = field_position(&meta.node_fields, "node_fields", "type")?;
    let name_pos = field_position(&meta.node_fields, "node_fields", "name")?;
    let id_pos = field_position(&meta.node_fields, "node_fields", "id")?;
    let edge_count_pos = field_position(&meta.node_fields, "node_fields", "edge_count")?;
    let self_size_pos = meta.node_fields.iter().position(|f| f == "self_size");
    let node_types = type_names(&meta.node_types, type_pos, "node_types")?;

    let edge_width = meta.edge_fields.len();
    let edge_type_pos = field_position(&meta.edge_fields, "edge_fields", "type")?;
    let edge_name_pos = field_position(&meta.edge_fields, "edge_fields", "name_or_index")?;
    let to_pos = field_position(&meta.edge_fields, "edge_fields", "to_node")?;
    let edge_types = type_names(&meta.edge_types, edge_type_pos, "edge_types")?;

    if raw.nodes.len() % node_width != 0 {
        return Err(HeapError::MisalignedNodes { len: raw.nodes.len(), width: node_width });
    }
    let records: Vec<&[u64]> = raw.nodes.chunks_exact(node_width).collect();
    let node_count = records.len();

    let declared: u64 = records.iter().map(|r| r[edge_count_pos]).sum();
    let expected = declared as usize * edge_width;
    if raw.edges.len() != expected {
        return Err(HeapError::EdgeArrayMismatch { expected, actual: raw.edges.len() });
    }

    let mut nodes = Vec::with_capacity(node_count);
    let mut edge_records = raw.edges.chunks_exact(edge_width);
    for (index, record) in records.iter().enumerate() {
        let kind = NodeKind::from_name(lookup(&node_types, record[type_pos], "node_types")?);
        let text = string_at(&raw.strings, record[name_pos])?;
        let name = match (&kind, text) {
            (NodeKind::Hidden, "true") => NodeValue::Bool(true),
            (NodeKind::Hidden, "false") => NodeValue::Bool(false),
            (NodeKind::Hidden, "null") => NodeValue::Null,
            (NodeKind::Hidden, "undefined") => NodeValue::Undefined,
            _ => NodeValue::Text(text.to_string()),
        };

        let edge_count = record[edge_count_pos] as usize;
        let mut edges = Vec::with_capacity(edge_count);
        for (position, edge) in edge_records.by_ref().take(edge_count).enumerate() {
            let edge_kind =
                EdgeKind::from_name(lookup(&edge_types, edge[edge_type_pos], "edge_types")?);
            let raw_name = edge[edge_name_pos];
            let edge_name = if edge_kind.is_indexed() {
                raw_name.to_string()
            } else {
                string_at(&raw.strings, raw_name)?.to_string()
            };

            let offset = edge[to_pos];
            if offset % node_width as u64 != 0 {
                return Err(HeapError::MisalignedEdge { node: index, edge: position, offset });
            }
            let target = offset / node_width as u64;
            if target >= node_count as u64 {
                return Err(HeapError::DanglingEdge { node: index, edge: position, target });
            }
            edges.push(HeapEdge { kind: edge_kind, name: edge_name, to: target as usize });
        }

        nodes.push(HeapNode {
            index,
            kind,
            name,
            id: record[id_pos],
            self_size: self_size_pos.map_or(0, |p| record[p]),
            edges,
        });
    }

    recover_boxed_values(&mut nodes);
    debug!(nodes = nodes.len(), edges = declared, "Decoded heap snapshot");
    HeapGraph::new(nodes)
}

/// Replace the names of boxed numbers and big integers with their values.
fn recover_boxed_values(nodes: &mut [HeapNode]) {
    let updates: Vec<(usize, NodeValue)> = nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Number | NodeKind::BigInt))
        .filter_map(|node| {
            let edge = node
                .edges
                .iter()
                .find(|e| {
                    e.name == "value" && matches!(e.kind, EdgeKind::Internal | EdgeKind::Shortcut)
                })
                .or_else(|| node.edges.iter().find(|e| e.name == "value"))?;
            let target = &nodes[edge.to];
            if target.kind != NodeKind::String {
                return None;
            }
            let text = target.name.as_text()?;
            let value = if node.kind == NodeKind::Number {
                parse_number(text)
            } else {
                parse_bigint(text)
            };
            Some((node.index, value))
        })
        .collect();

    for (index, value) in updates {
        nodes[index].name = value;
    }
}

fn parse_number(text: &str) -> NodeValue {
    match text.trim() {
        "NaN" => NodeValue::Number(f64::NAN),
        "Infinity" => NodeValue::Number(f64::INFINITY),
        "-Infinity" => NodeValue::Number(f64::NEG_INFINITY),
        "" => NodeValue::Number(0.0),
        // Rust also accepts `inf` and `nan` spellings that are not JavaScript numbers.
        trimmed if trimmed.trim_start_matches(['+', '-']).starts_with(char::is_alphabetic) => {
            NodeValue::Undefined
        }
        // Out-of-range literals saturate to infinity.
        trimmed => trimmed.parse::<f64>().map_or(NodeValue::Undefined, NodeValue::Number),
    }
}

fn parse_bigint(text: &str) -> NodeValue {
    let digits = text.trim().trim_end_matches('n');
    BigInt::from_str(digits)
        .map(NodeValue::BigInt)
        .unwrap_or_else(|_| NodeValue::Text(format!("{text}n")))
}

/// Take a snapshot of the live heap over the protocol.
///
/// Chunks are collected from `HeapProfiler.addHeapSnapshotChunk` events while
/// `HeapProfiler.takeHeapSnapshot` is in flight.
pub async fn capture_snapshot(client: &dyn ProtocolClient) -> Result<RawSnapshot, HeapError> {
    let mut events = client.subscribe();
    client.send("HeapProfiler.enable", json!({})).await?;

    let take = client.send(
        "HeapProfiler.takeHeapSnapshot",
        json!({ "reportProgress": false, "captureNumericValue": true }),
    );
    tokio::pin!(take);

    let mut buffer = String::new();
    let mut chunks = 0usize;
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => chunks += append_chunk(&mut buffer, &event),
                Err(RecvError::Lagged(lost)) => return Err(HeapError::ChunksLost(lost)),
                Err(RecvError::Closed) => return Err(crate::ProtocolError::Closed.into()),
            },
            result = &mut take => {
                result?;
                break;
            }
        }
    }

    // Chunks precede the command's response; pick up whatever is still buffered.
    loop {
        match events.try_recv() {
            Ok(event) => chunks += append_chunk(&mut buffer, &event),
            Err(TryRecvError::Lagged(lost)) => return Err(HeapError::ChunksLost(lost)),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    client.send("HeapProfiler.disable", json!({})).await?;
    info!(chunks, bytes = buffer.len(), "Captured heap snapshot");
    RawSnapshot::from_json(&buffer)
}

fn append_chunk(buffer: &mut String, event: &ProtocolEvent) -> usize {
    if event.method != CHUNK_EVENT {
        return 0;
    }
    match event.params.get("chunk").and_then(Value::as_str) {
        Some(chunk) => {
            buffer.push_str(chunk);
            1
        }
        None => 0,
    }
}

/// Capture and decode in one go.
pub async fn capture_graph(client: &dyn ProtocolClient) -> Result<HeapGraph, HeapError> {
    capture_snapshot(client).await?.decode()
}


#[cfg(test)]
mod tests {
    use super::{fixture::snapshot_json, *};

    fn decode(value: Value) -> Result<HeapGraph, HeapError> {
        serde_json::from_value::<RawSnapshot>(value).unwrap().decode()
    }

    #[test]
    fn test_decode_nodes_and_edges() {
        let raw = snapshot_json(&[
            ("synthetic", "", vec![("element", "1", 1)]),
            ("object", "Window", vec![("property", "foo", 2), ("internal", "map", 3)]),
            ("object", "Object", vec![("property", "bar", 3)]),
            ("string", "hello", vec![]),
        ]);
        let graph = decode(raw.clone()).unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.edge_count(), 4);

        let node_fields = raw["snapshot"]["meta"]["node_fields"].as_array().unwrap();
        let edge_count_at = node_fields.iter().position(|f| *f == "edge_count").unwrap();
        let flat_nodes = raw["nodes"].as_array().unwrap();
        for (index, fields) in flat_nodes.chunks(node_fields.len()).enumerate() {
            let declared = fields[edge_count_at].as_u64().unwrap() as usize;
            assert_eq!(graph.node(index).unwrap().edges.len(), declared, "node {index}");
        }

        let window = graph.node(1).unwrap();
        assert_eq!(window.kind, NodeKind::Object);
        assert!(window.is_named("Window"));
        assert_eq!(window.id, 3);
        assert_eq!(window.self_size, 8);
        let foo = HeapEdge { kind: EdgeKind::Property, name: "foo".into(), to: 2 };
        assert_eq!(window.edges[0], foo);
        assert_eq!(graph.node(0).unwrap().edges[0].name, "1");
        assert_eq!(graph.target(&window.edges[1]).name, NodeValue::Text("hello".into()));
    }

    #[test]
    fn test_hidden_literals() {
        let graph = decode(snapshot_json(&[
            ("hidden", "true", vec![]),
            ("hidden", "null", vec![]),
            ("hidden", "undefined", vec![]),
            ("hidden", "system / Oddball", vec![]),
            ("object", "true", vec![]),
        ]))
        .unwrap();

        assert_eq!(graph.node(0).unwrap().name, NodeValue::Bool(true));
        assert_eq!(graph.node(1).unwrap().name, NodeValue::Null);
        assert_eq!(graph.node(2).unwrap().name, NodeValue::Undefined);
        assert_eq!(graph.node(3).unwrap().name, NodeValue::Text("system / Oddball".into()));
        assert_eq!(graph.node(4).unwrap().name, NodeValue::Text("true".into()));
    }

    #[test]
    fn test_boxed_values_recovered() {
        let graph = decode(snapshot_json(&[
            ("number", "heap number", vec![("internal", "value", 1)]),
            ("string", "NaN", vec![]),
            ("number", "heap number", vec![("property", "value", 3)]),
            ("string", "-Infinity", vec![]),
            ("number", "heap number", vec![("internal", "value", 5)]),
            ("string", "1.5", vec![]),
            ("number", "heap number", vec![("internal", "value", 7)]),
            ("string", "garbage", vec![]),
            ("bigint", "bigint", vec![("shortcut", "value", 9)]),
            ("string", "123456789012345678901234567890", vec![]),
            ("bigint", "bigint", vec![("internal", "value", 11)]),
            ("string", "0xzz", vec![]),
            ("number", "heap number", vec![("internal", "value", 13)]),
            ("string", "1e400", vec![]),
            ("number", "heap number", vec![("internal", "value", 15)]),
            ("string", "-1e400", vec![]),
            ("number", "heap number", vec![("internal", "value", 17)]),
            ("string", "inf", vec![]),
        ]))
        .unwrap();

        assert!(matches!(graph.node(0).unwrap().name, NodeValue::Number(v) if v.is_nan()));
        assert_eq!(graph.node(2).unwrap().name, NodeValue::Number(f64::NEG_INFINITY));
        assert_eq!(graph.node(4).unwrap().name, NodeValue::Number(1.5));
        assert_eq!(graph.node(6).unwrap().name, NodeValue::Undefined);
        assert_eq!(
            graph.node(8).unwrap().name.to_string(),
            "123456789012345678901234567890"
        );
        assert_eq!(graph.node(10).unwrap().name, NodeValue::Text("0xzzn".into()));
        assert_eq!(graph.node(12).unwrap().name, NodeValue::Number(f64::INFINITY));
        assert_eq!(graph.node(14).unwrap().name, NodeValue::Number(f64::NEG_INFINITY));
        assert_eq!(graph.node(16).unwrap().name, NodeValue::Undefined);
    }

    #[test]
    fn test_internal_value_edge_preferred() {
        let graph = decode(snapshot_json(&[
            ("number", "heap number", vec![("property", "value", 1), ("internal", "value", 2)]),
            ("string", "1", vec![]),
            ("string", "2", vec![]),
        ]))
        .unwrap();
        assert_eq!(graph.node(0).unwrap().name, NodeValue::Number(2.0));
    }

    #[test]
    fn test_structural_errors() {
        let mut missing = snapshot_json(&[("object", "Object", vec![])]);
        missing["snapshot"]["meta"]["node_fields"] =
            json!(["type", "name", "self_size", "edge_count", "x"]);
        assert!(matches!(decode(missing), Err(HeapError::MissingField { field: "id", .. })));

        let mut dangling = snapshot_json(&[("object", "Object", vec![("property", "x", 0)])]);
        dangling["edges"][2] = json!(50);
        assert!(matches!(decode(dangling), Err(HeapError::DanglingEdge { target: 10, .. })));

        let mut misaligned = snapshot_json(&[("object", "Object", vec![("property", "x", 0)])]);
        misaligned["edges"][2] = json!(3);
        assert!(matches!(decode(misaligned), Err(HeapError::MisalignedEdge { offset: 3, .. })));

        let mut truncated = snapshot_json(&[("object", "Object", vec![("property", "x", 0)])]);
        truncated["edges"] = json!([2, 0]);
        assert!(matches!(
            decode(truncated),
            Err(HeapError::EdgeArrayMismatch { expected: 3, actual: 2 })
        ));

        let mut short_nodes = snapshot_json(&[("object", "Object", vec![])]);
        short_nodes["nodes"] = json!([3, 0, 1]);
        assert!(matches!(
            decode(short_nodes),
            Err(HeapError::MisalignedNodes { len: 3, width: 5 })
        ));

        let mut bad_string = snapshot_json(&[("object", "Object", vec![])]);
        bad_string["nodes"][1] = json!(99);
        assert!(matches!(decode(bad_string), Err(HeapError::InvalidStringIndex(99))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.heapsnapshot");
        let json = snapshot_json(&[("object", "Window", vec![]), ("string", "x", vec![])]);
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let graph = RawSnapshot::load(&path).unwrap().decode().unwrap();
        assert_eq!(graph.len(), 2);
        assert!(RawSnapshot::load(dir.path().join("missing")).is_err());
    }
}
