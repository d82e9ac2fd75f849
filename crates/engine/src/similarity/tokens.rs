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


use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How primitive leaves appear in the token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenMode {
    /// `path=value`
    Values,
    /// `path:type`
    #[default]
    PrimitiveType,
    /// `path`
    StructureOnly,
}

/// Marker used by materialised objects for already-visited references.
const CIRCULAR_PREFIX: &str = "[Circular";

/// Flatten `value` into path-qualified tokens, stopping below `max_depth`.
///
/// Children are addressed as `parent.key` (bare `key` at the root), empty
/// containers produce `path={}` and references already marked circular
/// produce `path=[Circular]`.
pub fn tokenize(value: &Value, max_depth: usize, mode: TokenMode) -> Vec<String> {
    let mut tokens = Vec::new();
    walk(value, "", 0, max_depth, mode, &mut tokens);
    tokens
}

fn walk(
    value: &Value,
    path: &str,
    depth: usize,
    max_depth: usize,
    mode: TokenMode,
    out: &mut Vec<String>,
) {
    if depth > max_depth {
        return;
    }

    match value {
        Value::Null => out.push(format!("{path}=null")),
        Value::String(s) if s.starts_with(CIRCULAR_PREFIX) => {
            out.push(format!("{path}=[Circular]"));
        }
        Value::Bool(_) | Value::Number(_) | Value::String(_) => out.push(match mode {
            TokenMode::Values => format!("{path}={}", primitive_text(value)),
            TokenMode::PrimitiveType => format!("{path}:{}", type_name(value)),
            TokenMode::StructureOnly => path.to_string(),
        }),
        Value::Array(items) => {
            if items.is_empty() {
                out.push(format!("{path}={{}}"));
            }
            for (index, item) in items.iter().enumerate() {
                walk(item, &sub_path(path, &index.to_string()), depth + 1, max_depth, mode, out);
            }
        }
        Value::Object(map) => walk_map(map, path, depth, max_depth, mode, out),
    }
}

fn walk_map(
    map: &Map<String, Value>,
    path: &str,
    depth: usize,
    max_depth: usize,
    mode: TokenMode,
    out: &mut Vec<String>,
) {
    if map.is_empty() {
        out.push(format!("{path}={{}}"));
    }
    for (key, child) in map {
        walk(child, &sub_path(path, key), depth + 1, max_depth, mode, out);
    }
}

fn sub_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
    }
}

fn primitive_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if !n.is_i64() && !n.is_u64() => format_js_number(f),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Render a double the way a JavaScript engine prints it.
pub fn format_js_number(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let sign = if value < 0.0 { "-" } else { "" };
        format!("{sign}Infinity")
    } else if value == value.trunc() && value.abs() < 1e21 {
        if value == 0.0 {
            "0".to_string()
        } else {
            format!("{value:.0}")
        }
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitive_type_tokens() {
        let mut tokens =
            tokenize(&json!({ "a": 1, "b": { "c": "x", "d": [] } }), 3, TokenMode::PrimitiveType);
        tokens.sort();
        assert_eq!(tokens, vec!["a:number", "b.c:string", "b.d={}"]);
    }

    #[test]
    fn test_value_tokens_and_nulls() {
        let mut tokens =
            tokenize(&json!({ "a": 1.0, "b": null, "c": true, "d": "s" }), 3, TokenMode::Values);
        tokens.sort();
        assert_eq!(tokens, vec!["a=1", "b=null", "c=true", "d=s"]);
    }

    #[test]
    fn test_structure_only_and_circular() {
        let mut tokens = tokenize(
            &json!({ "self": "[Circular Object:Foo]", "x": 3 }),
            3,
            TokenMode::StructureOnly,
        );
        tokens.sort();
        assert_eq!(tokens, vec!["self=[Circular]", "x"]);
    }

    #[test]
    fn test_depth_limit() {
        let value = json!({ "a": { "b": { "c": { "d": 1 } } } });
        assert!(tokenize(&value, 3, TokenMode::PrimitiveType).is_empty());
        assert_eq!(tokenize(&value, 4, TokenMode::PrimitiveType), vec!["a.b.c.d:number"]);
    }

    #[test]
    fn test_root_primitive_and_arrays() {
        assert_eq!(tokenize(&json!(5), 3, TokenMode::PrimitiveType), vec![":number"]);
        assert_eq!(tokenize(&json!(["x"]), 3, TokenMode::Values), vec!["0=x"]);
    }

    #[test]
    fn test_format_js_number() {
        assert_eq!(format_js_number(1.0), "1");
        assert_eq!(format_js_number(-3.0), "-3");
        assert_eq!(format_js_number(-0.0), "0");
        assert_eq!(format_js_number(1.5), "1.5");
        assert_eq!(format_js_number(f64::NAN), "NaN");
        assert_eq!(format_js_number(f64::NEG_INFINITY), "-Infinity");
    }
}
