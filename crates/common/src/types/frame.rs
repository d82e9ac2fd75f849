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
use serde_json::{json, Value};

/// A position inside a parsed script. Line and column are 0-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Script the location belongs to
    pub script_id: String,
    /// 0-based line number
    pub line_number: u32,
    /// 0-based column number
    #[serde(default)]
    pub column_number: u32,
}

impl Location {
    /// Create a new location
    pub fn new(script_id: impl Into<String>, line_number: u32, column_number: u32) -> Self {
        Self { script_id: script_id.into(), line_number, column_number }
    }
}

/// A possible breakpoint location as reported by `Debugger.getPossibleBreakpoints`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakLocation {
    /// Script the location belongs to
    pub script_id: String,
    /// 0-based line number
    pub line_number: u32,
    /// 0-based column number
    #[serde(default)]
    pub column_number: u32,
    /// `debuggerStatement`, `call` or `return`
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl BreakLocation {
    /// Whether the runtime stops here right before returning from a function
    pub fn is_return(&self) -> bool {
        self.kind.as_deref() == Some("return")
    }

    /// Convert into a plain location
    pub fn location(&self) -> Location {
        Location::new(self.script_id.clone(), self.line_number, self.column_number)
    }
}

/// Mirror object referencing a value inside the debuggee.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    /// Object type (`object`, `function`, `string`, `number`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Object subtype hint (`array`, `null`, `promise`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Constructor name for objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Primitive value or JSON value when returned by value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// String form of values JSON cannot carry (`NaN`, `-0`, bigints)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unserializable_value: Option<String>,
    /// Human readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Handle for non-primitive values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl RemoteObject {
    /// Whether the object is a promise
    pub fn is_promise(&self) -> bool {
        self.subtype.as_deref() == Some("promise")
    }

    /// JavaScript truthiness of a by-value result.
    pub fn is_truthy(&self) -> bool {
        if self.object_id.is_some() {
            return self.subtype.as_deref() != Some("null");
        }
        if let Some(raw) = &self.unserializable_value {
            return !matches!(raw.as_str(), "NaN" | "-0" | "0n");
        }
        match &self.value {
            None | Some(Value::Null) => self.kind == "object" && self.subtype.is_none(),
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        }
    }

    /// Convert the mirror into a `CallArgument` accepted by the protocol.
    pub fn to_call_argument(&self) -> Value {
        if let Some(object_id) = &self.object_id {
            json!({ "objectId": object_id })
        } else if let Some(raw) = &self.unserializable_value {
            json!({ "unserializableValue": raw })
        } else if self.kind == "undefined" {
            json!({})
        } else {
            json!({ "value": self.value.clone().unwrap_or(Value::Null) })
        }
    }
}

/// One entry of a frame's scope chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Scope type (`global`, `local`, `closure`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Object holding the scope's variables
    #[serde(default)]
    pub object: RemoteObject,
    /// Scope name, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Where the scope starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_location: Option<Location>,
    /// Where the scope ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_location: Option<Location>,
}

/// One stack frame at a pause. Only valid until the debuggee resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    /// Identifier used to evaluate in this frame
    pub call_frame_id: String,
    /// Name of the executing function, empty for anonymous functions
    #[serde(default)]
    pub function_name: String,
    /// Current position
    pub location: Location,
    /// Start of the executing function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_location: Option<Location>,
    /// Script URL, when the runtime reports it
    #[serde(default)]
    pub url: String,
    /// Lexical scopes from innermost to outermost
    #[serde(default)]
    pub scope_chain: Vec<Scope>,
    /// Value about to be returned; only present at return points
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<RemoteObject>,
}

impl CallFrame {
    /// Location used to identify the frame's function: the function start when known,
    /// otherwise the current position.
    pub fn entry_location(&self) -> &Location {
        self.function_location.as_ref().unwrap_or(&self.location)
    }

    /// Whether the frame is stopped at a return point
    pub fn has_return_slot(&self) -> bool {
        self.return_value.is_some()
    }
}

/// Parameters of a `Debugger.paused` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedEvent {
    /// Stack, innermost frame first
    pub call_frames: Vec<CallFrame>,
    /// Pause reason reported by the runtime
    #[serde(default)]
    pub reason: String,
    /// Breakpoints that fired
    #[serde(default)]
    pub hit_breakpoints: Vec<String>,
}

impl PausedEvent {
    /// The innermost frame
    pub fn top_frame(&self) -> Option<&CallFrame> {
        self.call_frames.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_event_deserialization() {
        let raw = json!({
            "callFrames": [{
                "callFrameId": "frame-1",
                "functionName": "handler",
                "location": { "scriptId": "42", "lineNumber": 10, "columnNumber": 4 },
                "functionLocation": { "scriptId": "42", "lineNumber": 8, "columnNumber": 0 },
                "url": "https://app.test/main.js",
                "scopeChain": [{
                    "type": "local",
                    "object": { "type": "object", "objectId": "scope-1" },
                    "startLocation": { "scriptId": "42", "lineNumber": 8, "columnNumber": 0 }
                }],
                "this": { "type": "undefined" },
                "returnValue": { "type": "number", "value": 3, "description": "3" }
            }],
            "reason": "other",
            "hitBreakpoints": ["1:10:4:42"]
        });

        let event: PausedEvent = serde_json::from_value(raw).unwrap();
        let frame = event.top_frame().unwrap();
        assert_eq!(frame.function_name, "handler");
        assert_eq!(frame.entry_location().line_number, 8);
        assert!(frame.has_return_slot());
        assert_eq!(frame.scope_chain[0].kind, "local");
        assert_eq!(event.hit_breakpoints, vec!["1:10:4:42".to_string()]);
    }

    #[test]
    fn test_call_argument_conversion() {
        let by_ref = RemoteObject {
            kind: "object".into(),
            object_id: Some("obj-1".into()),
            ..Default::default()
        };
        assert_eq!(by_ref.to_call_argument(), json!({ "objectId": "obj-1" }));

        let nan = RemoteObject {
            kind: "number".into(),
            unserializable_value: Some("NaN".into()),
            ..Default::default()
        };
        assert_eq!(nan.to_call_argument(), json!({ "unserializableValue": "NaN" }));

        let plain = RemoteObject {
            kind: "string".into(),
            value: Some(json!("hi")),
            ..Default::default()
        };
        assert_eq!(plain.to_call_argument(), json!({ "value": "hi" }));
    }

    #[test]
    fn test_truthiness() {
        let make = |kind: &str, value: Value| RemoteObject {
            kind: kind.into(),
            value: Some(value),
            ..Default::default()
        };
        assert!(make("boolean", json!(true)).is_truthy());
        assert!(!make("boolean", json!(false)).is_truthy());
        assert!(!make("number", json!(0)).is_truthy());
        assert!(make("number", json!(2)).is_truthy());
        assert!(!make("string", json!("")).is_truthy());
        assert!(!RemoteObject { kind: "undefined".into(), ..Default::default() }.is_truthy());
    }
}
