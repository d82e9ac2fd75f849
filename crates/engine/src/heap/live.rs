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


//! Searches over the live heap of a running target.
//!
//! The filtering happens inside the target: a JavaScript probe walks either
//! every plain object on the heap (global mode) or the object graph below a
//! root expression (by-root mode). The probe's JSON answer is parsed here and
//! the similarity gate is applied on this side.

use futures::future::BoxFuture;
use heapdbg_common::{RemoteObject, SearchQuery, TextFilter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{is_identifier, HeapError};
use crate::{EngineConfig, ObjectSimilarity, ProtocolClient, SharedProtocol};

/// Source of the in-target search probe. Evaluates to a function
/// `(target, params) => { results, totObjects, resultsLimitReached }`.
pub const LIVE_SEARCH_PROBE: &str = include_str!("../../probes/live_search.js");

/// Object group holding the handles created by live searches.
pub const LIVE_OBJECT_GROUP: &str = "heapdbg-live";

/// Where a live search starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveSearchMode {
    /// Every plain object, array, map and set on the heap
    Global,
    /// The graph below a root expression such as `window.store`
    ByRoot(String),
}

/// Parameters handed to the probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeParams {
    /// `global` or `root`
    pub mode: &'static str,
    /// Root expression, also the prefix of every reported path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Property-name filter
    pub property_search: Option<TextFilter>,
    /// Value filter
    pub value_search: Option<TextFilter>,
    /// Class-name filter
    pub class_search: Option<TextFilter>,
    /// Maximum walk depth below the root
    pub max_depth: usize,
    /// Maximum number of reported matches
    pub max_results: usize,
}

/// A probe ready to run in the target.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveProbe {
    /// Search mode
    pub mode: LiveSearchMode,
    /// Probe parameters
    pub params: ProbeParams,
}

/// Runs a [`LiveProbe`] inside the target and returns its JSON answer.
pub trait ProbeEvaluator: Send + Sync {
    /// Evaluate the probe
    fn evaluate<'a>(&'a self, probe: &'a LiveProbe) -> BoxFuture<'a, Result<Value, HeapError>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeOutput {
    #[serde(default)]
    results: Vec<ProbeHit>,
    #[serde(default)]
    tot_objects: u64,
    #[serde(default)]
    results_limit_reached: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeHit {
    index: usize,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    class_name: String,
    #[serde(default)]
    obj: String,
    #[serde(default)]
    object_id: Option<String>,
}

/// One object or property found in the live heap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMatch {
    /// Position of the match in the probe's walk
    pub index: usize,
    /// Accessor path (by-root mode only)
    pub path: Option<String>,
    /// Constructor name of the owning object
    pub class_name: String,
    /// Serialised value
    pub object: Value,
    /// Handle of the live object (global mode only)
    pub object_id: Option<String>,
    /// Similarity score against the reference, when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

/// Outcome of a live search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSearchResult {
    /// Matches in walk order
    pub results: Vec<LiveMatch>,
    /// Objects the probe looked at
    pub total_objects_analyzed: u64,
    /// The result cap stopped the walk early
    pub limit_reached: bool,
}

/// Run a live search.
///
/// The query is validated before anything is sent to the target.
pub async fn search_live(
    evaluator: &dyn ProbeEvaluator,
    mode: LiveSearchMode,
    query: &SearchQuery,
    config: &EngineConfig,
) -> Result<LiveSearchResult, HeapError> {
    let compiled = query.compile()?;
    let (mode_name, root) = match &mode {
        LiveSearchMode::Global => ("global", None),
        LiveSearchMode::ByRoot(root) if root.trim().is_empty() => return Err(HeapError::EmptyRoot),
        LiveSearchMode::ByRoot(root) => ("root", Some(root.trim().to_string())),
    };

    let enabled = |filter: &Option<TextFilter>| filter.clone().filter(TextFilter::is_enabled);
    let probe = LiveProbe {
        mode,
        params: ProbeParams {
            mode: mode_name,
            root,
            property_search: enabled(&query.property_search),
            value_search: enabled(&query.value_search),
            class_search: enabled(&query.class_search),
            max_depth: config.heap.live_max_depth,
            max_results: config.heap.live_max_results,
        },
    };

    let output: ProbeOutput = serde_json::from_value(evaluator.evaluate(&probe).await?)
        .map_err(|e| HeapError::Probe(format!("malformed probe output: {e}")))?;
    debug!(hits = output.results.len(), objects = output.tot_objects, "Live probe answered");

    let similarity = compiled.similarity.as_ref().map(|sim| {
        (sim, ObjectSimilarity::from_config(&config.similarity, sim.include_values))
    });

    let mut results = Vec::with_capacity(output.results.len());
    for hit in output.results {
        // Nothing serialisable to report or score.
        if hit.obj.is_empty() || hit.obj == "{}" {
            continue;
        }
        let object = serde_json::from_str(&hit.obj).unwrap_or(Value::String(hit.obj));
        let mut score = None;
        if let Some((sim, engine)) = &similarity {
            let value = engine.hybrid(&object, &sim.reference, sim.alpha);
            if value < sim.threshold {
                continue;
            }
            score = Some(value);
        }
        results.push(LiveMatch {
            index: hit.index,
            path: hit.path,
            class_name: hit.class_name,
            object,
            object_id: hit.object_id,
            similarity: score,
        });
    }

    info!(
        results = results.len(),
        objects = output.tot_objects,
        limit_reached = output.results_limit_reached,
        "Live search finished"
    );
    Ok(LiveSearchResult {
        results,
        total_objects_analyzed: output.tot_objects,
        limit_reached: output.results_limit_reached,
    })
}

/// Text of a thrown exception in a `Runtime.*` response, if any.
fn exception_text(response: &Value) -> Option<String> {
    let details = response.get("exceptionDetails")?;
    let text = details
        .pointer("/exception/description")
        .or_else(|| details.get("text"))
        .and_then(Value::as_str)
        .unwrap_or("exception thrown");
    Some(text.to_string())
}

fn result_object(response: &Value) -> Result<RemoteObject, HeapError> {
    if let Some(text) = exception_text(response) {
        return Err(HeapError::Probe(text));
    }
    let result = response.get("result").cloned().unwrap_or(Value::Null);
    serde_json::from_value(result).map_err(|e| HeapError::Probe(format!("malformed result: {e}")))
}

/// [`ProbeEvaluator`] backed by the `Runtime` domain of the protocol.
#[derive(Clone)]
pub struct RuntimeEvaluator {
    client: SharedProtocol,
}

impl std::fmt::Debug for RuntimeEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEvaluator").finish_non_exhaustive()
    }
}

impl RuntimeEvaluator {
    /// Wrap a protocol client
    pub fn new(client: SharedProtocol) -> Self {
        Self { client }
    }

    /// Release every handle created by live searches
    pub async fn release(&self) -> Result<(), HeapError> {
        self.client
            .send("Runtime.releaseObjectGroup", json!({ "objectGroup": LIVE_OBJECT_GROUP }))
            .await?;
        Ok(())
    }

    async fn evaluate_global(&self, params: &ProbeParams) -> Result<Value, HeapError> {
        let prototype = result_object(
            &self
                .client
                .send(
                    "Runtime.evaluate",
                    json!({ "expression": "Object.prototype", "objectGroup": LIVE_OBJECT_GROUP }),
                )
                .await?,
        )?;
        let prototype_id = prototype
            .object_id
            .ok_or_else(|| HeapError::Probe("Object.prototype has no handle".to_string()))?;

        let queried = self
            .client
            .send(
                "Runtime.queryObjects",
                json!({ "prototypeObjectId": prototype_id, "objectGroup": LIVE_OBJECT_GROUP }),
            )
            .await?;
        let instances: RemoteObject =
            serde_json::from_value(queried.get("objects").cloned().unwrap_or(Value::Null))
                .map_err(|e| HeapError::Probe(format!("malformed instance list: {e}")))?;
        let array_id = instances
            .object_id
            .ok_or_else(|| HeapError::Probe("instance list has no handle".to_string()))?;

        let answer = self
            .client
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": array_id,
                    "functionDeclaration": format!(
                        "function(params) {{ return ({LIVE_SEARCH_PROBE})(this, params); }}"
                    ),
                    "arguments": [{ "value": params }],
                    "returnByValue": true,
                    "objectGroup": LIVE_OBJECT_GROUP,
                }),
            )
            .await?;
        let mut output = result_object(&answer)?.value.unwrap_or(Value::Null);

        // Hand out a handle for every hit so it can be exposed later.
        let properties = self
            .client
            .send(
                "Runtime.getProperties",
                json!({ "objectId": array_id, "ownProperties": true }),
            )
            .await?;
        let handles =
            properties.get("result").and_then(Value::as_array).cloned().unwrap_or_default();
        if let Some(hits) = output.get_mut("results").and_then(Value::as_array_mut) {
            for hit in hits {
                let Some(index) = hit.get("index").and_then(Value::as_u64) else {
                    continue;
                };
                let name = index.to_string();
                let handle = handles
                    .iter()
                    .find(|p| p.get("name").and_then(Value::as_str) == Some(name.as_str()))
                    .and_then(|p| p.pointer("/value/objectId"))
                    .cloned();
                if let Some(handle) = handle {
                    hit["objectId"] = handle;
                }
            }
        }
        Ok(output)
    }

    async fn evaluate_by_root(&self, root: &str, params: &ProbeParams) -> Result<Value, HeapError> {
        let params = serde_json::to_string(params)?;
        let answer = self
            .client
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": format!("({LIVE_SEARCH_PROBE})(({root}), {params})"),
                    "returnByValue": true,
                    "objectGroup": LIVE_OBJECT_GROUP,
                }),
            )
            .await?;
        Ok(result_object(&answer)?.value.unwrap_or(Value::Null))
    }
}

impl ProbeEvaluator for RuntimeEvaluator {
    fn evaluate<'a>(&'a self, probe: &'a LiveProbe) -> BoxFuture<'a, Result<Value, HeapError>> {
        Box::pin(async move {
            match &probe.mode {
                LiveSearchMode::Global => self.evaluate_global(&probe.params).await,
                LiveSearchMode::ByRoot(root) => self.evaluate_by_root(root, &probe.params).await,
            }
        })
    }
}

/// Bind a live object to the global variable `name`.
pub async fn expose_object(
    client: &dyn ProtocolClient,
    object_id: &str,
    name: &str,
) -> Result<(), HeapError> {
    if !is_identifier(name) {
        return Err(HeapError::InvalidVariableName(name.to_string()));
    }
    let response = client
        .send(
            "Runtime.callFunctionOn",
            json!({
                "objectId": object_id,
                "functionDeclaration": "function(name) { globalThis[name] = this; return this; }",
                "arguments": [{ "value": name }],
                "silent": true,
            }),
        )
        .await?;
    if let Some(text) = exception_text(&response) {
        return Err(HeapError::Probe(text));
    }
    info!(object_id, name, "Exposed live object");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapdbg_common::MatchOptions;
    use parking_lot::Mutex;

    struct Canned {
        answer: Value,
        seen: Mutex<Vec<LiveProbe>>,
    }

    impl Canned {
        fn new(answer: Value) -> Self {
            Self { answer, seen: Mutex::new(Vec::new()) }
        }
    }

    impl ProbeEvaluator for Canned {
        fn evaluate<'a>(&'a self, probe: &'a LiveProbe) -> BoxFuture<'a, Result<Value, HeapError>> {
            self.seen.lock().push(probe.clone());
            let answer = self.answer.clone();
            Box::pin(async move { Ok(answer) })
        }
    }

    fn value_query(pattern: &str) -> SearchQuery {
        SearchQuery {
            value_search: Some(TextFilter::new(pattern, MatchOptions::contains())),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_by_root_results_are_parsed() {
        let evaluator = Canned::new(json!({
            "results": [{
                "index": 0,
                "path": "window.foo.testKeyTop",
                "className": "Object",
                "obj": "\"top-level testValue\"",
            }],
            "totObjects": 12,
            "resultsLimitReached": false,
        }));
        let result = search_live(
            &evaluator,
            LiveSearchMode::ByRoot(" window.foo ".into()),
            &value_query("testValue"),
            &EngineConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.total_objects_analyzed, 12);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].path.as_deref(), Some("window.foo.testKeyTop"));
        assert_eq!(result.results[0].object, json!("top-level testValue"));

        let probe = evaluator.seen.lock()[0].clone();
        assert_eq!(probe.params.mode, "root");
        assert_eq!(probe.params.root.as_deref(), Some("window.foo"));
        assert_eq!(probe.params.max_depth, 125);
        assert_eq!(probe.params.max_results, 100);
        assert!(probe.params.property_search.is_none());
    }

    #[tokio::test]
    async fn test_similarity_gate_applies_to_live_hits() {
        let evaluator = Canned::new(json!({
            "results": [
                {
                    "index": 0,
                    "className": "Object",
                    "obj": "{\"x\":1,\"y\":2}",
                    "objectId": "obj-1",
                },
                { "index": 1, "className": "Object", "obj": "{\"name\":\"n\"}" },
            ],
            "totObjects": 2,
            "resultsLimitReached": true,
        }));
        let query = SearchQuery {
            os_enabled: true,
            os_object: Some(r#"{"x": 5, "y": 6}"#.into()),
            os_threshold: Some(0.8),
            ..Default::default()
        };
        let result =
            search_live(&evaluator, LiveSearchMode::Global, &query, &EngineConfig::default())
                .await
                .unwrap();

        assert!(result.limit_reached);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].object_id.as_deref(), Some("obj-1"));
        assert!(result.results[0].similarity.unwrap() > 0.99);
    }

    #[tokio::test]
    async fn test_empty_live_objects_are_dropped() {
        let evaluator = Canned::new(json!({
            "results": [
                { "index": 0, "className": "Object", "obj": "{}" },
                { "index": 1, "className": "Object", "obj": "" },
                { "index": 2, "className": "Object" },
                { "index": 3, "className": "Object", "obj": "{\"a\":\"xvalue\"}" },
            ],
            "totObjects": 4,
            "resultsLimitReached": false,
        }));
        let result = search_live(
            &evaluator,
            LiveSearchMode::Global,
            &value_query("value"),
            &EngineConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.total_objects_analyzed, 4);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].index, 3);
        assert_eq!(result.results[0].object, json!({ "a": "xvalue" }));
    }

    #[tokio::test]
    async fn test_validation_happens_before_probing() {
        let evaluator = Canned::new(json!({}));
        let err = search_live(
            &evaluator,
            LiveSearchMode::Global,
            &SearchQuery::default(),
            &EngineConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HeapError::Query(_)));

        let err = search_live(
            &evaluator,
            LiveSearchMode::ByRoot("  ".into()),
            &value_query("x"),
            &EngineConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HeapError::EmptyRoot));
        assert!(evaluator.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_probe_output() {
        let evaluator = Canned::new(json!({ "results": "nope" }));
        let err = search_live(
            &evaluator,
            LiveSearchMode::Global,
            &value_query("x"),
            &EngineConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HeapError::Probe(_)));
    }

    #[test]
    fn test_probe_source_is_a_function_expression() {
        assert!(LIVE_SEARCH_PROBE.trim_start().starts_with("(function liveSearch"));
        assert!(LIVE_SEARCH_PROBE.trim_end().ends_with(')'));
    }

    #[test]
    fn test_exception_text() {
        let response = json!({
            "result": { "type": "object" },
            "exceptionDetails": {
                "text": "Uncaught",
                "exception": { "description": "ReferenceError: x" },
            },
        });
        assert_eq!(exception_text(&response).as_deref(), Some("ReferenceError: x"));
        assert_eq!(exception_text(&json!({ "result": {} })), None);
    }
}
