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


use std::{fs, path::PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;
use tracing::info;

/// `window.foo = { testKeyTop: "top-level testValue" }`
fn snapshot() -> Value {
    json!({
        "snapshot": {
            "meta": {
                "node_fields": ["type", "name", "id", "self_size", "edge_count"],
                "node_types": [
                    ["hidden", "array", "string", "object", "code", "closure", "regexp", "number",
                     "native", "synthetic", "concatenated string", "sliced string", "symbol",
                     "bigint"],
                    "string", "number", "number", "number"
                ],
                "edge_fields": ["type", "name_or_index", "to_node"],
                "edge_types": [
                    ["context", "element", "property", "internal", "hidden", "shortcut", "weak"],
                    "string_or_number", "node"
                ]
            },
            "node_count": 3,
            "edge_count": 2
        },
        "nodes": [3, 0, 1, 8, 1, 3, 1, 3, 8, 1, 2, 2, 5, 8, 0],
        "edges": [2, 3, 5, 2, 4, 10],
        "strings": ["Window", "Object", "top-level testValue", "foo", "testKeyTop"]
    })
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("heapdbg.toml"), "").unwrap();
        Self { dir }
    }

    fn write(&self, name: &str, value: &Value) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, serde_json::to_string(value).unwrap()).unwrap();
        path
    }

    fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("heapdbg").unwrap();
        cmd.arg("--config").arg(self.dir.path().join("heapdbg.toml"));
        cmd
    }
}

#[test]
fn test_help_command() {
    heapdbg_common::logging::ensure_test_logging(None);
    info!("Testing CLI help command");

    let mut cmd = Command::cargo_bin("heapdbg").unwrap();
    cmd.arg("--help").assert().success().stdout(predicate::str::contains("Heap origin debugger"));
}

#[test]
fn test_version_command() {
    heapdbg_common::logging::ensure_test_logging(None);
    let mut cmd = Command::cargo_bin("heapdbg").unwrap();
    cmd.arg("--version").assert().success().stdout(predicate::str::contains("heapdbg"));
}

#[test]
fn test_missing_subcommand() {
    heapdbg_common::logging::ensure_test_logging(None);
    let mut cmd = Command::cargo_bin("heapdbg").unwrap();
    cmd.assert().failure().stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_search_prints_paths() {
    heapdbg_common::logging::ensure_test_logging(None);
    let ws = Workspace::new();
    let snapshot = ws.write("app.heapsnapshot", &snapshot());

    let output = ws
        .command()
        .arg("search")
        .arg(&snapshot)
        .args(["--value", ".*testValue.*", "--regex", "--exact"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let result: Value = serde_json::from_slice(&output).unwrap();
    let paths: Vec<&str> =
        result["results"].as_array().unwrap().iter().filter_map(|r| r["path"].as_str()).collect();
    assert_eq!(paths, vec!["window.foo", "window.foo.testKeyTop"]);
    assert_eq!(result["results"][1]["object"], "top-level testValue");
    assert_eq!(result["limitReached"], false);
}

#[test]
fn test_search_limit() {
    heapdbg_common::logging::ensure_test_logging(None);
    let ws = Workspace::new();
    let snapshot = ws.write("app.heapsnapshot", &snapshot());

    ws.command()
        .arg("search")
        .arg(&snapshot)
        .args(["--value", "testvalue", "--limit", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"limitReached\": true"));
}

#[test]
fn test_search_rejects_invalid_regex() {
    heapdbg_common::logging::ensure_test_logging(None);
    let ws = Workspace::new();
    let snapshot = ws.write("app.heapsnapshot", &snapshot());

    ws.command().arg("search").arg(&snapshot).args(["--value", "(", "--regex"]).assert().failure();
}

#[test]
fn test_search_requires_a_filter() {
    heapdbg_common::logging::ensure_test_logging(None);
    let ws = Workspace::new();
    let snapshot = ws.write("app.heapsnapshot", &snapshot());

    ws.command().arg("search").arg(&snapshot).assert().failure();
}

#[test]
fn test_similarity_of_identical_values() {
    heapdbg_common::logging::ensure_test_logging(None);
    let ws = Workspace::new();
    let a = ws.write("a.json", &json!({ "a": 1, "b": { "c": "x" } }));

    let output = ws
        .command()
        .arg("similarity")
        .arg(&a)
        .arg(&a)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).unwrap();
    assert!((report["hybrid"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    assert!((report["jaccard"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    assert!((report["simhash"].as_f64().unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn test_similarity_rejects_bad_alpha() {
    heapdbg_common::logging::ensure_test_logging(None);
    let ws = Workspace::new();
    let a = ws.write("a.json", &json!({ "a": 1 }));

    ws.command().arg("similarity").arg(&a).arg(&a).args(["--alpha", "2"]).assert().failure();
}

#[test]
fn test_fingerprint_is_stable_hex() {
    heapdbg_common::logging::ensure_test_logging(None);
    let ws = Workspace::new();
    let a = ws.write("a.json", &json!({ "user": { "name": "x", "age": 3 } }));
    let b = ws.write("b.json", &json!({ "user": { "name": "y", "age": 4 } }));

    let first =
        ws.command().arg("fingerprint").arg(&a).assert().success().get_output().stdout.clone();
    let second =
        ws.command().arg("fingerprint").arg(&b).assert().success().get_output().stdout.clone();

    let first = String::from_utf8(first).unwrap();
    assert_eq!(first.trim().len(), 16);
    assert!(first.trim().chars().all(|c| c.is_ascii_hexdigit()));
    // Same shape, different values.
    assert_eq!(first, String::from_utf8(second).unwrap());
}

#[test]
fn test_config_init_creates_file() {
    heapdbg_common::logging::ensure_test_logging(None);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fresh.toml");

    let mut cmd = Command::cargo_bin("heapdbg").unwrap();
    cmd.arg("--config")
        .arg(&path)
        .args(["config", "--init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_steps = 5000"));
    assert!(path.exists());
}
