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


//! End-to-end tests of live hooks over a scripted transport

use std::{sync::Arc, time::Duration};

use heapdbg_engine::{
    DebuggerError, DebuggerSession, HookError, HookEvent, HookEventKind, HookStatus,
    LiveHookDef, LiveHookManager,
};
use heapdbg_integration_tests::test_utils::{
    events::{call_frame, paused, script_parsed},
    init,
    mock::MockProtocol,
    wait,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

const TIMEOUT: Duration = Duration::from_secs(5);
const APP_URL: &str = "http://localhost:8080/app.js";

fn manager(mock: &Arc<MockProtocol>) -> (LiveHookManager, UnboundedReceiver<HookEvent>) {
    let session = DebuggerSession::with_defaults(mock.clone());
    LiveHookManager::new(session).unwrap()
}

/// Enable the session and announce `app.js` as script `42`.
async fn parse_app_script(mock: &MockProtocol, hooks: &LiveHookManager) {
    hooks.session().enable().await.unwrap();
    mock.push_event(script_parsed("42", APP_URL, "h1"));
    let session = hooks.session().clone();
    assert!(wait::until(TIMEOUT, || session.script_id(APP_URL).is_some()).await);
}

fn inject(line: u32, col: u32, code: &str) -> LiveHookDef {
    LiveHookDef {
        hook_type: Some("inject".into()),
        file: APP_URL.into(),
        line,
        col,
        code: Some(code.into()),
        ..Default::default()
    }
}

fn override_return(line: u32, col: u32, expr: &str) -> LiveHookDef {
    LiveHookDef {
        hook_type: Some("return".into()),
        file: APP_URL.into(),
        line,
        col,
        return_expr: Some(expr.into()),
        ..Default::default()
    }
}

fn frame_with_return(value: Value) -> Value {
    let mut frame = call_frame("compute", "42", 9);
    frame["returnValue"] = value;
    frame
}

fn drain(receiver: &mut UnboundedReceiver<HookEvent>) -> Vec<HookEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_return_hook_without_return_point_fails_at_start() {
    init::init_test_environment();
    info!("Testing that an impossible return override is rejected when arming");

    let mock = MockProtocol::new();
    let (hooks, _events) = manager(&mock);
    parse_app_script(&mock, &hooks).await;

    hooks.add_hook(override_return(10, 3, "42")).unwrap();
    let err = hooks.start().await.unwrap_err();

    let HookError::Arm { source, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(matches!(
        source,
        DebuggerError::NoReturnPoint { line_number: 9, column_number: 2, .. }
    ));
    assert!(err.to_string().contains("cannot find a return point"));
    assert!(err.to_string().contains("app.js:9:2"));
    assert_eq!(hooks.status(), HookStatus::Idle);
    assert_eq!(hooks.active_count(), 0);
    assert_eq!(mock.count("Debugger.setBreakpointByUrl"), 0);
    assert_eq!(mock.count("Debugger.disable"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_return_hook_on_unparsed_script_fails() {
    init::init_test_environment();

    let mock = MockProtocol::new();
    let (hooks, _events) = manager(&mock);
    hooks.add_hook(override_return(1, 1, "null")).unwrap();

    let err = hooks.start().await.unwrap_err();
    assert!(matches!(err, HookError::Arm { source: DebuggerError::ScriptNotParsed(_), .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_definitions_are_rejected_before_any_traffic() {
    init::init_test_environment();

    let mock = MockProtocol::new();
    let (hooks, _events) = manager(&mock);

    let no_code = LiveHookDef { code: None, ..inject(1, 1, "x") };
    assert_eq!(hooks.add_hook(no_code).unwrap_err(), HookError::MissingCode);
    let bad_type = LiveHookDef { hook_type: Some("patch".into()), ..inject(1, 1, "x") };
    assert!(matches!(hooks.add_hook(bad_type), Err(HookError::InvalidHookType(_))));

    assert!(hooks.hooks().is_empty());
    assert!(mock.sent().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inject_hook_runs_code_and_resumes() {
    init::init_test_environment();

    let mock = MockProtocol::new();
    let (hooks, mut events) = manager(&mock);
    hooks.add_hook(inject(5, 1, "window.__hits = (window.__hits || 0) + 1")).unwrap();
    hooks.start().await.unwrap();
    assert_eq!(hooks.status(), HookStatus::Running);
    assert_eq!(hooks.start().await.unwrap_err(), HookError::AlreadyRunning);

    let armed = mock.params_of("Debugger.setBreakpointByUrl");
    assert_eq!(armed, vec![json!({ "url": APP_URL, "lineNumber": 4, "columnNumber": 0 })]);

    mock.push_event(paused(vec![call_frame("handler", "42", 4)], &["bp-1"]));
    assert!(mock.wait_for("Debugger.resume", 1, TIMEOUT).await);

    let evaluated = mock.params_of("Debugger.evaluateOnCallFrame");
    assert_eq!(evaluated.len(), 1);
    assert_eq!(evaluated[0]["expression"], "window.__hits = (window.__hits || 0) + 1");
    assert_eq!(evaluated[0]["callFrameId"], "frame-handler");

    let kinds = drain(&mut events);
    assert!(kinds.contains(&HookEventKind::Log { message: "Hooks armed".into() }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_from_other_breakpoint_is_left_alone() {
    init::init_test_environment();

    let mock = MockProtocol::new();
    let (hooks, _events) = manager(&mock);
    hooks.add_hook(inject(5, 1, "1")).unwrap();
    hooks.start().await.unwrap();

    mock.push_event(paused(vec![call_frame("other", "42", 20)], &["bp-99"]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.count("Debugger.evaluateOnCallFrame"), 0);
    assert_eq!(mock.count("Debugger.resume"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_falsy_condition_skips_hook() {
    init::init_test_environment();

    let mock = MockProtocol::new();
    let (hooks, _events) = manager(&mock);
    hooks
        .add_hook(LiveHookDef { condition: Some("user.id === 7".into()), ..inject(5, 1, "1") })
        .unwrap();
    hooks.start().await.unwrap();

    mock.respond(
        "Debugger.evaluateOnCallFrame",
        json!({ "result": { "type": "boolean", "value": false } }),
    );
    mock.push_event(paused(vec![call_frame("handler", "42", 4)], &["bp-1"]));
    assert!(mock.wait_for("Debugger.resume", 1, TIMEOUT).await);

    let evaluated = mock.params_of("Debugger.evaluateOnCallFrame");
    assert_eq!(evaluated.len(), 1);
    assert_eq!(evaluated[0]["expression"], "(user.id === 7)");
    assert_eq!(evaluated[0]["returnByValue"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_return_override_at_nearest_return_point() {
    init::init_test_environment();

    let mock = MockProtocol::new();
    let (hooks, _events) = manager(&mock);
    parse_app_script(&mock, &hooks).await;
    mock.respond(
        "Debugger.getPossibleBreakpoints",
        json!({ "locations": [
            { "scriptId": "42", "lineNumber": 9, "columnNumber": 2, "type": "call" },
            { "scriptId": "42", "lineNumber": 11, "columnNumber": 4, "type": "return" },
        ]}),
    );

    hooks.add_hook(override_return(10, 3, "{ patched: true }")).unwrap();
    hooks.start().await.unwrap();

    let lookup = &mock.params_of("Debugger.getPossibleBreakpoints")[0];
    assert_eq!(lookup["restrictToFunction"], true);
    assert_eq!(lookup["start"]["lineNumber"], 9);
    let armed = mock.params_of("Debugger.setBreakpointByUrl");
    assert_eq!(armed[0]["lineNumber"], 11);
    assert_eq!(armed[0]["columnNumber"], 4);

    mock.respond(
        "Debugger.evaluateOnCallFrame",
        json!({ "result": { "type": "object", "objectId": "patched-1" } }),
    );
    mock.push_event(paused(
        vec![frame_with_return(json!({ "type": "number", "value": 1 }))],
        &["bp-1"],
    ));
    assert!(mock.wait_for("Debugger.resume", 1, TIMEOUT).await);

    assert_eq!(
        mock.params_of("Debugger.setReturnValue"),
        vec![json!({ "newValue": { "objectId": "patched-1" } })]
    );
    assert_eq!(
        mock.params_of("Debugger.evaluateOnCallFrame")[0]["expression"],
        "({ patched: true })"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_promise_return_is_skipped_with_warning() {
    init::init_test_environment();

    let mock = MockProtocol::new();
    let (hooks, mut events) = manager(&mock);
    parse_app_script(&mock, &hooks).await;
    mock.respond(
        "Debugger.getPossibleBreakpoints",
        json!({ "locations": [
            { "scriptId": "42", "lineNumber": 3, "columnNumber": 0, "type": "return" },
        ]}),
    );
    hooks.add_hook(override_return(1, 1, "null")).unwrap();
    hooks.start().await.unwrap();

    let promise = json!({ "type": "object", "subtype": "promise", "objectId": "p-1" });
    mock.push_event(paused(vec![frame_with_return(promise)], &["bp-1"]));
    assert!(mock.wait_for("Debugger.resume", 1, TIMEOUT).await);
    assert_eq!(mock.count("Debugger.setReturnValue"), 0);

    let warned = wait::collect_until(&mut events, TIMEOUT, |e| {
        matches!(e.kind, HookEventKind::Warn { .. })
    })
    .await;
    let HookEventKind::Warn { message } = &warned.last().unwrap().kind else {
        unreachable!();
    };
    assert!(message.contains("returns a Promise"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_return_hook_hit_outside_return_point_reports_error() {
    init::init_test_environment();

    let mock = MockProtocol::new();
    let (hooks, mut events) = manager(&mock);
    parse_app_script(&mock, &hooks).await;
    mock.respond(
        "Debugger.getPossibleBreakpoints",
        json!({ "locations": [
            { "scriptId": "42", "lineNumber": 3, "columnNumber": 0, "type": "return" },
        ]}),
    );
    hooks.add_hook(override_return(1, 1, "null")).unwrap();
    hooks.start().await.unwrap();

    mock.push_event(paused(vec![call_frame("compute", "42", 0)], &["bp-1"]));
    let reported = wait::collect_until(&mut events, TIMEOUT, |e| {
        matches!(e.kind, HookEventKind::Error { .. })
    })
    .await;
    let HookEventKind::Error { message } = &reported.last().unwrap().kind else {
        unreachable!();
    };
    assert!(message.contains("is not a return point"));
    assert!(mock.wait_for("Debugger.resume", 1, TIMEOUT).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_removes_breakpoints_and_forgets_hooks() {
    init::init_test_environment();

    let mock = MockProtocol::new();
    let (hooks, mut events) = manager(&mock);
    hooks.add_hook(inject(5, 1, "a()")).unwrap();
    hooks.add_hook(inject(8, 1, "b()")).unwrap();
    hooks.start().await.unwrap();
    assert_eq!(hooks.active_count(), 2);

    hooks.stop().await;

    let mut removed: Vec<String> = mock
        .params_of("Debugger.removeBreakpoint")
        .iter()
        .filter_map(|p| p["breakpointId"].as_str().map(str::to_string))
        .collect();
    removed.sort();
    assert_eq!(removed, vec!["bp-1", "bp-2"]);
    assert_eq!(mock.count("Debugger.disable"), 1);
    assert_eq!(hooks.status(), HookStatus::Idle);
    assert!(hooks.hooks().is_empty());
    assert_eq!(hooks.active_count(), 0);

    let kinds = drain(&mut events);
    assert_eq!(kinds.last(), Some(&HookEventKind::Log { message: "Hooks disarmed".into() }));
}
