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


use std::{
    fmt,
    sync::{Arc, Weak},
};

use heapdbg_common::{
    BreakLocation, Breakpoint, BreakpointLocation, CallFrame, Location, ParsedScript, PausedEvent,
    RemoteObject,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    BlackboxConfig, Blackboxer, DebuggerError, ProtocolError, ProtocolEvent, ScriptRegistry,
    SharedProtocol,
};

/// Upper bound used when a range end is left open
const OPEN_RANGE_END: u32 = 99_999;

/// Kinds of events a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    /// The debuggee stopped
    Paused,
    /// The debuggee resumed
    Resumed,
    /// A script was parsed and registered
    ScriptParsed,
}

/// An event delivered to session handlers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The debuggee stopped
    Paused(PausedEvent),
    /// The debuggee resumed
    Resumed,
    /// A script was parsed; `blacklisted` is already resolved
    ScriptParsed(ParsedScript),
}

impl SessionEvent {
    /// The kind of this event
    pub fn kind(&self) -> SessionEventKind {
        match self {
            Self::Paused(_) => SessionEventKind::Paused,
            Self::Resumed => SessionEventKind::Resumed,
            Self::ScriptParsed(_) => SessionEventKind::ScriptParsed,
        }
    }
}

/// Callback invoked from the session's event pump. Must not block.
pub type EventHandler = Arc<dyn Fn(SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    paused: Option<EventHandler>,
    resumed: Option<EventHandler>,
    script_parsed: Option<EventHandler>,
}

impl Handlers {
    fn slot(&mut self, kind: SessionEventKind) -> &mut Option<EventHandler> {
        match kind {
            SessionEventKind::Paused => &mut self.paused,
            SessionEventKind::Resumed => &mut self.resumed,
            SessionEventKind::ScriptParsed => &mut self.script_parsed,
        }
    }

    fn get(&self, kind: SessionEventKind) -> Option<EventHandler> {
        match kind {
            SessionEventKind::Paused => self.paused.clone(),
            SessionEventKind::Resumed => self.resumed.clone(),
            SessionEventKind::ScriptParsed => self.script_parsed.clone(),
        }
    }
}

struct SessionState {
    enabled: bool,
    handlers: Handlers,
    scripts: ScriptRegistry,
    blackbox: Blackboxer,
    pump: Option<JoinHandle<()>>,
}

struct SessionInner {
    client: SharedProtocol,
    state: Mutex<SessionState>,
}

/// Handle to the debugging session of one target.
///
/// Cloning the handle is cheap; all clones share the same state.
#[derive(Clone)]
pub struct DebuggerSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for DebuggerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DebuggerSession")
            .field("enabled", &state.enabled)
            .field("scripts", &state.scripts.len())
            .field("blackbox_patterns", &state.blackbox.patterns().len())
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakpointIdResponse {
    breakpoint_id: String,
}

#[derive(Deserialize)]
struct LocationsResponse {
    #[serde(default)]
    locations: Vec<BreakLocation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptSourceResponse {
    script_source: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionDetails {
    #[serde(default)]
    text: String,
    #[serde(default)]
    exception: Option<RemoteObject>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluationResponse {
    result: RemoteObject,
    #[serde(default)]
    exception_details: Option<ExceptionDetails>,
}

impl EvaluationResponse {
    fn into_result(self) -> Result<RemoteObject, DebuggerError> {
        match self.exception_details {
            Some(details) => {
                let message = details
                    .exception
                    .and_then(|e| e.description)
                    .unwrap_or(details.text);
                Err(DebuggerError::Evaluation(message))
            }
            None => Ok(self.result),
        }
    }
}

impl DebuggerSession {
    /// Create a disabled session over `client`.
    pub fn new(client: SharedProtocol, blackbox: BlackboxConfig) -> Self {
        let state = SessionState {
            enabled: false,
            handlers: Handlers::default(),
            scripts: ScriptRegistry::default(),
            blackbox: Blackboxer::new(blackbox),
            pump: None,
        };
        Self { inner: Arc::new(SessionInner { client, state: Mutex::new(state) }) }
    }

    /// Create a session with the default blackbox lists.
    pub fn with_defaults(client: SharedProtocol) -> Self {
        Self::new(client, BlackboxConfig::default())
    }

    /// The underlying protocol connection
    pub fn client(&self) -> &SharedProtocol {
        &self.inner.client
    }

    /// Whether event subscriptions are installed
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    /// Register the handler for `kind`, replacing any previous one.
    ///
    /// Handlers can only be changed while the session is disabled.
    pub fn on<F>(&self, kind: SessionEventKind, handler: F) -> Result<(), DebuggerError>
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.enabled {
            return Err(DebuggerError::HandlersLocked);
        }
        *state.handlers.slot(kind) = Some(Arc::new(handler));
        Ok(())
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, DebuggerError> {
        debug!(method, "Debugger call");
        Ok(self.inner.client.send(method, params).await?)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, DebuggerError> {
        let raw = self.send(method, params).await?;
        serde_json::from_value(raw).map_err(|e| {
            ProtocolError::UnexpectedResponse { method: method.to_string(), reason: e.to_string() }
                .into()
        })
    }

    /// Install event subscriptions, enable the debugger domain and push the blackbox patterns.
    ///
    /// Does nothing when already enabled.
    pub async fn enable(&self) -> Result<(), DebuggerError> {
        {
            let mut state = self.inner.state.lock();
            if state.enabled {
                return Ok(());
            }
            state.enabled = true;
            let events = self.inner.client.subscribe();
            state.pump = Some(tokio::spawn(pump_events(Arc::downgrade(&self.inner), events)));
        }

        info!("Enabling debugger");
        if let Err(e) = self.send("Debugger.enable", json!({})).await {
            self.teardown();
            return Err(e);
        }
        self.push_blackbox_patterns().await
    }

    /// Drop the event subscriptions and disable the debugger domain.
    ///
    /// Does nothing when already disabled.
    pub async fn disable(&self) -> Result<(), DebuggerError> {
        if !self.teardown() {
            return Ok(());
        }
        info!("Disabling debugger");
        self.send("Debugger.disable", json!({})).await.map(|_| ())
    }

    /// Stop the event pump; returns whether the session was enabled.
    fn teardown(&self) -> bool {
        let mut state = self.inner.state.lock();
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        std::mem::replace(&mut state.enabled, false)
    }

    async fn push_blackbox_patterns(&self) -> Result<(), DebuggerError> {
        let patterns = self.blackbox_patterns();
        self.send("Debugger.setBlackboxPatterns", json!({ "patterns": patterns })).await?;
        Ok(())
    }

    fn notify(&self, event: SessionEvent) {
        let handler = self.inner.state.lock().handlers.get(event.kind());
        if let Some(handler) = handler {
            handler(event);
        }
    }

    async fn dispatch(&self, event: ProtocolEvent) {
        match event.method.as_str() {
            "Debugger.paused" => match serde_json::from_value::<PausedEvent>(event.params) {
                Ok(paused) => self.notify(SessionEvent::Paused(paused)),
                Err(e) => warn!(error = %e, "Malformed Debugger.paused event"),
            },
            "Debugger.resumed" => self.notify(SessionEvent::Resumed),
            "Debugger.scriptParsed" => match serde_json::from_value::<ParsedScript>(event.params) {
                Ok(script) => self.on_script_parsed(script).await,
                Err(e) => warn!(error = %e, "Malformed Debugger.scriptParsed event"),
            },
            _ => {}
        }
    }

    async fn on_script_parsed(&self, mut script: ParsedScript) {
        if script.is_internal() {
            debug!(script_id = %script.script_id, url = %script.url, "Ignoring internal script");
            return;
        }
        let (verdict, patterns) = {
            let mut state = self.inner.state.lock();
            let verdict = state.blackbox.observe(&script.url, false);
            let patterns = verdict.added.then(|| state.blackbox.patterns().to_vec());
            (verdict, patterns)
        };

        if let Some(patterns) = patterns {
            debug!(url = %script.url, "Blackboxed script");
            if let Err(e) =
                self.send("Debugger.setBlackboxPatterns", json!({ "patterns": patterns })).await
            {
                warn!(error = %e, "Failed to push blackbox patterns");
            }
        }

        script.blacklisted = verdict.blacklisted;
        self.inner.state.lock().scripts.insert(script.clone());
        self.notify(SessionEvent::ScriptParsed(script));
    }

    /// Every parsed script, annotated with its blackbox status
    pub fn parsed_scripts(&self) -> Vec<ParsedScript> {
        self.inner.state.lock().scripts.list()
    }

    /// URL of a parsed script
    pub fn script_url(&self, script_id: &str) -> Option<String> {
        self.inner.state.lock().scripts.url_of(script_id).map(str::to_string)
    }

    /// Id of the script parsed from `url`
    pub fn script_id(&self, url: &str) -> Option<String> {
        self.inner.state.lock().scripts.id_of(url).map(str::to_string)
    }

    /// Current blackbox pattern set
    pub fn blackbox_patterns(&self) -> Vec<String> {
        self.inner.state.lock().blackbox.patterns().to_vec()
    }

    /// Enable the session if needed and pause execution
    pub async fn pause(&self) -> Result<(), DebuggerError> {
        self.enable().await?;
        self.send("Debugger.pause", json!({})).await.map(|_| ())
    }

    /// Resume execution
    pub async fn resume(&self) -> Result<(), DebuggerError> {
        self.send("Debugger.resume", json!({})).await.map(|_| ())
    }

    /// Step into the next call
    pub async fn step_into(&self) -> Result<(), DebuggerError> {
        self.send("Debugger.stepInto", json!({})).await.map(|_| ())
    }

    /// Step over the next statement
    pub async fn step_over(&self) -> Result<(), DebuggerError> {
        self.send("Debugger.stepOver", json!({})).await.map(|_| ())
    }

    /// Run until the current function returns
    pub async fn step_out(&self) -> Result<(), DebuggerError> {
        self.send("Debugger.stepOut", json!({})).await.map(|_| ())
    }

    /// Set a breakpoint at an exact script location
    pub async fn set_breakpoint(
        &self,
        location: &Location,
        condition: Option<&str>,
    ) -> Result<String, DebuggerError> {
        let mut params = json!({ "location": location });
        if let Some(condition) = condition {
            params["condition"] = json!(condition);
        }
        let response: BreakpointIdResponse = self.call("Debugger.setBreakpoint", params).await?;
        Ok(response.breakpoint_id)
    }

    /// Set a breakpoint in every script loaded from `url`
    pub async fn set_breakpoint_by_url(
        &self,
        url: &str,
        line_number: u32,
        column_number: u32,
        condition: Option<&str>,
    ) -> Result<String, DebuggerError> {
        self.enable().await?;
        let mut params =
            json!({ "url": url, "lineNumber": line_number, "columnNumber": column_number });
        if let Some(condition) = condition {
            params["condition"] = json!(condition);
        }
        let response: BreakpointIdResponse =
            self.call("Debugger.setBreakpointByUrl", params).await?;
        Ok(response.breakpoint_id)
    }

    /// Stop on the next call of a live function object
    pub async fn set_breakpoint_on_function_call(
        &self,
        object_id: &str,
        condition: Option<&str>,
    ) -> Result<String, DebuggerError> {
        let mut params = json!({ "objectId": object_id });
        if let Some(condition) = condition {
            params["condition"] = json!(condition);
        }
        let response: BreakpointIdResponse =
            self.call("Debugger.setBreakpointOnFunctionCall", params).await?;
        Ok(response.breakpoint_id)
    }

    /// Arm a [`Breakpoint`], returning the protocol's breakpoint id
    pub async fn set_breakpoint_at(
        &self,
        breakpoint: &Breakpoint,
    ) -> Result<String, DebuggerError> {
        let condition = breakpoint.condition.as_deref();
        match &breakpoint.loc {
            BreakpointLocation::Script { script_id, line_number, column_number } => {
                let location = Location::new(script_id.clone(), *line_number, *column_number);
                self.set_breakpoint(&location, condition).await
            }
            BreakpointLocation::Url { url, line_number, column_number } => {
                self.set_breakpoint_by_url(url, *line_number, *column_number, condition).await
            }
            BreakpointLocation::FunctionCall { object_id } => {
                self.set_breakpoint_on_function_call(object_id, condition).await
            }
        }
    }

    /// Toggle the instrumentation breakpoint that stops before every return
    pub async fn set_before_return_breakpoint(&self, enabled: bool) -> Result<(), DebuggerError> {
        let method = if enabled {
            "Debugger.setInstrumentationBreakpoint"
        } else {
            "Debugger.removeInstrumentationBreakpoint"
        };
        self.send(method, json!({ "instrumentation": "beforeReturn" })).await.map(|_| ())
    }

    /// Remove a breakpoint by id
    pub async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<(), DebuggerError> {
        self.send("Debugger.removeBreakpoint", json!({ "breakpointId": breakpoint_id }))
            .await
            .map(|_| ())
    }

    /// Possible breakpoint locations of a script between `start` and `end` (line, column)
    pub async fn get_possible_breakpoints(
        &self,
        script_id: &str,
        start: Option<(u32, u32)>,
        end: Option<(u32, u32)>,
    ) -> Result<Vec<BreakLocation>, DebuggerError> {
        let (start_line, start_col) = start.unwrap_or((0, 0));
        let (end_line, end_col) = end.unwrap_or((OPEN_RANGE_END, OPEN_RANGE_END));
        let response: LocationsResponse = self
            .call(
                "Debugger.getPossibleBreakpoints",
                json!({
                    "start": Location::new(script_id, start_line, start_col),
                    "end": Location::new(script_id, end_line, end_col),
                    "restrictToFunction": false,
                }),
            )
            .await?;
        Ok(response.locations)
    }

    /// Possible breakpoint locations of the function starting at `line:column`
    pub async fn get_possible_breakpoints_in_function(
        &self,
        script_id: &str,
        line_number: u32,
        column_number: u32,
    ) -> Result<Vec<BreakLocation>, DebuggerError> {
        let response: LocationsResponse = self
            .call(
                "Debugger.getPossibleBreakpoints",
                json!({
                    "start": Location::new(script_id, line_number, column_number),
                    "end": {
                        "scriptId": script_id,
                        "lineNumber": line_number.saturating_add(OPEN_RANGE_END),
                    },
                    "restrictToFunction": true,
                }),
            )
            .await?;
        Ok(response.locations)
    }

    /// Nearest `return` break location of the function starting at `line:column`
    pub async fn resolve_return_point(
        &self,
        script_id: &str,
        line_number: u32,
        column_number: u32,
    ) -> Result<BreakLocation, DebuggerError> {
        self.get_possible_breakpoints_in_function(script_id, line_number, column_number)
            .await?
            .into_iter()
            .find(BreakLocation::is_return)
            .ok_or_else(|| DebuggerError::NoReturnPoint {
                script_id: script_id.to_string(),
                line_number,
                column_number,
            })
    }

    /// Set a breakpoint on the first breakable location of a script
    pub async fn set_breakpoint_on_first_instruction(
        &self,
        script_id: &str,
    ) -> Result<String, DebuggerError> {
        let first = self
            .get_possible_breakpoints(script_id, None, None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DebuggerError::NoInstructions(script_id.to_string()))?;
        self.set_breakpoint(&first.location(), None).await
    }

    /// Toggle a breakpoint on every `click` event listener
    pub async fn set_dom_click_breakpoint(&self, enabled: bool) -> Result<(), DebuggerError> {
        self.enable().await?;
        let method = if enabled {
            "DOMDebugger.setEventListenerBreakpoint"
        } else {
            "DOMDebugger.removeEventListenerBreakpoint"
        };
        self.send(method, json!({ "eventName": "click", "targetName": "*" })).await.map(|_| ())
    }

    /// Full source text of a script
    pub async fn get_script_source(&self, script_id: &str) -> Result<String, DebuggerError> {
        let response: ScriptSourceResponse =
            self.call("Debugger.getScriptSource", json!({ "scriptId": script_id })).await?;
        Ok(response.script_source)
    }

    /// Evaluate `expression` in the scope of a paused frame
    pub async fn evaluate_on_call_frame(
        &self,
        call_frame_id: &str,
        expression: &str,
        return_by_value: bool,
    ) -> Result<RemoteObject, DebuggerError> {
        let response: EvaluationResponse = self
            .call(
                "Debugger.evaluateOnCallFrame",
                json!({
                    "callFrameId": call_frame_id,
                    "expression": expression,
                    "returnByValue": return_by_value,
                }),
            )
            .await?;
        response.into_result()
    }

    /// Call `function_declaration` with `this` bound to a remote object
    pub async fn call_function_on(
        &self,
        object_id: &str,
        function_declaration: &str,
        arguments: Vec<Value>,
        return_by_value: bool,
    ) -> Result<RemoteObject, DebuggerError> {
        let response: EvaluationResponse = self
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": function_declaration,
                    "arguments": arguments,
                    "returnByValue": return_by_value,
                }),
            )
            .await?;
        response.into_result()
    }

    /// Replace the value a frame paused at a return point is about to return.
    ///
    /// `expression` is evaluated in the frame. Rejects frames without a return
    /// slot and promise results.
    pub async fn set_return_value(
        &self,
        frame: &CallFrame,
        expression: &str,
    ) -> Result<(), DebuggerError> {
        let Some(current) = &frame.return_value else {
            return Err(DebuggerError::NoReturnSlot);
        };
        if current.is_promise() {
            return Err(DebuggerError::PromiseReturn);
        }

        let value = self
            .evaluate_on_call_frame(&frame.call_frame_id, &format!("({expression})"), false)
            .await?;
        self.send("Debugger.setReturnValue", json!({ "newValue": value.to_call_argument() }))
            .await
            .map(|_| ())
    }
}

/// Forward protocol events to the session until it is disabled or dropped.
async fn pump_events(session: Weak<SessionInner>, mut events: broadcast::Receiver<ProtocolEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Debugger event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(inner) = session.upgrade() else {
            break;
        };
        DebuggerSession { inner }.dispatch(event).await;
    }
    debug!("Debugger event pump stopped");
}
