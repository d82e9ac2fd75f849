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

//! Test utilities for integration tests

/// Initialization utilities for tests
pub mod init {
    /// Initialize logging for a test; safe to call from every test
    pub fn init_test_environment() {
        heapdbg_common::logging::ensure_test_logging(None);
    }
}

/// Scripted in-memory protocol transport
pub mod mock {
    use std::{
        collections::{HashMap, VecDeque},
        sync::Arc,
        time::Duration,
    };

    use futures::future::BoxFuture;
    use heapdbg_engine::{ProtocolClient, ProtocolError, ProtocolEvent, EVENT_CHANNEL_CAPACITY};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tokio::sync::broadcast;
    use tracing::debug;

    /// Events emitted right after a command is answered
    pub type Reaction = Arc<dyn Fn(&Value) -> Vec<ProtocolEvent> + Send + Sync>;

    /// One command received by the mock
    #[derive(Debug, Clone, PartialEq)]
    pub struct SentCommand {
        /// Method name
        pub method: String,
        /// Parameters
        pub params: Value,
    }

    #[derive(Default)]
    struct MockState {
        sent: Vec<SentCommand>,
        scripted: HashMap<String, VecDeque<Result<Value, ProtocolError>>>,
        defaults: HashMap<String, Value>,
        reactions: HashMap<String, Reaction>,
        delays: HashMap<String, Duration>,
        next_breakpoint: u64,
    }

    impl MockState {
        fn default_response(&mut self, method: &str) -> Value {
            if let Some(value) = self.defaults.get(method) {
                return value.clone();
            }
            match method {
                "Debugger.enable" => json!({ "debuggerId": "mock-debugger" }),
                "Debugger.setBreakpoint"
                | "Debugger.setBreakpointByUrl"
                | "Debugger.setBreakpointOnFunctionCall" => {
                    self.next_breakpoint += 1;
                    let breakpoint_id = format!("bp-{}", self.next_breakpoint);
                    json!({ "breakpointId": breakpoint_id, "locations": [] })
                }
                "Debugger.evaluateOnCallFrame" | "Runtime.evaluate" | "Runtime.callFunctionOn" => {
                    json!({ "result": { "type": "undefined" } })
                }
                "Debugger.getScriptSource" => json!({ "scriptSource": "" }),
                "Debugger.getPossibleBreakpoints" => json!({ "locations": [] }),
                _ => json!({}),
            }
        }
    }

    /// [`ProtocolClient`] answering from a script.
    ///
    /// Unscripted commands get a plausible default answer: fresh breakpoint
    /// ids, `undefined` evaluation results, empty location lists and `{}`.
    pub struct MockProtocol {
        events: broadcast::Sender<ProtocolEvent>,
        state: Mutex<MockState>,
    }

    impl std::fmt::Debug for MockProtocol {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockProtocol").field("sent", &self.state.lock().sent.len()).finish()
        }
    }

    impl MockProtocol {
        /// Create a mock with no scripted answers
        pub fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            Arc::new(Self { events, state: Mutex::new(MockState::default()) })
        }

        /// Answer the next `method` call with `value`
        pub fn respond(&self, method: &str, value: Value) {
            self.state.lock().scripted.entry(method.to_string()).or_default().push_back(Ok(value));
        }

        /// Fail the next `method` call with `error`
        pub fn fail(&self, method: &str, error: ProtocolError) {
            self.state.lock().scripted.entry(method.to_string()).or_default().push_back(Err(error));
        }

        /// Answer every unscripted `method` call with `value`
        pub fn set_default(&self, method: &str, value: Value) {
            self.state.lock().defaults.insert(method.to_string(), value);
        }

        /// Hold every `method` answer back for `delay`
        pub fn delay(&self, method: &str, delay: Duration) {
            self.state.lock().delays.insert(method.to_string(), delay);
        }

        /// Emit the events produced by `reaction` whenever `method` is called
        pub fn react<F>(&self, method: &str, reaction: F)
        where
            F: Fn(&Value) -> Vec<ProtocolEvent> + Send + Sync + 'static,
        {
            self.state.lock().reactions.insert(method.to_string(), Arc::new(reaction));
        }

        /// Deliver an event to every subscriber
        pub fn push_event(&self, event: ProtocolEvent) {
            debug!(method = %event.method, "Mock event");
            // Nobody listening is fine.
            let _ = self.events.send(event);
        }

        /// Every command received so far
        pub fn sent(&self) -> Vec<SentCommand> {
            self.state.lock().sent.clone()
        }

        /// Method names of every command received so far
        pub fn sent_methods(&self) -> Vec<String> {
            self.state.lock().sent.iter().map(|c| c.method.clone()).collect()
        }

        /// Number of `method` calls
        pub fn count(&self, method: &str) -> usize {
            self.state.lock().sent.iter().filter(|c| c.method == method).count()
        }

        /// Parameters of every `method` call
        pub fn params_of(&self, method: &str) -> Vec<Value> {
            self.state
                .lock()
                .sent
                .iter()
                .filter(|c| c.method == method)
                .map(|c| c.params.clone())
                .collect()
        }

        /// Wait until `method` has been called at least `times` times
        pub async fn wait_for(&self, method: &str, times: usize, timeout: Duration) -> bool {
            let waiting = async {
                while self.count(method) < times {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            };
            tokio::time::timeout(timeout, waiting).await.is_ok()
        }
    }

    impl ProtocolClient for MockProtocol {
        fn send(&self, method: &str, params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
            let (response, reaction, delay) = {
                let mut state = self.state.lock();
                state.sent.push(SentCommand { method: method.to_string(), params: params.clone() });
                let scripted = state.scripted.get_mut(method).and_then(VecDeque::pop_front);
                let response = match scripted {
                    Some(response) => response,
                    None => Ok(state.default_response(method)),
                };
                let delay = state.delays.get(method).copied();
                (response, state.reactions.get(method).cloned(), delay)
            };

            if let Some(reaction) = reaction {
                for event in reaction(&params) {
                    self.push_event(event);
                }
            }
            Box::pin(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                response
            })
        }

        fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
            self.events.subscribe()
        }
    }
}

/// Builders for protocol events
pub mod events {
    use heapdbg_engine::ProtocolEvent;
    use serde_json::{json, Value};

    /// A call frame of function `name` starting at `line` of script `script_id`
    pub fn call_frame(name: &str, script_id: &str, line: u32) -> Value {
        json!({
            "callFrameId": format!("frame-{name}"),
            "functionName": name,
            "location": { "scriptId": script_id, "lineNumber": line + 2, "columnNumber": 4 },
            "functionLocation": { "scriptId": script_id, "lineNumber": line, "columnNumber": 0 },
            "url": "",
            "scopeChain": [],
        })
    }

    /// `Debugger.paused` with the given stack
    pub fn paused(frames: Vec<Value>, hit_breakpoints: &[&str]) -> ProtocolEvent {
        ProtocolEvent::new(
            "Debugger.paused",
            json!({ "callFrames": frames, "reason": "other", "hitBreakpoints": hit_breakpoints }),
        )
    }

    /// The pause of step `step`: function `fn{step}` starting at line `10 * step`
    pub fn paused_at_step(step: u64) -> ProtocolEvent {
        paused(vec![call_frame(&format!("fn{step}"), "7", step as u32 * 10)], &[])
    }

    /// `Debugger.scriptParsed`
    pub fn script_parsed(script_id: &str, url: &str, hash: &str) -> ProtocolEvent {
        ProtocolEvent::new(
            "Debugger.scriptParsed",
            json!({ "scriptId": script_id, "url": url, "hash": hash }),
        )
    }
}

/// Helpers to wait on event channels
pub mod wait {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    /// Receive events until `last` matches one, failing the test after `timeout`
    pub async fn collect_until<T, F>(
        receiver: &mut UnboundedReceiver<T>,
        timeout: Duration,
        last: F,
    ) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut collected = Vec::new();
        let receiving = async {
            while let Some(event) = receiver.recv().await {
                let done = last(&event);
                collected.push(event);
                if done {
                    break;
                }
            }
        };
        if tokio::time::timeout(timeout, receiving).await.is_err() {
            panic!("timed out after {timeout:?} waiting for the final event");
        }
        collected
    }

    /// Poll `condition` every few milliseconds until it holds or `timeout` elapses
    pub async fn until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
        let polling = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, polling).await.is_ok()
    }
}
