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
    collections::HashMap,
    sync::{Arc, Weak},
};

use futures::future::BoxFuture;
use heapdbg_common::{CallFrame, PausedEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{HookAction, HookError, HookEvent, HookEventKind, HookStatus, LiveHook, LiveHookDef};
use crate::{DebuggerError, DebuggerSession, DebuggerStateMachine, PauseHandler};

#[derive(Debug, Default)]
struct HookState {
    status: HookStatus,
    registered: Vec<LiveHook>,
    /// Armed hooks by breakpoint id
    active: HashMap<String, LiveHook>,
}

struct HookInner {
    machine: DebuggerStateMachine<HookInner>,
    events: mpsc::UnboundedSender<HookEvent>,
    state: Mutex<HookState>,
}

/// Arms registered [`LiveHook`]s on a session and applies them on every hit.
pub struct LiveHookManager {
    inner: Arc<HookInner>,
}

impl std::fmt::Debug for LiveHookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LiveHookManager")
            .field("status", &state.status)
            .field("registered", &state.registered.len())
            .field("active", &state.active.len())
            .finish()
    }
}

impl LiveHookManager {
    /// Bind a manager to a disabled `session`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        session: DebuggerSession,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HookEvent>), HookError> {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<HookInner>| HookInner {
            machine: DebuggerStateMachine::new(session, weak.clone()),
            events,
            state: Mutex::new(HookState::default()),
        });
        inner.machine.attach()?;
        Ok((Self { inner }, receiver))
    }

    /// Validate and register a hook. It is armed by the next [`start`](Self::start).
    pub fn add_hook(&self, def: LiveHookDef) -> Result<(), HookError> {
        let hook = LiveHook::from_def(def)?;
        {
            let mut state = self.inner.state.lock();
            if state.status == HookStatus::Running {
                return Err(HookError::Running);
            }
            state.registered.push(hook.clone());
        }
        self.inner.log(format!("Hook registered at {hook}"));
        Ok(())
    }

    /// Registered hooks
    pub fn hooks(&self) -> Vec<LiveHook> {
        self.inner.state.lock().registered.clone()
    }

    /// Number of armed hooks
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Current state
    pub fn status(&self) -> HookStatus {
        self.inner.state.lock().status
    }

    /// The bound session
    pub fn session(&self) -> &DebuggerSession {
        self.inner.machine.session()
    }

    /// Arm every registered hook.
    ///
    /// Return hooks are moved to the nearest return point of the function
    /// starting at their position. If any hook cannot be armed, the hooks armed
    /// so far are removed and the manager returns to idle.
    pub async fn start(&self) -> Result<(), HookError> {
        let hooks = {
            let mut state = self.inner.state.lock();
            if state.status == HookStatus::Running {
                return Err(HookError::AlreadyRunning);
            }
            state.status = HookStatus::Running;
            state.registered.clone()
        };
        self.inner.machine.reset();

        if let Err(e) = self.arm_all(hooks).await {
            warn!(error = %e, "Arming live hooks failed");
            self.disarm().await;
            return Err(e);
        }
        info!(hooks = self.active_count(), "Live hooks armed");
        self.inner.log("Hooks armed".to_string());
        Ok(())
    }

    async fn arm_all(&self, hooks: Vec<LiveHook>) -> Result<(), HookError> {
        let session = self.inner.machine.session();
        session.enable().await?;

        for hook in hooks {
            let (line, col) = self
                .breakpoint_position(&hook)
                .await
                .map_err(|source| HookError::Arm { hook: hook.to_string(), source })?;
            let breakpoint = session
                .set_breakpoint_by_url(&hook.file, line, col, None)
                .await
                .map_err(|source| HookError::Arm { hook: hook.to_string(), source })?;

            debug!(%breakpoint, %hook, line, col, "Hook armed");
            self.inner.log(format!("Hook {hook} activated at line {line}, col {col}"));
            self.inner.state.lock().active.insert(breakpoint, hook);
        }
        Ok(())
    }

    async fn breakpoint_position(&self, hook: &LiveHook) -> Result<(u32, u32), DebuggerError> {
        if !matches!(hook.action, HookAction::OverrideReturn(_)) {
            return Ok((hook.line, hook.col));
        }
        let session = self.inner.machine.session();
        let script_id = session
            .script_id(&hook.file)
            .ok_or_else(|| DebuggerError::ScriptNotParsed(hook.file.clone()))?;
        let point = session.resolve_return_point(&script_id, hook.line, hook.col).await?;
        Ok((point.line_number, point.column_number))
    }

    /// Remove every armed breakpoint, disable the session and forget all hooks.
    pub async fn stop(&self) {
        self.disarm().await;
        self.inner.state.lock().registered.clear();
        info!("Live hooks disarmed");
        self.inner.log("Hooks disarmed".to_string());
    }

    async fn disarm(&self) {
        let active: Vec<String> = {
            let mut state = self.inner.state.lock();
            state.status = HookStatus::Idle;
            state.active.drain().map(|(id, _)| id).collect()
        };
        self.inner.machine.reset();

        let session = self.inner.machine.session();
        for breakpoint in active {
            if let Err(e) = session.remove_breakpoint(&breakpoint).await {
                warn!(%breakpoint, error = %e, "Failed to remove hook breakpoint");
            }
        }
        if let Err(e) = session.disable().await {
            warn!(error = %e, "Failed to disable the debugger");
        }
    }
}

impl PauseHandler for HookInner {
    fn on_paused(self: Arc<Self>, event: PausedEvent) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(async move {
            let hook = {
                let state = self.state.lock();
                if state.status != HookStatus::Running {
                    return Ok(());
                }
                event.hit_breakpoints.iter().find_map(|id| state.active.get(id).cloned())
            };
            let (Some(hook), Some(frame)) = (hook, event.top_frame()) else {
                debug!(reason = %event.reason, "Pause not caused by a hook");
                return Ok(());
            };

            let applied = self.apply(&hook, frame).await;
            self.machine.session().resume().await?;
            applied.map_err(Into::into)
        })
    }

    fn on_error(self: Arc<Self>, error: eyre::Report) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.emit(HookEventKind::Error { message: format!("{error:#}") });
        })
    }
}

impl HookInner {
    fn emit(&self, kind: HookEventKind) {
        let current_status = self.state.lock().status;
        if self.events.send(HookEvent { kind, current_status }).is_err() {
            debug!("Hook event receiver dropped");
        }
    }

    fn log(&self, message: String) {
        self.emit(HookEventKind::Log { message });
    }

    async fn apply(&self, hook: &LiveHook, frame: &CallFrame) -> Result<(), DebuggerError> {
        let session = self.machine.session();
        if let Some(condition) = &hook.condition {
            let guard = match session
                .evaluate_on_call_frame(&frame.call_frame_id, &format!("({condition})"), true)
                .await
            {
                Ok(guard) => guard,
                Err(DebuggerError::Evaluation(reason)) => {
                    self.emit(HookEventKind::Warn {
                        message: format!("{hook} condition threw: {reason}"),
                    });
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if !guard.is_truthy() {
                debug!(%hook, "Hook condition is falsy");
                return Ok(());
            }
        }

        match &hook.action {
            HookAction::OverrideReturn(expression) => {
                let Some(current) = &frame.return_value else {
                    self.emit(HookEventKind::Error {
                        message: format!("{hook} is not a return point"),
                    });
                    return Ok(());
                };
                if current.is_promise() {
                    self.emit(HookEventKind::Warn {
                        message: format!(
                            "{hook} returns a Promise and cannot override return value"
                        ),
                    });
                    return Ok(());
                }
                session.set_return_value(frame, expression).await?;
                debug!(%hook, "Return value overridden");
            }
            HookAction::Inject(code) => {
                match session.evaluate_on_call_frame(&frame.call_frame_id, code, false).await {
                    Ok(_) => debug!(%hook, "Hook code injected"),
                    Err(DebuggerError::Evaluation(reason)) => {
                        let message = format!("{hook} threw: {reason}");
                        self.emit(HookEventKind::Warn { message });
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
