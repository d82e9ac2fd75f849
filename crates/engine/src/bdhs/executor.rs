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
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use heapdbg_common::{CallFrame, PausedEvent};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use super::{
    BdhsError, BdhsEvent, BdhsEventKind, BdhsStatus, FrameReport, HeapSearch, StepDecision,
    ToleranceWindow,
};
use crate::{
    BdhsConfig, DebuggerError, DebuggerSession, DebuggerStateMachine, PauseHandler, ScanResult,
};

/// Function declaration that resolves the framework-level click handler of
/// `this` (a DOM element): React props, Vue 3 vnodes, Vue 2 listeners and
/// Alpine.js bindings are checked in that order.
pub const USERLAND_HANDLER_PROBE: &str = include_str!("../../probes/userland_handler.js");

/// How a pause continues after the state-specific handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseTransition {
    Done,
    /// Handle the same pause as a regular step
    ContinueAsIdle,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    step: u64,
    frames: Vec<CallFrame>,
    search: ScanResult,
}

#[derive(Debug, Default)]
struct RunState {
    /// Incremented whenever a run starts or completes; stale tasks compare against it.
    run: u64,
    status: Option<BdhsStatus>,
    step: u64,
    idle_ticks: u32,
    history: Vec<HistoryEntry>,
    first_match_step: Option<u64>,
    breakpoint_id: Option<String>,
    started_at: Option<Instant>,
}

struct BdhsInner {
    machine: DebuggerStateMachine<BdhsInner>,
    search: Arc<dyn HeapSearch>,
    config: BdhsConfig,
    events: mpsc::UnboundedSender<BdhsEvent>,
    state: Mutex<RunState>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

/// Breakpoint-driven heap search over one debugger session.
///
/// Events are delivered through the receiver returned by [`BdhsExecutor::new`].
pub struct BdhsExecutor {
    inner: Arc<BdhsInner>,
}

impl std::fmt::Debug for BdhsExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BdhsExecutor")
            .field("status", &state.status)
            .field("step", &state.step)
            .finish_non_exhaustive()
    }
}

impl BdhsExecutor {
    /// Bind an executor to `session`.
    ///
    /// The session must be disabled, since the pause handler is registered
    /// here. Must be called from within a tokio runtime.
    pub fn new(
        session: DebuggerSession,
        search: Arc<dyn HeapSearch>,
        config: BdhsConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<BdhsEvent>), BdhsError> {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<BdhsInner>| BdhsInner {
            machine: DebuggerStateMachine::new(session, weak.clone()),
            search,
            config,
            events,
            state: Mutex::new(RunState::default()),
            watchdog: Mutex::new(None),
        });
        inner.machine.attach()?;
        Ok((Self { inner }, receiver))
    }

    /// Arm the click breakpoint and start the idle watchdog.
    pub async fn start(&self) -> Result<(), BdhsError> {
        let inner = &self.inner;
        let run = {
            let mut state = inner.state.lock();
            if state.status.is_some() {
                return Err(BdhsError::AlreadyRunning);
            }
            *state = RunState {
                run: state.run + 1,
                status: Some(BdhsStatus::Armed),
                started_at: Some(Instant::now()),
                ..RunState::default()
            };
            state.run
        };
        inner.machine.reset();
        inner.emit(BdhsEventKind::Armed);

        if let Err(e) = inner.machine.session().set_dom_click_breakpoint(true).await {
            inner.fail(run, e.to_string()).await;
            return Err(e.into());
        }
        inner.start_watchdog(run);
        info!(run, "BDHS armed, waiting for a click");
        Ok(())
    }

    /// Abort the current run. Execution is resumed on a best-effort basis.
    ///
    /// A run that has already settled on an outcome is left to complete.
    pub async fn abort(&self) {
        let inner = &self.inner;
        let previous = {
            let mut state = inner.state.lock();
            let Some(previous) = state.status.filter(|status| !status.is_terminal()) else {
                return;
            };
            state.status = Some(BdhsStatus::Aborted);
            previous
        };
        inner.stop_watchdog();
        inner.machine.reset();

        let session = inner.machine.session();
        if previous == BdhsStatus::Armed {
            if let Err(e) = session.set_dom_click_breakpoint(false).await {
                debug!(error = %e, "Failed to remove the click breakpoint");
            }
        }
        if let Err(e) = session.resume().await {
            debug!(error = %e, "Resume on abort failed");
        }
        info!("BDHS aborted");
        inner.emit(BdhsEventKind::Aborted);
        inner.complete().await;
    }

    /// State of the current run, `None` when no run is active
    pub fn status(&self) -> Option<BdhsStatus> {
        self.inner.state.lock().status
    }

    /// Steps taken by the current or last run
    pub fn step(&self) -> u64 {
        self.inner.state.lock().step
    }

    /// The bound session
    pub fn session(&self) -> &DebuggerSession {
        self.inner.machine.session()
    }
}

impl PauseHandler for BdhsInner {
    fn on_paused(self: Arc<Self>, event: PausedEvent) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(async move { self.handle_pause(event).await })
    }

    fn on_error(self: Arc<Self>, error: eyre::Report) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let run = self.state.lock().run;
            self.fail(run, format!("{error:#}")).await;
        })
    }
}

impl BdhsInner {
    fn window(&self) -> ToleranceWindow {
        ToleranceWindow::from(&self.config)
    }

    fn emit(&self, kind: BdhsEventKind) {
        let (current_step, status) = {
            let state = self.state.lock();
            (state.step, state.status)
        };
        let Some(current_status) = status else {
            return;
        };
        debug!(step = current_step, ?kind, "BDHS event");
        if self.events.send(BdhsEvent { kind, current_step, current_status }).is_err() {
            debug!("BDHS event receiver dropped");
        }
    }

    /// Update the status unless the run has been superseded or aborted.
    fn set_status(&self, run: u64, status: BdhsStatus) -> bool {
        let mut state = self.state.lock();
        if state.run != run || matches!(state.status, None | Some(BdhsStatus::Aborted)) {
            return false;
        }
        state.status = Some(status);
        true
    }

    async fn handle_pause(self: &Arc<Self>, event: PausedEvent) -> eyre::Result<()> {
        let (status, run) = {
            let mut state = self.state.lock();
            match state.status {
                None | Some(BdhsStatus::Aborted) => return Ok(()),
                Some(status) => {
                    state.step += 1;
                    (status, state.run)
                }
            }
        };

        let transition = match status {
            BdhsStatus::Armed => self.on_armed(&event, run).await?,
            BdhsStatus::Idle => PauseTransition::ContinueAsIdle,
            _ => PauseTransition::Done,
        };
        match transition {
            PauseTransition::ContinueAsIdle => self.on_idle(event, run).await,
            PauseTransition::Done => Ok(()),
        }
    }

    async fn on_armed(&self, event: &PausedEvent, run: u64) -> eyre::Result<PauseTransition> {
        self.emit(BdhsEventKind::Started);
        if !self.set_status(run, BdhsStatus::Idle) {
            return Ok(PauseTransition::Done);
        }

        let session = self.machine.session();
        session.set_dom_click_breakpoint(false).await?;

        let Some(frame) = event.top_frame() else {
            return Ok(PauseTransition::ContinueAsIdle);
        };
        let Some(handler) = self.find_userland_handler(&frame.call_frame_id).await? else {
            return Ok(PauseTransition::ContinueAsIdle);
        };

        let breakpoint = session.set_breakpoint_on_function_call(&handler, None).await?;
        info!(%breakpoint, "Skipping to the userland click handler");
        {
            let mut state = self.state.lock();
            if state.run == run {
                state.breakpoint_id = Some(breakpoint);
            }
        }
        session.resume().await?;
        Ok(PauseTransition::Done)
    }

    async fn find_userland_handler(
        &self,
        frame_id: &str,
    ) -> Result<Option<String>, DebuggerError> {
        let session = self.machine.session();
        let target = match session.evaluate_on_call_frame(frame_id, "event.target", false).await {
            Ok(target) => target,
            Err(DebuggerError::Evaluation(reason)) => {
                debug!(%reason, "No event target in the paused frame");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let Some(target_id) = target.object_id else {
            return Ok(None);
        };

        let handler = match session
            .call_function_on(&target_id, USERLAND_HANDLER_PROBE, Vec::new(), false)
            .await
        {
            Ok(handler) => handler,
            Err(DebuggerError::Evaluation(reason)) => {
                debug!(%reason, "Handler lookup threw");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(handler.object_id.filter(|_| handler.kind == "function"))
    }

    async fn on_idle(&self, event: PausedEvent, run: u64) -> eyre::Result<()> {
        let step = {
            let mut state = self.state.lock();
            if state.run != run || state.status == Some(BdhsStatus::Aborted) {
                return Ok(());
            }
            state.status = Some(BdhsStatus::Running);
            state.idle_ticks = 0;
            state.step
        };

        if step > self.config.max_steps {
            warn!(step, max_steps = self.config.max_steps, "Step limit exceeded");
            if !self.set_status(run, BdhsStatus::Error) {
                return Ok(());
            }
            self.emit(BdhsEventKind::MaxReached);
            self.complete().await;
            return Ok(());
        }

        let result = self.search.search().await?;
        let decision = {
            let mut state = self.state.lock();
            if state.run != run || state.status != Some(BdhsStatus::Running) {
                return Ok(());
            }
            let found = !result.is_empty();
            state.history.push(HistoryEntry { step, frames: event.call_frames, search: result });
            self.window().decide(&mut state.first_match_step, step, found)
        };
        debug!(step, ?decision, "BDHS step");

        let (match_found, finalising) = match decision {
            StepDecision::Searching => (false, false),
            StepDecision::FirstMatch => (true, false),
            StepDecision::Finalising => (false, true),
            StepDecision::Finalise => {
                if !self.set_status(run, BdhsStatus::Found) {
                    return Ok(());
                }
                let results = self.report().await;
                info!(step, frames = results.len(), "Heap origin found");
                self.emit(BdhsEventKind::Found { results });
                self.complete().await;
                return Ok(());
            }
        };
        self.emit(BdhsEventKind::Progress { match_found, finalising });

        let step_out = {
            let mut state = self.state.lock();
            let running = state.run == run && state.status == Some(BdhsStatus::Running);
            if running {
                state.status = Some(BdhsStatus::Idle);
            }
            running
        };
        if step_out {
            self.machine.session().step_out().await?;
        }
        Ok(())
    }

    /// Frames of the newest history entries, newest first, one per source location.
    async fn report(&self) -> Vec<FrameReport> {
        let (entries, first_match) = {
            let state = self.state.lock();
            let start = state.history.len().saturating_sub(self.window().span());
            let entries: Vec<HistoryEntry> =
                state.history[start..].iter().rev().cloned().collect();
            (entries, state.first_match_step)
        };

        let session = self.machine.session();
        let mut reports: Vec<FrameReport> = Vec::new();
        for entry in entries {
            let Some(frame) = entry.frames.first() else {
                continue;
            };
            let is_first_match = first_match == Some(entry.step);
            let location = frame.entry_location();
            let script_id = location.script_id.clone();
            let file = if script_id.is_empty() { None } else { session.script_url(&script_id) };
            let line_number = location.line_number + 1;
            let column_number = location.column_number + 1;

            if let Some(existing) = reports.iter_mut().find(|r| {
                r.line_number == line_number && r.column_number == column_number && r.file == file
            }) {
                existing.is_first_match |= is_first_match;
                continue;
            }

            let script_source = if script_id.is_empty() {
                None
            } else {
                match session.get_script_source(&script_id).await {
                    Ok(source) => Some(source),
                    Err(e) => {
                        warn!(%script_id, error = %e, "Failed to fetch script source");
                        None
                    }
                }
            };
            reports.push(FrameReport {
                function_name: frame.function_name.clone(),
                line_number,
                column_number,
                script_id,
                script_source,
                file,
                is_first_match,
                heap_snapshot: entry.search.clone(),
            });
        }
        reports
    }

    fn start_watchdog(self: &Arc<Self>, run: u64) {
        let task = tokio::spawn(watchdog(
            Arc::downgrade(self),
            run,
            self.config.watchdog_interval(),
            self.config.watchdog_idle_ticks,
        ));
        if let Some(previous) = self.watchdog.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_watchdog(&self) {
        if let Some(task) = self.watchdog.lock().take() {
            task.abort();
        }
    }

    /// Final independent search once the program has stayed idle for long enough.
    async fn finalise_idle(self: Arc<Self>, run: u64, fired_at_step: u64) -> eyre::Result<()> {
        {
            let state = self.state.lock();
            if state.run != run || state.status != Some(BdhsStatus::Idle) {
                return Ok(());
            }
            if state.step != fired_at_step {
                drop(state);
                debug!("Program paused again before the watchdog finalised, re-arming");
                self.start_watchdog(run);
                return Ok(());
            }
        }

        let result = self.search.search().await?;
        let status = if result.is_empty() { BdhsStatus::NotFound } else { BdhsStatus::Found };
        if !self.set_status(run, status) {
            return Ok(());
        }
        if result.is_empty() {
            info!("Program went idle, nothing found");
            self.emit(BdhsEventKind::NotFound);
        } else {
            let results = self.report().await;
            info!(frames = results.len(), "Program went idle, heap origin found");
            self.emit(BdhsEventKind::Found { results });
        }
        self.complete().await;
        Ok(())
    }

    async fn fail(&self, run: u64, message: String) {
        if !self.set_status(run, BdhsStatus::Error) {
            error!(%message, "BDHS task failed outside of an active run");
            return;
        }
        error!(%message, "BDHS run failed");
        self.emit(BdhsEventKind::Error { message });
        self.complete().await;
    }

    /// Remove the breakpoint, disable the session, emit `completed` and clear the run.
    async fn complete(&self) {
        let (breakpoint, started_at) = {
            let state = self.state.lock();
            if state.status.is_none() {
                return;
            }
            (state.breakpoint_id.clone(), state.started_at)
        };
        self.stop_watchdog();

        let session = self.machine.session();
        if let Some(breakpoint) = breakpoint {
            if let Err(e) = session.remove_breakpoint(&breakpoint).await {
                warn!(%breakpoint, error = %e, "Failed to remove breakpoint");
            }
        }
        if let Err(e) = session.disable().await {
            warn!(error = %e, "Failed to disable the debugger");
        }

        let scan_time = started_at.map_or(0, |t| t.elapsed().as_millis() as u64);
        self.emit(BdhsEventKind::Completed { scan_time });

        let mut state = self.state.lock();
        info!(status = ?state.status, steps = state.step, scan_time, "BDHS run completed");
        state.status = None;
        state.breakpoint_id = None;
        state.run += 1;
    }
}

async fn watchdog(inner: Weak<BdhsInner>, run: u64, period: Duration, idle_ticks: u32) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let fired_at_step = {
            let mut state = inner.state.lock();
            if state.run != run {
                break;
            }
            if state.status == Some(BdhsStatus::Idle) {
                state.idle_ticks += 1;
            } else {
                state.idle_ticks = 0;
            }
            (state.idle_ticks >= idle_ticks).then_some(state.step)
        };

        if let Some(step) = fired_at_step {
            debug!(run, step, "Idle watchdog fired");
            drop(inner.machine.queue().enqueue(inner.clone().finalise_idle(run, step)));
            break;
        }
    }
}
