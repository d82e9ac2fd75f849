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


//! Shared base of the pause-driven state machines.
//!
//! A [`DebuggerStateMachine`] binds one [`DebuggerSession`] to one
//! [`PauseHandler`] through one [`SequentialTaskQueue`]: every `paused` event is
//! turned into a queued task, so reactions to overlapping pauses never
//! interleave. Failing tasks are routed to [`PauseHandler::on_error`].

use std::sync::{Arc, Weak};

use futures::{future::BoxFuture, FutureExt};
use heapdbg_common::PausedEvent;
use tracing::debug;

use crate::{DebuggerError, DebuggerSession, SequentialTaskQueue, SessionEvent, SessionEventKind};

/// Reaction of a state machine to pauses.
pub trait PauseHandler: Send + Sync + 'static {
    /// Handle one pause. Runs on the machine's queue.
    fn on_paused(self: Arc<Self>, event: PausedEvent) -> BoxFuture<'static, eyre::Result<()>>;

    /// Handle a failed queued task. Runs on the machine's queue before the next task.
    fn on_error(self: Arc<Self>, error: eyre::Report) -> BoxFuture<'static, ()>;
}

/// A session, a task queue and a pause handler bound together.
#[derive(Debug)]
pub struct DebuggerStateMachine<H> {
    session: DebuggerSession,
    queue: Arc<SequentialTaskQueue>,
    handler: Weak<H>,
}

impl<H: PauseHandler> DebuggerStateMachine<H> {
    /// Create the machine. `handler` is held weakly so that a handler owning its
    /// machine can be dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(session: DebuggerSession, handler: Weak<H>) -> Self {
        let on_error = handler.clone();
        let queue = SequentialTaskQueue::new(Arc::new(move |err: eyre::Report| {
            let handler = on_error.upgrade();
            async move {
                if let Some(handler) = handler {
                    handler.on_error(err).await;
                }
            }
            .boxed()
        }));
        Self { session, queue: Arc::new(queue), handler }
    }

    /// The bound session
    pub fn session(&self) -> &DebuggerSession {
        &self.session
    }

    /// The bound queue
    pub fn queue(&self) -> &SequentialTaskQueue {
        &self.queue
    }

    /// Route the session's `paused` events into the queue.
    ///
    /// Fails with [`DebuggerError::HandlersLocked`] while the session is enabled.
    pub fn attach(&self) -> Result<(), DebuggerError> {
        let handler = self.handler.clone();
        let queue = Arc::downgrade(&self.queue);
        self.session.on(SessionEventKind::Paused, move |event| {
            let SessionEvent::Paused(paused) = event else {
                return;
            };
            let (Some(handler), Some(queue)) = (handler.upgrade(), queue.upgrade()) else {
                debug!("State machine dropped, ignoring pause");
                return;
            };
            // Queued eagerly; nobody waits for completion.
            drop(queue.enqueue(handler.on_paused(paused)));
        })
    }

    /// Drop every queued pause that has not started yet
    pub fn reset(&self) {
        self.queue.reset();
    }
}
