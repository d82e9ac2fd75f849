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


//! Stateful wrapper over the debugging domain of the remote protocol.
//!
//! [`DebuggerSession`] owns everything that belongs to one attached target:
//! the enabled flag, the registered event handlers, the registry of parsed
//! scripts and the blackbox pattern set.

mod blackbox;
pub use blackbox::*;

mod scripts;
pub use scripts::*;

mod session;
pub use session::*;

use thiserror::Error;

use crate::ProtocolError;

/// Errors raised by debugger session operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DebuggerError {
    /// Handlers were registered while the session is enabled
    #[error("cannot register event handlers while the debugger is enabled")]
    HandlersLocked,
    /// A protocol round-trip failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// No parsed script with the given id or URL
    #[error("script not parsed: {0}")]
    ScriptNotParsed(String),
    /// The script offers no breakable location at all
    #[error("no instructions found in script {0}")]
    NoInstructions(String),
    /// The function at the given location has no return point
    #[error("cannot find a return point in script {script_id} at {line_number}:{column_number}")]
    NoReturnPoint {
        /// Script searched
        script_id: String,
        /// 0-based line of the function start
        line_number: u32,
        /// 0-based column of the function start
        column_number: u32,
    },
    /// The frame is not paused at a return point
    #[error("frame has no return value to override")]
    NoReturnSlot,
    /// Overriding the result of a promise-returning function is not supported
    #[error("cannot override the return value of a promise")]
    PromiseReturn,
    /// An expression threw inside the debuggee
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}
