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


// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0
//! heapdbg Engine - heap origin debugging over a remote debugging protocol
//!
//! The engine correlates execution position with heap contents. It drives a
//! [`DebuggerSession`] step by step, captures a heap snapshot after every step
//! and reports the step at which a searched value first appears.

/// Engine configuration stored in `~/.heapdbg.toml`
pub mod config;
pub use config::*;

/// Transport-agnostic protocol client
pub mod protocol;
pub use protocol::*;

/// Strictly sequential execution of asynchronous tasks
pub mod queue;
pub use queue::*;

pub mod debugger;
pub use debugger::*;

pub mod machine;
pub use machine::*;

/// Heap snapshot decoding, materialisation, paths and search
pub mod heap;
pub use heap::*;

/// Structural similarity of JSON values
pub mod similarity;
pub use similarity::*;

pub mod bdhs;
pub use bdhs::*;

pub mod hooks;
pub use hooks::*;
