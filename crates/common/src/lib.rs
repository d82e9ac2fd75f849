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
//! heapdbg Common - Shared functionality for heapdbg components
//!
//! This crate provides the protocol-level value types, text filters and the
//! search-query wire format shared by the engine and the command-line binary.

/// Protocol value types: call frames, locations, remote objects, scripts and breakpoints
pub mod types;

/// Logging setup and utilities for consistent logging across heapdbg components
pub mod logging;
/// Search-query wire format and validation
pub mod query;
/// Text filters (plain, case-insensitive, regular expression and exact matching)
pub mod text;

pub use logging::*;
pub use query::*;
pub use text::*;
pub use types::*;
