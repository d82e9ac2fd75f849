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


//! Breakpoint-driven heap search (BDHS).
//!
//! A run waits for a click, then single-steps the program (stepping out of
//! each frame) and re-scans the heap after every step. The step at which the
//! searched value first shows up in the heap, together with a few steps around
//! it, is reported as the origin of the value.
//!
//! Runs move through `armed → idle ⇄ running → found | notfound | error | aborted`
//! and are cleared once the completion event has been emitted.

mod executor;
pub use executor::*;

mod window;
pub use window::*;

use std::sync::Arc;

use futures::future::BoxFuture;
use heapdbg_common::{CompiledQuery, SearchQuery};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    capture_graph, scan_compiled, DebuggerError, HeapError, ScanResult, SearchOptions,
    SharedProtocol,
};

/// Errors returned synchronously by the BDHS API.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BdhsError {
    /// `start` was called while a run is in progress
    #[error("a heap search run is already in progress")]
    AlreadyRunning,
    /// Setting up the run failed
    #[error(transparent)]
    Debugger(#[from] DebuggerError),
}

/// State of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BdhsStatus {
    /// Waiting for the next pause
    Idle,
    /// Waiting for the click that starts the run
    Armed,
    /// Handling a pause
    Running,
    /// The origin was found
    Found,
    /// The run ended without a match
    NotFound,
    /// The run was aborted by the caller
    Aborted,
    /// The run failed
    Error,
}

impl BdhsStatus {
    /// Whether the run has settled on an outcome and is being completed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Found | Self::NotFound | Self::Aborted | Self::Error)
    }
}

/// One frame of a `found` report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReport {
    /// Name of the function, empty when anonymous
    pub function_name: String,
    /// 1-based line of the function start
    pub line_number: u32,
    /// 1-based column of the function start
    pub column_number: u32,
    /// Script the function lives in
    pub script_id: String,
    /// Full source text of the script
    pub script_source: Option<String>,
    /// Script URL
    pub file: Option<String>,
    /// This is the step at which the value first appeared
    pub is_first_match: bool,
    /// Heap search result captured at this step
    pub heap_snapshot: ScanResult,
}

/// Payload of a [`BdhsEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BdhsEventKind {
    /// The click breakpoint is armed
    Armed,
    /// The click happened
    Started,
    /// A step finished without ending the run
    #[serde(rename_all = "camelCase")]
    Progress {
        /// This step produced the first match
        match_found: bool,
        /// The run is inside the tolerance window after the first match
        finalising: bool,
    },
    /// The step limit was exceeded
    MaxReached,
    /// The origin was found
    Found {
        /// Frames around the first match, newest first
        results: Vec<FrameReport>,
    },
    /// Nothing matched
    #[serde(rename = "notfound")]
    NotFound,
    /// The run was aborted
    Aborted,
    /// A step failed
    Error {
        /// Failure description
        message: String,
    },
    /// The run is over
    #[serde(rename_all = "camelCase")]
    Completed {
        /// Wall time of the run in milliseconds
        scan_time: u64,
    },
}

/// Notification emitted by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BdhsEvent {
    /// What happened
    #[serde(flatten)]
    pub kind: BdhsEventKind,
    /// Step counter when the event was emitted
    pub current_step: u64,
    /// Run state when the event was emitted
    pub current_status: BdhsStatus,
}

/// The heap search re-run after every step.
pub trait HeapSearch: Send + Sync + 'static {
    /// Search the current heap
    fn search(&self) -> BoxFuture<'_, eyre::Result<ScanResult>>;
}

impl<F> HeapSearch for F
where
    F: Fn() -> BoxFuture<'static, eyre::Result<ScanResult>> + Send + Sync + 'static,
{
    fn search(&self) -> BoxFuture<'_, eyre::Result<ScanResult>> {
        self()
    }
}

/// [`HeapSearch`] that captures a fresh snapshot and scans it.
#[derive(Clone)]
pub struct SnapshotSearch {
    client: SharedProtocol,
    query: Arc<CompiledQuery>,
    options: SearchOptions,
}

impl std::fmt::Debug for SnapshotSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSearch").field("options", &self.options).finish_non_exhaustive()
    }
}

impl SnapshotSearch {
    /// Validate `query` and bind it to a target.
    pub fn new(
        client: SharedProtocol,
        query: &SearchQuery,
        options: SearchOptions,
    ) -> Result<Self, HeapError> {
        Ok(Self { client, query: Arc::new(query.compile()?), options })
    }
}

impl HeapSearch for SnapshotSearch {
    fn search(&self) -> BoxFuture<'_, eyre::Result<ScanResult>> {
        Box::pin(async move {
            let graph = capture_graph(self.client.as_ref()).await?;
            Ok(scan_compiled(&graph, &self.query, &self.options))
        })
    }
}
