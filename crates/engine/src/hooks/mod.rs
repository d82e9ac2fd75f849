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


//! Live hooks: breakpoint-backed instrumentation points.
//!
//! A hook either injects code into the frame it stops in, or overrides the
//! value a function is about to return. Hooks are registered while idle and
//! armed together by [`LiveHookManager::start`].

mod manager;
pub use manager::*;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DebuggerError;

/// Errors raised by the live hook API.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HookError {
    /// Unknown hook type
    #[error("invalid hookType '{0}'")]
    InvalidHookType(String),
    /// An inject hook without code
    #[error("'code' is required")]
    MissingCode,
    /// A return hook without a return expression
    #[error("'returnExpr' is required")]
    MissingReturnExpr,
    /// Line and column are 1-based
    #[error("invalid hook position {line}:{col}, lines and columns start at 1")]
    InvalidPosition {
        /// Line as given
        line: u32,
        /// Column as given
        col: u32,
    },
    /// Hooks can only be registered while idle
    #[error("live hooks are running")]
    Running,
    /// `start` was called twice
    #[error("live hooks already running")]
    AlreadyRunning,
    /// A hook could not be armed
    #[error("cannot arm hook {hook}: {source}")]
    Arm {
        /// `file:line:col` of the hook
        hook: String,
        /// Underlying failure
        #[source]
        source: DebuggerError,
    },
    /// A session operation failed
    #[error(transparent)]
    Debugger(#[from] DebuggerError),
}

/// What a hook does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HookType {
    /// Evaluate code in the paused frame
    #[default]
    Inject,
    /// Replace the return value of the function
    #[serde(alias = "override-return")]
    Return,
}

impl FromStr for HookType {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inject" => Ok(Self::Inject),
            "return" | "override-return" => Ok(Self::Return),
            other => Err(HookError::InvalidHookType(other.to_string())),
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inject => "inject",
            Self::Return => "return",
        })
    }
}

/// Hook definition as submitted by a caller. Positions are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveHookDef {
    /// `inject` (default) or `return`
    pub hook_type: Option<String>,
    /// Script URL
    pub file: String,
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub col: u32,
    /// Guard expression; the hook only fires when it is truthy
    pub condition: Option<String>,
    /// Code evaluated by inject hooks
    pub code: Option<String>,
    /// Expression whose value return hooks return instead
    pub return_expr: Option<String>,
}

/// Action of a validated hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// Evaluate code in the frame
    Inject(String),
    /// Return the value of this expression instead
    OverrideReturn(String),
}

/// A validated hook. Positions are 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveHook {
    /// Script URL
    pub file: String,
    /// 0-based line
    pub line: u32,
    /// 0-based column
    pub col: u32,
    /// Guard expression
    pub condition: Option<String>,
    /// What the hook does
    pub action: HookAction,
}

impl LiveHook {
    /// Validate a definition and convert its position to 0-based.
    pub fn from_def(def: LiveHookDef) -> Result<Self, HookError> {
        let hook_type = match def.hook_type.as_deref() {
            Some(kind) => kind.parse()?,
            None => HookType::default(),
        };
        let action = match hook_type {
            HookType::Inject => {
                HookAction::Inject(non_empty(def.code).ok_or(HookError::MissingCode)?)
            }
            HookType::Return => HookAction::OverrideReturn(
                non_empty(def.return_expr).ok_or(HookError::MissingReturnExpr)?,
            ),
        };
        if def.line == 0 || def.col == 0 {
            return Err(HookError::InvalidPosition { line: def.line, col: def.col });
        }

        Ok(Self {
            file: def.file,
            line: def.line - 1,
            col: def.col - 1,
            condition: non_empty(def.condition),
            action,
        })
    }

    /// Kind of the hook
    pub fn hook_type(&self) -> HookType {
        match self.action {
            HookAction::Inject(_) => HookType::Inject,
            HookAction::OverrideReturn(_) => HookType::Return,
        }
    }
}

impl fmt::Display for LiveHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

/// State of a [`LiveHookManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookStatus {
    /// Hooks can be registered
    #[default]
    Idle,
    /// Hooks are armed
    Running,
}

/// Payload of a [`HookEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HookEventKind {
    /// Lifecycle message
    Log {
        /// Message text
        message: String,
    },
    /// A hook was skipped
    Warn {
        /// Message text
        message: String,
    },
    /// A hook failed
    Error {
        /// Message text
        message: String,
    },
}

/// Notification emitted by a [`LiveHookManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookEvent {
    /// What happened
    #[serde(flatten)]
    pub kind: HookEventKind,
    /// Manager state when the event was emitted
    pub current_status: HookStatus,
}
