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


use std::{fmt::Display, str::FromStr};

use eyre::{bail, eyre, Error, Result};
use serde::{Deserialize, Serialize};

/// An armed stop condition: where to stop and, optionally, when.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    /// Where the breakpoint is set.
    pub loc: BreakpointLocation,
    /// Optional expression that must evaluate to a truthy value for the breakpoint to trigger.
    pub condition: Option<String>,
}

impl Display for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.loc)?;
        if let Some(cond) = &self.condition {
            write!(f, " if {cond}")?;
        }
        Ok(())
    }
}

impl FromStr for Breakpoint {
    type Err = Error;

    /// Parses a breakpoint from a string.
    /// Format: `@<location> [if <condition>]`
    /// Examples:
    /// - `@https://app.test/main.js:12:5` - Breakpoint at a URL
    /// - `@#42:7` - Breakpoint in script `42`
    /// - `@fn:obj-17` - Breakpoint on a function call
    /// - `@main.js:12 if count > 3` - Breakpoint with condition
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let Some(rest) = trimmed.strip_prefix('@') else {
            bail!("Invalid breakpoint format. Expected @<location> [if <condition>], got: {s}");
        };

        let (loc_str, condition) = match rest.find(" if ") {
            Some(if_pos) => {
                let condition = rest[if_pos + 4..].trim();
                if condition.is_empty() {
                    bail!("Empty breakpoint condition");
                }
                (&rest[..if_pos], Some(condition.to_string()))
            }
            None => (rest, None),
        };

        Ok(Self { loc: BreakpointLocation::from_str(loc_str.trim())?, condition })
    }
}

/// Where a breakpoint is set. Line and column are stored 0-based, as the protocol expects;
/// the textual form uses 1-based numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BreakpointLocation {
    /// An exact position in a parsed script.
    Script {
        /// Runtime-assigned script id.
        script_id: String,
        /// 0-based line.
        line_number: u32,
        /// 0-based column.
        column_number: u32,
    },
    /// A position in every script loaded from a URL.
    Url {
        /// Script URL.
        url: String,
        /// 0-based line.
        line_number: u32,
        /// 0-based column.
        column_number: u32,
    },
    /// The next call of a live function object.
    FunctionCall {
        /// Remote object id of the function.
        object_id: String,
    },
}

fn parse_one_based(part: &str, what: &str) -> Result<u32> {
    let value = part.parse::<u32>().map_err(|e| eyre!("Invalid {what}: {e}"))?;
    if value == 0 {
        bail!("Invalid {what}: numbering starts at 1");
    }
    Ok(value - 1)
}

/// Split `<target>:<line>[:<col>]` from the right so that URLs keep their own colons.
fn split_position(s: &str) -> Result<(&str, u32, u32)> {
    let mut parts = s.rsplitn(3, ':');
    let last = parts.next().unwrap_or_default();
    let middle = parts.next();
    let head = parts.next();

    match (head, middle) {
        (Some(head), Some(middle)) if middle.parse::<u32>().is_ok() => {
            Ok((head, parse_one_based(middle, "line number")?, parse_one_based(last, "column")?))
        }
        (_, Some(_)) => {
            let Some((target, _)) = s.rsplit_once(':') else {
                bail!("Missing line number in breakpoint location: {s}");
            };
            Ok((target, parse_one_based(last, "line number")?, 0))
        }
        _ => bail!("Missing line number in breakpoint location: {s}"),
    }
}

impl FromStr for BreakpointLocation {
    type Err = Error;

    /// Parses a breakpoint location from a string in the format:
    /// - `fn:<objectId>` for function-call breakpoints
    /// - `#<scriptId>:<line>[:<col>]` for script breakpoints
    /// - `<url>:<line>[:<col>]` for URL breakpoints
    fn from_str(s: &str) -> Result<Self> {
        if let Some(object_id) = s.strip_prefix("fn:") {
            if object_id.is_empty() {
                bail!("Missing object id in function breakpoint");
            }
            return Ok(Self::FunctionCall { object_id: object_id.to_string() });
        }

        let (target, line_number, column_number) = split_position(s)?;
        if target.is_empty() {
            bail!("Missing script in breakpoint location: {s}");
        }

        match target.strip_prefix('#') {
            Some(script_id) => {
                Ok(Self::Script { script_id: script_id.to_string(), line_number, column_number })
            }
            None => Ok(Self::Url { url: target.to_string(), line_number, column_number }),
        }
    }
}

impl Display for BreakpointLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script { script_id, line_number, column_number } => {
                write!(f, "#{script_id}:{}:{}", line_number + 1, column_number + 1)
            }
            Self::Url { url, line_number, column_number } => {
                write!(f, "{url}:{}:{}", line_number + 1, column_number + 1)
            }
            Self::FunctionCall { object_id } => write!(f, "fn:{object_id}"),
        }
    }
}

impl Breakpoint {
    /// Creates a new breakpoint with the given location and optional condition.
    pub fn new(loc: BreakpointLocation, condition: Option<String>) -> Self {
        Self { loc, condition }
    }

    /// Update the condition of the breakpoint.
    pub fn set_condition(&mut self, condition: &str) {
        self.condition = Some(condition.trim().to_string());
    }
}
