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


use serde::{Deserialize, Serialize};

/// A script the runtime has loaded, as announced by `Debugger.scriptParsed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedScript {
    /// Runtime-assigned script identifier
    pub script_id: String,
    /// Script URL; empty for inline and evaluated code
    #[serde(default)]
    pub url: String,
    /// Content hash; a reload of the same file produces the same hash
    #[serde(default)]
    pub hash: String,
    /// Whether the URL is covered by the session's blackbox pattern set
    #[serde(default)]
    pub blacklisted: bool,
}

impl ParsedScript {
    /// URLs produced by the runtime itself rather than by the page
    pub fn is_internal(&self) -> bool {
        self.url.is_empty()
            || self.url.starts_with("eval")
            || self.url.starts_with("extensions::")
            || self.url.starts_with("pptr:")
    }
}
