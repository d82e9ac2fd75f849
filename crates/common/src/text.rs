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

//! Text filters used by every search mode.
//!
//! A filter is a `(pattern, options)` pair. On the wire it is encoded as a
//! JSON array `["pattern", {"matchCase": false, "useRegexp": true, "exactMatch": true}]`,
//! where the options object (or the whole array) may be abbreviated.

use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::QueryError;

/// Options controlling how a pattern is matched against a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchOptions {
    /// Case-sensitive matching
    pub match_case: bool,
    /// Treat the pattern as a regular expression
    pub use_regexp: bool,
    /// The whole text must match (regex is anchored, plain text compares for equality)
    pub exact_match: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self { match_case: false, use_regexp: false, exact_match: true }
    }
}

impl MatchOptions {
    /// Plain substring matching, case-insensitive
    pub fn contains() -> Self {
        Self { exact_match: false, ..Self::default() }
    }

    /// Regular-expression matching, case-sensitive
    pub fn regex() -> Self {
        Self { match_case: true, use_regexp: true, exact_match: true }
    }
}

/// A single text filter: a pattern plus its match options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFilter {
    /// Keyword or regular expression
    pub pattern: String,
    /// How the pattern is applied
    pub options: MatchOptions,
}

impl TextFilter {
    /// Create a filter from a pattern and options
    pub fn new(pattern: impl Into<String>, options: MatchOptions) -> Self {
        Self { pattern: pattern.into(), options }
    }

    /// An empty pattern disables the filter: it then matches everything.
    pub fn is_enabled(&self) -> bool {
        !self.pattern.is_empty()
    }

    /// Compile the filter once so it can be applied to many candidates.
    pub fn compile(&self) -> Result<CompiledFilter, QueryError> {
        let matcher = if self.options.use_regexp {
            let source = if self.options.exact_match {
                format!("^(?:{})$", self.pattern)
            } else {
                self.pattern.clone()
            };
            let regex = RegexBuilder::new(&source)
                .case_insensitive(!self.options.match_case)
                .build()
                .map_err(|e| QueryError::InvalidRegex {
                    pattern: self.pattern.clone(),
                    reason: e.to_string(),
                })?;
            Matcher::Regex(regex)
        } else if self.options.match_case {
            Matcher::Plain(self.pattern.clone())
        } else {
            Matcher::Plain(self.pattern.to_lowercase())
        };

        Ok(CompiledFilter { options: self.options, matcher })
    }
}

impl fmt::Display for TextFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.options.use_regexp { "regex" } else { "text" };
        write!(f, "{kind}:{:?}", self.pattern)?;
        if self.options.match_case {
            write!(f, " (case)")?;
        }
        if self.options.exact_match {
            write!(f, " (exact)")?;
        }
        Ok(())
    }
}

impl Serialize for TextFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.pattern, &self.options).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TextFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Full(String, MatchOptions),
            Bare((String,)),
            Plain(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Full(pattern, options) => Self { pattern, options },
            Repr::Bare((pattern,)) | Repr::Plain(pattern) => {
                Self { pattern, options: MatchOptions::default() }
            }
        })
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    Plain(String),
}

/// A filter ready to be applied.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    options: MatchOptions,
    matcher: Matcher,
}

impl CompiledFilter {
    /// Check whether `text` satisfies the filter.
    pub fn matches(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Regex(regex) => regex.is_match(text),
            Matcher::Plain(needle) => {
                let folded;
                let haystack = if self.options.match_case {
                    text
                } else {
                    folded = text.to_lowercase();
                    &folded
                };
                if self.options.exact_match {
                    haystack == needle
                } else {
                    haystack.contains(needle.as_str())
                }
            }
        }
    }
}

/// One-shot convenience: compile `filter` and test `text`.
pub fn text_matches(text: &str, filter: &TextFilter) -> Result<bool, QueryError> {
    Ok(filter.compile()?.matches(text))
}
