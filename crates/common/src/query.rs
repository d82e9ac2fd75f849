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


//! Search-query wire format.
//!
//! A query carries up to three independent text filters (property name, value,
//! class name) plus an optional similarity sub-query against a reference value.
//! Filters that are absent or have an empty pattern always pass.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{CompiledFilter, TextFilter};

/// Default weight of the Jaccard term in hybrid similarity
pub const DEFAULT_ALPHA: f64 = 0.3;

/// Errors raised while validating a search query. These are reported before any
/// protocol traffic or heap scan takes place.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    /// No text filter is set and similarity matching is disabled
    #[error("search query has no filter and similarity matching is disabled")]
    EmptyQuery,
    /// A regular-expression filter does not compile
    #[error("invalid regular expression {pattern:?}: {reason}")]
    InvalidRegex {
        /// Pattern as given by the caller
        pattern: String,
        /// Compiler message
        reason: String,
    },
    /// Similarity matching is enabled without a reference object
    #[error("similarity matching is enabled but no reference object was given")]
    MissingReference,
    /// The reference object is not valid JSON
    #[error("reference object is not valid JSON: {0}")]
    InvalidReference(String),
    /// Threshold or alpha outside of `[0, 1]`
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfRange {
        /// Parameter name
        name: &'static str,
        /// Offending value
        value: f64,
    },
}

/// A search request as sent by a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Matches property names of an object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_search: Option<TextFilter>,
    /// Matches primitive values owned by an object, or string values themselves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_search: Option<TextFilter>,
    /// Matches the constructor name of an object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_search: Option<TextFilter>,
    /// Enable similarity matching
    #[serde(default)]
    pub os_enabled: bool,
    /// Reference value, encoded as a JSON string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_object: Option<String>,
    /// Minimum similarity score
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub os_threshold: Option<f64>,
    /// Weight of structural overlap against naming closeness
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub os_alpha: Option<f64>,
    /// Tokenize primitive values verbatim instead of by type
    #[serde(default)]
    pub os_include_values: bool,
}

/// Accept numbers given either as JSON numbers or as numeric strings.
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(f64),
        Text(String),
    }

    match Option::<Lenient>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Lenient::Number(n)) => Ok(Some(n)),
        Some(Lenient::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Lenient::Text(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// The similarity part of a compiled query.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityQuery {
    /// Parsed reference value
    pub reference: Value,
    /// Minimum score for a candidate to pass
    pub threshold: f64,
    /// Jaccard weight
    pub alpha: f64,
    /// Tokenize primitive values verbatim
    pub include_values: bool,
}

/// A validated query with its filters compiled.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// Property-name filter
    pub property: Option<CompiledFilter>,
    /// Value filter
    pub value: Option<CompiledFilter>,
    /// Class-name filter
    pub class: Option<CompiledFilter>,
    /// Similarity gate
    pub similarity: Option<SimilarityQuery>,
}

fn compile_filter(filter: &Option<TextFilter>) -> Result<Option<CompiledFilter>, QueryError> {
    filter.as_ref().filter(|f| f.is_enabled()).map(TextFilter::compile).transpose()
}

fn check_unit(name: &'static str, value: f64) -> Result<f64, QueryError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(QueryError::OutOfRange { name, value })
    }
}

impl SearchQuery {
    /// Whether at least one text filter has a non-empty pattern
    pub fn has_text_filter(&self) -> bool {
        [&self.property_search, &self.value_search, &self.class_search]
            .into_iter()
            .any(|f| f.as_ref().is_some_and(TextFilter::is_enabled))
    }

    /// Validate and compile the query.
    pub fn compile(&self) -> Result<CompiledQuery, QueryError> {
        if !self.has_text_filter() && !self.os_enabled {
            return Err(QueryError::EmptyQuery);
        }

        let similarity = if self.os_enabled {
            let raw = self.os_object.as_deref().ok_or(QueryError::MissingReference)?;
            let reference = serde_json::from_str(raw)
                .map_err(|e| QueryError::InvalidReference(e.to_string()))?;
            Some(SimilarityQuery {
                reference,
                threshold: check_unit("threshold", self.os_threshold.unwrap_or(0.0))?,
                alpha: check_unit("alpha", self.os_alpha.unwrap_or(DEFAULT_ALPHA))?,
                include_values: self.os_include_values,
            })
        } else {
            None
        };

        Ok(CompiledQuery {
            property: compile_filter(&self.property_search)?,
            value: compile_filter(&self.value_search)?,
            class: compile_filter(&self.class_search)?,
            similarity,
        })
    }
}

impl CompiledQuery {
    /// Apply the property filter, passing when it is unset
    pub fn property_passes(&self, name: &str) -> bool {
        self.property.as_ref().is_none_or(|f| f.matches(name))
    }

    /// Apply the value filter, passing when it is unset
    pub fn value_passes(&self, value: &str) -> bool {
        self.value.as_ref().is_none_or(|f| f.matches(value))
    }

    /// Apply the class filter, passing when it is unset
    pub fn class_passes(&self, class_name: &str) -> bool {
        self.class.as_ref().is_none_or(|f| f.matches(class_name))
    }
}
