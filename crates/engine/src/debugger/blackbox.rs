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


use std::collections::HashSet;

use tracing::debug;

use crate::BlackboxConfig;

/// What the blackboxer decided for one script URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlackboxVerdict {
    /// The URL is covered by the pattern set
    pub blacklisted: bool,
    /// A new pattern was appended; the full set must be pushed to the runtime
    pub added: bool,
}

/// Heuristic blackboxing of framework and bundler scripts.
///
/// Every URL that matches a manual include or a vendor substring gets an
/// anchored, escaped exact-URL pattern. Manual excludes win over both.
#[derive(Debug, Clone, Default)]
pub struct Blackboxer {
    config: BlackboxConfig,
    patterns: Vec<String>,
    known: HashSet<String>,
}

impl Blackboxer {
    /// Create a blackboxer with the given lists
    pub fn new(config: BlackboxConfig) -> Self {
        Self { config, patterns: Vec::new(), known: HashSet::new() }
    }

    /// Exact-URL pattern for `url`
    pub fn pattern_for(url: &str) -> String {
        format!("^{}$", regex::escape(url))
    }

    /// The current pattern set, in insertion order
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether `url` is covered by the pattern set
    pub fn is_blackboxed(&self, url: &str) -> bool {
        self.known.contains(&Self::pattern_for(url))
    }

    fn should_blackbox(&self, url: &str) -> bool {
        if self.config.manual_remove.iter().any(|p| url.contains(p.as_str())) {
            debug!(url, "Not blackboxing, manually excluded");
            return false;
        }
        if self.config.manual_add.iter().any(|p| url.contains(p.as_str())) {
            debug!(url, "Blackboxing manually included script");
            return true;
        }

        let lower = url.to_lowercase();
        let vendor = self.config.vendor_patterns.iter().any(|p| lower.contains(&p.to_lowercase()));
        if vendor {
            debug!(url, "Blackboxing vendor script");
        }
        vendor
    }

    /// Decide whether a newly parsed script is blackboxed, updating the pattern set.
    ///
    /// `internal` scripts (empty, evaluated or extension URLs) are never touched.
    pub fn observe(&mut self, url: &str, internal: bool) -> BlackboxVerdict {
        if internal || !self.should_blackbox(url) {
            return BlackboxVerdict::default();
        }

        let pattern = Self::pattern_for(url);
        let added = self.known.insert(pattern.clone());
        if added {
            self.patterns.push(pattern);
        }
        BlackboxVerdict { blacklisted: true, added }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blackboxer() -> Blackboxer {
        Blackboxer::new(BlackboxConfig {
            manual_add: vec!["cdn.internal".into()],
            manual_remove: vec!["my-vue-app".into()],
            ..Default::default()
        })
    }

    #[test]
    fn test_vendor_urls_are_blackboxed_once() {
        let mut bb = blackboxer();

        let url = "https://app.test/static/React.production.js";
        assert_eq!(bb.observe(url, false), BlackboxVerdict { blacklisted: true, added: true });
        assert_eq!(bb.observe(url, false), BlackboxVerdict { blacklisted: true, added: false });
        assert_eq!(bb.patterns().len(), 1);
        assert!(bb.is_blackboxed(url));
        assert_eq!(bb.patterns()[0], r"^https://app\.test/static/React\.production\.js$");
    }

    #[test]
    fn test_manual_lists() {
        let mut bb = blackboxer();

        assert!(bb.observe("https://cdn.internal/app.js", false).blacklisted);
        // Contains "vue" but the exclude list wins.
        assert!(!bb.observe("https://host/my-vue-app/main.js", false).blacklisted);
        assert!(!bb.observe("https://host/app/main.js", false).blacklisted);
    }

    #[test]
    fn test_internal_scripts_are_ignored() {
        let mut bb = blackboxer();
        assert_eq!(bb.observe("", true), BlackboxVerdict::default());
        assert_eq!(bb.observe("extensions::webpack", true), BlackboxVerdict::default());
        assert!(bb.patterns().is_empty());
    }
}
