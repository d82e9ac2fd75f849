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


use heapdbg_common::ParsedScript;

/// Registry of the scripts a target has parsed, in parse order.
#[derive(Debug, Clone, Default)]
pub struct ScriptRegistry {
    scripts: Vec<ParsedScript>,
}

impl ScriptRegistry {
    /// Record a parsed script.
    ///
    /// A previous entry with the same content hash is evicted first, so reloading
    /// a page does not leave stale script ids behind.
    pub fn insert(&mut self, script: ParsedScript) {
        if !script.hash.is_empty() {
            if let Some(pos) = self.scripts.iter().position(|s| s.hash == script.hash) {
                self.scripts.remove(pos);
            }
        }
        self.scripts.retain(|s| s.script_id != script.script_id);
        self.scripts.push(script);
    }

    /// URL of the script with the given id
    pub fn url_of(&self, script_id: &str) -> Option<&str> {
        self.scripts.iter().find(|s| s.script_id == script_id).map(|s| s.url.as_str())
    }

    /// Id of the first script loaded from `url`
    pub fn id_of(&self, url: &str) -> Option<&str> {
        self.scripts.iter().find(|s| s.url == url).map(|s| s.script_id.as_str())
    }

    /// Snapshot of every parsed script
    pub fn list(&self) -> Vec<ParsedScript> {
        self.scripts.clone()
    }

    /// Number of parsed scripts
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    /// Whether no script has been parsed
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(id: &str, url: &str, hash: &str) -> ParsedScript {
        ParsedScript {
            script_id: id.into(),
            url: url.into(),
            hash: hash.into(),
            blacklisted: false,
        }
    }

    #[test]
    fn test_lookups() {
        let mut registry = ScriptRegistry::default();
        registry.insert(script("1", "https://app.test/a.js", "h1"));
        registry.insert(script("2", "https://app.test/b.js", "h2"));

        assert_eq!(registry.url_of("2"), Some("https://app.test/b.js"));
        assert_eq!(registry.id_of("https://app.test/a.js"), Some("1"));
        assert_eq!(registry.url_of("3"), None);
        assert_eq!(registry.id_of("https://app.test/c.js"), None);
    }

    #[test]
    fn test_reload_evicts_same_hash() {
        let mut registry = ScriptRegistry::default();
        registry.insert(script("1", "https://app.test/a.js", "h1"));
        registry.insert(script("2", "https://app.test/b.js", "h2"));
        registry.insert(script("7", "https://app.test/a.js", "h1"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.id_of("https://app.test/a.js"), Some("7"));
        assert_eq!(registry.url_of("1"), None);
    }

    #[test]
    fn test_empty_hashes_do_not_evict() {
        let mut registry = ScriptRegistry::default();
        registry.insert(script("1", "", ""));
        registry.insert(script("2", "", ""));
        assert_eq!(registry.len(), 2);
    }
}
