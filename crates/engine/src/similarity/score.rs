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

/// `|A ∩ B| / |A ∪ B|` over the distinct tokens; two empty sets are identical.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Sørensen–Dice coefficient over character bigrams.
pub fn dice(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }

    let bigrams = |chars: &[char]| -> HashSet<(char, char)> {
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let a = bigrams(&a);
    let b = bigrams(&b);
    2.0 * a.intersection(&b).count() as f64 / (a.len() + b.len()) as f64
}

/// The path part of a token: everything before the first `:`.
pub fn extract_key(token: &str) -> &str {
    token.split_once(':').map_or(token, |(key, _)| key)
}

/// Average, over the tokens of `a`, of the best [`dice`] score between its key
/// and any key of `b`.
pub fn fuzzy_key_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let keys: Vec<&str> = b.iter().map(|t| extract_key(t)).collect();
    let total: f64 = a
        .iter()
        .map(|token| {
            let key = extract_key(token);
            keys.iter().map(|other| dice(key, other)).fold(0.0, f64::max)
        })
        .sum();
    total / a.len() as f64
}

/// `alpha · jaccard + (1 - alpha) · fuzzy`
pub fn hybrid_similarity(a: &[String], b: &[String], alpha: f64) -> f64 {
    alpha * jaccard(a, b) + (1.0 - alpha) * fuzzy_key_similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapdbg_common::DEFAULT_ALPHA;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard(&[], &[]), 1.0);
        assert_eq!(jaccard(&tokens(&["a"]), &[]), 0.0);
        let score = jaccard(&tokens(&["a", "b"]), &tokens(&["a", "c"]));
        assert!((score - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_dice() {
        assert_eq!(dice("night", "night"), 1.0);
        assert_eq!(dice("a", "b"), 0.0);
        assert_eq!(dice("a", "ab"), 0.0);
        // {ni, ig, gh, ht} vs {na, ac, ch, ht}
        assert!((dice("night", "nacht") - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_extract_key() {
        assert_eq!(extract_key("a.b:number"), "a.b");
        assert_eq!(extract_key("a.b=1"), "a.b=1");
    }

    #[test]
    fn test_fuzzy_empty_sides() {
        assert_eq!(fuzzy_key_similarity(&[], &tokens(&["a:number"])), 0.0);
        assert_eq!(fuzzy_key_similarity(&tokens(&["a:number"]), &[]), 0.0);
    }

    #[test]
    fn test_hybrid_reference_value() {
        let a = tokens(&["a:number", "b:number"]);
        let b = tokens(&["a:number", "c:number"]);
        let score = hybrid_similarity(&a, &b, DEFAULT_ALPHA);
        assert!((score - 0.45).abs() < 1e-9, "score = {score}");
    }
}
