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


/// 64-bit token hash built from two CRC-32 digests.
pub fn hash64(token: &str) -> u64 {
    let high = crc32fast::hash(format!("X{token}").as_bytes()) as u64;
    let low = crc32fast::hash(token.as_bytes()) as u64;
    (high << 32) | low
}

/// SimHash fingerprint over shingles of `window` consecutive tokens.
///
/// When there are fewer tokens than `window` the whole sequence forms a single
/// shingle.
pub fn simhash64(tokens: &[String], window: usize) -> u64 {
    let window = window.max(1);
    let shingles: Vec<String> = if tokens.len() < window {
        vec![tokens.join("|")]
    } else {
        tokens.windows(window).map(|w| w.join("|")).collect()
    };

    let mut votes = [0i64; 64];
    for shingle in &shingles {
        let hash = hash64(shingle);
        for (bit, vote) in votes.iter_mut().enumerate() {
            if hash >> bit & 1 == 1 {
                *vote += 1;
            } else {
                *vote -= 1;
            }
        }
    }

    votes.iter().enumerate().filter(|(_, v)| **v > 0).fold(0u64, |acc, (bit, _)| acc | 1 << bit)
}

/// Number of differing bits
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// `1 - hamming / 64`
pub fn similarity_simhash(a: u64, b: u64) -> f64 {
    1.0 - hamming(a, b) as f64 / 64.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("k{i}:number")).collect()
    }

    #[test]
    fn test_hash64_halves() {
        let hash = hash64("abc");
        assert_eq!(hash as u32, crc32fast::hash(b"abc"));
        assert_eq!((hash >> 32) as u32, crc32fast::hash(b"Xabc"));
    }

    #[test]
    fn test_short_input_is_single_shingle() {
        let short = tokens(3);
        assert_eq!(simhash64(&short, 4), hash64(&short.join("|")));
        assert_eq!(simhash64(&[], 4), hash64(""));
    }

    #[test]
    fn test_hamming() {
        assert_eq!(hamming(0, 0), 0);
        assert_eq!(hamming(0, u64::MAX), 64);
        assert_eq!(similarity_simhash(0b1011, 0b0010), 1.0 - 2.0 / 64.0);
    }

    #[test]
    fn test_near_duplicates_stay_close() {
        let base = tokens(40);
        let mut edited = base.clone();
        edited[20] = "changed:string".to_string();
        let near = hamming(simhash64(&base, 4), simhash64(&edited, 4));

        let unrelated: Vec<String> = (0..40).map(|i| format!("other{i}=x")).collect();
        let far = hamming(simhash64(&base, 4), simhash64(&unrelated, 4));
        assert!(near < far, "near = {near}, far = {far}");
    }
}
