//! String and Unicode similarity helpers for the URL analyzer.

use super::reference::CONFUSABLE_MAP;
use std::collections::HashMap;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Character-level edit distance (insert, delete, substitute).
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// ASCII lookalike of a label: confusable letters replaced, diacritics
/// stripped, lowercased. Characters with no Latin lookalike are kept.
pub fn confusable_skeleton(text: &str) -> String {
    text.chars()
        .map(|c| CONFUSABLE_MAP.get(&c).copied().unwrap_or(c))
        .collect::<String>()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Decodes `xn--` labels back to Unicode. Labels that fail to decode are kept
/// as they are.
pub fn decode_idn_host(host: &str) -> String {
    host.split('.')
        .map(|label| {
            label
                .strip_prefix("xn--")
                .and_then(idna::punycode::decode_to_string)
                .unwrap_or_else(|| label.to_string())
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Shannon entropy in bits per character.
pub fn domain_entropy(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    counts.values().fold(0.0, |entropy, &n| {
        let p = n as f64 / total as f64;
        entropy - p * p.log2()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("faceboook", "facebook", 1)]
    #[case("paypa1", "paypal", 1)]
    #[case("amazon", "amazon", 0)]
    #[case("", "abc", 3)]
    #[case("kitten", "sitting", 3)]
    #[case("gooogle", "google", 1)]
    fn test_levenshtein(#[case] a: &str, #[case] b: &str, #[case] expected: usize) {
        assert_eq!(levenshtein_distance(a, b), expected);
    }

    #[test]
    fn test_skeleton_folds_cyrillic_and_diacritics() {
        // Cyrillic а, р, у in "раураl"
        assert_eq!(confusable_skeleton("\u{0440}\u{0430}\u{0443}\u{0440}\u{0430}l"), "paypal");
        assert_eq!(confusable_skeleton("München"), "munchen");
        assert_eq!(confusable_skeleton("東京"), "東京");
    }

    #[test]
    fn test_decode_idn_host() {
        assert_eq!(decode_idn_host("xn--mnchen-3ya.de"), "münchen.de");
        assert_eq!(decode_idn_host("example.com"), "example.com");
    }

    #[test]
    fn test_entropy() {
        assert_eq!(domain_entropy(""), 0.0);
        assert_eq!(domain_entropy("aaaa"), 0.0);
        assert!((domain_entropy("abcd") - 2.0).abs() < 1e-9);
    }
}
