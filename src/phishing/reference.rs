//! Static reference data for URL classification.

use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};

/// Domains phishers most often impersonate.
pub const POPULAR_DOMAINS: &[&str] = &[
    // Financial
    "paypal.com",
    "chase.com",
    "bankofamerica.com",
    "wellsfargo.com",
    "citibank.com",
    "capitalone.com",
    "americanexpress.com",
    // Technology
    "google.com",
    "apple.com",
    "microsoft.com",
    "amazon.com",
    "facebook.com",
    "instagram.com",
    "twitter.com",
    "linkedin.com",
    "netflix.com",
    "spotify.com",
    "dropbox.com",
    // Email
    "gmail.com",
    "outlook.com",
    "yahoo.com",
    "protonmail.com",
    // Commerce
    "ebay.com",
    "etsy.com",
    "shopify.com",
    "walmart.com",
    // Crypto
    "coinbase.com",
    "binance.com",
    "kraken.com",
    "blockchain.com",
    // Government and shipping
    "irs.gov",
    "usps.com",
    "fedex.com",
    "ups.com",
    // Cloud and developer
    "github.com",
    "gitlab.com",
    "docker.com",
    "cloudflare.com",
];

/// Free or unverified registries with high abuse rates.
const SUSPICIOUS_TLDS: &[&str] = &[
    "tk", "ml", "ga", "cf", "gq", "top", "xyz", "club", "work", "click", "link", "download",
    "stream", "online", "site", "website", "icu", "buzz", "rest", "fit", "loan", "win", "bid",
    "racing", "date", "review", "party", "science", "cricket", "accountant", "faith", "zip",
    "mov",
];

/// Non-Latin code points that render like a Latin letter.
const CONFUSABLES: &[(char, char)] = &[
    // Cyrillic
    ('\u{0430}', 'a'),
    ('\u{0435}', 'e'),
    ('\u{043E}', 'o'),
    ('\u{0440}', 'p'),
    ('\u{0441}', 'c'),
    ('\u{0443}', 'y'),
    ('\u{0445}', 'x'),
    ('\u{0456}', 'i'),
    ('\u{0455}', 's'),
    ('\u{0458}', 'j'),
    ('\u{0501}', 'd'),
    ('\u{04BB}', 'h'),
    ('\u{04CF}', 'l'),
    ('\u{051B}', 'q'),
    ('\u{051D}', 'w'),
    ('\u{0432}', 'b'),
    ('\u{043C}', 'm'),
    ('\u{043A}', 'k'),
    ('\u{0442}', 't'),
    ('\u{043D}', 'h'),
    // Greek
    ('\u{03BF}', 'o'),
    ('\u{03B1}', 'a'),
    ('\u{03BD}', 'v'),
    ('\u{03C1}', 'p'),
    ('\u{03C4}', 't'),
    ('\u{03B9}', 'i'),
    ('\u{03BA}', 'k'),
    // Latin lookalikes
    ('\u{0251}', 'a'),
    ('\u{0131}', 'i'),
    ('\u{0261}', 'g'),
    ('\u{1D0F}', 'o'),
];

/// Brands shorter than this are too ambiguous for edit-distance checks.
pub const MIN_TYPOSQUAT_BRAND_LEN: usize = 5;

lazy_static! {
    pub static ref SUSPICIOUS_TLD_SET: HashSet<&'static str> =
        SUSPICIOUS_TLDS.iter().copied().collect();
    pub static ref CONFUSABLE_MAP: HashMap<char, char> = CONFUSABLES.iter().copied().collect();
    /// Brand name (popular domain without its suffix) to domain.
    pub static ref BRANDS: Vec<(&'static str, &'static str)> = POPULAR_DOMAINS
        .iter()
        .map(|domain| {
            let name = domain.split('.').next().unwrap_or(domain);
            (name, *domain)
        })
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brand_names_derived() {
        assert!(BRANDS.contains(&("paypal", "paypal.com")));
        assert!(BRANDS.contains(&("irs", "irs.gov")));
        assert_eq!(BRANDS.len(), POPULAR_DOMAINS.len());
    }

    #[test]
    fn test_confusables_map_to_ascii() {
        assert!(CONFUSABLE_MAP.values().all(|c| c.is_ascii_lowercase()));
        assert_eq!(CONFUSABLE_MAP.get(&'\u{0430}'), Some(&'a'));
    }
}
