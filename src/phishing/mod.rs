//! Phishing URL classification: homograph, typosquatting, TLD, IP host,
//! subdomain-abuse and domain-shape heuristics combined into a single score.
//!
//! Analysis is pure and never fails; anything that is not an http(s) URL with
//! a host scores zero.

pub mod reference;
pub mod similarity;

pub use similarity::{confusable_skeleton, domain_entropy, levenshtein_distance};

use crate::config::PhishingConfig;
use crate::domain_utils::DomainUtils;
use reference::{BRANDS, MIN_TYPOSQUAT_BRAND_LEN, SUSPICIOUS_TLD_SET};
use serde::{Deserialize, Serialize};
use similarity::decode_idn_host;
use url::{Host, Url};

const HOMOGRAPH_SCORE: f64 = 0.4;
// Below the detection threshold on its own: plenty of real names sit one
// edit away from a brand.
const TYPOSQUAT_SCORE: f64 = 0.25;
const SUSPICIOUS_TLD_SCORE: f64 = 0.2;
const IP_HOST_SCORE: f64 = 0.3;
const SUBDOMAIN_ABUSE_SCORE: f64 = 0.4;
const HIGH_ENTROPY_SCORE: f64 = 0.15;
const SHORT_DOMAIN_SCORE: f64 = 0.1;

pub fn is_suspicious_tld(tld: &str) -> bool {
    let tld = tld.trim_start_matches('.').to_lowercase();
    SUSPICIOUS_TLD_SET.contains(tld.as_str())
}

pub fn is_ip_address(host: &str) -> bool {
    DomainUtils::is_ip_address(host)
}

pub fn count_subdomains(host: &str) -> usize {
    DomainUtils::count_subdomains(host)
}

pub fn registrable_domain(host: &str) -> String {
    DomainUtils::registrable_domain(host)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Homograph,
    Typosquatting,
    SuspiciousTld,
    IpAddress,
    SubdomainAbuse,
    HighEntropy,
    ShortDomain,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::Homograph => "homograph",
            IndicatorKind::Typosquatting => "typosquatting",
            IndicatorKind::SuspiciousTld => "suspicious_tld",
            IndicatorKind::IpAddress => "ip_address",
            IndicatorKind::SubdomainAbuse => "subdomain_abuse",
            IndicatorKind::HighEntropy => "high_entropy",
            IndicatorKind::ShortDomain => "short_domain",
        }
    }
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhishingIndicator {
    pub kind: IndicatorKind,
    pub score: f64,
    pub evidence: String,
    pub brand: Option<String>,
    pub distance: Option<usize>,
}

impl PhishingIndicator {
    fn new(kind: IndicatorKind, score: f64, evidence: String) -> Self {
        Self {
            kind,
            score,
            evidence,
            brand: None,
            distance: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhishingAnalysis {
    pub url: String,
    pub host: Option<String>,
    pub unicode_host: Option<String>,
    pub registrable_domain: Option<String>,
    pub phishing_score: f64,
    pub detected: bool,
    /// Highest-scoring indicator, set only when `detected`.
    pub alert_type: Option<IndicatorKind>,
    pub indicators: Vec<PhishingIndicator>,
    pub closest_popular_domain: Option<String>,
    pub edit_distance: Option<usize>,
    pub impersonated_brand: Option<String>,
    /// Where the URL really goes, for "really going to X" messaging.
    pub actual_domain: Option<String>,
    pub domain_entropy: f64,
    pub confidence: f64,
    pub explanation: String,
}

impl PhishingAnalysis {
    fn clean(url: &str) -> Self {
        Self {
            url: url.to_string(),
            host: None,
            unicode_host: None,
            registrable_domain: None,
            phishing_score: 0.0,
            detected: false,
            alert_type: None,
            indicators: Vec::new(),
            closest_popular_domain: None,
            edit_distance: None,
            impersonated_brand: None,
            actual_domain: None,
            domain_entropy: 0.0,
            confidence: 0.0,
            explanation: "No phishing indicators".to_string(),
        }
    }

    pub fn has_indicator(&self, kind: IndicatorKind) -> bool {
        self.indicators.iter().any(|i| i.kind == kind)
    }
}

/// Parsed view of a URL shared by every check.
#[derive(Debug, Clone)]
pub struct UrlTarget {
    /// ASCII (punycode) host.
    pub host: String,
    pub unicode_host: String,
    pub is_ip: bool,
    pub registrable: String,
    /// Registrable domain without its public suffix, ASCII.
    pub name: String,
    /// Same as `name` with IDN labels decoded.
    pub unicode_name: String,
    pub tld: Option<String>,
    pub subdomains: Vec<String>,
}

impl UrlTarget {
    pub fn parse(url: &str) -> Option<Self> {
        let parsed = Url::parse(url.trim()).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let (host, is_ip) = match parsed.host()? {
            Host::Domain(d) => (DomainUtils::normalize_host(d), false),
            Host::Ipv4(ip) => (ip.to_string(), true),
            Host::Ipv6(ip) => (ip.to_string(), true),
        };
        if host.is_empty() {
            return None;
        }
        let unicode_host = if is_ip {
            host.clone()
        } else {
            decode_idn_host(&host)
        };
        Some(Self {
            registrable: DomainUtils::registrable_domain(&host),
            name: DomainUtils::domain_name_part(&host),
            unicode_name: if is_ip {
                host.clone()
            } else {
                DomainUtils::domain_name_part(&unicode_host)
            },
            tld: if is_ip {
                None
            } else {
                DomainUtils::top_level_label(&host)
            },
            subdomains: if is_ip {
                Vec::new()
            } else {
                DomainUtils::subdomain_labels(&host)
            },
            host,
            unicode_host,
            is_ip,
        })
    }
}

/// One independent heuristic over a parsed URL.
pub trait UrlCheck: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, target: &UrlTarget) -> Option<PhishingIndicator>;
}

/// Non-ASCII labels whose Latin skeleton spells a popular brand.
pub struct HomographCheck;

impl UrlCheck for HomographCheck {
    fn name(&self) -> &str {
        "homograph"
    }

    fn evaluate(&self, target: &UrlTarget) -> Option<PhishingIndicator> {
        if target.is_ip || target.unicode_host.is_ascii() {
            return None;
        }
        let labels: Vec<&str> = target.unicode_host.split('.').collect();
        let candidates = &labels[..labels.len().saturating_sub(1)];
        for label in candidates.iter().filter(|l| !l.is_ascii()) {
            let skeleton = confusable_skeleton(label);
            if let Some((brand, domain)) = BRANDS.iter().find(|(brand, _)| *brand == skeleton) {
                let mut indicator = PhishingIndicator::new(
                    IndicatorKind::Homograph,
                    HOMOGRAPH_SCORE,
                    format!(
                        "'{}' is visually identical to {} (homograph)",
                        label, domain
                    ),
                );
                indicator.brand = Some(brand.to_string());
                return Some(indicator);
            }
        }
        None
    }
}

/// Popular brand name within a few edits of the domain name.
pub struct TyposquatCheck {
    max_distance: usize,
}

impl TyposquatCheck {
    pub fn new(max_distance: usize) -> Self {
        Self { max_distance }
    }
}

/// Closest brand by edit distance, ignoring brands too short to compare.
pub fn closest_popular_domain(name: &str) -> Option<(&'static str, &'static str, usize)> {
    BRANDS
        .iter()
        .filter(|(brand, _)| brand.len() >= MIN_TYPOSQUAT_BRAND_LEN)
        .map(|(brand, domain)| (*brand, *domain, levenshtein_distance(name, brand)))
        .min_by_key(|(_, _, distance)| *distance)
}

impl UrlCheck for TyposquatCheck {
    fn name(&self) -> &str {
        "typosquatting"
    }

    fn evaluate(&self, target: &UrlTarget) -> Option<PhishingIndicator> {
        if target.is_ip || !target.name.is_ascii() || target.name.starts_with("xn--") {
            return None;
        }
        let (brand, domain, distance) = closest_popular_domain(&target.name)?;
        let len_diff = target.name.len().abs_diff(brand.len());
        if distance == 0
            || distance > self.max_distance
            || distance * 2 >= brand.len()
            || len_diff > 2
        {
            return None;
        }
        let mut indicator = PhishingIndicator::new(
            IndicatorKind::Typosquatting,
            TYPOSQUAT_SCORE,
            format!(
                "'{}' is {} edit(s) away from {}",
                target.registrable, distance, domain
            ),
        );
        indicator.brand = Some(brand.to_string());
        indicator.distance = Some(distance);
        Some(indicator)
    }
}

pub struct SuspiciousTldCheck;

impl UrlCheck for SuspiciousTldCheck {
    fn name(&self) -> &str {
        "suspicious_tld"
    }

    fn evaluate(&self, target: &UrlTarget) -> Option<PhishingIndicator> {
        let tld = target.tld.as_deref()?;
        is_suspicious_tld(tld).then(|| {
            PhishingIndicator::new(
                IndicatorKind::SuspiciousTld,
                SUSPICIOUS_TLD_SCORE,
                format!("High-abuse TLD .{}", tld),
            )
        })
    }
}

pub struct IpHostCheck;

impl UrlCheck for IpHostCheck {
    fn name(&self) -> &str {
        "ip_address"
    }

    fn evaluate(&self, target: &UrlTarget) -> Option<PhishingIndicator> {
        target.is_ip.then(|| {
            PhishingIndicator::new(
                IndicatorKind::IpAddress,
                IP_HOST_SCORE,
                format!("Host is a literal IP address ({})", target.host),
            )
        })
    }
}

/// Brand name buried in a deep subdomain chain of an unrelated domain.
pub struct SubdomainAbuseCheck {
    min_subdomains: usize,
}

impl SubdomainAbuseCheck {
    pub fn new(min_subdomains: usize) -> Self {
        Self { min_subdomains }
    }
}

fn label_mentions(label: &str, brand: &str) -> bool {
    label == brand || label.split('-').any(|part| part == brand)
}

impl UrlCheck for SubdomainAbuseCheck {
    fn name(&self) -> &str {
        "subdomain_abuse"
    }

    fn evaluate(&self, target: &UrlTarget) -> Option<PhishingIndicator> {
        if target.subdomains.len() < self.min_subdomains {
            return None;
        }
        let (brand, _) = BRANDS.iter().find(|(brand, _)| {
            *brand != target.name
                && target
                    .subdomains
                    .iter()
                    .any(|label| label_mentions(label, brand))
        })?;
        let mut indicator = PhishingIndicator::new(
            IndicatorKind::SubdomainAbuse,
            SUBDOMAIN_ABUSE_SCORE,
            format!(
                "'{}' appears in a subdomain but the site is really {}",
                brand, target.registrable
            ),
        );
        indicator.brand = Some(brand.to_string());
        Some(indicator)
    }
}

/// Names that read like generated strings.
pub struct EntropyCheck {
    threshold: f64,
}

impl EntropyCheck {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl UrlCheck for EntropyCheck {
    fn name(&self) -> &str {
        "high_entropy"
    }

    fn evaluate(&self, target: &UrlTarget) -> Option<PhishingIndicator> {
        if target.is_ip {
            return None;
        }
        let entropy = domain_entropy(&target.unicode_name);
        (entropy > self.threshold).then(|| {
            PhishingIndicator::new(
                IndicatorKind::HighEntropy,
                HIGH_ENTROPY_SCORE,
                format!("High domain entropy ({:.2}) suggests a generated name", entropy),
            )
        })
    }
}

/// Very short ASCII names. IDN names are exempt; two-character CJK names are common.
pub struct ShortDomainCheck {
    min_length: usize,
}

impl ShortDomainCheck {
    pub fn new(min_length: usize) -> Self {
        Self { min_length }
    }
}

impl UrlCheck for ShortDomainCheck {
    fn name(&self) -> &str {
        "short_domain"
    }

    fn evaluate(&self, target: &UrlTarget) -> Option<PhishingIndicator> {
        if target.is_ip || target.name.is_empty() || target.name != target.unicode_name {
            return None;
        }
        (target.name.len() < self.min_length).then(|| {
            PhishingIndicator::new(
                IndicatorKind::ShortDomain,
                SHORT_DOMAIN_SCORE,
                format!("Very short domain name '{}'", target.name),
            )
        })
    }
}

pub struct PhishingUrlAnalyzer {
    checks: Vec<Box<dyn UrlCheck>>,
    detection_threshold: f64,
}

impl Default for PhishingUrlAnalyzer {
    fn default() -> Self {
        Self::new(&PhishingConfig::default())
    }
}

impl PhishingUrlAnalyzer {
    pub fn new(config: &PhishingConfig) -> Self {
        Self {
            checks: vec![
                Box::new(HomographCheck),
                Box::new(TyposquatCheck::new(config.max_typo_distance)),
                Box::new(SuspiciousTldCheck),
                Box::new(IpHostCheck),
                Box::new(SubdomainAbuseCheck::new(config.min_subdomains_for_abuse)),
                Box::new(EntropyCheck::new(config.entropy_threshold)),
                Box::new(ShortDomainCheck::new(config.min_domain_name_length)),
            ],
            detection_threshold: config.detection_threshold,
        }
    }

    pub fn analyze_url(&self, url: &str) -> PhishingAnalysis {
        let target = match UrlTarget::parse(url) {
            Some(target) => target,
            None => return PhishingAnalysis::clean(url),
        };

        let indicators: Vec<PhishingIndicator> = self
            .checks
            .iter()
            .filter_map(|check| {
                let indicator = check.evaluate(&target);
                if let Some(found) = &indicator {
                    log::debug!("{} check fired for {}: {}", check.name(), url, found.evidence);
                }
                indicator
            })
            .collect();

        let score = indicators
            .iter()
            .fold(0.0, |total, i| total + i.score)
            .clamp(0.0, 1.0);
        let detected = score >= self.detection_threshold;
        let alert_type = if detected {
            indicators
                .iter()
                .max_by(|a, b| a.score.total_cmp(&b.score))
                .map(|i| i.kind)
        } else {
            None
        };

        let closest = if target.is_ip || !target.name.is_ascii() {
            None
        } else {
            closest_popular_domain(&target.name)
        };
        let impersonated_brand = indicators
            .iter()
            .filter(|i| i.kind != IndicatorKind::Typosquatting)
            .chain(indicators.iter())
            .find_map(|i| i.brand.clone());

        let explanation = if indicators.is_empty() {
            "No phishing indicators".to_string()
        } else {
            indicators
                .iter()
                .map(|i| i.evidence.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };

        if detected {
            log::info!(
                "Phishing URL detected ({:.2}, {}): {}",
                score,
                alert_type.map(|k| k.as_str()).unwrap_or("unknown"),
                url
            );
        }

        PhishingAnalysis {
            url: url.to_string(),
            domain_entropy: domain_entropy(&target.unicode_name),
            confidence: (indicators.len() as f64 / 3.0).min(1.0),
            host: Some(target.host.clone()),
            unicode_host: Some(target.unicode_host.clone()),
            registrable_domain: Some(target.registrable.clone()),
            phishing_score: score,
            detected,
            alert_type,
            closest_popular_domain: closest.map(|(_, domain, _)| domain.to_string()),
            edit_distance: closest.map(|(_, _, distance)| distance),
            impersonated_brand,
            actual_domain: Some(target.registrable.clone()),
            indicators,
            explanation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn analyze(url: &str) -> PhishingAnalysis {
        PhishingUrlAnalyzer::default().analyze_url(url)
    }

    #[rstest]
    #[case("xyz", true)]
    #[case("tk", true)]
    #[case(".TOP", true)]
    #[case("com", false)]
    #[case("de", false)]
    fn test_is_suspicious_tld(#[case] tld: &str, #[case] expected: bool) {
        assert_eq!(is_suspicious_tld(tld), expected);
    }

    #[test]
    fn test_standalone_utilities() {
        assert_eq!(levenshtein_distance("faceboook", "facebook"), 1);
        assert_eq!(count_subdomains("login.secure.account.paypal.phishing.com"), 4);
        assert!(is_ip_address("10.0.0.1"));
        assert!(!is_ip_address("paypal.com"));
        assert_eq!(registrable_domain("a.b.paypal.co.uk"), "paypal.co.uk");
    }

    #[rstest]
    #[case("https://münchen.de/stadtplan")]
    #[case("https://xn--mnchen-3ya.de/")]
    #[case("https://例え.jp/")]
    #[case("https://пример.рф/")]
    #[case("https://www.google.com/search?q=rust")]
    #[case("https://github.com/rust-lang/rust")]
    fn test_legitimate_domains_score_zero(#[case] url: &str) {
        let analysis = analyze(url);
        assert_eq!(analysis.phishing_score, 0.0, "{:?}", analysis.indicators);
        assert!(!analysis.detected);
    }

    #[rstest]
    #[case("javascript:alert(1)")]
    #[case("data:text/html,<script>x</script>")]
    #[case("about:blank")]
    #[case("not even a url")]
    #[case("")]
    fn test_non_web_urls_are_neutral(#[case] url: &str) {
        let analysis = analyze(url);
        assert_eq!(analysis.phishing_score, 0.0);
        assert!(!analysis.detected);
        assert!(analysis.indicators.is_empty());
    }

    #[test]
    fn test_cyrillic_homograph() {
        // "аррӏе" with Cyrillic а, р, ӏ, е
        let analysis = analyze("https://\u{0430}\u{0440}\u{0440}\u{04CF}\u{0435}.com/login");
        assert!(analysis.detected);
        assert_eq!(analysis.alert_type, Some(IndicatorKind::Homograph));
        assert_eq!(analysis.impersonated_brand.as_deref(), Some("apple"));
        assert!(analysis.host.unwrap().starts_with("xn--"));
    }

    #[test]
    fn test_lone_typosquat_is_reported_but_not_detected() {
        let analysis = analyze("https://faceboook.com/login");
        assert!(analysis.has_indicator(IndicatorKind::Typosquatting));
        assert!(!analysis.detected);
        assert_eq!(analysis.closest_popular_domain.as_deref(), Some("facebook.com"));
        assert_eq!(analysis.edit_distance, Some(1));
        assert!((analysis.phishing_score - 0.25).abs() < 1e-9);
    }

    #[rstest]
    #[case("https://www.chess.com/")]
    #[case("https://ample.com/")]
    #[case("https://maple.com/")]
    #[case("https://email.com/")]
    fn test_names_near_brands_are_not_phishing(#[case] url: &str) {
        let analysis = analyze(url);
        assert!(!analysis.detected, "{} {:?}", url, analysis.indicators);
        assert!(analysis.phishing_score < 0.3);
    }

    #[test]
    fn test_typosquat_plus_tld() {
        let analysis = analyze("http://paypa1.xyz/");
        assert!(analysis.has_indicator(IndicatorKind::Typosquatting));
        assert!(analysis.has_indicator(IndicatorKind::SuspiciousTld));
        assert!(analysis.detected);
        assert!((analysis.phishing_score - 0.45).abs() < 1e-9);
        assert_eq!(analysis.alert_type, Some(IndicatorKind::Typosquatting));
    }

    #[test]
    fn test_high_entropy_name() {
        let analysis = analyze("https://qx7kz2vbm9wjp4.xyz/");
        assert!(analysis.has_indicator(IndicatorKind::HighEntropy));
        assert!(analysis.domain_entropy > 3.5);
        assert!(analysis.detected);
        assert!((analysis.phishing_score - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_short_domain_name() {
        let analysis = analyze("https://qz.top/");
        assert!(analysis.has_indicator(IndicatorKind::ShortDomain));
        assert!((analysis.phishing_score - 0.3).abs() < 1e-9);
        assert!(analysis.detected);
        assert_eq!(analysis.alert_type, Some(IndicatorKind::SuspiciousTld));

        let alone = analyze("https://bbc.co.uk/news");
        assert!(alone.has_indicator(IndicatorKind::ShortDomain));
        assert!(!alone.detected);
    }

    #[test]
    fn test_confidence_counts_indicators() {
        assert_eq!(analyze("https://qz.top/").confidence, 2.0 / 3.0);
        assert_eq!(analyze("https://www.google.com/").confidence, 0.0);
    }

    #[test]
    fn test_clean_score_is_positive_zero() {
        let analysis = analyze("https://www.google.com/");
        assert!(analysis.phishing_score.is_sign_positive());
        let json = serde_json::to_value(&analysis).unwrap();
        assert_eq!(json["phishing_score"].to_string(), "0.0");
    }

    #[test]
    fn test_suspicious_tld_alone_is_below_threshold() {
        let analysis = analyze("https://my-recipes.xyz/");
        assert!((analysis.phishing_score - 0.2).abs() < 1e-9);
        assert!(!analysis.detected);
        assert_eq!(analysis.alert_type, None);
        assert!(analysis.has_indicator(IndicatorKind::SuspiciousTld));
    }

    #[rstest]
    #[case("http://192.168.1.1/login")]
    #[case("https://192.168.1.1/login")]
    #[case("http://[2001:db8::1]/")]
    fn test_ip_host_detected_regardless_of_scheme(#[case] url: &str) {
        let analysis = analyze(url);
        assert!(analysis.detected);
        assert_eq!(analysis.alert_type, Some(IndicatorKind::IpAddress));
    }

    #[test]
    fn test_subdomain_abuse() {
        let analysis = analyze("https://login.secure.account.paypal.phishing.com/verify");
        assert!(analysis.detected);
        assert_eq!(analysis.alert_type, Some(IndicatorKind::SubdomainAbuse));
        assert_eq!(analysis.impersonated_brand.as_deref(), Some("paypal"));
        assert_eq!(analysis.actual_domain.as_deref(), Some("phishing.com"));
    }

    #[test]
    fn test_brand_own_subdomains_not_abuse() {
        let analysis = analyze("https://a.b.c.paypal.com/");
        assert!(!analysis.has_indicator(IndicatorKind::SubdomainAbuse));
        assert_eq!(analysis.phishing_score, 0.0);
    }

    #[test]
    fn test_score_is_clamped() {
        let analysis = analyze("https://login.secure.account.paypal.faceboook.tk/");
        assert!(analysis.phishing_score <= 1.0);
        assert!(analysis.confidence <= 1.0);
        assert!(analysis.explanation.contains(';'));
    }
}
