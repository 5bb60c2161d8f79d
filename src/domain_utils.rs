use std::net::IpAddr;
use url::{Host, Url};

/// Second-level labels that act as public suffixes under a country TLD.
const MULTI_PART_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "com.au", "net.au", "org.au", "co.jp",
    "ne.jp", "or.jp", "co.nz", "com.br", "com.cn", "co.in", "co.za", "com.mx", "com.tr",
];

/// Minimal host and origin utilities
pub struct DomainUtils;

impl DomainUtils {
    /// Origin of an http(s) URL as `scheme://host[:port]`, default ports omitted.
    pub fn extract_origin(url: &str) -> Option<String> {
        let parsed = Url::parse(url.trim()).ok()?;
        Self::origin_of(&parsed)
    }

    pub fn origin_of(url: &Url) -> Option<String> {
        match url.scheme() {
            "http" | "https" => {}
            _ => return None,
        }
        url.host()?;
        Some(url.origin().ascii_serialization())
    }

    /// Lowercased host of an http(s) URL, without IPv6 brackets or trailing dot.
    pub fn extract_host(url: &str) -> Option<String> {
        let parsed = Url::parse(url.trim()).ok()?;
        match parsed.host()? {
            Host::Domain(d) => Some(Self::normalize_host(d)),
            Host::Ipv4(ip) => Some(ip.to_string()),
            Host::Ipv6(ip) => Some(ip.to_string()),
        }
    }

    pub fn normalize_host(host: &str) -> String {
        host.trim_end_matches('.').to_lowercase()
    }

    pub fn is_ip_address(host: &str) -> bool {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        trimmed.parse::<IpAddr>().is_ok()
    }

    /// Last label of the host.
    pub fn top_level_label(host: &str) -> Option<String> {
        let host = Self::normalize_host(host);
        host.rsplit('.')
            .next()
            .filter(|tld| !tld.is_empty())
            .map(|tld| tld.to_string())
    }

    fn suffix_label_count(labels: &[&str]) -> usize {
        if labels.len() >= 3 {
            let tail = format!("{}.{}", labels[labels.len() - 2], labels[labels.len() - 1]);
            if MULTI_PART_SUFFIXES.contains(&tail.as_str()) {
                return 2;
            }
        }
        1
    }

    /// Registrable domain (`example.co.uk` for `a.b.example.co.uk`).
    ///
    /// IP literals and single-label hosts are returned unchanged.
    pub fn registrable_domain(host: &str) -> String {
        let host = Self::normalize_host(host);
        if Self::is_ip_address(&host) {
            return host;
        }
        let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
        let keep = Self::suffix_label_count(&labels) + 1;
        if labels.len() <= keep {
            return labels.join(".");
        }
        labels[labels.len() - keep..].join(".")
    }

    /// Number of labels in front of the registrable domain.
    pub fn count_subdomains(host: &str) -> usize {
        let host = Self::normalize_host(host);
        if Self::is_ip_address(&host) {
            return 0;
        }
        let labels = host.split('.').filter(|l| !l.is_empty()).count();
        let registrable = Self::registrable_domain(&host).split('.').count();
        labels.saturating_sub(registrable)
    }

    /// Labels in front of the registrable domain, leftmost first.
    pub fn subdomain_labels(host: &str) -> Vec<String> {
        let host = Self::normalize_host(host);
        let count = Self::count_subdomains(&host);
        host.split('.')
            .filter(|l| !l.is_empty())
            .take(count)
            .map(|l| l.to_string())
            .collect()
    }

    /// Registrable domain without its public suffix (`paypal` for `www.paypal.co.uk`).
    pub fn domain_name_part(host: &str) -> String {
        let registrable = Self::registrable_domain(host);
        if Self::is_ip_address(&registrable) {
            return registrable;
        }
        registrable
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}
