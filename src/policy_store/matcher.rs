//! Policy matching strategies, evaluated in fixed priority order.

use super::model::{from_millis, now, to_millis, MatchType, Policy, PolicyCandidate};
use super::policies::{row_to_policy, POLICY_COLUMNS};
use super::PolicyStore;
use crate::error::{Result, SentinelError};
use rusqlite::{params, Connection, OptionalExtension, ToSql};

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?2)";
const NO_HASH: &str = "(file_hash IS NULL OR file_hash = '')";
const NO_PATTERN: &str = "(url_pattern IS NULL OR url_pattern = '')";
const NEWEST_FIRST: &str = "ORDER BY created_at DESC, id DESC";
const IN_SCOPE: &str = "(?3 IS NULL OR match_type = ?3)";

pub trait PolicyMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Best live policy in this tier, newest first on ties.
    fn find(
        &self,
        conn: &Connection,
        candidate: &PolicyCandidate,
        now_ms: i64,
    ) -> Result<Option<Policy>>;
}

fn field(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn first_row(
    conn: &Connection,
    where_clause: &str,
    key: &dyn ToSql,
    scope: Option<MatchType>,
    now_ms: i64,
) -> Result<Option<Policy>> {
    let sql = format!(
        "SELECT {} FROM policies WHERE {} AND {} AND {} {} LIMIT 1",
        POLICY_COLUMNS, where_clause, LIVE, IN_SCOPE, NEWEST_FIRST
    );
    Ok(conn
        .query_row(&sql, params![key, now_ms, scope], row_to_policy)
        .optional()?)
}

/// Exact SHA-256 match.
pub struct HashMatcher;

impl PolicyMatcher for HashMatcher {
    fn name(&self) -> &'static str {
        "file_hash"
    }

    fn find(&self, conn: &Connection, candidate: &PolicyCandidate, now_ms: i64) -> Result<Option<Policy>> {
        match field(&candidate.file_hash) {
            Some(hash) => first_row(
                conn,
                "file_hash = ?1",
                &hash.to_lowercase(),
                candidate.match_type,
                now_ms,
            ),
            None => Ok(None),
        }
    }
}

/// Case-sensitive LIKE-style glob over the candidate URL.
pub struct UrlPatternMatcher;

impl PolicyMatcher for UrlPatternMatcher {
    fn name(&self) -> &'static str {
        "url_pattern"
    }

    fn find(&self, conn: &Connection, candidate: &PolicyCandidate, now_ms: i64) -> Result<Option<Policy>> {
        let url = match field(&candidate.url) {
            Some(url) => url,
            None => return Ok(None),
        };
        let sql = format!(
            "SELECT {} FROM policies
             WHERE url_pattern IS NOT NULL AND url_pattern != '' AND (expires_at IS NULL OR expires_at > ?1)
               AND (?2 IS NULL OR match_type = ?2)
             {}",
            POLICY_COLUMNS, NEWEST_FIRST
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![now_ms, candidate.match_type], row_to_policy)?;
        for row in rows {
            let policy = row?;
            let matched = policy
                .url_pattern
                .as_deref()
                .map(|pattern| like_match(pattern, url))
                .unwrap_or(false);
            if matched {
                return Ok(Some(policy));
            }
        }
        Ok(None)
    }
}

/// Rule-name match among policies that carry neither a hash nor a pattern.
pub struct RuleNameMatcher;

impl PolicyMatcher for RuleNameMatcher {
    fn name(&self) -> &'static str {
        "rule_name"
    }

    fn find(&self, conn: &Connection, candidate: &PolicyCandidate, now_ms: i64) -> Result<Option<Policy>> {
        match field(&candidate.rule_name) {
            Some(rule) => first_row(
                conn,
                &format!("rule_name = ?1 AND {} AND {}", NO_HASH, NO_PATTERN),
                &rule,
                candidate.match_type,
                now_ms,
            ),
            None => Ok(None),
        }
    }
}

/// Category-wide rule for the candidate's match type. Only reached when the
/// candidate asks for the category fallback.
pub struct MatchTypeDefaultMatcher;

impl PolicyMatcher for MatchTypeDefaultMatcher {
    fn name(&self) -> &'static str {
        "match_type"
    }

    fn find(&self, conn: &Connection, candidate: &PolicyCandidate, now_ms: i64) -> Result<Option<Policy>> {
        match candidate.match_type.filter(|_| candidate.category_fallback) {
            Some(match_type) => first_row(
                conn,
                &format!("match_type = ?1 AND {} AND {}", NO_HASH, NO_PATTERN),
                &match_type,
                Some(match_type),
                now_ms,
            ),
            None => Ok(None),
        }
    }
}

pub fn default_matchers() -> Vec<Box<dyn PolicyMatcher>> {
    vec![
        Box::new(HashMatcher),
        Box::new(UrlPatternMatcher),
        Box::new(RuleNameMatcher),
        Box::new(MatchTypeDefaultMatcher),
    ]
}

pub fn find_match(
    conn: &Connection,
    matchers: &[Box<dyn PolicyMatcher>],
    candidate: &PolicyCandidate,
    now_ms: i64,
) -> Result<Option<(Policy, &'static str)>> {
    for matcher in matchers {
        if let Some(policy) = matcher.find(conn, candidate, now_ms)? {
            return Ok(Some((policy, matcher.name())));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Any,
    One,
    Lit(char),
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => Token::Any,
            '_' => Token::One,
            '\\' => Token::Lit(chars.next().unwrap_or('\\')),
            other => Token::Lit(other),
        });
    }
    tokens
}

/// SQL LIKE semantics (`%`, `_`, `\` escape) without SQLite's ASCII case folding.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let pattern = tokenize(pattern);
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        let step = match pattern.get(p) {
            Some(Token::Any) => {
                backtrack = Some((p, t));
                p += 1;
                continue;
            }
            Some(Token::One) => true,
            Some(Token::Lit(c)) => *c == text[t],
            None => false,
        };
        if step {
            p += 1;
            t += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|token| *token == Token::Any)
}

impl PolicyStore {
    /// Highest-priority live policy for the candidate. A match bumps the
    /// policy's `hit_count` and `last_hit`.
    pub fn match_policy(&self, candidate: &PolicyCandidate) -> Result<Option<Policy>> {
        if candidate.is_empty() {
            return Err(SentinelError::Validation(
                "policy candidate has no url, file hash, rule name or match type".to_string(),
            ));
        }
        let now_ms = to_millis(&now());

        let cached = match self.cache.get_match(candidate) {
            Some(None) => return Ok(None),
            Some(Some(policy)) if !policy.is_expired_at(&from_millis(now_ms)) => Some(policy),
            _ => None,
        };

        let policy = match cached {
            Some(policy) => policy,
            None => {
                let generation = self.cache.generation();
                let found = self.read("match_policy", |conn| {
                    find_match(conn, &self.matchers, candidate, now_ms)
                })?;
                self.cache.put_match(
                    candidate.clone(),
                    found.as_ref().map(|(policy, _)| policy.clone()),
                    generation,
                );
                match found {
                    Some((policy, tier)) => {
                        log::debug!(
                            "Policy {} '{}' matched by {} -> {}",
                            policy.id,
                            policy.rule_name,
                            tier,
                            policy.action
                        );
                        policy
                    }
                    None => return Ok(None),
                }
            }
        };

        self.usage.record_policy_hit(policy.id, now_ms);
        let mut policy = policy;
        self.usage.overlay_policy(&mut policy);
        Ok(Some(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_store::model::{MatchType, NewPolicy, PolicyAction};
    use rstest::rstest;

    const HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn store() -> PolicyStore {
        PolicyStore::open_in_memory(&Default::default()).unwrap()
    }

    #[rstest]
    #[case("https://example.com/%", "https://example.com/login", true)]
    #[case("https://example.com/%", "https://EXAMPLE.com/login", false)]
    #[case("%.exe", "https://x.org/setup.exe", true)]
    #[case("%.exe", "https://x.org/setup.exe.txt", false)]
    #[case("https://a_b.com/", "https://axb.com/", true)]
    #[case(r"https://a\_b.com/", "https://axb.com/", false)]
    #[case(r"https://a\_b.com/", "https://a_b.com/", true)]
    #[case(r"100\%", "100%", true)]
    #[case("%", "", true)]
    #[case("", "x", false)]
    #[case("%a%b%", "xxaxxbxx", true)]
    fn test_like_match(#[case] pattern: &str, #[case] text: &str, #[case] expected: bool) {
        assert_eq!(like_match(pattern, text), expected);
    }

    #[test]
    fn test_hash_beats_pattern() {
        let store = store();
        store
            .create_policy(
                &NewPolicy::new("pattern", PolicyAction::Allow, MatchType::Download)
                    .with_url_pattern("https://downloads.example.com/%"),
            )
            .unwrap();
        let hash_id = store
            .create_policy(
                &NewPolicy::new("hash", PolicyAction::Block, MatchType::Download)
                    .with_file_hash(HASH),
            )
            .unwrap();
        // Newer pattern policy must still lose to the hash tier.
        store
            .create_policy(
                &NewPolicy::new("pattern-newer", PolicyAction::Allow, MatchType::Download)
                    .with_url_pattern("https://downloads.example.com/%"),
            )
            .unwrap();

        let candidate = PolicyCandidate::for_url("https://downloads.example.com/tool.exe")
            .with_hash(HASH);
        let matched = store.match_policy(&candidate).unwrap().unwrap();
        assert_eq!(matched.id, hash_id);
        assert_eq!(matched.action, PolicyAction::Block);
    }

    #[test]
    fn test_newest_wins_within_tier() {
        let store = store();
        store
            .create_policy(
                &NewPolicy::new("old", PolicyAction::Allow, MatchType::Download)
                    .with_url_pattern("https://a.com/%"),
            )
            .unwrap();
        let newer = store
            .create_policy(
                &NewPolicy::new("new", PolicyAction::Block, MatchType::Download)
                    .with_url_pattern("https://a.com/%"),
            )
            .unwrap();
        let matched = store
            .match_policy(&PolicyCandidate::for_url("https://a.com/file"))
            .unwrap()
            .unwrap();
        assert_eq!(matched.id, newer);
    }

    #[test]
    fn test_rule_name_only_matches_bare_policies() {
        let store = store();
        store
            .create_policy(
                &NewPolicy::new("Tracker", PolicyAction::Block, MatchType::ThirdPartyForm)
                    .with_url_pattern("https://tracker.example/%"),
            )
            .unwrap();
        assert!(store
            .match_policy(&PolicyCandidate::for_rule("Tracker"))
            .unwrap()
            .is_none());

        let bare = store
            .create_policy(&NewPolicy::new(
                "Tracker",
                PolicyAction::WarnUser,
                MatchType::ThirdPartyForm,
            ))
            .unwrap();
        let matched = store
            .match_policy(&PolicyCandidate::for_rule("Tracker"))
            .unwrap()
            .unwrap();
        assert_eq!(matched.id, bare);
    }

    #[test]
    fn test_match_type_default_is_last_resort() {
        let store = store();
        let category = store
            .create_policy(&NewPolicy::new(
                "Block cross-origin credentials",
                PolicyAction::Block,
                MatchType::FormMismatch,
            ))
            .unwrap();

        let plain = PolicyCandidate::for_url("https://evil.example/collect");
        assert!(store.match_policy(&plain).unwrap().is_none());

        let typed = plain.with_match_type(MatchType::FormMismatch);
        assert_eq!(store.match_policy(&typed).unwrap().unwrap().id, category);
    }

    #[test]
    fn test_match_records_hits_including_cached() {
        let store = store();
        let id = store
            .create_policy(
                &NewPolicy::new("h", PolicyAction::Block, MatchType::Download).with_file_hash(HASH),
            )
            .unwrap();
        let candidate = PolicyCandidate::for_hash(HASH);

        let first = store.match_policy(&candidate).unwrap().unwrap();
        assert_eq!(first.hit_count, 1);
        assert!(first.last_hit.is_some());

        let second = store.match_policy(&candidate).unwrap().unwrap();
        assert_eq!(second.hit_count, 2);
        assert!(store.cache_metrics().hits >= 1);
        assert_eq!(store.get_policy(id).unwrap().hit_count, 2);
    }

    #[test]
    fn test_write_invalidates_cached_negative() {
        let store = store();
        let candidate = PolicyCandidate::for_url("https://late.example/x");
        assert!(store.match_policy(&candidate).unwrap().is_none());
        store
            .create_policy(
                &NewPolicy::new("late", PolicyAction::Block, MatchType::Download)
                    .with_url_pattern("https://late.example/%"),
            )
            .unwrap();
        assert!(store.match_policy(&candidate).unwrap().is_some());
    }

    #[test]
    fn test_expired_policies_ignored() {
        let store = store();
        let id = store
            .create_policy(
                &NewPolicy::new("soon", PolicyAction::Block, MatchType::Download)
                    .with_file_hash(HASH)
                    .expires_at(now() + chrono::Duration::milliseconds(30)),
            )
            .unwrap();
        let candidate = PolicyCandidate::for_hash(HASH);
        assert_eq!(store.match_policy(&candidate).unwrap().unwrap().id, id);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(store.match_policy(&candidate).unwrap().is_none());
    }

    #[test]
    fn test_empty_candidate_rejected() {
        assert!(matches!(
            store().match_policy(&PolicyCandidate::default()),
            Err(SentinelError::Validation(_))
        ));
    }

    #[test]
    fn test_scope_keeps_match_types_apart() {
        let store = store();
        store
            .create_policy(
                &NewPolicy::new("collector", PolicyAction::BlockAutofill, MatchType::FormMismatch)
                    .with_url_pattern("https://collector.example/%"),
            )
            .unwrap();
        let trusted = store
            .create_policy(
                &NewPolicy::new("site", PolicyAction::Allow, MatchType::Download)
                    .with_url_pattern("https://collector.example/%"),
            )
            .unwrap();

        let download =
            PolicyCandidate::for_url("https://collector.example/file.zip").within(MatchType::Download);
        assert_eq!(store.match_policy(&download).unwrap().unwrap().id, trusted);

        let credential = PolicyCandidate::for_url("https://collector.example/steal")
            .with_match_type(MatchType::FormMismatch);
        assert_eq!(
            store.match_policy(&credential).unwrap().unwrap().action,
            PolicyAction::BlockAutofill
        );

        let insecure = PolicyCandidate::for_url("https://collector.example/steal")
            .within(MatchType::InsecureCredential);
        assert!(store.match_policy(&insecure).unwrap().is_none());
    }

    #[test]
    fn test_scoped_candidate_skips_category_default() {
        let store = store();
        store
            .create_policy(&NewPolicy::new("EICAR", PolicyAction::Block, MatchType::Download))
            .unwrap();
        let candidate =
            PolicyCandidate::for_url("https://clean.example/app.zip").within(MatchType::Download);
        assert!(store.match_policy(&candidate).unwrap().is_none());
        assert!(store
            .match_policy(&candidate.clone().with_rule("EICAR"))
            .unwrap()
            .is_some());
    }
}
