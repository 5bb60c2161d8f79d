//! Decision API: one `Sentinel` per browsing context turns download, form
//! submission and navigation events into an action for the browser.
//!
//! Every `evaluate_*` call is synchronous and never fails. When the store is
//! unavailable the configured fail-safe action is returned, and the first
//! such decision carries a `DegradedNotice` for the UI.

use crate::config::SentinelConfig;
use crate::domain_utils::DomainUtils;
use crate::error::{Result, SentinelError};
use crate::form_monitor::{CredentialAlert, FormMonitor, FormSubmitEvent, SubmissionOutcome};
use crate::phishing::{PhishingAnalysis, PhishingUrlAnalyzer};
use crate::policy_store::{
    AlertType, CleanupReport, CredentialRelationship, ImportSummary, MatchType, NewPolicy,
    Policy, PolicyAction, PolicyCandidate, PolicyFilter, PolicyId, PolicyStore, RelationshipType,
    Severity, ThreatMetadata, UserAction,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The user's answer to an alert.
pub type UserChoice = UserAction;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadEvent {
    pub url: String,
    pub filename: String,
    /// SHA-256, hex. Empty when unknown.
    pub hash: String,
    pub mime_type: String,
    pub size: u64,
}

/// Result of the external content scan, when it matched a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalwareMatch {
    pub rule_name: String,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadAlert {
    pub url: String,
    pub filename: String,
    pub file_hash: String,
    pub rule_name: String,
    pub severity: Severity,
    pub description: String,
    pub policy_id: Option<PolicyId>,
    pub threat_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationAlert {
    pub url: String,
    pub origin: Option<String>,
    pub analysis: PhishingAnalysis,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    Download(DownloadAlert),
    Credential(CredentialAlert),
    Navigation(NavigationAlert),
}

impl Alert {
    /// Handle for `Sentinel::record_user_decision`.
    pub fn reference(&self) -> AlertRef {
        match self {
            Alert::Download(a) => AlertRef::Download {
                threat_id: a.threat_id,
                url: a.url.clone(),
                filename: a.filename.clone(),
                file_hash: a.file_hash.clone(),
            },
            Alert::Credential(a) => AlertRef::Credential {
                alert_id: a.id,
                form_origin: a.form_origin.clone(),
                action_origin: a.action_origin.clone(),
            },
            Alert::Navigation(a) => AlertRef::Navigation {
                url: a.url.clone(),
                origin: a.origin.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertRef {
    Download {
        threat_id: Option<i64>,
        url: String,
        filename: String,
        file_hash: String,
    },
    Credential {
        alert_id: Option<i64>,
        form_origin: String,
        action_origin: String,
    },
    Navigation {
        url: String,
        origin: Option<String>,
    },
}

/// Non-blocking notification that protection fell back to safe defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedNotice {
    pub message: String,
    pub fallback_action: PolicyAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: PolicyAction,
    pub alert: Option<Alert>,
    pub notice: Option<DegradedNotice>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            action: PolicyAction::Allow,
            alert: None,
            notice: None,
        }
    }

    fn new(action: PolicyAction, alert: Option<Alert>) -> Self {
        Self {
            action,
            alert,
            notice: None,
        }
    }
}

/// Escapes LIKE wildcards so `text` matches itself literally.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

pub struct Sentinel {
    store: Arc<PolicyStore>,
    config: SentinelConfig,
    monitor: FormMonitor,
    analyzer: PhishingUrlAnalyzer,
    notice_sent: AtomicBool,
}

impl Sentinel {
    pub fn new(store: Arc<PolicyStore>, config: SentinelConfig) -> Self {
        let mut monitor = FormMonitor::new(Arc::clone(&store), &config);
        if let Err(e) = monitor.load_relationships_from_database() {
            log::warn!("Starting with empty relationship cache: {}", e);
        }
        Self {
            analyzer: PhishingUrlAnalyzer::new(&config.phishing),
            store,
            config,
            monitor,
            notice_sent: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn monitor(&self) -> &FormMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut FormMonitor {
        &mut self.monitor
    }

    pub fn analyzer(&self) -> &PhishingUrlAnalyzer {
        &self.analyzer
    }

    fn take_notice(&self, fallback: PolicyAction, reason: &str) -> Option<DegradedNotice> {
        if self.notice_sent.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(DegradedNotice {
            message: format!(
                "Security policies are temporarily unavailable ({}); using safe defaults",
                reason
            ),
            fallback_action: fallback,
        })
    }

    /// Re-arms the notice once the store is healthy again.
    fn rearm(&self) {
        if !self.store.is_fail_safe() {
            self.notice_sent.store(false, Ordering::Release);
        }
    }

    fn degraded(&self, fallback: PolicyAction, alert: Option<Alert>, reason: &str) -> Decision {
        log::warn!("Degraded decision ({}): falling back to {}", reason, fallback);
        Decision {
            action: fallback,
            alert,
            notice: self.take_notice(fallback, reason),
        }
    }

    /// A lookup that failed without putting the store in fail-safe mode
    /// (lock timeout after retries) gets the safe action but no notice.
    fn lookup_failed(&self, fallback: PolicyAction, alert: Option<Alert>, err: &SentinelError) -> Decision {
        if err.degrades_store() {
            return self.degraded(fallback, alert, &err.to_string());
        }
        log::warn!("Policy lookup failed ({}): using {} for this decision", err, fallback);
        Decision::new(fallback, alert)
    }

    pub fn evaluate_download(&self, event: DownloadEvent, scan: Option<MalwareMatch>) -> Decision {
        let fallback = self.config.fail_safe.download_action;
        let alert_for = |policy_id: Option<PolicyId>, threat_id: Option<i64>| {
            scan.as_ref().map(|m| {
                Alert::Download(DownloadAlert {
                    url: event.url.clone(),
                    filename: event.filename.clone(),
                    file_hash: event.hash.trim().to_lowercase(),
                    rule_name: m.rule_name.clone(),
                    severity: m.severity,
                    description: m.description.clone(),
                    policy_id,
                    threat_id,
                })
            })
        };

        if self.store.is_fail_safe() {
            return self.degraded(fallback, alert_for(None, None), "fail-safe mode");
        }

        let mut candidate = PolicyCandidate::default().within(MatchType::Download);
        if let Some(url) = non_empty(&event.url) {
            candidate = candidate.with_url(url);
        }
        if let Some(hash) = non_empty(&event.hash) {
            candidate = candidate.with_hash(hash.to_lowercase());
        }
        if let Some(m) = &scan {
            candidate = candidate.with_rule(m.rule_name.clone());
        }

        let policy = if candidate.is_empty() {
            None
        } else {
            match self.store.match_policy(&candidate) {
                Ok(policy) => policy,
                Err(e) => return self.lookup_failed(fallback, alert_for(None, None), &e),
            }
        };
        self.rearm();

        let (action, policy_id) = match (&policy, &scan) {
            (Some(p), _) => (download_action(p.action), Some(p.id)),
            (None, Some(_)) => (PolicyAction::Quarantine, None),
            (None, None) => return Decision::allow(),
        };
        log::debug!(
            "Download {} -> {} (policy {:?})",
            event.url,
            action,
            policy_id
        );

        let Some(m) = &scan else {
            return Decision::new(action, None);
        };

        let threat = ThreatMetadata {
            url: event.url.clone(),
            filename: event.filename.clone(),
            file_hash: event.hash.trim().to_lowercase(),
            mime_type: event.mime_type.clone(),
            file_size: event.size,
            rule_name: m.rule_name.clone(),
            severity: Some(m.severity),
        };
        let payload = serde_json::json!({
            "rule_name": m.rule_name,
            "severity": m.severity,
            "description": m.description,
        });
        let threat_id = match self.store.record_threat(&threat, action, policy_id, &payload) {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("Failed to record threat for {}: {}", event.url, e);
                None
            }
        };

        let mut decision = Decision::new(action, alert_for(policy_id, threat_id));
        if self.store.is_fail_safe() {
            decision.notice = self.take_notice(fallback, "threat history unavailable");
        }
        decision
    }

    pub fn evaluate_submission(&mut self, event: FormSubmitEvent) -> Decision {
        let fallback = self.config.fail_safe.credential_action;
        let outcome = self.monitor.on_form_submit(&event);

        if self.store.is_fail_safe() {
            let alert = outcome.alert().cloned().map(Alert::Credential);
            return self.degraded(fallback, alert, "fail-safe mode");
        }

        let alert = match outcome {
            SubmissionOutcome::Clear => {
                self.rearm();
                return Decision::allow();
            }
            SubmissionOutcome::Blocked { .. } => {
                self.rearm();
                return Decision::new(PolicyAction::Block, None);
            }
            SubmissionOutcome::Alert(alert) => alert,
        };

        let candidate = PolicyCandidate::for_url(event.action_url.trim())
            .with_match_type(alert.alert_type.match_type());
        let mut action = match self.store.match_policy(&candidate) {
            Ok(Some(policy)) => match policy.action {
                PolicyAction::Quarantine => PolicyAction::Block,
                other => other,
            },
            Ok(None) => match alert.alert_type {
                AlertType::CredentialExfiltration => PolicyAction::BlockAutofill,
                _ => PolicyAction::WarnUser,
            },
            Err(e) => return self.lookup_failed(fallback, Some(Alert::Credential(alert)), &e),
        };
        self.rearm();

        if matches!(action, PolicyAction::Block | PolicyAction::BlockAutofill)
            && self
                .monitor
                .consume_autofill_override(&alert.form_origin, &alert.action_origin)
        {
            log::info!(
                "One-time override used for {} -> {}",
                alert.form_origin,
                alert.action_origin
            );
            action = PolicyAction::WarnUser;
        }

        Decision::new(action, Some(Alert::Credential(alert)))
    }

    pub fn evaluate_navigation(&self, url: &str) -> Decision {
        let fallback = self.config.fail_safe.navigation_action;
        let analysis = self.analyzer.analyze_url(url);
        let alert = analysis.detected.then(|| {
            Alert::Navigation(NavigationAlert {
                url: url.to_string(),
                origin: DomainUtils::extract_origin(url),
                analysis,
            })
        });

        if self.store.is_fail_safe() {
            return self.degraded(fallback, alert, "fail-safe mode");
        }

        if let Some(url) = non_empty(url) {
            let candidate = PolicyCandidate::for_url(url).within(MatchType::Download);
            match self.store.match_policy(&candidate) {
                Ok(Some(policy)) => {
                    self.rearm();
                    let action = match policy.action {
                        PolicyAction::Quarantine | PolicyAction::BlockAutofill => PolicyAction::Block,
                        other => other,
                    };
                    log::debug!("Navigation to {} decided by policy {}", url, policy.id);
                    return Decision::new(action, None);
                }
                Ok(None) => {}
                Err(e) => return self.lookup_failed(fallback, alert, &e),
            }
        }
        self.rearm();

        match alert {
            Some(alert) => Decision::new(PolicyAction::WarnUser, Some(alert)),
            None => Decision::allow(),
        }
    }

    /// Applies the user's answer to an alert. AllowOnce is never persisted.
    pub fn record_user_decision(&mut self, alert: &AlertRef, choice: UserChoice) -> Result<()> {
        match alert {
            AlertRef::Credential {
                alert_id,
                form_origin,
                action_origin,
            } => {
                match choice {
                    UserAction::Trust => {
                        self.monitor
                            .learn_trusted_relationship(form_origin, action_origin)?;
                    }
                    UserAction::Block => {
                        self.monitor.block_submission(form_origin, action_origin)?;
                    }
                    UserAction::AllowOnce => {
                        self.monitor
                            .grant_autofill_override(form_origin, action_origin);
                    }
                }
                if let Some(id) = alert_id {
                    self.store.update_alert_action(*id, choice)?;
                }
            }
            AlertRef::Download {
                url,
                filename,
                file_hash,
                ..
            } => {
                let Some(action) = persisted_action(choice) else {
                    return Ok(());
                };
                let label = non_empty(filename).unwrap_or(url.as_str());
                let mut policy = NewPolicy::new(
                    format!("User decision: {}", label),
                    action,
                    MatchType::Download,
                );
                if let Some(hash) = non_empty(file_hash) {
                    policy = policy.with_file_hash(hash.to_lowercase());
                } else if let Some(url) = non_empty(url) {
                    policy = policy.with_url_pattern(escape_like(url));
                } else {
                    return Err(SentinelError::Validation(
                        "download alert has neither hash nor url".to_string(),
                    ));
                }
                self.store.create_policy(&policy)?;
            }
            AlertRef::Navigation { url, origin } => {
                let Some(action) = persisted_action(choice) else {
                    return Ok(());
                };
                let origin = origin
                    .clone()
                    .or_else(|| DomainUtils::extract_origin(url))
                    .ok_or_else(|| {
                        SentinelError::Validation(format!("no origin for navigation to {}", url))
                    })?;
                let policy = NewPolicy::new(
                    format!("User decision: {}", origin),
                    action,
                    // Origin policies cover downloads from the origin as well.
                    MatchType::Download,
                )
                .with_url_pattern(format!("{}/%", escape_like(&origin)));
                self.store.create_policy(&policy)?;
            }
        }
        log::info!("Recorded user decision {} for {:?}", choice, alert);
        Ok(())
    }

    pub fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<Policy>> {
        self.store.list_policies(filter)
    }

    pub fn list_relationships(
        &self,
        relationship_type: Option<RelationshipType>,
    ) -> Result<Vec<CredentialRelationship>> {
        self.store.list_relationships(relationship_type)
    }

    pub fn export_json(&self) -> Result<Vec<u8>> {
        self.store.export_json()
    }

    /// Imports policies and relationships, then refreshes this context's caches.
    pub fn import_json(&mut self, bytes: &[u8]) -> Result<ImportSummary> {
        let summary = self.store.import_json(bytes)?;
        self.monitor.invalidate_relationship_cache()?;
        Ok(summary)
    }

    pub fn cleanup_expired(&mut self) -> Result<CleanupReport> {
        let report = self.store.cleanup_expired()?;
        if report.relationships_removed > 0 {
            self.monitor.invalidate_relationship_cache()?;
        }
        Ok(report)
    }
}

/// Autofill blocking has no meaning for a file; enforce it as a block.
fn download_action(action: PolicyAction) -> PolicyAction {
    match action {
        PolicyAction::BlockAutofill => PolicyAction::Block,
        other => other,
    }
}

fn persisted_action(choice: UserChoice) -> Option<PolicyAction> {
    match choice {
        UserAction::Trust => Some(PolicyAction::Allow),
        UserAction::Block => Some(PolicyAction::Block),
        UserAction::AllowOnce => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form_monitor::{FieldKind, FormField};
    use chrono::Duration;

    const HASH: &str = "44d88612fea8a8f36de82e1278abb02f44d88612fea8a8f36de82e1278abb02f";

    fn sentinel() -> Sentinel {
        let config = SentinelConfig::default();
        let store = Arc::new(PolicyStore::open_in_memory(&config).unwrap());
        Sentinel::new(store, config)
    }

    fn download() -> DownloadEvent {
        DownloadEvent {
            url: "https://files.example/setup.exe".to_string(),
            filename: "setup.exe".to_string(),
            hash: HASH.to_string(),
            mime_type: "application/octet-stream".to_string(),
            size: 1024,
        }
    }

    fn eicar() -> MalwareMatch {
        MalwareMatch {
            rule_name: "EICAR-Test".to_string(),
            severity: Severity::High,
            description: "test signature".to_string(),
        }
    }

    fn login(action: &str) -> FormSubmitEvent {
        FormSubmitEvent::new(
            "https://shop.example/login",
            action,
            vec![
                FormField::new("email", FieldKind::Email),
                FormField::new("password", FieldKind::Password),
            ],
        )
    }

    #[test]
    fn test_clean_download_allowed() {
        let sentinel = sentinel();
        let decision = sentinel.evaluate_download(download(), None);
        assert_eq!(decision, Decision::allow());
    }

    #[test]
    fn test_hash_policy_blocks_download() {
        let sentinel = sentinel();
        sentinel
            .store()
            .create_policy(
                &NewPolicy::new("bad file", PolicyAction::Block, MatchType::Download)
                    .with_file_hash(HASH),
            )
            .unwrap();
        let decision = sentinel.evaluate_download(download(), None);
        assert_eq!(decision.action, PolicyAction::Block);
        assert!(decision.alert.is_none());
    }

    #[test]
    fn test_scan_match_without_policy_quarantines() {
        let sentinel = sentinel();
        let decision = sentinel.evaluate_download(download(), Some(eicar()));
        assert_eq!(decision.action, PolicyAction::Quarantine);
        match decision.alert {
            Some(Alert::Download(alert)) => {
                assert_eq!(alert.rule_name, "EICAR-Test");
                assert!(alert.threat_id.is_some());
            }
            other => panic!("unexpected alert {:?}", other),
        }
        let threats = sentinel.store().threats_by_rule("EICAR-Test").unwrap();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].action_taken, PolicyAction::Quarantine);
    }

    #[test]
    fn test_allow_policy_overrides_scan() {
        let sentinel = sentinel();
        let id = sentinel
            .store()
            .create_policy(
                &NewPolicy::new("vendor build", PolicyAction::Allow, MatchType::Download)
                    .with_file_hash(HASH),
            )
            .unwrap();
        let decision = sentinel.evaluate_download(download(), Some(eicar()));
        assert_eq!(decision.action, PolicyAction::Allow);
        let threats = sentinel.store().threats_by_rule("EICAR-Test").unwrap();
        assert_eq!(threats[0].policy_id, Some(id));
    }

    #[test]
    fn test_trusting_download_creates_hash_policy() {
        let mut sentinel = sentinel();
        let decision = sentinel.evaluate_download(download(), Some(eicar()));
        let reference = decision.alert.unwrap().reference();
        sentinel
            .record_user_decision(&reference, UserAction::Trust)
            .unwrap();

        let decision = sentinel.evaluate_download(download(), Some(eicar()));
        assert_eq!(decision.action, PolicyAction::Allow);
    }

    #[test]
    fn test_allow_once_download_not_persisted() {
        let mut sentinel = sentinel();
        let reference = sentinel
            .evaluate_download(download(), Some(eicar()))
            .alert
            .unwrap()
            .reference();
        sentinel
            .record_user_decision(&reference, UserAction::AllowOnce)
            .unwrap();
        assert_eq!(sentinel.store().policy_count().unwrap(), 0);
    }

    #[test]
    fn test_cross_origin_password_blocks_autofill() {
        let mut sentinel = sentinel();
        let decision = sentinel.evaluate_submission(login("https://collector.example/x"));
        assert_eq!(decision.action, PolicyAction::BlockAutofill);
        assert!(matches!(decision.alert, Some(Alert::Credential(_))));
    }

    #[test]
    fn test_email_only_warns() {
        let mut sentinel = sentinel();
        let event = FormSubmitEvent::new(
            "https://shop.example/news",
            "https://mailer.example/sub",
            vec![FormField::new("email", FieldKind::Email)],
        );
        assert_eq!(sentinel.evaluate_submission(event).action, PolicyAction::WarnUser);
    }

    #[test]
    fn test_same_origin_submission_allowed() {
        let mut sentinel = sentinel();
        let decision = sentinel.evaluate_submission(login("https://shop.example:443/session"));
        assert_eq!(decision, Decision::allow());
    }

    #[test]
    fn test_credential_policy_applies() {
        let mut sentinel = sentinel();
        sentinel
            .store()
            .create_policy(&NewPolicy::new(
                "Allow all credential posts",
                PolicyAction::Allow,
                MatchType::FormMismatch,
            ))
            .unwrap();
        let decision = sentinel.evaluate_submission(login("https://collector.example/x"));
        assert_eq!(decision.action, PolicyAction::Allow);
        assert!(decision.alert.is_some());
    }

    #[test]
    fn test_quarantine_policy_blocks_submission() {
        let mut sentinel = sentinel();
        sentinel
            .store()
            .create_policy(
                &NewPolicy::new("hold", PolicyAction::Quarantine, MatchType::FormMismatch)
                    .with_url_pattern("https://collector.example/%"),
            )
            .unwrap();
        let decision = sentinel.evaluate_submission(login("https://collector.example/x"));
        assert_eq!(decision.action, PolicyAction::Block);
    }

    #[test]
    fn test_trust_then_submit_is_allowed() {
        let mut sentinel = sentinel();
        let reference = sentinel
            .evaluate_submission(login("https://pay.example/x"))
            .alert
            .unwrap()
            .reference();
        sentinel
            .record_user_decision(&reference, UserAction::Trust)
            .unwrap();

        let decision = sentinel.evaluate_submission(login("https://pay.example/x"));
        assert_eq!(decision, Decision::allow());

        let alerts = sentinel.store().alerts_by_origin("https://pay.example").unwrap();
        assert_eq!(alerts[0].user_action, Some(UserAction::Trust));
    }

    #[test]
    fn test_block_then_submit_is_blocked() {
        let mut sentinel = sentinel();
        let reference = sentinel
            .evaluate_submission(login("https://pay.example/x"))
            .alert
            .unwrap()
            .reference();
        sentinel
            .record_user_decision(&reference, UserAction::Block)
            .unwrap();
        let decision = sentinel.evaluate_submission(login("https://pay.example/x"));
        assert_eq!(decision.action, PolicyAction::Block);
    }

    #[test]
    fn test_allow_once_downgrades_next_submission_only() {
        let mut sentinel = sentinel();
        let reference = sentinel
            .evaluate_submission(login("https://pay.example/x"))
            .alert
            .unwrap()
            .reference();
        sentinel
            .record_user_decision(&reference, UserAction::AllowOnce)
            .unwrap();

        let later = login("https://pay.example/x").at(crate::policy_store::now() + Duration::seconds(10));
        assert_eq!(sentinel.evaluate_submission(later.clone()).action, PolicyAction::WarnUser);
        let again = later.at(crate::policy_store::now() + Duration::seconds(20));
        assert_eq!(sentinel.evaluate_submission(again).action, PolicyAction::BlockAutofill);
        assert!(sentinel.list_relationships(None).unwrap().is_empty());
    }

    #[test]
    fn test_phishing_navigation_warns() {
        let sentinel = sentinel();
        let decision = sentinel.evaluate_navigation("https://faceboook.xyz/login");
        assert_eq!(decision.action, PolicyAction::WarnUser);
        match decision.alert {
            Some(Alert::Navigation(alert)) => assert!(alert.analysis.detected),
            other => panic!("unexpected alert {:?}", other),
        }
    }

    #[test]
    fn test_legitimate_navigation_allowed() {
        let sentinel = sentinel();
        assert_eq!(sentinel.evaluate_navigation("https://münchen.de/"), Decision::allow());
    }

    #[test]
    fn test_navigation_decisions_persist_by_origin() {
        let mut sentinel = sentinel();
        let reference = sentinel
            .evaluate_navigation("https://faceboook.xyz/login")
            .alert
            .unwrap()
            .reference();
        sentinel
            .record_user_decision(&reference, UserAction::Trust)
            .unwrap();
        let decision = sentinel.evaluate_navigation("https://faceboook.xyz/feed");
        assert_eq!(decision, Decision::allow());

        let policies = sentinel.list_policies(&PolicyFilter::default()).unwrap();
        assert_eq!(policies[0].url_pattern.as_deref(), Some("https://faceboook.xyz/%"));
    }

    #[test]
    fn test_fail_safe_notice_once_and_rearms() {
        let sentinel = sentinel();
        sentinel.store().enter_fail_safe("test");

        let first = sentinel.evaluate_download(download(), None);
        assert_eq!(first.action, PolicyAction::Quarantine);
        assert_eq!(
            first.notice.as_ref().map(|n| n.fallback_action),
            Some(PolicyAction::Quarantine)
        );
        let second = sentinel.evaluate_navigation("https://example.com/");
        assert_eq!(second.action, PolicyAction::WarnUser);
        assert!(second.notice.is_none());

        sentinel.store().clear_fail_safe();
        assert_eq!(sentinel.evaluate_download(download(), None), Decision::allow());

        sentinel.store().enter_fail_safe("again");
        assert!(sentinel.evaluate_download(download(), None).notice.is_some());
    }

    #[test]
    fn test_fail_safe_credential_default() {
        let mut sentinel = sentinel();
        sentinel.store().enter_fail_safe("test");
        let decision = sentinel.evaluate_submission(login("https://pay.example/x"));
        assert_eq!(decision.action, PolicyAction::WarnUser);
        assert!(decision.alert.is_some());
    }

    #[test]
    fn test_import_refreshes_relationship_cache() {
        let mut source = sentinel();
        source
            .monitor_mut()
            .learn_trusted_relationship("https://shop.example", "https://pay.example")
            .unwrap();
        let bytes = source.export_json().unwrap();

        let mut target = sentinel();
        let summary = target.import_json(&bytes).unwrap();
        assert_eq!(summary.relationships_imported, 1);
        assert_eq!(
            target.evaluate_submission(login("https://pay.example/x")),
            Decision::allow()
        );
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("https://a_b.example/100%"), "https://a\\_b.example/100\\%");
        assert!(crate::policy_store::like_match(
            &format!("{}/%", escape_like("https://a_b.example")),
            "https://a_b.example/path"
        ));
        assert!(!crate::policy_store::like_match(
            &format!("{}/%", escape_like("https://a_b.example")),
            "https://axb.example/path"
        ));
    }

    #[test]
    fn test_navigation_trust_does_not_cover_credentials() {
        let mut sentinel = sentinel();
        sentinel
            .record_user_decision(
                &AlertRef::Navigation {
                    url: "https://collector.example/".to_string(),
                    origin: None,
                },
                UserAction::Trust,
            )
            .unwrap();
        assert_eq!(
            sentinel.evaluate_navigation("https://collector.example/home"),
            Decision::allow()
        );
        let decision = sentinel.evaluate_submission(login("https://collector.example/steal"));
        assert_eq!(decision.action, PolicyAction::BlockAutofill);
    }

    #[test]
    fn test_credential_policy_ignored_for_navigation_and_downloads() {
        let sentinel = sentinel();
        sentinel
            .store()
            .create_policy(
                &NewPolicy::new("collector", PolicyAction::BlockAutofill, MatchType::FormMismatch)
                    .with_url_pattern("https://collector.example/%"),
            )
            .unwrap();
        assert_eq!(
            sentinel.evaluate_navigation("https://collector.example/home"),
            Decision::allow()
        );
        let mut event = download();
        event.url = "https://collector.example/report.pdf".to_string();
        assert_eq!(sentinel.evaluate_download(event, None), Decision::allow());
    }

    #[test]
    fn test_autofill_action_on_download_policy_blocks() {
        let sentinel = sentinel();
        sentinel
            .store()
            .create_policy(
                &NewPolicy::new("odd", PolicyAction::BlockAutofill, MatchType::Download)
                    .with_file_hash(HASH),
            )
            .unwrap();
        assert_eq!(
            sentinel.evaluate_download(download(), None).action,
            PolicyAction::Block
        );
    }

    #[test]
    fn test_lock_timeout_does_not_send_degraded_notice() {
        let sentinel = sentinel();
        let err = SentinelError::Concurrency("lock not acquired".to_string());
        let decision = sentinel.lookup_failed(PolicyAction::Quarantine, None, &err);
        assert_eq!(decision.action, PolicyAction::Quarantine);
        assert!(decision.notice.is_none());
        assert!(!sentinel.store().is_fail_safe());

        // The one-shot notice is still available for a real storage failure.
        let err = SentinelError::storage("disk I/O error");
        assert!(sentinel
            .lookup_failed(PolicyAction::Quarantine, None, &err)
            .notice
            .is_some());
    }
}
