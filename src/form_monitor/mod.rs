//! Credential submission monitor.
//!
//! One `FormMonitor` belongs to one browsing context. It owns the submission
//! timestamp window, the relationship caches and the one-time autofill
//! overrides; only persisted relationships and alerts go through the shared
//! `PolicyStore`.

pub mod anomaly;
pub mod window;

pub use anomaly::{AnomalyReport, AnomalyScorer};
pub use window::{OriginPair, SubmissionWindow};

use crate::config::SentinelConfig;
use crate::domain_utils::DomainUtils;
use crate::error::Result;
use crate::policy_store::{
    now, AlertType, NewCredentialAlert, NewRelationship, PolicyStore, RelationshipId,
    RelationshipType, Severity,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const INSECURE_TRANSPORT_INDICATOR: &str = "Credentials submitted over insecure HTTP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Password,
    Email,
    Hidden,
    Other,
}

/// One entry of a form's field manifest. Field values never reach the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub kind: FieldKind,
    pub has_value: bool,
}

impl FormField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            has_value: true,
        }
    }

    pub fn empty(mut self) -> Self {
        self.has_value = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSubmitEvent {
    pub document_url: String,
    pub action_url: String,
    pub method: String,
    pub fields: Vec<FormField>,
    pub timestamp: DateTime<Utc>,
}

impl FormSubmitEvent {
    pub fn new(
        document_url: impl Into<String>,
        action_url: impl Into<String>,
        fields: Vec<FormField>,
    ) -> Self {
        Self {
            document_url: document_url.into(),
            action_url: action_url.into(),
            method: "POST".to_string(),
            fields,
            timestamp: now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Presence is what counts: an empty password box posted cross-origin
    /// still exposes the form to autofill.
    fn has_field(&self, kind: FieldKind) -> bool {
        self.fields.iter().any(|f| f.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialAlert {
    /// Row id in the alert history, when recording succeeded.
    pub id: Option<i64>,
    pub form_origin: String,
    pub action_origin: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub has_password_field: bool,
    pub has_email_field: bool,
    pub has_hidden_fields: bool,
    pub is_cross_origin: bool,
    pub uses_https: bool,
    pub anomaly_score: f64,
    pub anomaly_indicators: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

impl CredentialAlert {
    fn to_record(&self) -> NewCredentialAlert {
        NewCredentialAlert {
            form_origin: self.form_origin.clone(),
            action_origin: self.action_origin.clone(),
            alert_type: self.alert_type,
            severity: self.severity,
            has_password_field: self.has_password_field,
            has_email_field: self.has_email_field,
            has_hidden_fields: self.has_hidden_fields,
            is_cross_origin: self.is_cross_origin,
            uses_https: self.uses_https,
            policy_id: None,
            anomaly_score: self.anomaly_score,
            anomaly_indicators: self.anomaly_indicators.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SubmissionOutcome {
    /// Nothing to report: same-origin, trusted, unparseable, or benign.
    Clear,
    Alert(CredentialAlert),
    /// The pair carries an explicit Block relationship.
    Blocked {
        form_origin: String,
        action_origin: String,
    },
}

impl SubmissionOutcome {
    pub fn alert(&self) -> Option<&CredentialAlert> {
        match self {
            SubmissionOutcome::Alert(alert) => Some(alert),
            _ => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, SubmissionOutcome::Blocked { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRelationship {
    id: RelationshipId,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedRelationship {
    fn is_live(&self, at: &DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp > *at).unwrap_or(true)
    }
}

pub struct FormMonitor {
    store: Arc<PolicyStore>,
    scorer: AnomalyScorer,
    window: SubmissionWindow,
    trusted: HashMap<OriginPair, CachedRelationship>,
    blocked: HashMap<OriginPair, CachedRelationship>,
    overrides: HashSet<OriginPair>,
}

impl FormMonitor {
    pub fn new(store: Arc<PolicyStore>, config: &SentinelConfig) -> Self {
        Self {
            store,
            scorer: AnomalyScorer::new(config.anomaly.clone(), config.frequency.clone()),
            window: SubmissionWindow::new(&config.frequency),
            trusted: HashMap::new(),
            blocked: HashMap::new(),
            overrides: HashSet::new(),
        }
    }

    /// Monitor with its relationship caches warmed from the store.
    pub fn with_relationships(store: Arc<PolicyStore>, config: &SentinelConfig) -> Result<Self> {
        let mut monitor = Self::new(store, config);
        monitor.load_relationships_from_database()?;
        Ok(monitor)
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Replaces both relationship caches with the live rows in the store.
    pub fn load_relationships_from_database(&mut self) -> Result<usize> {
        let rows = self.store.list_relationships(None)?;
        let at = now();
        self.trusted.clear();
        self.blocked.clear();
        for rel in rows {
            let cached = CachedRelationship {
                id: rel.id,
                expires_at: rel.expires_at,
            };
            if !cached.is_live(&at) {
                continue;
            }
            let pair = (rel.form_origin, rel.action_origin);
            match rel.relationship_type {
                RelationshipType::Trusted => self.trusted.insert(pair, cached),
                RelationshipType::Blocked => self.blocked.insert(pair, cached),
            };
        }
        log::debug!(
            "Loaded {} trusted and {} blocked relationships",
            self.trusted.len(),
            self.blocked.len()
        );
        Ok(self.trusted.len() + self.blocked.len())
    }

    /// Drops the in-memory caches and reloads them, after settings edits.
    pub fn invalidate_relationship_cache(&mut self) -> Result<usize> {
        self.trusted.clear();
        self.blocked.clear();
        self.load_relationships_from_database()
    }

    pub fn is_trusted_relationship(&mut self, form_origin: &str, action_origin: &str) -> bool {
        self.lookup(form_origin, action_origin, RelationshipType::Trusted)
            .is_some()
    }

    pub fn is_blocked_relationship(&mut self, form_origin: &str, action_origin: &str) -> bool {
        self.lookup(form_origin, action_origin, RelationshipType::Blocked)
            .is_some()
    }

    fn cache_for(&mut self, relationship_type: RelationshipType) -> &mut HashMap<OriginPair, CachedRelationship> {
        match relationship_type {
            RelationshipType::Trusted => &mut self.trusted,
            RelationshipType::Blocked => &mut self.blocked,
        }
    }

    /// Cache first, then the store. Store failures read as "no relationship".
    fn lookup(
        &mut self,
        form_origin: &str,
        action_origin: &str,
        relationship_type: RelationshipType,
    ) -> Option<RelationshipId> {
        let pair = (form_origin.to_string(), action_origin.to_string());
        let at = now();
        let cache = self.cache_for(relationship_type);
        if let Some(cached) = cache.get(&pair).copied() {
            if cached.is_live(&at) {
                return Some(cached.id);
            }
            cache.remove(&pair);
        }

        match self
            .store
            .get_relationship(form_origin, action_origin, relationship_type)
        {
            Ok(Some(rel)) => {
                let cached = CachedRelationship {
                    id: rel.id,
                    expires_at: rel.expires_at,
                };
                if !cached.is_live(&at) {
                    return None;
                }
                self.cache_for(relationship_type).insert(pair, cached);
                Some(cached.id)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!(
                    "Relationship lookup failed for {} -> {}: {}",
                    form_origin,
                    action_origin,
                    e
                );
                None
            }
        }
    }

    /// Scores `event` against the submissions already recorded for its pair.
    pub fn calculate_anomaly_score(&self, event: &FormSubmitEvent) -> AnomalyReport {
        let pair = match origin_pair(event) {
            Some(pair) => pair,
            None => (String::new(), String::new()),
        };
        self.scorer.score(event, &self.window.timestamps(&pair))
    }

    pub fn on_form_submit(&mut self, event: &FormSubmitEvent) -> SubmissionOutcome {
        let (form_origin, action_origin) = match origin_pair(event) {
            Some(pair) => pair,
            None => {
                log::debug!(
                    "Ignoring submission with non-web origins: {} -> {}",
                    event.document_url,
                    event.action_url
                );
                return SubmissionOutcome::Clear;
            }
        };

        if form_origin == action_origin {
            if self.is_blocked_relationship(&form_origin, &action_origin) {
                return SubmissionOutcome::Blocked {
                    form_origin,
                    action_origin,
                };
            }
            return SubmissionOutcome::Clear;
        }

        if let Some(id) = self.lookup(&form_origin, &action_origin, RelationshipType::Trusted) {
            log::debug!("Trusted submission {} -> {}", form_origin, action_origin);
            if let Err(e) = self.store.touch_relationship(id) {
                log::warn!("Failed to record relationship use: {}", e);
            }
            return SubmissionOutcome::Clear;
        }

        if self.is_blocked_relationship(&form_origin, &action_origin) {
            log::info!("Blocked submission {} -> {}", form_origin, action_origin);
            return SubmissionOutcome::Blocked {
                form_origin,
                action_origin,
            };
        }

        let pair = (form_origin, action_origin);
        self.window
            .record(&pair, event.timestamp.timestamp_millis());
        let report = self.scorer.score(event, &self.window.timestamps(&pair));
        let (form_origin, action_origin) = pair;

        let has_password = event.has_field(FieldKind::Password);
        let has_email = event.has_field(FieldKind::Email);
        let uses_https = event
            .action_url
            .trim()
            .to_ascii_lowercase()
            .starts_with("https:");

        let (alert_type, mut severity) = if has_password {
            (AlertType::CredentialExfiltration, Severity::High)
        } else if has_email {
            (AlertType::ThirdPartyFormPost, Severity::Medium)
        } else if !report.indicators.is_empty() {
            (AlertType::FormActionMismatch, Severity::Low)
        } else {
            return SubmissionOutcome::Clear;
        };

        if report.score > self.scorer.escalation_threshold() {
            severity = severity.bump();
        }
        let mut indicators = report.indicators;
        if has_password && !uses_https {
            severity = severity.bump();
            indicators.push(INSECURE_TRANSPORT_INDICATOR.to_string());
        }

        let mut alert = CredentialAlert {
            id: None,
            form_origin,
            action_origin,
            alert_type,
            severity,
            has_password_field: has_password,
            has_email_field: has_email,
            has_hidden_fields: event.fields.iter().any(|f| f.kind == FieldKind::Hidden),
            is_cross_origin: true,
            uses_https,
            anomaly_score: report.score,
            anomaly_indicators: indicators,
            detected_at: event.timestamp,
        };

        match self.store.record_alert(&alert.to_record()) {
            Ok(id) => alert.id = Some(id),
            Err(e) => log::warn!("Failed to record credential alert: {}", e),
        }
        log::info!(
            "Credential alert {} ({}) {} -> {}, anomaly {:.2}",
            alert.alert_type,
            alert.severity,
            alert.form_origin,
            alert.action_origin,
            alert.anomaly_score
        );
        SubmissionOutcome::Alert(alert)
    }

    /// Persists a Trusted relationship, replacing any Block for the pair.
    pub fn learn_trusted_relationship(
        &mut self,
        form_origin: &str,
        action_origin: &str,
    ) -> Result<RelationshipId> {
        self.persist_relationship(form_origin, action_origin, RelationshipType::Trusted)
    }

    /// Persists a Blocked relationship, replacing any Trust for the pair.
    pub fn block_submission(&mut self, form_origin: &str, action_origin: &str) -> Result<RelationshipId> {
        self.persist_relationship(form_origin, action_origin, RelationshipType::Blocked)
    }

    fn persist_relationship(
        &mut self,
        form_origin: &str,
        action_origin: &str,
        relationship_type: RelationshipType,
    ) -> Result<RelationshipId> {
        let opposite = match relationship_type {
            RelationshipType::Trusted => RelationshipType::Blocked,
            RelationshipType::Blocked => RelationshipType::Trusted,
        };
        let stale = self
            .store
            .get_relationship(form_origin, action_origin, opposite)?;

        let rel = NewRelationship::new(form_origin, action_origin, relationship_type)
            .notes("Learned from user decision");
        let id = self.store.transaction(|tx| {
            if let Some(stale) = &stale {
                tx.delete_relationship(stale.id)?;
            }
            tx.create_relationship(&rel)
        })?;

        let pair = (form_origin.to_string(), action_origin.to_string());
        self.cache_for(opposite).remove(&pair);
        self.cache_for(relationship_type).insert(
            pair,
            CachedRelationship {
                id,
                expires_at: None,
            },
        );
        log::info!(
            "Learned {} relationship {} -> {}",
            relationship_type,
            form_origin,
            action_origin
        );
        Ok(id)
    }

    /// Allows the next autofill for the pair once. Never persisted.
    pub fn grant_autofill_override(&mut self, form_origin: &str, action_origin: &str) {
        self.overrides
            .insert((form_origin.to_string(), action_origin.to_string()));
    }

    pub fn has_autofill_override(&self, form_origin: &str, action_origin: &str) -> bool {
        self.overrides
            .contains(&(form_origin.to_string(), action_origin.to_string()))
    }

    /// Removes the override, returning whether one was pending.
    pub fn consume_autofill_override(&mut self, form_origin: &str, action_origin: &str) -> bool {
        self.overrides
            .remove(&(form_origin.to_string(), action_origin.to_string()))
    }
}

fn origin_pair(event: &FormSubmitEvent) -> Option<OriginPair> {
    let form_origin = DomainUtils::extract_origin(&event.document_url)?;
    let action_origin = DomainUtils::extract_origin(&event.action_url)?;
    Some((form_origin, action_origin))
}
