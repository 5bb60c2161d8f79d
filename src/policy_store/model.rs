use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type PolicyId = i64;
pub type RelationshipId = i64;

/// Current time truncated to the millisecond precision used on disk.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub(crate) fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Closed string enums persisted as TEXT. Unknown strings are rejected both
/// by serde and when reading rows.
macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

wire_enum!(PolicyAction {
    Allow => "allow",
    Block => "block",
    Quarantine => "quarantine",
    BlockAutofill => "block_autofill",
    WarnUser => "warn_user",
});

wire_enum!(MatchType {
    Download => "download",
    FormMismatch => "form_mismatch",
    InsecureCredential => "insecure_cred",
    ThirdPartyForm => "third_party_form",
});

wire_enum!(RelationshipType {
    Trusted => "trusted",
    Blocked => "blocked",
});

wire_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

wire_enum!(AlertType {
    CredentialExfiltration => "credential_exfiltration",
    InsecureCredentialPost => "insecure_credential_post",
    ThirdPartyFormPost => "third_party_form_post",
    FormActionMismatch => "form_action_mismatch",
});

wire_enum!(UserAction {
    Trust => "trust",
    Block => "block",
    AllowOnce => "allow_once",
});

impl Severity {
    /// One level up, saturating at `Critical`.
    pub fn bump(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl AlertType {
    /// Policy category consulted for submissions raising this alert.
    pub fn match_type(&self) -> MatchType {
        match self {
            AlertType::CredentialExfiltration | AlertType::FormActionMismatch => {
                MatchType::FormMismatch
            }
            AlertType::InsecureCredentialPost => MatchType::InsecureCredential,
            AlertType::ThirdPartyFormPost => MatchType::ThirdPartyForm,
        }
    }
}

/// Input for creating or replacing a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPolicy {
    pub rule_name: String,
    #[serde(default)]
    pub url_pattern: Option<String>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub action: PolicyAction,
    pub match_type: MatchType,
    pub created_by: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewPolicy {
    pub fn new(rule_name: impl Into<String>, action: PolicyAction, match_type: MatchType) -> Self {
        Self {
            rule_name: rule_name.into(),
            url_pattern: None,
            file_hash: None,
            mime_type: None,
            action,
            match_type,
            created_by: "user".to_string(),
            expires_at: None,
        }
    }

    pub fn with_url_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.url_pattern = Some(pattern.into());
        self
    }

    pub fn with_file_hash(mut self, hash: impl Into<String>) -> Self {
        self.file_hash = Some(hash.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = who.into();
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub rule_name: String,
    pub url_pattern: Option<String>,
    pub file_hash: Option<String>,
    pub mime_type: Option<String>,
    pub action: PolicyAction,
    pub match_type: MatchType,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
    pub last_hit: Option<DateTime<Utc>>,
}

impl Policy {
    pub fn is_expired_at(&self, at: &DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= *at).unwrap_or(false)
    }
}

/// Lookup tuple for `match_policy`.
///
/// `match_type` scopes every tier to policies of that type. The category-wide
/// tier (a bare policy carrying only the type) is consulted only when
/// `category_fallback` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PolicyCandidate {
    pub url: Option<String>,
    pub file_hash: Option<String>,
    pub rule_name: Option<String>,
    pub match_type: Option<MatchType>,
    pub category_fallback: bool,
}

impl PolicyCandidate {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn for_hash(hash: impl Into<String>) -> Self {
        Self {
            file_hash: Some(hash.into()),
            ..Default::default()
        }
    }

    pub fn for_rule(rule_name: impl Into<String>) -> Self {
        Self {
            rule_name: Some(rule_name.into()),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.file_hash = Some(hash.into());
        self
    }

    pub fn with_rule(mut self, rule_name: impl Into<String>) -> Self {
        self.rule_name = Some(rule_name.into());
        self
    }

    /// Only policies of `match_type` apply; no category-wide fallback.
    pub fn within(mut self, match_type: MatchType) -> Self {
        self.match_type = Some(match_type);
        self
    }

    /// Only policies of `match_type` apply, falling back to a category-wide
    /// policy for the type.
    pub fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = Some(match_type);
        self.category_fallback = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        fn blank(v: &Option<String>) -> bool {
            v.as_deref().map(str::is_empty).unwrap_or(true)
        }
        blank(&self.url)
            && blank(&self.file_hash)
            && blank(&self.rule_name)
            && !(self.category_fallback && self.match_type.is_some())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    pub action: Option<PolicyAction>,
    pub match_type: Option<MatchType>,
    pub created_by: Option<String>,
    pub include_expired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRelationship {
    pub id: RelationshipId,
    pub form_origin: String,
    pub action_origin: String,
    pub relationship_type: RelationshipType,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub last_used: Option<DateTime<Utc>>,
    pub use_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRelationship {
    pub form_origin: String,
    pub action_origin: String,
    pub relationship_type: RelationshipType,
    pub created_by: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: String,
}

impl NewRelationship {
    pub fn new(
        form_origin: impl Into<String>,
        action_origin: impl Into<String>,
        relationship_type: RelationshipType,
    ) -> Self {
        Self {
            form_origin: form_origin.into(),
            action_origin: action_origin.into(),
            relationship_type,
            created_by: "user".to_string(),
            expires_at: None,
            notes: String::new(),
        }
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// Download details recorded with a threat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreatMetadata {
    pub url: String,
    pub filename: String,
    pub file_hash: String,
    pub mime_type: String,
    pub file_size: u64,
    pub rule_name: String,
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub id: i64,
    pub detected_at: DateTime<Utc>,
    pub url: String,
    pub filename: String,
    pub file_hash: String,
    pub mime_type: String,
    pub file_size: u64,
    pub rule_name: String,
    pub severity: Severity,
    pub action_taken: PolicyAction,
    pub policy_id: Option<PolicyId>,
    pub alert_payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCredentialAlert {
    pub form_origin: String,
    pub action_origin: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub has_password_field: bool,
    pub has_email_field: bool,
    pub has_hidden_fields: bool,
    pub is_cross_origin: bool,
    pub uses_https: bool,
    pub policy_id: Option<PolicyId>,
    pub anomaly_score: f64,
    pub anomaly_indicators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialAlertRecord {
    pub id: i64,
    pub detected_at: DateTime<Utc>,
    pub form_origin: String,
    pub action_origin: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub has_password_field: bool,
    pub has_email_field: bool,
    pub has_hidden_fields: bool,
    pub is_cross_origin: bool,
    pub uses_https: bool,
    pub user_action: Option<UserAction>,
    pub policy_id: Option<PolicyId>,
    pub anomaly_score: f64,
    pub anomaly_indicators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    pub description: String,
    pub category: String,
    /// JSON policy body containing `{{KEY}}` tokens.
    pub body: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTemplate {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub body: String,
    pub variables: Vec<TemplateVariable>,
    pub is_builtin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
