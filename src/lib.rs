pub mod config;
pub mod decision;
pub mod domain_utils;
pub mod error;
pub mod form_monitor;
pub mod phishing;
pub mod policy_store;
pub mod retry;

pub use config::SentinelConfig;
pub use decision::{Alert, AlertRef, Decision, DegradedNotice, DownloadEvent, MalwareMatch, Sentinel, UserChoice};
pub use error::{IntegrityError, Result, SentinelError};
pub use form_monitor::{CredentialAlert, FieldKind, FormField, FormMonitor, FormSubmitEvent, SubmissionOutcome};
pub use phishing::{PhishingAnalysis, PhishingUrlAnalyzer};
pub use policy_store::PolicyStore;
