//! Weighted anomaly scoring for cross-origin form submissions.
//!
//! Every check yields a sub-score in [0, 1]. A check adds `weight * sub_score`
//! to the total only once its sub-score is above that check's own noise
//! threshold.

use super::window::average_interval_ms;
use super::{FieldKind, FormSubmitEvent};
use crate::config::{AnomalyConfig, FrequencyConfig};
use crate::domain_utils::DomainUtils;
use serde::Serialize;

pub const HIDDEN_RATIO_INDICATOR: &str = "High hidden field ratio";
pub const FIELD_COUNT_INDICATOR: &str = "Excessive number of form fields";
pub const ACTION_DOMAIN_INDICATOR: &str = "Suspicious action domain";
pub const FREQUENCY_INDICATOR: &str = "Unusual submission frequency detected";

const KEYWORD_DOMAIN_SCORE: f64 = 0.8;
const IP_DOMAIN_SCORE: f64 = 0.7;
const LONG_DOMAIN_SCORE: f64 = 0.6;
const RAPID_FREQUENCY_SCORE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubScore {
    pub check: &'static str,
    pub score: f64,
    pub contributed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnomalyReport {
    pub score: f64,
    pub hidden_ratio: f64,
    pub sub_scores: Vec<SubScore>,
    pub indicators: Vec<String>,
}

impl AnomalyReport {
    pub fn sub_score(&self, check: &str) -> Option<f64> {
        self.sub_scores
            .iter()
            .find(|s| s.check == check)
            .map(|s| s.score)
    }
}

/// Fraction of fields of kind `Hidden`; zero for an empty manifest.
pub fn hidden_ratio(event: &FormSubmitEvent) -> f64 {
    if event.fields.is_empty() {
        return 0.0;
    }
    let hidden = event
        .fields
        .iter()
        .filter(|f| f.kind == FieldKind::Hidden)
        .count();
    hidden as f64 / event.fields.len() as f64
}

/// Linear over (floor, band] up to 0.5, then over (band, 1] up to 1.0.
pub fn hidden_ratio_score(ratio: f64, config: &AnomalyConfig) -> f64 {
    let floor = config.hidden_ratio_floor;
    let band = config.hidden_ratio_band.max(floor);
    if ratio <= floor {
        0.0
    } else if ratio <= band {
        if band > floor {
            (ratio - floor) / (band - floor) * 0.5
        } else {
            0.5
        }
    } else if band < 1.0 {
        (0.5 + (ratio - band) / (1.0 - band) * 0.5).min(1.0)
    } else {
        1.0
    }
}

/// Half credit across floor..mid, the other half across mid..high.
pub fn field_count_score(count: usize, config: &AnomalyConfig) -> f64 {
    let floor = config.field_count_floor;
    let mid = config.field_count_mid.max(floor);
    let high = config.field_count_high.max(mid);
    if count <= floor {
        0.0
    } else if count <= mid && mid > floor {
        (count - floor) as f64 / (mid - floor) as f64 * 0.5
    } else if count <= high && high > mid {
        0.5 + (count - mid) as f64 / (high - mid) as f64 * 0.5
    } else {
        1.0
    }
}

pub fn action_domain_score(action_url: &str, config: &AnomalyConfig) -> f64 {
    let host = match DomainUtils::extract_host(action_url) {
        Some(host) => host,
        None => return 0.0,
    };
    let keyword_hit = config
        .suspicious_action_keywords
        .iter()
        .any(|kw| !kw.is_empty() && host.contains(&kw.to_lowercase()));
    let tld_hit = DomainUtils::top_level_label(&host)
        .map(|tld| {
            config
                .suspicious_action_tlds
                .iter()
                .any(|t| t.trim_start_matches('.').eq_ignore_ascii_case(&tld))
        })
        .unwrap_or(false);
    if keyword_hit || tld_hit {
        KEYWORD_DOMAIN_SCORE
    } else if DomainUtils::is_ip_address(&host) {
        IP_DOMAIN_SCORE
    } else if host.len() > config.action_domain_max_length {
        LONG_DOMAIN_SCORE
    } else {
        0.0
    }
}

pub fn frequency_score(timestamps: &[i64], config: &FrequencyConfig) -> f64 {
    match average_interval_ms(timestamps, config.sample_size) {
        Some(avg) if avg < config.burst_interval_ms as f64 => 1.0,
        Some(avg) if avg < config.rapid_interval_ms as f64 => RAPID_FREQUENCY_SCORE,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyScorer {
    anomaly: AnomalyConfig,
    frequency: FrequencyConfig,
}

impl AnomalyScorer {
    pub fn new(anomaly: AnomalyConfig, frequency: FrequencyConfig) -> Self {
        Self { anomaly, frequency }
    }

    pub fn escalation_threshold(&self) -> f64 {
        self.anomaly.escalation_threshold
    }

    pub fn frequency_config(&self) -> &FrequencyConfig {
        &self.frequency
    }

    /// Scores `event` given the recorded submission timestamps for its pair.
    pub fn score(&self, event: &FormSubmitEvent, recent_ms: &[i64]) -> AnomalyReport {
        let cfg = &self.anomaly;
        let ratio = hidden_ratio(event);
        let checks = [
            (
                "hidden_ratio",
                hidden_ratio_score(ratio, cfg),
                cfg.hidden_ratio_weight,
                cfg.hidden_ratio_noise,
                HIDDEN_RATIO_INDICATOR,
            ),
            (
                "field_count",
                field_count_score(event.fields.len(), cfg),
                cfg.field_count_weight,
                cfg.field_count_noise,
                FIELD_COUNT_INDICATOR,
            ),
            (
                "action_domain",
                action_domain_score(&event.action_url, cfg),
                cfg.action_domain_weight,
                cfg.action_domain_noise,
                ACTION_DOMAIN_INDICATOR,
            ),
            (
                "frequency",
                frequency_score(recent_ms, &self.frequency),
                cfg.frequency_weight,
                cfg.frequency_noise,
                FREQUENCY_INDICATOR,
            ),
        ];

        let mut report = AnomalyReport {
            hidden_ratio: ratio,
            ..Default::default()
        };
        let mut total = 0.0;
        for (check, score, weight, noise, indicator) in checks {
            let contributed = score > noise;
            if contributed {
                total += weight * score;
                report.indicators.push(indicator.to_string());
            }
            report.sub_scores.push(SubScore {
                check,
                score,
                contributed,
            });
        }
        report.score = total.clamp(0.0, 1.0);
        report
    }
}
