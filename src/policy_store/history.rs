use super::model::{
    from_millis, now, to_millis, CredentialAlertRecord, NewCredentialAlert, PolicyAction,
    PolicyId, Severity, ThreatMetadata, ThreatRecord, UserAction,
};
use super::PolicyStore;
use crate::error::{Result, SentinelError};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

const THREAT_COLUMNS: &str = "id, detected_at, url, filename, file_hash, mime_type, file_size,
     rule_name, severity, action_taken, policy_id, alert_json";

const ALERT_COLUMNS: &str = "id, detected_at, form_origin, action_origin, alert_type, severity,
     has_password_field, has_email_field, has_hidden_fields, is_cross_origin, uses_https,
     user_action, policy_id, anomaly_score, anomaly_indicators";

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_threat(row: &Row<'_>) -> rusqlite::Result<ThreatRecord> {
    Ok(ThreatRecord {
        id: row.get(0)?,
        detected_at: from_millis(row.get(1)?),
        url: row.get(2)?,
        filename: row.get(3)?,
        file_hash: row.get(4)?,
        mime_type: row.get(5)?,
        file_size: row.get::<_, i64>(6)?.max(0) as u64,
        rule_name: row.get(7)?,
        severity: row.get(8)?,
        action_taken: row.get(9)?,
        policy_id: row.get(10)?,
        alert_payload: json_column(row, 11)?,
    })
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<CredentialAlertRecord> {
    Ok(CredentialAlertRecord {
        id: row.get(0)?,
        detected_at: from_millis(row.get(1)?),
        form_origin: row.get(2)?,
        action_origin: row.get(3)?,
        alert_type: row.get(4)?,
        severity: row.get(5)?,
        has_password_field: row.get(6)?,
        has_email_field: row.get(7)?,
        has_hidden_fields: row.get(8)?,
        is_cross_origin: row.get(9)?,
        uses_https: row.get(10)?,
        user_action: row.get(11)?,
        policy_id: row.get(12)?,
        anomaly_score: row.get(13)?,
        anomaly_indicators: json_column(row, 14)?,
    })
}

pub(crate) fn insert_threat(
    conn: &Connection,
    threat: &ThreatMetadata,
    action_taken: PolicyAction,
    policy_id: Option<PolicyId>,
    alert_payload: &serde_json::Value,
) -> Result<i64> {
    if threat.url.trim().is_empty() {
        return Err(SentinelError::Validation("threat url is required".to_string()));
    }
    let payload = serde_json::to_string(alert_payload)
        .map_err(|e| SentinelError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO threat_history (detected_at, url, filename, file_hash, mime_type, file_size,
             rule_name, severity, action_taken, policy_id, alert_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            to_millis(&now()),
            threat.url,
            threat.filename,
            threat.file_hash.to_lowercase(),
            threat.mime_type,
            threat.file_size as i64,
            threat.rule_name,
            threat.severity.unwrap_or(Severity::Medium),
            action_taken,
            policy_id,
            payload,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn insert_alert(conn: &Connection, alert: &NewCredentialAlert) -> Result<i64> {
    if alert.form_origin.is_empty() || alert.action_origin.is_empty() {
        return Err(SentinelError::Validation(
            "credential alert needs both origins".to_string(),
        ));
    }
    let indicators = serde_json::to_string(&alert.anomaly_indicators)
        .map_err(|e| SentinelError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO credential_alerts (detected_at, form_origin, action_origin, alert_type,
             severity, has_password_field, has_email_field, has_hidden_fields, is_cross_origin,
             uses_https, user_action, policy_id, anomaly_score, anomaly_indicators)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?12, ?13)",
        params![
            to_millis(&now()),
            alert.form_origin,
            alert.action_origin,
            alert.alert_type,
            alert.severity,
            alert.has_password_field,
            alert.has_email_field,
            alert.has_hidden_fields,
            alert.is_cross_origin,
            alert.uses_https,
            alert.policy_id,
            alert.anomaly_score.clamp(0.0, 1.0),
            indicators,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl PolicyStore {
    pub fn record_threat(
        &self,
        threat: &ThreatMetadata,
        action_taken: PolicyAction,
        policy_id: Option<PolicyId>,
        alert_payload: &serde_json::Value,
    ) -> Result<i64> {
        self.with_conn("record_threat", |conn| {
            insert_threat(conn, threat, action_taken, policy_id, alert_payload)
        })
    }

    pub fn threat_history(&self, since: DateTime<Utc>) -> Result<Vec<ThreatRecord>> {
        self.read("threat_history", |conn| {
            let sql = format!(
                "SELECT {} FROM threat_history WHERE detected_at >= ?1 ORDER BY detected_at DESC, id DESC",
                THREAT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![to_millis(&since)], row_to_threat)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn threats_by_rule(&self, rule_name: &str) -> Result<Vec<ThreatRecord>> {
        self.read("threats_by_rule", |conn| {
            let sql = format!(
                "SELECT {} FROM threat_history WHERE rule_name = ?1 ORDER BY detected_at DESC, id DESC",
                THREAT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![rule_name], row_to_threat)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn threat_count(&self) -> Result<u64> {
        self.read("threat_count", |conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM threat_history", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }

    /// Drops threat records older than `days`.
    pub fn cleanup_old_threats(&self, days: i64) -> Result<usize> {
        let cutoff = to_millis(&(now() - Duration::days(days.max(0))));
        let removed = self.with_conn("cleanup_old_threats", |conn| {
            Ok(conn.execute(
                "DELETE FROM threat_history WHERE detected_at < ?1",
                params![cutoff],
            )?)
        })?;
        if removed > 0 {
            log::info!("Removed {} threat records older than {} days", removed, days);
        }
        Ok(removed)
    }

    pub fn record_alert(&self, alert: &NewCredentialAlert) -> Result<i64> {
        self.with_conn("record_alert", |conn| insert_alert(conn, alert))
    }

    pub fn credential_alerts(&self, since: DateTime<Utc>) -> Result<Vec<CredentialAlertRecord>> {
        self.read("credential_alerts", |conn| {
            let sql = format!(
                "SELECT {} FROM credential_alerts WHERE detected_at >= ?1 ORDER BY detected_at DESC, id DESC",
                ALERT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![to_millis(&since)], row_to_alert)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Alerts where the origin appears on either side of the submission.
    pub fn alerts_by_origin(&self, origin: &str) -> Result<Vec<CredentialAlertRecord>> {
        self.read("alerts_by_origin", |conn| {
            let sql = format!(
                "SELECT {} FROM credential_alerts
                 WHERE form_origin = ?1 OR action_origin = ?1
                 ORDER BY detected_at DESC, id DESC",
                ALERT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![origin], row_to_alert)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn update_alert_action(&self, alert_id: i64, action: UserAction) -> Result<()> {
        self.with_conn("update_alert_action", |conn| {
            let updated = conn.execute(
                "UPDATE credential_alerts SET user_action = ?1 WHERE id = ?2",
                params![action, alert_id],
            )?;
            if updated == 0 {
                return Err(SentinelError::not_found("credential alert", alert_id));
            }
            Ok(())
        })
    }
}
