use super::model::{
    from_millis, now, to_millis, NewPolicy, Policy, PolicyFilter, PolicyId,
};
use super::PolicyStore;
use crate::error::{Result, SentinelError};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

pub(crate) const POLICY_COLUMNS: &str = "id, rule_name, url_pattern, file_hash, mime_type, action,
     match_type, created_at, created_by, expires_at, hit_count, last_hit";

const MAX_NAME_LEN: usize = 256;
const MAX_PATTERN_LEN: usize = 2048;

lazy_static! {
    static ref SHA256_HEX: Regex = Regex::new(r"^[0-9a-f]{64}$").unwrap();
    static ref MIME_TYPE: Regex = Regex::new(r"^[A-Za-z0-9][\w.+-]*/[\w.+*-]+$").unwrap();
}

pub(crate) fn row_to_policy(row: &Row<'_>) -> rusqlite::Result<Policy> {
    Ok(Policy {
        id: row.get(0)?,
        rule_name: row.get(1)?,
        url_pattern: row.get(2)?,
        file_hash: row.get(3)?,
        mime_type: row.get(4)?,
        action: row.get(5)?,
        match_type: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        created_by: row.get(8)?,
        expires_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        hit_count: row.get::<_, i64>(10)?.max(0) as u64,
        last_hit: row.get::<_, Option<i64>>(11)?.map(from_millis),
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn check_text(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.chars().count() > max_len {
        return Err(SentinelError::Validation(format!(
            "{} exceeds {} characters",
            field, max_len
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(SentinelError::Validation(format!(
            "{} contains control characters",
            field
        )));
    }
    Ok(())
}

/// Validates a policy draft and returns it with empty optionals cleared and
/// the hash lowercased.
pub(crate) fn normalize_policy(
    policy: &NewPolicy,
    created_at: &DateTime<Utc>,
) -> Result<NewPolicy> {
    let rule_name = policy.rule_name.trim().to_string();
    let url_pattern = non_empty(&policy.url_pattern);
    let file_hash = non_empty(&policy.file_hash).map(|h| h.to_lowercase());
    let mime_type = non_empty(&policy.mime_type);
    let created_by = policy.created_by.trim().to_string();

    if rule_name.is_empty() && url_pattern.is_none() && file_hash.is_none() {
        return Err(SentinelError::Validation(
            "policy needs a rule name, URL pattern or file hash".to_string(),
        ));
    }
    if rule_name.is_empty() {
        return Err(SentinelError::Validation("rule_name is required".to_string()));
    }
    check_text("rule_name", &rule_name, MAX_NAME_LEN)?;

    if let Some(pattern) = &url_pattern {
        check_text("url_pattern", pattern, MAX_PATTERN_LEN)?;
    }
    if let Some(hash) = &file_hash {
        if !SHA256_HEX.is_match(hash) {
            return Err(SentinelError::Validation(format!(
                "file_hash is not a SHA-256 hex digest: {}",
                hash
            )));
        }
    }
    if let Some(mime) = &mime_type {
        if !MIME_TYPE.is_match(mime) {
            return Err(SentinelError::Validation(format!(
                "mime_type is not of the form type/subtype: {}",
                mime
            )));
        }
    }
    if created_by.is_empty() {
        return Err(SentinelError::Validation("created_by is required".to_string()));
    }
    check_text("created_by", &created_by, MAX_NAME_LEN)?;

    if let Some(expires_at) = policy.expires_at {
        if expires_at <= *created_at {
            return Err(SentinelError::Validation(
                "expires_at must be after created_at".to_string(),
            ));
        }
    }

    Ok(NewPolicy {
        rule_name,
        url_pattern,
        file_hash,
        mime_type,
        action: policy.action,
        match_type: policy.match_type,
        created_by,
        expires_at: policy.expires_at,
    })
}

pub(crate) fn insert_policy(conn: &Connection, policy: &NewPolicy) -> Result<PolicyId> {
    let created_at = now();
    let policy = normalize_policy(policy, &created_at)?;
    conn.execute(
        "INSERT INTO policies (rule_name, url_pattern, file_hash, mime_type, action, match_type,
             created_at, created_by, expires_at, hit_count, last_hit)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL)",
        params![
            policy.rule_name,
            policy.url_pattern,
            policy.file_hash,
            policy.mime_type,
            policy.action,
            policy.match_type,
            to_millis(&created_at),
            policy.created_by,
            policy.expires_at.as_ref().map(to_millis),
        ],
    )?;
    let id = conn.last_insert_rowid();
    log::debug!(
        "Created policy {} '{}' ({} / {})",
        id,
        policy.rule_name,
        policy.action,
        policy.match_type
    );
    Ok(id)
}

pub(crate) fn update_policy(conn: &Connection, id: PolicyId, policy: &NewPolicy) -> Result<()> {
    let existing = get_policy(conn, id)?.ok_or_else(|| SentinelError::not_found("policy", id))?;
    let policy = normalize_policy(policy, &existing.created_at)?;
    conn.execute(
        "UPDATE policies SET rule_name = ?1, url_pattern = ?2, file_hash = ?3, mime_type = ?4,
             action = ?5, match_type = ?6, created_by = ?7, expires_at = ?8
         WHERE id = ?9",
        params![
            policy.rule_name,
            policy.url_pattern,
            policy.file_hash,
            policy.mime_type,
            policy.action,
            policy.match_type,
            policy.created_by,
            policy.expires_at.as_ref().map(to_millis),
            id,
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_policy(conn: &Connection, id: PolicyId) -> Result<()> {
    let removed = conn.execute("DELETE FROM policies WHERE id = ?1", params![id])?;
    if removed == 0 {
        return Err(SentinelError::not_found("policy", id));
    }
    Ok(())
}

pub(crate) fn get_policy(conn: &Connection, id: PolicyId) -> Result<Option<Policy>> {
    let sql = format!("SELECT {} FROM policies WHERE id = ?1", POLICY_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], row_to_policy)
        .optional()?)
}

pub(crate) fn list_policies(
    conn: &Connection,
    filter: &PolicyFilter,
    now_ms: i64,
) -> Result<Vec<Policy>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(action) = filter.action {
        clauses.push("action = ?");
        values.push(Value::Text(action.as_str().to_string()));
    }
    if let Some(match_type) = filter.match_type {
        clauses.push("match_type = ?");
        values.push(Value::Text(match_type.as_str().to_string()));
    }
    if let Some(created_by) = &filter.created_by {
        clauses.push("created_by = ?");
        values.push(Value::Text(created_by.clone()));
    }
    if !filter.include_expired {
        clauses.push("(expires_at IS NULL OR expires_at > ?)");
        values.push(Value::Integer(now_ms));
    }

    let mut sql = format!("SELECT {} FROM policies", POLICY_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), row_to_policy)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn delete_expired_policies(conn: &Connection, now_ms: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM policies WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![now_ms],
    )?)
}

impl PolicyStore {
    pub fn create_policy(&self, policy: &NewPolicy) -> Result<PolicyId> {
        self.write("create_policy", |conn| insert_policy(conn, policy))
    }

    pub fn update_policy(&self, id: PolicyId, policy: &NewPolicy) -> Result<()> {
        self.write("update_policy", |conn| update_policy(conn, id, policy))
    }

    pub fn delete_policy(&self, id: PolicyId) -> Result<()> {
        self.write("delete_policy", |conn| delete_policy(conn, id))
    }

    pub fn get_policy(&self, id: PolicyId) -> Result<Policy> {
        let mut policy = self
            .read("get_policy", |conn| get_policy(conn, id))?
            .ok_or_else(|| SentinelError::not_found("policy", id))?;
        self.usage.overlay_policy(&mut policy);
        Ok(policy)
    }

    pub fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<Policy>> {
        let now_ms = to_millis(&now());
        let mut policies = self.read("list_policies", |conn| list_policies(conn, filter, now_ms))?;
        for policy in &mut policies {
            self.usage.overlay_policy(policy);
        }
        Ok(policies)
    }

    pub fn policy_count(&self) -> Result<u64> {
        self.read("policy_count", |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM policies", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }
}
