use super::model::{to_millis, CredentialRelationship, NewPolicy, NewRelationship, Policy};
use super::policies::{self, normalize_policy};
use super::relationships::{self, validate_relationship};
use super::PolicyStore;
use crate::error::{Result, SentinelError};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// On-disk exchange format for policies and relationships.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyExport {
    pub policies: Vec<Policy>,
    pub relationships: Vec<CredentialRelationship>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub policies_imported: usize,
    pub relationships_imported: usize,
    pub relationships_skipped: usize,
}

fn id_taken(conn: &Connection, table: &str, id: i64) -> Result<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", table);
    Ok(conn.query_row(&sql, params![id], |row| row.get(0))?)
}

fn import_policy(conn: &Connection, policy: &Policy) -> Result<()> {
    let draft = NewPolicy {
        rule_name: policy.rule_name.clone(),
        url_pattern: policy.url_pattern.clone(),
        file_hash: policy.file_hash.clone(),
        mime_type: policy.mime_type.clone(),
        action: policy.action,
        match_type: policy.match_type,
        created_by: policy.created_by.clone(),
        expires_at: policy.expires_at,
    };
    let clean = normalize_policy(&draft, &policy.created_at)?;
    let id = if id_taken(conn, "policies", policy.id)? {
        None
    } else {
        Some(policy.id)
    };
    conn.execute(
        "INSERT INTO policies (id, rule_name, url_pattern, file_hash, mime_type, action, match_type,
             created_at, created_by, expires_at, hit_count, last_hit)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id,
            clean.rule_name,
            clean.url_pattern,
            clean.file_hash,
            clean.mime_type,
            clean.action,
            clean.match_type,
            to_millis(&policy.created_at),
            clean.created_by,
            clean.expires_at.as_ref().map(to_millis),
            policy.hit_count as i64,
            policy.last_hit.as_ref().map(to_millis),
        ],
    )?;
    Ok(())
}

/// Returns false when the (form, action, type) triple already exists.
fn import_relationship(conn: &Connection, rel: &CredentialRelationship) -> Result<bool> {
    validate_relationship(&NewRelationship {
        form_origin: rel.form_origin.clone(),
        action_origin: rel.action_origin.clone(),
        relationship_type: rel.relationship_type,
        created_by: rel.created_by.clone(),
        expires_at: rel.expires_at,
        notes: rel.notes.clone(),
    })?;
    if relationships::get_relationship(
        conn,
        &rel.form_origin,
        &rel.action_origin,
        rel.relationship_type,
    )?
    .is_some()
    {
        return Ok(false);
    }
    let id = if id_taken(conn, "credential_relationships", rel.id)? {
        None
    } else {
        Some(rel.id)
    };
    conn.execute(
        "INSERT INTO credential_relationships (id, form_origin, action_origin, relationship_type,
             created_at, created_by, last_used, use_count, expires_at, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            rel.form_origin,
            rel.action_origin,
            rel.relationship_type,
            to_millis(&rel.created_at),
            rel.created_by,
            rel.last_used.as_ref().map(to_millis),
            rel.use_count as i64,
            rel.expires_at.as_ref().map(to_millis),
            rel.notes,
        ],
    )?;
    Ok(true)
}

impl PolicyStore {
    /// Every policy (expired included) and relationship as pretty JSON.
    pub fn export_json(&self) -> Result<Vec<u8>> {
        self.flush_usage()?;
        let export = self.read("export_json", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM policies ORDER BY id",
                policies::POLICY_COLUMNS
            ))?;
            let policies = stmt
                .query_map([], policies::row_to_policy)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let relationships = relationships::list_relationships(conn, None)?;
            Ok(PolicyExport {
                policies,
                relationships,
            })
        })?;
        log::info!(
            "Exported {} policies and {} relationships",
            export.policies.len(),
            export.relationships.len()
        );
        serde_json::to_vec_pretty(&export).map_err(|e| SentinelError::Serialization(e.to_string()))
    }

    /// Adds the exported rows to the store. Unknown enum values or invalid
    /// rows reject the whole import; existing relationships are skipped.
    pub fn import_json(&self, bytes: &[u8]) -> Result<ImportSummary> {
        let export: PolicyExport = serde_json::from_slice(bytes)
            .map_err(|e| SentinelError::Validation(format!("invalid policy export: {}", e)))?;

        let summary = self.write("import_json", |conn| {
            let mut summary = ImportSummary::default();
            for policy in &export.policies {
                import_policy(conn, policy)?;
                summary.policies_imported += 1;
            }
            for rel in &export.relationships {
                if import_relationship(conn, rel)? {
                    summary.relationships_imported += 1;
                } else {
                    summary.relationships_skipped += 1;
                }
            }
            Ok(summary)
        })?;
        log::info!(
            "Imported {} policies and {} relationships ({} duplicate relationships skipped)",
            summary.policies_imported,
            summary.relationships_imported,
            summary.relationships_skipped
        );
        Ok(summary)
    }

    /// Removes all policies and relationships. History and templates stay.
    pub fn clear_all(&self) -> Result<()> {
        self.write("clear_all", |conn| {
            conn.execute("DELETE FROM policies", [])?;
            conn.execute("DELETE FROM credential_relationships", [])?;
            Ok(())
        })?;
        log::warn!("Cleared all policies and relationships");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_store::model::{
        now, MatchType, PolicyAction, PolicyCandidate, PolicyFilter, RelationshipType,
    };

    const HASH: &str = "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

    fn populated() -> PolicyStore {
        let store = PolicyStore::open_in_memory(&Default::default()).unwrap();
        store
            .create_policy(
                &NewPolicy::new("Block payload", PolicyAction::Block, MatchType::Download)
                    .with_file_hash(HASH)
                    .with_mime_type("application/octet-stream"),
            )
            .unwrap();
        store
            .create_policy(
                &NewPolicy::new("Trusted intranet", PolicyAction::Allow, MatchType::Download)
                    .with_url_pattern("https://intranet.example/%")
                    .expires_at(now() + chrono::Duration::days(7)),
            )
            .unwrap();
        store
            .match_policy(&PolicyCandidate::for_hash(HASH))
            .unwrap();
        store
            .create_relationship(
                &NewRelationship::new(
                    "https://shop.example",
                    "https://pay.example",
                    RelationshipType::Trusted,
                )
                .notes("checkout"),
            )
            .unwrap();
        store
    }

    fn snapshot(store: &PolicyStore) -> (Vec<Policy>, Vec<CredentialRelationship>) {
        (
            store
                .list_policies(&PolicyFilter {
                    include_expired: true,
                    ..Default::default()
                })
                .unwrap(),
            store.list_relationships(None).unwrap(),
        )
    }

    #[test]
    fn test_export_clear_import_round_trip() {
        let store = populated();
        let before = snapshot(&store);
        let bytes = store.export_json().unwrap();

        store.clear_all().unwrap();
        assert_eq!(store.policy_count().unwrap(), 0);
        assert!(store.list_relationships(None).unwrap().is_empty());

        let summary = store.import_json(&bytes).unwrap();
        assert_eq!(summary.policies_imported, 2);
        assert_eq!(summary.relationships_imported, 1);
        assert_eq!(snapshot(&store), before);
        assert_eq!(before.0.iter().map(|p| p.hit_count).sum::<u64>(), 1);
    }

    #[test]
    fn test_import_is_additive() {
        let store = populated();
        let bytes = store.export_json().unwrap();
        let summary = store.import_json(&bytes).unwrap();

        assert_eq!(summary.policies_imported, 2);
        assert_eq!(summary.relationships_skipped, 1);
        assert_eq!(store.policy_count().unwrap(), 4);
        assert_eq!(store.list_relationships(None).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_enum_rejected() {
        let store = populated();
        let mut doc: serde_json::Value =
            serde_json::from_slice(&store.export_json().unwrap()).unwrap();
        doc["policies"][0]["action"] = serde_json::json!("obliterate");
        store.clear_all().unwrap();

        let err = store
            .import_json(&serde_json::to_vec(&doc).unwrap())
            .unwrap_err();
        assert!(matches!(err, SentinelError::Validation(_)));
        assert_eq!(store.policy_count().unwrap(), 0);
    }

    #[test]
    fn test_invalid_row_rolls_back_import() {
        let store = populated();
        let mut doc: serde_json::Value =
            serde_json::from_slice(&store.export_json().unwrap()).unwrap();
        doc["policies"][1]["file_hash"] = serde_json::json!("not-a-hash");
        store.clear_all().unwrap();

        assert!(store.import_json(&serde_json::to_vec(&doc).unwrap()).is_err());
        assert_eq!(store.policy_count().unwrap(), 0);
    }

    #[test]
    fn test_clear_keeps_history() {
        let store = populated();
        let threat = crate::policy_store::model::ThreatMetadata {
            url: "https://files.example/a.exe".to_string(),
            ..Default::default()
        };
        store
            .record_threat(&threat, PolicyAction::Block, None, &serde_json::json!({}))
            .unwrap();
        store.seed_builtin_templates().unwrap();
        store.clear_all().unwrap();
        assert_eq!(store.threat_count().unwrap(), 1);
        assert!(!store.list_templates(None).unwrap().is_empty());
    }
}
