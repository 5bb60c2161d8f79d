//! Parametrised policy blueprints with `{{KEY}}` substitution.

use super::model::{from_millis, now, to_millis, NewPolicy, NewTemplate, PolicyTemplate};
use super::PolicyStore;
use crate::error::{Result, SentinelError};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{([A-Z0-9_]+)\}\}").unwrap();
}

const TEMPLATE_COLUMNS: &str =
    "id, name, description, category, body, variables, is_builtin, created_at, updated_at";

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<PolicyTemplate> {
    let variables: String = row.get(5)?;
    Ok(PolicyTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        body: row.get(4)?,
        variables: serde_json::from_str(&variables)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        is_builtin: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        updated_at: from_millis(row.get(8)?),
    })
}

/// Placeholder names in order of first appearance.
pub fn placeholders(body: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(body) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// JSON string contents for `value`, without the surrounding quotes.
fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Replaces every `{{KEY}}` token; the first token without a value is reported.
pub fn substitute(body: &str, variables: &HashMap<String, String>) -> Result<String> {
    if let Some(missing) = placeholders(body)
        .into_iter()
        .find(|name| !variables.contains_key(name))
    {
        return Err(SentinelError::MissingVariable(missing));
    }
    Ok(PLACEHOLDER
        .replace_all(body, |caps: &Captures| {
            variables
                .get(&caps[1])
                .map(|v| json_escape(v))
                .unwrap_or_default()
        })
        .into_owned())
}

fn validate_template(template: &NewTemplate) -> Result<()> {
    if template.name.trim().is_empty() {
        return Err(SentinelError::Validation("template name is required".to_string()));
    }
    if template.category.trim().is_empty() {
        return Err(SentinelError::Validation(
            "template category is required".to_string(),
        ));
    }
    // The body must be valid JSON once every placeholder is filled in.
    let sample: HashMap<String, String> = placeholders(&template.body)
        .into_iter()
        .map(|name| (name, "x".to_string()))
        .collect();
    let filled = substitute(&template.body, &sample)?;
    serde_json::from_str::<NewPolicy>(&filled).map_err(|e| {
        SentinelError::Validation(format!(
            "template '{}' body is not a policy: {}",
            template.name, e
        ))
    })?;
    Ok(())
}

pub(crate) fn insert_template(
    conn: &Connection,
    template: &NewTemplate,
    is_builtin: bool,
) -> Result<i64> {
    validate_template(template)?;
    let variables = serde_json::to_string(&template.variables)
        .map_err(|e| SentinelError::Serialization(e.to_string()))?;
    let now_ms = to_millis(&now());
    conn.execute(
        "INSERT INTO policy_templates (name, description, category, body, variables, is_builtin,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            template.name.trim(),
            template.description,
            template.category.trim(),
            template.body,
            variables,
            is_builtin,
            now_ms,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn template_exists(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM policy_templates WHERE name = ?1)",
        params![name],
        |row| row.get(0),
    )?)
}

fn builtin(
    name: &str,
    description: &str,
    category: &str,
    body: &str,
    variables: &[(&str, &str)],
) -> NewTemplate {
    NewTemplate {
        name: name.to_string(),
        description: description.to_string(),
        category: category.to_string(),
        body: body.to_string(),
        variables: variables
            .iter()
            .map(|(name, description)| super::model::TemplateVariable {
                name: name.to_string(),
                description: description.to_string(),
                default_value: None,
            })
            .collect(),
    }
}

/// Templates shipped with the engine.
pub fn builtin_templates() -> Vec<NewTemplate> {
    vec![
        builtin(
            "Block Cross-Origin Credentials",
            "Block autofill when credentials are posted to a different origin",
            "credential_protection",
            r#"{"rule_name": "Block Cross-Origin Credentials", "action": "block_autofill",
                "match_type": "form_mismatch", "created_by": "template"}"#,
            &[],
        ),
        builtin(
            "Warn on Insecure Password Posts",
            "Warn before passwords are submitted over plain HTTP",
            "credential_protection",
            r#"{"rule_name": "Warn on Insecure Password Posts", "action": "warn_user",
                "match_type": "insecure_cred", "created_by": "template"}"#,
            &[],
        ),
        builtin(
            "Block Third-Party Tracking Forms",
            "Block form posts to a known tracking domain",
            "privacy",
            r#"{"rule_name": "Block Tracking Domain {{TRACKING_DOMAIN}}",
                "url_pattern": "%://{{TRACKING_DOMAIN}}/%", "action": "block",
                "match_type": "third_party_form", "created_by": "template"}"#,
            &[("TRACKING_DOMAIN", "Domain receiving the form data")],
        ),
        builtin(
            "Quarantine Downloads From Origin",
            "Quarantine every download served from an origin",
            "download_protection",
            r#"{"rule_name": "Quarantine Downloads From {{ORIGIN}}",
                "url_pattern": "{{ORIGIN}}/%", "action": "quarantine",
                "match_type": "download", "created_by": "template"}"#,
            &[("ORIGIN", "Origin such as https://files.example.com")],
        ),
        builtin(
            "Block File Hash",
            "Block a known-bad file by its SHA-256 digest",
            "download_protection",
            r#"{"rule_name": "Block {{FILE_HASH}}", "file_hash": "{{FILE_HASH}}",
                "action": "block", "match_type": "download", "created_by": "template"}"#,
            &[("FILE_HASH", "SHA-256 hex digest")],
        ),
        builtin(
            "Allow Trusted Origin",
            "Allow downloads and navigation to an origin without prompting",
            "trust",
            r#"{"rule_name": "Trusted {{ORIGIN}}", "url_pattern": "{{ORIGIN}}/%",
                "action": "allow", "match_type": "download", "created_by": "template"}"#,
            &[("ORIGIN", "Origin such as https://intranet.example.com")],
        ),
    ]
}

impl PolicyStore {
    pub fn create_template(&self, template: &NewTemplate) -> Result<i64> {
        self.with_conn("create_template", |conn| {
            if template_exists(conn, template.name.trim())? {
                return Err(SentinelError::ConstraintViolation(format!(
                    "template '{}' already exists",
                    template.name
                )));
            }
            insert_template(conn, template, false)
        })
    }

    pub fn get_template(&self, id: i64) -> Result<PolicyTemplate> {
        self.read("get_template", |conn| {
            let sql = format!("SELECT {} FROM policy_templates WHERE id = ?1", TEMPLATE_COLUMNS);
            Ok(conn.query_row(&sql, params![id], row_to_template).optional()?)
        })?
        .ok_or_else(|| SentinelError::not_found("template", id))
    }

    pub fn get_template_by_name(&self, name: &str) -> Result<Option<PolicyTemplate>> {
        self.read("get_template_by_name", |conn| {
            let sql = format!("SELECT {} FROM policy_templates WHERE name = ?1", TEMPLATE_COLUMNS);
            Ok(conn.query_row(&sql, params![name], row_to_template).optional()?)
        })
    }

    pub fn list_templates(&self, category: Option<&str>) -> Result<Vec<PolicyTemplate>> {
        self.read("list_templates", |conn| {
            let mut sql = format!("SELECT {} FROM policy_templates", TEMPLATE_COLUMNS);
            if category.is_some() {
                sql.push_str(" WHERE category = ?1");
            }
            sql.push_str(" ORDER BY category, name");
            let mut stmt = conn.prepare(&sql)?;
            let rows = match category {
                Some(category) => stmt.query_map(params![category], row_to_template)?,
                None => stmt.query_map([], row_to_template)?,
            };
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn update_template(&self, id: i64, template: &NewTemplate) -> Result<()> {
        validate_template(template)?;
        let variables = serde_json::to_string(&template.variables)
            .map_err(|e| SentinelError::Serialization(e.to_string()))?;
        let now_ms = to_millis(&now());
        self.with_conn("update_template", |conn| {
            let updated = conn.execute(
                "UPDATE policy_templates SET name = ?1, description = ?2, category = ?3, body = ?4,
                     variables = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    template.name.trim(),
                    template.description,
                    template.category.trim(),
                    template.body,
                    variables,
                    now_ms,
                    id
                ],
            )?;
            if updated == 0 {
                return Err(SentinelError::not_found("template", id));
            }
            Ok(())
        })
    }

    pub fn delete_template(&self, id: i64) -> Result<()> {
        let template = self.get_template(id)?;
        if template.is_builtin {
            return Err(SentinelError::ConstraintViolation(format!(
                "built-in template '{}' cannot be deleted",
                template.name
            )));
        }
        self.with_conn("delete_template", |conn| {
            conn.execute("DELETE FROM policy_templates WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    /// Inserts the shipped templates that are not present yet. Returns how
    /// many were added.
    pub fn seed_builtin_templates(&self) -> Result<usize> {
        let added = self.with_conn("seed_builtin_templates", |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut added = 0;
            for template in builtin_templates() {
                if !template_exists(&tx, &template.name)? {
                    insert_template(&tx, &template, true)?;
                    added += 1;
                }
            }
            tx.commit()?;
            Ok(added)
        })?;
        if added > 0 {
            log::info!("Seeded {} built-in policy templates", added);
        }
        Ok(added)
    }

    /// Builds a policy draft from a template. Variables not supplied fall back
    /// to the template's declared defaults.
    pub fn instantiate_template(
        &self,
        template_id: i64,
        variables: &HashMap<String, String>,
    ) -> Result<NewPolicy> {
        let template = self.get_template(template_id)?;
        let mut values = variables.clone();
        for var in &template.variables {
            if let Some(default) = &var.default_value {
                values
                    .entry(var.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        let body = substitute(&template.body, &values)?;
        serde_json::from_str::<NewPolicy>(&body).map_err(|e| {
            SentinelError::Validation(format!(
                "template '{}' produced an invalid policy: {}",
                template.name, e
            ))
        })
    }

    pub fn export_templates_json(&self) -> Result<Vec<u8>> {
        let templates: Vec<NewTemplate> = self
            .list_templates(None)?
            .into_iter()
            .filter(|t| !t.is_builtin)
            .map(|t| NewTemplate {
                name: t.name,
                description: t.description,
                category: t.category,
                body: t.body,
                variables: t.variables,
            })
            .collect();
        serde_json::to_vec_pretty(&templates).map_err(|e| SentinelError::Serialization(e.to_string()))
    }

    /// Imports user templates, skipping names that already exist.
    pub fn import_templates_json(&self, bytes: &[u8]) -> Result<usize> {
        let templates: Vec<NewTemplate> =
            serde_json::from_slice(bytes).map_err(|e| SentinelError::Validation(e.to_string()))?;
        self.with_conn("import_templates_json", |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut imported = 0;
            for template in &templates {
                if template_exists(&tx, template.name.trim())? {
                    log::debug!("Skipping existing template '{}'", template.name);
                    continue;
                }
                insert_template(&tx, template, false)?;
                imported += 1;
            }
            tx.commit()?;
            Ok(imported)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_store::model::{MatchType, PolicyAction, TemplateVariable};

    fn store() -> PolicyStore {
        let store = PolicyStore::open_in_memory(&Default::default()).unwrap();
        store.seed_builtin_templates().unwrap();
        store
    }

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitute_escapes_values() {
        let out = substitute(r#"{"a": "{{X}}"}"#, &vars(&[("X", "say \"hi\"")])).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["a"], "say \"hi\"");
    }

    #[test]
    fn test_missing_variable() {
        let err = substitute("{{A}} {{B}}", &vars(&[("A", "1")])).unwrap_err();
        assert!(matches!(err, SentinelError::MissingVariable(ref name) if name == "B"));
    }

    #[test]
    fn test_placeholders_in_order() {
        assert_eq!(
            placeholders("{{ORIGIN}}/{{FILE_HASH}}/{{ORIGIN}}"),
            vec!["ORIGIN", "FILE_HASH"]
        );
    }

    #[test]
    fn test_seed_is_idempotent() {
        let store = store();
        let count = store.list_templates(None).unwrap().len();
        assert_eq!(count, builtin_templates().len());
        assert_eq!(store.seed_builtin_templates().unwrap(), 0);
        assert_eq!(store.list_templates(None).unwrap().len(), count);
    }

    #[test]
    fn test_instantiate_builtin() {
        let store = store();
        let template = store
            .get_template_by_name("Quarantine Downloads From Origin")
            .unwrap()
            .unwrap();
        let policy = store
            .instantiate_template(template.id, &vars(&[("ORIGIN", "https://files.example.com")]))
            .unwrap();
        assert_eq!(policy.action, PolicyAction::Quarantine);
        assert_eq!(policy.match_type, MatchType::Download);
        assert_eq!(
            policy.url_pattern.as_deref(),
            Some("https://files.example.com/%")
        );
        store.create_policy(&policy).unwrap();

        assert!(matches!(
            store.instantiate_template(template.id, &HashMap::new()),
            Err(SentinelError::MissingVariable(_))
        ));
    }

    #[test]
    fn test_builtin_cannot_be_deleted() {
        let store = store();
        let builtin = &store.list_templates(Some("privacy")).unwrap()[0];
        assert!(matches!(
            store.delete_template(builtin.id),
            Err(SentinelError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_user_template_lifecycle_and_defaults() {
        let store = store();
        let template = NewTemplate {
            name: "Warn on forms to host".to_string(),
            description: String::new(),
            category: "custom".to_string(),
            body: r#"{"rule_name": "Warn {{HOST}}", "url_pattern": "https://{{HOST}}/%",
                      "action": "warn_user", "match_type": "third_party_form",
                      "created_by": "{{AUTHOR}}"}"#
                .to_string(),
            variables: vec![TemplateVariable {
                name: "AUTHOR".to_string(),
                description: "Who created the policy".to_string(),
                default_value: Some("admin".to_string()),
            }],
        };
        let id = store.create_template(&template).unwrap();
        assert!(matches!(
            store.create_template(&template),
            Err(SentinelError::ConstraintViolation(_))
        ));

        let policy = store
            .instantiate_template(id, &vars(&[("HOST", "forms.example")]))
            .unwrap();
        assert_eq!(policy.created_by, "admin");

        let exported = store.export_templates_json().unwrap();
        store.delete_template(id).unwrap();
        assert_eq!(store.import_templates_json(&exported).unwrap(), 1);
        assert_eq!(store.import_templates_json(&exported).unwrap(), 0);
    }

    #[test]
    fn test_invalid_body_rejected() {
        let store = store();
        let template = NewTemplate {
            name: "broken".to_string(),
            description: String::new(),
            category: "custom".to_string(),
            body: r#"{"rule_name": "x", "action": "explode", "match_type": "download",
                      "created_by": "me"}"#
                .to_string(),
            variables: vec![],
        };
        assert!(matches!(
            store.create_template(&template),
            Err(SentinelError::Validation(_))
        ));
    }
}
