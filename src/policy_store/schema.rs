use crate::error::{IntegrityError, Result};
use rusqlite::{params, Connection, OptionalExtension};

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

pub const TABLES: &[&str] = &[
    "policies",
    "threat_history",
    "credential_relationships",
    "credential_alerts",
    "policy_templates",
];

const BASE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS policies (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_name   TEXT    NOT NULL,
        url_pattern TEXT,
        file_hash   TEXT,
        mime_type   TEXT,
        action      TEXT    NOT NULL,
        match_type  TEXT    NOT NULL,
        created_at  INTEGER NOT NULL,
        created_by  TEXT    NOT NULL,
        expires_at  INTEGER,
        hit_count   INTEGER NOT NULL DEFAULT 0,
        last_hit    INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_policies_rule_name   ON policies(rule_name);
    CREATE INDEX IF NOT EXISTS idx_policies_file_hash   ON policies(file_hash);
    CREATE INDEX IF NOT EXISTS idx_policies_url_pattern ON policies(url_pattern);

    CREATE TABLE IF NOT EXISTS threat_history (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        detected_at  INTEGER NOT NULL,
        url          TEXT    NOT NULL,
        filename     TEXT    NOT NULL,
        file_hash    TEXT    NOT NULL,
        mime_type    TEXT    NOT NULL,
        file_size    INTEGER NOT NULL,
        rule_name    TEXT    NOT NULL,
        severity     TEXT    NOT NULL,
        action_taken TEXT    NOT NULL,
        policy_id    INTEGER,
        alert_json   TEXT    NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_threats_detected_at ON threat_history(detected_at);
    CREATE INDEX IF NOT EXISTS idx_threats_rule_name   ON threat_history(rule_name);

    CREATE TABLE IF NOT EXISTS credential_relationships (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        form_origin       TEXT    NOT NULL,
        action_origin     TEXT    NOT NULL,
        relationship_type TEXT    NOT NULL,
        created_at        INTEGER NOT NULL,
        created_by        TEXT    NOT NULL,
        last_used         INTEGER,
        use_count         INTEGER NOT NULL DEFAULT 0,
        expires_at        INTEGER,
        notes             TEXT    NOT NULL DEFAULT '',
        UNIQUE(form_origin, action_origin, relationship_type)
    );
    CREATE INDEX IF NOT EXISTS idx_relationships_origins
        ON credential_relationships(form_origin, action_origin);

    CREATE TABLE IF NOT EXISTS credential_alerts (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        detected_at        INTEGER NOT NULL,
        form_origin        TEXT    NOT NULL,
        action_origin      TEXT    NOT NULL,
        alert_type         TEXT    NOT NULL,
        severity           TEXT    NOT NULL,
        has_password_field INTEGER NOT NULL DEFAULT 0,
        has_email_field    INTEGER NOT NULL DEFAULT 0,
        has_hidden_fields  INTEGER NOT NULL DEFAULT 0,
        is_cross_origin    INTEGER NOT NULL DEFAULT 0,
        uses_https         INTEGER NOT NULL DEFAULT 0,
        user_action        TEXT,
        policy_id          INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_alerts_form_origin ON credential_alerts(form_origin);
    CREATE INDEX IF NOT EXISTS idx_alerts_detected_at ON credential_alerts(detected_at);

    CREATE TABLE IF NOT EXISTS policy_templates (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT    NOT NULL UNIQUE,
        description TEXT    NOT NULL DEFAULT '',
        category    TEXT    NOT NULL,
        body        TEXT    NOT NULL,
        variables   TEXT    NOT NULL DEFAULT '[]',
        is_builtin  INTEGER NOT NULL DEFAULT 0,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_templates_category ON policy_templates(category);

    CREATE TABLE IF NOT EXISTS schema_version (
        version    INTEGER PRIMARY KEY,
        applied_at INTEGER NOT NULL
    );
";

struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "anomaly scoring columns on credential alerts",
        sql: "ALTER TABLE credential_alerts ADD COLUMN anomaly_score REAL NOT NULL DEFAULT 0;
              ALTER TABLE credential_alerts ADD COLUMN anomaly_indicators TEXT NOT NULL DEFAULT '[]';",
    },
    Migration {
        version: 2,
        description: "matching and expiry performance indexes",
        sql: "CREATE INDEX IF NOT EXISTS idx_policies_hash_expiry ON policies(file_hash, expires_at);
              CREATE INDEX IF NOT EXISTS idx_policies_expires_at ON policies(expires_at);
              CREATE INDEX IF NOT EXISTS idx_policies_last_hit ON policies(last_hit);
              CREATE INDEX IF NOT EXISTS idx_policies_action ON policies(action);
              CREATE INDEX IF NOT EXISTS idx_relationships_expires_at
                  ON credential_relationships(expires_at);",
    },
];

pub fn schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Creates missing tables and applies pending migrations in one transaction.
pub fn initialize(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(BASE_SCHEMA)?;

    let current = schema_version(&tx)?;
    if current > CURRENT_SCHEMA_VERSION {
        return Err(IntegrityError::SchemaVersion {
            found: current,
            supported: CURRENT_SCHEMA_VERSION,
        }
        .into());
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        log::info!(
            "Applying policy store migration v{}: {}",
            migration.version,
            migration.description
        );
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, chrono::Utc::now().timestamp_millis()],
        )?;
    }

    tx.commit()?;
    Ok(())
}

pub fn missing_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for table in TABLES.iter().chain(std::iter::once(&"schema_version")) {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table],
            |row| row.get(0),
        )?;
        if !exists {
            missing.push(table.to_string());
        }
    }
    Ok(missing)
}
