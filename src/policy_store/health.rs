use super::model::{MatchType, PolicyAction, RelationshipType};
use super::schema::{self, CURRENT_SCHEMA_VERSION};
use super::PolicyStore;
use crate::error::{IntegrityError, Result, SentinelError};
use rusqlite::Connection;

fn integrity_check(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let messages = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if messages.len() == 1 && messages[0] == "ok" {
        return Ok(());
    }
    Err(IntegrityError::Corrupted(messages.join("; ")).into())
}

fn check_enum_column<T: std::str::FromStr>(
    conn: &Connection,
    table: &'static str,
    column: &str,
) -> Result<()> {
    let sql = format!("SELECT id, {} FROM {}", column, table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let value: String = row.get(1)?;
        if value.parse::<T>().is_err() {
            return Err(IntegrityError::InvalidRow {
                table,
                id,
                reason: format!("unknown {} '{}'", column, value),
            }
            .into());
        }
    }
    Ok(())
}

fn structural_check(conn: &Connection) -> Result<()> {
    integrity_check(conn)?;

    if let Some(table) = schema::missing_tables(conn)?.into_iter().next() {
        return Err(IntegrityError::MissingTable(table).into());
    }

    let version = schema::schema_version(conn)?;
    if version > CURRENT_SCHEMA_VERSION {
        return Err(IntegrityError::SchemaVersion {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        }
        .into());
    }

    check_enum_column::<PolicyAction>(conn, "policies", "action")?;
    check_enum_column::<MatchType>(conn, "policies", "match_type")?;
    check_enum_column::<RelationshipType>(conn, "credential_relationships", "relationship_type")?;
    Ok(())
}

impl PolicyStore {
    /// Cheap liveness check: not in fail-safe mode and able to answer a query.
    pub fn is_healthy(&self) -> bool {
        if self.is_fail_safe() {
            return false;
        }
        self.with_conn("is_healthy", |conn| {
            let _: i64 = conn.query_row("SELECT COUNT(*) FROM policies", [], |row| row.get(0))?;
            Ok(())
        })
        .is_ok()
    }

    /// Full structural check. Failure puts the store into fail-safe mode,
    /// success takes it out again.
    pub fn verify_integrity(&self) -> std::result::Result<(), IntegrityError> {
        let outcome = self.retry.run("verify_integrity", || {
            let conn = self.lock()?;
            structural_check(&conn)
        });
        match outcome {
            Ok(()) => {
                self.clear_fail_safe();
                Ok(())
            }
            Err(SentinelError::Integrity(e)) => {
                self.enter_fail_safe(&e.to_string());
                Err(e)
            }
            Err(e @ SentinelError::Storage { .. }) => {
                self.enter_fail_safe(&e.to_string());
                Err(IntegrityError::Corrupted(e.to_string()))
            }
            Err(e) => Err(IntegrityError::Unverifiable(e.to_string())),
        }
    }

    pub fn vacuum(&self) -> Result<()> {
        self.with_conn("vacuum", |conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })?;
        log::info!("Policy store vacuumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SentinelConfig;

    #[test]
    fn test_fresh_store_is_healthy() {
        let store = PolicyStore::open_in_memory(&SentinelConfig::default()).unwrap();
        assert!(store.is_healthy());
        assert!(store.verify_integrity().is_ok());
        assert!(!store.is_fail_safe());
        store.vacuum().unwrap();
    }

    #[test]
    fn test_missing_table_enters_fail_safe_until_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy_graph.db");
        let store = PolicyStore::open(&path, &SentinelConfig::default()).unwrap();

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("DROP TABLE policy_templates").unwrap();
        }

        assert!(matches!(
            store.verify_integrity(),
            Err(IntegrityError::MissingTable(ref t)) if t == "policy_templates"
        ));
        assert!(store.is_fail_safe());
        assert!(!store.is_healthy());

        store.repair_schema().unwrap();
        assert!(store.verify_integrity().is_ok());
        assert!(store.is_healthy());
    }

    #[test]
    fn test_invalid_enum_row_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy_graph.db");
        let store = PolicyStore::open(&path, &SentinelConfig::default()).unwrap();
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO policies (rule_name, action, match_type, created_at, created_by)
                 VALUES ('x', 'explode', 'download', 0, 'test')",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            store.verify_integrity(),
            Err(IntegrityError::InvalidRow { table: "policies", .. })
        ));
        assert!(store.is_fail_safe());
    }
}
