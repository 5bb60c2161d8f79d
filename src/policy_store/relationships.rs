use super::cache::CachedLookup;
use super::model::{
    from_millis, now, to_millis, CredentialRelationship, NewRelationship, RelationshipId,
    RelationshipType,
};
use super::PolicyStore;
use crate::error::{Result, SentinelError};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(crate) const RELATIONSHIP_COLUMNS: &str = "id, form_origin, action_origin, relationship_type,
     created_at, created_by, last_used, use_count, expires_at, notes";

const MAX_ORIGIN_LEN: usize = 2048;

pub(crate) fn row_to_relationship(row: &Row<'_>) -> rusqlite::Result<CredentialRelationship> {
    Ok(CredentialRelationship {
        id: row.get(0)?,
        form_origin: row.get(1)?,
        action_origin: row.get(2)?,
        relationship_type: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        created_by: row.get(5)?,
        last_used: row.get::<_, Option<i64>>(6)?.map(from_millis),
        use_count: row.get::<_, i64>(7)?.max(0) as u64,
        expires_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
        notes: row.get(9)?,
    })
}

fn check_origin(field: &str, origin: &str) -> Result<()> {
    if origin.trim().is_empty() {
        return Err(SentinelError::Validation(format!("{} is required", field)));
    }
    if origin.len() > MAX_ORIGIN_LEN || origin.chars().any(char::is_control) {
        return Err(SentinelError::Validation(format!("{} is malformed", field)));
    }
    Ok(())
}

pub(crate) fn validate_relationship(rel: &NewRelationship) -> Result<()> {
    check_origin("form_origin", &rel.form_origin)?;
    check_origin("action_origin", &rel.action_origin)?;
    if rel.created_by.trim().is_empty() {
        return Err(SentinelError::Validation("created_by is required".to_string()));
    }
    Ok(())
}

/// Inserts the relationship, or bumps `use_count` on the existing row for the
/// same (form, action, type) triple.
pub(crate) fn upsert_relationship(
    conn: &Connection,
    rel: &NewRelationship,
) -> Result<RelationshipId> {
    validate_relationship(rel)?;
    let now_ms = to_millis(&now());

    let existing: Option<RelationshipId> = conn
        .query_row(
            "SELECT id FROM credential_relationships
             WHERE form_origin = ?1 AND action_origin = ?2 AND relationship_type = ?3",
            params![rel.form_origin, rel.action_origin, rel.relationship_type],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE credential_relationships
             SET use_count = use_count + 1, last_used = ?1,
                 expires_at = ?2,
                 notes = CASE WHEN ?3 = '' THEN notes ELSE ?3 END
             WHERE id = ?4",
            params![
                now_ms,
                rel.expires_at.as_ref().map(to_millis),
                rel.notes,
                id
            ],
        )?;
        log::debug!(
            "Relationship {} -> {} ({}) already present, use_count bumped",
            rel.form_origin,
            rel.action_origin,
            rel.relationship_type
        );
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO credential_relationships (form_origin, action_origin, relationship_type,
             created_at, created_by, last_used, use_count, expires_at, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, ?6, ?7)",
        params![
            rel.form_origin,
            rel.action_origin,
            rel.relationship_type,
            now_ms,
            rel.created_by,
            rel.expires_at.as_ref().map(to_millis),
            rel.notes,
        ],
    )?;
    let id = conn.last_insert_rowid();
    log::info!(
        "Recorded {} relationship {} -> {}",
        rel.relationship_type,
        rel.form_origin,
        rel.action_origin
    );
    Ok(id)
}

pub(crate) fn get_relationship(
    conn: &Connection,
    form_origin: &str,
    action_origin: &str,
    relationship_type: RelationshipType,
) -> Result<Option<CredentialRelationship>> {
    let sql = format!(
        "SELECT {} FROM credential_relationships
         WHERE form_origin = ?1 AND action_origin = ?2 AND relationship_type = ?3",
        RELATIONSHIP_COLUMNS
    );
    Ok(conn
        .query_row(
            &sql,
            params![form_origin, action_origin, relationship_type],
            row_to_relationship,
        )
        .optional()?)
}

pub(crate) fn list_relationships(
    conn: &Connection,
    relationship_type: Option<RelationshipType>,
) -> Result<Vec<CredentialRelationship>> {
    let mut sql = format!("SELECT {} FROM credential_relationships", RELATIONSHIP_COLUMNS);
    if relationship_type.is_some() {
        sql.push_str(" WHERE relationship_type = ?1");
    }
    sql.push_str(" ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = match relationship_type {
        Some(kind) => stmt.query_map(params![kind], row_to_relationship)?,
        None => stmt.query_map([], row_to_relationship)?,
    };
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn delete_relationship(conn: &Connection, id: RelationshipId) -> Result<()> {
    let removed = conn.execute(
        "DELETE FROM credential_relationships WHERE id = ?1",
        params![id],
    )?;
    if removed == 0 {
        return Err(SentinelError::not_found("relationship", id));
    }
    Ok(())
}

pub(crate) fn delete_expired_relationships(conn: &Connection, now_ms: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM credential_relationships WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![now_ms],
    )?)
}

impl PolicyStore {
    pub fn create_relationship(&self, rel: &NewRelationship) -> Result<RelationshipId> {
        self.write("create_relationship", |conn| upsert_relationship(conn, rel))
    }

    /// True when a live relationship of this type exists for the pair.
    pub fn has_relationship(
        &self,
        form_origin: &str,
        action_origin: &str,
        relationship_type: RelationshipType,
    ) -> Result<bool> {
        let key = (
            form_origin.to_string(),
            action_origin.to_string(),
            relationship_type,
        );
        let now_ms = to_millis(&now());

        match self.cache.get_relationship(&key) {
            Some(None) => return Ok(false),
            Some(Some(hit)) if hit.is_live(now_ms) => return Ok(true),
            _ => {}
        }

        let generation = self.cache.generation();
        let found = self.read("has_relationship", |conn| {
            let rel = get_relationship(conn, form_origin, action_origin, relationship_type)?;
            Ok(rel.map(|rel| CachedLookup {
                id: rel.id,
                expires_at: rel.expires_at.as_ref().map(to_millis),
            }))
        })?;
        self.cache.put_relationship(key, found, generation);
        Ok(found.map(|hit| hit.is_live(now_ms)).unwrap_or(false))
    }

    pub fn get_relationship(
        &self,
        form_origin: &str,
        action_origin: &str,
        relationship_type: RelationshipType,
    ) -> Result<Option<CredentialRelationship>> {
        let mut rel = self.read("get_relationship", |conn| {
            get_relationship(conn, form_origin, action_origin, relationship_type)
        })?;
        if let Some(rel) = rel.as_mut() {
            self.usage.overlay_relationship(rel);
        }
        Ok(rel)
    }

    pub fn list_relationships(
        &self,
        relationship_type: Option<RelationshipType>,
    ) -> Result<Vec<CredentialRelationship>> {
        let mut rels = self.read("list_relationships", |conn| {
            list_relationships(conn, relationship_type)
        })?;
        for rel in &mut rels {
            self.usage.overlay_relationship(rel);
        }
        Ok(rels)
    }

    /// Records one more use of a relationship. The counter is written with
    /// the next write transaction, so this never waits on the writer.
    pub fn touch_relationship(&self, id: RelationshipId) -> Result<()> {
        self.usage.record_relationship_use(id, to_millis(&now()));
        Ok(())
    }

    pub fn delete_relationship(&self, id: RelationshipId) -> Result<()> {
        self.write("delete_relationship", |conn| delete_relationship(conn, id))
    }
}
