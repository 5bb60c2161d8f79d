use super::history::{insert_alert, insert_threat};
use super::model::{
    NewCredentialAlert, NewPolicy, NewRelationship, PolicyAction, PolicyId, RelationshipId,
    ThreatMetadata,
};
use super::{policies, relationships, PolicyStore};
use crate::error::{Result, SentinelError};
use rusqlite::Connection;
use std::sync::MutexGuard;

/// An explicit write transaction holding the store's connection.
///
/// Either `commit` or `rollback` ends it; dropping it uncommitted rolls back.
/// Once any operation inside it fails, `commit` refuses and rolls back instead.
pub struct StoreTransaction<'a> {
    store: &'a PolicyStore,
    conn: MutexGuard<'a, Connection>,
    finished: bool,
    failed: bool,
}

impl<'a> StoreTransaction<'a> {
    pub(crate) fn begin(store: &'a PolicyStore) -> Result<Self> {
        let conn = store.retry.run("begin_transaction", || {
            let conn = store.lock()?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(conn)
        });
        let conn = store.observe(conn)?;
        log::debug!("Policy store transaction started");
        Ok(Self {
            store,
            conn,
            finished: false,
            failed: false,
        })
    }

    fn run<T>(&mut self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.failed {
            return Err(SentinelError::ConstraintViolation(
                "transaction already failed and must be rolled back".to_string(),
            ));
        }
        let result = op(&self.conn);
        if result.is_err() {
            self.failed = true;
        }
        self.store.observe(result)
    }

    pub fn create_policy(&mut self, policy: &NewPolicy) -> Result<PolicyId> {
        self.run(|conn| policies::insert_policy(conn, policy))
    }

    pub fn update_policy(&mut self, id: PolicyId, policy: &NewPolicy) -> Result<()> {
        self.run(|conn| policies::update_policy(conn, id, policy))
    }

    pub fn delete_policy(&mut self, id: PolicyId) -> Result<()> {
        self.run(|conn| policies::delete_policy(conn, id))
    }

    pub fn create_relationship(&mut self, rel: &NewRelationship) -> Result<RelationshipId> {
        self.run(|conn| relationships::upsert_relationship(conn, rel))
    }

    pub fn delete_relationship(&mut self, id: RelationshipId) -> Result<()> {
        self.run(|conn| relationships::delete_relationship(conn, id))
    }

    pub fn record_threat(
        &mut self,
        threat: &ThreatMetadata,
        action_taken: PolicyAction,
        policy_id: Option<PolicyId>,
        alert_payload: &serde_json::Value,
    ) -> Result<i64> {
        self.run(|conn| insert_threat(conn, threat, action_taken, policy_id, alert_payload))
    }

    pub fn record_alert(&mut self, alert: &NewCredentialAlert) -> Result<i64> {
        self.run(|conn| insert_alert(conn, alert))
    }

    pub fn commit(mut self) -> Result<()> {
        if self.failed {
            self.rollback_inner();
            return Err(SentinelError::ConstraintViolation(
                "transaction rolled back after a failed operation".to_string(),
            ));
        }
        self.finished = true;
        let usage = self.store.usage.snapshot();
        let result = usage
            .apply(&self.conn)
            .and_then(|()| self.conn.execute_batch("COMMIT").map_err(SentinelError::from));
        match result {
            Ok(()) => {
                self.store.usage.settle(&usage);
                self.store.cache.invalidate();
                log::debug!("Policy store transaction committed");
                Ok(())
            }
            Err(e) => {
                self.rollback_inner();
                self.store.observe(Err(e))
            }
        }
    }

    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner();
        Ok(())
    }

    fn rollback_inner(&mut self) {
        self.finished = true;
        if self.conn.is_autocommit() {
            return;
        }
        match self.conn.execute_batch("ROLLBACK") {
            Ok(()) => log::debug!("Policy store transaction rolled back"),
            Err(e) => log::error!("Failed to roll back policy store transaction: {}", e),
        }
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!("Policy store transaction dropped without commit, rolling back");
            self.rollback_inner();
        }
    }
}

impl PolicyStore {
    pub fn begin_transaction(&self) -> Result<StoreTransaction<'_>> {
        StoreTransaction::begin(self)
    }

    /// Runs `f` in a transaction, committing on `Ok` and rolling back on `Err`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut StoreTransaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut tx = self.begin_transaction()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_store::model::{MatchType, PolicyFilter, RelationshipType};

    fn store() -> PolicyStore {
        PolicyStore::open_in_memory(&Default::default()).unwrap()
    }

    fn policy(name: &str) -> NewPolicy {
        NewPolicy::new(name, PolicyAction::Block, MatchType::Download)
            .with_url_pattern(format!("https://{}.example/%", name))
    }

    #[test]
    fn test_commit_makes_all_writes_visible() {
        let store = store();
        let mut tx = store.begin_transaction().unwrap();
        tx.create_policy(&policy("one")).unwrap();
        tx.create_policy(&policy("two")).unwrap();
        tx.create_relationship(&NewRelationship::new(
            "https://a.example",
            "https://b.example",
            RelationshipType::Trusted,
        ))
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(store.policy_count().unwrap(), 2);
        assert!(store
            .has_relationship("https://a.example", "https://b.example", RelationshipType::Trusted)
            .unwrap());
    }

    #[test]
    fn test_rollback_discards_everything() {
        let store = store();
        let mut tx = store.begin_transaction().unwrap();
        tx.create_policy(&policy("one")).unwrap();
        tx.create_policy(&policy("two")).unwrap();
        tx.rollback().unwrap();
        assert_eq!(store.policy_count().unwrap(), 0);
    }

    #[test]
    fn test_failed_operation_aborts_transaction() {
        let store = store();
        let result = store.transaction(|tx| {
            tx.create_policy(&policy("kept-until-failure"))?;
            tx.delete_policy(9999)?;
            Ok(())
        });
        assert!(matches!(result, Err(SentinelError::NotFound { .. })));
        assert!(store
            .list_policies(&PolicyFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_commit_refused_after_failure() {
        let store = store();
        let mut tx = store.begin_transaction().unwrap();
        tx.create_policy(&policy("one")).unwrap();
        assert!(tx.delete_policy(424242).is_err());
        assert!(tx.create_policy(&policy("two")).is_err());
        assert!(tx.commit().is_err());
        assert_eq!(store.policy_count().unwrap(), 0);
    }

    #[test]
    fn test_drop_rolls_back() {
        let store = store();
        {
            let mut tx = store.begin_transaction().unwrap();
            tx.create_policy(&policy("dropped")).unwrap();
        }
        assert_eq!(store.policy_count().unwrap(), 0);
    }

    #[test]
    fn test_transaction_times_out_other_writers() {
        let mut config = crate::config::SentinelConfig::default();
        config.storage.lock_timeout_ms = 5;
        config.storage.retry.max_attempts = 1;
        let store = PolicyStore::open_in_memory(&config).unwrap();

        let tx = store.begin_transaction().unwrap();
        assert!(matches!(
            store.create_policy(&policy("blocked")),
            Err(SentinelError::Concurrency(_))
        ));
        tx.rollback().unwrap();
        assert!(store.create_policy(&policy("after")).is_ok());
    }
}
