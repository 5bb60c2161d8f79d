//! Policy hit and relationship use counters, recorded off the lookup path.
//!
//! Lookups only bump in-memory counters. The next write transaction folds
//! them into the database; reads overlay whatever is still pending.

use super::model::{from_millis, to_millis, CredentialRelationship, Policy, PolicyId, RelationshipId};
use crate::error::Result;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Usage {
    pub count: u64,
    pub last_ms: i64,
}

impl Usage {
    fn bump(&mut self, at_ms: i64) {
        self.count += 1;
        self.last_ms = self.last_ms.max(at_ms);
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct UsageSnapshot {
    policies: HashMap<PolicyId, Usage>,
    relationships: HashMap<RelationshipId, Usage>,
}

impl UsageSnapshot {
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty() && self.relationships.is_empty()
    }

    /// Adds the counters to their rows. Rows deleted meanwhile are skipped.
    pub fn apply(&self, conn: &Connection) -> Result<()> {
        for (id, usage) in &self.policies {
            conn.execute(
                "UPDATE policies SET hit_count = hit_count + ?1,
                     last_hit = MAX(COALESCE(last_hit, 0), ?2) WHERE id = ?3",
                params![usage.count as i64, usage.last_ms, id],
            )?;
        }
        for (id, usage) in &self.relationships {
            conn.execute(
                "UPDATE credential_relationships SET use_count = use_count + ?1,
                     last_used = MAX(COALESCE(last_used, 0), ?2) WHERE id = ?3",
                params![usage.count as i64, usage.last_ms, id],
            )?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct PendingUsage {
    inner: Mutex<UsageSnapshot>,
}

fn settle_map<K: std::hash::Hash + Eq>(pending: &mut HashMap<K, Usage>, flushed: &HashMap<K, Usage>) {
    for (id, done) in flushed {
        let empty = match pending.get_mut(id) {
            Some(usage) => {
                usage.count = usage.count.saturating_sub(done.count);
                usage.count == 0
            }
            None => false,
        };
        if empty {
            pending.remove(id);
        }
    }
}

fn overlay(count: &mut u64, last: &mut Option<chrono::DateTime<chrono::Utc>>, usage: Usage) {
    *count += usage.count;
    let newest = last.as_ref().map(to_millis).unwrap_or(0).max(usage.last_ms);
    *last = Some(from_millis(newest));
}

impl PendingUsage {
    fn guard(&self) -> MutexGuard<'_, UsageSnapshot> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_policy_hit(&self, id: PolicyId, at_ms: i64) {
        self.guard().policies.entry(id).or_default().bump(at_ms);
    }

    pub fn record_relationship_use(&self, id: RelationshipId, at_ms: i64) {
        self.guard().relationships.entry(id).or_default().bump(at_ms);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        self.guard().clone()
    }

    /// Forgets the counters a committed snapshot carried. Anything recorded
    /// after the snapshot was taken stays pending.
    pub fn settle(&self, flushed: &UsageSnapshot) {
        let mut pending = self.guard();
        settle_map(&mut pending.policies, &flushed.policies);
        settle_map(&mut pending.relationships, &flushed.relationships);
    }

    pub fn overlay_policy(&self, policy: &mut Policy) {
        let pending = self.guard().policies.get(&policy.id).copied();
        if let Some(usage) = pending {
            overlay(&mut policy.hit_count, &mut policy.last_hit, usage);
        }
    }

    pub fn overlay_relationship(&self, rel: &mut CredentialRelationship) {
        let pending = self.guard().relationships.get(&rel.id).copied();
        if let Some(usage) = pending {
            overlay(&mut rel.use_count, &mut rel.last_used, usage);
        }
    }
}
