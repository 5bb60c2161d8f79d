//! Durable policy store: policies, credential relationships, threat and alert
//! history, templates.
//!
//! One `PolicyStore` is shared (behind an `Arc`) by every browsing context.
//! Writes are serialised through a single SQLite connection. File-backed
//! stores answer reads from a pool of read-only WAL connections, so an open
//! write transaction never holds up a lookup. The hot lookup paths
//! (`match_policy`, `has_relationship`) are answered from a generation-tagged
//! cache that every committed write invalidates, and the hit counters they
//! bump are folded into the database by the next write.

pub mod cache;
pub mod health;
pub mod history;
pub mod matcher;
pub mod model;
pub mod policies;
mod readers;
pub mod relationships;
pub mod schema;
pub mod templates;
pub mod transaction;
pub mod transfer;
mod usage;

pub use cache::CacheMetrics;
pub use matcher::{like_match, PolicyMatcher};
pub use model::*;
pub use transaction::StoreTransaction;
pub use transfer::{ImportSummary, PolicyExport};

use crate::config::SentinelConfig;
use crate::error::{Result, SentinelError};
use crate::retry::RetryPolicy;
use anyhow::Context;
use cache::PolicyCache;
use readers::ReaderPool;
use rusqlite::Connection;
use usage::PendingUsage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

const LOCK_POLL_INTERVAL: Duration = Duration::from_micros(250);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CleanupReport {
    pub policies_removed: usize,
    pub relationships_removed: usize,
}

pub struct PolicyStore {
    conn: Mutex<Connection>,
    readers: Option<ReaderPool>,
    usage: PendingUsage,
    cache: PolicyCache,
    matchers: Vec<Box<dyn PolicyMatcher>>,
    retry: RetryPolicy,
    lock_timeout: Duration,
    fail_safe: AtomicBool,
    path: Option<PathBuf>,
}

impl PolicyStore {
    /// Opens (or creates) the database at `path` and brings its schema up to date.
    pub fn open(path: impl AsRef<Path>, config: &SentinelConfig) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create policy store directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open policy store: {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        conn.busy_timeout(config.storage.lock_timeout())?;
        schema::initialize(&conn)
            .with_context(|| format!("Failed to initialise schema in {}", path.display()))?;

        log::info!("Opened policy store at {}", path.display());
        let mut store = Self::from_connection(conn, config, Some(path.to_path_buf()));
        if config.storage.reader_connections > 0 {
            store.readers = Some(ReaderPool::new(
                path.to_path_buf(),
                config.storage.reader_connections,
                config.storage.lock_timeout(),
            ));
        }
        Ok(store)
    }

    /// Store backed by a private in-memory database. Reads share the writer's
    /// connection.
    pub fn open_in_memory(config: &SentinelConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self::from_connection(conn, config, None))
    }

    fn from_connection(conn: Connection, config: &SentinelConfig, path: Option<PathBuf>) -> Self {
        Self {
            conn: Mutex::new(conn),
            readers: None,
            usage: PendingUsage::default(),
            cache: PolicyCache::new(config.policy_cache_size),
            matchers: matcher::default_matchers(),
            retry: RetryPolicy::new(&config.storage.retry),
            lock_timeout: config.storage.lock_timeout(),
            fail_safe: AtomicBool::new(false),
            path,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquires the connection, giving up after the configured lock timeout.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match self.conn.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => {
                    log::warn!("Policy store lock was poisoned, recovering connection");
                    return Ok(poisoned.into_inner());
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(SentinelError::Concurrency(format!(
                            "policy store lock not acquired within {:?}",
                            self.lock_timeout
                        )));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
            }
        }
    }

    /// Passes the result through, entering fail-safe mode on storage failures.
    pub(crate) fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.degrades_store() {
                self.enter_fail_safe(&e.to_string());
            }
        }
        result
    }

    /// Runs a read or single-statement operation with lock timeout and retry.
    pub(crate) fn with_conn<T>(
        &self,
        what: &str,
        mut op: impl FnMut(&Connection) -> Result<T>,
    ) -> Result<T> {
        let result = self.retry.run(what, || {
            let conn = self.lock()?;
            op(&conn)
        });
        self.observe(result)
    }

    /// Runs a read-only operation, on a reader connection when the store has them.
    pub(crate) fn read<T>(
        &self,
        what: &str,
        mut op: impl FnMut(&Connection) -> Result<T>,
    ) -> Result<T> {
        match &self.readers {
            Some(pool) => {
                let result = self.retry.run(what, || pool.with_reader(|conn| op(conn)));
                self.observe(result)
            }
            None => self.with_conn(what, op),
        }
    }

    /// Runs `op` in its own transaction and invalidates the lookup cache on commit.
    /// Pending hit and use counters are committed along with it.
    pub(crate) fn write<T>(
        &self,
        what: &str,
        mut op: impl FnMut(&Connection) -> Result<T>,
    ) -> Result<T> {
        self.with_conn(what, |conn| {
            let tx = rusqlite::Transaction::new_unchecked(
                conn,
                rusqlite::TransactionBehavior::Immediate,
            )?;
            let value = op(&tx)?;
            let usage = self.usage.snapshot();
            usage.apply(&tx)?;
            tx.commit()?;
            self.usage.settle(&usage);
            self.cache.invalidate();
            Ok(value)
        })
    }

    /// Writes pending hit and use counters now instead of with the next write.
    pub fn flush_usage(&self) -> Result<()> {
        if self.usage.snapshot().is_empty() {
            return Ok(());
        }
        self.write("flush_usage", |_| Ok(()))
    }

    pub fn is_fail_safe(&self) -> bool {
        self.fail_safe.load(Ordering::Acquire)
    }

    pub(crate) fn enter_fail_safe(&self, reason: &str) {
        if !self.fail_safe.swap(true, Ordering::AcqRel) {
            log::error!("Policy store entering fail-safe mode: {}", reason);
        }
    }

    pub(crate) fn clear_fail_safe(&self) {
        if self.fail_safe.swap(false, Ordering::AcqRel) {
            log::info!("Policy store recovered, leaving fail-safe mode");
        }
    }

    /// Recreates missing tables and indexes and applies pending migrations.
    pub fn repair_schema(&self) -> Result<()> {
        self.with_conn("repair_schema", schema::initialize)?;
        if let Some(pool) = &self.readers {
            pool.clear();
        }
        self.cache.invalidate();
        Ok(())
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    /// Deletes expired policies and relationships.
    pub fn cleanup_expired(&self) -> Result<CleanupReport> {
        let now_ms = model::to_millis(&model::now());
        let report = self.write("cleanup_expired", |conn| {
            Ok(CleanupReport {
                policies_removed: policies::delete_expired_policies(conn, now_ms)?,
                relationships_removed: relationships::delete_expired_relationships(conn, now_ms)?,
            })
        })?;
        if report.policies_removed + report.relationships_removed > 0 {
            log::info!(
                "Expired {} policies and {} relationships",
                report.policies_removed,
                report.relationships_removed
            );
        }
        Ok(report)
    }
}

impl Drop for PolicyStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush_usage() {
            log::warn!("Dropping unflushed policy hit counters: {}", e);
        }
    }
}
