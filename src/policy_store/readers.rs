//! Read-only connections for lookups that must not wait on the writer.
//!
//! In WAL mode a reader sees the last committed state while a write
//! transaction is open on the main connection.

use crate::error::Result;
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

pub(crate) struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
    busy_timeout: Duration,
}

impl ReaderPool {
    pub fn new(path: PathBuf, max_idle: usize, busy_timeout: Duration) -> Self {
        Self {
            path,
            idle: Mutex::new(Vec::new()),
            max_idle,
            busy_timeout,
        }
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        log::debug!("Opened read-only connection to {}", self.path.display());
        Ok(conn)
    }

    /// Runs `op` on an idle reader, opening a new one when all are checked out.
    pub fn with_reader<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let pooled = match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        let conn = match pooled {
            Some(conn) => conn,
            None => self.open()?,
        };
        let result = op(&conn);
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(conn);
            }
        }
        result
    }

    /// Closes idle readers so they reopen against the current schema.
    pub fn clear(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}
