//! Sessions and transaction boundaries.
//!
//! A [`Database`] is the explicitly constructed handle every component
//! receives by reference; there is no ambient "current session". Work that
//! needs the database takes a `&Session` (or `&mut Session` when it manages
//! transaction boundaries itself).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mistral_core::config::DatabaseConfig;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};

use crate::compat_lock::CompatLocks;
use crate::error::{DbError, Result};
use crate::retry::RetryPolicy;
use crate::schema::init_db;

struct DbInner {
    config: DatabaseConfig,
    retry: RetryPolicy,
    pool: Pool<SqliteConnectionManager>,
    locks: CompatLocks,
    next_session: AtomicU64,
}

/// Cheaply cloneable handle to the shared store.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.config.path)
            .field("pool", &self.inner.pool.state())
            .finish()
    }
}

impl Database {
    /// Build the connection pool described by `config` and run schema
    /// migrations.
    #[instrument(skip(config), fields(path = %config.path))]
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let busy_timeout = config.busy_timeout();
        let pragmas = format!(
            "PRAGMA journal_mode={}; PRAGMA foreign_keys=ON;",
            config.journal_mode.as_pragma()
        );
        let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(&pragmas)
        });

        let max_size = u32::try_from(config.pool_size.max(1)).unwrap_or(u32::MAX);
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .connection_timeout(config.pool_timeout())
            .build(manager)
            .map_err(|e| {
                warn!("failed to create connection pool: {e}");
                DbError::Pool(e)
            })?;

        init_db(&*pool.get()?)?;
        info!("database opened");

        Ok(Self {
            inner: Arc::new(DbInner {
                retry: RetryPolicy::from(&config.retry),
                config,
                pool,
                locks: CompatLocks::new(),
                next_session: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn compat_locks(&self) -> &CompatLocks {
        &self.inner.locks
    }

    /// Check out a session with its own pooled connection. No transaction is
    /// open. Blocks up to `pool_timeout` when every connection is in use.
    pub fn session(&self) -> Result<Session> {
        let conn = self.inner.pool.get()?;
        // a connection whose last session could not close cleanly
        if !conn.is_autocommit() {
            warn!("pooled connection still inside a transaction, rolling back");
            conn.execute_batch("ROLLBACK")?;
        }
        conn.execute_batch("PRAGMA query_only = OFF")?;
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        Ok(Session {
            id,
            conn,
            db: self.clone(),
            tx: None,
        })
    }

    /// Scoped transaction.
    ///
    /// Opens a session, begins a transaction and runs `f`. On `Ok` the
    /// transaction commits (or rolls back when `read_only`); on `Err` it rolls
    /// back. The session is released on every path.
    pub fn transaction<T, E, F>(&self, read_only: bool, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Session) -> std::result::Result<T, E>,
        E: From<DbError>,
    {
        let mut session = self.session()?;
        if read_only {
            session.start_read_only_tx()?;
        } else {
            session.start_tx()?;
        }

        let outcome = f(&mut session);
        let finished = match outcome {
            Ok(value) => {
                let closed = if read_only {
                    session.rollback_tx()
                } else {
                    session.commit_tx()
                };
                closed.map(|_| value).map_err(E::from)
            }
            Err(e) => {
                if let Err(rollback_err) = session.rollback_tx() {
                    warn!(session = session.id, "rollback after failed unit of work failed: {rollback_err}");
                }
                Err(e)
            }
        };
        let id = session.id;
        if let Err(e) = session.end_tx() {
            warn!(session = id, "session release failed: {e}");
        }
        finished
    }

    /// Join the caller's session if given one, otherwise run `f` in a
    /// throwaway transaction.
    ///
    /// A given session without an open transaction gets one for the duration
    /// of `f`; the session itself stays open either way.
    pub fn join_or_begin<T, E, F>(
        &self,
        session: Option<&mut Session>,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Session) -> std::result::Result<T, E>,
        E: From<DbError>,
    {
        match session {
            Some(session) if session.is_tx_active() => f(session),
            Some(session) => {
                session.start_tx()?;
                match f(session) {
                    Ok(value) => {
                        session.commit_tx()?;
                        Ok(value)
                    }
                    Err(e) => {
                        if let Err(rollback_err) = session.rollback_tx() {
                            warn!(session = session.id, "rollback failed: {rollback_err}");
                        }
                        Err(e)
                    }
                }
            }
            None => self.transaction(false, f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxKind {
    ReadWrite,
    ReadOnly,
}

/// A checked-out connection plus its transaction state.
///
/// Compatibility locks taken through [`crate::mutator::acquire_lock`] belong
/// to the session and are released when its transaction ends. The connection
/// goes back to the pool when the session is dropped.
pub struct Session {
    id: u64,
    conn: PooledConnection<SqliteConnectionManager>,
    db: Database,
    tx: Option<TxKind>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tx", &self.tx)
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn conn(&self) -> Result<&Connection> {
        Ok(&self.conn)
    }

    pub fn is_tx_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Fail with [`DbError::NoActiveTransaction`] unless a transaction is open.
    pub fn require_tx(&self) -> Result<()> {
        if self.is_tx_active() {
            Ok(())
        } else {
            Err(DbError::NoActiveTransaction { session: self.id })
        }
    }

    pub fn start_tx(&mut self) -> Result<()> {
        let begin = self.db.inner.config.begin_mode.begin_sql();
        self.begin(TxKind::ReadWrite, begin)
    }

    /// Writes inside a read-only transaction fail with SQLITE_READONLY.
    pub fn start_read_only_tx(&mut self) -> Result<()> {
        self.begin(TxKind::ReadOnly, "PRAGMA query_only = ON; BEGIN DEFERRED")
    }

    fn begin(&mut self, kind: TxKind, sql: &str) -> Result<()> {
        if self.tx.is_some() {
            return Err(DbError::TransactionAlreadyActive { session: self.id });
        }
        if let Err(e) = self.conn.execute_batch(sql) {
            if kind == TxKind::ReadOnly {
                if let Err(reset) = self.conn.execute_batch("PRAGMA query_only = OFF") {
                    warn!(session = self.id, "could not clear query_only: {reset}");
                }
            }
            return Err(e.into());
        }
        self.tx = Some(kind);
        debug!(session = self.id, ?kind, "transaction started");
        Ok(())
    }

    pub fn commit_tx(&mut self) -> Result<()> {
        self.require_tx()?;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            // A failed COMMIT (e.g. BUSY) can leave the transaction open; it
            // stays ours to roll back.
            if self.conn.is_autocommit() {
                self.finish_tx();
            }
            return Err(e.into());
        }
        self.finish_tx();
        debug!(session = self.id, "transaction committed");
        Ok(())
    }

    pub fn rollback_tx(&mut self) -> Result<()> {
        self.require_tx()?;
        let rolled_back = if self.conn.is_autocommit() {
            // SQLite already rolled back on its own (e.g. after SQLITE_FULL).
            Ok(())
        } else {
            self.conn.execute_batch("ROLLBACK")
        };
        self.finish_tx();
        debug!(session = self.id, "transaction rolled back");
        rolled_back.map_err(DbError::from)
    }

    fn finish_tx(&mut self) {
        if self.tx.take() == Some(TxKind::ReadOnly) {
            // retried on the next checkout if this fails
            if let Err(e) = self.conn.execute_batch("PRAGMA query_only = OFF") {
                warn!(session = self.id, "could not clear query_only: {e}");
            }
        }
        self.db.inner.locks.release_all(self.id);
    }

    /// Release the session: roll back an open transaction and release locks.
    /// The connection returns to the pool.
    pub fn end_tx(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let rolled_back = if self.tx.is_some() {
            self.rollback_tx()
        } else {
            Ok(())
        };
        self.db.inner.locks.release_all(self.id);
        rolled_back
    }

    /// Run `f` inside a savepoint of the open transaction. On `Err` only the
    /// savepoint's work is undone; the surrounding transaction stays usable.
    pub fn savepoint<T, E, F>(&mut self, name: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Session) -> std::result::Result<T, E>,
        E: From<DbError>,
    {
        self.require_tx()?;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DbError::InvalidArgument(format!("bad savepoint name: {name}")).into());
        }
        self.exec(&format!("SAVEPOINT {name}"))?;
        match f(self) {
            Ok(value) => {
                self.exec(&format!("RELEASE SAVEPOINT {name}"))?;
                Ok(value)
            }
            Err(e) => {
                self.exec(&format!(
                    "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"
                ))?;
                Err(e)
            }
        }
    }

    fn exec(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(session = self.id, "session released with error: {e}");
        }
    }
}
