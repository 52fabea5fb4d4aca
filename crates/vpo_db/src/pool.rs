//! Connection pool with a single serialized writer.
//!
//! Reads get a freshly opened connection per operation; in WAL mode they
//! proceed concurrently without touching the writer. Writes share one cached
//! connection guarded by a `tokio::sync::Mutex`, which is held for the whole
//! critical section of a transaction. The cached writer is health-checked on
//! reuse and replaced if it has gone bad.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::DbError;

struct WriterSlot {
    conn: Option<SqliteConnection>,
    closed: bool,
    /// Set when a transaction guard was dropped without commit or rollback;
    /// the next writer acquisition issues a ROLLBACK before reuse.
    needs_rollback: bool,
}

/// The process-wide database handle.
pub struct DbPool {
    path: PathBuf,
    busy_timeout: Duration,
    writer: Mutex<WriterSlot>,
}

impl DbPool {
    /// Open the pool for a database file, creating parent directories and
    /// the file itself if missing. Does not create the schema; call
    /// [`crate::schema::initialize`] after opening.
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DbError::Schema(format!("cannot create db directory: {e}")))?;
            }
        }

        let pool = Self {
            path: path.to_path_buf(),
            busy_timeout,
            writer: Mutex::new(WriterSlot {
                conn: None,
                closed: false,
                needs_rollback: false,
            }),
        };

        // Open one connection eagerly so a bad path fails here, not on
        // first use.
        let conn = pool.connect().await?;
        pool.writer.lock().await.conn = Some(conn);
        debug!("opened database at {}", path.display());
        Ok(pool)
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout)
            .pragma("temp_store", "MEMORY")
    }

    async fn connect(&self) -> Result<SqliteConnection, DbError> {
        Ok(self.connect_options().connect().await?)
    }

    /// A freshly opened connection scoped to one read operation. The caller
    /// drops it when done; nothing is shared with the writer.
    pub async fn read_connection(&self) -> Result<SqliteConnection, DbError> {
        {
            let slot = self.writer.lock().await;
            if slot.closed {
                return Err(DbError::PoolClosed);
            }
        }
        self.connect().await
    }

    /// Exclusive access to the shared writer connection.
    ///
    /// The cached connection is verified with `SELECT 1` before reuse; if it
    /// is broken a replacement is opened and the stale one closed best
    /// effort.
    pub async fn writer(&self) -> Result<WriterGuard<'_>, DbError> {
        let mut slot = self.writer.lock().await;
        if slot.closed {
            return Err(DbError::PoolClosed);
        }

        if slot.needs_rollback {
            if let Some(conn) = slot.conn.as_mut() {
                if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!("rollback of abandoned transaction failed: {e}");
                    slot.conn = None;
                }
            }
            slot.needs_rollback = false;
        }

        let healthy = match slot.conn.as_mut() {
            Some(conn) => sqlx::query("SELECT 1").execute(&mut *conn).await.is_ok(),
            None => false,
        };
        if !healthy {
            if let Some(old) = slot.conn.take() {
                warn!("cached writer connection is invalid, reconnecting");
                let _ = old.close().await;
            }
            slot.conn = Some(self.connect().await?);
        }

        Ok(WriterGuard { slot })
    }

    /// Run one statement on the writer and return affected rows.
    pub async fn execute_write(&self, sql: &str) -> Result<u64, DbError> {
        let mut guard = self.writer().await?;
        let result = sqlx::query(sql).execute(guard.conn()).await?;
        Ok(result.rows_affected())
    }

    /// Begin a `BEGIN IMMEDIATE` transaction on the writer. Commit or roll
    /// back explicitly; a dropped transaction is rolled back on the next
    /// writer acquisition.
    pub async fn transaction(&self) -> Result<DbTransaction<'_>, DbError> {
        let mut guard = self.writer().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(guard.conn()).await?;
        Ok(DbTransaction {
            guard,
            started_at: Instant::now(),
            warn_after: self.busy_timeout.mul_f64(0.8),
            finished: false,
        })
    }

    /// `SELECT 1` against a short-lived connection.
    pub async fn health_check(&self) -> bool {
        match self.read_connection().await {
            Ok(mut conn) => {
                let ok = sqlx::query("SELECT 1").execute(&mut conn).await.is_ok();
                let _ = conn.close().await;
                ok
            }
            Err(_) => false,
        }
    }

    /// Close the pool. Further use returns [`DbError::PoolClosed`]; the pool
    /// is single-use and cannot be reopened.
    pub async fn close(&self) {
        let mut slot = self.writer.lock().await;
        if let Some(conn) = slot.conn.take() {
            let _ = conn.close().await;
        }
        slot.closed = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }
}

impl Drop for DbPool {
    fn drop(&mut self) {
        if let Ok(slot) = self.writer.try_lock() {
            if !slot.closed {
                warn!("DbPool dropped without close()");
            }
        }
    }
}

/// Exclusive handle to the writer connection.
pub struct WriterGuard<'a> {
    slot: MutexGuard<'a, WriterSlot>,
}

impl WriterGuard<'_> {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        // Invariant: the slot always holds a connection while a guard exists.
        self.slot.conn.as_mut().expect("writer connection present")
    }
}

impl Deref for WriterGuard<'_> {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        self.slot.conn.as_ref().expect("writer connection present")
    }
}

impl DerefMut for WriterGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn()
    }
}

/// An open `BEGIN IMMEDIATE` transaction on the writer connection.
pub struct DbTransaction<'a> {
    guard: WriterGuard<'a>,
    started_at: Instant,
    warn_after: Duration,
    finished: bool,
}

impl DbTransaction<'_> {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        self.guard.conn()
    }

    pub async fn commit(mut self) -> Result<(), DbError> {
        sqlx::query("COMMIT").execute(self.guard.conn()).await?;
        self.finished = true;
        let elapsed = self.started_at.elapsed();
        if elapsed > self.warn_after {
            warn!(
                "slow write transaction: {:.2}s (threshold {:.2}s)",
                elapsed.as_secs_f64(),
                self.warn_after.as_secs_f64()
            );
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), DbError> {
        sqlx::query("ROLLBACK").execute(self.guard.conn()).await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for DbTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.guard.slot.needs_rollback = true;
        }
    }
}

/// Backoff shape for [`with_retry`]. Defaults match the deployment contract:
/// exponential from 100 ms, capped at 5 s, ±10 % jitter, six attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

/// Re-invoke `op` on lock contention with exponential backoff.
///
/// Non-lock errors propagate immediately; the last lock error is returned
/// once attempts are exhausted.
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    with_retry_policy(RetryPolicy::default(), op).await
}

/// [`with_retry`] with an explicit policy.
pub async fn with_retry_policy<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let mut delay = policy.base_delay;
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("database operation succeeded after {} attempt(s)", attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_lock_contention() && attempt < max_attempts => {
                let jitter = rand::thread_rng().gen_range(-policy.jitter..=policy.jitter);
                let sleep_for = delay.mul_f64(1.0 + jitter);
                info!(
                    "database locked (attempt {}/{}), retrying in {:.2}s",
                    attempt,
                    max_attempts,
                    sleep_for.as_secs_f64()
                );
                tokio::time::sleep(sleep_for).await;
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(e) => {
                if e.is_lock_contention() {
                    warn!(
                        "database lock retry exhausted after {} attempts",
                        policy.max_attempts
                    );
                }
                return Err(e);
            }
        }
    }

    unreachable!("retry loop always returns")
}
