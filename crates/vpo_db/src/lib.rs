//! Embedded storage engine for VPO.
//!
//! One SQLite database in WAL mode backs everything. Exactly one process
//! opens it; inside the process, writes serialize through a single cached
//! writer connection behind a mutex while reads open short-lived
//! connections of their own, so they never contend with the writer.
//!
//! ```rust,ignore
//! let pool = DbPool::open(&db_path, Duration::from_secs(10)).await?;
//! schema::initialize(&pool).await?;
//!
//! let mut tx = pool.transaction().await?;
//! sqlx::query("INSERT INTO files ...").execute(tx.conn()).await?;
//! tx.commit().await?;
//! ```

pub mod analysis;
pub mod error;
pub mod files;
pub mod pool;
pub mod schema;
pub mod stats;

pub use error::DbError;
pub use pool::{with_retry, DbPool, DbTransaction, RetryPolicy, WriterGuard};
