//! Database connection lifecycle for sproutd.
//!
//! Three call paths share this module with different transaction needs:
//! HTTP requests (one deferred transaction per request, committed by the
//! middleware), WebSocket sessions (deferred, read-only in practice,
//! rolled back on release), and broker callbacks (commit-on-write, one
//! handle per classified message).
//!
//! A handle wraps exactly one connection and is never shared between
//! concurrent units of work; the pool is the only object crossed by
//! concurrent acquires.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::{Query, QueryAs, QueryScalar};
use sqlx::{PgConnection, PgPool, Postgres};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::error::AppError;
use crate::state::AppState;

// ═══════════════════════════════════════════════════════════════
// Connection pool manager
// ═══════════════════════════════════════════════════════════════

/// One leased connection. Dropping a pooled lease returns the connection
/// to the pool; dropping an external lease merely unlocks it — external
/// connections are owned by whoever supplied them (test harnesses).
pub enum Lease {
    Pooled(PoolConnection<Postgres>),
    External(OwnedMutexGuard<PgConnection>),
}

impl Lease {
    fn conn(&mut self) -> &mut PgConnection {
        match self {
            Lease::Pooled(conn) => &mut *conn,
            Lease::External(guard) => &mut *guard,
        }
    }
}

/// Hands out connections with an origin flag. An externally supplied
/// connection takes precedence over the pool and is serialized by a
/// mutex, so concurrent units of work still get exclusive use.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    pool: Option<PgPool>,
    external: Option<Arc<Mutex<PgConnection>>>,
}

impl ConnectionPool {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            external: None,
        }
    }

    /// No pool, no external connection. Every acquire fails; used by
    /// tests exercising the unavailable path.
    pub fn unconfigured() -> Self {
        Self::default()
    }

    /// Back the manager with one externally owned connection instead of
    /// a pool (single-threaded test harnesses).
    pub fn with_external(conn: PgConnection) -> Self {
        Self {
            pool: None,
            external: Some(Arc::new(Mutex::new(conn))),
        }
    }

    /// `(lease, from_pool)`. Fails only when neither source exists —
    /// a startup misconfiguration, not a per-request condition.
    pub async fn acquire(&self) -> Result<(Lease, bool), AppError> {
        if let Some(external) = &self.external {
            let guard = Arc::clone(external).lock_owned().await;
            return Ok((Lease::External(guard), false));
        }
        if let Some(pool) = &self.pool {
            let conn = pool.acquire().await?;
            return Ok((Lease::Pooled(conn), true));
        }
        Err(AppError::PoolUnavailable)
    }

    /// Acquire and wrap in a scoped handle in one step.
    pub async fn handle(&self, policy: CommitPolicy) -> Result<DbHandle, AppError> {
        let (lease, from_pool) = self.acquire().await?;
        Ok(DbHandle::new(lease, from_pool, policy))
    }
}

// ═══════════════════════════════════════════════════════════════
// Scoped database handle
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Every successful write commits immediately. Broker-driven work,
    /// where no outer transaction exists.
    CommitOnWrite,
    /// Commit belongs to the enclosing unit of work. HTTP requests,
    /// where the whole request is one transaction.
    Defer,
}

struct Slot {
    lease: Option<Lease>,
    tx_open: bool,
}

impl Slot {
    fn conn(&mut self) -> Result<&mut PgConnection, AppError> {
        self.lease
            .as_mut()
            .map(Lease::conn)
            .ok_or(AppError::HandleReleased)
    }

    async fn ensure_tx(&mut self) -> Result<(), AppError> {
        if !self.tx_open {
            sqlx::query("BEGIN").execute(self.conn()?).await?;
            self.tx_open = true;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), AppError> {
        if self.tx_open {
            sqlx::query("COMMIT").execute(self.conn()?).await?;
            self.tx_open = false;
        }
        Ok(())
    }

    /// Best-effort: a rollback that itself fails only gets logged —
    /// the lease is going back either way.
    async fn rollback(&mut self) {
        if !self.tx_open {
            return;
        }
        self.tx_open = false;
        if let Some(lease) = self.lease.as_mut() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(lease.conn()).await {
                warn!("rollback failed: {e}");
            }
        }
    }
}

/// Wraps one connection for one logical unit of work.
///
/// Calls are serialized by an internal mutex (single connection, no
/// concurrent statement use). Any failed operation rolls back the open
/// transaction before the error is returned, so no partial write ever
/// survives into the next operation on the same connection.
pub struct DbHandle {
    slot: Mutex<Slot>,
    from_pool: bool,
    policy: CommitPolicy,
}

impl DbHandle {
    fn new(lease: Lease, from_pool: bool, policy: CommitPolicy) -> Self {
        Self {
            slot: Mutex::new(Slot {
                lease: Some(lease),
                tx_open: false,
            }),
            from_pool,
            policy,
        }
    }

    pub fn from_pool(&self) -> bool {
        self.from_pool
    }

    pub async fn fetch_all<'q, T>(
        &self,
        query: QueryAs<'q, Postgres, T, PgArguments>,
    ) -> Result<Vec<T>, AppError>
    where
        T: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow>,
    {
        let mut slot = self.slot.lock().await;
        slot.ensure_tx().await?;
        match query.fetch_all(slot.conn()?).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                slot.rollback().await;
                Err(e.into())
            }
        }
    }

    pub async fn fetch_optional<'q, T>(
        &self,
        query: QueryAs<'q, Postgres, T, PgArguments>,
    ) -> Result<Option<T>, AppError>
    where
        T: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow>,
    {
        let mut slot = self.slot.lock().await;
        slot.ensure_tx().await?;
        match query.fetch_optional(slot.conn()?).await {
            Ok(row) => Ok(row),
            Err(e) => {
                slot.rollback().await;
                Err(e.into())
            }
        }
    }

    /// Single-value write query (INSERT … RETURNING id). Counts as a
    /// write for the commit policy.
    pub async fn fetch_scalar<'q, T>(
        &self,
        query: QueryScalar<'q, Postgres, T, PgArguments>,
    ) -> Result<T, AppError>
    where
        T: Send + Unpin,
        (T,): for<'r> sqlx::FromRow<'r, PgRow>,
    {
        let mut slot = self.slot.lock().await;
        slot.ensure_tx().await?;
        match query.fetch_one(slot.conn()?).await {
            Ok(value) => {
                self.finish_write(&mut slot).await?;
                Ok(value)
            }
            Err(e) => {
                slot.rollback().await;
                Err(e.into())
            }
        }
    }

    /// Returns the affected-row count.
    pub async fn execute<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Result<u64, AppError> {
        let mut slot = self.slot.lock().await;
        slot.ensure_tx().await?;
        match query.execute(slot.conn()?).await {
            Ok(done) => {
                self.finish_write(&mut slot).await?;
                Ok(done.rows_affected())
            }
            Err(e) => {
                slot.rollback().await;
                Err(e.into())
            }
        }
    }

    async fn finish_write(&self, slot: &mut Slot) -> Result<(), AppError> {
        if self.policy == CommitPolicy::CommitOnWrite {
            if let Err(e) = slot.commit().await {
                slot.rollback().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Commit the open transaction, if any. Called by the enclosing unit
    /// of work under the defer policy.
    pub async fn commit(&self) -> Result<(), AppError> {
        let mut slot = self.slot.lock().await;
        if slot.lease.is_none() {
            return Ok(());
        }
        if let Err(e) = slot.commit().await {
            slot.rollback().await;
            return Err(e);
        }
        Ok(())
    }

    /// Give the connection back. Uncommitted work is rolled back first.
    /// Idempotent, so every exit path can call it and the underlying
    /// lease is still returned exactly once.
    pub async fn release(&self) {
        let mut slot = self.slot.lock().await;
        if slot.lease.is_none() {
            return;
        }
        slot.rollback().await;
        slot.lease = None;
    }
}

// ═══════════════════════════════════════════════════════════════
// Per-request binding (HTTP) and per-message binding (broker)
// ═══════════════════════════════════════════════════════════════

/// Axum middleware: one deferred-policy handle per request, injected as
/// a request extension. Commits at the end for pooled connections only —
/// an externally supplied connection's transaction belongs to its owner.
pub async fn db_session(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let handle = match state.db.handle(CommitPolicy::Defer).await {
        Ok(handle) => Arc::new(handle),
        Err(e) => return e.into_response(),
    };
    req.extensions_mut().insert(Arc::clone(&handle));

    let response = next.run(req).await;

    if handle.from_pool() {
        if let Err(e) = handle.commit().await {
            handle.release().await;
            return e.into_response();
        }
    }
    handle.release().await;
    response
}

/// Run one broker-driven unit of work under a fresh commit-on-write
/// handle. The handle is committed (pooled leases) and released on every
/// path out.
pub async fn with_db<F, Fut, T>(pool: &ConnectionPool, f: F) -> Result<T, AppError>
where
    F: FnOnce(Arc<DbHandle>) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let handle = Arc::new(pool.handle(CommitPolicy::CommitOnWrite).await?);
    let result = match f(Arc::clone(&handle)).await {
        Ok(value) => {
            if handle.from_pool() {
                handle.commit().await.map(|_| value)
            } else {
                Ok(value)
            }
        }
        Err(e) => Err(e),
    };
    handle.release().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_fails_without_pool_or_external() {
        let pool = ConnectionPool::unconfigured();
        let err = match pool.acquire().await {
            Ok(_) => panic!("expected PoolUnavailable"),
            Err(e) => e,
        };
        assert!(matches!(err, AppError::PoolUnavailable));
    }

    #[tokio::test]
    async fn handle_fails_without_pool_or_external() {
        let pool = ConnectionPool::unconfigured();
        assert!(matches!(
            pool.handle(CommitPolicy::Defer).await,
            Err(AppError::PoolUnavailable)
        ));
    }
}
