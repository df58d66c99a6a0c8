//! Connection pool management.
//!
//! # Responsibilities
//! - Keep reusable connections per backend, bounded by `max_size`
//! - Hand out connections as RAII guards returned on drop
//! - Discard idle, dead or broken connections
//!
//! # Design Decisions
//! - A semaphore bounds checked-out connections; idle ones hold no permit, so
//!   `max_size` caps concurrent calls and the idle list is trimmed separately
//! - Waiting for a slot is bounded by `acquire_timeout`; running out is
//!   `PoolError::Exhausted`, never a backend failure
//! - A closed pool destroys whatever is released into it

use std::collections::{BTreeMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::load_balancer::backend::{BackendDescriptor, BackendId};
use crate::load_balancer::registry::BackendRegistry;
use crate::observability::metrics;
use crate::transport::{Connection, TransportError};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool for '{backend}' exhausted after {waited_ms}ms")]
    Exhausted { backend: BackendId, waited_ms: u64 },

    #[error("failed to establish connection: {0}")]
    Connect(#[from] TransportError),

    #[error("acquire cancelled")]
    Cancelled,

    #[error("pool closed")]
    Closed,
}

impl PoolError {
    fn label(&self) -> &'static str {
        match self {
            PoolError::Exhausted { .. } => "exhausted",
            PoolError::Connect(_) => "connect_error",
            PoolError::Cancelled => "cancelled",
            PoolError::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub checked_out: usize,
    pub max_size: usize,
}

#[derive(Debug)]
struct IdleConnection {
    conn: Connection,
    idle_since: Instant,
}

#[derive(Debug)]
pub struct ConnectionPool {
    descriptor: BackendDescriptor,
    config: PoolConfig,
    connect_timeout: Duration,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    checked_out: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(descriptor: BackendDescriptor, config: &PoolConfig, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            config: config.clone(),
            connect_timeout,
            slots: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(VecDeque::new()),
            checked_out: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn backend_id(&self) -> &BackendId {
        &self.descriptor.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Check out a connection, reusing an idle one when possible.
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Result<PooledConnection, PoolError> {
        let result = self.acquire_inner(cancel).await;
        let label = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::record_pool_acquire(self.descriptor.id.as_str(), label);
        result
    }

    async fn acquire_inner(self: &Arc<Self>, cancel: &CancellationToken) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let started = Instant::now();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            waited = tokio::time::timeout(self.config.acquire_timeout(), self.slots.clone().acquire_owned()) => {
                match waited {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(PoolError::Closed),
                    Err(_) => {
                        tracing::warn!(
                            backend = %self.descriptor.id,
                            max_size = self.config.max_size,
                            "Connection pool exhausted"
                        );
                        return Err(PoolError::Exhausted {
                            backend: self.descriptor.id.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                }
            }
        };

        if let Some(conn) = self.take_idle() {
            return Ok(PooledConnection::new(self.clone(), conn, permit));
        }

        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            established = Connection::establish(&self.descriptor, self.connect_timeout) => established?,
        };
        tracing::debug!(backend = %self.descriptor.id, transport = %conn.kind(), "Established backend connection");
        Ok(PooledConnection::new(self.clone(), conn, permit))
    }

    fn take_idle(&self) -> Option<Connection> {
        let idle_timeout = self.config.idle_timeout();
        let mut idle = self.idle.lock();
        while let Some(mut entry) = idle.pop_back() {
            if entry.idle_since.elapsed() >= idle_timeout {
                continue;
            }
            if entry.conn.is_alive() {
                return Some(entry.conn);
            }
        }
        None
    }

    /// Give a connection back. Dead connections and closed pools destroy it.
    pub fn release(&self, mut conn: Connection) {
        if self.is_closed() || !conn.is_alive() {
            return;
        }
        self.idle.lock().push_back(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
    }

    /// Establish connections until `min_idle` are idle.
    pub async fn warm(self: &Arc<Self>) -> Result<usize, PoolError> {
        let mut opened = 0;
        while self.idle.lock().len() < self.config.min_idle && !self.is_closed() {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let conn = Connection::establish(&self.descriptor, self.connect_timeout).await?;
            drop(permit);
            self.release(conn);
            opened += 1;
        }
        Ok(opened)
    }

    /// Drop idle connections older than `idle_timeout`.
    pub fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|entry| entry.idle_since.elapsed() < idle_timeout);
        before - idle.len()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.close();
        let dropped = {
            let mut idle = self.idle.lock();
            let n = idle.len();
            idle.clear();
            n
        };
        tracing::debug!(backend = %self.descriptor.id, dropped, "Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            checked_out: self.checked_out.load(Ordering::Acquire),
            max_size: self.config.max_size,
        }
    }
}

/// A checked-out connection. Returned to its pool on drop.
#[derive(Debug)]
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Connection>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, conn: Connection, permit: OwnedSemaphorePermit) -> Self {
        pool.checked_out.fetch_add(1, Ordering::AcqRel);
        Self {
            pool,
            conn: Some(conn),
            broken: false,
            _permit: permit,
        }
    }

    /// Destroy the connection instead of returning it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn backend_id(&self) -> &BackendId {
        self.pool.backend_id()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.broken {
                self.pool.release(conn);
            }
        }
        self.pool.checked_out.fetch_sub(1, Ordering::AcqRel);
        // The permit drops after the connection is back in the idle list.
    }
}

/// Pools for every backend of one generation.
#[derive(Debug, Default)]
pub struct PoolSet {
    pools: BTreeMap<BackendId, Arc<ConnectionPool>>,
}

impl PoolSet {
    pub fn new(registry: &BackendRegistry, config: &PoolConfig, connect_timeout: Duration) -> Self {
        let pools = registry
            .iter()
            .map(|backend| {
                let pool = ConnectionPool::new(backend.descriptor.clone(), config, connect_timeout);
                (backend.id().clone(), pool)
            })
            .collect();
        Self { pools }
    }

    pub fn get(&self, id: &BackendId) -> Option<&Arc<ConnectionPool>> {
        self.pools.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BackendId, &Arc<ConnectionPool>)> {
        self.pools.iter()
    }

    /// Warm every pool; failures are logged, not fatal.
    pub async fn warm_all(&self) {
        for (id, pool) in &self.pools {
            if let Err(e) = pool.warm().await {
                tracing::warn!(backend = %id, error = %e, "Failed to warm connection pool");
            }
        }
    }

    pub fn evict_idle(&self) -> usize {
        self.pools.values().map(|pool| pool.evict_idle()).sum()
    }

    pub fn close_all(&self) {
        for pool in self.pools.values() {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    fn descriptor() -> BackendDescriptor {
        BackendDescriptor {
            id: BackendId::new("http-backend"),
            transport: TransportKind::Http,
            // HTTP connections are lazy; nothing is dialed until a send.
            endpoint: "http://127.0.0.1:9/rpc".into(),
            args: Vec::new(),
            env: Default::default(),
            weight: 1,
            handshake: false,
        }
    }

    fn pool(max_size: usize) -> Arc<ConnectionPool> {
        let config = PoolConfig {
            min_idle: 0,
            max_size,
            idle_timeout_secs: 60,
            acquire_timeout_ms: 100,
        };
        ConnectionPool::new(descriptor(), &config, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_connection_returns_on_drop() {
        let pool = pool(1);
        let cancel = CancellationToken::new();

        let conn = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.stats(), PoolStats { idle: 0, checked_out: 1, max_size: 1 });
        drop(conn);
        assert_eq!(pool.stats(), PoolStats { idle: 1, checked_out: 0, max_size: 1 });

        let _again = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_acquire_timeout() {
        let pool = pool(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();

        let err = pool.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { waited_ms, .. } if waited_ms >= 100));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let pool = pool(1);
        let cancel = CancellationToken::new();
        let held = pool.acquire(&cancel).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_acquire() {
        let pool = pool(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();

        let other = CancellationToken::new();
        other.cancel();
        assert!(matches!(pool.acquire(&other).await, Err(PoolError::Cancelled)));
    }

    #[tokio::test]
    async fn test_broken_connection_is_destroyed() {
        let pool = pool(2);
        let cancel = CancellationToken::new();
        let mut conn = pool.acquire(&cancel).await.unwrap();
        conn.mark_broken();
        drop(conn);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_and_destroys() {
        let pool = pool(2);
        let cancel = CancellationToken::new();
        let conn = pool.acquire(&cancel).await.unwrap();

        pool.close();
        // Still out after close until its holder lets go.
        assert_eq!(pool.stats().checked_out, 1);
        drop(conn);
        assert_eq!(pool.stats().checked_out, 0);
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(pool.acquire(&cancel).await, Err(PoolError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle() {
        let pool = pool(2);
        let cancel = CancellationToken::new();
        drop(pool.acquire(&cancel).await.unwrap());
        assert_eq!(pool.evict_idle(), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.stats().idle, 0);
    }
}
