//! Per-endpoint connection pooling.
//!
//! Each endpoint backs one [`Pool`]: a bounded idle set plus a semaphore
//! capping total live connections. A checkout holds a semaphore permit for
//! as long as the connection is out, so `idle + in_use` can never exceed
//! `max_total_per_pool`. Idle connections are reused newest-first, must pass
//! a liveness probe, and are evicted once they outlive the idle timeout.
//! Broken connections are closed on release and never handed out again.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ClientConfig;
use crate::conn::Connection;
use crate::errors::{ClientError, Result};
use crate::types::Endpoint;

/// Bounded set of connections to one endpoint.
pub struct Pool {
    endpoint: Endpoint,
    cfg: Arc<ClientConfig>,
    cancel: CancellationToken,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

/// A connection checked out of a [`Pool`].
///
/// Holds the capacity permit for as long as the connection is out. Return it
/// with [`Pool::release`]; dropping it instead closes the connection and
/// frees the slot.
pub struct PooledConnection {
    conn: Option<Connection>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already released")
    }
}

impl Pool {
    pub fn new(endpoint: Endpoint, cfg: Arc<ClientConfig>, cancel: CancellationToken) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_total_per_pool));
        Self {
            endpoint,
            cfg,
            cancel,
            idle: Mutex::new(Vec::new()),
            permits,
        }
    }

    /// Checks a connection out of the pool.
    ///
    /// Prefers a healthy idle connection, connects a fresh one when capacity
    /// allows, and otherwise waits up to the acquire timeout for a slot.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = match timeout(
            self.cfg.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => return Err(ClientError::PoolExhausted(self.endpoint.to_string())),
        };

        {
            let mut idle = self.idle.lock().await;
            while let Some(mut conn) = idle.pop() {
                if conn.idle_for() < self.cfg.idle_timeout && conn.is_alive() {
                    conn.set_in_use();
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        _permit: permit,
                    });
                }
                debug!(endpoint = %self.endpoint, "discarding stale idle connection");
            }
        }

        let mut conn =
            Connection::connect(&self.endpoint, self.cfg.clone(), self.cancel.child_token())
                .await?;
        conn.set_in_use();
        Ok(PooledConnection {
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Returns a connection to the pool.
    ///
    /// Broken connections are closed and discarded; healthy ones go back to
    /// the idle set unless it is already full.
    pub async fn release(&self, mut lease: PooledConnection) {
        let Some(mut conn) = lease.conn.take() else {
            return;
        };
        if conn.is_broken() || self.cancel.is_cancelled() {
            conn.close().await;
            return;
        }
        conn.set_idle();
        {
            let mut idle = self.idle.lock().await;
            if idle.len() < self.cfg.max_idle_per_pool {
                idle.push(conn);
                return;
            }
        }
        conn.close().await;
    }

    /// Evicts idle connections that have outlived the idle timeout.
    pub async fn sweep(&self) {
        let mut idle = self.idle.lock().await;
        let before = idle.len();
        idle.retain(|conn| conn.idle_for() <= self.cfg.idle_timeout);
        let evicted = before - idle.len();
        if evicted > 0 {
            debug!(endpoint = %self.endpoint, evicted, "evicted idle connections");
        }
    }

    /// Closes the pool: pending and future acquires fail, idle connections
    /// are dropped.
    pub async fn close(&self) {
        self.permits.close();
        self.idle.lock().await.clear();
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Number of connections currently checked out.
    pub fn in_use_count(&self) -> usize {
        self.cfg
            .max_total_per_pool
            .saturating_sub(self.permits.available_permits())
    }
}

/// The map of pools, one per endpoint, created on first use.
pub struct PoolRegistry {
    cfg: Arc<ClientConfig>,
    cancel: CancellationToken,
    pools: Mutex<HashMap<Endpoint, Arc<Pool>>>,
}

impl PoolRegistry {
    pub fn new(cfg: Arc<ClientConfig>, cancel: CancellationToken) -> Self {
        Self {
            cfg,
            cancel,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The pool for `endpoint`, creating it on first use.
    pub async fn pool_for(&self, endpoint: &Endpoint) -> Arc<Pool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(endpoint) {
            return pool.clone();
        }
        debug!(endpoint = %endpoint, "creating connection pool");
        let pool = Arc::new(Pool::new(
            endpoint.clone(),
            self.cfg.clone(),
            self.cancel.clone(),
        ));
        pools.insert(endpoint.clone(), pool.clone());
        pool
    }

    /// Runs one eviction pass over every pool.
    pub async fn sweep(&self) {
        let pools: Vec<Arc<Pool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.sweep().await;
        }
    }

    /// Closes every pool.
    pub async fn close(&self) {
        let pools: Vec<Arc<Pool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.close().await;
        }
    }
}
