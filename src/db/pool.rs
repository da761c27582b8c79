//! Bounded pool of reusable database handles.
//!
//! At most `capacity` handles sit idle; `acquire` may temporarily hand out
//! more, and such overflow handles are physically closed on release instead
//! of being queued. A background sweep closes handles that have sat idle too
//! long, preserving FIFO order among the survivors.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tracing::debug;

/// How often the evictor sweeps the idle queue.
const EVICT_INTERVAL: Duration = Duration::from_secs(2);

/// Idle age beyond which a pooled handle is closed.
const MAX_IDLE: Duration = Duration::from_secs(5);

struct IdleConn {
    conn: SqliteConnection,
    last_used: Instant,
}

struct PoolInner {
    options: SqliteConnectOptions,
    capacity: usize,
    idle: Mutex<VecDeque<IdleConn>>,
}

/// Cloning is cheap: clones share the same underlying queue via Arc.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(options: SqliteConnectOptions, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                capacity,
                idle: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Pop an idle handle, or open a new physical one when the queue is
    /// empty. Open failures surface to the caller as system errors.
    pub async fn acquire(&self) -> Result<PooledConn> {
        let reused = {
            let mut idle = self.inner.idle.lock().expect("pool lock poisoned");
            idle.pop_front()
        };

        let conn = match reused {
            Some(entry) => entry.conn,
            None => self.connect_new().await?,
        };

        Ok(PooledConn {
            conn: Some(conn),
            pool: self.inner.clone(),
        })
    }

    /// Open and immediately close one physical handle. Called once at
    /// startup so bad credentials fail before the server starts listening.
    pub async fn test_open(&self) -> Result<()> {
        let conn = self.connect_new().await?;
        conn.close()
            .await
            .context("failed to close test database handle")
    }

    /// Sweep the idle queue every 2 s, closing handles idle longer than 5 s.
    pub fn spawn_evictor(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICT_INTERVAL);
            interval.tick().await; // first tick is immediate: skip it
            loop {
                interval.tick().await;
                let expired = sweep_expired(&inner, MAX_IDLE);
                if !expired.is_empty() {
                    debug!(closed = expired.len(), "Evicted idle database handles");
                }
                for conn in expired {
                    let _ = conn.close().await;
                }
            }
        })
    }

    async fn connect_new(&self) -> Result<SqliteConnection> {
        self.inner
            .options
            .connect()
            .await
            .context("failed to open database handle")
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.inner.idle.lock().expect("pool lock poisoned").len()
    }
}

/// Drain the queue and re-offer the still-fresh handles in their original
/// order; expired handles are returned for closing outside the lock.
fn sweep_expired(inner: &PoolInner, max_idle: Duration) -> Vec<SqliteConnection> {
    let mut idle = inner.idle.lock().expect("pool lock poisoned");
    let mut kept = VecDeque::with_capacity(idle.len());
    let mut expired = Vec::new();
    while let Some(entry) = idle.pop_front() {
        if entry.last_used.elapsed() > max_idle {
            expired.push(entry.conn);
        } else {
            kept.push_back(entry);
        }
    }
    *idle = kept;
    expired
}

/// An acquired handle. Dropping it releases back to the pool: the handle is
/// re-queued with a fresh last-used stamp when the queue is under capacity,
/// otherwise it falls out of scope and closes.
pub struct PooledConn {
    conn: Option<SqliteConnection>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConn {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        self.conn.as_mut().expect("pooled connection already released")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.pool.idle.lock().expect("pool lock poisoned");
            if idle.len() < self.pool.capacity {
                idle.push_back(IdleConn {
                    conn,
                    last_used: Instant::now(),
                });
            }
            // Overflow handles close here when the guard's scope ends.
        }
    }
}
