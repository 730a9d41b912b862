//! # Connection Pool
//!
//! Purpose: Reuse bloomd connections across calls so concurrent callers
//! amortize TCP handshakes.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A bounded set of idle connections, `initial`
//!    dialed eagerly and the rest lazily up to `max`.
//! 2. **Minimal Locking**: The mutex guards only the idle queue and the live
//!    count; dialing and closing happen outside it.
//! 3. **Block, Then Give Up**: A saturated pool waits on a condvar until a
//!    connection is returned or the caller's deadline elapses.
//! 4. **RAII Release**: `PooledConnection` returns itself on drop, or is
//!    discarded when poisoned.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::context::Context;
use crate::error::{BloomdError, BloomdResult};

/// How often a blocked `get` re-checks caller cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "localhost:8673".
    pub addr: String,
    /// Connections dialed when the pool is built.
    pub initial: usize,
    /// Maximum live connections (idle + checked out).
    pub max: usize,
    /// Dial timeout and default per-call timeout of pooled connections. Also
    /// bounds how long `get` waits when the caller has no deadline.
    pub timeout: Duration,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle or checked out.
    pub live: usize,
    /// Connections waiting in the idle queue.
    pub idle: usize,
}

struct PoolState {
    idle: VecDeque<Connection>,
    live: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Bounded pool of bloomd connections. Clones share the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Builds a pool and dials `initial` connections up front.
    ///
    /// `max` is raised to at least 1 and `initial` is clamped to `max`.
    pub fn new(config: PoolConfig) -> BloomdResult<Self> {
        let mut config = config;
        config.max = config.max.max(1);
        config.initial = config.initial.min(config.max);

        let ctx = Context::background();
        let mut idle = VecDeque::with_capacity(config.max);
        for _ in 0..config.initial {
            idle.push_back(Connection::connect(&ctx, &config.addr, config.timeout)?);
        }
        debug!(
            addr = %config.addr,
            initial = config.initial,
            max = config.max,
            "bloomd pool ready"
        );

        let live = idle.len();
        Ok(Pool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    idle,
                    live,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    /// Pool configuration after clamping.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Checks out a connection.
    ///
    /// Prefers an idle connection, then dials a new one while below `max`,
    /// then waits for a return. Fails with `PoolExhausted` if nothing frees
    /// up before the deadline, `PoolClosed` after `close`.
    pub fn get(&self, ctx: &Context) -> BloomdResult<PooledConnection> {
        let deadline = ctx.effective_deadline(self.inner.config.timeout);
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(BloomdError::PoolClosed);
            }
            if ctx.is_cancelled() {
                return Err(BloomdError::Cancelled);
            }
            if let Some(conn) = state.idle.pop_front() {
                return Ok(PooledConnection::new(self.clone(), conn));
            }
            if state.live < self.inner.config.max {
                state.live += 1;
                let live = state.live;
                drop(state);
                debug!(addr = %self.inner.config.addr, live, "growing bloomd pool");
                let config = &self.inner.config;
                return match Connection::connect(ctx, &config.addr, config.timeout) {
                    Ok(conn) => Ok(PooledConnection::new(self.clone(), conn)),
                    Err(err) => {
                        self.release_slot();
                        Err(err)
                    }
                };
            }

            let now = Instant::now();
            let wake = match deadline {
                Some(deadline) if deadline <= now => return Err(BloomdError::PoolExhausted),
                Some(deadline) => deadline.min(now + CANCEL_POLL),
                None => now + CANCEL_POLL,
            };
            self.inner.available.wait_until(&mut state, wake);
        }
    }

    /// Returns a connection to the idle queue.
    ///
    /// Poisoned connections, connections with unread bytes, and returns to a
    /// closed or full pool are closed instead.
    pub fn put(&self, conn: Connection) {
        if conn.is_poisoned() || conn.has_buffered_data() {
            self.discard(conn);
            return;
        }

        let mut state = self.inner.state.lock();
        if state.closed || state.idle.len() >= self.inner.config.max {
            drop(state);
            conn.close();
            self.release_slot();
            return;
        }
        state.idle.push_back(conn);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Closes a connection and frees its slot.
    ///
    /// The socket is shut down before the slot is released, so a waiter that
    /// dials a replacement never pushes the socket count past `max`.
    pub fn discard(&self, conn: Connection) {
        warn!(addr = %conn.addr(), "discarding bloomd connection");
        conn.close();
        self.release_slot();
    }

    /// Closes every idle connection and rejects further checkouts.
    ///
    /// Connections still checked out are closed when they come back.
    pub fn close(&self) {
        let drained: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(drained.len());
            drained
        };
        debug!(addr = %self.inner.config.addr, closed = drained.len(), "closing bloomd pool");
        self.inner.available.notify_all();
        for conn in drained {
            conn.close();
        }
    }

    /// Returns true after `close`.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Current live and idle counts.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
        }
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.inner.available.notify_one();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Checked-out connection that goes back to its pool on drop.
///
/// A poisoned connection is closed instead of returned.
pub struct PooledConnection {
    pool: Pool,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Pool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
        }
    }

    /// Returns the connection to the pool now.
    pub fn release(self) {
        drop(self);
    }

    /// Closes the connection instead of returning it.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection exists")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection exists")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}
