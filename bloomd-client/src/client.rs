//! # Client API
//!
//! Purpose: Expose the bloomd operation set behind one trait, with two ways of
//! getting a connection for each call.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides dialing, pooling, and framing.
//! 2. **One Contract, Two Sources**: `DirectClient` dials per call,
//!    `PooledClient` borrows from a `Pool`. Both implement `ConnectionSource`
//!    and get `Client` from a single blanket impl.
//! 3. **Scoped Release**: The source decides what happens to a connection
//!    after each call, on every exit path.
//! 4. **Never Retry Commands**: Only dialing is retried; `set` and `multi_set`
//!    are not idempotent.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::Connection;
use crate::context::Context;
use crate::error::BloomdResult;
use crate::filter::{CreateParams, FilterInfo, FilterList, FilterName};
use crate::hash::{KeyHasher, Sha256KeyHasher};
use crate::pool::{Pool, PoolConfig, PoolStats};

/// Default bloomd address.
pub const DEFAULT_ADDR: &str = "localhost:8673";

/// Client configuration shared by both client flavours.
///
/// Deserializes from any serde format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. "localhost:8673".
    pub addr: String,
    /// Replace keys with SHA-256 hex digests before sending them.
    pub pre_hash_keys: bool,
    /// Dial timeout and per-call I/O cap.
    pub timeout: Duration,
    /// Dial attempts per call for `DirectClient`.
    pub max_attempts: u32,
    /// Pause between dial attempts.
    pub retry_backoff: Duration,
    /// Connections `PooledClient` dials up front.
    pub initial_conns: usize,
    /// Upper bound on `PooledClient` connections.
    pub max_conns: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: DEFAULT_ADDR.to_string(),
            pre_hash_keys: false,
            timeout: Duration::from_secs(1),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
            initial_conns: 1,
            max_conns: 8,
        }
    }
}

/// bloomd operation set.
///
/// Every call takes a `Context`; its deadline and cancellation apply to all
/// I/O performed for that call.
pub trait Client: Send + Sync {
    /// Creates a filter with server defaults. An existing filter is success.
    fn create(&self, ctx: &Context, name: &FilterName) -> BloomdResult<()>;

    /// Creates a filter with explicit capacity, probability, and storage.
    fn create_with_params(
        &self,
        ctx: &Context,
        name: &FilterName,
        params: CreateParams,
    ) -> BloomdResult<()>;

    /// Permanently deletes a filter.
    fn drop_filter(&self, ctx: &Context, name: &FilterName) -> BloomdResult<()>;

    /// Unloads a filter from memory.
    fn close_filter(&self, ctx: &Context, name: &FilterName) -> BloomdResult<()>;

    /// Removes a closed filter from management.
    fn clear(&self, ctx: &Context, name: &FilterName) -> BloomdResult<()>;

    /// Flushes all filters.
    fn flush(&self, ctx: &Context) -> BloomdResult<()>;

    /// Lists filters.
    fn list(&self, ctx: &Context) -> BloomdResult<FilterList>;

    /// Fetches filter statistics.
    fn info(&self, ctx: &Context, name: &FilterName) -> BloomdResult<FilterInfo>;

    /// Checks one key.
    fn check(&self, ctx: &Context, name: &FilterName, key: &str) -> BloomdResult<bool>;

    /// Adds one key.
    fn set(&self, ctx: &Context, name: &FilterName, key: &str) -> BloomdResult<bool>;

    /// Checks several keys; results are position-aligned with `keys`.
    fn multi_check(
        &self,
        ctx: &Context,
        name: &FilterName,
        keys: &[&str],
    ) -> BloomdResult<Vec<bool>>;

    /// Adds several keys; results are position-aligned with `keys`.
    fn multi_set(
        &self,
        ctx: &Context,
        name: &FilterName,
        keys: &[&str],
    ) -> BloomdResult<Vec<bool>>;

    /// Verifies the server answers by issuing `list`.
    fn ping(&self, ctx: &Context) -> BloomdResult<()> {
        self.list(ctx).map(|_| ())
    }
}

/// Supplies a connection for one call and releases it afterwards.
pub trait ConnectionSource: Send + Sync {
    /// Runs `op` on a connection acquired for this call.
    fn with_connection<T, F>(&self, ctx: &Context, op: F) -> BloomdResult<T>
    where
        F: FnOnce(&mut Connection) -> BloomdResult<T>;

    /// Pre-hash hook, if keys are hashed before sending.
    fn key_hasher(&self) -> Option<&dyn KeyHasher>;
}

impl<S: ConnectionSource> Client for S {
    fn create(&self, ctx: &Context, name: &FilterName) -> BloomdResult<()> {
        self.with_connection(ctx, |conn| conn.create(ctx, name))
    }

    fn create_with_params(
        &self,
        ctx: &Context,
        name: &FilterName,
        params: CreateParams,
    ) -> BloomdResult<()> {
        self.with_connection(ctx, |conn| conn.create_with_params(ctx, name, params))
    }

    fn drop_filter(&self, ctx: &Context, name: &FilterName) -> BloomdResult<()> {
        self.with_connection(ctx, |conn| conn.drop_filter(ctx, name))
    }

    fn close_filter(&self, ctx: &Context, name: &FilterName) -> BloomdResult<()> {
        self.with_connection(ctx, |conn| conn.close_filter(ctx, name))
    }

    fn clear(&self, ctx: &Context, name: &FilterName) -> BloomdResult<()> {
        self.with_connection(ctx, |conn| conn.clear(ctx, name))
    }

    fn flush(&self, ctx: &Context) -> BloomdResult<()> {
        self.with_connection(ctx, |conn| conn.flush(ctx))
    }

    fn list(&self, ctx: &Context) -> BloomdResult<FilterList> {
        self.with_connection(ctx, |conn| conn.list(ctx))
    }

    fn info(&self, ctx: &Context, name: &FilterName) -> BloomdResult<FilterInfo> {
        self.with_connection(ctx, |conn| conn.info(ctx, name))
    }

    fn check(&self, ctx: &Context, name: &FilterName, key: &str) -> BloomdResult<bool> {
        let key = wire_key(self.key_hasher(), key);
        self.with_connection(ctx, |conn| conn.check(ctx, name, &key))
    }

    fn set(&self, ctx: &Context, name: &FilterName, key: &str) -> BloomdResult<bool> {
        let key = wire_key(self.key_hasher(), key);
        self.with_connection(ctx, |conn| conn.set(ctx, name, &key))
    }

    fn multi_check(
        &self,
        ctx: &Context,
        name: &FilterName,
        keys: &[&str],
    ) -> BloomdResult<Vec<bool>> {
        let keys = wire_keys(self.key_hasher(), keys);
        self.with_connection(ctx, |conn| conn.multi_check(ctx, name, &keys))
    }

    fn multi_set(
        &self,
        ctx: &Context,
        name: &FilterName,
        keys: &[&str],
    ) -> BloomdResult<Vec<bool>> {
        let keys = wire_keys(self.key_hasher(), keys);
        self.with_connection(ctx, |conn| conn.multi_set(ctx, name, &keys))
    }
}

fn wire_key<'a>(hasher: Option<&dyn KeyHasher>, key: &'a str) -> Cow<'a, str> {
    match hasher {
        Some(hasher) => Cow::Owned(hasher.hash_key(key)),
        None => Cow::Borrowed(key),
    }
}

fn wire_keys<'a>(hasher: Option<&dyn KeyHasher>, keys: &[&'a str]) -> Vec<Cow<'a, str>> {
    keys.iter().map(|key| wire_key(hasher, key)).collect()
}

fn default_hasher(pre_hash_keys: bool) -> Option<Arc<dyn KeyHasher>> {
    if pre_hash_keys {
        Some(Arc::new(Sha256KeyHasher))
    } else {
        None
    }
}

/// Client that dials a fresh connection for every call.
///
/// Suited to low-rate callers and bootstrap checks such as `ping`.
#[derive(Debug, Clone)]
pub struct DirectClient {
    addr: String,
    timeout: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
    hasher: Option<Arc<dyn KeyHasher>>,
}

impl DirectClient {
    /// Creates a client for `addr` with three dial attempts per call.
    pub fn new(addr: impl Into<String>, pre_hash_keys: bool, timeout: Duration) -> Self {
        DirectClient::with_config(ClientConfig {
            addr: addr.into(),
            pre_hash_keys,
            timeout,
            ..ClientConfig::default()
        })
    }

    /// Creates a client from a full configuration. Pool fields are ignored.
    pub fn with_config(config: ClientConfig) -> Self {
        DirectClient {
            addr: config.addr,
            timeout: config.timeout,
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff,
            hasher: default_hasher(config.pre_hash_keys),
        }
    }

    /// Replaces the key pre-hash hook and turns pre-hashing on.
    pub fn with_hasher(mut self, hasher: impl KeyHasher + 'static) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    /// Server address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Dial attempts per call.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl ConnectionSource for DirectClient {
    fn with_connection<T, F>(&self, ctx: &Context, op: F) -> BloomdResult<T>
    where
        F: FnOnce(&mut Connection) -> BloomdResult<T>,
    {
        let mut conn = Connection::dial(
            ctx,
            &self.addr,
            self.timeout,
            self.max_attempts,
            self.retry_backoff,
        )?;
        let result = op(&mut conn);
        conn.close();
        result
    }

    fn key_hasher(&self) -> Option<&dyn KeyHasher> {
        self.hasher.as_deref()
    }
}

/// Client that borrows connections from a shared `Pool`.
///
/// Healthy connections go back to the pool after each call; connections that
/// hit an I/O or protocol error are closed.
#[derive(Debug, Clone)]
pub struct PooledClient {
    pool: Pool,
    hasher: Option<Arc<dyn KeyHasher>>,
}

impl PooledClient {
    /// Creates a pooled client, dialing `initial_conns` connections now.
    pub fn new(
        addr: impl Into<String>,
        pre_hash_keys: bool,
        timeout: Duration,
        initial_conns: usize,
        max_conns: usize,
    ) -> BloomdResult<Self> {
        PooledClient::with_config(ClientConfig {
            addr: addr.into(),
            pre_hash_keys,
            timeout,
            initial_conns,
            max_conns,
            ..ClientConfig::default()
        })
    }

    /// Creates a pooled client from a full configuration. Dial retry fields
    /// are ignored; the pool dials once per new connection.
    pub fn with_config(config: ClientConfig) -> BloomdResult<Self> {
        let pool = Pool::new(PoolConfig {
            addr: config.addr,
            initial: config.initial_conns,
            max: config.max_conns,
            timeout: config.timeout,
        })?;
        Ok(PooledClient {
            pool,
            hasher: default_hasher(config.pre_hash_keys),
        })
    }

    /// Replaces the key pre-hash hook and turns pre-hashing on.
    pub fn with_hasher(mut self, hasher: impl KeyHasher + 'static) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    /// Underlying pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Live and idle connection counts.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Closes the pool. Later calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl ConnectionSource for PooledClient {
    fn with_connection<T, F>(&self, ctx: &Context, op: F) -> BloomdResult<T>
    where
        F: FnOnce(&mut Connection) -> BloomdResult<T>,
    {
        let mut conn = self.pool.get(ctx)?;
        let result = op(&mut *conn);
        if let Err(err) = &result {
            debug!(error = %err, poisoned = conn.is_poisoned(), "pooled bloomd call failed");
        }
        // Dropping the checkout returns it, or closes it when poisoned.
        drop(conn);
        result
    }

    fn key_hasher(&self) -> Option<&dyn KeyHasher> {
        self.hasher.as_deref()
    }
}
