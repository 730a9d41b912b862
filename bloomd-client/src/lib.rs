//! # bloomd Client
//!
//! Purpose: Provide a blocking client for the bloomd bloom-filter server, with
//! an optional connection pool to amortize TCP handshakes.
//!
//! ## Design Principles
//! 1. **Faithful Translator**: One typed call is one command line and one
//!    reply; nothing is cached, batched, or pipelined behind the caller.
//! 2. **Object Pool Pattern**: `PooledClient` reuses connections and discards
//!    any that hit an I/O or protocol error.
//! 3. **Deadlines Everywhere**: Every call takes a `Context` whose deadline
//!    and cancellation reach each socket read and write.
//! 4. **Protocol Clarity**: Commands and reply shapes live in `codec`, apart
//!    from socket handling.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use bloomd_client::{Client, Context, FilterName, PooledClient};
//!
//! let client = PooledClient::new("localhost:8673", false, Duration::from_secs(1), 2, 8)?;
//! let ctx = Context::with_timeout(Duration::from_millis(200));
//! let filter = FilterName::new("visitors")?;
//!
//! client.create(&ctx, &filter)?;
//! client.multi_set(&ctx, &filter, &["alice", "bob"])?;
//! let seen = client.multi_check(&ctx, &filter, &["alice", "carol"])?;
//! assert_eq!(seen, vec![true, false]);
//! # Ok::<(), bloomd_client::BloomdError>(())
//! ```

mod client;
pub mod codec;
mod connection;
mod context;
mod error;
mod filter;
mod hash;
mod pool;

pub use client::{Client, ClientConfig, ConnectionSource, DirectClient, PooledClient, DEFAULT_ADDR};
pub use connection::Connection;
pub use context::{CancelToken, Context};
pub use error::{BloomdError, BloomdResult};
pub use filter::{CreateParams, FilterInfo, FilterList, FilterName, FilterStats};
pub use hash::{IdentityHasher, KeyHasher, Sha256KeyHasher};
pub use pool::{Pool, PoolConfig, PoolStats, PooledConnection};
