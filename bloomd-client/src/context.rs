//! # Call Context
//!
//! Purpose: Carry a caller deadline and cancellation signal into blocking
//! socket I/O.
//!
//! ## Design Principles
//! 1. **Earliest Deadline Wins**: Every read and write runs under
//!    `min(context deadline, now + connection timeout)`.
//! 2. **Cancel by Shutdown**: A blocked read cannot be interrupted, so
//!    cancelling shuts down every socket registered with the token.
//! 3. **Translate at the Edge**: Raw I/O errors observed under a context are
//!    mapped to `Timeout` or `Cancelled` before they reach the caller.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BloomdError, BloomdResult};

/// Deadline and cancellation scope for one client call.
///
/// `Context::background()` has neither; the connection timeout then bounds
/// each call on its own.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl Context {
    /// Context with no deadline and no cancellation.
    pub fn background() -> Self {
        Context::default()
    }

    /// Context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Context {
            deadline: Instant::now().checked_add(timeout),
            cancel: None,
        }
    }

    /// Context with an absolute deadline.
    pub fn with_deadline(deadline: Instant) -> Self {
        Context {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Caller deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Attached cancellation token, if any.
    pub fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    /// Returns true once the attached token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Earlier of the caller deadline and `now + cap`. A zero `cap` means no
    /// cap.
    pub fn effective_deadline(&self, cap: Duration) -> Option<Instant> {
        let capped = if cap.is_zero() {
            None
        } else {
            Instant::now().checked_add(cap)
        };
        match (self.deadline, capped) {
            (Some(deadline), Some(capped)) => Some(deadline.min(capped)),
            (deadline, capped) => deadline.or(capped),
        }
    }

    /// Fails with `Cancelled` or `Timeout` if the call can no longer proceed.
    pub fn check(&self) -> BloomdResult<()> {
        if self.is_cancelled() {
            return Err(BloomdError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(BloomdError::Timeout),
            _ => Ok(()),
        }
    }

    /// Registers `stream` so that cancelling this context shuts it down.
    pub(crate) fn watch(&self, stream: &TcpStream) -> BloomdResult<CancelGuard> {
        match &self.cancel {
            Some(token) => {
                let id = token.register(stream)?;
                Ok(CancelGuard {
                    token: Some(token.clone()),
                    id,
                })
            }
            None => Ok(CancelGuard { token: None, id: 0 }),
        }
    }

    /// Maps an error observed while doing I/O under this context.
    ///
    /// Any connection-level failure after cancellation is reported as
    /// `Cancelled`; socket timeouts become `Timeout`.
    pub(crate) fn translate(&self, err: BloomdError) -> BloomdError {
        if self.is_cancelled() && err.poisons_connection() {
            return BloomdError::Cancelled;
        }
        match err {
            BloomdError::Io(io_err) if is_timeout(&io_err) => BloomdError::Timeout,
            other => other,
        }
    }
}

/// Returns the time left before `deadline`, or a `TimedOut` error once it has
/// passed. `None` means unbounded.
pub(crate) fn time_left(deadline: Option<Instant>) -> io::Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"))
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Shared cancellation signal.
///
/// Clones observe the same signal. Cancelling is sticky and shuts down every
/// socket currently performing I/O under a context holding this token.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    sockets: Mutex<HashMap<u64, TcpStream>>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Signals cancellation and unblocks in-flight reads.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let sockets: Vec<TcpStream> = self.inner.sockets.lock().drain().map(|(_, s)| s).collect();
        debug!(sockets = sockets.len(), "cancelling in-flight bloomd calls");
        for socket in sockets {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    /// Returns true once `cancel` has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, stream: &TcpStream) -> BloomdResult<u64> {
        let handle = stream.try_clone()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.sockets.lock().insert(id, handle);

        // A cancel that ran before the insert did not see this socket.
        if self.is_cancelled() {
            if let Some(handle) = self.inner.sockets.lock().remove(&id) {
                let _ = handle.shutdown(Shutdown::Both);
            }
            return Err(BloomdError::Cancelled);
        }
        Ok(id)
    }

    fn unregister(&self, id: u64) {
        self.inner.sockets.lock().remove(&id);
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Removes a socket from its token when the call finishes.
pub(crate) struct CancelGuard {
    token: Option<CancelToken>,
    id: u64,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(token) = &self.token {
            token.unregister(self.id);
        }
    }
}
