//! # Connection
//!
//! Purpose: Own one TCP session to bloomd and run each operation as a single
//! request/response exchange under a call deadline.
//!
//! ## Design Principles
//! 1. **Strict Serialization**: `&mut self` on every operation; no pipelining.
//! 2. **Poison on Doubt**: Any I/O or framing failure closes the socket and
//!    fails every later call with `ConnectionClosed`.
//! 3. **Deadline per Syscall**: The socket timeout is re-armed before each
//!    read and write so no I/O outlives the call deadline.
//! 4. **Buffer Reuse**: Write and line buffers live on the connection.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec::{self, Command, Status};
use crate::context::{time_left, Context};
use crate::error::{BloomdError, BloomdResult};
use crate::filter::{CreateParams, FilterInfo, FilterList, FilterName};

/// Socket wrapper that applies the current call deadline to every read and
/// write.
struct DeadlineStream {
    stream: TcpStream,
    deadline: Option<Instant>,
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.set_read_timeout(time_left(self.deadline)?)?;
        self.stream.read(buf)
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.set_write_timeout(time_left(self.deadline)?)?;
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Single TCP session to a bloomd server.
///
/// A connection is used by one caller at a time. After an I/O or protocol
/// failure it is poisoned: the socket is shut down and every further call
/// fails with `BloomdError::ConnectionClosed`.
pub struct Connection {
    reader: BufReader<DeadlineStream>,
    addr: String,
    timeout: Duration,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    poisoned: bool,
}

impl Connection {
    /// Dials `addr` once. `timeout` bounds the connect and becomes the
    /// default per-call timeout.
    pub fn connect(ctx: &Context, addr: &str, timeout: Duration) -> BloomdResult<Self> {
        Self::dial(ctx, addr, timeout, 1, Duration::ZERO)
    }

    /// Dials `addr` up to `max_attempts` times, sleeping `backoff` between
    /// attempts. Fails with `Unavailable` carrying the last dial error.
    pub fn dial(
        ctx: &Context,
        addr: &str,
        timeout: Duration,
        max_attempts: u32,
        backoff: Duration,
    ) -> BloomdResult<Self> {
        let targets = resolve(addr)?;
        let attempts = max_attempts.max(1);
        let mut last_err = io::Error::new(io::ErrorKind::Other, "no dial attempted");

        for attempt in 1..=attempts {
            ctx.check()?;
            let deadline = ctx.effective_deadline(timeout);
            match open_stream(&targets, deadline) {
                Ok(stream) => {
                    debug!(addr = %addr, attempt, "connected to bloomd");
                    return Self::from_stream(stream, addr, timeout);
                }
                Err(err) => {
                    warn!(addr = %addr, attempt, error = %err, "bloomd dial failed");
                    if ctx.check().is_err() {
                        return Err(dial_failure(ctx, addr, attempt, err));
                    }
                    last_err = err;
                }
            }

            if attempt < attempts && !backoff.is_zero() {
                let pause = match time_left(ctx.deadline()) {
                    Ok(Some(left)) => backoff.min(left),
                    Ok(None) => backoff,
                    Err(_) => return Err(BloomdError::Timeout),
                };
                thread::sleep(pause);
            }
        }

        Err(dial_failure(ctx, addr, attempts, last_err))
    }

    fn from_stream(stream: TcpStream, addr: &str, timeout: Duration) -> BloomdResult<Self> {
        // Commands are small; send them without Nagle delay.
        stream.set_nodelay(true)?;
        Ok(Connection {
            reader: BufReader::new(DeadlineStream {
                stream,
                deadline: None,
            }),
            addr: addr.to_string(),
            timeout,
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            poisoned: false,
        })
    }

    /// Server address this connection was dialed to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Default per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns true once the connection is unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Returns true if response bytes are sitting unread in the buffer.
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Shuts the socket down.
    pub fn close(self) {
        debug!(addr = %self.addr, poisoned = self.poisoned, "closing bloomd connection");
        let _ = self.reader.get_ref().stream.shutdown(Shutdown::Both);
    }

    /// Creates a filter with server defaults. `Exists` counts as success.
    pub fn create(&mut self, ctx: &Context, name: &FilterName) -> BloomdResult<()> {
        self.create_with_params(ctx, name, CreateParams::default())
    }

    /// Creates a filter with explicit parameters. `Exists` counts as success.
    pub fn create_with_params(
        &mut self,
        ctx: &Context,
        name: &FilterName,
        params: CreateParams,
    ) -> BloomdResult<()> {
        let command = Command::Create {
            name: name.as_str(),
            params,
        };
        match self.status(ctx, &command)? {
            Status::Done => {}
            Status::Exists => debug!(filter = %name, "filter already exists"),
        }
        Ok(())
    }

    /// Permanently deletes a filter.
    pub fn drop_filter(&mut self, ctx: &Context, name: &FilterName) -> BloomdResult<()> {
        self.status(ctx, &Command::Drop(name.as_str())).map(|_| ())
    }

    /// Unloads a filter from server memory, keeping it on disk.
    pub fn close_filter(&mut self, ctx: &Context, name: &FilterName) -> BloomdResult<()> {
        self.status(ctx, &Command::Close(name.as_str())).map(|_| ())
    }

    /// Removes a closed filter from the server's management.
    pub fn clear(&mut self, ctx: &Context, name: &FilterName) -> BloomdResult<()> {
        self.status(ctx, &Command::Clear(name.as_str())).map(|_| ())
    }

    /// Flushes every filter to disk.
    pub fn flush(&mut self, ctx: &Context) -> BloomdResult<()> {
        self.status(ctx, &Command::Flush).map(|_| ())
    }

    /// Lists filters with their stats line.
    pub fn list(&mut self, ctx: &Context) -> BloomdResult<FilterList> {
        self.round_trip(ctx, &Command::List, |reader, line_buf| {
            codec::read_list(reader, line_buf)
        })
    }

    /// Fetches statistics for one filter.
    pub fn info(&mut self, ctx: &Context, name: &FilterName) -> BloomdResult<FilterInfo> {
        self.round_trip(ctx, &Command::Info(name.as_str()), |reader, line_buf| {
            codec::read_info(reader, line_buf, name.as_str())
        })
    }

    /// Checks one key.
    pub fn check(&mut self, ctx: &Context, name: &FilterName, key: &str) -> BloomdResult<bool> {
        codec::validate_key(key)?;
        let command = Command::Check {
            name: name.as_str(),
            key,
        };
        self.single_bool(ctx, &command)
    }

    /// Adds one key. Returns true if the key was newly added.
    pub fn set(&mut self, ctx: &Context, name: &FilterName, key: &str) -> BloomdResult<bool> {
        codec::validate_key(key)?;
        let command = Command::Set {
            name: name.as_str(),
            key,
        };
        self.single_bool(ctx, &command)
    }

    /// Checks several keys; the result is position-aligned with `keys`.
    pub fn multi_check<K: AsRef<str>>(
        &mut self,
        ctx: &Context,
        name: &FilterName,
        keys: &[K],
    ) -> BloomdResult<Vec<bool>> {
        let keys = wire_keys(keys)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let command = Command::MultiCheck {
            name: name.as_str(),
            keys,
        };
        self.bools(ctx, &command)
    }

    /// Adds several keys; the result is position-aligned with `keys`.
    pub fn multi_set<K: AsRef<str>>(
        &mut self,
        ctx: &Context,
        name: &FilterName,
        keys: &[K],
    ) -> BloomdResult<Vec<bool>> {
        let keys = wire_keys(keys)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let command = Command::MultiSet {
            name: name.as_str(),
            keys,
        };
        self.bools(ctx, &command)
    }

    fn status(&mut self, ctx: &Context, command: &Command<'_>) -> BloomdResult<Status> {
        let filter = command.filter().unwrap_or("");
        self.round_trip(ctx, command, |reader, line_buf| {
            codec::read_status(reader, line_buf, filter)
        })
    }

    fn single_bool(&mut self, ctx: &Context, command: &Command<'_>) -> BloomdResult<bool> {
        let values = self.bools(ctx, command)?;
        values
            .first()
            .copied()
            .ok_or_else(|| BloomdError::Protocol("empty boolean reply".to_string()))
    }

    fn bools(&mut self, ctx: &Context, command: &Command<'_>) -> BloomdResult<Vec<bool>> {
        let expected = match command {
            Command::MultiCheck { keys, .. } | Command::MultiSet { keys, .. } => keys.len(),
            _ => 1,
        };
        let filter = command.filter().unwrap_or("");
        self.round_trip(ctx, command, |reader, line_buf| {
            codec::read_bools(reader, line_buf, filter, expected)
        })
    }

    /// Writes `command`, then parses its reply with `parse`, all under the
    /// call deadline. Poisons the connection on any connection-level error.
    fn round_trip<T, F>(
        &mut self,
        ctx: &Context,
        command: &Command<'_>,
        parse: F,
    ) -> BloomdResult<T>
    where
        F: FnOnce(&mut BufReader<DeadlineStream>, &mut Vec<u8>) -> BloomdResult<T>,
    {
        if self.poisoned {
            return Err(BloomdError::ConnectionClosed);
        }

        let result = self.exchange(ctx, command, parse).map_err(|err| ctx.translate(err));
        if let Err(err) = &result {
            // A well-formed error reply followed by stray bytes still leaves
            // the stream out of step.
            if err.poisons_connection() || self.has_buffered_data() {
                warn!(
                    addr = %self.addr,
                    command = command.verb(),
                    error = %err,
                    "poisoning bloomd connection"
                );
                self.poison();
            }
        }
        result
    }

    fn exchange<T, F>(&mut self, ctx: &Context, command: &Command<'_>, parse: F) -> BloomdResult<T>
    where
        F: FnOnce(&mut BufReader<DeadlineStream>, &mut Vec<u8>) -> BloomdResult<T>,
    {
        ctx.check()?;
        let _guard = ctx.watch(&self.reader.get_ref().stream)?;
        self.reader.get_mut().deadline = ctx.effective_deadline(self.timeout);

        self.write_buf.clear();
        command.encode(&mut self.write_buf);
        debug!(
            addr = %self.addr,
            command = command.verb(),
            bytes = self.write_buf.len(),
            "sending bloomd command"
        );

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        let result = parse(&mut self.reader, &mut self.line_buf);
        self.reader.get_mut().deadline = None;
        result
    }

    fn poison(&mut self) {
        self.poisoned = true;
        let _ = self.reader.get_ref().stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

fn wire_keys<K: AsRef<str>>(keys: &[K]) -> BloomdResult<Vec<&str>> {
    keys.iter()
        .map(|key| {
            let key = key.as_ref();
            codec::validate_key(key).map(|_| key)
        })
        .collect()
}

/// Error for a dial that gave up. The caller's own deadline or cancellation
/// takes precedence over `Unavailable`.
fn dial_failure(ctx: &Context, addr: &str, attempts: u32, source: io::Error) -> BloomdError {
    match ctx.check() {
        Err(err) => err,
        Ok(()) => BloomdError::Unavailable {
            addr: addr.to_string(),
            attempts,
            source,
        },
    }
}

fn resolve(addr: &str) -> BloomdResult<Vec<SocketAddr>> {
    let targets: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|_| BloomdError::InvalidAddress(addr.to_string()))?
        .collect();
    if targets.is_empty() {
        return Err(BloomdError::InvalidAddress(addr.to_string()));
    }
    Ok(targets)
}

fn open_stream(targets: &[SocketAddr], deadline: Option<Instant>) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(io::ErrorKind::Other, "no addresses to dial");
    for target in targets {
        let attempt = match time_left(deadline)? {
            Some(timeout) => TcpStream::connect_timeout(target, timeout),
            None => TcpStream::connect(target),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}
