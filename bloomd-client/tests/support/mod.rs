//! In-process stand-in for a bloomd server.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bloomd_client::codec;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// How the fake server answers.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Emulate bloomd with in-memory filters.
    Normal,
    /// Like `Normal`, but wait before every reply.
    Slow(Duration),
    /// Read commands and never answer.
    Stall,
    /// Answer every command with this raw line.
    Reply(&'static str),
}

#[derive(Default)]
struct Shared {
    filters: Mutex<BTreeMap<String, BTreeSet<String>>>,
    commands: Mutex<Vec<String>>,
    open: AtomicUsize,
    peak: AtomicUsize,
    accepted: AtomicUsize,
}

/// Handle to a running fake server. The listener lives until the test ends.
pub struct FakeBloomd {
    addr: String,
    shared: Arc<Shared>,
}

impl FakeBloomd {
    pub fn start(behavior: Behavior) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let shared = Arc::new(Shared::default());

        let accept_shared = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let shared = accept_shared.clone();
                shared.accepted.fetch_add(1, Ordering::SeqCst);
                let open = shared.open.fetch_add(1, Ordering::SeqCst) + 1;
                shared.peak.fetch_max(open, Ordering::SeqCst);
                thread::spawn(move || {
                    let _ = serve(stream, behavior, &shared);
                    shared.open.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        FakeBloomd { addr, shared }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Highest number of simultaneously open client sockets.
    pub fn peak_connections(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    /// Total sockets accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Command lines received, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().clone()
    }
}

fn serve(stream: TcpStream, behavior: Behavior, shared: &Shared) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        shared.commands.lock().push(command.clone());

        let reply = match behavior {
            Behavior::Stall => continue,
            Behavior::Reply(raw) => format!("{raw}\n").into_bytes(),
            Behavior::Slow(delay) => {
                thread::sleep(delay);
                respond(&command, shared)
            }
            Behavior::Normal => respond(&command, shared),
        };
        writer.write_all(&reply)?;
        writer.flush()?;
    }
}

fn respond(command: &str, shared: &Shared) -> Vec<u8> {
    let mut parts = command.split_whitespace();
    let verb = parts.next().unwrap_or("");
    let name = parts.next();
    let args: Vec<&str> = parts.collect();
    let mut filters = shared.filters.lock();
    let mut out = Vec::new();

    let status = |text: &str| format!("{text}\n").into_bytes();
    let missing = || status("Filter does not exist");

    match (verb, name) {
        ("create", Some(name)) => {
            if filters.contains_key(name) {
                return status("Exists");
            }
            filters.insert(name.to_string(), BTreeSet::new());
            status("Done")
        }
        ("drop", Some(name)) => match filters.remove(name) {
            Some(_) => status("Done"),
            None => missing(),
        },
        ("close", Some(name)) | ("clear", Some(name)) => {
            if filters.contains_key(name) {
                status("Done")
            } else {
                missing()
            }
        }
        ("flush", None) => status("Done"),
        ("list", None) => {
            let lines: Vec<(String, String)> = filters
                .iter()
                .map(|(name, keys)| {
                    (name.clone(), format!("0.000100 300046 100000 {}", keys.len()))
                })
                .collect();
            codec::encode_block(lines.iter().map(|(k, v)| (k.as_str(), v.as_str())), &mut out);
            out
        }
        ("info", Some(name)) => match filters.get(name) {
            Some(keys) => {
                let size = keys.len().to_string();
                let entries = [
                    ("capacity", "100000"),
                    ("probability", "0.000100"),
                    ("size", size.as_str()),
                ];
                codec::encode_block(entries, &mut out);
                out
            }
            None => missing(),
        },
        ("c", Some(name)) | ("m", Some(name)) if !args.is_empty() => match filters.get(name) {
            Some(keys) => {
                let values: Vec<bool> = args.iter().map(|key| keys.contains(*key)).collect();
                codec::encode_bools(&values, &mut out);
                out
            }
            None => missing(),
        },
        ("s", Some(name)) | ("b", Some(name)) if !args.is_empty() => match filters.get_mut(name) {
            Some(keys) => {
                let values: Vec<bool> =
                    args.iter().map(|key| keys.insert(key.to_string())).collect();
                codec::encode_bools(&values, &mut out);
                out
            }
            None => missing(),
        },
        _ => status("Client Error: Command not supported"),
    }
}

/// Routes client traces to the test output; set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
