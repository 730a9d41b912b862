mod support;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bloomd_client::{
    BloomdError, CancelToken, Client, ClientConfig, Context, CreateParams, DirectClient, FilterName,
    FilterStats, IdentityHasher, KeyHasher, PoolStats, PooledClient,
};

use support::{Behavior, FakeBloomd};

const TIMEOUT: Duration = Duration::from_secs(1);

fn filter(name: &str) -> FilterName {
    FilterName::new(name).expect("filter name")
}

fn direct(server: &FakeBloomd) -> DirectClient {
    DirectClient::new(server.addr(), false, TIMEOUT)
}

fn pooled(server: &FakeBloomd, initial: usize, max: usize) -> PooledClient {
    PooledClient::new(server.addr(), false, TIMEOUT, initial, max).expect("pooled client")
}

fn set_then_check(client: &dyn Client) {
    let ctx = Context::background();
    let name = filter("test_filter");
    let keys = ["test-1", "test-2", "test-3", "test-4", "test-5"];

    client.create(&ctx, &name).expect("create");
    let before = client.multi_check(&ctx, &name, &keys).expect("multi_check");
    assert_eq!(before, vec![false; 5]);

    let added = client
        .multi_set(&ctx, &name, &["test-1", "test-3", "test-5"])
        .expect("multi_set");
    assert_eq!(added, vec![true, true, true]);

    let after = client.multi_check(&ctx, &name, &keys).expect("multi_check");
    assert_eq!(after, vec![true, false, true, false, true]);

    client.drop_filter(&ctx, &name).expect("drop");
}

#[test]
fn direct_client_set_then_check() {
    let server = FakeBloomd::start(Behavior::Normal);
    set_then_check(&direct(&server));
    // One socket per call.
    assert_eq!(server.accepted(), 5);
}

#[test]
fn pooled_client_set_then_check() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = pooled(&server, 1, 4);
    set_then_check(&client);
    assert_eq!(server.accepted(), 1);
    assert_eq!(client.pool_stats(), PoolStats { live: 1, idle: 1 });
}

#[test]
fn unknown_filter_is_not_found() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = pooled(&server, 1, 1);
    let ctx = Context::background();

    let err = client
        .multi_check(&ctx, &filter("never_created"), &["a", "b"])
        .unwrap_err();
    assert!(err.is_filter_not_found(), "got {err:?}");
    // A well-formed error reply leaves the connection reusable.
    assert_eq!(client.pool_stats(), PoolStats { live: 1, idle: 1 });
}

#[test]
fn create_is_idempotent() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = direct(&server);
    let ctx = Context::background();
    let name = filter("twice");

    client.create(&ctx, &name).expect("first create");
    client.create(&ctx, &name).expect("second create");
    assert_eq!(server.commands(), vec!["create twice", "create twice"]);
}

#[test]
fn dropped_filter_is_gone_for_every_operation() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = pooled(&server, 1, 2);
    let ctx = Context::background();
    let name = filter("short_lived");

    client.create(&ctx, &name).unwrap();
    client.drop_filter(&ctx, &name).unwrap();

    assert!(client.check(&ctx, &name, "k").unwrap_err().is_filter_not_found());
    assert!(client.set(&ctx, &name, "k").unwrap_err().is_filter_not_found());
    assert!(client.multi_set(&ctx, &name, &["k"]).unwrap_err().is_filter_not_found());
    assert!(client.info(&ctx, &name).unwrap_err().is_filter_not_found());
    assert!(client.close_filter(&ctx, &name).unwrap_err().is_filter_not_found());
    assert!(client.clear(&ctx, &name).unwrap_err().is_filter_not_found());
    assert!(client.drop_filter(&ctx, &name).unwrap_err().is_filter_not_found());
}

#[test]
fn set_then_check_single_key() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = pooled(&server, 0, 1);
    let ctx = Context::background();
    let name = filter("single");

    client.create(&ctx, &name).unwrap();
    assert!(!client.check(&ctx, &name, "k").unwrap());
    assert!(client.set(&ctx, &name, "k").unwrap());
    assert!(!client.set(&ctx, &name, "k").unwrap());
    assert!(client.check(&ctx, &name, "k").unwrap());
}

#[test]
fn list_info_flush_and_ping() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = direct(&server);
    let ctx = Context::background();

    assert!(client.list(&ctx).unwrap().is_empty());
    client.ping(&ctx).unwrap();

    let name = filter("stats");
    client.create(&ctx, &name).unwrap();
    client.multi_set(&ctx, &name, &["a", "b"]).unwrap();
    client.flush(&ctx).unwrap();

    let list = client.list(&ctx).unwrap();
    let stats = FilterStats::parse(&list["stats"]).unwrap();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.capacity, 100000);

    let info = client.info(&ctx, &name).unwrap();
    assert_eq!(info.get("size").map(String::as_str), Some("2"));
    assert_eq!(info.get("capacity").map(String::as_str), Some("100000"));
}

#[test]
fn create_with_params_sends_only_non_default_options() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = direct(&server);
    let ctx = Context::background();

    client
        .create_with_params(&ctx, &filter("sized"), CreateParams::new(50000, 0.001).in_memory(true))
        .unwrap();
    client
        .create_with_params(&ctx, &filter("plain"), CreateParams::default())
        .unwrap();
    assert_eq!(
        server.commands(),
        vec!["create sized capacity=50000 prob=0.001 in_memory=1", "create plain"]
    );
}

#[test]
fn pre_hashed_keys_are_fixed_width_hex() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = DirectClient::new(server.addr(), true, TIMEOUT);
    let ctx = Context::background();
    let name = filter("hashed");

    client.create(&ctx, &name).unwrap();
    // Spaces would break framing without pre-hashing.
    assert!(client.set(&ctx, &name, "key with spaces").unwrap());
    assert!(client.check(&ctx, &name, "key with spaces").unwrap());
    assert!(!client.check(&ctx, &name, "other key").unwrap());

    let commands = server.commands();
    let token = commands[1].split(' ').nth(2).unwrap();
    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
}

/// Prefixes keys with a tenant tag.
#[derive(Debug)]
struct TenantHasher(&'static str);

impl KeyHasher for TenantHasher {
    fn hash_key(&self, key: &str) -> String {
        format!("{}:{}", self.0, key)
    }
}

#[test]
fn custom_hasher_shapes_wire_keys() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = pooled(&server, 1, 1).with_hasher(TenantHasher("acme"));
    let ctx = Context::background();
    let name = filter("tenants");

    client.create(&ctx, &name).unwrap();
    assert_eq!(client.multi_set(&ctx, &name, &["a", "b"]).unwrap(), vec![true, true]);
    assert!(client.check(&ctx, &name, "a").unwrap());

    let direct = direct(&server).with_hasher(TenantHasher("other"));
    assert!(!direct.check(&ctx, &name, "a").unwrap());

    assert_eq!(
        server.commands(),
        vec![
            "create tenants",
            "b tenants acme:a acme:b",
            "c tenants acme:a",
            "c tenants other:a",
        ]
    );
}

#[test]
fn identity_hasher_still_validates_keys() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = direct(&server).with_hasher(IdentityHasher);
    let ctx = Context::background();
    let name = filter("plain_keys");

    client.create(&ctx, &name).unwrap();
    assert!(client.set(&ctx, &name, "k1").unwrap());
    let err = client.set(&ctx, &name, "k 2").unwrap_err();
    assert!(matches!(err, BloomdError::InvalidKey(_)), "got {err:?}");
    assert_eq!(server.commands(), vec!["create plain_keys", "s plain_keys k1"]);
}

#[test]
fn unhashed_key_with_space_is_rejected_locally() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = pooled(&server, 1, 1);
    let ctx = Context::background();

    let err = client.check(&ctx, &filter("f"), "a b").unwrap_err();
    assert!(matches!(err, BloomdError::InvalidKey(_)));
    assert!(server.commands().is_empty());
    assert_eq!(client.pool_stats(), PoolStats { live: 1, idle: 1 });
}

#[test]
fn deadline_against_stalled_server_discards_connection() {
    let server = FakeBloomd::start(Behavior::Stall);
    let client = pooled(&server, 1, 2);
    assert_eq!(client.pool_stats().live, 1);

    let ctx = Context::with_timeout(Duration::from_millis(1));
    let started = Instant::now();
    let err = client.multi_check(&ctx, &filter("f"), &["a"]).unwrap_err();
    assert!(matches!(err, BloomdError::Timeout), "got {err:?}");
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(client.pool_stats(), PoolStats { live: 0, idle: 0 });
}

#[test]
fn connection_timeout_caps_calls_without_deadline() {
    let server = FakeBloomd::start(Behavior::Stall);
    let client = PooledClient::new(server.addr(), false, Duration::from_millis(50), 1, 1).unwrap();

    let started = Instant::now();
    let err = client.list(&Context::background()).unwrap_err();
    assert!(matches!(err, BloomdError::Timeout), "got {err:?}");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn cancellation_unblocks_read() {
    let server = FakeBloomd::start(Behavior::Stall);
    let timeout = Duration::from_secs(5);
    let client = PooledClient::new(server.addr(), false, timeout, 1, 1).expect("pooled client");
    let client = Arc::new(client);
    let token = CancelToken::new();

    let caller = {
        let client = client.clone();
        let ctx = Context::background().with_cancel(token.clone());
        thread::spawn(move || {
            let started = Instant::now();
            let result = client.multi_check(&ctx, &filter("f"), &["a"]);
            (result, started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(50));
    token.cancel();
    let (result, elapsed) = caller.join().unwrap();
    assert!(matches!(result, Err(BloomdError::Cancelled)), "got {result:?}");
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(client.pool_stats(), PoolStats { live: 0, idle: 0 });
}

#[test]
fn saturated_pool_never_exceeds_max_sockets() {
    let server = FakeBloomd::start(Behavior::Slow(Duration::from_millis(10)));
    let client = Arc::new(
        PooledClient::with_config(ClientConfig {
            addr: server.addr().to_string(),
            timeout: Duration::from_secs(2),
            initial_conns: 1,
            max_conns: 2,
            ..ClientConfig::default()
        })
        .unwrap(),
    );
    let name = filter("busy");
    client.create(&Context::background(), &name).unwrap();

    let workers: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            let name = name.clone();
            thread::spawn(move || client.multi_check(&Context::background(), &name, &["a", "b"]))
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap().unwrap(), vec![false, false]);
    }
    assert!(server.peak_connections() <= 2, "peak {}", server.peak_connections());
    assert!(client.pool_stats().live <= 2);
}

#[test]
fn unexpected_status_is_protocol_error_and_poisons() {
    let server = FakeBloomd::start(Behavior::Reply("UNKNOWN"));
    let client = pooled(&server, 1, 1);

    let err = client.create(&Context::background(), &filter("f")).unwrap_err();
    assert!(matches!(err, BloomdError::Protocol(_)), "got {err:?}");
    assert_eq!(client.pool_stats(), PoolStats { live: 0, idle: 0 });

    // The pool dials a replacement on the next call.
    let err = client.create(&Context::background(), &filter("f")).unwrap_err();
    assert!(matches!(err, BloomdError::Protocol(_)));
    assert_eq!(server.accepted(), 2);
}

#[test]
fn command_error_keeps_message_and_connection() {
    let server = FakeBloomd::start(Behavior::Reply("Client Error: Bad arguments"));
    let client = pooled(&server, 1, 1);

    let err = client.flush(&Context::background()).unwrap_err();
    assert!(matches!(&err, BloomdError::Command(msg) if msg == "Bad arguments"), "got {err:?}");
    assert_eq!(client.pool_stats(), PoolStats { live: 1, idle: 1 });
}

#[test]
fn wrong_boolean_count_is_protocol_error() {
    let server = FakeBloomd::start(Behavior::Reply("Yes"));
    let client = direct(&server);

    let err = client
        .multi_check(&Context::background(), &filter("f"), &["a", "b"])
        .unwrap_err();
    assert!(matches!(err, BloomdError::Protocol(_)), "got {err:?}");
}

#[test]
fn closed_pool_rejects_calls() {
    let server = FakeBloomd::start(Behavior::Normal);
    let client = pooled(&server, 2, 2);
    client.close();
    let err = client.list(&Context::background()).unwrap_err();
    assert!(matches!(err, BloomdError::PoolClosed));
    assert_eq!(client.pool_stats(), PoolStats { live: 0, idle: 0 });
}

#[test]
fn direct_client_reports_unavailable_after_retries() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let client = DirectClient::with_config(ClientConfig {
        addr,
        timeout: Duration::from_millis(200),
        max_attempts: 3,
        retry_backoff: Duration::from_millis(1),
        ..ClientConfig::default()
    });

    let err = client.ping(&Context::background()).unwrap_err();
    assert!(matches!(err, BloomdError::Unavailable { attempts: 3, .. }), "got {err:?}");
}
