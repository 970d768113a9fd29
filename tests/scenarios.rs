//! End-to-end scenarios exercising the assembled [`gossip_conn::Conn`]
//! facade, one per representative flow through discovery, scheduling, and
//! the Hub/Staging/AddressBook pools.

mod support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gossip_conn::clock::TestClock;
use gossip_conn::config::Config;
use gossip_conn::record::{PeerType, Source};
use gossip_conn::rng::StdGossipRng;
use gossip_conn::store::MemoryStore;
use gossip_conn::Conn;

use support::{key, net_address, TestDialer, TestHops, TestLanSource};

fn test_config(seeds: Vec<String>) -> Config {
    Config {
        path: PathBuf::new(),
        conn_autostart: true,
        gossip_seed: true,
        gossip_pub: true,
        gossip_auto_populate: false,
        seeds,
        ping_timeout: Duration::from_secs(5 * 60),
        classes: Default::default(),
    }
}

/// Lets a short-lived background task (the hub-event listener, a discovery
/// intake task) catch up before the next assertion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn s1_seed_bootstrap() {
    let seed_key = key(1);
    let seed_addr = net_address("203.0.113.1", 8008, seed_key);
    let config = test_config(vec![seed_addr.to_string()]);

    let dialer = Arc::new(TestDialer::new());
    let clock = Arc::new(TestClock::new(1_000));
    let rng = Arc::new(StdGossipRng::from_seed(1));
    let conn = Conn::new(dialer, Arc::new(MemoryStore), config, clock, rng).build();

    conn.load().await.unwrap();
    conn.start().await;
    conn.scheduler().force_tick().await;
    settle().await;

    let entry = conn
        .hub()
        .get_state(&seed_addr)
        .await
        .expect("seed address should have been dialed on the first tick");
    assert!(entry.is_in_connection() || entry.is_connected());

    conn.stop().await;
}

#[tokio::test]
async fn s2_backoff_after_failure() {
    // A decoy already-connected peer keeps `peers_in_connection` non-empty
    // for the whole test, so the "any-when-empty" class (1s backoffStep)
    // never competes for our address and the has-only-failed-attempts
    // class's 60s backoffStep is the only thing gating the redial.
    let decoy_addr = net_address("203.0.113.20", 8008, key(20));
    let peer_key = key(2);
    let addr = net_address("203.0.113.2", 8008, peer_key);
    let config = test_config(Vec::new());

    let dialer = Arc::new(TestDialer::new());
    dialer.fail_next(&addr);
    let clock = Arc::new(TestClock::new(1_000));
    let rng = Arc::new(StdGossipRng::from_seed(2));
    let conn = Conn::new(dialer, Arc::new(MemoryStore), config, clock.clone(), rng).build();

    conn.load().await.unwrap();
    conn.hub().connect(decoy_addr, None).await.unwrap();

    let mut record = gossip_conn::PeerRecord::new(peer_key, Source::Manual, PeerType::Internet, 1_000);
    record.host = Some(addr.host().to_string());
    record.port = addr.port();
    conn.db().set(addr.clone(), record).await;

    conn.start().await;
    conn.scheduler().force_tick().await;
    settle().await;

    let first = conn.db().get(&addr).await.expect("record stays durable");
    assert_eq!(first.failure.count, 1, "first dial should have failed and been recorded");
    assert_eq!(first.stats.attempts, 1);

    clock.advance_ms(500);
    conn.scheduler().force_tick().await;
    settle().await;
    let still_one = conn.db().get(&addr).await.unwrap();
    assert_eq!(still_one.stats.attempts, 1, "redial must not happen before backoffStep elapses");

    clock.advance_ms(61_000);
    conn.scheduler().force_tick().await;
    settle().await;
    let after_backoff = conn.db().get(&addr).await.unwrap();
    assert_eq!(after_backoff.stats.attempts, 2, "redial happens once backoffStep has elapsed");
    assert_eq!(after_backoff.stats.successes, 1);

    conn.stop().await;
}

#[tokio::test]
async fn s3_block_purge() {
    let peer_key = key(3);
    let addr = net_address("203.0.113.3", 8008, peer_key);
    let config = test_config(Vec::new());

    let dialer = Arc::new(TestDialer::new());
    let clock = Arc::new(TestClock::new(1_000));
    let rng = Arc::new(StdGossipRng::from_seed(3));
    let hops = Arc::new(TestHops::new());

    let conn = Conn::new(dialer, Arc::new(MemoryStore), config, clock, rng)
        .with_hops(hops.clone())
        .build();

    let staged_key = key(30);
    let staged_addr = net_address("203.0.113.30", 8008, staged_key);
    let mut staged_record = gossip_conn::PeerRecord::new(staged_key, Source::Manual, PeerType::Internet, 1_000);
    staged_record.host = Some(staged_addr.host().to_string());

    conn.load().await.unwrap();
    conn.hub().connect(addr.clone(), None).await.unwrap();
    settle().await;
    assert!(conn.hub().get_state(&addr).await.unwrap().is_in_connection());
    conn.staging().stage(staged_addr.clone(), staged_record).await;

    conn.start().await;
    hops.block(peer_key);
    hops.block(staged_key);
    conn.scheduler().force_tick().await;
    settle().await;

    let state = conn.hub().get_state(&addr).await.unwrap();
    assert!(!state.is_in_connection(), "blocked peer must be disconnected within one tick");
    assert!(conn.staging().get(&addr).await.is_none(), "blocked peer must not linger in staging");
    assert!(
        conn.staging().get(&staged_addr).await.is_none(),
        "a staged candidate that becomes blocked must be purged within one tick"
    );

    conn.stop().await;
}

#[tokio::test]
async fn s4_lan_discovery_of_followed_peer() {
    let peer_key = key(4);
    let addr = net_address("10.0.0.4", 8008, peer_key);
    let config = test_config(Vec::new());

    let dialer = Arc::new(TestDialer::new());
    let clock = Arc::new(TestClock::new(1_000));
    let rng = Arc::new(StdGossipRng::from_seed(4));
    let hops = Arc::new(TestHops::new());
    let lan = Arc::new(TestLanSource::new());

    let conn = Conn::new(dialer, Arc::new(MemoryStore), config, clock, rng)
        .with_hops(hops.clone())
        .with_lan_source(lan.clone())
        .build();

    conn.load().await.unwrap();
    hops.set_hops(peer_key, 1);
    conn.start().await;

    lan.push(&addr.to_string(), true).await;
    settle().await;

    let state = conn
        .hub()
        .get_state(&addr)
        .await
        .expect("a followed LAN candidate should connect straight into the Hub");
    assert!(state.is_in_connection() || state.is_connected());
    assert!(
        conn.staging().get(&addr).await.is_none(),
        "a followed candidate should never pass through staging"
    );

    conn.stop().await;
}

#[tokio::test]
async fn s5_staged_lan_candidate_ages_out() {
    let peer_key = key(5);
    let addr = net_address("10.0.0.5", 8008, peer_key);
    let config = test_config(Vec::new());

    let dialer = Arc::new(TestDialer::new());
    let clock = Arc::new(TestClock::new(1_000));
    let rng = Arc::new(StdGossipRng::from_seed(5));
    let lan = Arc::new(TestLanSource::new());

    let conn = Conn::new(dialer, Arc::new(MemoryStore), config, clock.clone(), rng)
        .with_lan_source(lan.clone())
        .build();

    conn.load().await.unwrap();
    conn.start().await;

    lan.push(&addr.to_string(), false).await;
    settle().await;
    assert!(conn.staging().get(&addr).await.is_some(), "unfollowed LAN candidate should be staged");

    clock.advance_ms(9_000);
    conn.scheduler().force_tick().await;
    assert!(conn.staging().get(&addr).await.is_some(), "must not age out before the 10s TTL");

    clock.advance_ms(2_000);
    conn.scheduler().force_tick().await;
    assert!(conn.staging().get(&addr).await.is_none(), "LAN staging entries expire after 10s");

    conn.stop().await;
}

#[tokio::test]
async fn s6_wakeup_disconnects_and_redials() {
    let seed_key = key(6);
    let seed_addr = net_address("203.0.113.6", 8008, seed_key);
    let config = test_config(vec![seed_addr.to_string()]);

    let dialer = Arc::new(TestDialer::new());
    let clock = Arc::new(TestClock::new(1_000));
    let rng = Arc::new(StdGossipRng::from_seed(6));
    let conn = Conn::new(dialer, Arc::new(MemoryStore), config, clock, rng).build();

    conn.load().await.unwrap();
    conn.start().await;
    conn.scheduler().force_tick().await;
    settle().await;
    assert!(conn.hub().get_state(&seed_addr).await.unwrap().is_in_connection());

    conn.scheduler().on_wakeup().await;

    let state = conn.hub().get_state(&seed_addr).await.unwrap();
    assert_eq!(state, gossip_conn::ConnectionState::Disconnected, "wakeup tears down every live connection");

    // The hub's own Disconnected event debounces a follow-up tick
    // (WAKEUP_DEBOUNCE = 200ms, fuzzed to [100ms, 300ms)); give it room to
    // fire and redial the still-autoconnecting seed.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let state = conn.hub().get_state(&seed_addr).await.unwrap();
    assert!(state.is_in_connection() || state.is_connected(), "wakeup's follow-up tick should redial the seed");

    conn.stop().await;
}
