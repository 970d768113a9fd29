//! The quota engine, spec §4.6.3 — the hard part of the scheduler.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::address::Address;
use crate::clock::Clock;
use crate::config::ClassOpts;
use crate::hub::{Dialer, Hub};
use crate::query::{
    passes_exp_backoff, sort_by_state_change, GroupDebounce, Origin, PeerFilterExt, Query,
};
use crate::record::{ConnectionState, PeerRecord, PeerType, Source};
use crate::rng::GossipRng;

use super::discovery::{is_blocked, HopsProvider, NetworkStatus};

/// `canBeConnected`'s 1s cache of `hasNetwork()`, shared across every
/// class pass within a tick.
pub struct NetworkCache {
    last: Mutex<Option<(u64, bool)>>,
}

impl NetworkCache {
    pub fn new() -> NetworkCache {
        NetworkCache { last: Mutex::new(None) }
    }

    pub fn has_network(&self, network: &dyn NetworkStatus, clock: &dyn Clock) -> bool {
        let now = clock.now_ms();
        let mut guard = self.last.lock().expect("network cache mutex poisoned");
        if let Some((checked_at, value)) = *guard {
            if now.saturating_sub(checked_at) < 1000 {
                return value;
            }
        }
        let value = network.has_network();
        *guard = Some((now, value));
        value
    }
}

impl Default for NetworkCache {
    fn default() -> Self {
        NetworkCache::new()
    }
}

/// Loopback hosts are always connectable; otherwise the cached network
/// status must report online.
pub fn can_be_connected(addr: &Address, network: &dyn NetworkStatus, cache: &NetworkCache, clock: &dyn Clock) -> bool {
    addr.is_loopback_host() || cache.has_network(network, clock)
}

/// Everything one `updateClass` pass needs that doesn't vary per class.
pub struct ClassContext<'a, D> {
    pub query: &'a Query,
    pub hub: &'a Hub<D>,
    pub hops: &'a dyn HopsProvider,
    pub network: &'a dyn NetworkStatus,
    pub network_cache: &'a NetworkCache,
    pub clock: &'a dyn Clock,
    pub rng: &'a dyn GossipRng,
    pub now_ms: u64,
}

#[derive(Default, Debug)]
pub struct ClassOutcome {
    pub disconnected_excess: usize,
    pub dialed: usize,
}

/// Runs one class's excess-trim, free-slot computation, and dial pass.
///
/// `global_peers_in_connection_empty` implements the "any — only if
/// `peersInConnection` is empty" class from spec §4.6.3's table; ordinary
/// classes pass `false` here unconditionally since their predicate already
/// scopes them.
#[instrument(skip_all, fields(class = label))]
pub async fn update_class<D: Dialer + 'static>(
    label: &str,
    predicate: impl Fn(&PeerRecord) -> bool,
    opts: ClassOpts,
    ctx: &ClassContext<'_, D>,
    debounce: &mut GroupDebounce,
    gate: impl Fn() -> bool,
) -> ClassOutcome {
    let mut outcome = ClassOutcome::default();
    if !gate() {
        return outcome;
    }

    let up = ctx.query.peers_in_connection().await.filter_pred(&predicate);
    let down = ctx
        .query
        .peers_connectable(Origin::Db)
        .await
        .filter_pred(&predicate);

    let up_count = up.len();
    if up_count > 2 * opts.quota {
        let excess = up_count - opts.quota;
        let oldest = sort_by_state_change(up).take_n(excess);
        for (addr, _) in oldest {
            let _ = ctx.hub.disconnect(&addr).await;
            outcome.disconnected_excess += 1;
        }
        debug!(class = label, excess, "trimmed excess connections");
    }

    let mut free = opts.quota.saturating_sub(up_count);
    if free == 1 {
        // neverJustOne: avoid a solitary failing reconnect. Only bumps
        // 1 -> 2; never applied to the excess-disconnect count above.
        free = 2;
    }
    if free == 0 {
        return outcome;
    }

    let mut eligible: Vec<(Address, PeerRecord)> = Vec::with_capacity(down.len());
    for (addr, record) in down {
        if is_blocked(ctx.hops, record.key) {
            continue;
        }
        if !can_be_connected(&addr, ctx.network, ctx.network_cache, ctx.clock) {
            continue;
        }
        if !record.autoconnect {
            continue;
        }
        eligible.push((addr, record));
    }

    let eligible = debounce.filter(eligible, opts.group_min, ctx.now_ms);
    let eligible: Vec<(Address, PeerRecord)> = eligible
        .into_iter()
        .filter(|(_, r)| passes_exp_backoff(r, opts.backoff_step, opts.backoff_max, ctx.now_ms))
        .collect();

    let mut candidates = eligible;
    if ctx.rng.next_f64() < 0.3 {
        ctx.rng.shuffle_candidates(&mut candidates);
    } else {
        candidates = sort_by_state_change(candidates);
    }
    candidates.truncate(free);

    for (addr, record) in candidates {
        match ctx.hub.connect(addr.clone(), Some(record)).await {
            Ok(()) => outcome.dialed += 1,
            Err(e) => debug!(class = label, address = %addr, error = %e, "class dial did not complete"),
        }
    }

    outcome
}

/// `isLocal`: host is non-loopback, privately-routable, and the record's
/// source is `local` or its type is `lan`.
pub fn is_local(addr: &Address, record: &PeerRecord) -> bool {
    !addr.is_loopback_host()
        && addr.is_private_host()
        && (record.source == Source::Local || record.kind == PeerType::Lan)
}

/// Promotes up to `limit` staged peers whose key is directly followed.
pub async fn promote_followed_staged<D: Dialer + 'static>(
    ctx: &ClassContext<'_, D>,
    staging: &crate::staging::Staging,
    limit: usize,
) -> usize {
    let mut promoted = 0;
    for (addr, record) in staging.entries().await {
        if promoted >= limit {
            break;
        }
        if super::discovery::is_followed(ctx.hops, record.key) {
            if ctx.hub.connect(addr.clone(), Some(record)).await.is_ok() {
                promoted += 1;
            }
        }
    }
    promoted
}

/// Disconnects any in-connection peer whose key has since been blocked.
pub async fn disconnect_newly_blocked<D: Dialer + 'static>(ctx: &ClassContext<'_, D>) -> usize {
    let mut count = 0;
    for (addr, entry) in ctx.hub.entries().await {
        if entry.state.is_in_connection() && is_blocked(ctx.hops, entry.record.key) {
            let _ = ctx.hub.disconnect(&addr).await;
            count += 1;
        }
    }
    count
}

/// Disconnects "frustrating" in-connection peers: not permanent
/// (`hasPinged || isLocal`), or stuck `connecting`, past the grace period.
pub async fn disconnect_frustrating<D: Dialer + 'static>(
    ctx: &ClassContext<'_, D>,
    grace: Duration,
) -> usize {
    let mut count = 0;
    for (addr, entry) in ctx.hub.entries().await {
        if !entry.state.is_in_connection() {
            continue;
        }
        let permanent = crate::query::has_pinged(&entry.record) || is_local(&addr, &entry.record);
        let stuck_connecting = entry.state.is_connecting();
        let past_grace = ctx.now_ms.saturating_sub(entry.record.state_change) >= grace.as_millis() as u64;
        if (!permanent || stuck_connecting) && past_grace {
            let _ = ctx.hub.disconnect(&addr).await;
            count += 1;
        }
    }
    count
}

/// Disconnects long-lived internet connections (type not in {bt, lan})
/// past `max_lifetime`.
pub async fn disconnect_long_lived<D: Dialer + 'static>(
    ctx: &ClassContext<'_, D>,
    max_lifetime: Duration,
) -> usize {
    let mut count = 0;
    for (addr, entry) in ctx.hub.entries().await {
        if !matches!(entry.state, ConnectionState::Connected) {
            continue;
        }
        if matches!(entry.record.kind, PeerType::Bt | PeerType::Lan) {
            continue;
        }
        let age_ok = ctx.now_ms.saturating_sub(entry.record.state_change) >= max_lifetime.as_millis() as u64;
        if age_ok {
            let _ = ctx.hub.disconnect(&addr).await;
            count += 1;
        }
    }
    count
}
