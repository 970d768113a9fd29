//! The policy-driven control loop, spec §4.6 — the hard part of the core.

pub mod classes;
pub mod discovery;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace};

use crate::address::Address;
use crate::clock::Clock;
use crate::config::{constants, Config};
use crate::db::AddressBook;
use crate::hub::{Dialer, Hub, HubEventKind};
use crate::query::Query;
use crate::record::{PeerRecord, PeerType, Source};
use crate::rng::GossipRng;
use crate::staging::Staging;

use self::classes::{
    disconnect_frustrating, disconnect_long_lived, disconnect_newly_blocked,
    promote_followed_staged, update_class, ClassContext, NetworkCache,
};
use self::discovery::{
    is_blocked, is_followed, AlwaysOnline, BtSource, HopsProvider, LanSource, MessageLog,
    NetworkStatus, NoBtSource, NoHopsProvider, NoLanSource, NoMessageLog, NoPubSource, PubSource,
};

struct Inner<D> {
    db: AddressBook,
    hub: Hub<D>,
    staging: Staging,
    query: Query,
    hops: Arc<dyn HopsProvider>,
    message_log: Arc<dyn MessageLog>,
    network: Arc<dyn NetworkStatus>,
    pub_source: Arc<dyn PubSource>,
    lan_source: Arc<dyn LanSource>,
    bt_source: Arc<dyn BtSource>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn GossipRng>,
    config: Config,
    network_cache: NetworkCache,
    running: AtomicBool,
    closed: AtomicBool,
    tick_scheduled: AtomicBool,
    tick_tx: mpsc::Sender<()>,
    tick_rx: AsyncMutex<Option<mpsc::Receiver<()>>>,
    bound_tx: watch::Sender<bool>,
    bound_rx: watch::Receiver<bool>,
    closed_tx: watch::Sender<bool>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

/// Builds a [`Scheduler`], defaulting every optional collaborator to a
/// null-object implementation per design note §9.
pub struct SchedulerBuilder<D> {
    db: AddressBook,
    hub: Hub<D>,
    staging: Staging,
    query: Query,
    hops: Arc<dyn HopsProvider>,
    message_log: Arc<dyn MessageLog>,
    network: Arc<dyn NetworkStatus>,
    pub_source: Arc<dyn PubSource>,
    lan_source: Arc<dyn LanSource>,
    bt_source: Arc<dyn BtSource>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn GossipRng>,
    config: Config,
}

impl<D: Dialer + 'static> SchedulerBuilder<D> {
    pub fn new(
        db: AddressBook,
        hub: Hub<D>,
        staging: Staging,
        query: Query,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn GossipRng>,
        config: Config,
    ) -> Self {
        SchedulerBuilder {
            db,
            hub,
            staging,
            query,
            hops: Arc::new(NoHopsProvider),
            message_log: Arc::new(NoMessageLog),
            network: Arc::new(AlwaysOnline),
            pub_source: Arc::new(NoPubSource),
            lan_source: Arc::new(NoLanSource),
            bt_source: Arc::new(NoBtSource),
            clock,
            rng,
            config,
        }
    }

    pub fn with_hops(mut self, hops: Arc<dyn HopsProvider>) -> Self {
        self.hops = hops;
        self
    }

    pub fn with_message_log(mut self, log: Arc<dyn MessageLog>) -> Self {
        self.message_log = log;
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkStatus>) -> Self {
        self.network = network;
        self
    }

    pub fn with_pub_source(mut self, source: Arc<dyn PubSource>) -> Self {
        self.pub_source = source;
        self
    }

    pub fn with_lan_source(mut self, source: Arc<dyn LanSource>) -> Self {
        self.lan_source = source;
        self
    }

    pub fn with_bt_source(mut self, source: Arc<dyn BtSource>) -> Self {
        self.bt_source = source;
        self
    }

    pub fn build(self) -> Scheduler<D> {
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (bound_tx, bound_rx) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);
        Scheduler(Arc::new(Inner {
            db: self.db,
            hub: self.hub,
            staging: self.staging,
            query: self.query,
            hops: self.hops,
            message_log: self.message_log,
            network: self.network,
            pub_source: self.pub_source,
            lan_source: self.lan_source,
            bt_source: self.bt_source,
            clock: self.clock,
            rng: self.rng,
            config: self.config,
            network_cache: NetworkCache::new(),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tick_scheduled: AtomicBool::new(false),
            tick_tx,
            tick_rx: AsyncMutex::new(Some(tick_rx)),
            bound_tx,
            bound_rx,
            closed_tx,
            tasks: AsyncMutex::new(Vec::new()),
        }))
    }
}

/// Per-class debounce state, only ever touched by the single tick task —
/// spec §5's "single mutex or single-task mailbox is sufficient" taken
/// literally by not sharing this state at all.
#[derive(Default)]
struct ClassDebounceStates {
    seed: crate::query::GroupDebounce,
    any_when_empty: crate::query::GroupDebounce,
    room: crate::query::GroupDebounce,
    has_pinged: crate::query::GroupDebounce,
    has_no_attempts: crate::query::GroupDebounce,
    has_only_failed_attempts: crate::query::GroupDebounce,
    is_legacy: crate::query::GroupDebounce,
}

/// Policy-driven control loop over the Database/Hub/Staging pools.
pub struct Scheduler<D>(Arc<Inner<D>>);

impl<D> Clone for Scheduler<D> {
    fn clone(&self) -> Self {
        Scheduler(self.0.clone())
    }
}

impl<D: Dialer + 'static> Scheduler<D> {
    /// Resolves once `start` has finished wiring the scheduler, per design
    /// note §9 ("expose scheduler binding explicitly rather than polling").
    pub async fn bound(&self) {
        let mut rx = self.0.bound_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Idempotent if already running.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        if self
            .0
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.purge_undurable_records().await;
        self.populate_seeds().await;
        self.wire_triggers().await;
        self.wire_discovery().await;

        let _ = self.0.bound_tx.send(true);
        self.spawn_tick_loop();
        self.update_soon(constants::TICK_PERIOD);
        info!("scheduler started");
    }

    /// Stops LAN discovery, resets the Hub, and marks the scheduler
    /// closed; subsequent `updateSoon` calls are dropped silently.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        let _ = self.0.closed_tx.send(true);
        let mut tasks = self.0.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);
        self.0.hub.reset().await;
        info!("scheduler stopped");
    }

    async fn purge_undurable_records(&self) {
        for (addr, record) in self.0.db.entries().await {
            let undurable = matches!(record.source, Source::Local | Source::Bt)
                || matches!(record.kind, PeerType::Lan | PeerType::Bt);
            if undurable {
                self.0.db.delete(&addr).await;
            }
        }
    }

    async fn populate_seeds(&self) {
        let now = self.0.clock.now_ms();
        for addr in self.0.config.parsed_seeds() {
            let key = match addr.require_key() {
                Ok(key) => key,
                Err(_) => continue,
            };
            let mut record = PeerRecord::new(key, Source::Seed, PeerType::Internet, now);
            record.host = Some(addr.host().to_string());
            record.port = addr.port();
            self.0.db.set(addr, record).await;
        }
    }

    async fn wire_triggers(&self) {
        let this = self.clone();
        let mut hub_events = self.0.hub.listen();
        let handle = tokio::spawn(async move {
            loop {
                match hub_events.recv().await {
                    Ok(event) => {
                        this.sync_dial_outcome_to_db(&event).await;
                        if event.kind == HubEventKind::Disconnected {
                            this.update_soon(constants::WAKEUP_DEBOUNCE);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.0.tasks.lock().await.push(handle);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(constants::REGULAR_INTERVAL);
            loop {
                interval.tick().await;
                this.update_soon(constants::TICK_PERIOD);
            }
        });
        self.0.tasks.lock().await.push(handle);
    }

    /// Writes the Hub's latest attempt/failure/ping stats for `event`'s
    /// address back into the address book, so next tick's backoff check
    /// (which reads DB records, not Hub ones) sees the outcome. Only
    /// touches addresses the book already remembers: LAN/BT/pub candidates
    /// dialed straight out of Staging never gain a durable entry this way.
    async fn sync_dial_outcome_to_db(&self, event: &crate::hub::HubEvent) {
        if !matches!(
            event.kind,
            HubEventKind::ConnectingFailed | HubEventKind::Connected | HubEventKind::Disconnected
        ) {
            return;
        }
        if !self.0.db.has(&event.address).await {
            return;
        }
        if let Some(entry) = self
            .0
            .hub
            .entries()
            .await
            .into_iter()
            .find(|(addr, _)| addr == &event.address)
            .map(|(_, entry)| entry)
        {
            self.0.db.set(event.address.clone(), entry.record).await;
        }
    }

    async fn wire_discovery(&self) {
        let this = self.clone();
        let mut rx = self.0.pub_source.subscribe();
        let handle = tokio::spawn(async move {
            let mut last_processed: Option<u64> = None;
            while let Some(message) = rx.recv().await {
                while this.staged_pub_count().await >= constants::PUB_STAGING_LIMIT {
                    if this.0.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                let now = this.0.clock.now_ms();
                if let Some(last) = last_processed {
                    let elapsed = now.saturating_sub(last);
                    if elapsed < constants::PUB_MESSAGE_THROTTLE.as_millis() as u64 {
                        tokio::time::sleep(Duration::from_millis(
                            constants::PUB_MESSAGE_THROTTLE.as_millis() as u64 - elapsed,
                        ))
                        .await;
                    }
                }
                last_processed = Some(this.0.clock.now_ms());
                this.on_pub_message(&message.address).await;
            }
        });
        self.0.tasks.lock().await.push(handle);

        let this = self.clone();
        let mut rx = self.0.lan_source.subscribe();
        let handle = tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                this.on_lan_candidate(candidate).await;
            }
        });
        self.0.tasks.lock().await.push(handle);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(constants::BT_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if this.0.closed.load(Ordering::SeqCst) {
                    return;
                }
                for device in this.0.bt_source.poll() {
                    this.on_bt_device(device).await;
                }
            }
        });
        self.0.tasks.lock().await.push(handle);
    }

    async fn staged_pub_count(&self) -> usize {
        self.0
            .staging
            .entries()
            .await
            .into_iter()
            .filter(|(_, r)| r.kind == PeerType::Pub)
            .count()
    }

    async fn on_pub_message(&self, raw_address: &str) {
        let addr = match Address::parse(raw_address) {
            Ok(addr) => addr,
            Err(error) => {
                debug!(%error, "discarding invalid pub address");
                return;
            }
        };
        if self.0.db.has(&addr).await {
            return;
        }
        let key = match addr.require_key() {
            Ok(key) => key,
            Err(_) => return,
        };
        let now = self.0.clock.now_ms();
        let mut record = PeerRecord::new(key, Source::Pub, PeerType::Pub, now);
        record.host = Some(addr.host().to_string());
        record.port = addr.port();
        self.0.staging.stage(addr.clone(), record.clone()).await;
        record.autoconnect = false;
        self.0.db.set(addr, record).await;
    }

    async fn on_lan_candidate(&self, candidate: discovery::LanCandidate) {
        let addr = match Address::parse(&candidate.address) {
            Ok(addr) => addr,
            Err(error) => {
                debug!(%error, "discarding invalid lan address");
                return;
            }
        };
        let key = match addr.require_key() {
            Ok(key) => key,
            Err(_) => return,
        };
        let now = self.0.clock.now_ms();
        let mut record = PeerRecord::new(key, Source::Local, PeerType::Lan, now);
        record.host = Some(addr.host().to_string());
        record.port = addr.port();
        record.verified = Some(candidate.verified);

        if is_followed(self.0.hops.as_ref(), key) {
            let _ = self.0.hub.connect(addr, Some(record)).await;
        } else {
            self.0.staging.stage(addr, record).await;
        }
    }

    async fn on_bt_device(&self, device: discovery::BtDevice) {
        let addr = Address::bluetooth(&device.mac_no_colons, device.key);
        let now = self.0.clock.now_ms();
        let mut record = PeerRecord::new(device.key, Source::Bt, PeerType::Bt, now);
        record.host = Some(addr.host().to_string());

        if is_followed(self.0.hops.as_ref(), device.key) {
            let _ = self.0.hub.connect(addr, Some(record)).await;
        } else {
            self.0.staging.stage(addr, record).await;
        }
    }

    /// Schedules a single upcoming tick. Redundant calls collapse. The
    /// delay is fuzzed to `period * (0.5 + U[0,1))` (spec §4.6.1) so peers
    /// ticking on the same wall clock don't all dial each other at once.
    pub fn update_soon(&self, period: Duration) {
        if self.0.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .0
            .tick_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let fuzz = 0.5 + self.0.rng.next_f64();
        let delay = Duration::from_secs_f64(period.as_secs_f64() * fuzz);
        let tx = self.0.tick_tx.clone();
        let scheduled = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduled.0.tick_scheduled.store(false, Ordering::SeqCst);
            let _ = tx.try_send(());
        });
    }

    fn spawn_tick_loop(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut rx = this
                .0
                .tick_rx
                .lock()
                .await
                .take()
                .expect("tick loop spawned exactly once");
            let mut closed_rx = this.0.closed_tx.subscribe();
            let mut debounce = ClassDebounceStates::default();
            loop {
                tokio::select! {
                    _ = closed_rx.changed() => {
                        if *closed_rx.borrow() {
                            break;
                        }
                    }
                    tick = rx.recv() => {
                        if tick.is_none() {
                            break;
                        }
                        this.update_now(&mut debounce).await;
                    }
                }
            }
        });
    }

    /// Runs `updateStaging` then `updateHub`, unless suppressed by the
    /// download-in-progress heuristic or a collaborator that isn't ready
    /// yet (spec §4.6.1). Always runs to completion before the next tick
    /// may start: this is the only call site for `update_now`, and it's
    /// only ever invoked from the single tick-loop task.
    #[instrument(skip_all)]
    async fn update_now(&self, debounce: &mut ClassDebounceStates) {
        if !self.0.message_log.is_ready() {
            trace!("suppressing tick: message log not ready");
            return;
        }
        let now = self.0.clock.now_ms();
        if let Some(last) = self.0.message_log.last_message_at_ms() {
            if now.saturating_sub(last) < constants::DOWNLOAD_HEURISTIC_WINDOW.as_millis() as u64 {
                trace!("suppressing tick: download in progress");
                return;
            }
        }
        if !self.0.hops.is_loaded() {
            trace!("suppressing tick: hops table loading");
            return;
        }

        let started = std::time::Instant::now();
        self.update_staging(now).await;
        self.update_hub(now, debounce).await;
        metrics::histogram!("gossip_conn_tick_duration_seconds", started.elapsed().as_secs_f64());
    }

    async fn update_staging(&self, now: u64) {
        for (addr, record) in self.0.db.entries().await {
            if !record.autoconnect && !is_blocked(self.0.hops.as_ref(), record.key) {
                let mut staged = record.clone();
                staged.staging_updated = Some(now);
                self.0.staging.stage(addr, staged).await;
            }
        }

        for (addr, record) in self.0.staging.entries().await {
            if is_blocked(self.0.hops.as_ref(), record.key) {
                self.0.staging.unstage(&addr).await;
                continue;
            }
            let updated = record.staging_updated.unwrap_or(now);
            let age = now.saturating_sub(updated);
            let expired = match record.kind {
                PeerType::Lan => age >= constants::LAN_STAGING_TTL.as_millis() as u64,
                PeerType::Bt => age >= constants::BT_STAGING_TTL.as_millis() as u64,
                _ => false,
            };
            if expired {
                self.0.staging.unstage(&addr).await;
            }
        }
    }

    #[instrument(skip_all)]
    async fn update_hub(&self, now: u64, debounce: &mut ClassDebounceStates) {
        let ctx = ClassContext {
            query: &self.0.query,
            hub: &self.0.hub,
            hops: self.0.hops.as_ref(),
            network: self.0.network.as_ref(),
            network_cache: &self.0.network_cache,
            clock: self.0.clock.as_ref(),
            rng: self.0.rng.as_ref(),
            now_ms: now,
        };
        let classes = &self.0.config.classes;

        if self.0.config.gossip_seed {
            update_class(
                "seed",
                |r| r.source == Source::Seed,
                classes.seed,
                &ctx,
                &mut debounce.seed,
                || true,
            )
            .await;
        }

        // Recomputed here, not hoisted to the top of this function: the
        // seed pass above may have already filled peersInConnection by
        // the time this class runs, since `Hub::connect` is awaited to
        // completion.
        let globally_empty_now = self.0.query.peers_in_connection().await.is_empty();
        update_class(
            "any-when-empty",
            |_| true,
            classes.any_when_empty,
            &ctx,
            &mut debounce.any_when_empty,
            || globally_empty_now,
        )
        .await;

        update_class(
            "room",
            |r| r.kind == PeerType::Room,
            classes.room,
            &ctx,
            &mut debounce.room,
            || true,
        )
        .await;

        update_class(
            "has-pinged",
            crate::query::has_pinged,
            classes.has_pinged,
            &ctx,
            &mut debounce.has_pinged,
            || true,
        )
        .await;

        update_class(
            "has-no-attempts",
            crate::query::has_no_attempts,
            classes.has_no_attempts,
            &ctx,
            &mut debounce.has_no_attempts,
            || true,
        )
        .await;

        update_class(
            "has-only-failed-attempts",
            crate::query::has_only_failed_attempts,
            classes.has_only_failed_attempts,
            &ctx,
            &mut debounce.has_only_failed_attempts,
            || true,
        )
        .await;

        update_class(
            "is-legacy",
            crate::query::is_legacy,
            classes.is_legacy,
            &ctx,
            &mut debounce.is_legacy,
            || true,
        )
        .await;

        let promoted =
            promote_followed_staged(&ctx, &self.0.staging, constants::MAX_FOLLOWED_STAGED_PROMOTIONS)
                .await;
        let blocked = disconnect_newly_blocked(&ctx).await;
        let frustrating = disconnect_frustrating(&ctx, constants::FRUSTRATING_GRACE).await;
        let stale = disconnect_long_lived(&ctx, constants::INTERNET_MAX_LIFETIME).await;

        if promoted + blocked + frustrating + stale > 0 {
            debug!(promoted, blocked, frustrating, stale, "tick cleanup actions");
        }
    }

    /// Runs one tick immediately, bypassing the usual fuzzed delay and the
    /// persistent per-class debounce state the background tick loop
    /// carries. Exposed for integration tests and operational tooling;
    /// production code should call [`Self::update_soon`].
    pub async fn force_tick(&self) {
        let mut debounce = ClassDebounceStates::default();
        self.update_now(&mut debounce).await;
    }

    /// Hub reset on wakeup; the Hub's `disconnected` events it produces
    /// schedule the follow-up tick via [`Self::wire_triggers`].
    pub async fn on_wakeup(&self) {
        self.0.hub.reset().await;
    }

    /// Hub reset on a network interface change, same shape as wakeup.
    pub async fn on_network_change(&self) {
        self.0.hub.reset().await;
    }

    pub fn db(&self) -> &AddressBook {
        &self.0.db
    }

    pub fn hub(&self) -> &Hub<D> {
        &self.0.hub
    }

    pub fn staging(&self) -> &Staging {
        &self.0.staging
    }

    pub fn query(&self) -> &Query {
        &self.0.query
    }
}
