//! The live connection registry, spec §4.2.
//!
//! The transport dialer is a pluggable collaborator, generic over `Hub<D>`
//! the same way `zebra-network`'s `CandidateSet<S>` is generic over its
//! peer-dialing `Service` (`zebra-network/src/peer_set/candidate_set.rs`).
//! Out of scope for this core: what `D::dial` actually does on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::address::{Address, FeedId};
use crate::clock::Clock;
use crate::error::ConnError;
use crate::record::{ConnectionState, PeerRecord};

/// A pluggable transport dialer. The cryptographic handshake that produces
/// a `connected` event is entirely the dialer's concern; this core only
/// reacts to its `Ok`/`Err` outcome.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &Address) -> Result<(), ConnError>;
}

/// A dialer that always fails, for exercising pool logic without a real
/// transport. Capability-based polymorphism per design note §9.
pub struct NullDialer;

#[async_trait]
impl Dialer for NullDialer {
    async fn dial(&self, addr: &Address) -> Result<(), ConnError> {
        Err(ConnError::Dial(format!("no dialer configured for {addr}")))
    }
}

/// One live registry entry: the last-known record plus its connection
/// state.
#[derive(Clone, Debug)]
pub struct HubEntry {
    pub record: PeerRecord,
    pub state: ConnectionState,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HubEventKind {
    Connecting,
    ConnectingFailed,
    Connected,
    Disconnected,
}

#[derive(Clone, Debug)]
pub struct HubEvent {
    pub kind: HubEventKind,
    pub address: Address,
    pub key: Option<FeedId>,
    pub details: Option<String>,
}

struct Inner<D> {
    entries: AsyncMutex<IndexMap<Address, HubEntry>>,
    inflight: AsyncMutex<HashMap<Address, JoinHandle<()>>>,
    dialer: Arc<D>,
    clock: Arc<dyn Clock>,
    events_tx: broadcast::Sender<HubEvent>,
    live_tx: watch::Sender<Arc<IndexMap<Address, HubEntry>>>,
    closed: AtomicBool,
}

/// Live registry of connections, plus a single broadcast event stream.
pub struct Hub<D = NullDialer>(Arc<Inner<D>>);

impl<D> Clone for Hub<D> {
    fn clone(&self) -> Self {
        Hub(self.0.clone())
    }
}

impl<D: Dialer + 'static> Hub<D> {
    pub fn new(dialer: Arc<D>, clock: Arc<dyn Clock>) -> Hub<D> {
        let (events_tx, _) = broadcast::channel(1024);
        let (live_tx, _) = watch::channel(Arc::new(IndexMap::new()));
        Hub(Arc::new(Inner {
            entries: AsyncMutex::new(IndexMap::new()),
            inflight: AsyncMutex::new(HashMap::new()),
            dialer,
            clock,
            events_tx,
            live_tx,
            closed: AtomicBool::new(false),
        }))
    }

    /// Initiates a dial. Resolves once the dialer reports success or
    /// failure; the Hub's own state transitions happen eagerly so
    /// `getState` reflects `connecting` immediately, before this future
    /// resolves.
    #[instrument(skip(self, data), fields(address = %addr))]
    pub async fn connect(&self, addr: Address, data: Option<PeerRecord>) -> Result<(), ConnError> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(ConnError::Shutdown);
        }

        {
            let mut guard = self.0.entries.lock().await;
            if let Some(existing) = guard.get(&addr) {
                if existing.state.is_in_connection() {
                    return Err(ConnError::AlreadyConnected(addr));
                }
            }
            let now = self.0.clock.now_ms();
            let record = self.build_record(&addr, data, now)?;
            guard.insert(
                addr.clone(),
                HubEntry {
                    record,
                    state: ConnectionState::Connecting,
                },
            );
            self.publish_locked(&guard);
        }
        self.emit(HubEventKind::Connecting, &addr, None);

        metrics::increment_counter!("gossip_conn_dial_attempts_total");

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let dial_addr = addr.clone();
        let handle = tokio::spawn(async move {
            let result = this.0.dialer.dial(&dial_addr).await;
            this.finish_dial(&dial_addr, &result).await;
            let _ = tx.send(result);
        });
        self.0.inflight.lock().await.insert(addr, handle);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnError::Shutdown),
        }
    }

    fn build_record(
        &self,
        addr: &Address,
        data: Option<PeerRecord>,
        now: u64,
    ) -> Result<PeerRecord, ConnError> {
        use crate::record::{PeerType, Source};
        let key = addr.require_key()?;
        let mut record = PeerRecord::new(key, Source::Manual, PeerType::Internet, now);
        record.host = Some(addr.host().to_string());
        record.port = addr.port();
        if let Some(patch) = data {
            record.merge(patch);
        }
        record.state_change = now;
        Ok(record)
    }

    async fn finish_dial(&self, addr: &Address, result: &Result<(), ConnError>) {
        self.0.inflight.lock().await.remove(addr);
        let now = self.0.clock.now_ms();
        let mut guard = self.0.entries.lock().await;
        let Some(entry) = guard.get_mut(addr) else {
            return;
        };
        entry.state = match result {
            Ok(()) => ConnectionState::Connected,
            Err(e) => ConnectionState::from(e),
        };
        entry.record.state_change = now;
        if result.is_ok() {
            entry.record.stats.successes += 1;
        }
        entry.record.stats.attempts += 1;
        if let Err(e) = result {
            entry.record.failure.count += 1;
            entry.record.failure.last_attempt = Some(now);
            warn!(%addr, error = %e, "dial failed");
        } else {
            info!(%addr, "connected");
        }
        let hub_size = guard.len();
        self.publish_locked(&guard);
        drop(guard);
        metrics::gauge!("gossip_conn_hub_size", hub_size as f64);
        match result {
            Ok(()) => {
                metrics::increment_counter!("gossip_conn_dial_success_total");
                self.emit(HubEventKind::Connected, addr, None)
            }
            Err(e) => {
                metrics::increment_counter!("gossip_conn_dial_failure_total");
                self.emit_with_details(HubEventKind::ConnectingFailed, addr, Some(e.to_string()))
            }
        }
    }

    /// Tears down the transport and marks `disconnected`. Idempotent on
    /// addresses without an entry.
    pub async fn disconnect(&self, addr: &Address) -> Result<(), ConnError> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(ConnError::Shutdown);
        }
        if let Some(handle) = self.0.inflight.lock().await.remove(addr) {
            handle.abort();
        }
        let now = self.0.clock.now_ms();
        let mut guard = self.0.entries.lock().await;
        if let Some(entry) = guard.get_mut(addr) {
            entry.state = ConnectionState::Disconnected;
            entry.record.state_change = now;
            self.publish_locked(&guard);
            drop(guard);
            self.emit(HubEventKind::Disconnected, addr, None);
        }
        Ok(())
    }

    pub async fn get_state(&self, addr: &Address) -> Option<ConnectionState> {
        self.0.entries.lock().await.get(addr).map(|e| e.state.clone())
    }

    pub async fn entries(&self) -> Vec<(Address, HubEntry)> {
        self.0
            .entries
            .lock()
            .await
            .iter()
            .map(|(a, e)| (a.clone(), e.clone()))
            .collect()
    }

    /// A restartable view of the full entry set, updated on every change.
    pub fn live_entries(&self) -> watch::Receiver<Arc<IndexMap<Address, HubEntry>>> {
        self.0.live_tx.subscribe()
    }

    /// An infinite stream of lifecycle events, totally ordered with
    /// respect to the Hub's own state transitions (spec §5).
    pub fn listen(&self) -> broadcast::Receiver<HubEvent> {
        self.0.events_tx.subscribe()
    }

    /// Forcibly disconnects every entry. Used on wakeup/network-change.
    pub async fn reset(&self) {
        let addrs: Vec<Address> = self.0.entries.lock().await.keys().cloned().collect();
        for addr in addrs {
            let _ = self.disconnect(&addr).await;
        }
    }

    /// Permanent shutdown: cancels all in-flight dials and rejects
    /// subsequent operations with [`ConnError::Shutdown`].
    pub async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        let mut inflight = self.0.inflight.lock().await;
        for (_, handle) in inflight.drain() {
            handle.abort();
        }
    }

    fn publish_locked(&self, guard: &IndexMap<Address, HubEntry>) {
        let _ = self.0.live_tx.send(Arc::new(guard.clone()));
    }

    fn emit(&self, kind: HubEventKind, addr: &Address, details: Option<String>) {
        self.emit_with_details(kind, addr, details)
    }

    fn emit_with_details(&self, kind: HubEventKind, addr: &Address, details: Option<String>) {
        let _ = self.0.events_tx.send(HubEvent {
            kind,
            address: addr.clone(),
            key: addr.key(),
            details,
        });
    }
}
