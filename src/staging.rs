//! The ephemeral candidate pool, spec §4.3.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};

use crate::address::Address;
use crate::hub::{Dialer, Hub};
use crate::record::PeerRecord;

/// Whatever Staging needs to know about the Hub, decoupled from the Hub's
/// dialer type parameter so `Staging` itself stays non-generic.
#[async_trait]
pub trait LiveChecker: Send + Sync {
    async fn is_live(&self, addr: &Address) -> bool;
}

#[async_trait]
impl<D: Dialer + 'static> LiveChecker for Hub<D> {
    async fn is_live(&self, addr: &Address) -> bool {
        self.get_state(addr)
            .await
            .map(|s| s.is_in_connection())
            .unwrap_or(false)
    }
}

struct Inner {
    entries: AsyncMutex<IndexMap<Address, PeerRecord>>,
    hub: Arc<dyn LiveChecker>,
    live_tx: watch::Sender<Arc<IndexMap<Address, PeerRecord>>>,
    staged_tx: broadcast::Sender<Address>,
}

/// Ephemeral set of candidate addresses with per-entry metadata.
#[derive(Clone)]
pub struct Staging(Arc<Inner>);

impl Staging {
    pub fn new(hub: Arc<dyn LiveChecker>) -> Staging {
        let (live_tx, _) = watch::channel(Arc::new(IndexMap::new()));
        let (staged_tx, _) = broadcast::channel(256);
        Staging(Arc::new(Inner {
            entries: AsyncMutex::new(IndexMap::new()),
            hub,
            live_tx,
            staged_tx,
        }))
    }

    /// Emits the address of every successful `stage` call, consumed by
    /// [`crate::glue::InterpoolGlue`] to re-check the live-vs-staged
    /// invariant.
    pub fn listen_staged(&self) -> broadcast::Receiver<Address> {
        self.0.staged_tx.subscribe()
    }

    /// Inserts `data` if `addr` is not already staged and not live in the
    /// Hub. Returns whether the insertion happened.
    pub async fn stage(&self, addr: Address, data: PeerRecord) -> bool {
        if self.0.hub.is_live(&addr).await {
            return false;
        }
        let mut guard = self.0.entries.lock().await;
        if guard.contains_key(&addr) {
            return false;
        }
        guard.insert(addr.clone(), data);
        let staging_size = guard.len();
        self.publish_locked(&guard);
        drop(guard);
        metrics::gauge!("gossip_conn_staging_size", staging_size as f64);
        let _ = self.0.staged_tx.send(addr);
        true
    }

    pub async fn unstage(&self, addr: &Address) -> Option<PeerRecord> {
        let mut guard = self.0.entries.lock().await;
        let removed = guard.shift_remove(addr);
        if removed.is_some() {
            let staging_size = guard.len();
            self.publish_locked(&guard);
            drop(guard);
            metrics::gauge!("gossip_conn_staging_size", staging_size as f64);
        }
        removed
    }

    pub async fn get(&self, addr: &Address) -> Option<PeerRecord> {
        self.0.entries.lock().await.get(addr).cloned()
    }

    pub async fn entries(&self) -> Vec<(Address, PeerRecord)> {
        self.0
            .entries
            .lock()
            .await
            .iter()
            .map(|(a, r)| (a.clone(), r.clone()))
            .collect()
    }

    pub fn live_entries(&self) -> watch::Receiver<Arc<IndexMap<Address, PeerRecord>>> {
        self.0.live_tx.subscribe()
    }

    /// Drains the pool. Staging has no background task of its own to stop;
    /// this exists so callers can release all candidates uniformly with
    /// the other two pools at shutdown.
    pub async fn close(&self) {
        let mut guard = self.0.entries.lock().await;
        guard.clear();
        self.publish_locked(&guard);
    }

    fn publish_locked(&self, guard: &IndexMap<Address, PeerRecord>) {
        let _ = self.0.live_tx.send(Arc::new(guard.clone()));
    }
}
