//! The durable address book, spec §4.1.
//!
//! Reads are synchronous against an in-memory image; writes are
//! upsert-then-debounced-flush, collapsing bursts of `set`/`delete` calls
//! into a single write within [`crate::config::constants::DB_FLUSH_INTERVAL`],
//! the same "collapse redundant schedules" shape the scheduler's
//! `updateSoon` uses for ticks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::address::{Address, FeedId};
use crate::clock::Clock;
use crate::config::constants::DB_FLUSH_INTERVAL;
use crate::error::ConnError;
use crate::record::PeerRecord;
use crate::store::Store;

struct Inner {
    entries: AsyncMutex<HashMap<Address, PeerRecord>>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    loaded_tx: watch::Sender<bool>,
    loaded_rx: watch::Receiver<bool>,
    flush_scheduled: AtomicBool,
    flush_notify: Notify,
    closed: AtomicBool,
}

/// Durable `Address -> PeerRecord` mapping with delayed-write persistence.
#[derive(Clone)]
pub struct AddressBook(Arc<Inner>);

impl AddressBook {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> AddressBook {
        let (loaded_tx, loaded_rx) = watch::channel(false);
        AddressBook(Arc::new(Inner {
            entries: AsyncMutex::new(HashMap::new()),
            store,
            clock,
            loaded_tx,
            loaded_rx,
            flush_scheduled: AtomicBool::new(false),
            flush_notify: Notify::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Loads the initial image from durable storage. Idempotent.
    pub async fn load(&self) -> Result<(), ConnError> {
        let loaded = self.0.store.load().await?;
        *self.0.entries.lock().await = loaded;
        let _ = self.0.loaded_tx.send(true);
        Ok(())
    }

    /// Completes once the initial load finishes.
    pub async fn loaded(&self) {
        let mut rx = self.0.loaded_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Upserts `data`, merging over any existing record for `addr`.
    pub async fn set(&self, addr: Address, data: PeerRecord) {
        let mut guard = self.0.entries.lock().await;
        match guard.get_mut(&addr) {
            Some(existing) => existing.merge(data),
            None => {
                guard.insert(addr, data);
            }
        }
        drop(guard);
        self.schedule_flush();
    }

    pub async fn delete(&self, addr: &Address) {
        let removed = self.0.entries.lock().await.remove(addr).is_some();
        if removed {
            self.schedule_flush();
        }
    }

    pub async fn get(&self, addr: &Address) -> Option<PeerRecord> {
        self.0.entries.lock().await.get(addr).cloned()
    }

    pub async fn has(&self, addr: &Address) -> bool {
        self.0.entries.lock().await.contains_key(addr)
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

    /// Scans entries for the first address whose key matches `id`, for
    /// legacy identity-based dial callers, spec §4.1.
    pub async fn get_address_for_id(&self, id: FeedId) -> Result<Address, ConnError> {
        self.0
            .entries
            .lock()
            .await
            .iter()
            .find(|(_, record)| record.key == id)
            .map(|(addr, _)| addr.clone())
            .ok_or(ConnError::UnknownPeer)
    }

    /// Forces an immediate flush, bypassing the debounce window. Used at
    /// shutdown and by `close`/reopen round-trip tests, spec §8 invariant 6.
    pub async fn flush_now(&self) -> Result<(), ConnError> {
        let snapshot = self.0.entries.lock().await.clone();
        self.0.store.flush(&snapshot).await
    }

    pub fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }

    fn schedule_flush(&self) {
        if self.0.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .0
            .flush_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // A flush is already pending; it will pick up this write too.
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DB_FLUSH_INTERVAL).await;
            this.0.flush_scheduled.store(false, Ordering::SeqCst);
            if this.0.closed.load(Ordering::SeqCst) {
                return;
            }
            match this.flush_now().await {
                Ok(()) => debug!("address book flushed"),
                Err(error) => warn!(%error, "address book flush failed"),
            }
            this.0.flush_notify.notify_waiters();
        });
    }

    /// Awaits the next scheduled flush completing; used in tests that need
    /// to observe a write landing before asserting on reopened state.
    #[cfg(test)]
    pub async fn wait_for_flush(&self) {
        self.0.flush_notify.notified().await;
    }
}
