//! `LegacyApi`: a thin adapter preserving the old single-call RPC surface
//! (`peers`/`get`/`connect`/`disconnect`/`changes`/`add`/`remove`/
//! `reconnect`/`enable`/`disable`) over the Database/Hub/Staging pools,
//! spec §7. New callers should use [`crate::query::Query`] and the pools
//! directly; this exists only so callers ported from the old single-module
//! API keep working.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::warn;

use crate::address::Address;
use crate::clock::Clock;
use crate::config::constants::DEPRECATION_WARNING_INTERVAL;
use crate::db::AddressBook;
use crate::error::ConnError;
use crate::hub::{Dialer, Hub, HubEntry, HubEvent};
use crate::record::{PeerRecord, Source};
use std::sync::Arc;

/// Adapter over [`Hub`] and [`AddressBook`] exposing the deprecated flat
/// RPC surface. `enable`/`disable` are no-ops: the scheduler's running
/// state is no longer something this surface can toggle.
pub struct LegacyApi<D> {
    db: AddressBook,
    hub: Hub<D>,
    clock: Arc<dyn Clock>,
    last_peers_warning_ms: AtomicU64,
}

impl<D: Dialer + 'static> LegacyApi<D> {
    pub fn new(db: AddressBook, hub: Hub<D>, clock: Arc<dyn Clock>) -> LegacyApi<D> {
        LegacyApi {
            db,
            hub,
            clock,
            last_peers_warning_ms: AtomicU64::new(0),
        }
    }

    /// Returns every Hub entry. Deprecated in favor of
    /// [`crate::query::Query::peers_in_connection`]; unlike every other
    /// alias on this surface, `peers` warns at most once per
    /// [`DEPRECATION_WARNING_INTERVAL`] rather than every call, since a
    /// caller polling it in a loop would otherwise flood the log.
    pub async fn peers(&self) -> Vec<(Address, HubEntry)> {
        self.warn_deprecated("peers");
        self.hub.entries().await
    }

    /// Looks up a single address: the live Hub entry if present, otherwise
    /// the durable record.
    pub async fn get(&self, addr: &Address) -> Option<PeerRecord> {
        warn!(call = "get", "legacy RPC surface is deprecated, prefer Query");
        if let Some(state) = self.hub.get_state(addr).await {
            if state.is_in_connection() {
                return self.hub.entries().await.into_iter().find_map(|(a, e)| {
                    if &a == addr {
                        Some(e.record)
                    } else {
                        None
                    }
                });
            }
        }
        self.db.get(addr).await
    }

    pub async fn connect(&self, addr: Address) -> Result<(), ConnError> {
        warn!(call = "connect", "legacy RPC surface is deprecated, prefer Query");
        self.hub.connect(addr, None).await
    }

    pub async fn disconnect(&self, addr: &Address) -> Result<(), ConnError> {
        warn!(call = "disconnect", "legacy RPC surface is deprecated, prefer Query");
        self.hub.disconnect(addr).await
    }

    /// Tears a connection down and immediately redials it, using whatever
    /// record the Hub already has for it.
    pub async fn reconnect(&self, addr: &Address) -> Result<(), ConnError> {
        warn!(call = "reconnect", "legacy RPC surface is deprecated, prefer Query");
        let record = self
            .hub
            .entries()
            .await
            .into_iter()
            .find(|(a, _)| a == addr)
            .map(|(_, e)| e.record);
        self.hub.disconnect(addr).await?;
        self.hub.connect(addr.clone(), record).await
    }

    pub fn changes(&self) -> broadcast::Receiver<HubEvent> {
        warn!(call = "changes", "legacy RPC surface is deprecated, prefer Query");
        self.hub.listen()
    }

    /// Remembers `addr` in the address book. Rejected for
    /// `source == 'local'`: LAN candidates are ephemeral Staging citizens
    /// by design (spec §9's open-question decision), and the old RPC
    /// surface must honor that even though its caller can't express
    /// "stage this" directly.
    pub async fn add(&self, addr: Address, record: PeerRecord) -> Result<(), ConnError> {
        warn!(call = "add", "legacy RPC surface is deprecated, prefer Query");
        if record.source == Source::Local {
            return Err(ConnError::InvalidAddress(
                "local-source peers cannot be added through the legacy add() call".to_string(),
            ));
        }
        self.db.set(addr, record).await;
        Ok(())
    }

    pub async fn remove(&self, addr: &Address) {
        warn!(call = "remove", "legacy RPC surface is deprecated, prefer Query");
        self.db.delete(addr).await;
    }

    /// No-op: see the struct-level doc comment.
    pub fn enable(&self) {
        warn!(call = "enable", "legacy RPC surface is deprecated, prefer Query");
    }

    /// No-op: see the struct-level doc comment.
    pub fn disable(&self) {
        warn!(call = "disable", "legacy RPC surface is deprecated, prefer Query");
    }

    fn warn_deprecated(&self, call: &str) {
        let now = self.clock.now_ms();
        let last = self.last_peers_warning_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < DEPRECATION_WARNING_INTERVAL.as_millis() as u64 {
            return;
        }
        self.last_peers_warning_ms.store(now, Ordering::Relaxed);
        warn!(call, "legacy RPC surface is deprecated, prefer Query");
    }
}
