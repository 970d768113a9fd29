//! Cross-pool invariant enforcement, spec §4.5.
//!
//! Each pool already guards its own half of the invariant inline
//! (`Staging::stage` refuses live addresses, `Hub::connect` doesn't touch
//! Staging) but a race between the two locks is possible: an address can be
//! staged in the instant between a Hub dial checking Staging and actually
//! landing in the `connecting` state. `InterpoolGlue` is the reconciler
//! that runs on every event from both pools and restores the invariant
//! rather than trying to prevent the race with a bigger lock, the same
//! "react to the event, don't serialize everything behind one giant
//! critical section" shape the scheduler itself uses (spec §5: "a single
//! mutex or single-task mailbox is sufficient").

use tokio::sync::broadcast::error::RecvError;
use tracing::{instrument, trace};

use crate::hub::{Dialer, Hub, HubEventKind};
use crate::staging::Staging;

/// Subscribes to both pools' event streams and unstages any address that
/// becomes live, in either order of arrival.
pub struct InterpoolGlue {
    handle: tokio::task::JoinHandle<()>,
}

impl InterpoolGlue {
    pub fn spawn<D: Dialer + 'static>(hub: Hub<D>, staging: Staging) -> InterpoolGlue {
        let mut hub_events = hub.listen();
        let mut staged_events = staging.listen_staged();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = hub_events.recv() => {
                        match event {
                            Ok(event) if matches!(event.kind, HubEventKind::Connecting | HubEventKind::Connected) => {
                                if staging.unstage(&event.address).await.is_some() {
                                    trace!(address = %event.address, "unstaged address that became live");
                                }
                            }
                            Ok(_) => {}
                            Err(RecvError::Lagged(_)) => continue,
                            Err(RecvError::Closed) => break,
                        }
                    }
                    addr = staged_events.recv() => {
                        match addr {
                            Ok(addr) => {
                                if hub.get_state(&addr).await.map(|s| s.is_in_connection()).unwrap_or(false) {
                                    staging.unstage(&addr).await;
                                }
                            }
                            Err(RecvError::Lagged(_)) => continue,
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
        InterpoolGlue { handle }
    }

    #[instrument(skip(self))]
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for InterpoolGlue {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
