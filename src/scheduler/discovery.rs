//! Pluggable discovery and social-graph collaborators, spec §4.6.4 and
//! design note §9: "model each collaborator as an optional interface; the
//! scheduler accepts them by construction; absent collaborators are
//! represented as a null-object implementation rather than runtime
//! feature detection."

use tokio::sync::mpsc;

use crate::address::FeedId;

/// A `type=='pub'` message observed on the message log.
#[derive(Clone, Debug)]
pub struct PubMessage {
    pub address: String,
}

/// Announces long-running rendezvous peers via the message log.
pub trait PubSource: Send + Sync {
    fn subscribe(&self) -> mpsc::Receiver<PubMessage>;
}

/// No message-log pub intake wired up.
pub struct NoPubSource;

impl PubSource for NoPubSource {
    fn subscribe(&self) -> mpsc::Receiver<PubMessage> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }
}

/// A candidate observed by the LAN beacon.
#[derive(Clone, Debug)]
pub struct LanCandidate {
    pub address: String,
    pub verified: bool,
}

/// LAN broadcast discovery.
pub trait LanSource: Send + Sync {
    fn subscribe(&self) -> mpsc::Receiver<LanCandidate>;
}

pub struct NoLanSource;

impl LanSource for NoLanSource {
    fn subscribe(&self) -> mpsc::Receiver<LanCandidate> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }
}

/// A nearby device observed by a Bluetooth scan.
#[derive(Clone, Debug)]
pub struct BtDevice {
    pub mac_no_colons: String,
    pub key: FeedId,
}

/// Bluetooth nearby-device scanning, polled rather than streamed per spec
/// §4.6.4's "poll interval 1s".
pub trait BtSource: Send + Sync {
    fn poll(&self) -> Vec<BtDevice>;
}

pub struct NoBtSource;

impl BtSource for NoBtSource {
    fn poll(&self) -> Vec<BtDevice> {
        Vec::new()
    }
}

/// The social follow/block graph, reduced to the one projection the
/// scheduler needs: hop count per key. Out of scope: how hops are derived.
pub trait HopsProvider: Send + Sync {
    /// `false` while the hops table is still loading (spec §4.6.1).
    fn is_loaded(&self) -> bool;

    /// `Some(-1)` blocked, `Some(0)` self, `Some(1)` direct follow,
    /// `Some(n>1)` friend-of-friend, `None` unknown.
    fn hops(&self, key: FeedId) -> Option<i32>;
}

pub struct NoHopsProvider;

impl HopsProvider for NoHopsProvider {
    fn is_loaded(&self) -> bool {
        true
    }

    fn hops(&self, _key: FeedId) -> Option<i32> {
        None
    }
}

/// `true` iff `hops(key) == Some(1)`, a direct follow.
pub fn is_followed(hops: &dyn HopsProvider, key: FeedId) -> bool {
    hops.hops(key) == Some(1)
}

/// `true` iff `hops(key) == Some(-1)`, a block.
pub fn is_blocked(hops: &dyn HopsProvider, key: FeedId) -> bool {
    hops.hops(key) == Some(-1)
}

/// The message log, reduced to the projection the scheduler's
/// download-in-progress heuristic needs.
pub trait MessageLog: Send + Sync {
    fn is_ready(&self) -> bool;
    fn last_message_at_ms(&self) -> Option<u64>;
}

pub struct NoMessageLog;

impl MessageLog for NoMessageLog {
    fn is_ready(&self) -> bool {
        true
    }

    fn last_message_at_ms(&self) -> Option<u64> {
        None
    }
}

/// Underlying OS/process network reachability, behind the 1s cache the
/// `canBeConnected` predicate requires (spec §4.6.3).
pub trait NetworkStatus: Send + Sync {
    fn has_network(&self) -> bool;
}

pub struct AlwaysOnline;

impl NetworkStatus for AlwaysOnline {
    fn has_network(&self) -> bool {
        true
    }
}
