//! The value type stored in Staging and the address book, and the
//! connection state machine tracked by the Hub.

use serde::{Deserialize, Serialize};

use crate::address::FeedId;
use crate::error::ConnError;

/// Where a [`PeerRecord`] was learned from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Seed,
    Pub,
    Manual,
    Local,
    Friend,
    Dht,
    Bt,
}

/// Policy class of a peer, independent of [`Source`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    Internet,
    Lan,
    Bt,
    Pub,
    Room,
    Dht,
}

/// Rolling dial-failure statistics used by `passesExpBackoff`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureStats {
    pub count: u32,
    /// Wall-clock ms of the most recent failed attempt.
    pub last_attempt: Option<u64>,
}

/// Rolling round-trip-time statistics, populated once a heartbeat has
/// completed at least once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PingStats {
    pub rtt_mean_ms: Option<f64>,
    pub rtt_var_ms: Option<f64>,
}

/// Connection attempt/duration statistics independent of the live
/// [`ConnectionState`] the Hub tracks; this is the part that survives into
/// the address book after a peer disconnects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub attempts: u32,
    pub successes: u32,
    pub duration_ms: Option<u64>,
}

/// A candidate or remembered peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub key: FeedId,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub source: Source,
    #[serde(rename = "type")]
    pub kind: PeerType,
    #[serde(default = "default_autoconnect")]
    pub autoconnect: bool,
    /// Wall-clock ms of the last state transition observed for this record.
    pub state_change: u64,
    /// Wall-clock ms of the last staging refresh; only meaningful while
    /// this record lives in Staging.
    pub staging_updated: Option<u64>,
    #[serde(default)]
    pub failure: FailureStats,
    #[serde(default)]
    pub ping: PingStats,
    #[serde(default)]
    pub stats: ConnectionStats,
    pub verified: Option<bool>,
    pub note: Option<String>,
}

fn default_autoconnect() -> bool {
    true
}

impl PeerRecord {
    pub fn new(key: FeedId, source: Source, kind: PeerType, now_ms: u64) -> PeerRecord {
        PeerRecord {
            key,
            host: None,
            port: None,
            source,
            kind,
            autoconnect: true,
            state_change: now_ms,
            staging_updated: Some(now_ms),
            failure: FailureStats::default(),
            ping: PingStats::default(),
            stats: ConnectionStats::default(),
            verified: None,
            note: None,
        }
    }

    /// Merges `patch` over `self`, the way [`crate::db::AddressBook::set`]
    /// and [`crate::staging::Staging::stage`] combine a caller-supplied
    /// partial update with any existing record.
    pub fn merge(&mut self, patch: PeerRecord) {
        let PeerRecord {
            key,
            host,
            port,
            source,
            kind,
            autoconnect,
            state_change,
            staging_updated,
            failure,
            ping,
            stats,
            verified,
            note,
        } = patch;
        self.key = key;
        if host.is_some() {
            self.host = host;
        }
        if port.is_some() {
            self.port = port;
        }
        self.source = source;
        self.kind = kind;
        self.autoconnect = autoconnect;
        self.state_change = state_change;
        if staging_updated.is_some() {
            self.staging_updated = staging_updated;
        }
        self.failure = failure;
        self.ping = ping;
        self.stats = stats;
        if verified.is_some() {
            self.verified = verified;
        }
        if note.is_some() {
            self.note = note;
        }
    }
}

/// Hub connection state machine, see spec §3.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    ConnectingFailed(String),
}

impl ConnectionState {
    pub fn is_in_connection(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            ConnectionState::ConnectingFailed(reason) => Some(reason.as_str()),
            _ => None,
        }
    }
}

impl From<&ConnError> for ConnectionState {
    fn from(err: &ConnError) -> Self {
        ConnectionState::ConnectingFailed(err.to_string())
    }
}
