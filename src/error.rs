//! Error types shared across the connection-management core.

use crate::address::Address;

/// Errors returned by the core's public operations.
///
/// Validation errors are returned synchronously to the caller. Transport
/// errors never reach here directly: they surface as [`crate::hub::HubEvent`]
/// and rejected [`crate::hub::Hub::connect`] futures instead, see
/// `src/hub.rs`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnError {
    /// The address string did not parse as a multiserver address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The address parsed but carries no (or a malformed) ed25519 key.
    #[error("address is missing an ed25519 key: {0}")]
    MissingKey(String),

    /// `connect` was called against an address with a live Hub entry.
    #[error("already connected: {0}")]
    AlreadyConnected(Address),

    /// A lookup by [`crate::address::FeedId`] found no matching DB entry.
    #[error("unknown peer")]
    UnknownPeer,

    /// The operation was attempted on a pool or scheduler after `close`/`stop`.
    #[error("shutdown")]
    Shutdown,

    /// A transport dial failed. Carries the dialer's opaque error message;
    /// the dialer implementation itself is out of scope for this core.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Durable storage I/O failed.
    #[error("storage error: {0}")]
    Io(String),
}
