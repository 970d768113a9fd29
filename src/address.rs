//! Multiserver addresses and feed identities.
//!
//! [Address format](https://github.com/ssbc/multiserver): `transport:host:port~auth:key`,
//! with Bluetooth and DHT variants that omit the numeric port or the key.

use std::convert::TryInto;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConnError;

lazy_static! {
    // transport : endpoint ~ auth [ : key ]
    static ref ADDRESS_RE: Regex =
        Regex::new(r"^(?P<transport>[a-zA-Z]+):(?P<endpoint>[^~]+)~(?P<auth>[a-zA-Z0-9]+)(?::(?P<key>.+))?$")
            .expect("static address regex is valid");
}

/// Recognized transports. `net` is plain TCP; the others are the
/// alternate reachability strategies this overlay supports.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Net,
    Onion,
    Bt,
    Dht,
    Lan,
}

impl Transport {
    /// Transports whose endpoint is `host:port` rather than an opaque token.
    fn has_numeric_port(self) -> bool {
        matches!(self, Transport::Net | Transport::Onion | Transport::Lan)
    }

    fn as_str(self) -> &'static str {
        match self {
            Transport::Net => "net",
            Transport::Onion => "onion",
            Transport::Bt => "bt",
            Transport::Dht => "dht",
            Transport::Lan => "lan",
        }
    }
}

impl FromStr for Transport {
    type Err = ConnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "net" => Ok(Transport::Net),
            "onion" => Ok(Transport::Onion),
            "bt" => Ok(Transport::Bt),
            "dht" => Ok(Transport::Dht),
            "lan" => Ok(Transport::Lan),
            other => Err(ConnError::InvalidAddress(format!(
                "unrecognized transport {other:?}"
            ))),
        }
    }
}

/// A peer's long-lived ed25519 public identity, canonically
/// `@<base64>.ed25519`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FeedId([u8; 32]);

impl FeedId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        FeedId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses the bare base64 key embedded in a multiserver address (no
    /// `@`/`.ed25519` decoration).
    fn from_raw_base64(raw: &str) -> Result<Self, ConnError> {
        let bytes = base64::decode(raw)
            .map_err(|_| ConnError::MissingKey(format!("key is not valid base64: {raw}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            ConnError::MissingKey("ed25519 key must be exactly 32 bytes".to_string())
        })?;
        Ok(FeedId(bytes))
    }

    fn to_raw_base64(self) -> String {
        base64::encode(self.0)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.ed25519", self.to_raw_base64())
    }
}

impl fmt::Debug for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedId({self})")
    }
}

impl FromStr for FeedId {
    type Err = ConnError;

    /// Accepts either the canonical `@base64.ed25519` form or the bare
    /// base64 payload as it appears inside a multiserver address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix('@')
            .and_then(|s| s.strip_suffix(".ed25519"))
            .unwrap_or(s);
        FeedId::from_raw_base64(raw)
    }
}

/// A parsed, validated multiserver address.
///
/// `Address` is the identity used by the pools: two addresses are equal iff
/// their canonical string forms are equal, matching the source's use of the
/// address string itself as a map key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Address {
    transport: Transport,
    host: String,
    port: Option<u16>,
    auth: String,
    key: Option<FeedId>,
}

impl Address {
    pub fn parse(raw: &str) -> Result<Address, ConnError> {
        let caps = ADDRESS_RE
            .captures(raw)
            .ok_or_else(|| ConnError::InvalidAddress(raw.to_string()))?;

        let transport: Transport = caps["transport"].parse()?;
        let endpoint = &caps["endpoint"];
        let auth = caps["auth"].to_string();
        let key = match caps.name("key") {
            Some(m) => Some(FeedId::from_str(m.as_str())?),
            None => None,
        };

        let (host, port) = if transport.has_numeric_port() {
            let (host, port_str) = endpoint
                .rsplit_once(':')
                .ok_or_else(|| ConnError::InvalidAddress(raw.to_string()))?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| ConnError::InvalidAddress(raw.to_string()))?;
            (host.to_string(), Some(port))
        } else {
            (endpoint.to_string(), None)
        };

        Ok(Address {
            transport,
            host,
            port,
            auth,
            key,
        })
    }

    /// Builds a `bt:<mac-no-colons>~shs:<key>` address for a discovered
    /// nearby device, per the wire format in spec §6.
    pub fn bluetooth(mac_no_colons: &str, key: FeedId) -> Address {
        Address {
            transport: Transport::Bt,
            host: mac_no_colons.to_string(),
            port: None,
            auth: "shs".to_string(),
            key: Some(key),
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn key(&self) -> Option<FeedId> {
        self.key
    }

    /// The key, or [`ConnError::MissingKey`] if this address carries none
    /// (e.g. a `noauth` DHT bootstrap address).
    pub fn require_key(&self) -> Result<FeedId, ConnError> {
        self.key
            .ok_or_else(|| ConnError::MissingKey(self.to_string()))
    }

    /// `true` for loopback/unspecified hosts, used by the network
    /// reachability predicate in the scheduler.
    pub fn is_loopback_host(&self) -> bool {
        match self.host.parse::<std::net::IpAddr>() {
            Ok(ip) => ip.is_loopback(),
            Err(_) => self.host == "localhost",
        }
    }

    /// `true` for RFC1918/link-local-style private hosts, used by the
    /// `isLocal` predicate.
    pub fn is_private_host(&self) -> bool {
        match self.host.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(ip)) => {
                ip.is_private() || ip.is_link_local() || ip.is_loopback()
            }
            Ok(std::net::IpAddr::V6(ip)) => ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00,
            Err(_) => false,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}:{}~{}", self.transport.as_str(), self.host, port, self.auth)?,
            None => write!(f, "{}:{}~{}", self.transport.as_str(), self.host, self.auth)?,
        }
        if let Some(key) = self.key {
            write!(f, ":{}", key.to_raw_base64())?;
        }
        Ok(())
    }
}
