//! Configuration surface, spec §6, plus the scheduler class tuning table
//! spec §4.6.3 hard-codes — exposed as overridable defaults so tests can
//! shrink timings instead of waiting out real backoffs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::Address;

fn default_true() -> bool {
    true
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Clamps a configured ping timeout into `[10s, 30min]`, default 5min,
/// spec §6.
pub fn clamp_ping_timeout(requested: Duration) -> Duration {
    requested.clamp(Duration::from_secs(10), Duration::from_secs(30 * 60))
}

/// Top-level configuration, spec §6 "Configuration".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// DB storage directory.
    pub path: std::path::PathBuf,

    #[serde(default = "default_true")]
    pub conn_autostart: bool,

    #[serde(default = "default_true")]
    pub gossip_seed: bool,

    #[serde(default = "default_true")]
    pub gossip_pub: bool,

    #[serde(default)]
    pub gossip_auto_populate: bool,

    /// Seed addresses pre-populating the DB at first start.
    #[serde(default)]
    pub seeds: Vec<String>,

    #[serde(default = "default_ping_timeout", with = "humantime_ms")]
    pub ping_timeout: Duration,

    #[serde(default)]
    pub classes: ClassTable,
}

impl Config {
    pub fn parsed_seeds(&self) -> Vec<Address> {
        self.seeds
            .iter()
            .filter_map(|s| Address::parse(s).ok())
            .collect()
    }
}

mod humantime_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Tuning for one `updateClass` pass, spec §4.6.3.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ClassOpts {
    pub quota: usize,
    pub backoff_step: Duration,
    pub backoff_max: Duration,
    pub group_min: Duration,
}

/// The seven classes evaluated per tick, in order, spec §4.6.3's table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassTable {
    pub seed: ClassOpts,
    pub any_when_empty: ClassOpts,
    pub room: ClassOpts,
    pub has_pinged: ClassOpts,
    pub has_no_attempts: ClassOpts,
    pub has_only_failed_attempts: ClassOpts,
    pub is_legacy: ClassOpts,
}

impl Default for ClassTable {
    fn default() -> Self {
        ClassTable {
            seed: ClassOpts {
                quota: 3,
                backoff_step: Duration::from_secs(2),
                backoff_max: Duration::from_secs(10 * 60),
                group_min: Duration::from_secs(1),
            },
            any_when_empty: ClassOpts {
                quota: 1,
                backoff_step: Duration::from_secs(1),
                backoff_max: Duration::from_secs(6),
                group_min: Duration::from_secs(0),
            },
            room: ClassOpts {
                quota: 10,
                backoff_step: Duration::from_secs(5),
                backoff_max: Duration::from_secs(5 * 60),
                group_min: Duration::from_secs(5),
            },
            has_pinged: ClassOpts {
                quota: 2,
                backoff_step: Duration::from_secs(10),
                backoff_max: Duration::from_secs(10 * 60),
                group_min: Duration::from_secs(5),
            },
            has_no_attempts: ClassOpts {
                quota: 2,
                backoff_step: Duration::from_secs(30),
                backoff_max: Duration::from_secs(30 * 60),
                group_min: Duration::from_secs(15),
            },
            has_only_failed_attempts: ClassOpts {
                quota: 3,
                backoff_step: Duration::from_secs(60),
                backoff_max: Duration::from_secs(3 * 60 * 60),
                group_min: Duration::from_secs(5 * 60),
            },
            is_legacy: ClassOpts {
                quota: 1,
                backoff_step: Duration::from_secs(4 * 60),
                backoff_max: Duration::from_secs(3 * 60 * 60),
                group_min: Duration::from_secs(5 * 60),
            },
        }
    }
}

/// Timing constants not expressed as a per-class quota, spec §4.6.
pub mod constants {
    use std::time::Duration;

    pub const TICK_PERIOD: Duration = Duration::from_millis(1000);
    pub const WAKEUP_DEBOUNCE: Duration = Duration::from_millis(200);
    pub const REGULAR_INTERVAL: Duration = Duration::from_secs(2);
    pub const DB_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
    pub const LAN_STAGING_TTL: Duration = Duration::from_secs(10);
    pub const BT_STAGING_TTL: Duration = Duration::from_secs(30);
    pub const DOWNLOAD_HEURISTIC_WINDOW: Duration = Duration::from_millis(500);
    pub const PUB_MESSAGE_THROTTLE: Duration = Duration::from_millis(250);
    pub const PUB_STAGING_LIMIT: usize = 3;
    pub const BT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const MAX_FOLLOWED_STAGED_PROMOTIONS: usize = 5;
    pub const FRUSTRATING_GRACE: Duration = Duration::from_secs(10);
    pub const INTERNET_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
    pub const NETWORK_CHECK_CACHE: Duration = Duration::from_secs(1);
    pub const DEPRECATION_WARNING_INTERVAL: Duration = Duration::from_secs(10);
}
