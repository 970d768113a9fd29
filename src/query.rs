//! Read-only joined view over DB/Hub/Staging with filter combinators,
//! spec §4.4.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::address::Address;
use crate::db::AddressBook;
use crate::hub::{Dialer, Hub, HubEntry};
use crate::record::{ConnectionState, PeerRecord};
use crate::staging::Staging;

/// Whatever Query needs from the Hub, decoupled from its dialer type
/// parameter for the same reason [`crate::staging::LiveChecker`] is.
#[async_trait]
pub trait HubView: Send + Sync {
    async fn entries(&self) -> Vec<(Address, HubEntry)>;
    async fn get_state(&self, addr: &Address) -> Option<ConnectionState>;
}

#[async_trait]
impl<D: Dialer + 'static> HubView for Hub<D> {
    async fn entries(&self) -> Vec<(Address, HubEntry)> {
        Hub::entries(self).await
    }

    async fn get_state(&self, addr: &Address) -> Option<ConnectionState> {
        Hub::get_state(self, addr).await
    }
}

/// The pool a `peersConnectable` query draws candidates from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Origin {
    Db,
    Staging,
}

#[derive(Clone)]
pub struct Query {
    db: AddressBook,
    hub: std::sync::Arc<dyn HubView>,
    staging: Staging,
}

impl Query {
    pub fn new(db: AddressBook, hub: std::sync::Arc<dyn HubView>, staging: Staging) -> Query {
        Query { db, hub, staging }
    }

    /// Hub entries currently `connecting` or `connected`.
    pub async fn peers_in_connection(&self) -> Vec<(Address, PeerRecord)> {
        self.hub
            .entries()
            .await
            .into_iter()
            .filter(|(_, e)| e.state.is_in_connection())
            .map(|(a, e)| (a, e.record))
            .collect()
    }

    /// Hub entries currently `connected`.
    pub async fn peers_connected(&self) -> Vec<(Address, PeerRecord)> {
        self.hub
            .entries()
            .await
            .into_iter()
            .filter(|(_, e)| e.state.is_connected())
            .map(|(a, e)| (a, e.record))
            .collect()
    }

    /// Entries from `origin` whose Hub state is not `connecting`/`connected`.
    pub async fn peers_connectable(&self, origin: Origin) -> Vec<(Address, PeerRecord)> {
        let candidates = match origin {
            Origin::Db => self.db.entries().await,
            Origin::Staging => self.staging.entries().await,
        };
        let mut out = Vec::with_capacity(candidates.len());
        for (addr, record) in candidates {
            let live = self
                .hub
                .get_state(&addr)
                .await
                .map(|s| s.is_in_connection())
                .unwrap_or(false);
            if !live {
                out.push((addr, record));
            }
        }
        out
    }
}

/// `hasNoAttempts`: no recorded dial attempts.
pub fn has_no_attempts(record: &PeerRecord) -> bool {
    record.stats.attempts == 0
}

/// `hasOnlyFailedAttempts`: >=1 attempt, all failed.
pub fn has_only_failed_attempts(record: &PeerRecord) -> bool {
    record.stats.attempts > 0 && record.stats.successes == 0
}

/// `hasSuccessfulAttempts`: >=1 connection completed.
pub fn has_successful_attempts(record: &PeerRecord) -> bool {
    record.stats.successes > 0
}

/// `hasPinged`: `ping.rtt.mean` is defined.
pub fn has_pinged(record: &PeerRecord) -> bool {
    record.ping.rtt_mean_ms.is_some()
}

/// `isLegacy` = `hasSuccessfulAttempts && !hasPinged`.
pub fn is_legacy(record: &PeerRecord) -> bool {
    has_successful_attempts(record) && !has_pinged(record)
}

/// `passesExpBackoff(step, max)`: `now - lastAttempt >= min(step*2^(k-1), max)`
/// for `k` prior failures, `k >= 1`; a record with no recorded failure
/// always passes. The exponent is `k-1` rather than `k` so the gap after
/// the *first* failure is exactly `step`, matching spec §8 scenario S2
/// ("next tick does NOT redial within 2s... after second failure, earliest
/// redial at 4s" for a 2s `backoffStep`).
pub fn passes_exp_backoff(record: &PeerRecord, step: Duration, max: Duration, now_ms: u64) -> bool {
    let last_attempt = match record.failure.last_attempt {
        Some(t) => t,
        None => return true,
    };
    let exponent = record.failure.count.saturating_sub(1).min(32);
    let scaled = step.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
    let required = scaled.min(max);
    now_ms.saturating_sub(last_attempt) >= required.as_millis() as u64
}

/// Stable-sorts entries ascending by `stateChange`.
pub fn sort_by_state_change(mut entries: Vec<(Address, PeerRecord)>) -> Vec<(Address, PeerRecord)> {
    entries.sort_by_key(|(_, r)| r.state_change);
    entries
}

/// `passesGroupDebounce(min)`: stateful across calls, since "at most one
/// per window" is a property of a sequence of attempts over time, not of a
/// single record. The scheduler owns one instance per class.
#[derive(Default)]
pub struct GroupDebounce {
    last_pass_ms: HashMap<String, u64>,
}

impl GroupDebounce {
    pub fn new() -> GroupDebounce {
        GroupDebounce::default()
    }

    fn group_key(record: &PeerRecord) -> String {
        record
            .host
            .clone()
            .unwrap_or_else(|| record.key.to_string())
    }

    /// Filters `entries` in place, admitting at most one address per group
    /// within the trailing `min` window, and marking every admitted
    /// group's debounce clock so a second candidate from the same group
    /// in this same pass is also held back.
    pub fn filter(
        &mut self,
        entries: Vec<(Address, PeerRecord)>,
        min: Duration,
        now_ms: u64,
    ) -> Vec<(Address, PeerRecord)> {
        let min_ms = min.as_millis() as u64;
        let mut out = Vec::with_capacity(entries.len());
        for (addr, record) in entries {
            let group = Self::group_key(&record);
            let passes = match self.last_pass_ms.get(&group) {
                Some(last) => now_ms.saturating_sub(*last) >= min_ms,
                None => true,
            };
            if passes {
                self.last_pass_ms.insert(group, now_ms);
                out.push((addr, record));
            }
        }
        out
    }
}

/// Chainable combinators over a query result snapshot.
pub trait PeerFilterExt: Sized {
    fn filter_pred(self, pred: impl Fn(&PeerRecord) -> bool) -> Self;
    fn take_n(self, n: usize) -> Self;
}

impl PeerFilterExt for Vec<(Address, PeerRecord)> {
    fn filter_pred(self, pred: impl Fn(&PeerRecord) -> bool) -> Self {
        self.into_iter().filter(|(_, r)| pred(r)).collect()
    }

    fn take_n(mut self, n: usize) -> Self {
        self.truncate(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::FeedId;
    use crate::record::{PeerType, Source};

    fn record(attempts: u32, successes: u32, last_attempt: Option<u64>, failures: u32) -> PeerRecord {
        let mut r = PeerRecord::new(FeedId::from_bytes([1u8; 32]), Source::Manual, PeerType::Internet, 0);
        r.stats.attempts = attempts;
        r.stats.successes = successes;
        r.failure.last_attempt = last_attempt;
        r.failure.count = failures;
        r
    }

    #[test]
    fn backoff_doubles_per_failure_until_capped() {
        let step = Duration::from_secs(2);
        let max = Duration::from_secs(10 * 60);
        let r = record(1, 0, Some(1_000), 1);
        assert!(!passes_exp_backoff(&r, step, max, 1_000 + 1_999));
        assert!(passes_exp_backoff(&r, step, max, 1_000 + 4_000));
    }

    /// Pins the exact numbers from scenario S2: a 2s `backoffStep`, one
    /// prior failure requires a 2s gap; two prior failures require 4s.
    #[test]
    fn first_failure_requires_exactly_one_step() {
        let step = Duration::from_secs(2);
        let max = Duration::from_secs(10 * 60);
        let one_failure = record(1, 0, Some(0), 1);
        assert!(!passes_exp_backoff(&one_failure, step, max, 1_999));
        assert!(passes_exp_backoff(&one_failure, step, max, 2_100));

        let two_failures = record(2, 0, Some(2_100), 2);
        assert!(!passes_exp_backoff(&two_failures, step, max, 2_100 + 3_999));
        assert!(passes_exp_backoff(&two_failures, step, max, 2_100 + 4_100));
    }

    #[test]
    fn no_attempts_always_passes_backoff() {
        let r = record(0, 0, None, 0);
        assert!(passes_exp_backoff(&r, Duration::from_secs(2), Duration::from_secs(60), 0));
    }

    #[test]
    fn group_debounce_admits_one_per_window() {
        let mut debounce = GroupDebounce::new();
        let mut a = record(0, 0, None, 0);
        a.host = Some("10.0.0.1".to_string());
        let mut b = record(0, 0, None, 0);
        b.host = Some("10.0.0.1".to_string());
        let addr_a = Address::parse(&format!("net:10.0.0.1:8008~shs:{}", base64::encode([1u8; 32]))).unwrap();
        let addr_b = Address::parse(&format!("net:10.0.0.1:8009~shs:{}", base64::encode([2u8; 32]))).unwrap();

        let admitted = debounce.filter(vec![(addr_a, a), (addr_b, b)], Duration::from_secs(1), 0);
        assert_eq!(admitted.len(), 1);
    }
}
