//! Injectable randomness, per design note §9: the 0.3 shuffle chance and
//! the 0.5x period fuzz must be seedable so scheduler tests are
//! deterministic.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

use crate::address::Address;
use crate::record::PeerRecord;

/// Randomness used by the scheduler's fuzzing and class-selection shuffle.
///
/// `shuffle_candidates` is concretely typed rather than generic so this
/// trait stays object-safe: the scheduler only ever holds it as
/// `Arc<dyn GossipRng>`/`&dyn GossipRng`.
pub trait GossipRng: Send + Sync {
    /// Uniform float in `[0, 1)`.
    fn next_f64(&self) -> f64;

    /// Fisher-Yates shuffle in place.
    fn shuffle_candidates(&self, items: &mut [(Address, PeerRecord)]);
}

/// Production RNG backed by `rand`'s thread-seeded `StdRng`, guarded by a
/// mutex since [`GossipRng`] must be `Sync` for sharing across the
/// scheduler's collaborators.
pub struct StdGossipRng(Mutex<StdRng>);

impl StdGossipRng {
    pub fn new() -> StdGossipRng {
        StdGossipRng(Mutex::new(StdRng::from_entropy()))
    }

    pub fn from_seed(seed: u64) -> StdGossipRng {
        StdGossipRng(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl Default for StdGossipRng {
    fn default() -> Self {
        StdGossipRng::new()
    }
}

impl GossipRng for StdGossipRng {
    fn next_f64(&self) -> f64 {
        self.0.lock().expect("rng mutex poisoned").gen::<f64>()
    }

    fn shuffle_candidates(&self, items: &mut [(Address, PeerRecord)]) {
        items.shuffle(&mut *self.0.lock().expect("rng mutex poisoned"));
    }
}
