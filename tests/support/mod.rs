//! Shared test doubles for the scenario and invariant suites.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use gossip_conn::address::{Address, FeedId};
use gossip_conn::error::ConnError;
use gossip_conn::hub::Dialer;
use gossip_conn::scheduler::discovery::{HopsProvider, LanCandidate, LanSource};

/// A dialer whose outcome per address can be scripted; defaults to success.
pub struct TestDialer {
    queued: Mutex<HashMap<Address, VecDeque<Result<(), ConnError>>>>,
}

impl TestDialer {
    pub fn new() -> TestDialer {
        TestDialer {
            queued: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self, addr: &Address, result: Result<(), ConnError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(addr.clone())
            .or_default()
            .push_back(result);
    }

    pub fn fail_next(&self, addr: &Address) {
        self.queue(addr, Err(ConnError::Dial("test dialer: scripted failure".to_string())));
    }
}

#[async_trait]
impl Dialer for TestDialer {
    async fn dial(&self, addr: &Address) -> Result<(), ConnError> {
        let mut guard = self.queued.lock().unwrap();
        if let Some(queue) = guard.get_mut(addr) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        Ok(())
    }
}

pub fn key(byte: u8) -> FeedId {
    FeedId::from_bytes([byte; 32])
}

pub fn net_address(host: &str, port: u16, key: FeedId) -> Address {
    Address::parse(&format!("net:{host}:{port}~shs:{}", base64::encode(key.as_bytes()))).unwrap()
}

/// A [`HopsProvider`] whose table and loaded-ness can be set from the test
/// body after the scheduler has already captured an `Arc<dyn HopsProvider>`.
pub struct TestHops {
    loaded: AtomicBool,
    hops: Mutex<HashMap<FeedId, i32>>,
}

impl TestHops {
    pub fn new() -> TestHops {
        TestHops {
            loaded: AtomicBool::new(true),
            hops: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }

    pub fn set_hops(&self, key: FeedId, hops: i32) {
        self.hops.lock().unwrap().insert(key, hops);
    }

    pub fn block(&self, key: FeedId) {
        self.set_hops(key, -1);
    }
}

impl HopsProvider for TestHops {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn hops(&self, key: FeedId) -> Option<i32> {
        self.hops.lock().unwrap().get(&key).copied()
    }
}

/// A [`LanSource`] the test body can push [`LanCandidate`]s into on demand.
/// `subscribe` may only be called once, matching how the scheduler's
/// discovery wiring consumes it exactly one time at `start`.
pub struct TestLanSource {
    tx: mpsc::Sender<LanCandidate>,
    rx: Mutex<Option<mpsc::Receiver<LanCandidate>>>,
}

impl TestLanSource {
    pub fn new() -> TestLanSource {
        let (tx, rx) = mpsc::channel(32);
        TestLanSource {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub async fn push(&self, address: &str, verified: bool) {
        self.tx
            .send(LanCandidate {
                address: address.to_string(),
                verified,
            })
            .await
            .expect("scheduler still listening");
    }
}

impl LanSource for TestLanSource {
    fn subscribe(&self) -> mpsc::Receiver<LanCandidate> {
        self.rx.lock().unwrap().take().expect("subscribe called once")
    }
}
