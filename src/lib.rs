//! Connection-management core for a peer-to-peer gossip overlay: a durable
//! address book, a live connection Hub, an ephemeral Staging pool, and the
//! policy-driven Scheduler that ties them together (spec §§1-5).
//!
//! [`Conn`] is the assembled facade most callers want. The pools
//! ([`db::AddressBook`], [`hub::Hub`], [`staging::Staging`]) and the
//! read-only [`query::Query`] view are usable standalone for callers that
//! only need a subset.

pub mod address;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod glue;
pub mod hub;
pub mod query;
pub mod record;
pub mod rng;
pub mod rpc;
pub mod scheduler;
pub mod staging;
pub mod store;

use std::sync::Arc;

pub use address::{Address, FeedId, Transport};
pub use config::Config;
pub use error::ConnError;
pub use record::{ConnectionState, PeerRecord, PeerType, Source};

use clock::Clock;
use config::clamp_ping_timeout;
use db::AddressBook;
use glue::InterpoolGlue;
use hub::{Dialer, Hub};
use query::{HubView, Query};
use rng::GossipRng;
use rpc::LegacyApi;
use scheduler::discovery::{BtSource, HopsProvider, LanSource, MessageLog, NetworkStatus, PubSource};
use scheduler::{Scheduler, SchedulerBuilder};
use staging::{LiveChecker, Staging};
use store::Store;

/// The assembled core: every pool, the cross-pool invariant enforcer, the
/// scheduler, and the legacy RPC adapter, wired together per spec §5.
pub struct Conn<D> {
    db: AddressBook,
    hub: Hub<D>,
    staging: Staging,
    query: Query,
    glue: InterpoolGlue,
    scheduler: Scheduler<D>,
    legacy: LegacyApi<D>,
    config: Config,
}

impl<D: Dialer + 'static> Conn<D> {
    /// Assembles the core with every optional Scheduler collaborator
    /// defaulted to a null object. Use the returned [`ConnBuilder`] to wire
    /// discovery sources and the social graph before calling `build`.
    pub fn new(
        dialer: Arc<D>,
        store: Arc<dyn Store>,
        config: Config,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn GossipRng>,
    ) -> ConnBuilder<D> {
        let config = Config {
            ping_timeout: clamp_ping_timeout(config.ping_timeout),
            ..config
        };

        let db = AddressBook::new(store, clock.clone());
        let hub = Hub::new(dialer, clock.clone());
        let staging = Staging::new(Arc::new(hub.clone()) as Arc<dyn LiveChecker>);
        let query = Query::new(db.clone(), Arc::new(hub.clone()) as Arc<dyn HubView>, staging.clone());
        let glue = InterpoolGlue::spawn(hub.clone(), staging.clone());

        let scheduler_builder = SchedulerBuilder::new(
            db.clone(),
            hub.clone(),
            staging.clone(),
            query.clone(),
            clock.clone(),
            rng,
            config.clone(),
        );

        ConnBuilder {
            db,
            hub,
            staging,
            query,
            glue,
            clock,
            scheduler_builder,
            config,
        }
    }

    /// Loads the durable address book image. Must complete before
    /// [`Scheduler::start`] is called.
    pub async fn load(&self) -> Result<(), ConnError> {
        self.db.load().await
    }

    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.hub.close().await;
        self.staging.close().await;
        self.db.close();
        let _ = self.db.flush_now().await;
    }

    pub fn db(&self) -> &AddressBook {
        &self.db
    }

    pub fn hub(&self) -> &Hub<D> {
        &self.hub
    }

    pub fn staging(&self) -> &Staging {
        &self.staging
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn scheduler(&self) -> &Scheduler<D> {
        &self.scheduler
    }

    pub fn legacy(&self) -> &LegacyApi<D> {
        &self.legacy
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Staged construction: set discovery/social-graph collaborators on the
/// scheduler before finishing with [`ConnBuilder::build`].
pub struct ConnBuilder<D> {
    db: AddressBook,
    hub: Hub<D>,
    staging: Staging,
    query: Query,
    glue: InterpoolGlue,
    clock: Arc<dyn Clock>,
    scheduler_builder: SchedulerBuilder<D>,
    config: Config,
}

impl<D: Dialer + 'static> ConnBuilder<D> {
    pub fn with_hops(mut self, hops: Arc<dyn HopsProvider>) -> Self {
        self.scheduler_builder = self.scheduler_builder.with_hops(hops);
        self
    }

    pub fn with_message_log(mut self, log: Arc<dyn MessageLog>) -> Self {
        self.scheduler_builder = self.scheduler_builder.with_message_log(log);
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkStatus>) -> Self {
        self.scheduler_builder = self.scheduler_builder.with_network(network);
        self
    }

    pub fn with_pub_source(mut self, source: Arc<dyn PubSource>) -> Self {
        self.scheduler_builder = self.scheduler_builder.with_pub_source(source);
        self
    }

    pub fn with_lan_source(mut self, source: Arc<dyn LanSource>) -> Self {
        self.scheduler_builder = self.scheduler_builder.with_lan_source(source);
        self
    }

    pub fn with_bt_source(mut self, source: Arc<dyn BtSource>) -> Self {
        self.scheduler_builder = self.scheduler_builder.with_bt_source(source);
        self
    }

    pub fn build(self) -> Conn<D> {
        let scheduler = self.scheduler_builder.build();
        let legacy = LegacyApi::new(self.db.clone(), self.hub.clone(), self.clock);
        Conn {
            db: self.db,
            hub: self.hub,
            staging: self.staging,
            query: self.query,
            glue: self.glue,
            scheduler,
            legacy,
            config: self.config,
        }
    }
}
