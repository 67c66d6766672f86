//! A device-local replica: the public face of the sync core.

use std::sync::Arc;

use serde_json::Value;

use opsync_core::{ActorId, ConflictId, DeviceId, EventId, SessionId, Timestamp};
use opsync_events::{Event, EventMetadata, EventPayload, Projection, Subscription};
use opsync_infra::event_bus::EventBus;
use opsync_infra::event_store::{EventStore, InMemoryEventStore, Snapshot};
use opsync_infra::projections::{ProjectionManager, ProjectionSubscription};

use crate::config::SyncConfig;
use crate::conflict::ConflictPolicies;
use crate::engine::{ManualResolution, SyncEngine, SyncError, SyncReport, SyncStatus};
use crate::http::HttpRemote;
use crate::offline::Connectivity;
use crate::transport::RemotePeer;
use crate::worker::{SyncWorker, SyncWorkerHandle};

pub struct ReplicaBuilder {
    remote: Arc<dyn RemotePeer>,
    store: Option<Arc<dyn EventStore>>,
    actor_id: ActorId,
    device_id: DeviceId,
    session_id: SessionId,
    config: SyncConfig,
    policies: ConflictPolicies,
    connectivity: Connectivity,
}

impl ReplicaBuilder {
    pub fn new(remote: Arc<dyn RemotePeer>) -> Self {
        Self {
            remote,
            store: None,
            actor_id: ActorId::new(),
            device_id: DeviceId::new(),
            session_id: SessionId::new(),
            config: SyncConfig::default(),
            policies: ConflictPolicies::default(),
            connectivity: Connectivity::default(),
        }
    }

    /// Builder for a replica syncing over HTTP with `config.remote_url`.
    pub fn from_config(config: SyncConfig) -> Result<Self, SyncError> {
        let remote = HttpRemote::from_config(&config)?;
        Ok(Self::new(Arc::new(remote)).with_config(config))
    }

    /// Defaults to an in-memory store using the config's retry policy.
    ///
    /// A store passed here keeps the retry policy it was created with;
    /// `SyncConfig::max_retries` only applies to the default store.
    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_actor(mut self, actor_id: ActorId) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn with_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    /// See [`ReplicaBuilder::with_store`] for how `max_retries` is applied.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_policies(mut self, policies: ConflictPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Open the replica: rebuild projections from the store (via snapshots
    /// when present) and wire them to the bus.
    pub async fn build(self) -> Result<Replica, SyncError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::with_retry_policy(self.config.retry_policy())));

        let mut identity = EventMetadata::new(self.actor_id, self.device_id, self.session_id);
        if let Some(operation) = self.config.operation {
            identity = identity.with_operation(operation);
        }

        let bus = EventBus::new(store.clone());
        // a reopened log must not be outrun by the fresh clock
        if let Some(latest) = store.query(None, None).await?.last() {
            bus.clock().observe(latest.event.stamp());
        }

        let projections = Arc::new(ProjectionManager::with_defaults(store, self.config.operation));
        let rebuilt = projections.rebuild(None).await?;
        tracing::info!(
            device_id = %self.device_id,
            projections = rebuilt.len(),
            replayed = rebuilt.iter().map(|s| s.replayed).sum::<usize>(),
            "replica opened"
        );
        let attachment = projections.attach(bus.registry());

        let engine = SyncEngine::new(bus.clone(), self.remote, self.policies, self.config, identity.clone())
            .with_connectivity(self.connectivity);

        Ok(Replica {
            identity,
            bus,
            projections,
            engine: Arc::new(engine),
            _attachment: attachment,
        })
    }
}

pub struct Replica {
    identity: EventMetadata,
    bus: EventBus,
    projections: Arc<ProjectionManager>,
    engine: Arc<SyncEngine>,
    _attachment: Subscription,
}

impl core::fmt::Debug for Replica {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Replica")
            .field("actor_id", &self.identity.actor_id)
            .field("device_id", &self.identity.device_id)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Replica {
    pub fn builder(remote: Arc<dyn RemotePeer>) -> ReplicaBuilder {
        ReplicaBuilder::new(remote)
    }

    pub fn identity(&self) -> &EventMetadata {
        &self.identity
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        self.bus.store()
    }

    pub fn projections(&self) -> &Arc<ProjectionManager> {
        &self.projections
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Record a local write as this replica's actor.
    pub async fn emit(&self, payload: EventPayload) -> Result<EventId, SyncError> {
        Ok(self.bus.emit(payload, self.identity.clone()).await?)
    }

    /// Record a local write with an explicit wall-clock reading.
    pub async fn emit_at(&self, payload: EventPayload, wall: Timestamp) -> Result<Event, SyncError> {
        Ok(self
            .bus
            .emit_with_wall_clock(payload, self.identity.clone(), wall)
            .await?)
    }

    pub fn get_projection(&self, name: &str) -> Result<Value, SyncError> {
        Ok(self.projections.get_projection(name)?)
    }

    pub fn state<P>(&self, name: &str) -> Result<P::State, SyncError>
    where
        P: Projection + 'static,
    {
        Ok(self.projections.state::<P>(name)?)
    }

    pub fn subscribe_to_projection<F>(&self, name: &str, listener: F) -> Result<ProjectionSubscription, SyncError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Ok(self.projections.subscribe(name, listener)?)
    }

    pub async fn snapshot(&self) -> Result<Vec<Snapshot>, SyncError> {
        Ok(self.projections.snapshot().await?)
    }

    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        self.engine.sync_now().await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ManualResolution,
    ) -> Result<EventId, SyncError> {
        self.engine.resolve_conflict(conflict_id, resolution).await
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn go_online(&self) {
        self.engine.connectivity().set_online();
    }

    pub fn go_offline(&self) {
        self.engine.connectivity().set_offline();
    }

    pub fn is_online(&self) -> bool {
        self.engine.connectivity().is_online()
    }

    /// Start periodic sync on the config's interval.
    pub fn start_worker(&self) -> SyncWorkerHandle {
        SyncWorker::new(self.engine.clone()).start()
    }
}
