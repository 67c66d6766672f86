//! Background task that runs sync cycles on a timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};

use crate::engine::SyncEngine;
use crate::offline::ConnectivityState;

/// Periodic sync driver.
///
/// Cycles run on every interval tick while online, immediately when the
/// connection comes back, and whenever the handle is triggered. Ticks that
/// fall while offline are skipped. Shutdown waits for an in-flight cycle to
/// finish.
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    interval: Duration,
}

/// Control handle for a running [`SyncWorker`].
#[derive(Debug)]
pub struct SyncWorkerHandle {
    shutdown: Arc<Notify>,
    trigger: Arc<Notify>,
    join: JoinHandle<()>,
}

impl SyncWorkerHandle {
    /// Ask for a cycle as soon as the worker is idle.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Shut down and wait for the task to exit.
    pub async fn stop(self) -> Result<(), JoinError> {
        self.shutdown.notify_one();
        self.join.await
    }
}

impl SyncWorker {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let interval = engine.config().interval;
        Self { engine, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn start(self) -> SyncWorkerHandle {
        let shutdown = Arc::new(Notify::new());
        let trigger = Arc::new(Notify::new());
        let join = tokio::spawn(run(self.engine, self.interval, shutdown.clone(), trigger.clone()));
        SyncWorkerHandle { shutdown, trigger, join }
    }
}

async fn run(engine: Arc<SyncEngine>, period: Duration, shutdown: Arc<Notify>, trigger: Arc<Notify>) {
    tracing::info!(interval_ms = period.as_millis() as u64, "sync worker started");

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut connectivity = engine.connectivity().subscribe();

    loop {
        let reason = tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("sync worker received shutdown signal");
                break;
            }
            _ = ticker.tick() => "interval",
            _ = trigger.notified() => "trigger",
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                if *connectivity.borrow_and_update() == ConnectivityState::Offline {
                    tracing::debug!("sync paused while offline");
                    continue;
                }
                "reconnect"
            }
        };

        if !engine.connectivity().is_online() {
            tracing::debug!(reason, "skipping sync: offline");
            continue;
        }
        match engine.sync_now().await {
            Ok(report) => tracing::debug!(reason, sent = report.sent, fetched = report.fetched, "sync cycle finished"),
            Err(err) => tracing::warn!(reason, error = %err, "sync cycle failed"),
        }
    }

    tracing::info!("sync worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use opsync_core::{ActorId, DeviceId, SessionId};
    use opsync_events::{CounterIncremented, EventMetadata, EventPayload};
    use opsync_infra::event_bus::EventBus;
    use opsync_infra::event_store::{EventStore, InMemoryEventStore};

    use crate::config::SyncConfig;
    use crate::conflict::ConflictPolicies;
    use crate::transport::InMemoryRemote;

    fn engine(remote: Arc<InMemoryRemote>) -> (Arc<SyncEngine>, EventMetadata) {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let me = EventMetadata::new(ActorId::new(), DeviceId::new(), SessionId::new());
        let engine = SyncEngine::new(
            EventBus::new(store),
            remote,
            ConflictPolicies::default(),
            SyncConfig::default().with_interval(Duration::from_secs(3600)),
            me.clone(),
        );
        (Arc::new(engine), me)
    }

    fn bump() -> EventPayload {
        EventPayload::CounterIncremented(CounterIncremented {
            key: "tents".to_string(),
            amount: 1,
        })
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn trigger_and_reconnect_run_cycles() {
        let remote = Arc::new(InMemoryRemote::new());
        let (engine, me) = engine(remote.clone());
        let handle = SyncWorker::new(engine.clone()).start();

        // first interval tick fires immediately
        wait_for(|| engine.status().cycles >= 1).await;

        engine.bus().emit(bump(), me.clone()).await.unwrap();
        handle.trigger();
        wait_for(|| remote.events().len() == 1).await;

        engine.connectivity().set_offline();
        engine.bus().emit(bump(), me.clone()).await.unwrap();
        handle.trigger();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(remote.events().len(), 1);

        engine.connectivity().set_online();
        wait_for(|| remote.events().len() == 2).await;

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_ends_the_task() {
        let (engine, _) = engine(Arc::new(InMemoryRemote::new()));
        let handle = SyncWorker::new(engine).with_interval(Duration::from_millis(10)).start();
        handle.stop().await.unwrap();
    }
}
