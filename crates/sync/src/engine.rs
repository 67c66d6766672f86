//! Sync engine: pushes the outbox, pulls remote events through the inbox and
//! settles concurrent writes under the configured conflict policies.
//!
//! One cycle is:
//! 1. Outbox phase: due items are grouped by correlation id and each group is
//!    sent as one batch keyed by that id. A connectivity failure flips the
//!    replica offline and stops the phase.
//! 2. Inbox phase: events after the stored cursor are fetched, staged, and
//!    applied in replay order. Items that fail stay staged for the next cycle.
//!
//! Events the engine emits in reaction to a remote event (resolutions,
//! re-assertions, merges, escalations) point at it through `causation_id` but
//! start a correlation of their own, so they are never delivered under a key
//! the peer has already accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;

use opsync_core::{ConflictId, CorrelationId, EventId, Timestamp};
use opsync_events::{
    ConflictDetected, ConflictResolved, EntityKey, Event, EventMetadata, EventPayload, EventType, ProjectionError,
    ResolutionStrategy,
};
use opsync_infra::event_bus::{BusError, EventBus};
use opsync_infra::event_store::{EventStoreError, OutboxUpdate, process_inbox};

use crate::config::SyncConfig;
use crate::conflict::{ConflictError, ConflictPolicies, ConflictPolicy};
use crate::offline::Connectivity;
use crate::transport::{RemotePeer, TransportError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Outbox,
    Inbox,
}

/// Why a requested cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

/// Counts for one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Outbox events delivered.
    pub sent: usize,
    /// Outbox events whose delivery failed this cycle.
    pub failed: usize,
    /// Batches delivered.
    pub batches: usize,
    /// Sent items older than the retention period that were pruned.
    pub pruned: usize,
    /// Processed inbox items older than the retention period that were pruned.
    pub inbox_pruned: usize,
    /// Events returned by the pull.
    pub fetched: usize,
    /// Remote events recorded without a conflict.
    pub applied: usize,
    /// Pulled events already in the local log.
    pub duplicates: usize,
    /// Conflicts settled automatically (LWW, FWW or domain merge).
    pub conflicts: usize,
    /// Concurrent writes kept side by side for a merging projection.
    pub crdt_merged: usize,
    /// Conflicting writes awaiting manual resolution, whether this replica
    /// raised the escalation or left it to the peer.
    pub escalated: usize,
    /// Inbox items that failed to apply and remain staged.
    pub inbox_failed: usize,
    pub skipped: Option<SkipReason>,
}

impl SyncReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    fn tally(&mut self, outcome: InboundOutcome) {
        match outcome {
            InboundOutcome::Applied => self.applied += 1,
            InboundOutcome::Duplicate => self.duplicates += 1,
            InboundOutcome::Resolved(_) => self.conflicts += 1,
            InboundOutcome::CrdtMerged => self.crdt_merged += 1,
            InboundOutcome::Escalated(_) => self.escalated += 1,
        }
    }
}

/// Snapshot of the engine's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub online: bool,
    pub last_sync: Option<Timestamp>,
    pub last_error: Option<String>,
    pub cycles: u64,
    pub skipped_cycles: u64,
}

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Applied,
    Duplicate,
    Resolved(ResolutionStrategy),
    CrdtMerged,
    Escalated(ConflictId),
}

/// Operator decision for an escalated conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualResolution {
    KeepLocal,
    TakeRemote,
    /// Write a new value that supersedes both sides.
    Replace(EventPayload),
}

#[derive(Debug)]
struct StatusInner {
    phase: SyncPhase,
    last_sync: Option<Timestamp>,
    last_error: Option<String>,
    cycles: u64,
    skipped_cycles: u64,
}

/// Clears the running flag when a cycle ends, including on early return.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    bus: EventBus,
    remote: Arc<dyn RemotePeer>,
    policies: ConflictPolicies,
    config: SyncConfig,
    connectivity: Connectivity,
    /// Identity used for events the engine emits itself (resolutions,
    /// re-assertions, merges).
    origin: EventMetadata,
    running: AtomicBool,
    status: Mutex<StatusInner>,
}

impl core::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("policies", &self.policies)
            .field("connectivity", &self.connectivity.state())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        bus: EventBus,
        remote: Arc<dyn RemotePeer>,
        policies: ConflictPolicies,
        config: SyncConfig,
        origin: EventMetadata,
    ) -> Self {
        Self {
            bus,
            remote,
            policies,
            config,
            connectivity: Connectivity::default(),
            origin,
            running: AtomicBool::new(false),
            status: Mutex::new(StatusInner {
                phase: SyncPhase::Idle,
                last_sync: None,
                last_error: None,
                cycles: 0,
                skipped_cycles: 0,
            }),
        }
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn policies(&self) -> &ConflictPolicies {
        &self.policies
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn lock_status(&self) -> MutexGuard<'_, StatusInner> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.lock_status().phase = phase;
    }

    pub fn status(&self) -> SyncStatus {
        let inner = self.lock_status();
        SyncStatus {
            phase: inner.phase,
            online: self.connectivity.is_online(),
            last_sync: inner.last_sync,
            last_error: inner.last_error.clone(),
            cycles: inner.cycles,
            skipped_cycles: inner.skipped_cycles,
        }
    }

    /// Run one full cycle now.
    ///
    /// Returns a skipped report (not an error) when offline or when another
    /// cycle is already in flight.
    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        if !self.connectivity.is_online() {
            self.lock_status().skipped_cycles += 1;
            tracing::debug!("sync skipped: offline");
            return Ok(SyncReport::skipped(SkipReason::Offline));
        }
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            self.lock_status().skipped_cycles += 1;
            tracing::debug!("sync skipped: cycle already running");
            return Ok(SyncReport::skipped(SkipReason::AlreadyRunning));
        };

        let started = Timestamp::now();
        let mut report = SyncReport::default();
        let result = self.run_cycle(&mut report).await;

        let mut status = self.lock_status();
        status.phase = SyncPhase::Idle;
        status.cycles += 1;
        match &result {
            Ok(()) => {
                status.last_sync = Some(started);
                status.last_error = None;
                tracing::info!(
                    sent = report.sent,
                    failed = report.failed,
                    fetched = report.fetched,
                    applied = report.applied,
                    conflicts = report.conflicts,
                    escalated = report.escalated,
                    "sync cycle complete"
                );
            }
            Err(err) => {
                status.last_error = Some(err.to_string());
                tracing::warn!(error = %err, "sync cycle failed");
            }
        }
        drop(status);
        result.map(|()| report)
    }

    async fn run_cycle(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        self.set_phase(SyncPhase::Outbox);
        self.push_outbox(report).await?;
        if !self.connectivity.is_online() {
            tracing::debug!("connection lost during outbox phase; inbox phase skipped");
            return Ok(());
        }
        self.set_phase(SyncPhase::Inbox);
        self.pull_inbox(report).await
    }

    async fn push_outbox(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let store = self.bus.store();
        let now = Timestamp::now();
        // no cycle is in flight, so anything still `sending` was cut short
        let requeued = store.requeue_sending().await?;
        if requeued > 0 {
            tracing::warn!(requeued, "interrupted deliveries requeued");
        }
        let items = store.pending_outbox(now, self.config.batch_size).await?;

        let mut batches: Vec<(CorrelationId, Vec<Event>)> = Vec::new();
        for item in items {
            let key = item.event.correlation_id;
            match batches.iter_mut().find(|(k, _)| *k == key) {
                Some((_, events)) => events.push(item.event),
                None => batches.push((key, vec![item.event])),
            }
        }

        for (key, events) in batches {
            for event in &events {
                store.update_outbox_status(event.id, OutboxUpdate::Sending, now).await?;
            }
            match self.remote.send(key, &events).await {
                Ok(()) => {
                    for event in &events {
                        store.update_outbox_status(event.id, OutboxUpdate::Sent, now).await?;
                    }
                    report.sent += events.len();
                    report.batches += 1;
                }
                Err(err) => {
                    tracing::warn!(key = %key, events = events.len(), error = %err, "batch delivery failed");
                    for event in &events {
                        store
                            .update_outbox_status(event.id, OutboxUpdate::Failed(err.to_string()), now)
                            .await?;
                    }
                    report.failed += events.len();
                    if err.is_connectivity() {
                        self.connectivity.set_offline();
                        break;
                    }
                }
            }
        }

        let retention = u64::try_from(self.config.outbox_retention.as_millis()).unwrap_or(u64::MAX);
        report.pruned = store.prune_outbox(now.minus_millis(retention)).await?;
        Ok(())
    }

    async fn pull_inbox(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let store = self.bus.store();
        let operation = self.config.operation;
        let since = store.sync_cursor(operation).await?;

        let batch = match self.remote.fetch(operation, since).await {
            Ok(batch) => batch,
            Err(err) => {
                if err.is_connectivity() {
                    self.connectivity.set_offline();
                }
                return Err(err.into());
            }
        };
        let cursor = batch.next_cursor();
        let now = Timestamp::now();
        report.fetched = batch.events.len();

        for event in batch.events {
            if store.get(event.id).await?.is_some() {
                report.duplicates += 1;
                continue;
            }
            store.add_to_inbox(event, now).await?;
        }
        if let Some(cursor) = cursor {
            store.set_sync_cursor(operation, cursor).await?;
        }

        let inbox = process_inbox(store.as_ref(), now, |event| async move {
            self.apply_inbound(event).await.map_err(|err| err.to_string())
        })
        .await?;
        for (_, outcome) in inbox.applied {
            report.tally(outcome);
        }
        report.inbox_failed = inbox.failed.len();

        let retention = u64::try_from(self.config.outbox_retention.as_millis()).unwrap_or(u64::MAX);
        report.inbox_pruned = store.prune_inbox(now.minus_millis(retention)).await?;
        Ok(())
    }

    /// Record one remote event, settling any conflict with a local write.
    pub async fn apply_inbound(&self, remote: Event) -> Result<InboundOutcome, SyncError> {
        if self.bus.store().get(remote.id).await?.is_some() {
            return Ok(InboundOutcome::Duplicate);
        }
        let Some((local, entity)) = self.find_conflict(&remote).await? else {
            return Ok(match self.bus.apply_remote(remote).await? {
                Some(_) => InboundOutcome::Applied,
                None => InboundOutcome::Duplicate,
            });
        };

        if local.payload == remote.payload {
            tracing::debug!(local = %local.id, remote = %remote.id, "concurrent writes agree");
            self.bus.apply_remote(remote).await?;
            return Ok(InboundOutcome::Applied);
        }

        let policy = self.policies.policy_for(remote.event_type).clone();
        let correlation = CorrelationId::new();
        tracing::info!(
            entity = %entity,
            local = %local.id,
            remote = %remote.id,
            policy = ?policy,
            "conflict detected"
        );

        match policy {
            ConflictPolicy::CrdtMerge => {
                self.bus.apply_remote(remote).await?;
                Ok(InboundOutcome::CrdtMerged)
            }
            ConflictPolicy::LastWriteWins => {
                let (winner, loser) = if remote.is_later_than(&local) {
                    (remote.id, local.id)
                } else {
                    (local.id, remote.id)
                };
                // both writes stay in the log; projections keep the later one
                self.bus.apply_remote(remote.clone()).await?;
                self.record_resolution(
                    &remote,
                    ConflictResolved {
                        conflict_id: None,
                        entity,
                        strategy: ResolutionStrategy::LastWriteWins,
                        winner: Some(winner),
                        discarded: vec![loser],
                        merged: None,
                    },
                    correlation,
                )
                .await?;
                Ok(InboundOutcome::Resolved(ResolutionStrategy::LastWriteWins))
            }
            ConflictPolicy::FirstWriteWins => {
                let (winner, loser) = if remote.is_later_than(&local) {
                    (&local, &remote)
                } else {
                    (&remote, &local)
                };
                let (winner_id, loser_id, payload) = (winner.id, loser.id, winner.payload.clone());
                self.bus.apply_remote(remote.clone()).await?;
                // the earlier write has to be re-asserted so it sorts last
                let reasserted = self.emit_follow_up(&remote, payload, correlation).await?;
                self.record_resolution(
                    &remote,
                    ConflictResolved {
                        conflict_id: None,
                        entity,
                        strategy: ResolutionStrategy::FirstWriteWins,
                        winner: Some(winner_id),
                        discarded: vec![loser_id],
                        merged: Some(reasserted.id),
                    },
                    correlation,
                )
                .await?;
                Ok(InboundOutcome::Resolved(ResolutionStrategy::FirstWriteWins))
            }
            ConflictPolicy::DomainSpecific(resolver) => {
                let merged = resolver.merge(&local, &remote)?;
                let later = if remote.is_later_than(&local) { &remote } else { &local };
                let later_id = later.id;
                let already_winning = merged == later.payload;
                self.bus.apply_remote(remote.clone()).await?;

                let resolution = if already_winning {
                    ConflictResolved {
                        conflict_id: None,
                        entity,
                        strategy: ResolutionStrategy::DomainSpecific,
                        winner: Some(later_id),
                        discarded: Vec::new(),
                        merged: None,
                    }
                } else {
                    let merged_event = self.emit_follow_up(&remote, merged, correlation).await?;
                    ConflictResolved {
                        conflict_id: None,
                        entity,
                        strategy: ResolutionStrategy::DomainSpecific,
                        winner: None,
                        discarded: Vec::new(),
                        merged: Some(merged_event.id),
                    }
                };
                tracing::debug!(resolver = resolver.name(), merged = !already_winning, "domain merge");
                self.record_resolution(&remote, resolution, correlation).await?;
                Ok(InboundOutcome::Resolved(ResolutionStrategy::DomainSpecific))
            }
            ConflictPolicy::Manual => {
                let conflict_id = ConflictId::for_pair(local.id, remote.id);
                // not recorded, but later local writes must still sort after it
                self.bus.clock().observe(remote.stamp());
                if self.conflict_known(conflict_id).await? {
                    tracing::debug!(conflict_id = %conflict_id, "conflict already escalated");
                    return Ok(InboundOutcome::Escalated(conflict_id));
                }
                // both sides detect the pair; only the holder of the later write raises it
                if !local.is_later_than(&remote) {
                    tracing::info!(
                        conflict_id = %conflict_id,
                        entity = %entity,
                        "conflict left for the peer holding the later write to escalate"
                    );
                    return Ok(InboundOutcome::Escalated(conflict_id));
                }
                let detected = EventPayload::ConflictDetected(ConflictDetected {
                    conflict_id,
                    entity: entity.clone(),
                    local: Box::new(local),
                    remote: Box::new(remote.clone()),
                });
                self.emit_follow_up(&remote, detected, correlation).await?;
                tracing::warn!(conflict_id = %conflict_id, entity = %entity, "conflict escalated for manual resolution");
                Ok(InboundOutcome::Escalated(conflict_id))
            }
        }
    }

    /// Latest local write that conflicts with `remote`, with its entity key.
    async fn find_conflict(&self, remote: &Event) -> Result<Option<(Event, EntityKey)>, SyncError> {
        let Some(entity) = self.policies.conflict_key(remote) else {
            return Ok(None);
        };
        let window = self.config.conflict_window;
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        // `query` is exclusive on `since`; step one past the window edge
        let since = (remote.timestamp.as_millis() > window_ms).then(|| remote.timestamp.minus_millis(window_ms + 1));

        let candidates = self.bus.store().query(self.config.operation, since).await?;
        let local = candidates
            .into_iter()
            .filter(|stored| stored.local)
            .map(|stored| stored.event)
            .filter(|event| self.policies.is_conflict(event, remote, window))
            .max_by_key(Event::ordering_key);
        Ok(local.map(|event| (event, entity)))
    }

    /// Whether a detection or resolution for `conflict_id` is stored or staged.
    async fn conflict_known(&self, conflict_id: ConflictId) -> Result<bool, SyncError> {
        let mentions = |payload: &EventPayload| match payload {
            EventPayload::ConflictDetected(d) => d.conflict_id == conflict_id,
            EventPayload::ConflictResolved(r) => r.conflict_id == Some(conflict_id),
            _ => false,
        };
        let store = self.bus.store();
        for event_type in [EventType::ConflictDetected, EventType::ConflictResolved] {
            if store
                .by_type(event_type, usize::MAX)
                .await?
                .iter()
                .any(|stored| mentions(&stored.event.payload))
            {
                return Ok(true);
            }
        }
        Ok(store
            .unprocessed_inbox()
            .await?
            .iter()
            .any(|item| mentions(&item.event.payload)))
    }

    async fn emit_follow_up(
        &self,
        cause: &Event,
        payload: EventPayload,
        correlation: CorrelationId,
    ) -> Result<Event, SyncError> {
        let metadata = self.origin.clone().caused_by(cause).with_correlation(correlation);
        Ok(self.bus.emit_event(payload, metadata).await?)
    }

    async fn record_resolution(
        &self,
        cause: &Event,
        resolution: ConflictResolved,
        correlation: CorrelationId,
    ) -> Result<EventId, SyncError> {
        tracing::info!(
            entity = %resolution.entity,
            strategy = %resolution.strategy,
            "conflict resolved"
        );
        let event = self
            .emit_follow_up(cause, EventPayload::ConflictResolved(resolution), correlation)
            .await?;
        Ok(event.id)
    }

    /// Settle an escalated conflict. Returns the id of the event carrying the
    /// chosen value.
    ///
    /// `KeepLocal` and `TakeRemote` are relative to this replica: when the
    /// detection was raised by the peer, its sides are swapped.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ManualResolution,
    ) -> Result<EventId, SyncError> {
        let store = self.bus.store();
        let already_resolved = store
            .by_type(EventType::ConflictResolved, usize::MAX)
            .await?
            .iter()
            .any(|stored| {
                matches!(&stored.event.payload,
                    EventPayload::ConflictResolved(r) if r.conflict_id == Some(conflict_id))
            });
        if already_resolved {
            return Err(ConflictError::AlreadyResolved(conflict_id).into());
        }

        let detected = store
            .by_type(EventType::ConflictDetected, usize::MAX)
            .await?
            .into_iter()
            .find_map(|stored| match stored.event.payload {
                EventPayload::ConflictDetected(d) if d.conflict_id == conflict_id => Some(d),
                _ => None,
            })
            .ok_or(ConflictError::UnknownConflict(conflict_id))?;
        let ConflictDetected {
            entity, local, remote, ..
        } = detected;
        let device = self.origin.device_id;
        let (local, remote) = if remote.device_id == device && local.device_id != device {
            (remote, local)
        } else {
            (local, remote)
        };
        let correlation = CorrelationId::new();

        let (payload, winner, discarded) = match resolution {
            ManualResolution::KeepLocal => (local.payload.clone(), Some(local.id), vec![remote.id]),
            ManualResolution::TakeRemote => {
                self.bus.apply_remote((*remote).clone()).await?;
                (remote.payload.clone(), Some(remote.id), vec![local.id])
            }
            ManualResolution::Replace(payload) => {
                if payload.event_type() != remote.event_type {
                    return Err(ConflictError::Merge(format!(
                        "replacement must be a {} event, got {}",
                        remote.event_type,
                        payload.event_type()
                    ))
                    .into());
                }
                (payload, None, vec![local.id, remote.id])
            }
        };

        let chosen = self.emit_follow_up(&remote, payload, correlation).await?;
        self.record_resolution(
            &chosen,
            ConflictResolved {
                conflict_id: Some(conflict_id),
                entity,
                strategy: ResolutionStrategy::Manual,
                winner,
                discarded,
                merged: Some(chosen.id),
            },
            correlation,
        )
        .await?;
        Ok(chosen.id)
    }
}
