mod error;
mod ledger;
mod mutations;
mod queries;
mod validate;

pub use error::EngineError;
pub use ledger::now_ms;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::idempotency::Outcome;
use crate::limits::MAX_REMEMBERED_REJECTIONS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Longest a mutation or read waits for a resource's lock before giving up
    /// with a retryable `Contention` error.
    pub lock_timeout: Duration,
    /// Depth of the group-commit channel in front of the WAL writer.
    pub wal_queue_depth: usize,
    /// Rejected tokens persisted per resource before rejections stop being memoized.
    pub max_remembered_rejections: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            wal_queue_depth: 4096,
            max_remembered_rejections: MAX_REMEMBERED_REJECTIONS,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Make the next flush write its bytes and then report an fsync failure.
    #[cfg(test)]
    FailNextSync,
}

pub(super) struct WalAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

/// Returns the command back if it is an append, handling anything else inline.
fn handle_command(wal: &mut Wal, cmd: WalCommand) -> Option<WalAppend> {
    match cmd {
        WalCommand::Append { event, response } => Some(WalAppend { event, response }),
        #[cfg(test)]
        WalCommand::FailNextSync => {
            wal.fail_next_sync();
            None
        }
    }
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first append arrives.
/// 2. Drain every append already queued behind it.
/// 3. One flush_sync for the whole batch.
/// 4. Answer every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let Some(first) = handle_command(&mut wal, cmd) else {
            continue;
        };
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            if let Some(append) = handle_command(&mut wal, next) {
                batch.push(append);
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {}: {e}", wal.path().display());
        }
        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
}

/// Write and sync one batch. On any failure the log is cut back to its last
/// synced length, so a batch its callers were told failed never replays.
fn flush_batch(wal: &mut Wal, batch: &[WalAppend]) -> io::Result<()> {
    let written = batch
        .iter()
        .try_for_each(|append| wal.append_buffered(&append.event))
        .and_then(|()| wal.flush_sync());
    if written.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!(
            "WAL rollback failed for {}, refusing further appends: {e}",
            wal.path().display()
        );
    }
    written
}

/// Capacity-constrained reservation ledger for one tenant.
pub struct Engine {
    state: DashMap<ResourceId, SharedResourceState>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: allocation id → resource id.
    allocation_index: DashMap<Ulid, ResourceId>,
    /// Requester → every allocation id they were ever granted.
    by_requester: DashMap<RequesterId, Vec<Ulid>>,
    /// Serializes resource creation so a duplicate id can't slip between check and insert.
    create_lock: Mutex<()>,
    config: EngineConfig,
}

/// Apply an event to a ResourceState (no locking; caller holds the write lock).
fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    allocation_index: &DashMap<Ulid, ResourceId>,
    by_requester: &DashMap<RequesterId, Vec<Ulid>>,
) {
    match event {
        Event::AllocationGranted {
            id,
            resource_id,
            requester_id,
            units,
            request_token,
            note,
            created_at,
        } => {
            rs.grant(Allocation {
                id: *id,
                resource_id: resource_id.clone(),
                requester_id: requester_id.clone(),
                units: *units,
                status: AllocationStatus::Active,
                request_token: request_token.clone(),
                note: note.clone(),
                created_at: *created_at,
                released_at: None,
            });
            let remaining = rs.remaining();
            rs.guard.record(
                requester_id,
                request_token,
                Outcome::Granted {
                    allocation_id: *id,
                    units: *units,
                    remaining,
                },
            );
            allocation_index.insert(*id, resource_id.clone());
            by_requester.entry(requester_id.clone()).or_default().push(*id);
        }
        Event::ReservationRejected {
            requester_id,
            request_token,
            units,
            ..
        } => {
            rs.guard.record(
                requester_id,
                request_token,
                Outcome::Rejected { units: *units },
            );
        }
        Event::AllocationReleased { id, released_at, .. } => {
            rs.release(id, *released_at);
        }
        // Handled at the map level, not here
        Event::ResourceCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_config(wal_path, notify, EngineConfig::default())
    }

    /// Replay the WAL at `wal_path` and start its group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn with_config(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let (wal, events) = Wal::open_and_replay(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(config.wal_queue_depth.max(1));
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            allocation_index: DashMap::new(),
            by_requester: DashMap::new(),
            create_lock: Mutex::new(()),
            config,
        };

        // Rebuild plain state first; nothing else can see it yet, so no locks.
        let mut resources: HashMap<ResourceId, ResourceState> = HashMap::new();
        for event in &events {
            match event {
                Event::ResourceCreated { id, name, capacity } => {
                    resources
                        .entry(id.clone())
                        .or_insert_with(|| ResourceState::new(id.clone(), name.clone(), *capacity));
                }
                other => {
                    let Some(rs) = resources.get_mut(other.resource_id()) else {
                        continue;
                    };
                    // A grant that no longer fits can only come from a log written
                    // outside this engine; drop it rather than overbook.
                    if let Event::AllocationGranted { id, units, .. } = other
                        && !rs.fits(*units)
                    {
                        tracing::warn!(
                            "skipping replayed grant {id} on {}: {units} units exceed capacity",
                            rs.id
                        );
                        continue;
                    }
                    apply_to_resource(rs, other, &engine.allocation_index, &engine.by_requester);
                }
            }
        }
        for (id, rs) in resources {
            engine.state.insert(id, Arc::new(RwLock::new(rs)));
        }

        tracing::debug!(
            "replayed {} events into {} resources from {}",
            events.len(),
            engine.state.len(),
            wal_path.display()
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    #[cfg(test)]
    pub(super) async fn fail_next_wal_sync(&self) {
        let _ = self.wal_tx.send(WalCommand::FailNextSync).await;
    }

    pub(super) fn get_resource(&self, id: &str) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub(super) fn resource_for_allocation(&self, allocation_id: &Ulid) -> Option<ResourceId> {
        self.allocation_index.get(allocation_id).map(|e| e.value().clone())
    }

    /// WAL-append, then apply, then notify. The WAL append is the commit point:
    /// if it fails the in-memory state is left exactly as it was.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.allocation_index, &self.by_requester);
        if !matches!(event, Event::ReservationRejected { .. }) {
            self.notify.send(event);
        }
        Ok(())
    }

    /// Acquire a resource's write lock within the configured budget.
    pub(super) async fn lock_resource(
        &self,
        resource_id: &str,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(resource_id)
            .ok_or_else(|| EngineError::ResourceNotFound(resource_id.to_string()))?;
        match tokio::time::timeout(self.config.lock_timeout, rs.write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!("write lock on {resource_id} not acquired within {:?}", self.config.lock_timeout);
                Err(EngineError::Contention(resource_id.to_string()))
            }
        }
    }

    /// Acquire a resource's read lock within the configured budget.
    pub(super) async fn read_resource(
        &self,
        resource_id: &str,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(resource_id)
            .ok_or_else(|| EngineError::ResourceNotFound(resource_id.to_string()))?;
        tokio::time::timeout(self.config.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::Contention(resource_id.to_string())
            })
    }

    /// Run a committing section on its own task. A caller that drops its future
    /// cannot interrupt the section between the WAL append and the in-memory apply;
    /// whatever the section commits stands.
    pub(super) async fn detached<T, F, Fut>(self: &Arc<Self>, section: F) -> Result<T, EngineError>
    where
        F: FnOnce(Arc<Engine>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(section(Arc::clone(self)))
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))?
    }
}
