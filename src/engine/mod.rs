mod error;
mod migrate;
mod mutations;
mod plan;
mod queries;
mod resolve;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use plan::{plan_delete, plan_discontinue, plan_insert, plan_reopen, plan_update, Plan};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedEntityState = Arc<RwLock<EntityState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch first, then handle the
                            // non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    let result = match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedEntityState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → owning entity id.
    pub(super) reservation_to_entity: DashMap<Ulid, Ulid>,
}

/// Apply an ordered edit list to one entity (no locking — caller holds the
/// lock). Returns the number of reservations repointed.
pub(crate) fn apply_edits(state: &mut EntityState, edits: &[SliceEdit]) -> usize {
    let mut migrated = 0;
    for edit in edits {
        match edit {
            SliceEdit::Insert { slice } => state.insert_slice(slice.clone()),
            SliceEdit::Remove { valid_from } => {
                state.remove_slice(*valid_from);
            }
            SliceEdit::SetValidTo { valid_from, valid_to } => {
                if let Some(s) = state.slice_starting_mut(*valid_from) {
                    s.valid_to = *valid_to;
                }
            }
            SliceEdit::SetValidFrom { valid_from, new_valid_from } => {
                if let Some(mut s) = state.remove_slice(*valid_from) {
                    s.valid_from = *new_valid_from;
                    state.insert_slice(s);
                }
            }
            SliceEdit::SetPayload { valid_from, payload } => {
                if let Some(s) = state.slice_starting_mut(*valid_from) {
                    s.payload = payload.clone();
                }
            }
            SliceEdit::Repoint { .. } => {
                migrated += migrate::apply_repoint(state, edit);
            }
        }
    }
    migrated
}

/// Apply a non-create event to an entity's state (caller holds the lock).
/// Returns the number of reservations repointed.
fn apply_to_entity(state: &mut EntityState, event: &Event, index: &DashMap<Ulid, Ulid>) -> usize {
    match event {
        Event::EntityRetired { .. } => {
            state.retired = true;
        }
        Event::SliceCommitted { edits, .. } => {
            return apply_edits(state, edits);
        }
        Event::ReservationBooked { id, entity_id, slice_from, effective, label } => {
            state.insert_reservation(Reservation {
                id: *id,
                slice_from: *slice_from,
                effective: *effective,
                label: label.clone(),
            });
            index.insert(*id, *entity_id);
        }
        Event::ReservationCancelled { id, .. } => {
            state.remove_reservation(*id);
            index.remove(id);
        }
        // EntityCreated is handled at the DashMap level, not here
        Event::EntityCreated { .. } => {}
    }
    0
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            reservation_to_entity: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use
        // blocking_write here because this may run inside an async context.
        let replayed = events.len();
        for event in &events {
            match event {
                Event::EntityCreated { id, kind, policy, display, created_at } => {
                    let st = EntityState::new(*id, *kind, *policy, display.clone(), *created_at);
                    engine.state.insert(*id, Arc::new(RwLock::new(st)));
                }
                other => {
                    if let Some(entity_id) = event_entity_id(other)
                        && let Some(entry) = engine.state.get(&entity_id)
                    {
                        let st_arc = entry.clone();
                        let mut guard = st_arc.try_write().expect("replay: uncontended write");
                        apply_to_entity(&mut guard, other, &engine.reservation_to_entity);
                    }
                }
            }
        }
        if replayed > 0 {
            tracing::info!(events = replayed, entities = engine.state.len(), "WAL replayed");
        }
        metrics::gauge!(crate::observability::ENTITIES_ACTIVE).set(engine.state.len() as f64);

        Ok(engine)
    }

    /// Write an event to the WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_entity(&self, id: &Ulid) -> Option<SharedEntityState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn entity_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_entity.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call, under the caller's write
    /// lock. The in-memory state changes only after the event is durable,
    /// so a failed append leaves everything untouched.
    pub(super) async fn persist_and_apply(
        &self,
        entity_id: Ulid,
        state: &mut EntityState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let migrated = apply_to_entity(state, event, &self.reservation_to_entity);
        if migrated > 0 {
            metrics::counter!(crate::observability::RESERVATIONS_MIGRATED_TOTAL)
                .increment(migrated as u64);
        }
        self.notify.send(entity_id, event);
        Ok(())
    }

    /// Get an entity and acquire its write lock. All structural operations
    /// on one entity serialize here; distinct entities never contend.
    pub(super) async fn entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<EntityState>, EngineError> {
        let st = self
            .get_entity(entity_id)
            .ok_or(EngineError::EntityNotFound(*entity_id))?;
        Ok(st.write_owned().await)
    }

    /// Like `entity_write`, but rejects soft-deleted entities.
    pub(super) async fn entity_write_live(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<EntityState>, EngineError> {
        let guard = self.entity_write(entity_id).await?;
        if guard.retired {
            return Err(EngineError::EntityRetired(*entity_id));
        }
        Ok(guard)
    }
}

/// Extract the entity id from an event (for non-create events).
fn event_entity_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::EntityRetired { id } => Some(*id),
        Event::SliceCommitted { entity_id, .. }
        | Event::ReservationBooked { entity_id, .. }
        | Event::ReservationCancelled { entity_id, .. } => Some(*entity_id),
        Event::EntityCreated { .. } => None,
    }
}
