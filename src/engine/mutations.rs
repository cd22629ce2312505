use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::plan::{self, validate_day, Plan};
use super::{Engine, EngineError, SharedEntityState, WalCommand};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

fn validate_payload(payload: &SlicePayload) -> Result<(), EngineError> {
    if let Field::Set(name) = &payload.name
        && name.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    if let Field::Set(notes) = &payload.notes
        && notes.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    if let Field::Set(color) = &payload.color
        && color.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("color too long"));
    }
    Ok(())
}

impl Engine {
    // ── Entity lifecycle ─────────────────────────────────────

    pub async fn create_entity(
        &self,
        id: Ulid,
        kind: EntityKind,
        display: Option<String>,
        policy: Option<DependentPolicy>,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_ENTITIES {
            return Err(EngineError::LimitExceeded("too many entities"));
        }
        if let Some(ref d) = display
            && d.len() > MAX_DISPLAY_LEN
        {
            return Err(EngineError::LimitExceeded("display name too long"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let policy = policy.unwrap_or_else(|| kind.default_policy());
        let created_at = now_ms();
        let event = Event::EntityCreated {
            id,
            kind,
            policy,
            display: display.clone(),
            created_at,
        };
        self.wal_append(&event).await?;
        let st = EntityState::new(id, kind, policy, display, created_at);
        self.state.insert(id, Arc::new(RwLock::new(st)));
        metrics::gauge!(observability::ENTITIES_ACTIVE).increment(1.0);
        self.notify.send(id, &event);
        tracing::debug!(%id, ?kind, "entity created");
        Ok(())
    }

    /// Soft delete. History and reservations stay readable; further
    /// mutations are rejected.
    pub async fn retire_entity(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.entity_write(&id).await?;
        if guard.retired {
            return Err(EngineError::EntityRetired(id));
        }
        let event = Event::EntityRetired { id };
        self.persist_and_apply(id, &mut guard, &event).await?;
        metrics::gauge!(observability::ENTITIES_ACTIVE).decrement(1.0);
        tracing::debug!(%id, "entity retired");
        Ok(())
    }

    // ── Lifecycle operations on slices ───────────────────────

    /// Insert a new version starting at `day`. Returns `None` when the
    /// content is already represented, the affected slice otherwise.
    pub async fn insert_at(
        &self,
        entity_id: Ulid,
        day: Day,
        payload: SlicePayload,
    ) -> Result<Option<Slice>, EngineError> {
        validate_day(day)?;
        validate_payload(&payload)?;
        let mut guard = self.entity_write_live(&entity_id).await?;
        if guard.slices.len() >= MAX_SLICES_PER_ENTITY {
            return Err(EngineError::LimitExceeded("too many slices on entity"));
        }
        let plan = plan::plan_insert(&guard, day, &payload)?;
        self.commit_plan("insert_at", entity_id, &mut guard, plan).await
    }

    /// Apply a partial patch effective from `day`. Returns `None` when the
    /// patch changes nothing, the affected slice otherwise.
    pub async fn update_at(
        &self,
        entity_id: Ulid,
        day: Day,
        patch: SlicePayload,
    ) -> Result<Option<Slice>, EngineError> {
        validate_day(day)?;
        validate_payload(&patch)?;
        let mut guard = self.entity_write_live(&entity_id).await?;
        if guard.slices.len() >= MAX_SLICES_PER_ENTITY {
            return Err(EngineError::LimitExceeded("too many slices on entity"));
        }
        let plan = plan::plan_update(&guard, day, &patch)?;
        self.commit_plan("update_at", entity_id, &mut guard, plan).await
    }

    /// Remove the slice covering `day` as if it never existed. Returns the
    /// surviving predecessor, or `None` when a first slice was dropped.
    pub async fn delete_at(
        &self,
        entity_id: Ulid,
        day: Day,
    ) -> Result<Option<Slice>, EngineError> {
        validate_day(day)?;
        let mut guard = self.entity_write_live(&entity_id).await?;
        let plan = plan::plan_delete(&guard, day)?;
        self.commit_plan("delete_at", entity_id, &mut guard, plan).await
    }

    /// Close the open final slice at `day`.
    pub async fn discontinue(&self, entity_id: Ulid, day: Day) -> Result<Slice, EngineError> {
        validate_day(day)?;
        let mut guard = self.entity_write_live(&entity_id).await?;
        let plan = plan::plan_discontinue(&guard, day)?;
        let slice = self
            .commit_plan("discontinue", entity_id, &mut guard, plan)
            .await?;
        slice.ok_or(EngineError::NoHistory(entity_id))
    }

    /// Reopen the final slice. Never conflicts: restoring coverage cannot
    /// orphan anything.
    pub async fn reopen(&self, entity_id: Ulid) -> Result<Slice, EngineError> {
        let mut guard = self.entity_write_live(&entity_id).await?;
        let plan = plan::plan_reopen(&guard)?;
        if plan == Plan::Noop {
            return guard.latest().cloned().ok_or(EngineError::NoHistory(entity_id));
        }
        let slice = self.commit_plan("reopen", entity_id, &mut guard, plan).await?;
        slice.ok_or(EngineError::NoHistory(entity_id))
    }

    /// Lower a resolved plan to edits, commit them as one WAL event, apply
    /// under the held lock and return the affected slice.
    async fn commit_plan(
        &self,
        op: &'static str,
        entity_id: Ulid,
        guard: &mut EntityState,
        plan: Plan,
    ) -> Result<Option<Slice>, EngineError> {
        let label = plan::plan_label(&plan);
        let start = std::time::Instant::now();
        if plan == Plan::Noop {
            metrics::counter!(observability::OPS_TOTAL, "op" => op, "outcome" => "noop")
                .increment(1);
            return Ok(None);
        }

        let edits = plan::lower(guard, &plan);
        let event = Event::SliceCommitted { entity_id, edits };
        self.persist_and_apply(entity_id, guard, &event).await?;

        metrics::counter!(observability::OPS_TOTAL, "op" => op, "outcome" => label).increment(1);
        metrics::histogram!(observability::OP_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        tracing::debug!(%entity_id, op, outcome = label, "slice change committed");

        Ok(plan::affected_start(&plan).and_then(|from| guard.slice_starting(from).cloned()))
    }

    // ── Dependent rows ───────────────────────────────────────

    /// Book a reservation dated `effective`, attached to the slice active
    /// on that day.
    pub async fn book_reservation(
        &self,
        id: Ulid,
        entity_id: Ulid,
        effective: Day,
        label: Option<String>,
    ) -> Result<ReservationInfo, EngineError> {
        validate_day(effective)?;
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("label too long"));
        }
        if self.reservation_to_entity.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.entity_write_live(&entity_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ENTITY {
            return Err(EngineError::LimitExceeded("too many reservations on entity"));
        }
        let slice_from = guard
            .current(effective)
            .map(|s| s.valid_from)
            .ok_or(EngineError::SliceNotFound { entity: entity_id, day: effective })?;

        let event = Event::ReservationBooked {
            id,
            entity_id,
            slice_from,
            effective,
            label: label.clone(),
        };
        self.persist_and_apply(entity_id, &mut guard, &event).await?;
        Ok(ReservationInfo { id, entity_id, slice_from, effective, label })
    }

    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let entity_id = self
            .entity_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let mut guard = self.entity_write(&entity_id).await?;
        let event = Event::ReservationCancelled { id, entity_id };
        self.persist_and_apply(entity_id, &mut guard, &event).await?;
        Ok(entity_id)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let entries: Vec<SharedEntityState> =
            self.state.iter().map(|e| e.value().clone()).collect();

        for st_arc in entries {
            let guard = st_arc.read().await;
            events.push(Event::EntityCreated {
                id: guard.id,
                kind: guard.kind,
                policy: guard.policy,
                display: guard.display.clone(),
                created_at: guard.created_at,
            });
            if !guard.slices.is_empty() {
                events.push(Event::SliceCommitted {
                    entity_id: guard.id,
                    edits: guard
                        .slices
                        .iter()
                        .map(|s| SliceEdit::Insert { slice: s.clone() })
                        .collect(),
                });
            }
            for r in &guard.reservations {
                events.push(Event::ReservationBooked {
                    id: r.id,
                    entity_id: guard.id,
                    slice_from: r.slice_from,
                    effective: r.effective,
                    label: r.label.clone(),
                });
            }
            if guard.retired {
                events.push(Event::EntityRetired { id: guard.id });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
