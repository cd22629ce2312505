use ulid::Ulid;

use crate::model::{Day, EntityInfo, EntityState, ReservationInfo, Slice, SliceInfo};

use super::{Engine, EngineError, SharedEntityState};

fn slice_info(entity_id: Ulid, s: &Slice) -> SliceInfo {
    SliceInfo {
        entity_id,
        valid_from: s.valid_from,
        valid_to: s.valid_to,
        payload: s.payload.clone(),
    }
}

fn entity_info(st: &EntityState) -> EntityInfo {
    EntityInfo {
        id: st.id,
        kind: st.kind,
        policy: st.policy,
        display: st.display.clone(),
        created_at: st.created_at,
        retired: st.retired,
    }
}

impl Engine {
    /// The version active on `day`, if any.
    pub async fn active_at(
        &self,
        entity_id: Ulid,
        day: Day,
    ) -> Result<Option<SliceInfo>, EngineError> {
        let st = self
            .get_entity(&entity_id)
            .ok_or(EngineError::EntityNotFound(entity_id))?;
        let guard = st.read().await;
        Ok(guard.current(day).map(|s| slice_info(entity_id, s)))
    }

    /// The version with the greatest start date, open or closed.
    pub async fn latest_slice(&self, entity_id: Ulid) -> Result<Option<SliceInfo>, EngineError> {
        let st = self
            .get_entity(&entity_id)
            .ok_or(EngineError::EntityNotFound(entity_id))?;
        let guard = st.read().await;
        Ok(guard.latest().map(|s| slice_info(entity_id, s)))
    }

    /// Full version history, ordered by start date.
    pub async fn history(&self, entity_id: Ulid) -> Result<Vec<SliceInfo>, EngineError> {
        let st = self
            .get_entity(&entity_id)
            .ok_or(EngineError::EntityNotFound(entity_id))?;
        let guard = st.read().await;
        Ok(guard.slices.iter().map(|s| slice_info(entity_id, s)).collect())
    }

    /// All entities, retired ones included, ordered by id.
    pub async fn list_entities(&self) -> Vec<EntityInfo> {
        let arcs: Vec<SharedEntityState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for st in arcs {
            let guard = st.read().await;
            out.push(entity_info(&guard));
        }
        out.sort_by_key(|e| e.id);
        out
    }

    /// Metadata for one entity.
    pub async fn entity(&self, entity_id: Ulid) -> Result<EntityInfo, EngineError> {
        let st = self
            .get_entity(&entity_id)
            .ok_or(EngineError::EntityNotFound(entity_id))?;
        let guard = st.read().await;
        Ok(entity_info(&guard))
    }

    /// All reservations on an entity, ordered by effective date.
    pub async fn reservations(
        &self,
        entity_id: Ulid,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let st = self
            .get_entity(&entity_id)
            .ok_or(EngineError::EntityNotFound(entity_id))?;
        let guard = st.read().await;
        Ok(guard
            .reservations
            .iter()
            .map(|r| ReservationInfo {
                id: r.id,
                entity_id,
                slice_from: r.slice_from,
                effective: r.effective,
                label: r.label.clone(),
            })
            .collect())
    }

    /// Look up one reservation by id.
    pub async fn reservation(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let entity_id = self
            .entity_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let st = self
            .get_entity(&entity_id)
            .ok_or(EngineError::EntityNotFound(entity_id))?;
        let guard = st.read().await;
        guard
            .reservations
            .iter()
            .find(|r| r.id == id)
            .map(|r| ReservationInfo {
                id: r.id,
                entity_id,
                slice_from: r.slice_from,
                effective: r.effective,
                label: r.label.clone(),
            })
            .ok_or(EngineError::ReservationNotFound(id))
    }
}
