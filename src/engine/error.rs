use ulid::Ulid;

use crate::model::Day;

/// Engine error taxonomy. Every variant is detected before any write and
/// carries enough structured detail (ids, dates) for a precise caller-facing
/// message.
#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    /// A proposed slice would have `valid_from >= valid_to`. Never
    /// auto-corrected.
    InvalidValidity { from: Day, to: Day },
    /// Insert targets a date already inside an existing slice; `started`
    /// is that slice's start. Caller should update instead.
    DuplicateSliceStart { entity: Ulid, started: Day },
    /// No slice covers the given date for this entity.
    SliceNotFound { entity: Ulid, day: Day },
    EntityNotFound(Ulid),
    /// Entity is soft-deleted; mutations are rejected.
    EntityRetired(Ulid),
    AlreadyExists(Ulid),
    /// Entity has no slices at all (discontinue/continue need history).
    NoHistory(Ulid),
    /// The operation would orphan or invalidate reservations. `earliest`
    /// is the first offending reservation date.
    ConflictingReservations { entity: Ulid, earliest: Day, count: usize },
    AlreadyDiscontinued { entity: Ulid, closed_at: Day },
    /// Discontinue cutoff is not strictly after the latest slice's start.
    ConflictingCutoff { entity: Ulid, cutoff: Day, slice_start: Day },
    ReservationNotFound(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidValidity { from, to } => {
                write!(f, "invalid validity: [{from}, {to}) is empty or reversed")
            }
            EngineError::DuplicateSliceStart { entity, started } => {
                write!(f, "entity {entity} already has a slice covering that date (starts day {started})")
            }
            EngineError::SliceNotFound { entity, day } => {
                write!(f, "entity {entity} has no slice covering day {day}")
            }
            EngineError::EntityNotFound(id) => write!(f, "entity not found: {id}"),
            EngineError::EntityRetired(id) => write!(f, "entity retired: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NoHistory(id) => write!(f, "entity {id} has no recorded slices"),
            EngineError::ConflictingReservations { entity, earliest, count } => {
                write!(
                    f,
                    "{count} conflicting reservation(s) on entity {entity}, earliest on day {earliest}"
                )
            }
            EngineError::AlreadyDiscontinued { entity, closed_at } => {
                write!(f, "entity {entity} already discontinued at day {closed_at}")
            }
            EngineError::ConflictingCutoff { entity, cutoff, slice_start } => {
                write!(
                    f,
                    "cutoff day {cutoff} is not after the latest slice of entity {entity} (starts day {slice_start})"
                )
            }
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
