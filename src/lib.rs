//! slicedb — an in-memory temporal record store with WAL durability.
//!
//! Entities carry a history of time-sliced versions: half-open `[valid_from,
//! valid_to)` intervals that tile a contiguous range with no gaps, no
//! overlaps and no equivalent adjacent slices. Lifecycle operations
//! (insert-at, update-at, delete-at, discontinue, continue) are planned
//! against those invariants, committed atomically as one WAL event and
//! applied under a per-entity write lock. Dependent reservations reference
//! slices by composite key and are repointed inside the same commit whenever
//! a merge or split would orphan them.
//!
//! Durability is a group-commit write-ahead log: appends from concurrent
//! operations are batched by a background writer and acknowledged after a
//! single fsync. Restart replays the log; compaction rewrites it from live
//! state.

pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;

pub use engine::{Engine, EngineError};
pub use model::{
    Day, DependentPolicy, EntityInfo, EntityKind, Field, Ms, ReservationInfo, Slice, SliceInfo,
    SlicePayload,
};
pub use notify::NotifyHub;
