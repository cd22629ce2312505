//! Reference migration: bulk-repoint dependent reservations from a doomed
//! slice onto its survivor.
//!
//! A reservation references a slice by composite key `(entity_id,
//! valid_from)`. When a slice is merged away or its start moves, every
//! reservation keyed to it must follow the surviving slice that now covers
//! its effective date. The migration travels inside the same committed edit
//! list as the structural change, ordered before the slice removal, so no
//! reservation is ever observable pointing at a removed slice.

use crate::model::{Day, EntityState, SliceEdit};

/// Build the repoint edit for reservations keyed to `from_key` whose
/// effective date falls in `[lo, hi)`.
pub fn repoint(from_key: Day, to_key: Day, lo: Day, hi: Option<Day>) -> SliceEdit {
    SliceEdit::Repoint { from_key, to_key, lo, hi }
}

/// Apply a repoint edit to in-memory state. Returns how many reservations
/// moved (recorded as a migration metric by the engine).
pub fn apply_repoint(state: &mut EntityState, edit: &SliceEdit) -> usize {
    match edit {
        SliceEdit::Repoint { from_key, to_key, lo, hi } => {
            state.repoint_reservations(*from_key, *to_key, *lo, *hi)
        }
        _ => 0,
    }
}
