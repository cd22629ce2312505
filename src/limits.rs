//! Hard caps enforced before any write. Exceeding one is a caller error,
//! not a storage error.

use crate::model::Day;

pub const MAX_ENTITIES: usize = 100_000;
pub const MAX_SLICES_PER_ENTITY: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ENTITY: usize = 100_000;
pub const MAX_DISPLAY_LEN: usize = 255;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_LABEL_LEN: usize = 255;

/// Accepted calendar range, days since the Unix epoch.
/// 1970-01-01 .. roughly year 2243.
pub const MIN_VALID_DAY: Day = 0;
pub const MAX_VALID_DAY: Day = 100_000;
