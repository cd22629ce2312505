//! Structural planning: given an entity's state and a proposed mutation,
//! decide which structural change keeps the slice invariants intact.
//!
//! Invariants after every committed operation:
//! 1. bounded slices have `valid_from < valid_to`;
//! 2. slices tile a contiguous range — each `valid_to` equals the next
//!    slice's `valid_from`, only the last slice may be open;
//! 3. no two boundary-adjacent slices have equivalent payloads;
//! 4. every reservation references an existing slice covering its date.
//!
//! Planning is pure: it reads state, validates, and returns a [`Plan`] (or
//! a typed error) without writing anything. The plan lowers to an ordered
//! list of [`SliceEdit`]s that the engine commits as one WAL event.

use crate::limits::{MAX_VALID_DAY, MIN_VALID_DAY};
use crate::model::{Day, EntityState, Slice, SliceEdit, SlicePayload};

use super::migrate;
use super::EngineError;

/// The structural change a lifecycle operation resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Already represented — nothing to commit.
    Noop,
    /// New slice; `close_prev` re-tiles the preceding slice up to it.
    Create { slice: Slice, close_prev: Option<Day> },
    /// Pull the following slice's start back to `new_from`. When the date
    /// fell inside an existing slice, `split_current` closes that slice at
    /// the same point.
    ExtendNextBack { next_from: Day, new_from: Day, split_current: Option<Day> },
    /// The predecessor absorbs the slice starting at `gone_from`.
    MergePrev { prev_from: Day, gone_from: Day },
    /// The current slice takes the updated payload and absorbs its successor.
    MergeNext { current_from: Day, next_from: Day, payload: SlicePayload },
    /// The predecessor absorbs both the current slice and its successor.
    MergeBoth { prev_from: Day, current_from: Day, next_from: Day },
    /// Payload change in place; boundaries untouched.
    Rewrite { current_from: Day, payload: SlicePayload },
    /// Close the current slice at `at` and insert a tail with the new
    /// payload over the remainder of its range.
    Split { current_from: Day, at: Day, payload: SlicePayload },
    /// Remove a first slice outright (no predecessor, no dependents).
    Drop { current_from: Day },
    /// Discontinue: bound the open final slice at `at`.
    Close { last_from: Day, at: Day },
    /// Continue: reopen the bounded final slice.
    Reopen { last_from: Day },
}

pub(super) fn validate_day(day: Day) -> Result<(), EngineError> {
    if !(MIN_VALID_DAY..=MAX_VALID_DAY).contains(&day) {
        return Err(EngineError::LimitExceeded("day out of accepted range"));
    }
    Ok(())
}

fn validate_validity(from: Day, to: Option<Day>) -> Result<(), EngineError> {
    match to {
        Some(to) if from >= to => Err(EngineError::InvalidValidity { from, to }),
        _ => Ok(()),
    }
}

// ── Insert ───────────────────────────────────────────────────────

/// Insert-at-date. `day` must not be covered by any existing slice; the
/// uncovered cases are: no history at all, before the first slice, or after
/// a discontinued end.
pub fn plan_insert(
    state: &EntityState,
    day: Day,
    payload: &SlicePayload,
) -> Result<Plan, EngineError> {
    if let Some(covering) = state.current(day) {
        return Err(EngineError::DuplicateSliceStart {
            entity: state.id,
            started: covering.valid_from,
        });
    }

    let Some(first) = state.slices.first() else {
        return Ok(Plan::Create {
            slice: Slice::new(day, None, payload.normalized()),
            close_prev: None,
        });
    };

    if day < first.valid_from {
        // Prepending history. An equivalent first slice just starts earlier.
        if first.payload.equivalent(payload) {
            return Ok(Plan::ExtendNextBack {
                next_from: first.valid_from,
                new_from: day,
                split_current: None,
            });
        }
        validate_validity(day, Some(first.valid_from))?;
        return Ok(Plan::Create {
            slice: Slice::new(day, Some(first.valid_from), payload.normalized()),
            close_prev: None,
        });
    }

    // Past the discontinued end: the last slice is closed at or before day.
    let last = state.slices.last().expect("non-empty");
    debug_assert!(last.valid_to.is_some_and(|to| to <= day));
    if last.payload.equivalent(payload) {
        return Ok(Plan::Noop);
    }
    // Re-tile: the predecessor's coverage is stretched up to the new slice.
    Ok(Plan::Create {
        slice: Slice::new(day, None, payload.normalized()),
        close_prev: Some(last.valid_from),
    })
}

// ── Update ───────────────────────────────────────────────────────

/// Update-at-date. A slice must cover `day`; the patch is overlaid on its
/// payload and the result placed so that no adjacent pair stays equivalent.
pub fn plan_update(
    state: &EntityState,
    day: Day,
    patch: &SlicePayload,
) -> Result<Plan, EngineError> {
    let current = state
        .current(day)
        .ok_or(EngineError::SliceNotFound { entity: state.id, day })?;
    let updated = current.payload.overlay(patch);
    if current.payload.equivalent(&updated) {
        return Ok(Plan::Noop);
    }

    if day == current.valid_from {
        let prev = state.predecessor_of(current);
        let next = state.successor_of(current);
        let prev_matches = prev.is_some_and(|p| p.payload.equivalent(&updated));
        let next_matches = next.is_some_and(|n| updated.equivalent(&n.payload));
        return Ok(match (prev_matches, next_matches) {
            (true, true) => Plan::MergeBoth {
                prev_from: prev.expect("matched").valid_from,
                current_from: current.valid_from,
                next_from: next.expect("matched").valid_from,
            },
            (true, false) => Plan::MergePrev {
                prev_from: prev.expect("matched").valid_from,
                gone_from: current.valid_from,
            },
            (false, true) => Plan::MergeNext {
                current_from: current.valid_from,
                next_from: next.expect("matched").valid_from,
                payload: updated,
            },
            (false, false) => Plan::Rewrite {
                current_from: current.valid_from,
                payload: updated,
            },
        });
    }

    // Mid-slice: the change takes effect at `day`, the head of the slice
    // keeps the old payload.
    if let Some(next) = state.successor_of(current)
        && updated.equivalent(&next.payload)
    {
        return Ok(Plan::ExtendNextBack {
            next_from: next.valid_from,
            new_from: day,
            split_current: Some(current.valid_from),
        });
    }
    validate_validity(day, current.valid_to)?;
    Ok(Plan::Split {
        current_from: current.valid_from,
        at: day,
        payload: updated,
    })
}

// ── Delete ───────────────────────────────────────────────────────

/// Delete-at-date: remove the covering slice entirely, restoring history as
/// if it never existed. The predecessor absorbs its range; with no
/// predecessor the slice may only vanish when nothing references it.
pub fn plan_delete(state: &EntityState, day: Day) -> Result<Plan, EngineError> {
    let current = state
        .current(day)
        .ok_or(EngineError::SliceNotFound { entity: state.id, day })?;

    let Some(prev) = state.predecessor_of(current) else {
        let mut on_slice = state.reservations_on(current.valid_from);
        if let Some(first) = on_slice.next() {
            return Err(EngineError::ConflictingReservations {
                entity: state.id,
                earliest: first.effective,
                count: 1 + on_slice.count(),
            });
        }
        return Ok(Plan::Drop { current_from: current.valid_from });
    };

    // Absorbing can land the predecessor next to an equivalent successor;
    // fold that one in as well (invariant 3).
    if let Some(next) = state.successor_of(current)
        && prev.payload.equivalent(&next.payload)
    {
        return Ok(Plan::MergeBoth {
            prev_from: prev.valid_from,
            current_from: current.valid_from,
            next_from: next.valid_from,
        });
    }
    Ok(Plan::MergePrev { prev_from: prev.valid_from, gone_from: current.valid_from })
}

// ── Discontinue / continue ───────────────────────────────────────

pub fn plan_discontinue(state: &EntityState, day: Day) -> Result<Plan, EngineError> {
    let last = state.latest().ok_or(EngineError::NoHistory(state.id))?;
    if let Some(closed_at) = last.valid_to {
        return Err(EngineError::AlreadyDiscontinued { entity: state.id, closed_at });
    }
    if day <= last.valid_from {
        return Err(EngineError::ConflictingCutoff {
            entity: state.id,
            cutoff: day,
            slice_start: last.valid_from,
        });
    }
    if state.policy == crate::model::DependentPolicy::Block
        && let Some(first) = state.earliest_reservation_from(day)
    {
        let count = state.reservations.iter().filter(|r| r.effective >= day).count();
        return Err(EngineError::ConflictingReservations {
            entity: state.id,
            earliest: first.effective,
            count,
        });
    }
    validate_validity(last.valid_from, Some(day))?;
    Ok(Plan::Close { last_from: last.valid_from, at: day })
}

/// Reopening never breaks coverage, so there is nothing to validate.
pub fn plan_reopen(state: &EntityState) -> Result<Plan, EngineError> {
    let last = state.latest().ok_or(EngineError::NoHistory(state.id))?;
    if last.is_open() {
        return Ok(Plan::Noop);
    }
    Ok(Plan::Reopen { last_from: last.valid_from })
}

// ── Lowering ─────────────────────────────────────────────────────

/// Lower a plan to the ordered edit list committed as one WAL event.
/// Repoint edits always precede the removal of the slice they drain.
pub fn lower(state: &EntityState, plan: &Plan) -> Vec<SliceEdit> {
    match plan {
        Plan::Noop => Vec::new(),
        Plan::Create { slice, close_prev } => {
            let mut edits = Vec::new();
            if let Some(prev_from) = close_prev {
                edits.push(SliceEdit::SetValidTo {
                    valid_from: *prev_from,
                    valid_to: Some(slice.valid_from),
                });
            }
            edits.push(SliceEdit::Insert { slice: slice.clone() });
            edits
        }
        Plan::ExtendNextBack { next_from, new_from, split_current } => {
            let next_to = state
                .slice_starting(*next_from)
                .and_then(|s| s.valid_to);
            let mut edits = Vec::new();
            if let Some(current_from) = split_current {
                edits.push(SliceEdit::SetValidTo {
                    valid_from: *current_from,
                    valid_to: Some(*new_from),
                });
            }
            edits.push(SliceEdit::SetValidFrom {
                valid_from: *next_from,
                new_valid_from: *new_from,
            });
            // The absorbed slice keeps its reservations under the new key.
            edits.push(migrate::repoint(*next_from, *new_from, *new_from, next_to));
            if let Some(current_from) = split_current {
                // The truncated head hands over reservations past the split.
                edits.push(migrate::repoint(*current_from, *new_from, *new_from, Some(*next_from)));
            }
            edits
        }
        Plan::MergePrev { prev_from, gone_from } => {
            let gone_to = state.slice_starting(*gone_from).and_then(|s| s.valid_to);
            vec![
                SliceEdit::SetValidTo { valid_from: *prev_from, valid_to: gone_to },
                migrate::repoint(*gone_from, *prev_from, *gone_from, gone_to),
                SliceEdit::Remove { valid_from: *gone_from },
            ]
        }
        Plan::MergeNext { current_from, next_from, payload } => {
            let next_to = state.slice_starting(*next_from).and_then(|s| s.valid_to);
            vec![
                SliceEdit::SetPayload { valid_from: *current_from, payload: payload.clone() },
                SliceEdit::SetValidTo { valid_from: *current_from, valid_to: next_to },
                migrate::repoint(*next_from, *current_from, *next_from, next_to),
                SliceEdit::Remove { valid_from: *next_from },
            ]
        }
        Plan::MergeBoth { prev_from, current_from, next_from } => {
            let next_to = state.slice_starting(*next_from).and_then(|s| s.valid_to);
            vec![
                SliceEdit::SetValidTo { valid_from: *prev_from, valid_to: next_to },
                migrate::repoint(*current_from, *prev_from, *current_from, Some(*next_from)),
                migrate::repoint(*next_from, *prev_from, *next_from, next_to),
                SliceEdit::Remove { valid_from: *current_from },
                SliceEdit::Remove { valid_from: *next_from },
            ]
        }
        Plan::Rewrite { current_from, payload } => {
            vec![SliceEdit::SetPayload { valid_from: *current_from, payload: payload.clone() }]
        }
        Plan::Split { current_from, at, payload } => {
            let old_to = state.slice_starting(*current_from).and_then(|s| s.valid_to);
            vec![
                SliceEdit::SetValidTo { valid_from: *current_from, valid_to: Some(*at) },
                SliceEdit::Insert { slice: Slice::new(*at, old_to, payload.normalized()) },
                migrate::repoint(*current_from, *at, *at, old_to),
            ]
        }
        Plan::Drop { current_from } => {
            vec![SliceEdit::Remove { valid_from: *current_from }]
        }
        Plan::Close { last_from, at } => {
            vec![SliceEdit::SetValidTo { valid_from: *last_from, valid_to: Some(*at) }]
        }
        Plan::Reopen { last_from } => {
            vec![SliceEdit::SetValidTo { valid_from: *last_from, valid_to: None }]
        }
    }
}

/// `valid_from` of the slice a committed plan leaves behind as "the affected
/// record", if any. Looked up after the edits are applied.
pub fn affected_start(plan: &Plan) -> Option<Day> {
    match plan {
        Plan::Noop | Plan::Drop { .. } => None,
        Plan::Create { slice, .. } => Some(slice.valid_from),
        Plan::ExtendNextBack { new_from, .. } => Some(*new_from),
        Plan::MergePrev { prev_from, .. } | Plan::MergeBoth { prev_from, .. } => Some(*prev_from),
        Plan::MergeNext { current_from, .. } | Plan::Rewrite { current_from, .. } => {
            Some(*current_from)
        }
        Plan::Split { at, .. } => Some(*at),
        Plan::Close { last_from, .. } | Plan::Reopen { last_from } => Some(*last_from),
    }
}

/// Short label for metrics and logs.
pub fn plan_label(plan: &Plan) -> &'static str {
    match plan {
        Plan::Noop => "noop",
        Plan::Create { .. } => "create",
        Plan::ExtendNextBack { .. } => "extend_next_back",
        Plan::MergePrev { .. } => "merge_prev",
        Plan::MergeNext { .. } => "merge_next",
        Plan::MergeBoth { .. } => "merge_both",
        Plan::Rewrite { .. } => "rewrite",
        Plan::Split { .. } => "split",
        Plan::Drop { .. } => "drop",
        Plan::Close { .. } => "close",
        Plan::Reopen { .. } => "reopen",
    }
}
