use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Days since the Unix epoch — the only date type.
pub type Day = i32;

/// Unix milliseconds, used for entity creation stamps.
pub type Ms = i64;

// ── Versioned fields ─────────────────────────────────────────────

/// Outcome of comparing two versioned fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCmp {
    Match,
    Mismatch,
    /// At least one side did not mention the field at all.
    Wildcard,
}

/// A versioned field with three states.
///
/// `Unset` means the field was not mentioned (a partial patch, or an entity
/// kind that has no such attribute) and matches anything. `Null` means the
/// field was explicitly cleared. Stored slices are normalized so that
/// `Unset` never persists; only patches carry wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field<T> {
    #[default]
    Unset,
    Null,
    Set(T),
}

impl<T: PartialEq> Field<T> {
    pub fn compare(&self, other: &Self) -> FieldCmp {
        match (self, other) {
            (Field::Unset, _) | (_, Field::Unset) => FieldCmp::Wildcard,
            (Field::Null, Field::Null) => FieldCmp::Match,
            (Field::Set(a), Field::Set(b)) if a == b => FieldCmp::Match,
            _ => FieldCmp::Mismatch,
        }
    }
}

impl<T: Clone> Field<T> {
    /// `Unset` in `patch` keeps `self`; anything else wins.
    fn overlaid(&self, patch: &Self) -> Self {
        match patch {
            Field::Unset => self.clone(),
            other => other.clone(),
        }
    }

    /// `Unset` collapsed to `Null` — the form stored slices use.
    fn normalized(&self) -> Self {
        match self {
            Field::Unset => Field::Null,
            other => other.clone(),
        }
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Field::Set(v),
            None => Field::Null,
        }
    }
}

/// The versioned attributes of one slice. Customer-kind entities use
/// `name`/`notes`; service-kind entities additionally use `price_cents`
/// and `color`. Unused fields stay `Null` in storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlicePayload {
    pub name: Field<String>,
    pub notes: Field<String>,
    pub price_cents: Field<i64>,
    pub color: Field<String>,
}

impl SlicePayload {
    /// Field-wise comparison under the wildcard rule: true iff no field is
    /// an outright mismatch. A partial patch therefore compares equal to a
    /// full stored payload on the fields it does not mention.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.name.compare(&other.name) != FieldCmp::Mismatch
            && self.notes.compare(&other.notes) != FieldCmp::Mismatch
            && self.price_cents.compare(&other.price_cents) != FieldCmp::Mismatch
            && self.color.compare(&other.color) != FieldCmp::Mismatch
    }

    /// Apply a partial patch on top of `self`, field by field.
    pub fn overlay(&self, patch: &Self) -> Self {
        Self {
            name: self.name.overlaid(&patch.name),
            notes: self.notes.overlaid(&patch.notes),
            price_cents: self.price_cents.overlaid(&patch.price_cents),
            color: self.color.overlaid(&patch.color),
        }
    }

    /// Storage form: every `Unset` becomes `Null`.
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.normalized(),
            notes: self.notes.normalized(),
            price_cents: self.price_cents.normalized(),
            color: self.color.normalized(),
        }
    }
}

// ── Slices ───────────────────────────────────────────────────────

/// One time-bounded version of an entity's versioned attributes, valid over
/// the half-open interval `[valid_from, valid_to)`. `valid_to == None`
/// means open — still in effect, unbounded into the future.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    pub valid_from: Day,
    pub valid_to: Option<Day>,
    pub payload: SlicePayload,
}

impl Slice {
    pub fn new(valid_from: Day, valid_to: Option<Day>, payload: SlicePayload) -> Self {
        debug_assert!(
            valid_to.is_none_or(|to| valid_from < to),
            "slice valid_from must be before valid_to"
        );
        Self { valid_from, valid_to, payload }
    }

    pub fn covers(&self, day: Day) -> bool {
        self.valid_from <= day && self.valid_to.is_none_or(|to| day < to)
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }
}

// ── Entities and dependents ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Customer,
    Service,
}

/// Whether reservations dated at or after a discontinue cutoff block the
/// discontinue. The service path blocks; the customer path historically did
/// not, so the policy is chosen per entity instead of per code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependentPolicy {
    Block,
    Allow,
}

impl EntityKind {
    pub fn default_policy(self) -> DependentPolicy {
        match self {
            EntityKind::Customer => DependentPolicy::Allow,
            EntityKind::Service => DependentPolicy::Block,
        }
    }
}

/// A dependent row. References one historical slice by composite key
/// `(entity_id, slice_from)` — the slice that was active when the
/// reservation was made — never the live entity directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    /// `valid_from` of the referenced slice.
    pub slice_from: Day,
    /// The reservation's own date. Always inside the referenced slice.
    pub effective: Day,
    pub label: Option<String>,
}

/// All state for one entity: non-versioned attributes, the slice sequence
/// (sorted by `valid_from`, tiling a contiguous range) and the dependent
/// reservations (sorted by effective date).
#[derive(Debug, Clone)]
pub struct EntityState {
    pub id: Ulid,
    pub kind: EntityKind,
    pub policy: DependentPolicy,
    pub display: Option<String>,
    pub created_at: Ms,
    /// Soft-delete flag. Retired entities reject mutations; history stays
    /// readable.
    pub retired: bool,
    pub slices: Vec<Slice>,
    pub reservations: Vec<Reservation>,
}

impl EntityState {
    pub fn new(
        id: Ulid,
        kind: EntityKind,
        policy: DependentPolicy,
        display: Option<String>,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            kind,
            policy,
            display,
            created_at,
            retired: false,
            slices: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert a slice maintaining sort order by `valid_from`.
    pub fn insert_slice(&mut self, slice: Slice) {
        let pos = self
            .slices
            .binary_search_by_key(&slice.valid_from, |s| s.valid_from)
            .unwrap_or_else(|e| e);
        self.slices.insert(pos, slice);
    }

    /// Remove the slice starting exactly at `valid_from`.
    pub fn remove_slice(&mut self, valid_from: Day) -> Option<Slice> {
        match self.slices.binary_search_by_key(&valid_from, |s| s.valid_from) {
            Ok(pos) => Some(self.slices.remove(pos)),
            Err(_) => None,
        }
    }

    pub fn slice_starting(&self, valid_from: Day) -> Option<&Slice> {
        self.index_of(valid_from).map(|pos| &self.slices[pos])
    }

    pub fn slice_starting_mut(&mut self, valid_from: Day) -> Option<&mut Slice> {
        self.slices
            .binary_search_by_key(&valid_from, |s| s.valid_from)
            .ok()
            .map(|pos| &mut self.slices[pos])
    }

    /// Index of the slice starting exactly at `valid_from`.
    pub fn index_of(&self, valid_from: Day) -> Option<usize> {
        self.slices
            .binary_search_by_key(&valid_from, |s| s.valid_from)
            .ok()
    }

    // ── Reservations ─────────────────────────────────────────

    /// Insert a reservation maintaining sort order by effective date.
    pub fn insert_reservation(&mut self, r: Reservation) {
        let pos = self
            .reservations
            .partition_point(|x| x.effective <= r.effective);
        self.reservations.insert(pos, r);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        if let Some(pos) = self.reservations.iter().position(|r| r.id == id) {
            Some(self.reservations.remove(pos))
        } else {
            None
        }
    }

    /// Earliest reservation dated at or after `day`, regardless of slice.
    pub fn earliest_reservation_from(&self, day: Day) -> Option<&Reservation> {
        let pos = self.reservations.partition_point(|r| r.effective < day);
        self.reservations.get(pos)
    }

    /// Reservations currently referencing the slice starting at `slice_from`.
    pub fn reservations_on(&self, slice_from: Day) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(move |r| r.slice_from == slice_from)
    }

    /// Retarget reservations pointing at `from_key` whose effective date
    /// falls in `[lo, hi)` to point at `to_key`. Returns how many moved.
    pub fn repoint_reservations(
        &mut self,
        from_key: Day,
        to_key: Day,
        lo: Day,
        hi: Option<Day>,
    ) -> usize {
        let mut moved = 0;
        for r in &mut self.reservations {
            if r.slice_from == from_key
                && r.effective >= lo
                && hi.is_none_or(|h| r.effective < h)
            {
                r.slice_from = to_key;
                moved += 1;
            }
        }
        moved
    }
}

// ── WAL events and edit primitives ───────────────────────────────

/// A primitive structural edit on one entity's slice set. A lifecycle
/// operation commits an ordered list of these as a single WAL record, which
/// is the atomicity unit: replay applies all of them or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceEdit {
    Insert { slice: Slice },
    Remove { valid_from: Day },
    SetValidTo { valid_from: Day, valid_to: Option<Day> },
    SetValidFrom { valid_from: Day, new_valid_from: Day },
    SetPayload { valid_from: Day, payload: SlicePayload },
    /// Reference migration: repoint reservations keyed to `from_key` with
    /// effective date in `[lo, hi)` onto `to_key`. Always ordered before
    /// the `Remove` of the slice it drains.
    Repoint { from_key: Day, to_key: Day, lo: Day, hi: Option<Day> },
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EntityCreated {
        id: Ulid,
        kind: EntityKind,
        policy: DependentPolicy,
        display: Option<String>,
        created_at: Ms,
    },
    EntityRetired {
        id: Ulid,
    },
    SliceCommitted {
        entity_id: Ulid,
        edits: Vec<SliceEdit>,
    },
    ReservationBooked {
        id: Ulid,
        entity_id: Ulid,
        slice_from: Day,
        effective: Day,
        label: Option<String>,
    },
    ReservationCancelled {
        id: Ulid,
        entity_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub id: Ulid,
    pub kind: EntityKind,
    pub policy: DependentPolicy,
    pub display: Option<String>,
    pub created_at: Ms,
    pub retired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceInfo {
    pub entity_id: Ulid,
    pub valid_from: Day,
    pub valid_to: Option<Day>,
    pub payload: SlicePayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub entity_id: Ulid,
    pub slice_from: Day,
    pub effective: Day,
    pub label: Option<String>,
}
