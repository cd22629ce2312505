//! Neighbor resolution: read-only lookups over one entity's slice sequence.
//!
//! All lookups are O(log n) binary searches over the sorted slice vector.
//! The planner asks for the covering slice, the nearest slice on either
//! side of a date, and the boundary-adjacent neighbors of a known slice.

use crate::model::{Day, EntityState, Slice};

impl EntityState {
    /// The slice whose `[valid_from, valid_to)` contains `day`.
    pub fn current(&self, day: Day) -> Option<&Slice> {
        let idx = self.slices.partition_point(|s| s.valid_from <= day);
        if idx == 0 {
            return None;
        }
        let candidate = &self.slices[idx - 1];
        candidate.covers(day).then_some(candidate)
    }

    /// The slice with the greatest `valid_from` strictly less than `day`.
    pub fn previous(&self, day: Day) -> Option<&Slice> {
        let idx = self.slices.partition_point(|s| s.valid_from < day);
        if idx == 0 { None } else { Some(&self.slices[idx - 1]) }
    }

    /// The slice with the least `valid_from` strictly greater than `day`.
    pub fn next(&self, day: Day) -> Option<&Slice> {
        let idx = self.slices.partition_point(|s| s.valid_from <= day);
        self.slices.get(idx)
    }

    /// The slice with the greatest `valid_from`.
    pub fn latest(&self) -> Option<&Slice> {
        self.slices.last()
    }

    /// The slice immediately before `slice` in the tiling, i.e. the one
    /// whose `valid_to` equals `slice.valid_from`.
    pub fn predecessor_of(&self, slice: &Slice) -> Option<&Slice> {
        let idx = self.index_of(slice.valid_from)?;
        if idx == 0 {
            return None;
        }
        let prev = &self.slices[idx - 1];
        debug_assert_eq!(prev.valid_to, Some(slice.valid_from), "tiling invariant");
        Some(prev)
    }

    /// The slice immediately after `slice` in the tiling, i.e. the one
    /// whose `valid_from` equals `slice.valid_to`.
    pub fn successor_of(&self, slice: &Slice) -> Option<&Slice> {
        let idx = self.index_of(slice.valid_from)?;
        let next = self.slices.get(idx + 1)?;
        debug_assert_eq!(slice.valid_to, Some(next.valid_from), "tiling invariant");
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use crate::model::*;
    use ulid::Ulid;

    fn named(name: &str) -> SlicePayload {
        SlicePayload { name: Field::Set(name.into()), ..Default::default() }.normalized()
    }

    /// Three slices: [100,200) A, [200,300) B, [300,∞) C.
    fn tiled() -> EntityState {
        let mut st =
            EntityState::new(Ulid::new(), EntityKind::Customer, DependentPolicy::Allow, None, 0);
        st.insert_slice(Slice::new(100, Some(200), named("A")));
        st.insert_slice(Slice::new(200, Some(300), named("B")));
        st.insert_slice(Slice::new(300, None, named("C")));
        st
    }

    #[test]
    fn current_picks_covering_slice() {
        let st = tiled();
        assert_eq!(st.current(100).unwrap().payload, named("A"));
        assert_eq!(st.current(199).unwrap().payload, named("A"));
        assert_eq!(st.current(200).unwrap().payload, named("B"));
        assert_eq!(st.current(9999).unwrap().payload, named("C"));
        assert!(st.current(99).is_none());
    }

    #[test]
    fn current_respects_closed_end() {
        let mut st = tiled();
        st.slice_starting_mut(300).unwrap().valid_to = Some(400);
        assert!(st.current(400).is_none());
        assert!(st.current(399).is_some());
    }

    #[test]
    fn previous_is_strictly_before() {
        let st = tiled();
        assert!(st.previous(100).is_none());
        assert_eq!(st.previous(101).unwrap().valid_from, 100);
        assert_eq!(st.previous(200).unwrap().valid_from, 100);
        assert_eq!(st.previous(300).unwrap().valid_from, 200);
        assert_eq!(st.previous(9999).unwrap().valid_from, 300);
    }

    #[test]
    fn next_is_strictly_after() {
        let st = tiled();
        assert_eq!(st.next(0).unwrap().valid_from, 100);
        assert_eq!(st.next(100).unwrap().valid_from, 200);
        assert_eq!(st.next(299).unwrap().valid_from, 300);
        assert!(st.next(300).is_none());
    }

    #[test]
    fn latest_and_empty() {
        let st = tiled();
        assert_eq!(st.latest().unwrap().valid_from, 300);
        let empty =
            EntityState::new(Ulid::new(), EntityKind::Customer, DependentPolicy::Allow, None, 0);
        assert!(empty.latest().is_none());
        assert!(empty.current(0).is_none());
        assert!(empty.previous(0).is_none());
        assert!(empty.next(0).is_none());
    }

    #[test]
    fn boundary_neighbors() {
        let st = tiled();
        let b = st.slice_starting(200).unwrap().clone();
        assert_eq!(st.predecessor_of(&b).unwrap().valid_from, 100);
        assert_eq!(st.successor_of(&b).unwrap().valid_from, 300);

        let a = st.slice_starting(100).unwrap().clone();
        assert!(st.predecessor_of(&a).is_none());
        let c = st.slice_starting(300).unwrap().clone();
        assert!(st.successor_of(&c).is_none());
    }
}
