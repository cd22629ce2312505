//! End-to-end engine tests: full lifecycle operations through the WAL and
//! back, plus property tests over random operation sequences.

use std::path::PathBuf;
use std::sync::Arc;

use proptest::prelude::*;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

use super::plan::{self, Plan};
use super::{apply_edits, Engine, EngineError};

fn tmp_wal(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slicedb_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{name}-{}.wal", Ulid::new()))
}

fn new_engine(name: &str) -> (Engine, PathBuf) {
    let path = tmp_wal(name);
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    (engine, path)
}

fn named(name: &str) -> SlicePayload {
    SlicePayload { name: Field::Set(name.into()), ..Default::default() }
}

fn priced(name: &str, cents: i64) -> SlicePayload {
    SlicePayload {
        name: Field::Set(name.into()),
        price_cents: Field::Set(cents),
        ..Default::default()
    }
}

/// Structural invariants that must hold after every committed operation.
fn assert_invariants(st: &EntityState) {
    for s in &st.slices {
        if let Some(to) = s.valid_to {
            assert!(s.valid_from < to, "empty or inverted slice {s:?}");
        }
    }
    for w in st.slices.windows(2) {
        assert_eq!(
            w[0].valid_to,
            Some(w[1].valid_from),
            "gap or overlap between {:?} and {:?}",
            w[0],
            w[1]
        );
        assert!(
            !w[0].payload.equivalent(&w[1].payload),
            "redundant adjacent slices {:?} and {:?}",
            w[0],
            w[1]
        );
    }
    for r in &st.reservations {
        assert!(
            st.slice_starting(r.slice_from).is_some(),
            "reservation {} references missing slice {}",
            r.id,
            r.slice_from
        );
    }
}

async fn check_entity(engine: &Engine, id: Ulid) {
    let st = engine.get_entity(&id).unwrap();
    let guard = st.read().await;
    assert_invariants(&guard);
}

async fn service(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .create_entity(id, EntityKind::Service, Some("Cut".into()), None)
        .await
        .unwrap();
    id
}

async fn customer(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .create_entity(id, EntityKind::Customer, Some("Alice".into()), None)
        .await
        .unwrap();
    id
}

// ── Lifecycle scenarios ──────────────────────────────────────────

#[tokio::test]
async fn mid_slice_update_splits_history() {
    let (engine, _) = new_engine("split");
    let id = customer(&engine).await;
    engine.insert_at(id, 100, named("Alice")).await.unwrap();

    let slice = engine.update_at(id, 150, named("Alicia")).await.unwrap().unwrap();
    assert_eq!(slice.valid_from, 150);
    assert!(slice.is_open());

    let history = engine.history(id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].valid_to, Some(150));
    assert_eq!(engine.active_at(id, 149).await.unwrap().unwrap().payload, named("Alice").normalized());
    assert_eq!(engine.active_at(id, 150).await.unwrap().unwrap().payload, named("Alicia").normalized());
    check_entity(&engine, id).await;
}

#[tokio::test]
async fn reverting_update_leaves_no_redundant_adjacency() {
    let (engine, _) = new_engine("revert");
    let id = customer(&engine).await;
    engine.insert_at(id, 100, named("Alice")).await.unwrap();
    engine.update_at(id, 200, named("Alicia")).await.unwrap();

    // Changing the head back to the predecessor's content folds the two
    // slices into one.
    let slice = engine.update_at(id, 200, named("Alice")).await.unwrap().unwrap();
    assert_eq!(slice.valid_from, 100);
    assert!(slice.is_open());
    assert_eq!(engine.history(id).await.unwrap().len(), 1);
    check_entity(&engine, id).await;
}

#[tokio::test]
async fn update_is_idempotent() {
    let (engine, _) = new_engine("idem");
    let id = customer(&engine).await;
    engine.insert_at(id, 100, priced("Cut", 4500)).await.unwrap();
    engine.update_at(id, 150, priced("Cut", 5000)).await.unwrap();
    let before = engine.history(id).await.unwrap();

    // Same patch again: no new slice, no payload change.
    assert!(engine.update_at(id, 150, priced("Cut", 5000)).await.unwrap().is_none());
    assert_eq!(engine.history(id).await.unwrap(), before);
}

#[tokio::test]
async fn delete_repoints_reservations_to_survivor() {
    let (engine, _) = new_engine("delete-repoint");
    let id = service(&engine).await;
    engine.insert_at(id, 100, priced("Cut", 4500)).await.unwrap();
    engine.update_at(id, 200, priced("Cut", 5000)).await.unwrap();

    let res = Ulid::new();
    engine.book_reservation(res, id, 250, None).await.unwrap();
    assert_eq!(engine.reservation(res).await.unwrap().slice_from, 200);

    // Deleting the second slice hands its reservations to the predecessor,
    // which absorbs the range.
    let survivor = engine.delete_at(id, 250).await.unwrap().unwrap();
    assert_eq!(survivor.valid_from, 100);
    assert!(survivor.is_open());
    assert_eq!(engine.reservation(res).await.unwrap().slice_from, 100);
    check_entity(&engine, id).await;
}

#[tokio::test]
async fn delete_first_slice_with_reservations_is_refused() {
    let (engine, _) = new_engine("delete-refused");
    let id = service(&engine).await;
    engine.insert_at(id, 100, named("Cut")).await.unwrap();
    engine.book_reservation(Ulid::new(), id, 150, None).await.unwrap();

    let err = engine.delete_at(id, 120).await.unwrap_err();
    assert!(matches!(err, EngineError::ConflictingReservations { earliest: 150, count: 1, .. }));
    // Nothing changed.
    assert_eq!(engine.history(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn discontinue_blocked_by_future_reservation_on_service() {
    let (engine, _) = new_engine("disc-block");
    let id = service(&engine).await;
    engine.insert_at(id, 100, named("Cut")).await.unwrap();
    engine.book_reservation(Ulid::new(), id, 300, Some("walk-in".into())).await.unwrap();

    let err = engine.discontinue(id, 250).await.unwrap_err();
    assert!(matches!(err, EngineError::ConflictingReservations { earliest: 300, .. }));

    // Before the cutoff the reservation does not conflict.
    let closed = engine.discontinue(id, 350).await.unwrap();
    assert_eq!(closed.valid_to, Some(350));
}

#[tokio::test]
async fn discontinue_on_customer_ignores_future_reservations() {
    let (engine, _) = new_engine("disc-allow");
    let id = customer(&engine).await;
    engine.insert_at(id, 100, named("Alice")).await.unwrap();
    engine.book_reservation(Ulid::new(), id, 300, None).await.unwrap();

    let closed = engine.discontinue(id, 250).await.unwrap();
    assert_eq!(closed.valid_to, Some(250));
    check_entity(&engine, id).await;
}

#[tokio::test]
async fn insert_after_discontinue_re_tiles() {
    let (engine, _) = new_engine("re-tile");
    let id = service(&engine).await;
    engine.insert_at(id, 100, priced("Cut", 4500)).await.unwrap();
    engine.discontinue(id, 200).await.unwrap();

    let slice = engine.insert_at(id, 300, priced("Cut", 6000)).await.unwrap().unwrap();
    assert_eq!(slice.valid_from, 300);
    assert!(slice.is_open());

    // The discontinued slice was stretched to meet the new one.
    let history = engine.history(id).await.unwrap();
    assert_eq!(history[0].valid_to, Some(300));
    check_entity(&engine, id).await;

    // Equivalent content after a discontinue is already represented.
    engine.delete_at(id, 300).await.unwrap();
    engine.discontinue(id, 200).await.unwrap();
    assert!(engine.insert_at(id, 300, priced("Cut", 4500)).await.unwrap().is_none());
}

#[tokio::test]
async fn reopen_restores_open_coverage() {
    let (engine, _) = new_engine("reopen");
    let id = service(&engine).await;
    engine.insert_at(id, 100, named("Cut")).await.unwrap();
    engine.discontinue(id, 200).await.unwrap();
    assert!(engine.active_at(id, 250).await.unwrap().is_none());

    let slice = engine.reopen(id).await.unwrap();
    assert!(slice.is_open());
    assert!(engine.active_at(id, 250).await.unwrap().is_some());

    // Reopening an already-open slice changes nothing.
    let again = engine.reopen(id).await.unwrap();
    assert_eq!(again, slice);
}

#[tokio::test]
async fn insert_before_first_extends_equivalent_history() {
    let (engine, _) = new_engine("prepend");
    let id = customer(&engine).await;
    engine.insert_at(id, 100, named("Alice")).await.unwrap();

    let slice = engine.insert_at(id, 50, named("Alice")).await.unwrap().unwrap();
    assert_eq!(slice.valid_from, 50);
    assert_eq!(engine.history(id).await.unwrap().len(), 1);
    check_entity(&engine, id).await;
}

#[tokio::test]
async fn insert_on_covered_day_is_refused() {
    let (engine, _) = new_engine("covered");
    let id = customer(&engine).await;
    engine.insert_at(id, 100, named("Alice")).await.unwrap();

    let err = engine.insert_at(id, 150, named("Bob")).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateSliceStart { started: 100, .. }));
}

// ── Entity lifecycle and reservations ────────────────────────────

#[tokio::test]
async fn retired_entity_rejects_mutations_but_stays_readable() {
    let (engine, _) = new_engine("retired");
    let id = customer(&engine).await;
    engine.insert_at(id, 100, named("Alice")).await.unwrap();
    engine.retire_entity(id).await.unwrap();

    let err = engine.update_at(id, 150, named("Alicia")).await.unwrap_err();
    assert_eq!(err, EngineError::EntityRetired(id));
    assert!(matches!(
        engine.book_reservation(Ulid::new(), id, 150, None).await,
        Err(EngineError::EntityRetired(_))
    ));

    // Reads still work.
    assert_eq!(engine.history(id).await.unwrap().len(), 1);
    assert!(engine.entity(id).await.unwrap().retired);

    // Retiring twice is an error.
    assert_eq!(engine.retire_entity(id).await.unwrap_err(), EngineError::EntityRetired(id));
}

#[tokio::test]
async fn reservation_requires_covering_slice() {
    let (engine, _) = new_engine("res-cover");
    let id = service(&engine).await;
    engine.insert_at(id, 100, named("Cut")).await.unwrap();

    let err = engine.book_reservation(Ulid::new(), id, 50, None).await.unwrap_err();
    assert!(matches!(err, EngineError::SliceNotFound { day: 50, .. }));
}

#[tokio::test]
async fn cancel_reservation_round_trip() {
    let (engine, _) = new_engine("res-cancel");
    let id = service(&engine).await;
    engine.insert_at(id, 100, named("Cut")).await.unwrap();

    let res = Ulid::new();
    engine.book_reservation(res, id, 150, Some("walk-in".into())).await.unwrap();
    assert_eq!(engine.reservations(id).await.unwrap().len(), 1);

    assert_eq!(engine.cancel_reservation(res).await.unwrap(), id);
    assert!(engine.reservations(id).await.unwrap().is_empty());
    assert_eq!(
        engine.cancel_reservation(res).await.unwrap_err(),
        EngineError::ReservationNotFound(res)
    );
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let (engine, _) = new_engine("dup");
    let id = customer(&engine).await;
    let err = engine
        .create_entity(id, EntityKind::Service, None, None)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyExists(id));

    engine.insert_at(id, 100, named("Alice")).await.unwrap();
    let res = Ulid::new();
    engine.book_reservation(res, id, 150, None).await.unwrap();
    assert_eq!(
        engine.book_reservation(res, id, 160, None).await.unwrap_err(),
        EngineError::AlreadyExists(res)
    );
}

// ── Durability ───────────────────────────────────────────────────

#[tokio::test]
async fn restart_replays_full_state() {
    let (engine, path) = new_engine("restart");
    let cust = customer(&engine).await;
    let svc = service(&engine).await;
    engine.insert_at(cust, 100, named("Alice")).await.unwrap();
    engine.update_at(cust, 200, named("Alicia")).await.unwrap();
    engine.insert_at(svc, 100, priced("Cut", 4500)).await.unwrap();
    let res = Ulid::new();
    engine.book_reservation(res, svc, 150, Some("walk-in".into())).await.unwrap();
    engine.retire_entity(cust).await.unwrap();

    let history = engine.history(cust).await.unwrap();
    drop(engine);

    let reborn = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(reborn.history(cust).await.unwrap(), history);
    assert!(reborn.entity(cust).await.unwrap().retired);
    assert_eq!(reborn.reservation(res).await.unwrap().slice_from, 100);
    check_entity(&reborn, cust).await;
    check_entity(&reborn, svc).await;
}

#[tokio::test]
async fn compaction_preserves_state_and_shrinks_wal() {
    let (engine, path) = new_engine("compact");
    let id = service(&engine).await;
    engine.insert_at(id, 100, priced("Cut", 4500)).await.unwrap();
    for day in [150, 200, 250] {
        engine.update_at(id, day, priced("Cut", day as i64 * 10)).await.unwrap();
    }
    engine.book_reservation(Ulid::new(), id, 260, None).await.unwrap();
    let history = engine.history(id).await.unwrap();

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    // Post-compaction appends land in the new file.
    engine.update_at(id, 300, priced("Cut", 9000)).await.unwrap();
    let history_after = engine.history(id).await.unwrap();
    drop(engine);

    let reborn = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(reborn.history(id).await.unwrap(), history_after);
    assert_ne!(history, history_after);
    check_entity(&reborn, id).await;
}

// ── Notifications ────────────────────────────────────────────────

#[tokio::test]
async fn committed_operations_notify_subscribers() {
    let (engine, _) = new_engine("notify");
    let id = customer(&engine).await;
    let mut rx = engine.notify.subscribe(id);

    engine.insert_at(id, 100, named("Alice")).await.unwrap();
    match rx.recv().await.unwrap() {
        Event::SliceCommitted { entity_id, edits } => {
            assert_eq!(entity_id, id);
            assert!(!edits.is_empty());
        }
        other => panic!("unexpected event {other:?}"),
    }

    // A noop commits nothing and notifies nobody.
    engine.update_at(id, 100, named("Alice")).await.unwrap();
    assert!(rx.try_recv().is_err());
}

// ── Concurrency ──────────────────────────────────────────────────

#[tokio::test]
async fn racing_updates_on_one_entity_serialize() {
    let (engine, _) = new_engine("race");
    let engine = Arc::new(engine);
    let id = customer(&engine).await;
    engine.insert_at(id, 0, named("base")).await.unwrap();

    let mut handles = Vec::new();
    for i in 1..=20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.update_at(id, i * 10, named(&format!("v{i}"))).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    check_entity(&engine, id).await;
    assert_eq!(engine.history(id).await.unwrap().len(), 21);
}

#[tokio::test]
async fn distinct_entities_do_not_contend() {
    let (engine, _) = new_engine("parallel");
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let id = Ulid::new();
            engine.create_entity(id, EntityKind::Service, None, None).await.unwrap();
            engine.insert_at(id, 100, named("Cut")).await.unwrap();
            engine.update_at(id, 200, named("Trim")).await.unwrap();
            id
        }));
    }
    for h in handles {
        let id = h.await.unwrap();
        assert_eq!(engine.history(id).await.unwrap().len(), 2);
        check_entity(&engine, id).await;
    }
}

// ── Property tests over the pure planner ─────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Insert(Day, u8),
    Update(Day, u8),
    Delete(Day),
    Discontinue(Day),
    Reopen,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..500i32, any::<u8>()).prop_map(|(d, n)| Op::Insert(d, n % 4)),
        (0..500i32, any::<u8>()).prop_map(|(d, n)| Op::Update(d, n % 4)),
        (0..500i32).prop_map(Op::Delete),
        (0..500i32).prop_map(Op::Discontinue),
        Just(Op::Reopen),
    ]
}

fn apply_op(st: &mut EntityState, op: &Op) {
    let payload = |n: u8| named(&format!("p{n}"));
    let plan = match op {
        Op::Insert(d, n) => plan::plan_insert(st, *d, &payload(*n)),
        Op::Update(d, n) => plan::plan_update(st, *d, &payload(*n)),
        Op::Delete(d) => plan::plan_delete(st, *d),
        Op::Discontinue(d) => plan::plan_discontinue(st, *d),
        Op::Reopen => plan::plan_reopen(st),
    };
    // Rejected operations must leave state untouched; accepted ones commit.
    if let Ok(plan) = plan
        && plan != Plan::Noop
    {
        let edits = plan::lower(st, &plan);
        apply_edits(st, &edits);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Any sequence of accepted operations keeps the slice invariants.
    #[test]
    fn random_operation_sequences_preserve_invariants(
        ops in proptest::collection::vec(op_strategy(), 1..60)
    ) {
        let mut st = EntityState::new(
            Ulid::new(),
            EntityKind::Service,
            DependentPolicy::Block,
            None,
            0,
        );
        for op in &ops {
            apply_op(&mut st, op);
            assert_invariants(&st);
        }
    }

    /// Once an update has been committed, planning the same patch again
    /// resolves to a noop.
    #[test]
    fn committed_updates_are_idempotent(
        ops in proptest::collection::vec(op_strategy(), 0..40),
        day in 0..500i32,
        n in any::<u8>(),
    ) {
        let mut st = EntityState::new(
            Ulid::new(),
            EntityKind::Service,
            DependentPolicy::Block,
            None,
            0,
        );
        for op in &ops {
            apply_op(&mut st, op);
        }
        let patch = named(&format!("p{}", n % 4));
        if let Ok(plan) = plan::plan_update(&st, day, &patch) {
            if plan != Plan::Noop {
                let edits = plan::lower(&st, &plan);
                apply_edits(&mut st, &edits);
            }
            prop_assert_eq!(plan::plan_update(&st, day, &patch).unwrap(), Plan::Noop);
        }
    }
}
