//! Property-based invariants: overlap freedom, snapshot/fold
//! equivalence, append/load exactness, and idempotency hashing.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

use reserva::domain::resource::{ResourceCommand, ResourceEvent, ResourceState};
use reserva::idempotency::{IdempotencyDecision, IdempotencyRecord, content_hash, decide};
use reserva::{Decider, EventStore, InMemoryBlobStore, RecordedEvent, StreamType};

/// A calendar opens far enough in the future that no candidate interval
/// is ever "in the past".
fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0)
        .single()
        .expect("valid base timestamp")
}

/// Candidate booking: `(start, len)` in 15-minute ticks from `base()`.
fn candidate_intervals() -> impl Strategy<Value = Vec<(u32, u32)>> {
    proptest::collection::vec((0u32..200, 1u32..16), 0..40)
}

/// Feed every candidate through the decider, folding the accepted ones.
/// Returns the final state and the accepted event list.
fn simulate(intervals: &[(u32, u32)]) -> (ResourceState, Vec<ResourceEvent>) {
    let now = base() - Duration::hours(1);
    let created = ResourceEvent::ResourceCreated {
        resource_id: Uuid::now_v7(),
        name: "SalaA".into(),
        details: "Piso 1".into(),
    };
    let mut state = ResourceState::fold(None, &created).expect("creation should produce state");
    let mut accepted = vec![created];

    for (start, len) in intervals {
        let from = base() + Duration::minutes(i64::from(*start) * 15);
        let cmd = ResourceCommand::CreateReservation {
            reservation_id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            from_utc: from,
            to_utc: from + Duration::minutes(i64::from(*len) * 15),
            now_utc: now,
        };
        if let Ok(event) = ResourceState::decide(Some(&state), &cmd) {
            state = ResourceState::fold(Some(state), &event).expect("fold should keep state");
            accepted.push(event);
        }
    }
    (state, accepted)
}

proptest! {
    /// However the candidates arrive, no two active reservations ever
    /// intersect under half-open semantics.
    #[test]
    fn accepted_reservations_never_overlap(intervals in candidate_intervals()) {
        let (state, _) = simulate(&intervals);
        let active: Vec<_> = state.reservations.iter().filter(|r| r.is_active()).collect();
        for (i, a) in active.iter().enumerate() {
            for b in active.iter().skip(i + 1) {
                prop_assert!(
                    !(a.from_utc < b.to_utc && b.from_utc < a.to_utc),
                    "overlap between {:?} and {:?}",
                    a.reservation_id,
                    b.reservation_id
                );
            }
        }
    }

    /// Folding every event equals folding any prefix (a snapshot) and
    /// then the remaining tail.
    #[test]
    fn fold_equals_snapshot_plus_tail(
        intervals in candidate_intervals(),
        split_seed in 0usize..64,
    ) {
        let (_, events) = simulate(&intervals);
        let split = split_seed % (events.len() + 1);

        let full = events
            .iter()
            .fold(None, |state, event| ResourceState::fold(state, event));
        let prefix = events[..split]
            .iter()
            .fold(None, |state, event| ResourceState::fold(state, event));
        let resumed = events[split..]
            .iter()
            .fold(prefix, |state, event| ResourceState::fold(state, event));

        prop_assert_eq!(full, resumed);
    }

    /// After K successful appends, loading from 1 yields exactly K
    /// events with versions 1..=K.
    #[test]
    fn load_returns_exactly_the_appended_versions(k in 1u64..20) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime should build");
        rt.block_on(async {
            let store = EventStore::new(std::sync::Arc::new(InMemoryBlobStore::new()));
            let stream_id = Uuid::now_v7();
            for version in 1..=k {
                let event = RecordedEvent::record(
                    StreamType::Resource,
                    stream_id,
                    version,
                    "ResourceMetadataUpdated",
                    json!({"details": version}),
                    Utc::now(),
                    serde_json::Value::Null,
                );
                store
                    .append_event(&event, version - 1)
                    .await
                    .expect("append should succeed");
            }

            let events = store
                .load_stream(StreamType::Resource, stream_id, 1)
                .await
                .expect("load should succeed");
            let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
            let expected: Vec<u64> = (1..=k).collect();
            assert_eq!(versions, expected);
        });
    }

    /// The canonical hash ignores object key order at every depth.
    #[test]
    fn content_hash_ignores_key_order(
        name in "[a-z]{1,12}",
        details in "[a-z ]{0,24}",
        n in 0i64..1000,
    ) {
        let a = json!({"path": "/resources", "body": {"name": name.clone(), "details": details.clone(), "n": n}});
        let b_text = format!(
            r#"{{"body":{{"n":{n},"details":{details:?},"name":{name:?}}},"path":"/resources"}}"#
        );
        let b: serde_json::Value =
            serde_json::from_str(&b_text).expect("handwritten JSON should parse");
        prop_assert_eq!(content_hash(&a), content_hash(&b));
    }

    /// Same key + same content replays the stored reply; same key +
    /// different content mismatches.
    #[test]
    fn idempotency_decisions_are_exhaustive(
        n in 0i64..1000,
        m in 0i64..1000,
    ) {
        let content = json!({"path": "/x", "body": {"n": n}});
        let stored = IdempotencyRecord {
            idempotency_key: "k".into(),
            content_hash: content_hash(&content),
            status_code: 201,
            response_body: json!({"ok": true}),
            created_at_utc: Utc::now(),
        };

        match decide(Some(stored.clone()), &content) {
            IdempotencyDecision::Replay(record) => prop_assert_eq!(record, stored.clone()),
            other => prop_assert!(false, "expected Replay, got {:?}", other),
        }

        let different = json!({"path": "/x", "body": {"n": n, "m": m}});
        prop_assert_eq!(
            decide(Some(stored), &different),
            IdempotencyDecision::Mismatch
        );
    }
}
