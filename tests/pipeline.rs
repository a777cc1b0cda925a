use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use fleet_stats_rs::health::HealthRegistry;
use fleet_stats_rs::store::{AggregateStore, StoreError};
use fleet_stats_rs::types::{BatchStats, FleetAggregate, VehicleEvent};
use fleet_stats_rs::{commit_batch, window_loop};

/// In-memory stand-in that mirrors the store's atomic operator semantics:
/// additive folds, min/max that only exist once an hp sample has landed, and
/// duplicate-tolerant processed-set inserts.
#[derive(Default)]
struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    aggregate: Option<FleetAggregate>,
    processed: HashSet<String>,
}

impl MemoryStore {
    fn processed_len(&self) -> usize {
        self.state.lock().unwrap().processed.len()
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn get_processed(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter(|aid| state.processed.contains(*aid))
            .cloned()
            .collect())
    }

    async fn insert_processed(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.processed.extend(ids.iter().cloned());
        Ok(())
    }

    async fn apply_aggregate(&self, stats: &BatchStats) -> Result<FleetAggregate, StoreError> {
        let mut state = self.state.lock().unwrap();
        let aggregate = state.aggregate.get_or_insert_with(FleetAggregate::zero);

        aggregate.total_vehicles += stats.total_vehicles;
        for (name, count) in &stats.vehicles_by_type {
            *aggregate.vehicles_by_type.entry(name.clone()).or_default() += count;
        }
        for (label, count) in &stats.vehicles_by_decade {
            *aggregate.vehicles_by_decade.entry(label.clone()).or_default() += count;
        }
        for (class, count) in &stats.vehicles_by_speed_class {
            *aggregate
                .vehicles_by_speed_class
                .entry(class.clone())
                .or_default() += count;
        }

        let had_hp = aggregate.hp_stats.count > 0;
        aggregate.hp_stats.sum += stats.hp_sum;
        aggregate.hp_stats.count += stats.hp_count;
        if let Some(min) = stats.hp_min {
            aggregate.hp_stats.min = if had_hp {
                aggregate.hp_stats.min.min(min)
            } else {
                min
            };
        }
        if let Some(max) = stats.hp_max {
            aggregate.hp_stats.max = if had_hp {
                aggregate.hp_stats.max.max(max)
            } else {
                max
            };
        }
        aggregate.last_updated = Utc::now();

        Ok(aggregate.clone().recompute_avg())
    }

    async fn read_aggregate(&self) -> Result<FleetAggregate, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .aggregate
            .clone()
            .unwrap_or_else(FleetAggregate::zero)
            .recompute_avg())
    }
}

fn event(aid: &str, data: Value) -> VehicleEvent {
    let payload = serde_json::to_vec(&json!({ "aid": aid, "data": data })).unwrap();
    VehicleEvent::from_payload(&payload).unwrap()
}

fn anonymous_event(data: Value) -> VehicleEvent {
    let payload = serde_json::to_vec(&json!({ "data": data })).unwrap();
    VehicleEvent::from_payload(&payload).unwrap()
}

// Everything except lastUpdated, which legitimately differs between runs
fn assert_same_stats(a: &FleetAggregate, b: &FleetAggregate) {
    assert_eq!(a.total_vehicles, b.total_vehicles);
    assert_eq!(a.vehicles_by_type, b.vehicles_by_type);
    assert_eq!(a.vehicles_by_decade, b.vehicles_by_decade);
    assert_eq!(a.vehicles_by_speed_class, b.vehicles_by_speed_class);
    assert_eq!(a.hp_stats, b.hp_stats);
}

#[tokio::test]
async fn empty_state_ingest() {
    let store = MemoryStore::default();
    let batch = vec![event(
        "a1",
        json!({"type": "SUV", "hp": 200, "year": 2015, "topSpeed": 180}),
    )];

    let updated = commit_batch(&store, batch).await.unwrap().unwrap();

    assert_eq!(updated.total_vehicles, 1);
    assert_eq!(updated.vehicles_by_type["SUV"], 1);
    assert_eq!(updated.vehicles_by_decade["2010s"], 1);
    assert_eq!(updated.vehicles_by_speed_class["Normal"], 1);
    assert_eq!(updated.hp_stats.sum, 200);
    assert_eq!(updated.hp_stats.count, 1);
    assert_eq!(updated.hp_stats.min, 200);
    assert_eq!(updated.hp_stats.max, 200);
    assert_eq!(updated.hp_stats.avg, 200.0);
    assert_eq!(store.processed_len(), 1);
}

#[tokio::test]
async fn duplicate_suppression() {
    let store = MemoryStore::default();
    let data = json!({"type": "SUV", "hp": 200, "year": 2015, "topSpeed": 180});

    let first = commit_batch(&store, vec![event("a1", data.clone())])
        .await
        .unwrap();
    assert!(first.is_some());
    let before = store.read_aggregate().await.unwrap();

    // Redelivery in a later batch must commit nothing and publish nothing
    let second = commit_batch(&store, vec![event("a1", data)]).await.unwrap();
    assert!(second.is_none());

    let after = store.read_aggregate().await.unwrap();
    assert_same_stats(&before, &after);
    assert_eq!(store.processed_len(), 1);
}

#[tokio::test]
async fn mixed_batch() {
    let store = MemoryStore::default();
    let batch = vec![
        event("b1", json!({"type": "Sedan", "hp": 100, "year": 1995, "topSpeed": 120})),
        event("b2", json!({"type": "Sedan", "hp": 300, "year": 2001, "topSpeed": 250})),
        event("b3", json!({"type": "SUV", "hp": 150, "year": 2012, "topSpeed": 200})),
    ];

    let updated = commit_batch(&store, batch).await.unwrap().unwrap();

    assert_eq!(updated.total_vehicles, 3);
    assert_eq!(updated.vehicles_by_type["Sedan"], 2);
    assert_eq!(updated.vehicles_by_type["SUV"], 1);
    assert_eq!(updated.vehicles_by_decade["1990s"], 1);
    assert_eq!(updated.vehicles_by_decade["2000s"], 1);
    assert_eq!(updated.vehicles_by_decade["2010s"], 1);
    assert_eq!(updated.vehicles_by_speed_class["Slow"], 1);
    assert_eq!(updated.vehicles_by_speed_class["Normal"], 1);
    assert_eq!(updated.vehicles_by_speed_class["Fast"], 1);
    assert_eq!(updated.hp_stats.sum, 550);
    assert_eq!(updated.hp_stats.count, 3);
    assert_eq!(updated.hp_stats.min, 100);
    assert_eq!(updated.hp_stats.max, 300);
    assert!((updated.hp_stats.avg - 550.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn synthesized_aid_collides_across_windows() {
    let store = MemoryStore::default();
    let data = json!({"type": "Coupe", "hp": 400, "year": 2020, "topSpeed": 280});

    let first = commit_batch(&store, vec![anonymous_event(data.clone())])
        .await
        .unwrap();
    assert!(first.is_some());

    let second = commit_batch(&store, vec![anonymous_event(data)])
        .await
        .unwrap();
    assert!(second.is_none());

    let aggregate = store.read_aggregate().await.unwrap();
    assert_eq!(aggregate.total_vehicles, 1);
    assert_eq!(store.processed_len(), 1);
}

#[tokio::test]
async fn distinct_anonymous_events_all_count() {
    let store = MemoryStore::default();
    let batch = vec![
        anonymous_event(json!({"type": "Coupe", "hp": 400})),
        anonymous_event(json!({"type": "Coupe", "hp": 401})),
        anonymous_event(json!({"type": "Sedan", "hp": 400})),
    ];

    let updated = commit_batch(&store, batch).await.unwrap().unwrap();
    assert_eq!(updated.total_vehicles, 3);
    assert_eq!(store.processed_len(), 3);
}

#[tokio::test]
async fn missing_fields_only_touch_total_and_type() {
    let store = MemoryStore::default();
    commit_batch(
        &store,
        vec![event("a1", json!({"type": "SUV", "hp": 200, "year": 2015, "topSpeed": 180}))],
    )
    .await
    .unwrap();
    let before = store.read_aggregate().await.unwrap();

    let updated = commit_batch(&store, vec![event("e1", json!({"type": "Van"}))])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.total_vehicles, before.total_vehicles + 1);
    assert_eq!(updated.vehicles_by_type["Van"], 1);
    assert_eq!(updated.vehicles_by_decade, before.vehicles_by_decade);
    assert_eq!(updated.vehicles_by_speed_class, before.vehicles_by_speed_class);
    assert_eq!(updated.hp_stats, before.hp_stats);
}

#[tokio::test]
async fn replaying_a_batch_is_idempotent() {
    let batch: Vec<VehicleEvent> = (0..10)
        .map(|i| {
            event(
                &format!("r{i}"),
                json!({"type": "Sedan", "hp": 100 + i, "year": 1990 + i, "topSpeed": 100 + 20 * i}),
            )
        })
        .collect();

    let once = MemoryStore::default();
    commit_batch(&once, batch.clone()).await.unwrap();
    let expected = once.read_aggregate().await.unwrap();

    let replayed = MemoryStore::default();
    for _ in 0..3 {
        commit_batch(&replayed, batch.clone()).await.unwrap();
    }
    let actual = replayed.read_aggregate().await.unwrap();

    assert_same_stats(&expected, &actual);
    assert_eq!(replayed.processed_len(), 10);
}

#[tokio::test]
async fn partitioning_a_batch_is_equivalent() {
    let batch: Vec<VehicleEvent> = (0..9)
        .map(|i| {
            event(
                &format!("p{i}"),
                json!({"type": "SUV", "hp": 120 + 10 * i, "year": 1985 + 5 * i, "topSpeed": 90 + 25 * i}),
            )
        })
        .collect();

    let whole = MemoryStore::default();
    commit_batch(&whole, batch.clone()).await.unwrap();
    let expected = whole.read_aggregate().await.unwrap();

    let split = MemoryStore::default();
    for chunk in batch.chunks(2) {
        commit_batch(&split, chunk.to_vec()).await.unwrap();
    }
    let actual = split.read_aggregate().await.unwrap();

    assert_same_stats(&expected, &actual);
}

#[tokio::test]
async fn empty_batch_commits_nothing() {
    let store = MemoryStore::default();
    let result = commit_batch(&store, Vec::new()).await.unwrap();

    assert!(result.is_none());
    assert_eq!(store.processed_len(), 0);
}

#[tokio::test]
async fn fully_duplicate_batch_commits_nothing() {
    let store = MemoryStore::default();
    let batch = vec![
        event("d1", json!({"type": "SUV"})),
        event("d2", json!({"type": "Van"})),
    ];
    commit_batch(&store, batch.clone()).await.unwrap();
    let before = store.read_aggregate().await.unwrap();

    let result = commit_batch(&store, batch).await.unwrap();
    assert!(result.is_none());
    assert_same_stats(&before, &store.read_aggregate().await.unwrap());
}

#[tokio::test]
async fn intra_batch_duplicates_count_once() {
    let store = MemoryStore::default();
    let data = json!({"type": "SUV", "hp": 200});
    let batch = vec![event("x1", data.clone()), event("x1", data)];

    let updated = commit_batch(&store, batch).await.unwrap().unwrap();

    assert_eq!(updated.total_vehicles, 1);
    assert_eq!(updated.hp_stats.count, 1);
    assert_eq!(store.processed_len(), 1);
}

#[tokio::test]
async fn processed_set_covers_every_committed_batch() {
    let store = MemoryStore::default();
    let first: Vec<VehicleEvent> = (0..5)
        .map(|i| event(&format!("s{i}"), json!({"type": "SUV"})))
        .collect();
    // Overlaps the first batch on s3/s4
    let second: Vec<VehicleEvent> = (3..8)
        .map(|i| event(&format!("s{i}"), json!({"type": "Van"})))
        .collect();

    commit_batch(&store, first.clone()).await.unwrap();
    commit_batch(&store, second.clone()).await.unwrap();

    let all_ids: Vec<String> = (0..8).map(|i| format!("s{i}")).collect();
    let processed = store.get_processed(&all_ids).await.unwrap();

    assert_eq!(processed.len(), 8);
    assert!(processed.is_subset(&all_ids.iter().cloned().collect()));

    let aggregate = store.read_aggregate().await.unwrap();
    assert_eq!(aggregate.total_vehicles, 8);
    assert_eq!(aggregate.vehicles_by_type["SUV"], 5);
    assert_eq!(aggregate.vehicles_by_type["Van"], 3);
}

#[tokio::test]
async fn hp_extrema_stay_monotonic() {
    let store = MemoryStore::default();

    commit_batch(&store, vec![event("h1", json!({"hp": 200}))])
        .await
        .unwrap();
    commit_batch(
        &store,
        vec![event("h2", json!({"hp": 100})), event("h3", json!({"hp": 300}))],
    )
    .await
    .unwrap();
    // A batch without hp must leave the extrema untouched
    commit_batch(&store, vec![event("h4", json!({"type": "Van"}))])
        .await
        .unwrap();

    let aggregate = store.read_aggregate().await.unwrap();
    assert_eq!(aggregate.hp_stats.min, 100);
    assert_eq!(aggregate.hp_stats.max, 300);
    assert_eq!(aggregate.hp_stats.sum, 600);
    assert_eq!(aggregate.hp_stats.count, 3);
    assert_eq!(aggregate.hp_stats.avg, 200.0);
    assert_eq!(aggregate.total_vehicles, 4);
}

fn payload(aid: &str) -> Bytes {
    serde_json::to_vec(&json!({ "aid": aid, "data": {"type": "SUV"} }))
        .unwrap()
        .into()
}

#[tokio::test]
async fn one_window_yields_one_batch() {
    let (raw_tx, raw_rx) = mpsc::channel(256);
    let (batch_tx, mut batch_rx) = mpsc::channel(1);
    let registry = HealthRegistry::new();
    let handle = tokio::spawn(window_loop(
        Duration::from_secs(1),
        raw_rx,
        batch_tx,
        registry.register("window", Duration::from_secs(5)),
    ));

    // Let the interval's immediate first tick pass before feeding events
    tokio::time::sleep(Duration::from_millis(50)).await;
    for i in 0..100 {
        raw_tx.send(payload(&format!("w{i}"))).await.unwrap();
    }
    drop(raw_tx);

    let batch = batch_rx.recv().await.unwrap();
    assert_eq!(batch.len(), 100);
    assert!(batch_rx.recv().await.is_none());
    handle.await.unwrap();
}

#[tokio::test]
async fn undecodable_messages_are_dropped_not_fatal() {
    let (raw_tx, raw_rx) = mpsc::channel(16);
    let (batch_tx, mut batch_rx) = mpsc::channel(1);
    let registry = HealthRegistry::new();
    let handle = tokio::spawn(window_loop(
        Duration::from_secs(1),
        raw_rx,
        batch_tx,
        registry.register("window", Duration::from_secs(5)),
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    raw_tx.send(Bytes::from_static(b"not json")).await.unwrap();
    raw_tx
        .send(Bytes::from_static(br#"{"aid": "no-data-here"}"#))
        .await
        .unwrap();
    raw_tx.send(payload("ok1")).await.unwrap();
    drop(raw_tx);

    let batch = batch_rx.recv().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].aid, "ok1");
    handle.await.unwrap();
}

#[tokio::test]
async fn held_windows_merge_when_commit_stage_is_busy() {
    let (raw_tx, raw_rx) = mpsc::channel(16);
    // Nothing consumes until the end, so the single slot fills immediately
    let (batch_tx, mut batch_rx) = mpsc::channel(1);
    let registry = HealthRegistry::new();
    let handle = tokio::spawn(window_loop(
        Duration::from_millis(50),
        raw_rx,
        batch_tx,
        registry.register("window", Duration::from_secs(5)),
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    raw_tx.send(payload("e1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    raw_tx.send(payload("e2")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    raw_tx.send(payload("e3")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    drop(raw_tx);

    let first = batch_rx.recv().await.unwrap();
    let second = batch_rx.recv().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].aid, "e1");
    // Windows closed while the slot was full arrive merged, in arrival order
    let ids: Vec<&str> = second.iter().map(|e| e.aid.as_str()).collect();
    assert_eq!(ids, vec!["e2", "e3"]);

    assert!(batch_rx.recv().await.is_none());
    handle.await.unwrap();
}
