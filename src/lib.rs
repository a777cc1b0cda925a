use std::{collections::HashSet, sync::Arc, time::Duration};

use bytes::Bytes;
use rumqttc::AsyncClient;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use app_context::AppContext;
use health::HealthHandle;
use metrics_consts::{
    BATCH_SIZE, COMMITS_ISSUED, COMMIT_FAILED, COMMIT_TIME, DUPLICATES_FILTERED, EMPTY_COMMITS,
    EVENT_DECODE_ERROR, PUBLISH_FAILED, UPDATES_PUBLISHED, VEHICLES_COMMITTED, WINDOWS_EMITTED,
    WINDOWS_HELD,
};
use store::{AggregateStore, StoreError};
use types::{BatchStats, FleetAggregate, VehicleEvent};

pub mod api;
pub mod app_context;
pub mod config;
pub mod fingerprint;
pub mod health;
pub mod metrics_consts;
pub mod mqtt;
pub mod server;
pub mod service;
pub mod store;
pub mod types;

/// Decodes raw broker payloads and collects them into fixed, contiguous time
/// windows, handing each non-empty window to the commit stage. The batch
/// channel has capacity one, so at most one window queues behind the batch
/// being committed; when even that slot is taken, the closed window is held
/// here and merged ahead of the next window's events instead of piling up.
pub async fn window_loop(
    window: Duration,
    mut raw_rx: mpsc::Receiver<Bytes>,
    batch_tx: mpsc::Sender<Vec<VehicleEvent>>,
    liveness: HealthHandle,
) {
    let mut buffer: Vec<VehicleEvent> = Vec::new();
    let mut held: Option<Vec<VehicleEvent>> = None;
    let mut ticker = tokio::time::interval(window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        liveness.report_healthy();

        tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(payload) => match VehicleEvent::from_payload(&payload) {
                    Ok(event) => buffer.push(event),
                    Err(e) => {
                        metrics::counter!(EVENT_DECODE_ERROR).increment(1);
                        warn!("dropping undecodable message: {e}");
                    }
                },
                // Subscriber is gone; flush whatever is buffered and stop
                None => break,
            },
            _ = ticker.tick() => {
                // A held window goes first so commits follow arrival order
                let mut batch = held.take().unwrap_or_default();
                batch.append(&mut buffer);
                if batch.is_empty() {
                    continue;
                }
                match batch_tx.try_send(batch) {
                    Ok(()) => metrics::counter!(WINDOWS_EMITTED).increment(1),
                    Err(TrySendError::Full(batch)) => {
                        metrics::counter!(WINDOWS_HELD).increment(1);
                        held = Some(batch);
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        }
    }

    let mut batch = held.take().unwrap_or_default();
    batch.append(&mut buffer);
    if !batch.is_empty() {
        info!("flushing {} buffered events on shutdown", batch.len());
        let _ = batch_tx.send(batch).await;
    }
}

/// The dedup-and-commit protocol for one batch: drop identifiers already in
/// the processed set (and repeats within the batch itself), fold the fresh
/// remainder into the aggregate, then record the fresh identifiers. The
/// aggregate update deliberately precedes the processed-set insertion: a
/// crash in between re-counts at most this batch on restart, while the
/// reverse order could lose events for good.
///
/// Returns the post-update aggregate, or `None` when nothing fresh remained.
pub async fn commit_batch(
    store: &dyn AggregateStore,
    batch: Vec<VehicleEvent>,
) -> Result<Option<FleetAggregate>, StoreError> {
    if batch.is_empty() {
        return Ok(None);
    }
    let received = batch.len();

    let ids: Vec<String> = batch.iter().map(|event| event.aid.clone()).collect();
    let processed = store.get_processed(&ids).await?;

    let mut seen = HashSet::with_capacity(received);
    let fresh: Vec<VehicleEvent> = batch
        .into_iter()
        .filter(|event| !processed.contains(&event.aid) && seen.insert(event.aid.clone()))
        .collect();
    metrics::counter!(DUPLICATES_FILTERED).increment((received - fresh.len()) as u64);

    if fresh.is_empty() {
        return Ok(None);
    }

    let stats = BatchStats::from_events(&fresh);
    let updated = store.apply_aggregate(&stats).await?;

    let fresh_ids: Vec<String> = fresh.into_iter().map(|event| event.aid).collect();
    store.insert_processed(&fresh_ids).await?;
    metrics::counter!(VEHICLES_COMMITTED).increment(fresh_ids.len() as u64);

    Ok(Some(updated))
}

/// Sole consumer of the batch channel. Strict serialization here is what
/// guarantees at most one commit is in flight per process.
pub async fn commit_loop(
    context: Arc<AppContext>,
    publisher: AsyncClient,
    outbound_topic: String,
    mut batch_rx: mpsc::Receiver<Vec<VehicleEvent>>,
) {
    while let Some(batch) = batch_rx.recv().await {
        context.worker_liveness.report_healthy();
        let size = batch.len();
        metrics::histogram!(BATCH_SIZE).record(size as f64);

        let started = tokio::time::Instant::now();
        match commit_batch(context.store.as_ref(), batch).await {
            Ok(Some(aggregate)) => {
                metrics::counter!(COMMITS_ISSUED).increment(1);
                metrics::histogram!(COMMIT_TIME).record(started.elapsed().as_millis() as f64);
                match mqtt::publish_update(&publisher, &outbound_topic, &aggregate).await {
                    Ok(()) => {
                        metrics::counter!(UPDATES_PUBLISHED).increment(1);
                    }
                    Err(e) => {
                        // Not retried, the next commit supersedes it
                        metrics::counter!(PUBLISH_FAILED).increment(1);
                        warn!("failed to publish aggregate update: {e}");
                    }
                }
            }
            Ok(None) => {
                metrics::counter!(EMPTY_COMMITS).increment(1);
            }
            Err(e) => {
                // Transient store failure: drop the batch, broker re-delivery
                // or upstream replay recovers the events
                metrics::counter!(COMMIT_FAILED).increment(1);
                error!("dropping batch of {size} events after store failure: {e}");
            }
        }
    }
}
