use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    error::{ErrorKind, WriteFailure},
    options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, InsertManyOptions, ReturnDocument},
    Client, Collection, IndexModel,
};
use tracing::error;

use crate::config::Config;
use crate::metrics_consts::{READ_FALLBACKS, STORE_TIMEOUTS};
use crate::types::{BatchStats, FleetAggregate, AGGREGATE_DOC_ID};

pub const STATS_COLLECTION: &str = "fleet_statistics";
pub const PROCESSED_COLLECTION: &str = "processed_vehicles";

const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store error: {0}")]
    Mongo(#[from] mongodb::error::Error),
}

/// The store gateway. The commit protocol only sees this seam, so tests can
/// drive it against an in-memory implementation.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Returns the subset of `ids` already present in the processed set.
    async fn get_processed(&self, ids: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Records `ids` as processed with the current timestamp. Identifiers
    /// already present (including ones racing in concurrently) are ignored.
    async fn insert_processed(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Atomically folds a partial aggregate into the singleton document,
    /// creating it on first use, and returns the post-update aggregate.
    async fn apply_aggregate(&self, stats: &BatchStats) -> Result<FleetAggregate, StoreError>;

    /// Returns the current aggregate, or the zero aggregate when no document
    /// exists yet or the stored document no longer matches the schema.
    async fn read_aggregate(&self) -> Result<FleetAggregate, StoreError>;
}

pub struct MongoStatsStore {
    stats: Collection<FleetAggregate>,
    processed: Collection<Document>,
    op_timeout: Duration,
}

impl MongoStatsStore {
    pub async fn new(config: &Config) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(&config.store_url).await?;
        let db = client.database(&config.store_db_name);

        Ok(Self {
            stats: db.collection(STATS_COLLECTION),
            processed: db.collection(PROCESSED_COLLECTION),
            op_timeout: config.store_timeout(),
        })
    }

    /// Startup probe: ensure the processed-set unique index exists and the
    /// store answers a read. Failures here are permanent and fatal.
    pub async fn ensure_ready(&self) -> Result<(), StoreError> {
        let index = IndexModel::builder()
            .keys(doc! { "aid": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.with_timeout(async { self.processed.create_index(index, None).await.map(|_| ()) })
            .await?;

        self.read_aggregate().await.map(|_| ())
    }

    async fn with_timeout<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, mongodb::error::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => {
                metrics::counter!(STORE_TIMEOUTS).increment(1);
                Err(StoreError::Timeout(self.op_timeout))
            }
        }
    }
}

#[async_trait]
impl AggregateStore for MongoStatsStore {
    async fn get_processed(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let filter = doc! { "aid": { "$in": ids.to_vec() } };
        let options = FindOptions::builder()
            .projection(doc! { "aid": 1, "_id": 0 })
            .build();

        self.with_timeout(async {
            let mut cursor = self.processed.find(filter, options).await?;
            let mut found = HashSet::new();
            while let Some(entry) = cursor.try_next().await? {
                if let Ok(aid) = entry.get_str("aid") {
                    found.insert(aid.to_string());
                }
            }
            Ok(found)
        })
        .await
    }

    async fn insert_processed(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let entries: Vec<Document> = ids
            .iter()
            .map(|aid| doc! { "aid": aid, "processedAt": &now })
            .collect();
        // Unordered so one duplicate doesn't keep the rest from landing
        let options = InsertManyOptions::builder().ordered(false).build();

        let result = self
            .with_timeout(async {
                self.processed
                    .insert_many(entries, options)
                    .await
                    .map(|_| ())
            })
            .await;

        match result {
            Err(StoreError::Mongo(e)) if is_duplicate_key(&e) => Ok(()),
            other => other,
        }
    }

    async fn apply_aggregate(&self, stats: &BatchStats) -> Result<FleetAggregate, StoreError> {
        let update = update_document(stats, Utc::now());
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .with_timeout(async {
                self.stats
                    .find_one_and_update(doc! { "_id": AGGREGATE_DOC_ID }, update, options)
                    .await
            })
            .await?;

        // upsert + ReturnDocument::After always yields a document
        Ok(updated
            .unwrap_or_else(FleetAggregate::zero)
            .recompute_avg())
    }

    async fn read_aggregate(&self) -> Result<FleetAggregate, StoreError> {
        let result = self
            .with_timeout(async { self.stats.find_one(doc! { "_id": AGGREGATE_DOC_ID }, None).await })
            .await;

        match result {
            Ok(Some(aggregate)) => Ok(aggregate.recompute_avg()),
            Ok(None) => Ok(FleetAggregate::zero()),
            Err(StoreError::Mongo(e))
                if matches!(e.kind.as_ref(), ErrorKind::BsonDeserialization(_)) =>
            {
                // A malformed document must not take down the dashboard read
                error!("aggregate document failed to deserialize, serving zero aggregate: {e}");
                metrics::counter!(READ_FALLBACKS).increment(1);
                Ok(FleetAggregate::zero())
            }
            Err(e) => Err(e),
        }
    }
}

/// Builds the atomic update for one partial aggregate: `$inc` for all
/// additive fields (dotted paths reach into the three count maps),
/// `$min`/`$max` for the hp extrema only when the batch carried hp samples,
/// and `$set` for the update timestamp.
fn update_document(stats: &BatchStats, now: DateTime<Utc>) -> Document {
    let mut inc = doc! {
        "totalVehicles": stats.total_vehicles,
        "hpStats.sum": stats.hp_sum,
        "hpStats.count": stats.hp_count,
    };
    for (name, count) in &stats.vehicles_by_type {
        inc.insert(format!("vehiclesByType.{}", field_safe(name)), *count);
    }
    for (label, count) in &stats.vehicles_by_decade {
        inc.insert(format!("vehiclesByDecade.{}", field_safe(label)), *count);
    }
    for (class, count) in &stats.vehicles_by_speed_class {
        inc.insert(format!("vehiclesBySpeedClass.{}", field_safe(class)), *count);
    }

    let mut update = doc! {
        "$inc": inc,
        "$set": { "lastUpdated": now.to_rfc3339() },
    };
    if let Some(min) = stats.hp_min {
        update.insert("$min", doc! { "hpStats.min": min });
    }
    if let Some(max) = stats.hp_max {
        update.insert("$max", doc! { "hpStats.max": max });
    }
    update
}

// Field paths treat '.' and a leading '$' specially, and type names are
// producer-controlled input.
fn field_safe(name: &str) -> String {
    let mut safe = name.replace('.', "_");
    if safe.starts_with('$') {
        safe.replace_range(..1, "_");
    }
    safe
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    match error.kind.as_ref() {
        ErrorKind::BulkWrite(failure) => {
            failure.write_concern_error.is_none()
                && failure
                    .write_errors
                    .as_ref()
                    .is_some_and(|errors| errors.iter().all(|e| e.code == DUPLICATE_KEY_CODE))
        }
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}
