use std::sync::Arc;

use tracing::error;

use crate::config::Config;
use crate::health::{HealthHandle, HealthRegistry};
use crate::metrics_consts::READ_FALLBACKS;
use crate::store::{AggregateStore, MongoStatsStore, StoreError};
use crate::types::FleetAggregate;

pub struct AppContext {
    pub store: Arc<dyn AggregateStore>,
    pub liveness: HealthRegistry,
    pub worker_liveness: HealthHandle,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, StoreError> {
        let store = MongoStatsStore::new(config).await?;
        // Reachability probe plus the processed-set unique index. Failures
        // here are permanent configuration problems and must stop startup.
        store.ensure_ready().await?;

        let liveness = HealthRegistry::new();
        // One commit can legitimately spend three store timeouts back to
        // back, so the deadline leaves room beyond that
        let worker_liveness = liveness.register("commit", 10 * config.store_timeout());

        Ok(Self {
            store: Arc::new(store),
            liveness,
            worker_liveness,
        })
    }

    /// The read-side query behind the dashboard. Never fails: any store
    /// error degrades to the zero aggregate, logged for the operator.
    pub async fn fleet_statistics(&self) -> FleetAggregate {
        match self.store.read_aggregate().await {
            Ok(aggregate) => aggregate,
            Err(e) => {
                metrics::counter!(READ_FALLBACKS).increment(1);
                error!("failed to read aggregate, serving zero aggregate: {e}");
                FleetAggregate::zero()
            }
        }
    }
}
