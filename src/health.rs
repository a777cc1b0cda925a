use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Liveness reporting for the pipeline loops.
///
/// Each loop registers itself and reports healthy on every iteration; a loop
/// that stops reporting for longer than its deadline marks the whole process
/// unhealthy, which is what the k8s liveness probe keys off.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet
    Starting,
    /// Healthy until the deadline passes without another report
    HealthyUntil(DateTime<Utc>),
    /// Missed its reporting deadline
    Stalled,
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a component; the returned handle is what the component uses
    /// to report. Reports must come more often than `deadline`.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let component = component.into();
        if let Ok(mut map) = self.components.write() {
            map.insert(component.clone(), ComponentStatus::Starting);
        }
        HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        }
    }

    /// Overall status: healthy only when every registered component has a
    /// live deadline. Usable directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(map) = self.components.read() else {
            warn!("poisoned health registry lock");
            return HealthStatus::default();
        };

        let now = Utc::now();
        let mut status = HealthStatus {
            healthy: !map.is_empty(),
            components: HashMap::with_capacity(map.len()),
        };

        for (name, component) in map.iter() {
            let reported = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(reported, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), reported);
        }
        status
    }
}

impl HealthHandle {
    pub fn report_healthy(&self) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.deadline).unwrap_or(chrono::Duration::seconds(60));
        if let Ok(mut map) = self.components.write() {
            map.insert(self.component.clone(), ComponentStatus::HealthyUntil(until));
        } else {
            warn!("poisoned health registry lock");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_registry_is_unhealthy() {
        assert!(!HealthRegistry::new().get_status().healthy);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new();
        let handle = registry.register("commit", Duration::from_secs(30));

        // Starting components hold the process unhealthy
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components["commit"], ComponentStatus::Starting);

        handle.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn stalled_component_fails_the_probe() {
        let registry = HealthRegistry::new();
        let handle = registry.register("window", Duration::from_secs(0));

        handle.report_healthy();
        // Zero deadline expires immediately
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components["window"], ComponentStatus::Stalled);
    }

    #[test]
    fn all_components_must_report() {
        let registry = HealthRegistry::new();
        let first = registry.register("one", Duration::from_secs(30));
        let _second = registry.register("two", Duration::from_secs(30));

        first.report_healthy();
        assert!(!registry.get_status().healthy);
    }
}
