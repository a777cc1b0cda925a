use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::synthesize_aid;
use crate::metrics_consts::AID_SYNTHESIZED;

/// Well-known `_id` of the singleton aggregate document.
pub const AGGREGATE_DOC_ID: &str = "real_time_fleet_stats";

// Speed class boundaries, in the same unit as `topSpeed`. Slow is everything
// below the first bound, Normal runs up to and including the second.
pub const SLOW_SPEED_CEILING: u32 = 140;
pub const NORMAL_SPEED_CEILING: u32 = 240;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no data object")]
    MissingData,
}

/// The vehicle attributes carried by a generation event. Every attribute is
/// optional; events with missing attributes still count toward the fleet
/// total, they just skip the buckets they have no value for.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VehicleData {
    #[serde(rename = "type", default)]
    pub vehicle_type: Option<String>,
    #[serde(default)]
    pub power_source: Option<String>,
    #[serde(default)]
    pub hp: Option<u32>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub top_speed: Option<u32>,
}

/// A decoded inbound event. `aid` is always present after decoding: events
/// arriving without one get a deterministic fingerprint of their raw `data`.
#[derive(Clone, Debug)]
pub struct VehicleEvent {
    pub aid: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub data: VehicleData,
}

impl VehicleEvent {
    pub fn from_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        let envelope = unwrap_envelope(serde_json::from_slice(payload)?);
        let Value::Object(mut envelope) = envelope else {
            return Err(DecodeError::NotAnObject);
        };

        let data = match envelope.remove("data") {
            Some(data @ Value::Object(_)) => data,
            _ => return Err(DecodeError::MissingData),
        };

        let aid = match envelope.get("aid").and_then(Value::as_str) {
            Some(aid) if !aid.is_empty() => aid.to_string(),
            _ => {
                metrics::counter!(AID_SYNTHESIZED).increment(1);
                synthesize_aid(&data)
            }
        };

        let timestamp = envelope
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));

        let data: VehicleData = serde_json::from_value(data)?;

        Ok(Self {
            aid,
            timestamp,
            data,
        })
    }
}

// Producers emit either the flat envelope {aid, timestamp, data} or a framed
// one {id, type, data: <envelope>}. Unwrap a single frame level when the
// inner object carries its own data member.
fn unwrap_envelope(value: Value) -> Value {
    if let Value::Object(mut outer) = value {
        let framed = matches!(
            outer.get("data"),
            Some(Value::Object(inner)) if inner.get("data").is_some_and(Value::is_object)
        );
        if framed {
            return outer.remove("data").unwrap();
        }
        return Value::Object(outer);
    }
    value
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeedClass {
    Slow,
    Normal,
    Fast,
}

impl SpeedClass {
    pub fn classify(top_speed: u32) -> Self {
        if top_speed < SLOW_SPEED_CEILING {
            SpeedClass::Slow
        } else if top_speed <= NORMAL_SPEED_CEILING {
            SpeedClass::Normal
        } else {
            SpeedClass::Fast
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedClass::Slow => "Slow",
            SpeedClass::Normal => "Normal",
            SpeedClass::Fast => "Fast",
        }
    }
}

impl fmt::Display for SpeedClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn decade_label(year: i32) -> String {
    format!("{}s", (year / 10) * 10)
}

/// The partial aggregate computed over one batch window. Applied additively
/// to the running document, so every field is a delta; `hp_min`/`hp_max`
/// stay `None` when no event in the batch carried an `hp`, which keeps the
/// store's atomic min/max operators from ever seeing a sentinel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchStats {
    pub total_vehicles: i64,
    pub vehicles_by_type: HashMap<String, i64>,
    pub vehicles_by_decade: HashMap<String, i64>,
    pub vehicles_by_speed_class: HashMap<String, i64>,
    pub hp_sum: i64,
    pub hp_count: i64,
    pub hp_min: Option<i64>,
    pub hp_max: Option<i64>,
}

impl BatchStats {
    pub fn from_events(events: &[VehicleEvent]) -> Self {
        let mut stats = BatchStats::default();
        for event in events {
            stats.fold(&event.data);
        }
        stats
    }

    fn fold(&mut self, data: &VehicleData) {
        self.total_vehicles += 1;

        if let Some(vehicle_type) = &data.vehicle_type {
            *self
                .vehicles_by_type
                .entry(vehicle_type.clone())
                .or_default() += 1;
        }
        if let Some(year) = data.year {
            *self
                .vehicles_by_decade
                .entry(decade_label(year))
                .or_default() += 1;
        }
        if let Some(top_speed) = data.top_speed {
            *self
                .vehicles_by_speed_class
                .entry(SpeedClass::classify(top_speed).to_string())
                .or_default() += 1;
        }
        if let Some(hp) = data.hp {
            let hp = hp as i64;
            self.hp_sum += hp;
            self.hp_count += 1;
            self.hp_min = Some(self.hp_min.map_or(hp, |min| min.min(hp)));
            self.hp_max = Some(self.hp_max.map_or(hp, |max| max.max(hp)));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_vehicles == 0
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HpStats {
    #[serde(default)]
    pub sum: i64,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub min: i64,
    #[serde(default)]
    pub max: i64,
    #[serde(default)]
    pub avg: f64,
}

/// The singleton statistics document. `avg` is derived state: it is
/// recomputed from `sum`/`count` on every read and on every post-update
/// return, never trusted as stored.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetAggregate {
    #[serde(default)]
    pub total_vehicles: i64,
    #[serde(default)]
    pub vehicles_by_type: HashMap<String, i64>,
    #[serde(default)]
    pub vehicles_by_decade: HashMap<String, i64>,
    #[serde(default)]
    pub vehicles_by_speed_class: HashMap<String, i64>,
    #[serde(default)]
    pub hp_stats: HpStats,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl FleetAggregate {
    /// The synthetic aggregate served while no document exists yet.
    pub fn zero() -> Self {
        Self {
            total_vehicles: 0,
            vehicles_by_type: HashMap::new(),
            vehicles_by_decade: HashMap::new(),
            vehicles_by_speed_class: HashMap::new(),
            hp_stats: HpStats::default(),
            last_updated: Utc::now(),
        }
    }

    pub fn recompute_avg(mut self) -> Self {
        self.hp_stats.avg = if self.hp_stats.count > 0 {
            self.hp_stats.sum as f64 / self.hp_stats.count as f64
        } else {
            0.0
        };
        self
    }
}
