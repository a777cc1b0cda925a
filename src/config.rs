use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "STORE_URL", default = "mongodb://localhost:27017")]
    pub store_url: String,

    #[envconfig(from = "STORE_DB_NAME", default = "fleet")]
    pub store_db_name: String,

    #[envconfig(from = "BROKER_HOST", default = "localhost")]
    pub broker_host: String,

    #[envconfig(from = "BROKER_PORT", default = "1883")]
    pub broker_port: u16,

    #[envconfig(from = "BROKER_USERNAME")]
    pub broker_username: Option<String>,

    #[envconfig(from = "BROKER_PASSWORD")]
    pub broker_password: Option<String>,

    #[envconfig(from = "INBOUND_TOPIC", default = "fleet/vehicles/generated")]
    pub inbound_topic: String,

    #[envconfig(from = "OUTBOUND_TOPIC", default = "emi-gateway-materialized-view-updates")]
    pub outbound_topic: String,

    #[envconfig(from = "STATUS_TOPIC", default = "fleet/reporter/status")]
    pub status_topic: String,

    #[envconfig(from = "BATCH_WINDOW_MS", default = "1000")]
    pub batch_window_ms: u64,

    // Process-wide ceiling on any single store operation. Batches whose
    // commit exceeds it are dropped and recovered through re-delivery.
    #[envconfig(from = "STORE_TIMEOUT_SECS", default = "30")]
    pub store_timeout_secs: u64,

    #[envconfig(from = "BROKER_CONNECT_TIMEOUT_SECS", default = "30")]
    pub broker_connect_timeout_secs: u64,

    // Initial reconnect backoff; doubles per failed attempt up to a cap
    #[envconfig(from = "BROKER_RECONNECT_SECS", default = "5")]
    pub broker_reconnect_secs: u64,

    // Depth of the raw-payload channel between the subscriber and the
    // batcher. When full, the subscriber blocks and the broker buffers.
    #[envconfig(from = "EVENT_CHANNEL_CAPACITY", default = "2048")]
    pub event_channel_capacity: usize,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: u64,

    // tracing filter; RUST_LOG takes precedence when set
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms.max(1))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn broker_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_connect_timeout_secs)
    }

    pub fn broker_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.broker_reconnect_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn broker_credentials(&self) -> Option<(String, String)> {
        match (&self.broker_username, &self.broker_password) {
            (Some(user), Some(pass)) if !user.is_empty() => {
                Some((user.clone(), pass.clone()))
            }
            _ => None,
        }
    }
}
