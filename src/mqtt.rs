use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, LastWill,
    MqttOptions, NetworkOptions, Outgoing, QoS,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::health::HealthHandle;
use crate::metrics_consts::{BROKER_CONNECTS, BROKER_ERRORS, EVENTS_RECEIVED};
use crate::types::FleetAggregate;

pub const UPDATE_MESSAGE_TYPE: &str = "FleetStatisticsUpdated";

const STATUS_ONLINE: &str = "online";
const STATUS_OFFLINE: &str = "offline";
const RECONNECT_CAP: Duration = Duration::from_secs(60);
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Wraps the broker connection. The `AsyncClient` handle is cheap to clone
/// and safe to share; the publisher side holds a clone while `run` owns the
/// event loop.
pub struct MqttGateway {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttGateway {
    pub fn connect(config: &Config) -> Self {
        // Client ids must be unique per process instance or the broker will
        // drop the older session on every reconnect of the newer one.
        let client_id = format!("fleet-stats-rs-{}", Uuid::now_v7().simple());
        let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            &config.status_topic,
            STATUS_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if let Some((username, password)) = config.broker_credentials() {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(config.broker_connect_timeout().as_secs());
        eventloop.set_network_options(network_options);

        Self { client, eventloop }
    }

    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Drives the broker connection: (re-)subscribes and announces `online`
    /// on every connack, forwards inbound payloads into the pipeline, and
    /// backs off exponentially on transport errors. Anything lost between a
    /// disconnect and the resubscribe is recovered by dedup idempotence
    /// upstream, so no replay is attempted here. Credential refusals are
    /// permanent and surface as an error.
    pub async fn run(
        mut self,
        config: Config,
        raw_tx: mpsc::Sender<Bytes>,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let initial_delay = config.broker_reconnect_delay();
        let mut backoff = initial_delay;

        loop {
            liveness.report_healthy();

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.farewell(&config.status_topic).await;
                    return Ok(());
                }
                polled = self.eventloop.poll() => match polled {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        backoff = initial_delay;
                        metrics::counter!(BROKER_CONNECTS).increment(1);
                        info!("broker session established, subscribing to {}", config.inbound_topic);
                        self.client
                            .subscribe(&config.inbound_topic, QoS::AtLeastOnce)
                            .await
                            .context("inbound subscription request failed")?;
                        if let Err(e) = self
                            .client
                            .publish(&config.status_topic, QoS::AtLeastOnce, true, STATUS_ONLINE)
                            .await
                        {
                            warn!("failed to announce online status: {e}");
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        metrics::counter!(EVENTS_RECEIVED).increment(1);
                        if raw_tx.send(publish.payload).await.is_err() {
                            // Pipeline is gone, nothing left to feed
                            return Ok(());
                        }
                    }
                    Ok(_) => {}
                    Err(ConnectionError::ConnectionRefused(code))
                        if matches!(
                            code,
                            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
                        ) =>
                    {
                        metrics::counter!(BROKER_ERRORS).increment(1);
                        return Err(anyhow::anyhow!("broker refused credentials: {code:?}"));
                    }
                    Err(e) => {
                        metrics::counter!(BROKER_ERRORS).increment(1);
                        warn!("broker connection error, retrying in {backoff:?}: {e}");
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RECONNECT_CAP);
                    }
                }
            }
        }
    }

    // Replace the will with an explicit farewell, then close the session.
    async fn farewell(&mut self, status_topic: &str) {
        let _ = self
            .client
            .publish(status_topic, QoS::AtLeastOnce, true, STATUS_OFFLINE)
            .await;
        let _ = self.client.disconnect().await;

        // Let the event loop flush the outbound queue before we drop it
        let _ = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
}

#[derive(Serialize)]
struct UpdateMessage<'a> {
    mt: &'static str,
    data: &'a FleetAggregate,
}

/// Fire-and-forget publication of a refreshed aggregate. Failures are the
/// caller's to log and drop; the next commit supersedes whatever was lost.
pub async fn publish_update(
    client: &AsyncClient,
    topic: &str,
    aggregate: &FleetAggregate,
) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(&UpdateMessage {
        mt: UPDATE_MESSAGE_TYPE,
        data: aggregate,
    })?;
    client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn update_message_wire_shape() {
        let mut aggregate = FleetAggregate::zero();
        aggregate.total_vehicles = 3;
        let message = UpdateMessage {
            mt: UPDATE_MESSAGE_TYPE,
            data: &aggregate,
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["mt"], "FleetStatisticsUpdated");
        assert_eq!(value["data"]["totalVehicles"], 3);
    }
}
