use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app_context::AppContext;
use crate::commit_loop;
use crate::config::Config;
use crate::mqtt::MqttGateway;
use crate::window_loop;

/// The lifecycle coordinator: owns startup order (store, broker, pipeline),
/// the shutdown cascade, and the process-level failure policy.
pub struct FleetStatsService {
    config: Config,
    context: Arc<AppContext>,
    shutdown: CancellationToken,
}

enum Exit {
    Signal,
    Subscriber(Result<Result<()>, JoinError>),
    Window(Result<(), JoinError>),
    Commit(Result<(), JoinError>),
}

impl FleetStatsService {
    pub async fn new(config: Config) -> Result<Self> {
        // The store comes up first; a probe failure here is a permanent
        // configuration problem and aborts the process.
        let context = Arc::new(
            AppContext::new(&config)
                .await
                .context("store is unreachable or misconfigured")?,
        );

        Ok(Self {
            config,
            context,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn context(&self) -> Arc<AppContext> {
        self.context.clone()
    }

    /// Runs the pipeline until a shutdown signal arrives or a pipeline task
    /// dies. Either way the same drain runs: the subscriber stops feeding,
    /// the window loop flushes its buffer as a final batch, and the commit
    /// loop finishes whatever is in flight.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            context,
            shutdown,
        } = self;

        let gateway = MqttGateway::connect(&config);
        let publisher = gateway.client();

        let (raw_tx, raw_rx) = mpsc::channel(config.event_channel_capacity);
        // Capacity one: a single window may queue behind the committing batch
        let (batch_tx, batch_rx) = mpsc::channel(1);

        let subscriber_liveness = context
            .liveness
            .register("subscriber", Duration::from_secs(180));
        let window_liveness = context.liveness.register("window", Duration::from_secs(60));

        let mut subscriber = tokio::spawn(gateway.run(
            config.clone(),
            raw_tx,
            subscriber_liveness,
            shutdown.clone(),
        ));
        let mut window = tokio::spawn(window_loop(
            config.window(),
            raw_rx,
            batch_tx,
            window_liveness,
        ));
        let mut commit = tokio::spawn(commit_loop(
            context.clone(),
            publisher,
            config.outbound_topic.clone(),
            batch_rx,
        ));

        info!(
            "pipeline started: {} -> {} ({}ms windows)",
            config.inbound_topic, config.outbound_topic, config.batch_window_ms
        );

        let exit = tokio::select! {
            _ = shutdown_signal() => Exit::Signal,
            result = &mut subscriber => Exit::Subscriber(result),
            result = &mut window => Exit::Window(result),
            result = &mut commit => Exit::Commit(result),
        };

        // A pipeline task finishing before shutdown was requested is always
        // a failure, even when it finished without an error of its own.
        let (failure, subscriber_done, window_done, commit_done) = match exit {
            Exit::Signal => {
                info!("shutdown signal received, draining pipeline");
                (None, false, false, false)
            }
            Exit::Subscriber(result) => {
                (Some(unexpected_exit("subscriber", result)), true, false, false)
            }
            Exit::Window(result) => (
                Some(unexpected_exit("window loop", result.map(Ok))),
                false,
                true,
                false,
            ),
            Exit::Commit(result) => (
                Some(unexpected_exit("commit loop", result.map(Ok))),
                false,
                false,
                true,
            ),
        };

        // Stopping the subscriber closes the raw channel; the rest of the
        // pipeline drains and exits off the back of that.
        shutdown.cancel();
        let drain = async {
            if !subscriber_done {
                log_drain("subscriber", subscriber.await);
            }
            if !window_done {
                log_drain("window loop", window.await.map(Ok));
            }
            if !commit_done {
                log_drain("commit loop", commit.await.map(Ok));
            }
        };
        if tokio::time::timeout(config.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            warn!(
                "pipeline did not drain within {:?}, abandoning in-flight work",
                config.shutdown_timeout()
            );
        }

        match failure {
            Some(error) => Err(error),
            None => {
                info!("pipeline stopped cleanly");
                Ok(())
            }
        }
    }
}

fn unexpected_exit(name: &str, result: Result<Result<()>, JoinError>) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow!("{name} exited unexpectedly"),
        Ok(Err(e)) => e.context(format!("{name} failed")),
        Err(e) => anyhow!("{name} panicked: {e}"),
    }
}

fn log_drain(name: &str, result: Result<Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{name} reported an error while draining: {e:#}"),
        Err(e) => warn!("{name} panicked while draining: {e}"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
