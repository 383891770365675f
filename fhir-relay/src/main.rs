//! Relay FHIR bundles from Kafka topics to a FHIR server.
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use fhir_common::filter::TemporalFilter;
use fhir_common::health::HealthRegistry;
use fhir_common::metrics::{serve, setup_metrics_recorder};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use fhir_relay::config::{Config, LogFormat};
use fhir_relay::forwarder::Forwarder;
use fhir_relay::handlers;
use fhir_relay::kafka_consumer::KafkaConsumerFactory;
use fhir_relay::processor::Processor;
use fhir_relay::shutdown::ShutdownCoordinator;
use fhir_relay::worker::PartitionWorker;

/// Log to stdout, at the level from `LOG_LEVEL` unless `RUST_LOG` says otherwise.
fn init_tracing(config: &Config) {
    let level = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let log_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(filter))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config);
    info!(?config, "configuration loaded");

    let filter = config
        .date_filter()
        .map(|filter| TemporalFilter::new(&filter))
        .transpose()
        .context("invalid date filter")?;
    let forwarder = Forwarder::new(
        config.fhir.server_base_url.clone(),
        config.fhir.credentials(),
        config.retry_policy(),
    )
    .context("failed to build FHIR server client")?;
    let processor = Arc::new(Processor::new(forwarder, filter));

    let shutdown = ShutdownCoordinator::new();
    let liveness = HealthRegistry::new("liveness");

    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let app = handlers::app(liveness.clone(), shutdown.clone(), Some(recorder_handle));
    let bind = config.bind();
    let server_stop = CancellationToken::new();
    let server = {
        let bind = bind.clone();
        let stopped = server_stop.clone().cancelled_owned();
        tokio::spawn(async move { serve(app, &bind, stopped).await })
    };
    info!("serving health and metrics on {}", bind);

    let signals = shutdown.clone();
    tokio::spawn(async move { signals.listen_for_signals().await });

    let factory = Arc::new(KafkaConsumerFactory::new(
        &config.app_name,
        config.kafka.clone(),
    ));
    let deadline = time::Duration::try_from(config.liveness_deadline())
        .context("liveness deadline out of range")?;

    for (index, topic) in config.kafka.kafka_input_topics.iter().enumerate() {
        let client_id = (index + 1).to_string();
        let worker = PartitionWorker::new(
            topic,
            &client_id,
            factory.clone(),
            processor.clone(),
            shutdown.clone(),
            config.kafka.kafka_poll_timeout.0,
            liveness.register(format!("worker-{}", topic), deadline),
        );

        shutdown.spawn(async move {
            match worker.run().await {
                Ok(report) => info!(
                    topic = %report.topic,
                    client_id = %report.client_id,
                    processed = report.processed,
                    last_stored_offset = ?report.last_stored_offset,
                    "worker stopped"
                ),
                Err(error) => error!(%error, "worker failed"),
            }
        });
    }

    shutdown.wait().await;

    server_stop.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!(%error, "health and metrics server failed"),
        Err(error) => error!(%error, "health and metrics server panicked"),
    }

    match shutdown.reason() {
        Some(reason) if reason.is_failure() => bail!("relay stopped: {}", reason),
        _ => {
            info!("relay stopped");
            Ok(())
        }
    }
}
