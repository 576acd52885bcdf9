use anyhow::{Context, Result};
use etl_pipeline::{EtlConsumer, EtlProducer, S3ObjectStore};
use etl_router::{OutcomeRouter, RouterConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RouterConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.logging.level, &config.logging.format);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        source = %config.route.source,
        destination = %config.route.destination,
        outcome = %config.route.outcome,
        "Starting outcome router"
    );

    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(S3ObjectStore::new(&config.s3).await);

    let router = Arc::new(
        OutcomeRouter::new(store, config.route.clone())
            .with_retry(config.retry.clone())
            .with_timeouts(config.timeouts.clone()),
    );

    let dlq_producer = Arc::new(
        EtlProducer::new(config.kafka.clone()).context("Failed to create dead letter producer")?,
    );

    let consumer = Arc::new(
        EtlConsumer::new(config.kafka.clone())
            .context("Failed to create Kafka consumer")?
            .with_dlq_producer(dlq_producer),
    );
    consumer
        .subscribe(&[config.topic()])
        .context("Failed to subscribe to outcome topic")?;

    let mut runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(router).await })
    };

    info!(topic = %config.topic(), "Router started");

    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut runner => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("Shutting down router");
            consumer.shutdown();
            runner.await
        }
    };

    match result {
        Ok(Ok(())) => info!("Router stopped"),
        Ok(Err(e)) => {
            error!(error = %e, "Consumer stopped with error");
            return Err(e).context("Consumer failed");
        }
        Err(e) => return Err(e).context("Consumer task failed"),
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
