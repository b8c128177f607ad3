//! Classifier consumer.
//!
//! Usage: `classifier [mood|team]`. Without an argument the kind comes from
//! `classifier.kind` in the configuration.

use anyhow::{anyhow, Context, Result};
use imagebus_classifier::prelude::*;
use imagebus_classifier::telemetry::{init_metrics, init_tracing, shutdown_signal};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = AppConfig::load().context("Failed to load configuration")?;

    if let Some(arg) = std::env::args().nth(1) {
        config.classifier.kind = arg
            .parse::<ClassifierKind>()
            .map_err(|e| anyhow!(e))
            .context("Usage: classifier [mood|team]")?;
    }
    let kind = config.classifier.kind;

    init_tracing(&config.service).context("Failed to initialize logging")?;

    info!(
        service = %config.service.name,
        kind = %kind,
        queue = kind.queue_name(),
        "Starting imagebus classifier"
    );

    init_metrics(config.service.metrics_port)?;

    let options = TrainOptions {
        dataset_dir: config.classifier.dataset_dir.clone(),
        force_synthetic: config.classifier.force_synthetic,
        verbose: config.classifier.verbose,
    };
    let model = train(kind, &options).context("Failed to train classifier")?;

    let profile = ClassifierProfile::new(kind, model.source())
        .with_processing_delay(config.classifier.processing_delay())
        .with_verbose(config.classifier.verbose);
    let service = Arc::new(ClassificationService::new(Arc::new(model), profile));

    let broker = KafkaBroker::new(&config.kafka, kind).context("Failed to initialize Kafka consumer")?;
    let mut consumer = ImageConsumer::new(broker);

    if let Some(max) = config.classifier.max_redeliveries {
        let producer = ImageProducer::new(config.kafka.clone())
            .context("Failed to initialize dead letter producer")?;
        consumer = consumer
            .with_retry_policy(RetryPolicy::bounded(max))
            .with_dead_letter(Arc::new(producer));
    }

    let handle = consumer.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        handle.shutdown();
    });

    info!("Classifier started, waiting for messages");

    if let Err(e) = consumer.run(service).await {
        error!(error = %e, "Consumer stopped with error");
        return Err(e.into());
    }

    info!("Classifier stopped");

    Ok(())
}
