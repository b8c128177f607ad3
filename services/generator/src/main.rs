//! Traffic generator: publishes a rendered face or team image on the
//! `images` topic every `generator.interval_ms`.

mod traffic;

use anyhow::{Context, Result};
use imagebus_classifier::telemetry::{init_metrics, init_tracing, shutdown_signal};
use imagebus_classifier::{AppConfig, ImageProducer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use tracing::{debug, error, info};
use traffic::TrafficGenerator;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.service).context("Failed to initialize logging")?;

    info!(
        service = %config.service.name,
        topic = %config.kafka.topics.images,
        interval_ms = config.generator.interval_ms,
        "Starting imagebus generator"
    );

    init_metrics(config.service.metrics_port)?;

    let producer =
        ImageProducer::new(config.kafka.clone()).context("Failed to initialize Kafka producer")?;
    let traffic = TrafficGenerator::default();
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(config.generator.interval());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        let generated = match traffic.next_image(&mut rng) {
            Ok(generated) => generated,
            Err(e) => {
                error!(error = %e, "Failed to render image");
                continue;
            }
        };

        match producer
            .publish_image(&generated.message, generated.routing_key())
            .await
        {
            Ok(delivery) => {
                metrics::counter!("imagebus.messages.published").increment(1);
                debug!(
                    message_id = %generated.message.id,
                    routing_key = generated.routing_key(),
                    label = generated.label,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Image published"
                );
            }
            Err(e) => {
                metrics::counter!("imagebus.messages.publish_failed").increment(1);
                error!(
                    message_id = %generated.message.id,
                    routing_key = generated.routing_key(),
                    error = %e,
                    "Failed to publish image"
                );
            }
        }
    }

    info!("Shutting down generator");
    producer.flush(Duration::from_secs(5))?;

    Ok(())
}
