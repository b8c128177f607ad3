//! Imagebus classifier - KNN image classification over a Kafka queue
//!
//! Two consumer kinds share this library:
//!
//! - `mood` classifies face images on the `face` routing key as HAPPY or SAD
//! - `team` classifies badge images on the `team` routing key into one of
//!   three teams
//!
//! Each consumer trains its model once at startup, from a labeled dataset
//! when one is present and from a seeded synthetic corpus otherwise, then
//! handles messages one at a time with manual acknowledgement.
//!
//! # Example
//!
//! ```rust,no_run
//! use imagebus_classifier::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let kind = ClassifierKind::Mood;
//!
//!     let model = train(kind, &TrainOptions {
//!         dataset_dir: config.classifier.dataset_dir.clone(),
//!         force_synthetic: false,
//!         verbose: false,
//!     })?;
//!     let profile = ClassifierProfile::new(kind, model.source());
//!     let service = ClassificationService::new(Arc::new(model), profile);
//!
//!     let consumer = ImageConsumer::new(KafkaBroker::new(&config.kafka, kind)?);
//!     consumer.run(Arc::new(service)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod dataset;
pub mod features;
pub mod kind;
pub mod knn;
pub mod message;
pub mod producer;
pub mod service;
pub mod synthetic;
pub mod telemetry;
pub mod trainer;

// Re-export main types
pub use config::{AppConfig, ClassifierConfig, ConfigError, GeneratorConfig, KafkaConfig};
pub use consumer::{
    Broker, ConsumerError, DeadLetterSink, DeliveryTag, ImageConsumer, IncomingMessage,
    KafkaBroker, MessageHandler, RetryPolicy, ShutdownHandle,
};
pub use kind::{ClassifierKind, ClassifierProfile, LabelTable};
pub use message::{ClassificationResult, InboundMessage};
pub use producer::{ImageProducer, OutgoingMessage, ProducerError};
pub use service::{ClassificationService, ServiceError};
pub use trainer::{train, ModelSource, TrainError, TrainOptions, TrainedModel};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::consumer::{ImageConsumer, KafkaBroker, MessageHandler, RetryPolicy};
    pub use crate::kind::{ClassifierKind, ClassifierProfile};
    pub use crate::producer::ImageProducer;
    pub use crate::service::ClassificationService;
    pub use crate::trainer::{train, TrainOptions};
}
