//! Per-message classification: the handler plugged into the consume loop.

use crate::consumer::{ConsumerError, IncomingMessage, MessageHandler};
use crate::features::{decode_image, FeatureError};
use crate::kind::ClassifierProfile;
use crate::knn::ModelError;
use crate::message::{ClassificationResult, InboundMessage};
use crate::trainer::TrainedModel;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument};

/// Reasons a single delivery could not be classified
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid message payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid base64 image: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Predicted label {0} has no name")]
    UnknownLabel(usize),
}

impl From<ServiceError> for ConsumerError {
    fn from(e: ServiceError) -> Self {
        ConsumerError::ProcessingError(e.to_string())
    }
}

/// Classifies image messages with a model trained once at startup.
pub struct ClassificationService {
    model: Arc<TrainedModel>,
    profile: ClassifierProfile,
}

impl ClassificationService {
    pub fn new(model: Arc<TrainedModel>, profile: ClassifierProfile) -> Self {
        Self { model, profile }
    }

    pub fn profile(&self) -> &ClassifierProfile {
        &self.profile
    }

    pub fn model(&self) -> &TrainedModel {
        &self.model
    }

    /// Decode and classify one payload. Pure apart from logging.
    pub fn classify(&self, payload: &[u8]) -> Result<ClassificationResult, ServiceError> {
        let message = InboundMessage::from_json(payload)?;
        let bytes = message.image_bytes()?;
        let img = decode_image(&bytes)?;
        let features = self.profile.kind.extract_features(&img)?;
        let label = self.model.predict(&features)?;
        let label_name = self
            .profile
            .labels
            .name(label)
            .ok_or(ServiceError::UnknownLabel(label))?;

        Ok(ClassificationResult {
            message_id: message.id,
            label,
            label_name,
            features: self.profile.verbose.then_some(features),
        })
    }
}

#[async_trait::async_trait]
impl MessageHandler for ClassificationService {
    #[instrument(
        skip(self, message),
        fields(partition = message.metadata.partition, offset = message.metadata.offset)
    )]
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let started = Instant::now();
        let result = self.classify(&message.payload)?;
        metrics::histogram!("imagebus.classify.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        // Simulated processing time; holds the single in-flight delivery.
        tokio::time::sleep(self.profile.processing_delay).await;

        match result.features {
            Some(ref features) => info!(
                message_id = %result.message_id,
                label = result.label_name,
                source = %self.model.source(),
                features = ?features,
                "Message classified"
            ),
            None => info!(
                message_id = %result.message_id,
                label = result.label_name,
                source = %self.model.source(),
                "Message classified"
            ),
        }

        Ok(())
    }

    async fn on_error(&self, message: IncomingMessage, error: ConsumerError) {
        error!(
            kind = %self.profile.kind,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Classification failed, message will be requeued"
        );
    }
}
