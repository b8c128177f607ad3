//! Random mix of face and team images for the classifier queues.

use anyhow::{Context, Result};
use imagebus_classifier::synthetic::{encode_png, SyntheticGenerator};
use imagebus_classifier::{ClassifierKind, InboundMessage};
use rand::Rng;

/// One rendered message and where it should be routed
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub kind: ClassifierKind,
    pub label: usize,
    pub message: InboundMessage,
}

impl GeneratedImage {
    pub fn routing_key(&self) -> &'static str {
        self.kind.routing_key()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrafficGenerator {
    faces: SyntheticGenerator,
    teams: SyntheticGenerator,
}

impl Default for TrafficGenerator {
    fn default() -> Self {
        Self {
            faces: SyntheticGenerator::new(ClassifierKind::Mood),
            teams: SyntheticGenerator::new(ClassifierKind::Team),
        }
    }
}

impl TrafficGenerator {
    /// Fair coin between the two queues, then a label for the chosen kind
    pub fn next_image<R: Rng>(&self, rng: &mut R) -> Result<GeneratedImage> {
        let generator = if rng.gen_bool(0.5) {
            self.faces
        } else {
            self.teams
        };

        let label = generator.sample_label(rng);
        let png = encode_png(&generator.produce(label)).context("Failed to encode PNG")?;

        Ok(GeneratedImage {
            kind: generator.kind(),
            label,
            message: InboundMessage::new(generator.kind().routing_key(), &png),
        })
    }
}
