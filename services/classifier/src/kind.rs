//! Classifier kinds and the per-kind profile resolved once at startup.

use crate::features::{self, FeatureError, FeatureVector, MOOD_DIMENSIONS, TEAM_DIMENSIONS};
use crate::trainer::ModelSource;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which classification task a consumer instance runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    /// Binary happy/sad face classification
    #[default]
    Mood,
    /// 3-way team crest classification
    Team,
}

impl ClassifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassifierKind::Mood => "mood",
            ClassifierKind::Team => "team",
        }
    }

    /// Length of the feature vector this kind produces
    pub fn dimensions(&self) -> usize {
        match self {
            ClassifierKind::Mood => MOOD_DIMENSIONS,
            ClassifierKind::Team => TEAM_DIMENSIONS,
        }
    }

    /// Number of classes in the label domain
    pub fn class_count(&self) -> usize {
        match self {
            ClassifierKind::Mood => 2,
            ClassifierKind::Team => 3,
        }
    }

    /// Routing key this kind's queue is bound to on the `images` exchange
    pub fn routing_key(&self) -> &'static str {
        match self {
            ClassifierKind::Mood => "face",
            ClassifierKind::Team => "team",
        }
    }

    /// Durable queue (consumer group) name
    pub fn queue_name(&self) -> &'static str {
        match self {
            ClassifierKind::Mood => "queue_face",
            ClassifierKind::Team => "queue_team",
        }
    }

    /// Artificial per-message delay, longer than the producer's emission interval
    pub fn default_processing_delay(&self) -> Duration {
        match self {
            ClassifierKind::Mood => Duration::from_millis(1000),
            ClassifierKind::Team => Duration::from_millis(1200),
        }
    }

    /// Size of the synthetic fallback corpus
    pub fn synthetic_corpus_size(&self) -> usize {
        match self {
            ClassifierKind::Mood => 400,
            ClassifierKind::Team => 450,
        }
    }

    /// Seed for the synthetic fallback corpus
    pub fn synthetic_seed(&self) -> u64 {
        match self {
            ClassifierKind::Mood => 12345,
            ClassifierKind::Team => 123,
        }
    }

    /// Run the kind-appropriate feature extractor
    pub fn extract_features(&self, img: &RgbImage) -> Result<FeatureVector, FeatureError> {
        match self {
            ClassifierKind::Mood => features::mood_features(img),
            ClassifierKind::Team => features::team_features(img),
        }
    }

    /// Label names for this kind. Team class semantics differ between the
    /// real dataset and the synthetic corpus.
    pub fn label_table(&self, source: ModelSource) -> LabelTable {
        match (self, source) {
            (ClassifierKind::Mood, _) => LabelTable(&["SAD", "HAPPY"]),
            (ClassifierKind::Team, ModelSource::Dataset) => {
                LabelTable(&["CORINTHIANS", "FLAMENGO", "PALMEIRAS"])
            }
            (ClassifierKind::Team, ModelSource::Synthetic) => LabelTable(&["RED", "BLUE", "GREEN"]),
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassifierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mood" | "face" => Ok(ClassifierKind::Mood),
            "team" => Ok(ClassifierKind::Team),
            other => Err(format!("unknown classifier kind: {other}")),
        }
    }
}

/// Fixed mapping from numeric class index to a human-readable name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelTable(&'static [&'static str]);

impl LabelTable {
    pub fn name(&self, label: usize) -> Option<&'static str> {
        self.0.get(label).copied()
    }

    pub fn names(&self) -> &'static [&'static str] {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything the classification service needs to know about its kind,
/// resolved once after training so no per-message branching is required.
#[derive(Debug, Clone)]
pub struct ClassifierProfile {
    pub kind: ClassifierKind,
    pub labels: LabelTable,
    pub processing_delay: Duration,
    pub verbose: bool,
}

impl ClassifierProfile {
    pub fn new(kind: ClassifierKind, source: ModelSource) -> Self {
        Self {
            kind,
            labels: kind.label_table(source),
            processing_delay: kind.default_processing_delay(),
            verbose: false,
        }
    }

    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_accepts_routing_key_alias() {
        assert_eq!("face".parse::<ClassifierKind>(), Ok(ClassifierKind::Mood));
        assert_eq!("MOOD".parse::<ClassifierKind>(), Ok(ClassifierKind::Mood));
        assert_eq!("team".parse::<ClassifierKind>(), Ok(ClassifierKind::Team));
        assert!("crest".parse::<ClassifierKind>().is_err());
    }

    #[test]
    fn test_label_tables_depend_on_source() {
        let mood = ClassifierKind::Mood.label_table(ModelSource::Dataset);
        assert_eq!(mood.name(0), Some("SAD"));
        assert_eq!(mood.name(1), Some("HAPPY"));
        assert_eq!(mood.name(2), None);

        let team_syn = ClassifierKind::Team.label_table(ModelSource::Synthetic);
        let team_ds = ClassifierKind::Team.label_table(ModelSource::Dataset);
        assert_eq!(team_syn.names(), &["RED", "BLUE", "GREEN"]);
        assert_eq!(team_ds.name(1), Some("FLAMENGO"));
    }

    #[test]
    fn test_processing_delay_exceeds_producer_interval() {
        for kind in [ClassifierKind::Mood, ClassifierKind::Team] {
            assert!(kind.default_processing_delay() > Duration::from_millis(200));
        }
    }

    #[test]
    fn test_profile_builder() {
        let profile = ClassifierProfile::new(ClassifierKind::Team, ModelSource::Synthetic)
            .with_processing_delay(Duration::ZERO)
            .with_verbose(true);
        assert_eq!(profile.labels.len(), 3);
        assert_eq!(profile.processing_delay, Duration::ZERO);
        assert!(profile.verbose);
    }
}
