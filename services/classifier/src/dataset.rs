//! Labeled image dataset discovery.
//!
//! Two directory layouts are understood:
//!
//! ```text
//! mood:  <root>/happy/**/*.png       label 1
//!        <root>/angry/**/*.png       label 0
//!
//! team:  <root>/treino/<class>/**    training split
//!        <root>/teste/<class>/**     test split
//! ```
//!
//! A missing layout or one with no usable images is reported as `Ok(None)`,
//! which callers treat as "use the synthetic corpus" rather than a failure.

use crate::features::{decode_image, FeatureVector};
use crate::kind::ClassifierKind;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Seed of the shuffle applied before the mood train/test split
pub const SPLIT_SEED: u64 = 42;

/// Share of shuffled mood samples assigned to the training split
pub const TRAIN_FRACTION: f64 = 0.8;

/// Mood class folders and the label each one implies
pub const MOOD_CLASS_DIRS: [(&str, usize); 2] = [("happy", 1), ("angry", 0)];

/// Team class folders; position is the label index
pub const TEAM_CLASS_DIRS: [&str; 3] = ["corinthians", "flamengo", "palmeiras"];

const TEAM_TRAIN_DIR: &str = "treino";
const TEAM_TEST_DIR: &str = "teste";

const RASTER_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Errors while scanning a dataset directory
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One feature vector with its class label
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledSample {
    pub features: FeatureVector,
    pub label: usize,
}

/// Disjoint train/test partition with per-class counts.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: Vec<LabeledSample>,
    pub test: Vec<LabeledSample>,
    /// Per-class counts over the training split
    pub train_counts: Vec<usize>,
    /// Per-class counts over the test split
    pub test_counts: Vec<usize>,
    /// Feature vector of the first sample, for verbose diagnostics
    pub sample_feature: Option<FeatureVector>,
}

impl Dataset {
    fn from_splits(train: Vec<LabeledSample>, test: Vec<LabeledSample>, classes: usize) -> Self {
        let train_counts = count_labels(&train, classes);
        let test_counts = count_labels(&test, classes);
        Self {
            train,
            test,
            train_counts,
            test_counts,
            sample_feature: None,
        }
    }

    /// Per-class counts over both splits
    pub fn class_counts(&self) -> Vec<usize> {
        self.train_counts
            .iter()
            .zip(&self.test_counts)
            .map(|(a, b)| a + b)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Training split as parallel feature and label columns
    pub fn train_columns(&self) -> (Vec<FeatureVector>, Vec<usize>) {
        self.train
            .iter()
            .map(|s| (s.features.clone(), s.label))
            .unzip()
    }
}

/// Load the dataset for `kind` rooted at `root`.
pub fn load_dataset(root: &Path, kind: ClassifierKind) -> Result<Option<Dataset>, DatasetError> {
    match kind {
        ClassifierKind::Mood => load_mood(root),
        ClassifierKind::Team => load_team(root),
    }
}

fn load_mood(root: &Path) -> Result<Option<Dataset>, DatasetError> {
    if MOOD_CLASS_DIRS
        .iter()
        .any(|(dir, _)| !root.join(dir).is_dir())
    {
        return Ok(None);
    }

    let mut samples = Vec::new();
    for (dir, label) in MOOD_CLASS_DIRS {
        collect_samples(&root.join(dir), label, ClassifierKind::Mood, &mut samples)?;
    }

    if samples.is_empty() {
        return Ok(None);
    }

    let (train, test) = split_samples(samples, SPLIT_SEED, TRAIN_FRACTION);
    let sample_feature = train.first().or(test.first()).map(|s| s.features.clone());

    let mut dataset = Dataset::from_splits(train, test, ClassifierKind::Mood.class_count());
    dataset.sample_feature = sample_feature;
    Ok(Some(dataset))
}

fn load_team(root: &Path) -> Result<Option<Dataset>, DatasetError> {
    let train_root = root.join(TEAM_TRAIN_DIR);
    let test_root = root.join(TEAM_TEST_DIR);
    if !train_root.is_dir() || !test_root.is_dir() {
        return Ok(None);
    }

    let mut train = Vec::new();
    let mut test = Vec::new();
    for (label, class) in TEAM_CLASS_DIRS.iter().enumerate() {
        collect_samples(&train_root.join(class), label, ClassifierKind::Team, &mut train)?;
        collect_samples(&test_root.join(class), label, ClassifierKind::Team, &mut test)?;
    }

    if train.is_empty() {
        return Ok(None);
    }

    let sample_feature = train.first().map(|s| s.features.clone());
    let mut dataset = Dataset::from_splits(train, test, ClassifierKind::Team.class_count());
    dataset.sample_feature = sample_feature;
    Ok(Some(dataset))
}

/// Extract features for every raster file under `dir`, skipping files that
/// cannot be decoded. A missing class folder contributes nothing.
fn collect_samples(
    dir: &Path,
    label: usize,
    kind: ClassifierKind,
    out: &mut Vec<LabeledSample>,
) -> Result<usize, DatasetError> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let before = out.len();
    for path in raster_files(dir)? {
        let img = match fs::read(&path) {
            Ok(bytes) => match decode_image(&bytes) {
                Ok(img) => img,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping undecodable image");
                    continue;
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable file");
                continue;
            }
        };

        match kind.extract_features(&img) {
            Ok(features) => out.push(LabeledSample { features, label }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping image without features");
            }
        }
    }

    Ok(out.len() - before)
}

/// Recursively list raster files under `dir`, sorted so repeated scans of
/// the same tree yield the same order.
///
/// Symlinked directories are not descended into; a symlink to a regular
/// file counts as that file.
fn raster_files(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|source| DatasetError::Io {
            path: current.clone(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| DatasetError::Io {
                path: current.clone(),
                source,
            })?;
            let file_type = entry.file_type().map_err(|source| DatasetError::Io {
                path: entry.path(),
                source,
            })?;
            let path = entry.path();

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_symlink() {
                if path.is_file() && is_raster(&path) {
                    files.push(path);
                } else {
                    debug!(path = %path.display(), "Skipping symlink");
                }
            } else if file_type.is_file() && is_raster(&path) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn is_raster(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            RASTER_EXTENSIONS
                .iter()
                .any(|accepted| ext.eq_ignore_ascii_case(accepted))
        })
        .unwrap_or(false)
}

/// Seeded shuffle followed by a count-based split; `round(n * fraction)`
/// samples go to the training side.
pub fn split_samples(
    mut samples: Vec<LabeledSample>,
    seed: u64,
    fraction: f64,
) -> (Vec<LabeledSample>, Vec<LabeledSample>) {
    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);

    let split = ((samples.len() as f64) * fraction).round() as usize;
    let test = samples.split_off(split.min(samples.len()));
    (samples, test)
}

fn count_labels(samples: &[LabeledSample], classes: usize) -> Vec<usize> {
    let mut counts = vec![0; classes];
    for sample in samples {
        if let Some(slot) = counts.get_mut(sample.label) {
            *slot += 1;
        }
    }
    counts
}
