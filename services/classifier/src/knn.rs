//! K-nearest-neighbor classifier over dense feature vectors.
//!
//! KNN is a lazy learner: fitting only validates and stores the training
//! set, and every prediction scans all stored points. Neighbors are ranked
//! by Euclidean distance with a stable sort, so equidistant points keep
//! their insertion order. A tied vote goes to the class whose member ranks
//! first among the k nearest.

use crate::features::FeatureVector;
use thiserror::Error;

/// Number of neighbors used by every classifier in the pipeline
pub const DEFAULT_K: usize = 3;

/// Errors raised when fitting or querying a classifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Model not ready: {samples} training samples for k={k}")]
    NotReady { samples: usize, k: usize },

    #[error("Feature dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Number of feature vectors ({vectors}) and labels ({labels}) must match")]
    LengthMismatch { vectors: usize, labels: usize },
}

/// Immutable snapshot of the training set plus k.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnClassifier {
    k: usize,
    dimensions: usize,
    points: Vec<FeatureVector>,
    labels: Vec<usize>,
}

impl KnnClassifier {
    /// Store the training set.
    ///
    /// Fails with [`ModelError::NotReady`] when there are fewer than `k`
    /// points, since no prediction could ever gather k neighbors.
    pub fn fit(
        points: Vec<FeatureVector>,
        labels: Vec<usize>,
        k: usize,
    ) -> Result<Self, ModelError> {
        if points.len() != labels.len() {
            return Err(ModelError::LengthMismatch {
                vectors: points.len(),
                labels: labels.len(),
            });
        }

        if k == 0 || points.len() < k {
            return Err(ModelError::NotReady {
                samples: points.len(),
                k,
            });
        }

        let dimensions = points[0].len();
        if let Some(bad) = points.iter().find(|p| p.len() != dimensions) {
            return Err(ModelError::DimensionMismatch {
                expected: dimensions,
                actual: bad.len(),
            });
        }

        Ok(Self {
            k,
            dimensions,
            points,
            labels,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of stored training points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Majority label among the k training points closest to `features`.
    pub fn predict(&self, features: &[f64]) -> Result<usize, ModelError> {
        if self.points.len() < self.k || self.k == 0 {
            return Err(ModelError::NotReady {
                samples: self.points.len(),
                k: self.k,
            });
        }

        if features.len() != self.dimensions {
            return Err(ModelError::DimensionMismatch {
                expected: self.dimensions,
                actual: features.len(),
            });
        }

        // Squared distance preserves the ordering and skips the sqrt.
        let mut ranked: Vec<(f64, usize)> = self
            .points
            .iter()
            .enumerate()
            .map(|(index, point)| (squared_distance(point, features), index))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(self.majority_vote(&ranked[..self.k]))
    }

    /// Vote among ranked neighbors; ties resolve to the earliest-ranked class.
    fn majority_vote(&self, neighbors: &[(f64, usize)]) -> usize {
        // (label, votes) in order of first appearance
        let mut tally: Vec<(usize, usize)> = Vec::with_capacity(neighbors.len());
        for &(_, index) in neighbors {
            let label = self.labels[index];
            match tally.iter_mut().find(|(l, _)| *l == label) {
                Some(entry) => entry.1 += 1,
                None => tally.push((label, 1)),
            }
        }

        let mut best = tally[0];
        for &candidate in &tally[1..] {
            if candidate.1 > best.1 {
                best = candidate;
            }
        }
        best.0
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
