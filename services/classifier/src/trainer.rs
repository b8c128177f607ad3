//! Model training with real-dataset evaluation and synthetic fallback.
//!
//! Training never fails because a dataset is missing or broken: both cases
//! are logged and resolved by fitting on the seeded synthetic corpus. The
//! only error that escapes is a classifier that could not be fitted at all,
//! which indicates a bug rather than a runtime condition.

use crate::dataset::{load_dataset, Dataset, LabeledSample};
use crate::features::FeatureVector;
use crate::kind::{ClassifierKind, LabelTable};
use crate::knn::{KnnClassifier, ModelError, DEFAULT_K};
use crate::synthetic::SyntheticGenerator;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that abort training
#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Failed to fit {kind} classifier on the synthetic corpus: {source}")]
    Synthetic {
        kind: ClassifierKind,
        #[source]
        source: ModelError,
    },
}

/// Where the training samples of a model came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Dataset,
    Synthetic,
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Dataset => f.write_str("DATASET"),
            ModelSource::Synthetic => f.write_str("SYN"),
        }
    }
}

/// Inputs to [`train`]
#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// Root of the labeled dataset tree
    pub dataset_dir: PathBuf,
    /// Skip dataset discovery and go straight to the synthetic corpus
    pub force_synthetic: bool,
    /// Log an example feature vector alongside the diagnostics
    pub verbose: bool,
}

/// Predicted-vs-true counts, indexed `[predicted][true]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    cells: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(classes: usize) -> Self {
        Self {
            cells: vec![vec![0; classes]; classes],
        }
    }

    pub fn classes(&self) -> usize {
        self.cells.len()
    }

    /// Count one prediction. Labels outside the matrix are ignored and
    /// reported as `false`.
    pub fn record(&mut self, predicted: usize, truth: usize) -> bool {
        match self.cells.get_mut(predicted).and_then(|row| row.get_mut(truth)) {
            Some(cell) => {
                *cell += 1;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, predicted: usize, truth: usize) -> usize {
        self.cells
            .get(predicted)
            .and_then(|row| row.get(truth))
            .copied()
            .unwrap_or(0)
    }

    pub fn row(&self, predicted: usize) -> &[usize] {
        self.cells.get(predicted).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.cells.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.classes()).map(|i| self.cells[i][i]).sum()
    }

    /// `correct / total`, or exactly 0.0 when nothing was evaluated
    pub fn accuracy(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.correct() as f64 / total as f64,
        }
    }
}

/// Held-out evaluation of a dataset-sourced model
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub accuracy: f64,
    pub confusion: ConfusionMatrix,
    pub train_size: usize,
    pub test_size: usize,
    pub train_counts: Vec<usize>,
    pub test_counts: Vec<usize>,
}

/// A fitted classifier together with its provenance.
///
/// Built once at startup and shared read-only behind an `Arc`.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    kind: ClassifierKind,
    source: ModelSource,
    classifier: KnnClassifier,
    evaluation: Option<Evaluation>,
}

impl TrainedModel {
    pub fn kind(&self) -> ClassifierKind {
        self.kind
    }

    pub fn source(&self) -> ModelSource {
        self.source
    }

    pub fn classifier(&self) -> &KnnClassifier {
        &self.classifier
    }

    pub fn evaluation(&self) -> Option<&Evaluation> {
        self.evaluation.as_ref()
    }

    /// Label names appropriate to this model's kind and source
    pub fn labels(&self) -> LabelTable {
        self.kind.label_table(self.source)
    }

    pub fn predict(&self, features: &[f64]) -> Result<usize, ModelError> {
        self.classifier.predict(features)
    }
}

/// Train a classifier for `kind`, preferring the real dataset.
pub fn train(kind: ClassifierKind, options: &TrainOptions) -> Result<TrainedModel, TrainError> {
    if options.force_synthetic {
        info!(kind = %kind, "Forced synthetic training, dataset discovery skipped");
        return train_synthetic(kind);
    }

    match load_dataset(&options.dataset_dir, kind) {
        Ok(Some(dataset)) => match train_on_dataset(kind, &dataset) {
            Ok(model) => {
                report_dataset_model(&model, &dataset, options);
                return Ok(model);
            }
            Err(e) => warn!(
                kind = %kind,
                dataset_dir = %options.dataset_dir.display(),
                error = %e,
                "Dataset unusable for training, falling back to synthetic corpus"
            ),
        },
        Ok(None) => info!(
            kind = %kind,
            dataset_dir = %options.dataset_dir.display(),
            "Dataset not found or empty, falling back to synthetic corpus"
        ),
        Err(e) => warn!(
            kind = %kind,
            dataset_dir = %options.dataset_dir.display(),
            error = %e,
            "Failed to load dataset, falling back to synthetic corpus"
        ),
    }

    train_synthetic(kind)
}

/// Fit on the training split and evaluate on the test split.
pub fn train_on_dataset(kind: ClassifierKind, dataset: &Dataset) -> Result<TrainedModel, ModelError> {
    let (points, labels) = dataset.train_columns();
    let classifier = KnnClassifier::fit(points, labels, DEFAULT_K)?;
    let confusion = evaluate(&classifier, &dataset.test, kind.class_count())?;

    Ok(TrainedModel {
        kind,
        source: ModelSource::Dataset,
        evaluation: Some(Evaluation {
            accuracy: confusion.accuracy(),
            confusion,
            train_size: dataset.train.len(),
            test_size: dataset.test.len(),
            train_counts: dataset.train_counts.clone(),
            test_counts: dataset.test_counts.clone(),
        }),
        classifier,
    })
}

/// Fit on the fixed-size, fixed-seed synthetic corpus. No evaluation.
pub fn train_synthetic(kind: ClassifierKind) -> Result<TrainedModel, TrainError> {
    let size = kind.synthetic_corpus_size();
    let (points, labels): (Vec<FeatureVector>, Vec<usize>) =
        synthetic_corpus(kind, size, kind.synthetic_seed())
            .into_iter()
            .map(|s| (s.features, s.label))
            .unzip();

    let classifier = KnnClassifier::fit(points, labels, DEFAULT_K)
        .map_err(|source| TrainError::Synthetic { kind, source })?;

    info!(kind = %kind, samples = size, "Model trained on synthetic corpus");

    Ok(TrainedModel {
        kind,
        source: ModelSource::Synthetic,
        classifier,
        evaluation: None,
    })
}

/// Render `size` labeled samples with labels drawn from a seeded RNG.
pub fn synthetic_corpus(kind: ClassifierKind, size: usize, seed: u64) -> Vec<LabeledSample> {
    let generator = SyntheticGenerator::new(kind);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut samples = Vec::with_capacity(size);
    for _ in 0..size {
        let label = generator.sample_label(&mut rng);
        let img = generator.produce(label);
        match kind.extract_features(&img) {
            Ok(features) => samples.push(LabeledSample { features, label }),
            Err(e) => warn!(kind = %kind, label, error = %e, "Synthetic sample rejected"),
        }
    }
    samples
}

/// Predict every test sample and accumulate a confusion matrix.
pub fn evaluate(
    classifier: &KnnClassifier,
    test: &[LabeledSample],
    classes: usize,
) -> Result<ConfusionMatrix, ModelError> {
    let mut confusion = ConfusionMatrix::new(classes);
    for sample in test {
        let predicted = classifier.predict(&sample.features)?;
        if !confusion.record(predicted, sample.label) {
            warn!(predicted, truth = sample.label, "Label outside confusion matrix");
        }
    }
    Ok(confusion)
}

fn report_dataset_model(model: &TrainedModel, dataset: &Dataset, options: &TrainOptions) {
    let Some(evaluation) = model.evaluation() else {
        return;
    };
    let labels = model.labels();

    info!(
        kind = %model.kind(),
        dataset_dir = %options.dataset_dir.display(),
        class_counts = ?dataset.class_counts(),
        "Dataset loaded"
    );
    info!(
        train = evaluation.train_size,
        test = evaluation.test_size,
        train_counts = ?evaluation.train_counts,
        test_counts = ?evaluation.test_counts,
        "Dataset split"
    );
    info!(
        accuracy = %format_args!("{:.3}", evaluation.accuracy),
        "Test accuracy"
    );
    info!(classes = ?labels.names(), "Confusion matrix (pred x true)");
    for predicted in 0..evaluation.confusion.classes() {
        info!(
            pred = labels.name(predicted).unwrap_or("?"),
            row = ?evaluation.confusion.row(predicted),
            "Confusion matrix row"
        );
    }

    if options.verbose {
        if let Some(ref features) = dataset.sample_feature {
            info!(features = ?features, "Example feature vector");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{encode_png, render_face, render_team, HAPPY};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn options(dir: &Path, force_synthetic: bool) -> TrainOptions {
        TrainOptions {
            dataset_dir: dir.to_path_buf(),
            force_synthetic,
            verbose: true,
        }
    }

    fn write_png(path: &Path, png: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, png).unwrap();
    }

    #[test]
    fn test_confusion_matrix_accounting() {
        let mut cm = ConfusionMatrix::new(2);
        assert_eq!(cm.accuracy(), 0.0);

        assert!(cm.record(1, 1));
        assert!(cm.record(0, 1));
        assert!(cm.record(0, 0));
        assert!(!cm.record(2, 0));

        assert_eq!(cm.total(), 3);
        assert_eq!(cm.correct(), 2);
        assert_eq!(cm.get(0, 1), 1);
        assert_eq!(cm.row(0), &[1, 1]);
        assert!((cm.accuracy() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_forced_synthetic_ignores_valid_dataset() {
        let dir = tempdir().unwrap();
        let happy = encode_png(&render_face(true)).unwrap();
        let sad = encode_png(&render_face(false)).unwrap();
        for i in 0..5 {
            write_png(&dir.path().join("happy").join(format!("{i}.png")), &happy);
            write_png(&dir.path().join("angry").join(format!("{i}.png")), &sad);
        }

        let model = train(ClassifierKind::Mood, &options(dir.path(), true)).unwrap();
        assert_eq!(model.source(), ModelSource::Synthetic);
        assert_eq!(model.classifier().len(), 400);
        assert!(model.evaluation().is_none());

        let model = train(ClassifierKind::Mood, &options(dir.path(), false)).unwrap();
        assert_eq!(model.source(), ModelSource::Dataset);
    }

    #[test]
    fn test_synthetic_corpus_sizes_and_reproducibility() {
        let mood = synthetic_corpus(ClassifierKind::Mood, 400, 12345);
        let team = synthetic_corpus(ClassifierKind::Team, 450, 123);
        assert_eq!(mood.len(), 400);
        assert_eq!(team.len(), 450);
        assert_eq!(mood, synthetic_corpus(ClassifierKind::Mood, 400, 12345));
        assert!(team.iter().all(|s| s.features.len() == 4 && s.label < 3));
    }

    #[test]
    fn test_empty_dataset_falls_back_to_same_model_as_synthetic() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("happy")).unwrap();
        fs::create_dir_all(dir.path().join("angry")).unwrap();

        let fallback = train(ClassifierKind::Mood, &options(dir.path(), false)).unwrap();
        let synthetic = train_synthetic(ClassifierKind::Mood).unwrap();
        assert_eq!(fallback.source(), ModelSource::Synthetic);
        assert!(fallback.evaluation().is_none());
        assert_eq!(fallback.classifier(), synthetic.classifier());

        let corpus = synthetic_corpus(ClassifierKind::Mood, 400, 12345);
        for sample in &corpus {
            assert_eq!(
                fallback.predict(&sample.features).unwrap(),
                synthetic.predict(&sample.features).unwrap()
            );
        }
    }

    #[test]
    fn test_missing_team_dataset_matches_synthetic_model() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent");
        let fallback = train(ClassifierKind::Team, &options(&missing, false)).unwrap();
        let synthetic = train_synthetic(ClassifierKind::Team).unwrap();
        assert_eq!(fallback.source(), ModelSource::Synthetic);
        assert_eq!(fallback.classifier(), synthetic.classifier());
    }

    #[test]
    fn test_synthetic_mood_model_recognises_happy_face() {
        let model = train_synthetic(ClassifierKind::Mood).unwrap();
        let features = ClassifierKind::Mood
            .extract_features(&render_face(true))
            .unwrap();
        let label = model.predict(&features).unwrap();
        assert_eq!(label, HAPPY);
        assert_eq!(model.labels().name(label), Some("HAPPY"));
    }

    #[test]
    fn test_synthetic_team_model_recognises_each_team() {
        let model = train_synthetic(ClassifierKind::Team).unwrap();
        for team in 0..3 {
            let features = ClassifierKind::Team
                .extract_features(&render_team(team))
                .unwrap();
            assert_eq!(model.predict(&features).unwrap(), team);
        }
        assert_eq!(model.labels().name(0), Some("RED"));
    }

    #[test]
    fn test_empty_test_split_reports_zero_accuracy() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("teste")).unwrap();
        for (label, class) in ["corinthians", "flamengo", "palmeiras"].iter().enumerate() {
            let png = encode_png(&render_team(label)).unwrap();
            for i in 0..2 {
                write_png(&dir.path().join("treino").join(class).join(format!("{i}.png")), &png);
            }
        }

        let model = train(ClassifierKind::Team, &options(dir.path(), false)).unwrap();
        assert_eq!(model.source(), ModelSource::Dataset);
        let evaluation = model.evaluation().unwrap();
        assert_eq!(evaluation.test_size, 0);
        assert_eq!(evaluation.accuracy, 0.0);
        assert_eq!(evaluation.confusion.total(), 0);
        assert_eq!(model.labels().name(2), Some("PALMEIRAS"));
    }

    #[test]
    fn test_confusion_total_matches_test_split() {
        let dir = tempdir().unwrap();
        let happy = encode_png(&render_face(true)).unwrap();
        let sad = encode_png(&render_face(false)).unwrap();
        for i in 0..12 {
            write_png(&dir.path().join("happy").join(format!("{i}.png")), &happy);
            write_png(&dir.path().join("angry").join(format!("{i}.jpeg.png")), &sad);
        }

        let model = train(ClassifierKind::Mood, &options(dir.path(), false)).unwrap();
        let evaluation = model.evaluation().unwrap();
        assert_eq!(evaluation.test_size, 5);
        assert_eq!(evaluation.confusion.total(), evaluation.test_size);
        assert_eq!(evaluation.accuracy, 1.0);
    }

    #[test]
    fn test_tiny_dataset_falls_back_to_synthetic() {
        let dir = tempdir().unwrap();
        let png = encode_png(&render_face(true)).unwrap();
        write_png(&dir.path().join("happy").join("only.png"), &png);
        fs::create_dir_all(dir.path().join("angry")).unwrap();

        let model = train(ClassifierKind::Mood, &options(dir.path(), false)).unwrap();
        assert_eq!(model.source(), ModelSource::Synthetic);
    }
}
