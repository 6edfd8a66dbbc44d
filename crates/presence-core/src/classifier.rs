//! Identity classifier over texture descriptors.
//!
//! A [`ModelBundle`] is loaded once from a model directory:
//!
//! - `model.json`: classifier, ordered reference columns, target column, feature version
//! - `label_encoder.json`: class index → label
//! - `scaler.json` (optional): per-column standardization
//!
//! Every shape is validated at load time so that `classify` cannot fail on a
//! well-formed feature vector.

use crate::types::FeatureVector;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const MODEL_FILE: &str = "model.json";
pub const LABEL_ENCODER_FILE: &str = "label_encoder.json";
pub const SCALER_FILE: &str = "scaler.json";

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("model artifact not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid model bundle: {0}")]
    Invalid(String),
    #[error("extractor does not produce reference columns: {missing:?}")]
    ColumnMismatch { missing: Vec<String> },
    #[error("bundle trained with feature version {bundle:?}, extractor is {extractor:?}")]
    VersionMismatch { bundle: String, extractor: String },
}

#[derive(Error, Debug, PartialEq)]
pub enum ClassifyError {
    #[error("feature vector is missing reference column {0}")]
    MissingColumn(String),
}

/// SVM kernel function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Kernel {
    Linear,
    Rbf { gamma: f64 },
    Poly { gamma: f64, coef0: f64, degree: i32 },
    Sigmoid { gamma: f64, coef0: f64 },
}

impl Kernel {
    fn eval(&self, a: &[f64], b: &[f64]) -> f64 {
        let dot = || a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>();
        match *self {
            Kernel::Linear => dot(),
            Kernel::Rbf { gamma } => {
                let dist2: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
                (-gamma * dist2).exp()
            }
            Kernel::Poly { gamma, coef0, degree } => (gamma * dot() + coef0).powi(degree),
            Kernel::Sigmoid { gamma, coef0 } => (gamma * dot() + coef0).tanh(),
        }
    }
}

/// Multi-class kernel SVM in one-vs-one layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcModel {
    pub kernel: Kernel,
    /// Encoded class index for each internal class slot.
    pub classes: Vec<usize>,
    /// Number of support vectors per class, in class order.
    pub n_support: Vec<usize>,
    pub support_vectors: Vec<Vec<f64>>,
    /// (n_classes - 1) rows × n_support_vectors.
    pub dual_coef: Vec<Vec<f64>>,
    /// One intercept per class pair (0,1), (0,2), …, (1,2), …
    pub intercept: Vec<f64>,
}

/// One-vs-rest linear model. Two classes may use a single row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub classes: Vec<usize>,
    pub coef: Vec<Vec<f64>>,
    pub intercept: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classifier {
    Svc(SvcModel),
    Linear(LinearModel),
}

impl Classifier {
    fn classes(&self) -> &[usize] {
        match self {
            Classifier::Svc(m) => &m.classes,
            Classifier::Linear(m) => &m.classes,
        }
    }

    fn validate(&self, n_features: usize) -> Result<(), String> {
        match self {
            Classifier::Svc(m) => {
                let n_class = m.classes.len();
                if n_class < 2 {
                    return Err(format!("svc needs at least 2 classes, got {n_class}"));
                }
                if m.n_support.len() != n_class {
                    return Err(format!("n_support has {} entries for {n_class} classes", m.n_support.len()));
                }
                let n_sv: usize = m.n_support.iter().sum();
                if m.support_vectors.len() != n_sv {
                    return Err(format!(
                        "n_support sums to {n_sv} but {} support vectors given",
                        m.support_vectors.len()
                    ));
                }
                if let Some(sv) = m.support_vectors.iter().find(|sv| sv.len() != n_features) {
                    return Err(format!("support vector has {} values, expected {n_features}", sv.len()));
                }
                if m.dual_coef.len() != n_class - 1 || m.dual_coef.iter().any(|row| row.len() != n_sv) {
                    return Err(format!("dual_coef must be {} × {n_sv}", n_class - 1));
                }
                let pairs = n_class * (n_class - 1) / 2;
                if m.intercept.len() != pairs {
                    return Err(format!("intercept has {} entries, expected {pairs}", m.intercept.len()));
                }
            }
            Classifier::Linear(m) => {
                let n_class = m.classes.len();
                let rows = if n_class == 2 { 1..=2 } else { n_class..=n_class };
                if n_class < 2 || !rows.contains(&m.coef.len()) {
                    return Err(format!("linear model has {} coef rows for {n_class} classes", m.coef.len()));
                }
                if m.intercept.len() != m.coef.len() {
                    return Err("linear intercept length differs from coef rows".into());
                }
                if let Some(row) = m.coef.iter().find(|row| row.len() != n_features) {
                    return Err(format!("coef row has {} values, expected {n_features}", row.len()));
                }
            }
        }
        Ok(())
    }

    /// Encoded class index for one (already selected and scaled) sample.
    fn predict(&self, x: &[f64]) -> usize {
        match self {
            Classifier::Svc(m) => {
                let n_class = m.classes.len();
                let kvals: Vec<f64> = m.support_vectors.iter().map(|sv| m.kernel.eval(sv, x)).collect();
                let mut starts = Vec::with_capacity(n_class);
                let mut acc = 0;
                for &n in &m.n_support {
                    starts.push(acc);
                    acc += n;
                }

                let mut votes = vec![0usize; n_class];
                let mut pair = 0;
                for i in 0..n_class {
                    for j in (i + 1)..n_class {
                        let mut sum = m.intercept[pair];
                        for k in starts[i]..starts[i] + m.n_support[i] {
                            sum += m.dual_coef[j - 1][k] * kvals[k];
                        }
                        for k in starts[j]..starts[j] + m.n_support[j] {
                            sum += m.dual_coef[i][k] * kvals[k];
                        }
                        if sum > 0.0 {
                            votes[i] += 1;
                        } else {
                            votes[j] += 1;
                        }
                        pair += 1;
                    }
                }
                m.classes[argmax(votes.iter().map(|&v| v as f64))]
            }
            Classifier::Linear(m) => {
                let scores = m.coef.iter().zip(&m.intercept).map(|(row, b)| {
                    row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + b
                });
                if m.coef.len() == 1 {
                    let score = scores.sum::<f64>();
                    m.classes[usize::from(score > 0.0)]
                } else {
                    m.classes[argmax(scores)]
                }
            }
        }
    }
}

/// Index of the first maximum.
fn argmax(values: impl Iterator<Item = f64>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, v) in values.enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

/// Per-column standardization `(x - mean) / scale`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Scaler {
    fn apply(&self, x: &mut [f64]) {
        for ((v, m), s) in x.iter_mut().zip(&self.mean).zip(&self.scale) {
            let s = if *s == 0.0 { 1.0 } else { *s };
            *v = (*v - m) / s;
        }
    }
}

/// Maps encoded class indices back to labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelDecoder {
    pub classes: Vec<String>,
}

/// Contents of `model.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub classifier: Classifier,
    pub reference_columns: Vec<String>,
    pub target: String,
    /// Texture config version the classifier was trained on.
    pub feature_version: String,
}

/// Immutable classifier bundle, loaded once and shared read-only.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    classifier: Classifier,
    reference_columns: Vec<String>,
    target: String,
    feature_version: String,
    decoder: LabelDecoder,
    scaler: Option<Scaler>,
}

impl ModelBundle {
    /// Load `model.json`, `label_encoder.json` and optional `scaler.json` from `dir`.
    pub fn load(dir: &Path) -> Result<Self, BundleError> {
        let model: ModelFile = read_json(&dir.join(MODEL_FILE))?;
        let decoder: LabelDecoder = read_json(&dir.join(LABEL_ENCODER_FILE))?;
        let scaler_path = dir.join(SCALER_FILE);
        let scaler: Option<Scaler> = if scaler_path.exists() {
            Some(read_json(&scaler_path)?)
        } else {
            None
        };

        let bundle = Self::from_parts(model, decoder, scaler)?;
        tracing::info!(
            dir = %dir.display(),
            columns = bundle.reference_columns.len(),
            labels = bundle.decoder.classes.len(),
            target = %bundle.target,
            scaled = bundle.scaler.is_some(),
            feature_version = %bundle.feature_version,
            "loaded model bundle"
        );
        Ok(bundle)
    }

    /// Assemble and validate a bundle from already-parsed artifacts.
    pub fn from_parts(
        model: ModelFile,
        decoder: LabelDecoder,
        scaler: Option<Scaler>,
    ) -> Result<Self, BundleError> {
        let n_features = model.reference_columns.len();
        if n_features == 0 {
            return Err(BundleError::Invalid("reference column list is empty".into()));
        }
        model.classifier.validate(n_features).map_err(BundleError::Invalid)?;

        if let Some(&c) = model
            .classifier
            .classes()
            .iter()
            .find(|&&c| c >= decoder.classes.len())
        {
            return Err(BundleError::Invalid(format!(
                "class index {c} outside label decoder ({} labels)",
                decoder.classes.len()
            )));
        }
        if let Some(s) = &scaler {
            if s.mean.len() != n_features || s.scale.len() != n_features {
                return Err(BundleError::Invalid(format!(
                    "scaler has {}/{} entries for {n_features} columns",
                    s.mean.len(),
                    s.scale.len()
                )));
            }
        }

        Ok(Self {
            classifier: model.classifier,
            reference_columns: model.reference_columns,
            target: model.target,
            feature_version: model.feature_version,
            decoder,
            scaler,
        })
    }

    pub fn reference_columns(&self) -> &[String] {
        &self.reference_columns
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn feature_version(&self) -> &str {
        &self.feature_version
    }

    /// Every label the bundle can predict.
    pub fn labels(&self) -> &[String] {
        &self.decoder.classes
    }

    /// Check that the extractor's columns and version satisfy this bundle.
    pub fn check_extractor(&self, columns: &[String], version: &str) -> Result<(), BundleError> {
        if version != self.feature_version {
            return Err(BundleError::VersionMismatch {
                bundle: self.feature_version.clone(),
                extractor: version.to_string(),
            });
        }
        let missing: Vec<String> = self
            .reference_columns
            .iter()
            .filter(|c| !columns.contains(c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BundleError::ColumnMismatch { missing });
        }
        Ok(())
    }

    /// Predict the identity label for one descriptor.
    pub fn classify(&self, features: &FeatureVector) -> Result<String, ClassifyError> {
        let mut x = self
            .reference_columns
            .iter()
            .map(|c| features.get(c).ok_or_else(|| ClassifyError::MissingColumn(c.clone())))
            .collect::<Result<Vec<f64>, _>>()?;

        if let Some(scaler) = &self.scaler {
            scaler.apply(&mut x);
        }

        let class = self.classifier.predict(&x);
        Ok(self.decoder.classes[class].clone())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, BundleError> {
    let display = path.display().to_string();
    if !path.exists() {
        return Err(BundleError::NotFound(display));
    }
    let text = std::fs::read_to_string(path).map_err(|source| BundleError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| BundleError::Json { path: display, source })
}
