//! Gray-level co-occurrence (GLCM) texture descriptor.
//!
//! The extractor configuration is versioned and must match the configuration
//! the model bundle was trained with; the two are not independently
//! substitutable.

use crate::preprocess::resize_bilinear;
use crate::types::{column_names, FaceRegion, FeatureVector, GrayImage, FACE_SIZE};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Standard deviations below this make correlation degenerate (defined as 1).
const CORRELATION_EPS: f64 = 1e-15;

#[derive(Error, Debug)]
pub enum TextureError {
    #[error("failed to read texture config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed texture config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid texture config: {0}")]
    Invalid(String),
}

/// Scalar statistic derived from one normalized GLCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Contrast,
    Dissimilarity,
    Homogeneity,
    #[serde(rename = "ASM")]
    Asm,
    Energy,
    Correlation,
    Mean,
    Variance,
    Std,
    Entropy,
}

/// Versioned extractor configuration (`texture.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureConfig {
    pub version: String,
    /// Quantized intensity levels; must divide 256.
    pub levels: u16,
    /// Pixel distances for the co-occurrence offsets.
    pub distances: Vec<usize>,
    /// Offset angles in degrees (0 = right, 90 = down).
    pub angles: Vec<f64>,
    /// Statistics in output order.
    pub statistics: Vec<Statistic>,
}

impl Default for TextureConfig {
    fn default() -> Self {
        Self {
            version: "glcm-v1".into(),
            levels: 8,
            distances: vec![1],
            angles: vec![0.0, 45.0, 90.0, 135.0],
            statistics: vec![
                Statistic::Dissimilarity,
                Statistic::Homogeneity,
                Statistic::Asm,
                Statistic::Energy,
                Statistic::Correlation,
                Statistic::Mean,
                Statistic::Variance,
                Statistic::Std,
                Statistic::Entropy,
            ],
        }
    }
}

impl TextureConfig {
    /// Load from a TOML file, falling back to the default when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, TextureError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no texture config, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml_str(&std::fs::read_to_string(path)?)?;
        tracing::info!(path = %path.display(), version = %config.version, "loaded texture config");
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, TextureError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TextureError> {
        if !(2..=256).contains(&self.levels) || 256 % self.levels != 0 {
            return Err(TextureError::Invalid(format!(
                "levels must divide 256 and lie in 2..=256, got {}",
                self.levels
            )));
        }
        if self.distances.is_empty() || self.distances.contains(&0) {
            return Err(TextureError::Invalid("distances must be non-empty and positive".into()));
        }
        if self.angles.is_empty() {
            return Err(TextureError::Invalid("angles must be non-empty".into()));
        }
        if self.statistics.is_empty() {
            return Err(TextureError::Invalid("statistics must be non-empty".into()));
        }
        Ok(())
    }

    /// Descriptor length: statistics × distances × angles.
    pub fn feature_len(&self) -> usize {
        self.statistics.len() * self.distances.len() * self.angles.len()
    }
}

/// Converts face crops into fixed-length GLCM descriptors.
#[derive(Debug, Clone)]
pub struct TextureExtractor {
    config: TextureConfig,
    /// (row, col) offsets, distance-major then angle.
    offsets: Vec<(isize, isize)>,
}

impl TextureExtractor {
    pub fn new(config: TextureConfig) -> Result<Self, TextureError> {
        config.validate()?;
        let offsets = config
            .distances
            .iter()
            .flat_map(|&d| {
                config.angles.iter().map(move |&deg| {
                    let theta = deg.to_radians();
                    (
                        (theta.sin() * d as f64).round() as isize,
                        (theta.cos() * d as f64).round() as isize,
                    )
                })
            })
            .collect();
        Ok(Self { config, offsets })
    }

    pub fn config(&self) -> &TextureConfig {
        &self.config
    }

    /// Column names of every descriptor this extractor produces.
    pub fn column_names(&self) -> Vec<String> {
        column_names(self.config.feature_len())
    }

    pub fn extract(&self, region: &FaceRegion) -> FeatureVector {
        self.extract_gray(&region.pixels)
    }

    /// Resize to the canonical grid, quantize, and compute every statistic.
    pub fn extract_gray(&self, face: &GrayImage) -> FeatureVector {
        let canonical = if face.width == FACE_SIZE && face.height == FACE_SIZE {
            face.clone()
        } else {
            resize_bilinear(face, FACE_SIZE, FACE_SIZE)
        };
        let quantized = quantize(&canonical, self.config.levels);
        let levels = self.config.levels as usize;

        let matrices: Vec<Array2<f64>> = self
            .offsets
            .iter()
            .map(|&(dr, dc)| glcm(&quantized, levels, dr, dc))
            .collect();

        let mut values = Vec::with_capacity(self.config.feature_len());
        for &stat in &self.config.statistics {
            values.extend(matrices.iter().map(|p| statistic(p, stat)));
        }
        FeatureVector::from_values(values)
    }
}

/// Reduce 256 intensity levels to `levels` by integer division.
pub fn quantize(img: &GrayImage, levels: u16) -> GrayImage {
    let bin = (256 / levels as u32) as u8;
    GrayImage {
        data: img.data.iter().map(|&p| p / bin).collect(),
        width: img.width,
        height: img.height,
    }
}

/// Symmetric, normalized co-occurrence matrix for one (row, col) offset.
///
/// Pixels whose neighbor falls outside the image are skipped. An image with
/// no valid pairs yields an all-zero matrix.
pub fn glcm(img: &GrayImage, levels: usize, dr: isize, dc: isize) -> Array2<f64> {
    let mut p = Array2::<f64>::zeros((levels, levels));
    let (rows, cols) = (img.height as isize, img.width as isize);

    let (r0, r1) = (0isize.max(-dr), rows.min(rows - dr));
    let (c0, c1) = (0isize.max(-dc), cols.min(cols - dc));
    for r in r0..r1 {
        for c in c0..c1 {
            let i = img.get(c as usize, r as usize) as usize;
            let j = img.get((c + dc) as usize, (r + dr) as usize) as usize;
            p[[i, j]] += 1.0;
        }
    }

    let mut p = &p + &p.t();
    let total = p.sum();
    if total > 0.0 {
        p /= total;
    }
    p
}

/// Compute one statistic over a normalized GLCM.
pub fn statistic(p: &Array2<f64>, stat: Statistic) -> f64 {
    let weighted = |f: &dyn Fn(f64, f64) -> f64| -> f64 {
        p.indexed_iter()
            .map(|((i, j), &v)| v * f(i as f64, j as f64))
            .sum()
    };

    match stat {
        Statistic::Contrast => weighted(&|i, j| (i - j).powi(2)),
        Statistic::Dissimilarity => weighted(&|i, j| (i - j).abs()),
        Statistic::Homogeneity => weighted(&|i, j| 1.0 / (1.0 + (i - j).powi(2))),
        Statistic::Asm => p.iter().map(|v| v * v).sum(),
        Statistic::Energy => p.iter().map(|v| v * v).sum::<f64>().sqrt(),
        Statistic::Correlation => {
            let mean_i = weighted(&|i, _| i);
            let mean_j = weighted(&|_, j| j);
            let std_i = weighted(&|i, _| (i - mean_i).powi(2)).sqrt();
            let std_j = weighted(&|_, j| (j - mean_j).powi(2)).sqrt();
            if std_i < CORRELATION_EPS || std_j < CORRELATION_EPS {
                1.0
            } else {
                weighted(&|i, j| (i - mean_i) * (j - mean_j)) / (std_i * std_j)
            }
        }
        Statistic::Mean => weighted(&|i, _| i),
        Statistic::Variance => {
            let mean = weighted(&|i, _| i);
            weighted(&|i, _| (i - mean).powi(2))
        }
        Statistic::Std => {
            let mean = weighted(&|i, _| i);
            weighted(&|i, _| (i - mean).powi(2)).sqrt()
        }
        Statistic::Entropy => p.iter().filter(|&&v| v > 0.0).map(|&v| -v * v.ln()).sum(),
    }
}
