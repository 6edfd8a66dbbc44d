//! Boosted Haar cascade in the OpenCV `opencv-cascade-classifier` XML format.
//!
//! Only upright (non-tilted) Haar features are supported, which covers the
//! stock frontal-face cascades.

use crate::types::GrayImage;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Stage sums below `threshold - STAGE_EPS` reject the window.
const STAGE_EPS: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] quick_xml::de::DeError),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

// --- XML layout ---

#[derive(Deserialize)]
struct StorageXml {
    cascade: CascadeXml,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CascadeXml {
    stage_type: String,
    feature_type: String,
    height: usize,
    width: usize,
    stages: Items<StageXml>,
    features: Items<FeatureXml>,
}

/// OpenCV writes sequences as repeated `<_>` children.
#[derive(Deserialize)]
struct Items<T> {
    #[serde(rename = "_", default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageXml {
    stage_threshold: f64,
    weak_classifiers: Items<WeakXml>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeakXml {
    internal_nodes: String,
    leaf_values: String,
}

#[derive(Deserialize)]
struct FeatureXml {
    rects: Items<String>,
    #[serde(default)]
    tilted: Option<u8>,
}

// --- Parsed model ---

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    /// Child index; `<= 0` means leaf `-left`.
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// A loaded Haar cascade. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Cascade {
    pub window_width: usize,
    pub window_height: usize,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl Cascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;
        tracing::info!(
            path = %path.display(),
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse a cascade from OpenCV XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let storage: StorageXml = quick_xml::de::from_str(xml)?;
        let raw = storage.cascade;

        if raw.stage_type.trim() != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {}", raw.stage_type)));
        }
        if raw.feature_type.trim() != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {}", raw.feature_type)));
        }
        if raw.width < 3 || raw.height < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {}x{} is too small",
                raw.width, raw.height
            )));
        }

        let features = raw
            .features
            .items
            .iter()
            .enumerate()
            .map(|(i, f)| parse_feature(i, f, raw.width, raw.height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = raw
            .stages
            .items
            .iter()
            .map(|s| {
                let classifiers = s
                    .weak_classifiers
                    .items
                    .iter()
                    .map(|w| parse_weak(w, features.len()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stage {
                    threshold: s.stage_threshold,
                    classifiers,
                })
            })
            .collect::<Result<Vec<_>, CascadeError>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        Ok(Self {
            window_width: raw.width,
            window_height: raw.height,
            stages,
            features,
        })
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    ///
    /// Returns `true` if the window passes all stages.
    pub fn evaluate(&self, ii: &IntegralImage, x: usize, y: usize) -> bool {
        // Variance normalization over the inner rect (1, 1, w-2, h-2).
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let area = (nw * nh) as f64;
        let sum = ii.sum(x + 1, y + 1, nw, nh);
        let sqsum = ii.sqsum(x + 1, y + 1, nw, nh);
        let nf = area * sqsum - sum * sum;
        let inv_nf = if nf > 0.0 { 1.0 / nf.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut stage_sum = 0.0;
            for weak in &stage.classifiers {
                stage_sum += self.eval_weak(weak, ii, x, y, inv_nf);
            }
            if stage_sum < stage.threshold - STAGE_EPS {
                return false;
            }
        }
        true
    }

    fn eval_weak(&self, weak: &WeakClassifier, ii: &IntegralImage, x: usize, y: usize, inv_nf: f64) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &weak.nodes[idx];
            let value = self.feature_value(node.feature, ii, x, y) * inv_nf;
            let next = if value < node.threshold { node.left } else { node.right };
            if next <= 0 {
                return weak.leaves[(-next) as usize];
            }
            idx = next as usize;
        }
    }

    fn feature_value(&self, feature: usize, ii: &IntegralImage, x: usize, y: usize) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| r.weight * ii.sum(x + r.x, y + r.y, r.width, r.height))
            .sum()
    }
}

fn parse_feature(
    index: usize,
    raw: &FeatureXml,
    win_w: usize,
    win_h: usize,
) -> Result<HaarFeature, CascadeError> {
    if raw.tilted.unwrap_or(0) != 0 {
        return Err(CascadeError::Unsupported(format!("feature {index} is tilted")));
    }
    let mut rects = Vec::with_capacity(raw.rects.items.len());
    for text in &raw.rects.items {
        let nums: Vec<f64> = parse_numbers(text)
            .map_err(|e| CascadeError::Invalid(format!("feature {index}: {e}")))?;
        let &[x, y, w, h, weight] = nums.as_slice() else {
            return Err(CascadeError::Invalid(format!(
                "feature {index}: rect needs 5 values, got {}",
                nums.len()
            )));
        };
        let rect = WeightedRect {
            x: x as usize,
            y: y as usize,
            width: w as usize,
            height: h as usize,
            weight,
        };
        if rect.x + rect.width > win_w || rect.y + rect.height > win_h {
            return Err(CascadeError::Invalid(format!(
                "feature {index}: rect exceeds {win_w}x{win_h} window"
            )));
        }
        rects.push(rect);
    }
    if rects.is_empty() {
        return Err(CascadeError::Invalid(format!("feature {index} has no rects")));
    }
    Ok(HaarFeature { rects })
}

fn parse_weak(raw: &WeakXml, feature_count: usize) -> Result<WeakClassifier, CascadeError> {
    let node_values = parse_numbers(&raw.internal_nodes).map_err(CascadeError::Invalid)?;
    let leaves = parse_numbers(&raw.leaf_values).map_err(CascadeError::Invalid)?;

    if node_values.is_empty() || node_values.len() % 4 != 0 {
        return Err(CascadeError::Invalid(format!(
            "internalNodes must hold groups of 4 values, got {}",
            node_values.len()
        )));
    }

    let nodes: Vec<Node> = node_values
        .chunks_exact(4)
        .map(|c| Node {
            left: c[0] as i32,
            right: c[1] as i32,
            feature: c[2] as usize,
            threshold: c[3],
        })
        .collect();

    for node in &nodes {
        if node.feature >= feature_count {
            return Err(CascadeError::Invalid(format!(
                "node references feature {} of {feature_count}",
                node.feature
            )));
        }
        for child in [node.left, node.right] {
            let in_range = if child <= 0 {
                ((-child) as usize) < leaves.len()
            } else {
                (child as usize) < nodes.len()
            };
            if !in_range {
                return Err(CascadeError::Invalid(format!("node child {child} out of range")));
            }
        }
    }

    Ok(WeakClassifier { nodes, leaves })
}

fn parse_numbers(text: &str) -> Result<Vec<f64>, String> {
    text.split_whitespace()
        .map(|t| t.parse::<f64>().map_err(|e| format!("bad number {t:?}: {e}")))
        .collect()
}

/// Summed-area tables for O(1) rectangle sums.
pub struct IntegralImage {
    stride: usize,
    sum: Vec<f64>,
    sqsum: Vec<f64>,
}

impl IntegralImage {
    pub fn new(img: &GrayImage) -> Self {
        let stride = img.width + 1;
        let mut sum = vec![0.0f64; stride * (img.height + 1)];
        let mut sqsum = vec![0.0f64; stride * (img.height + 1)];

        for y in 0..img.height {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..img.width {
                let p = img.get(x, y) as f64;
                row_sum += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    #[inline]
    fn rect(table: &[f64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let a = table[y * stride + x];
        let b = table[y * stride + x + w];
        let c = table[(y + h) * stride + x];
        let d = table[(y + h) * stride + x + w];
        d - b - c + a
    }

    /// Sum of pixel values in the rectangle.
    pub fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    /// Sum of squared pixel values in the rectangle.
    pub fn sqsum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        Self::rect(&self.sqsum, self.stride, x, y, w, h)
    }
}

/// A one-stage 4x4 cascade accepting windows whose left half is brighter
/// than the right half. Shared by detector tests.
#[cfg(test)]
pub(crate) const EDGE_CASCADE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>4</height>
  <width>4</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>5.0000000000000000e-01</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 1.0000000000000000e-02</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 4 4 -1.</_>
        <_>
          0 0 2 4 2.</_></rects></_></features></cascade>
</opencv_storage>
"#;
