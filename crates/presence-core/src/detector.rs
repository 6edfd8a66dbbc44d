//! Multi-scale Viola-Jones face detector.
//!
//! Scans an image pyramid with a Haar [`Cascade`], then merges overlapping
//! hits and drops clusters with too few neighbors.

use crate::cascade::{Cascade, CascadeError, IntegralImage};
use crate::preprocess::resize_bilinear;
use crate::types::{FaceRegion, GrayImage, Rect, FACE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

// --- Named constants ---
const DEFAULT_SCALE_FACTOR: f64 = 1.3;
const DEFAULT_MIN_NEIGHBORS: usize = 5;
/// No lower bound: the cascade's own window is the smallest face scanned.
const DEFAULT_MIN_FACE_SIZE: usize = 0;
/// Relative edge tolerance when clustering raw detections.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade: {0}")]
    Cascade(#[from] CascadeError),
    #[error("invalid detector config: {0}")]
    InvalidConfig(String),
    #[error("no face detected")]
    NoFaceDetected,
}

/// Which detected regions go on to feature extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacePolicy {
    /// Only the first region (most neighbors, then top-left first).
    #[default]
    First,
    /// Every region, one descriptor each.
    All,
}

impl FromStr for FacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "all" => Ok(Self::All),
            other => Err(format!("unknown face policy {other:?} (expected first|all)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Pyramid step between scales; must be > 1.
    pub scale_factor: f64,
    /// Clusters with this many raw hits or fewer are discarded.
    pub min_neighbors: usize,
    /// Smallest face side, in source pixels. 0 scans from the base level.
    pub min_face_size: usize,
    pub policy: FacePolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            policy: FacePolicy::First,
        }
    }
}

/// A merged detection before cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub rect: Rect,
    pub neighbors: usize,
}

/// Haar-cascade face detector. Immutable and shareable across threads.
pub struct FaceDetector {
    cascade: Cascade,
    config: DetectorConfig,
}

impl FaceDetector {
    /// Load the cascade XML at `cascade_path`.
    pub fn load(cascade_path: &Path, config: DetectorConfig) -> Result<Self, DetectorError> {
        let cascade = Cascade::load(cascade_path)?;
        Self::new(cascade, config)
    }

    pub fn new(cascade: Cascade, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !(config.scale_factor > 1.0) {
            return Err(DetectorError::InvalidConfig(format!(
                "scale factor must be > 1, got {}",
                config.scale_factor
            )));
        }
        tracing::debug!(?config, "face detector configured");
        Ok(Self { cascade, config })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect faces and return normalized crops, honoring the face policy.
    pub fn detect(&self, gray: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let detections = self.detect_rects(gray);
        if detections.is_empty() {
            return Err(DetectorError::NoFaceDetected);
        }

        let take = match self.config.policy {
            FacePolicy::First => 1,
            FacePolicy::All => detections.len(),
        };
        tracing::debug!(found = detections.len(), used = take, "faces detected");

        Ok(detections
            .into_iter()
            .take(take)
            .map(|d| FaceRegion {
                bounds: d.rect,
                neighbors: d.neighbors,
                pixels: resize_bilinear(&gray.crop(&d.rect), FACE_SIZE, FACE_SIZE),
            })
            .collect())
    }

    /// Raw merged detections in deterministic order, without cropping.
    pub fn detect_rects(&self, gray: &GrayImage) -> Vec<Detection> {
        let (cw, ch) = (self.cascade.window_width, self.cascade.window_height);
        let mut candidates = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let win_w = (cw as f64 * factor).round() as usize;
            let win_h = (ch as f64 * factor).round() as usize;
            let scaled_w = (gray.width as f64 / factor).round() as usize;
            let scaled_h = (gray.height as f64 / factor).round() as usize;
            if scaled_w < cw || scaled_h < ch {
                break;
            }

            if win_w >= self.config.min_face_size && win_h >= self.config.min_face_size {
                let scaled = resize_bilinear(gray, scaled_w, scaled_h);
                let ii = IntegralImage::new(&scaled);
                let step = if factor > 2.0 { 1 } else { 2 };

                for y in (0..=scaled_h - ch).step_by(step) {
                    for x in (0..=scaled_w - cw).step_by(step) {
                        if self.cascade.evaluate(&ii, x, y) {
                            candidates.push(Rect::new(
                                (x as f64 * factor).round() as usize,
                                (y as f64 * factor).round() as usize,
                                win_w,
                                win_h,
                            ));
                        }
                    }
                }
            }

            factor *= self.config.scale_factor;
        }

        tracing::trace!(candidates = candidates.len(), "cascade scan complete");

        let mut result = group_rectangles(&candidates, self.config.min_neighbors, GROUP_EPS);
        result.sort_by(|a, b| {
            b.neighbors
                .cmp(&a.neighbors)
                .then(a.rect.y.cmp(&b.rect.y))
                .then(a.rect.x.cmp(&b.rect.x))
        });
        result
    }
}

/// Two rectangles are equivalent when all four edges lie within a tolerance
/// proportional to the smaller size.
fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: usize, q: usize| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

/// Label each rectangle with its equivalence class (union-find). Classes are
/// numbered in order of first appearance.
fn partition(rects: &[Rect], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = rj.min(ri);
                }
            }
        }
    }

    let mut labels = vec![0usize; rects.len()];
    let mut root_label: Vec<Option<usize>> = vec![None; rects.len()];
    let mut classes = 0;
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        let label = *root_label[root].get_or_insert_with(|| {
            classes += 1;
            classes - 1
        });
        labels[i] = label;
    }
    (labels, classes)
}

/// Cluster raw hits, average each cluster, and keep clusters with more than
/// `min_neighbors` members that are not nested inside a stronger cluster.
fn group_rectangles(rects: &[Rect], min_neighbors: usize, eps: f64) -> Vec<Detection> {
    if rects.is_empty() {
        return Vec::new();
    }
    if min_neighbors == 0 {
        return rects
            .iter()
            .map(|&rect| Detection { rect, neighbors: 1 })
            .collect();
    }

    let (labels, classes) = partition(rects, eps);
    let mut sums = vec![[0usize; 4]; classes];
    let mut counts = vec![0usize; classes];
    for (rect, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += rect.x;
        s[1] += rect.y;
        s[2] += rect.width;
        s[3] += rect.height;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: usize| (v as f64 / n as f64).round() as usize;
            Rect::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3]))
        })
        .collect();

    let mut kept = Vec::new();
    for i in 0..classes {
        let (r1, n1) = (averaged[i], counts[i]);
        if n1 <= min_neighbors {
            continue;
        }
        let nested = (0..classes).any(|j| {
            let (r2, n2) = (averaged[j], counts[j]);
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            kept.push(Detection {
                rect: r1,
                neighbors: n1,
            });
        }
    }
    kept
}
