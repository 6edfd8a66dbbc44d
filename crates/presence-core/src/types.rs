use serde::{Deserialize, Serialize};

/// Canonical side length of a normalized face crop.
pub const FACE_SIZE: usize = 128;

/// Row-major single-channel 8-bit image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl GrayImage {
    /// Wrap an existing buffer. Returns `None` if the length does not match.
    pub fn new(data: Vec<u8>, width: usize, height: usize) -> Option<Self> {
        (data.len() == width * height).then_some(Self { data, width, height })
    }

    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> u8) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { data, width, height }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    /// Copy out a sub-rectangle, clamped to the image bounds.
    pub fn crop(&self, rect: &Rect) -> GrayImage {
        let x0 = rect.x.min(self.width);
        let y0 = rect.y.min(self.height);
        let x1 = (rect.x + rect.width).min(self.width);
        let y1 = (rect.y + rect.height).min(self.height);

        let mut data = Vec::with_capacity((x1 - x0) * (y1 - y0));
        for y in y0..y1 {
            data.extend_from_slice(&self.data[y * self.width + x0..y * self.width + x1]);
        }
        GrayImage {
            data,
            width: x1 - x0,
            height: y1 - y0,
        }
    }
}

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// True if `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

/// A detected face, cropped and normalized to `FACE_SIZE`×`FACE_SIZE` grayscale.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    /// Location of the face in the source image.
    pub bounds: Rect,
    /// Number of raw detections merged into this region.
    pub neighbors: usize,
    pub pixels: GrayImage,
}

/// Ordered, named texture descriptor of one face region.
///
/// Column order is part of the contract with the trained model bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub columns: Vec<String>,
    pub values: Vec<f64>,
}

impl FeatureVector {
    /// Build a vector whose columns are named `feature_0 .. feature_{n-1}`.
    pub fn from_values(values: Vec<f64>) -> Self {
        Self {
            columns: column_names(values.len()),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Look up a value by column name.
    pub fn get(&self, column: &str) -> Option<f64> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.values[i])
    }
}

/// Column names produced by the extractor for a descriptor of length `n`.
pub fn column_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("feature_{i}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_clamps_to_bounds() {
        let img = GrayImage::from_fn(10, 10, |x, y| (x + y * 10) as u8);
        let crop = img.crop(&Rect::new(8, 8, 5, 5));
        assert_eq!((crop.width, crop.height), (2, 2));
        assert_eq!(crop.data, vec![88, 89, 98, 99]);
    }

    #[test]
    fn test_rect_contains() {
        let outer = Rect::new(0, 0, 100, 100);
        assert!(outer.contains(&Rect::new(10, 10, 20, 20)));
        assert!(!outer.contains(&Rect::new(90, 90, 20, 20)));
    }

    #[test]
    fn test_feature_vector_lookup() {
        let fv = FeatureVector::from_values(vec![0.5, 1.5, 2.5]);
        assert_eq!(fv.columns, vec!["feature_0", "feature_1", "feature_2"]);
        assert_eq!(fv.get("feature_1"), Some(1.5));
        assert_eq!(fv.get("feature_9"), None);
    }

    #[test]
    fn test_gray_image_length_check() {
        assert!(GrayImage::new(vec![0; 6], 3, 2).is_some());
        assert!(GrayImage::new(vec![0; 5], 3, 2).is_none());
    }
}
