use async_trait::async_trait;
use presence_core::preprocess::{self, DecodeError};
use presence_core::{
    BundleError, ClassifyError, DetectorConfig, DetectorError, FaceDetector, FacePolicy, ModelBundle,
    TextureConfig, TextureError, TextureExtractor,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
pub const TEXTURE_CONFIG_FILE: &str = "texture.toml";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] DecodeError),
    #[error("detector error: {0}")]
    Detector(DetectorError),
    #[error("texture config error: {0}")]
    Texture(#[from] TextureError),
    #[error("model bundle error: {0}")]
    Bundle(#[from] BundleError),
    #[error("classifier error: {0}")]
    Classify(#[from] ClassifyError),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("pipeline worker failed: {0}")]
    Worker(String),
}

impl From<DetectorError> for EngineError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::NoFaceDetected => EngineError::NoFaceDetected,
            other => EngineError::Detector(other),
        }
    }
}

/// Result of identifying the face(s) in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Identification {
    /// Authoritative prediction (the first face).
    pub label: String,
    /// One prediction per classified face, in detection order.
    pub all_labels: Vec<String>,
}

/// Turns raw image bytes into a predicted identity label.
#[async_trait]
pub trait FaceIdentifier: Send + Sync {
    async fn identify(&self, image: Vec<u8>) -> Result<Identification, EngineError>;

    fn models_loaded(&self) -> bool {
        true
    }
}

/// Detector, extractor and classifier bundle, loaded once and shared read-only.
pub struct Pipeline {
    detector: FaceDetector,
    extractor: TextureExtractor,
    bundle: ModelBundle,
}

impl Pipeline {
    /// Load every artifact from `model_dir`. Fails fast on anything missing
    /// or inconsistent.
    pub fn load(model_dir: &Path, detector_config: DetectorConfig) -> Result<Self, EngineError> {
        let detector = FaceDetector::load(&model_dir.join(CASCADE_FILE), detector_config)?;
        let texture = TextureConfig::load_or_default(&model_dir.join(TEXTURE_CONFIG_FILE))?;
        let extractor = TextureExtractor::new(texture)?;
        let bundle = ModelBundle::load(model_dir)?;
        Self::new(detector, extractor, bundle)
    }

    pub fn new(detector: FaceDetector, extractor: TextureExtractor, bundle: ModelBundle) -> Result<Self, EngineError> {
        bundle.check_extractor(&extractor.column_names(), &extractor.config().version)?;
        tracing::info!(
            features = extractor.config().feature_len(),
            reference_columns = bundle.reference_columns().len(),
            labels = bundle.labels().len(),
            policy = ?detector.config().policy,
            "pipeline ready"
        );
        Ok(Self {
            detector,
            extractor,
            bundle,
        })
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    pub fn extractor(&self) -> &TextureExtractor {
        &self.extractor
    }

    /// Decode → detect → extract → classify. Synchronous and CPU-bound.
    pub fn run(&self, image: &[u8]) -> Result<Identification, EngineError> {
        let gray = preprocess::decode_gray(image)?;
        let faces = self.detector.detect(&gray)?;
        tracing::debug!(
            width = gray.width,
            height = gray.height,
            faces = faces.len(),
            "faces detected"
        );

        let mut all_labels = Vec::with_capacity(faces.len());
        for face in &faces {
            let features = self.extractor.extract(face);
            all_labels.push(self.bundle.classify(&features)?);
        }

        let label = all_labels.first().cloned().ok_or(EngineError::NoFaceDetected)?;
        if self.detector.config().policy == FacePolicy::All && all_labels.len() > 1 {
            tracing::debug!(labels = ?all_labels, "multiple faces classified; first is authoritative");
        }
        Ok(Identification { label, all_labels })
    }
}

/// Clone-safe handle running the pipeline on the blocking thread pool.
#[derive(Clone)]
pub struct EngineHandle {
    pipeline: Arc<Pipeline>,
}

impl EngineHandle {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[async_trait]
impl FaceIdentifier for EngineHandle {
    async fn identify(&self, image: Vec<u8>) -> Result<Identification, EngineError> {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.run(&image))
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn fixtures() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../presence-core/tests/fixtures")
    }

    /// Model dir assembled from the core fixtures: edge cascade plus the pinned bundle.
    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::copy(fixtures().join("edge_cascade.xml"), dir.path().join(CASCADE_FILE)).unwrap();
        for file in ["model.json", "label_encoder.json", "scaler.json"] {
            std::fs::copy(fixtures().join("bundle").join(file), dir.path().join(file)).unwrap();
        }
        dir
    }

    fn detector_config(policy: FacePolicy) -> DetectorConfig {
        DetectorConfig {
            scale_factor: 1.3,
            min_neighbors: 0,
            min_face_size: 4,
            policy,
        }
    }

    fn png(img: image::GrayImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn edge_png() -> Vec<u8> {
        png(image::GrayImage::from_fn(48, 32, |x, _| {
            image::Luma([if x < 24 { 220 } else { 20 }])
        }))
    }

    #[test]
    fn test_load_and_run() {
        let dir = model_dir();
        let pipeline = Pipeline::load(dir.path(), detector_config(FacePolicy::First)).unwrap();
        let id = pipeline.run(&edge_png()).unwrap();
        assert_eq!(id.all_labels.len(), 1);
        assert!(pipeline.bundle().labels().contains(&id.label));
        assert_eq!(pipeline.run(&edge_png()).unwrap(), id);
    }

    #[test]
    fn test_all_policy_first_label_authoritative() {
        let dir = model_dir();
        let pipeline = Pipeline::load(dir.path(), detector_config(FacePolicy::All)).unwrap();
        let id = pipeline.run(&edge_png()).unwrap();
        assert!(!id.all_labels.is_empty());
        assert_eq!(id.label, id.all_labels[0]);
    }

    #[test]
    fn test_uniform_image_has_no_face() {
        let dir = model_dir();
        let pipeline = Pipeline::load(dir.path(), detector_config(FacePolicy::First)).unwrap();
        let blank = png(image::GrayImage::from_pixel(48, 32, image::Luma([128])));
        assert!(matches!(pipeline.run(&blank), Err(EngineError::NoFaceDetected)));
    }

    #[test]
    fn test_garbage_bytes_fail_decode() {
        let dir = model_dir();
        let pipeline = Pipeline::load(dir.path(), detector_config(FacePolicy::First)).unwrap();
        assert!(matches!(pipeline.run(b"not an image"), Err(EngineError::Decode(_))));
    }

    #[test]
    fn test_missing_cascade_is_fatal() {
        let dir = model_dir();
        std::fs::remove_file(dir.path().join(CASCADE_FILE)).unwrap();
        assert!(Pipeline::load(dir.path(), detector_config(FacePolicy::First)).is_err());
    }

    #[test]
    fn test_feature_version_mismatch_is_fatal() {
        let dir = model_dir();
        std::fs::write(
            dir.path().join(TEXTURE_CONFIG_FILE),
            "version = \"glcm-v2\"\nlevels = 8\ndistances = [1]\nangles = [0.0, 45.0, 90.0, 135.0]\nstatistics = [\"contrast\", \"ASM\"]\n",
        )
        .unwrap();
        assert!(matches!(
            Pipeline::load(dir.path(), detector_config(FacePolicy::First)),
            Err(EngineError::Bundle(BundleError::VersionMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_handle_runs_off_runtime() {
        let dir = model_dir();
        let handle = EngineHandle::new(Pipeline::load(dir.path(), detector_config(FacePolicy::First)).unwrap());
        let id = handle.identify(edge_png()).await.unwrap();
        assert_eq!(id.all_labels.len(), 1);
        assert!(handle.models_loaded());
    }
}
