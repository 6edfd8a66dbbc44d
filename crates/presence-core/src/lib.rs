//! presence-core: face identification engine.
//!
//! Detects frontal faces with a Viola-Jones Haar cascade, describes each
//! face by gray-level co-occurrence texture statistics, and maps the
//! descriptor to an identity label with a pre-trained SVM bundle.
//! Everything here is synchronous, pure CPU work.

pub mod cascade;
pub mod classifier;
pub mod detector;
pub mod preprocess;
pub mod texture;
pub mod types;

pub use classifier::{BundleError, ClassifyError, ModelBundle};
pub use detector::{DetectorConfig, DetectorError, FaceDetector, FacePolicy};
pub use texture::{TextureConfig, TextureError, TextureExtractor};
pub use types::{FaceRegion, FeatureVector, GrayImage, Rect, FACE_SIZE};
