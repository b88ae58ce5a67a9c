use std::path::PathBuf;
use std::sync::Arc;

use image::RgbImage;

use crate::config::ModelSettings;
use crate::errors::Result;
use crate::recognition::{Classification, Detection};

/// Object detector proposing boxes in its own square input space.
pub trait ObjectDetector: Send + Sync {
    /// Run detection once. Results keep the model's output order.
    fn recognize_image(&self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Edge length of the square input the detector expects.
    fn input_size(&self) -> u32;
}

/// Classifier labelling a single cropped region.
pub trait ImageClassifier: Send + Sync {
    /// Classify `image`, rotated by `sensor_orientation` degrees clockwise.
    ///
    /// Results are ordered by descending score.
    fn recognize_image(
        &self,
        image: &RgbImage,
        sensor_orientation: i32,
    ) -> Result<Vec<Classification>>;

    /// Release the underlying model. Later calls fail with `ModelUnavailable`.
    ///
    /// Called from async code while the model cache is locked, so it must not
    /// wait for an inference that is still running.
    fn close(&self) {}
}

/// Files and geometry needed to construct a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSpec {
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub input_size: u32,
    pub is_quantized: bool,
}

/// Files and runtime settings needed to construct a classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierSpec {
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub input_size: u32,
    pub device_id: i32,
    pub settings: ModelSettings,
}

/// Builds model handles; the seam between the pipeline and a model runtime.
pub trait ModelFactory: Send + Sync {
    fn create_detector(&self, spec: &DetectorSpec) -> Result<Arc<dyn ObjectDetector>>;

    fn create_classifier(&self, spec: &ClassifierSpec) -> Result<Arc<dyn ImageClassifier>>;
}
