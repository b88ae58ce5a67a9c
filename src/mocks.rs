use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;

use crate::errors::{ClassifyError, Result};
use crate::recognition::{Classification, Detection};
use crate::traits::{ClassifierSpec, DetectorSpec, ImageClassifier, ModelFactory, ObjectDetector};

/// Call counters shared by a mock factory and every model it creates.
#[derive(Debug, Default)]
pub struct MockStats {
    detector_creations: AtomicUsize,
    classifier_creations: AtomicUsize,
    detector_calls: AtomicUsize,
    classifier_calls: AtomicUsize,
    classifier_closes: AtomicUsize,
}

impl MockStats {
    pub fn detector_creations(&self) -> usize {
        self.detector_creations.load(Ordering::SeqCst)
    }

    pub fn classifier_creations(&self) -> usize {
        self.classifier_creations.load(Ordering::SeqCst)
    }

    pub fn detector_calls(&self) -> usize {
        self.detector_calls.load(Ordering::SeqCst)
    }

    pub fn classifier_calls(&self) -> usize {
        self.classifier_calls.load(Ordering::SeqCst)
    }

    pub fn classifier_closes(&self) -> usize {
        self.classifier_closes.load(Ordering::SeqCst)
    }
}

/// Detector returning a fixed list of detections.
#[derive(Debug)]
pub struct MockDetector {
    detections: Vec<Detection>,
    input_size: u32,
    delay: Option<Duration>,
    stats: Arc<MockStats>,
}

impl ObjectDetector for MockDetector {
    fn recognize_image(&self, _image: &RgbImage) -> Result<Vec<Detection>> {
        self.stats.detector_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(self.detections.clone())
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }
}

/// Classifier naming the dominant channel of the crop's centre pixel:
/// `red`, `green`, `blue` or `other`.
#[derive(Debug)]
pub struct ColorClassifier {
    closed: AtomicBool,
    stats: Arc<MockStats>,
}

impl ColorClassifier {
    pub fn new(stats: Arc<MockStats>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            stats,
        }
    }
}

pub fn dominant_color(image: &RgbImage) -> &'static str {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return "other";
    }
    let [r, g, b] = image.get_pixel(width / 2, height / 2).0;
    if r > g && r > b {
        "red"
    } else if g > r && g > b {
        "green"
    } else if b > r && b > g {
        "blue"
    } else {
        "other"
    }
}

impl ImageClassifier for ColorClassifier {
    fn recognize_image(
        &self,
        image: &RgbImage,
        _sensor_orientation: i32,
    ) -> Result<Vec<Classification>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClassifyError::model_unavailable("classifier"));
        }
        self.stats.classifier_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            Classification::new("0", dominant_color(image), 0.9),
            Classification::new("1", "other", 0.1),
        ])
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.classifier_closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Factory producing [`MockDetector`] and [`ColorClassifier`] instances.
#[derive(Debug, Default)]
pub struct MockModelFactory {
    detections: Vec<Detection>,
    detector_delay: Option<Duration>,
    detector_input_size: Option<u32>,
    fail_detector: bool,
    fail_classifier: bool,
    stats: Arc<MockStats>,
}

impl MockModelFactory {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            ..Self::default()
        }
    }

    pub const fn with_detector_delay(mut self, delay: Duration) -> Self {
        self.detector_delay = Some(delay);
        self
    }

    /// Report `size` as the detector input instead of the configured one.
    pub const fn with_detector_input_size(mut self, size: u32) -> Self {
        self.detector_input_size = Some(size);
        self
    }

    pub const fn failing_detector(mut self) -> Self {
        self.fail_detector = true;
        self
    }

    pub const fn failing_classifier(mut self) -> Self {
        self.fail_classifier = true;
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

fn missing_asset(model: &str, path: &std::path::Path) -> ClassifyError {
    ClassifyError::ModelLoad {
        model: model.to_string(),
        path: path.to_path_buf(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "mock asset missing",
        )),
    }
}

impl ModelFactory for MockModelFactory {
    fn create_detector(&self, spec: &DetectorSpec) -> Result<Arc<dyn ObjectDetector>> {
        if self.fail_detector {
            return Err(missing_asset("detector", &spec.model_path));
        }
        self.stats.detector_creations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockDetector {
            detections: self.detections.clone(),
            input_size: self.detector_input_size.unwrap_or(spec.input_size),
            delay: self.detector_delay,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn create_classifier(&self, spec: &ClassifierSpec) -> Result<Arc<dyn ImageClassifier>> {
        if self.fail_classifier {
            return Err(missing_asset("classifier", &spec.model_path));
        }
        self.stats.classifier_creations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ColorClassifier::new(Arc::clone(&self.stats))))
    }
}
