//! Detect-then-classify orchestration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use image::{imageops, imageops::FilterType, DynamicImage, Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{Config, LabelSelection, ModelSettings};
use crate::errors::{ClassifyError, Result};
use crate::recognition::{format_detections, BoundingBox, Classification, Detection};
use crate::traits::{ImageClassifier, ModelFactory, ObjectDetector};
use crate::transform::prepare_frame;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_STROKE_WIDTH: u32 = 2;

pub type ReadyCallback = Box<dyn Fn() + Send + Sync>;

/// A detection that cleared the confidence threshold.
#[derive(Debug, Clone)]
pub struct ClassifiedRegion {
    /// The detection as reported, location in detector space.
    pub detection: Detection,
    /// Location mapped back to the input image and clamped to its bounds.
    pub frame_location: BoundingBox,
    /// Empty when no classifier was available or the crop was empty.
    pub classifications: Vec<Classification>,
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub invocation: u64,
    pub label: String,
    /// Raw detector output, in model order.
    pub detections: Vec<Detection>,
    pub regions: Vec<ClassifiedRegion>,
    /// Detector-space frame with the qualifying boxes drawn on it.
    pub annotated: RgbImage,
}

#[derive(Default)]
struct ModelHandles {
    detector: Option<Arc<dyn ObjectDetector>>,
    classifier: Option<Arc<dyn ImageClassifier>>,
    classifier_settings: Option<ModelSettings>,
}

/// Marks a call as in flight until dropped.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Runs the detector over a whole image and the classifier over each
/// qualifying region.
///
/// At most one image is processed at a time. A call arriving while another is
/// in flight is dropped: it fires the ready callback and returns `Ok(None)`.
/// Model handles are created on first use and kept until the model settings
/// change or the service is closed.
pub struct ClassificationService<F> {
    factory: F,
    config: Config,
    settings: Mutex<ModelSettings>,
    handles: Mutex<ModelHandles>,
    computing: AtomicBool,
    timestamp: AtomicU64,
    ready_callback: Option<ReadyCallback>,
}

impl<F: ModelFactory> ClassificationService<F> {
    pub fn new(factory: F, config: Config) -> Result<Self> {
        config.validate()?;
        let settings = config.model_settings();
        Ok(Self {
            factory,
            config,
            settings: Mutex::new(settings),
            handles: Mutex::new(ModelHandles::default()),
            computing: AtomicBool::new(false),
            timestamp: AtomicU64::new(0),
            ready_callback: None,
        })
    }

    /// Called whenever an image is dropped because another is in flight.
    pub fn with_ready_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.ready_callback = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model_settings(&self) -> ModelSettings {
        *self.settings.lock()
    }

    /// Change the classifier settings. The classifier is rebuilt on the next call.
    pub fn set_model_settings(&self, settings: ModelSettings) {
        let mut current = self.settings.lock();
        if *current != settings {
            debug!(?settings, "updating model settings");
            *current = settings;
        }
    }

    pub fn is_computing(&self) -> bool {
        self.computing.load(Ordering::Acquire)
    }

    /// Release every cached model handle.
    pub fn close(&self) {
        let mut handles = self.handles.lock();
        if let Some(classifier) = handles.classifier.take() {
            debug!("closing classifier");
            classifier.close();
        }
        handles.detector = None;
        handles.classifier_settings = None;
    }

    /// Classify `image` and return its label, or `None` when the call was
    /// skipped because another image is still being processed.
    pub async fn process_image(&self, image: &DynamicImage) -> Result<Option<String>> {
        Ok(self.analyze_image(image).await?.map(|report| report.label))
    }

    /// Like [`process_image`](Self::process_image) but returns the full report.
    pub async fn analyze_image(&self, image: &DynamicImage) -> Result<Option<AnalysisReport>> {
        let invocation = self.timestamp.fetch_add(1, Ordering::SeqCst) + 1;

        let Some(_guard) = InFlightGuard::try_acquire(&self.computing) else {
            debug!(invocation, "previous image still in flight, dropping");
            self.ready_for_next_image();
            return Ok(None);
        };

        let image = Arc::new(image.to_rgb8());
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(ClassifyError::InvalidImage { width, height });
        }

        let (detector, classifier) = self.ensure_models();
        let detector = detector.ok_or_else(|| ClassifyError::model_unavailable("detector"))?;

        info!(invocation, "preparing image for detection");
        let prepared = prepare_frame(
            &image,
            detector.input_size(),
            0,
            self.config.maintain_aspect,
        )?;

        info!(invocation, "running detection");
        let frame = Arc::new(prepared.frame);
        let detections = {
            let frame = Arc::clone(&frame);
            self.run_bounded("detection", move || detector.recognize_image(&frame))
                .await?
        };
        debug!(invocation, count = detections.len(), "detections received");

        let mut label = format_detections(&detections);
        let mut annotated = RgbImage::clone(&frame);
        let mut regions = Vec::new();
        let mut best_confidence: Option<f32> = None;

        for detection in &detections {
            let Some(location) = detection.location else {
                continue;
            };
            let confidence = detection.confidence;
            if confidence.is_nan() || confidence < self.config.min_confidence {
                continue;
            }

            draw_detection(&mut annotated, &location);
            let frame_location = prepared
                .crop_to_frame
                .map_rect(&location)
                .clamp_to(width, height);

            let classifications = match &classifier {
                Some(classifier) => {
                    self.classify_region(invocation, &image, &frame_location, classifier)
                        .await?
                }
                None => Vec::new(),
            };

            if let Some(top) = classifications.first() {
                let wins = match self.config.selection {
                    LabelSelection::LastQualifying => true,
                    LabelSelection::HighestConfidence => {
                        best_confidence.map_or(true, |best| detection.confidence > best)
                    }
                };
                if wins {
                    label = top.title.clone();
                    best_confidence = Some(detection.confidence);
                }
            }

            regions.push(ClassifiedRegion {
                detection: detection.clone(),
                frame_location,
                classifications,
            });
        }

        info!(invocation, label = %label, "image processed");
        Ok(Some(AnalysisReport {
            invocation,
            label,
            detections,
            regions,
            annotated,
        }))
    }

    async fn classify_region(
        &self,
        invocation: u64,
        image: &RgbImage,
        location: &BoundingBox,
        classifier: &Arc<dyn ImageClassifier>,
    ) -> Result<Vec<Classification>> {
        debug!(invocation, location = %location, "cropped location");
        let Some((x, y, w, h)) = location.pixel_region() else {
            warn!(invocation, location = %location, "detection has no area inside the image");
            return Ok(Vec::new());
        };

        let size = self.config.classifier_input_size;
        let crop = imageops::crop_imm(image, x, y, w, h).to_image();
        let crop = imageops::resize(&crop, size, size, FilterType::Nearest);

        let classifier = Arc::clone(classifier);
        let orientation = self.config.sensor_orientation;
        let classifications = self
            .run_bounded("classification", move || {
                classifier.recognize_image(&crop, orientation)
            })
            .await?;
        if classifications.is_empty() {
            warn!(invocation, "classifier returned no labels");
        }
        Ok(classifications)
    }

    /// Return the cached handles, creating whichever is missing or stale.
    fn ensure_models(
        &self,
    ) -> (
        Option<Arc<dyn ObjectDetector>>,
        Option<Arc<dyn ImageClassifier>>,
    ) {
        let settings = self.model_settings();
        let mut handles = self.handles.lock();

        if handles.detector.is_none() {
            match self.factory.create_detector(&self.config.detector_spec()) {
                Ok(detector) => handles.detector = Some(detector),
                Err(e) => error!(error = %e, "failed to initialize detector"),
            }
        }

        if handles.classifier.is_none() || handles.classifier_settings != Some(settings) {
            if let Some(previous) = handles.classifier.take() {
                debug!("closing classifier");
                previous.close();
            }
            debug!(
                model = ?settings.variant,
                device = ?settings.device,
                num_threads = ?settings.num_threads,
                "creating classifier"
            );
            match self
                .factory
                .create_classifier(&self.config.classifier_spec(settings))
            {
                Ok(classifier) => {
                    handles.classifier = Some(classifier);
                    handles.classifier_settings = Some(settings);
                }
                Err(e) => {
                    error!(error = %e, "failed to create classifier");
                    handles.classifier_settings = None;
                }
            }
        }

        (handles.detector.clone(), handles.classifier.clone())
    }

    /// Run a blocking model call on the blocking pool, bounded by the
    /// configured inference timeout.
    async fn run_bounded<T, Op>(&self, operation: &str, op: Op) -> Result<T>
    where
        T: Send + 'static,
        Op: FnOnce() -> Result<T> + Send + 'static,
    {
        let limit = self.config.inference_timeout();
        match timeout(limit, tokio::task::spawn_blocking(op)).await {
            Ok(joined) => joined?,
            Err(_) => {
                error!(operation, ?limit, "model invocation timed out");
                Err(ClassifyError::Timeout {
                    operation: operation.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    fn ready_for_next_image(&self) {
        if let Some(callback) = &self.ready_callback {
            callback();
        }
    }
}

impl<F> Drop for ClassificationService<F> {
    fn drop(&mut self) {
        if let Some(classifier) = self.handles.get_mut().classifier.take() {
            classifier.close();
        }
    }
}

/// Outline `location` on `canvas`. The box is clamped to the canvas first, so
/// detector output far outside the frame cannot overflow the pixel math.
fn draw_detection(canvas: &mut RgbImage, location: &BoundingBox) {
    let (canvas_width, canvas_height) = canvas.dimensions();
    let clamped = location.clamp_to(canvas_width, canvas_height);
    if clamped.width() <= 0.0 || clamped.height() <= 0.0 {
        return;
    }

    let left = clamped.left.round() as i32;
    let top = clamped.top.round() as i32;
    let width = clamped.width().round() as u32;
    let height = clamped.height().round() as u32;

    for inset in 0..BOX_STROKE_WIDTH {
        let w = width.saturating_sub(2 * inset);
        let h = height.saturating_sub(2 * inset);
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at(left + inset as i32, top + inset as i32).of_size(w, h);
        draw_hollow_rect_mut(canvas, rect, BOX_COLOR);
    }
}
