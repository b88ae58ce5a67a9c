use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::prelude::*;
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
    },
    session::{builder::SessionBuilder, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::{Device, ModelVariant},
    errors::{ClassifyError, Result},
    recognition::{BoundingBox, Classification, Detection},
    traits::{ClassifierSpec, DetectorSpec, ImageClassifier, ModelFactory, ObjectDetector},
};

/// Maximum number of boxes an SSD export reports.
pub const NUM_DETECTIONS: usize = 10;
/// Number of labels a classifier returns.
pub const MAX_RESULTS: usize = 3;

const SSD_IMAGE_MEAN: f32 = 128.0;
const SSD_IMAGE_STD: f32 = 128.0;
/// SSD label maps start with a background entry that class ids skip.
const SSD_LABEL_OFFSET: usize = 1;
const QUANTIZED_PROBABILITY_SCALE: f32 = 255.0;

/// Read a label file, one label per line.
pub fn read_labels(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|e| ClassifyError::ModelLoad {
        model: "label list".to_string(),
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    Ok(content.lines().map(|l| l.trim_end().to_string()).collect())
}

fn execution_providers(device: Device, device_id: i32) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Cpu => Vec::new(),
        Device::Gpu => vec![CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()],
        Device::TensorRt => vec![
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
        ],
    }
}

fn build_session(
    model: &str,
    model_path: &Path,
    device: Device,
    device_id: i32,
    num_threads: Option<usize>,
) -> Result<Session> {
    let load_error = |source: Box<dyn std::error::Error + Send + Sync>| ClassifyError::ModelLoad {
        model: model.to_string(),
        path: model_path.to_path_buf(),
        source,
    };

    if !model_path.exists() {
        return Err(load_error(Box::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "model file does not exist",
        ))));
    }

    let mut builder = SessionBuilder::new()
        .map_err(|e| load_error(Box::new(e)))?
        .with_execution_providers(execution_providers(device, device_id))
        .map_err(|e| load_error(Box::new(e)))?;
    if let Some(threads) = num_threads {
        builder = builder
            .with_intra_threads(threads)
            .map_err(|e| load_error(Box::new(e)))?;
    }
    builder
        .commit_from_file(model_path)
        .map_err(|e| load_error(Box::new(e)))
}

fn first_input_name(session: &Session) -> Result<String> {
    session
        .inputs
        .first()
        .map(|input| input.name.clone())
        .ok_or_else(|| ClassifyError::Model {
            operation: "model input lookup".to_string(),
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "model declares no inputs",
            )),
        })
}

/// NHWC float tensor with `(v - mean) / std` applied per channel value.
pub fn nhwc_tensor_f32(image: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    Array4::from_shape_fn(
        (1, height as usize, width as usize, 3),
        |(_, y, x, c)| (image.get_pixel(x as u32, y as u32)[c] as f32 - mean) / std,
    )
}

/// NHWC tensor of raw 8-bit channel values.
pub fn nhwc_tensor_u8(image: &RgbImage) -> Result<Array4<u8>> {
    let (width, height) = image.dimensions();
    Ok(Array4::from_shape_vec(
        (1, height as usize, width as usize, 3),
        image.as_raw().clone(),
    )?)
}

/// Turn the four SSD output tensors into detections in input-pixel space.
///
/// `locations` holds `ymin, xmin, ymax, xmax` per box, normalised to `[0, 1]`.
pub fn decode_ssd_outputs(
    locations: &[f32],
    classes: &[f32],
    scores: &[f32],
    num_detections: usize,
    labels: &[String],
    input_size: u32,
) -> Vec<Detection> {
    let size = input_size as f32;
    let count = num_detections
        .min(NUM_DETECTIONS)
        .min(scores.len())
        .min(classes.len())
        .min(locations.len() / 4);

    (0..count)
        .map(|i| {
            let b = &locations[i * 4..i * 4 + 4];
            let location = BoundingBox::new(b[1] * size, b[0] * size, b[3] * size, b[2] * size);
            let class_id = classes[i].max(0.0) as usize;
            let title = labels.get(class_id + SSD_LABEL_OFFSET).cloned();
            Detection::new(i.to_string(), title, scores[i], class_id, Some(location))
        })
        .collect()
}

/// The `k` best labels by score, highest first. Ties keep label order.
pub fn top_k_classifications(
    probabilities: &[f32],
    labels: &[String],
    k: usize,
) -> Vec<Classification> {
    let mut ranked: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
        .into_iter()
        .take(k)
        .map(|(index, score)| {
            let title = labels
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("class {index}"));
            Classification::new(index.to_string(), title, score)
        })
        .collect()
}

/// Centre crop to a square of the shorter edge.
pub fn center_crop_square(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let edge = width.min(height);
    if width == height {
        return image.clone();
    }
    imageops::crop_imm(image, (width - edge) / 2, (height - edge) / 2, edge, edge).to_image()
}

/// Rotate clockwise by a multiple of 90 degrees; other angles leave the image untouched.
pub fn rotate_by_orientation(image: &RgbImage, degrees: i32) -> RgbImage {
    match degrees.rem_euclid(360) {
        90 => imageops::rotate90(image),
        180 => imageops::rotate180(image),
        270 => imageops::rotate270(image),
        _ => image.clone(),
    }
}

/// SSD object detector running on ONNX Runtime.
pub struct SsdDetector {
    input_size: u32,
    is_quantized: bool,
    labels: Vec<String>,
    input_name: String,
    session: Mutex<Session>,
}

impl SsdDetector {
    pub fn new(spec: &DetectorSpec) -> Result<Self> {
        let labels = read_labels(&spec.labels_path)?;
        let session = build_session("detector", &spec.model_path, Device::Cpu, 0, None)?;
        let input_name = first_input_name(&session)?;
        debug!(
            model = %spec.model_path.display(),
            labels = labels.len(),
            input_size = spec.input_size,
            "detector loaded"
        );

        Ok(Self {
            input_size: spec.input_size,
            is_quantized: spec.is_quantized,
            labels,
            input_name,
            session: Mutex::new(session),
        })
    }
}

impl ObjectDetector for SsdDetector {
    fn recognize_image(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let resized;
        let image = if image.dimensions() == (self.input_size, self.input_size) {
            image
        } else {
            resized = imageops::resize(
                image,
                self.input_size,
                self.input_size,
                FilterType::Triangle,
            );
            &resized
        };

        let mut session = self.session.lock();
        let outputs = if self.is_quantized {
            let tensor = nhwc_tensor_u8(image)?;
            session.run(
                ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&tensor)?],
            )?
        } else {
            let tensor = nhwc_tensor_f32(image, SSD_IMAGE_MEAN, SSD_IMAGE_STD);
            session.run(
                ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&tensor)?],
            )?
        };

        let locations: Vec<f32> = outputs[0].try_extract_array::<f32>()?.iter().copied().collect();
        let classes: Vec<f32> = outputs[1].try_extract_array::<f32>()?.iter().copied().collect();
        let scores: Vec<f32> = outputs[2].try_extract_array::<f32>()?.iter().copied().collect();
        let num_detections = outputs[3]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0)
            .max(0.0) as usize;

        Ok(decode_ssd_outputs(
            &locations,
            &classes,
            &scores,
            num_detections,
            &self.labels,
            self.input_size,
        ))
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }
}

/// A model session that can be closed while an inference still holds it.
///
/// `close` never waits for the lock. When a run is in progress the slot is
/// only marked closed, and that run drops the session once it returns.
struct SessionSlot<T> {
    session: Mutex<Option<T>>,
    closed: AtomicBool,
}

impl<T> SessionSlot<T> {
    fn new(session: T) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            closed: AtomicBool::new(false),
        }
    }

    fn run<R>(&self, model: &str, op: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guard = self.session.lock();
        if self.closed.load(Ordering::Acquire) {
            guard.take();
        }
        let session = guard
            .as_mut()
            .ok_or_else(|| ClassifyError::model_unavailable(model))?;

        let result = op(session);
        if self.closed.load(Ordering::Acquire) && guard.take().is_some() {
            debug!(model, "session released after in-flight run");
        }
        result
    }

    /// Returns true when the session was released immediately.
    fn close(&self) -> bool {
        self.closed.store(true, Ordering::Release);
        match self.session.try_lock() {
            Some(mut guard) => guard.take().is_some(),
            None => false,
        }
    }
}

/// MobileNet / EfficientNet image classifier running on ONNX Runtime.
pub struct MobileNetClassifier {
    variant: ModelVariant,
    input_size: u32,
    labels: Vec<String>,
    input_name: String,
    session: SessionSlot<Session>,
}

impl MobileNetClassifier {
    pub fn new(spec: &ClassifierSpec) -> Result<Self> {
        let labels = read_labels(&spec.labels_path)?;
        let settings = spec.settings;
        let session = build_session(
            "classifier",
            &spec.model_path,
            settings.device,
            spec.device_id,
            settings.num_threads,
        )?;
        let input_name = first_input_name(&session)?;

        Ok(Self {
            variant: settings.variant,
            input_size: spec.input_size,
            labels,
            input_name,
            session: SessionSlot::new(session),
        })
    }

    fn prepare(&self, image: &RgbImage, sensor_orientation: i32) -> RgbImage {
        let square = center_crop_square(image);
        let rotated = rotate_by_orientation(&square, sensor_orientation);
        if rotated.dimensions() == (self.input_size, self.input_size) {
            rotated
        } else {
            imageops::resize(
                &rotated,
                self.input_size,
                self.input_size,
                FilterType::Triangle,
            )
        }
    }
}

impl ImageClassifier for MobileNetClassifier {
    fn recognize_image(
        &self,
        image: &RgbImage,
        sensor_orientation: i32,
    ) -> Result<Vec<Classification>> {
        let input = self.prepare(image, sensor_orientation);

        let variant = self.variant;
        let input_name = self.input_name.as_str();
        let probabilities = self.session.run("classifier", |session| {
            let probabilities: Vec<f32> = if variant.is_quantized() {
                let tensor = nhwc_tensor_u8(&input)?;
                let outputs = session
                    .run(ort::inputs![input_name => TensorRef::from_array_view(&tensor)?])?;
                let scores = outputs[0].try_extract_array::<u8>()?;
                scores
                    .iter()
                    .map(|&v| v as f32 / QUANTIZED_PROBABILITY_SCALE)
                    .collect()
            } else {
                let (mean, std) = variant.normalization();
                let tensor = nhwc_tensor_f32(&input, mean, std);
                let outputs = session
                    .run(ort::inputs![input_name => TensorRef::from_array_view(&tensor)?])?;
                let scores = outputs[0].try_extract_array::<f32>()?;
                scores.iter().copied().collect()
            };
            Ok(probabilities)
        })?;

        Ok(top_k_classifications(&probabilities, &self.labels, MAX_RESULTS))
    }

    fn close(&self) {
        if self.session.close() {
            debug!("classifier session released");
        } else {
            debug!("classifier closed, session released when the current run ends");
        }
    }
}

/// Builds ONNX Runtime backed models.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtModelFactory;

impl ModelFactory for OrtModelFactory {
    fn create_detector(&self, spec: &DetectorSpec) -> Result<Arc<dyn ObjectDetector>> {
        Ok(Arc::new(SsdDetector::new(spec)?))
    }

    fn create_classifier(&self, spec: &ClassifierSpec) -> Result<Arc<dyn ImageClassifier>> {
        Ok(Arc::new(MobileNetClassifier::new(spec)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_read_labels() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "???")?;
        writeln!(file, "capsule  ")?;
        writeln!(file, "tablet")?;

        let labels = read_labels(file.path())?;
        assert_eq!(labels, vec!["???", "capsule", "tablet"]);
        Ok(())
    }

    #[test]
    fn test_missing_labels_is_model_load_error() {
        let err = read_labels(Path::new("/nonexistent/labelmap.txt")).unwrap_err();
        assert!(matches!(err, ClassifyError::ModelLoad { .. }));
    }

    #[test]
    fn test_missing_model_file_is_model_load_error() {
        let result = build_session(
            "detector",
            Path::new("/nonexistent/model.onnx"),
            Device::Cpu,
            0,
            None,
        );
        assert!(matches!(result, Err(ClassifyError::ModelLoad { model, .. }) if model == "detector"));
    }

    #[test]
    fn test_decode_ssd_outputs() {
        let locations = [0.1, 0.2, 0.5, 0.6, 0.0, 0.0, 1.0, 1.0, 0.3, 0.3, 0.4, 0.4];
        let classes = [0.0, 1.0, 0.0];
        let scores = [0.9, 0.4, 0.2];
        let labels = labels(&["???", "capsule", "tablet"]);

        let detections = decode_ssd_outputs(&locations, &classes, &scores, 2, &labels, 300);

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].id, "0");
        assert_eq!(detections[0].title.as_deref(), Some("capsule"));
        assert_eq!(detections[0].class_id, 0);
        let location = detections[0].location.unwrap();
        assert!((location.left - 60.0).abs() < 1e-3);
        assert!((location.top - 30.0).abs() < 1e-3);
        assert!((location.right - 180.0).abs() < 1e-3);
        assert!((location.bottom - 150.0).abs() < 1e-3);
        assert_eq!(detections[1].title.as_deref(), Some("tablet"));
    }

    #[test]
    fn test_decode_ssd_outputs_caps_count() {
        let locations = vec![0.0; 4 * 20];
        let classes = vec![0.0; 20];
        let scores = vec![0.5; 20];

        let detections = decode_ssd_outputs(&locations, &classes, &scores, 20, &[], 300);
        assert_eq!(detections.len(), NUM_DETECTIONS);
        assert!(detections.iter().all(|d| d.title.is_none()));
    }

    #[test]
    fn test_top_k_classifications() {
        let labels = labels(&["background", "aspirin", "ibuprofen", "paracetamol"]);
        let results = top_k_classifications(&[0.05, 0.2, 0.7, 0.2], &labels, MAX_RESULTS);

        let titles: Vec<_> = results.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["ibuprofen", "aspirin", "paracetamol"]);
        assert_eq!(results[0].id, "2");
        assert_eq!(results[0].score, 0.7);
    }

    #[test]
    fn test_nhwc_tensors() -> Result<()> {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(1, 0, Rgb([255, 128, 0]));

        let float = nhwc_tensor_f32(&image, 127.5, 127.5);
        assert_eq!(float.shape(), &[1, 1, 2, 3]);
        assert_eq!(float[[0, 0, 0, 0]], -1.0);
        assert_eq!(float[[0, 0, 1, 0]], 1.0);

        let raw = nhwc_tensor_u8(&image)?;
        assert_eq!(raw[[0, 0, 1, 1]], 128);
        Ok(())
    }

    #[test]
    fn test_session_slot_close_releases_idle_session() -> Result<()> {
        let slot = SessionSlot::new(String::from("session"));
        assert_eq!(slot.run("classifier", |s| Ok(s.len()))?, 7);

        assert!(slot.close());
        assert!(matches!(
            slot.run("classifier", |s| Ok(s.len())),
            Err(ClassifyError::ModelUnavailable { model }) if model == "classifier"
        ));
        Ok(())
    }

    #[test]
    fn test_session_slot_close_does_not_wait_for_running_inference() {
        use std::sync::mpsc::channel;

        let slot = Arc::new(SessionSlot::new(String::from("session")));
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel::<()>();

        let running = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                slot.run("classifier", |s| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(s.clone())
                })
            })
        };
        entered_rx.recv().unwrap();

        // returns while the run still holds the lock
        assert!(!slot.close());

        release_tx.send(()).unwrap();
        assert_eq!(running.join().unwrap().unwrap(), "session");
        assert!(slot.session.lock().is_none());
        assert!(slot.run("classifier", |s| Ok(s.len())).is_err());
    }

    #[test]
    fn test_center_crop_square_centres() {
        let mut image = RgbImage::new(6, 2);
        image.put_pixel(2, 0, Rgb([1, 2, 3]));

        let square = center_crop_square(&image);
        assert_eq!(square.dimensions(), (2, 2));
        assert_eq!(square.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_rotate_by_orientation() {
        let mut image = RgbImage::new(3, 1);
        image.put_pixel(0, 0, Rgb([9, 9, 9]));

        let rotated = rotate_by_orientation(&image, 90);
        assert_eq!(rotated.dimensions(), (1, 3));
        assert_eq!(rotated.get_pixel(0, 0), &Rgb([9, 9, 9]));

        let back = rotate_by_orientation(&image, -270);
        assert_eq!(back.dimensions(), (1, 3));
        assert_eq!(rotate_by_orientation(&image, 0), image);
    }
}
