use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{ClassifyError, Result};
use crate::traits::{ClassifierSpec, DetectorSpec};

/// Square input edge of the SSD detector.
pub const DETECTOR_INPUT_SIZE: u32 = 300;
/// Square input edge of the crop fed to the classifier.
pub const CLASSIFIER_INPUT_SIZE: u32 = 224;
/// Minimum detector score for a box to be classified.
pub const MINIMUM_CONFIDENCE: f32 = 0.5;
pub const MAINTAIN_ASPECT: bool = false;
pub const DETECTOR_MODEL_FILE: &str = "2c_4000.onnx";
pub const DETECTOR_LABELS_FILE: &str = "labelmap_med.txt";

/// Classifier model family and numeric format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ModelVariant {
    #[default]
    FloatMobilenet,
    QuantizedMobilenet,
    FloatEfficientnet,
    QuantizedEfficientnet,
}

impl ModelVariant {
    pub const fn is_quantized(self) -> bool {
        matches!(self, Self::QuantizedMobilenet | Self::QuantizedEfficientnet)
    }

    pub const fn default_model_file(self) -> &'static str {
        match self {
            Self::FloatMobilenet => "mobilenet_v1_1.0_224.onnx",
            Self::QuantizedMobilenet => "mobilenet_v1_1.0_224_quant.onnx",
            Self::FloatEfficientnet => "efficientnet-lite0-fp32.onnx",
            Self::QuantizedEfficientnet => "efficientnet-lite0-int8.onnx",
        }
    }

    /// MobileNet label files start with a background class, EfficientNet ones do not.
    pub const fn default_labels_file(self) -> &'static str {
        match self {
            Self::FloatMobilenet | Self::QuantizedMobilenet => "labels.txt",
            Self::FloatEfficientnet | Self::QuantizedEfficientnet => {
                "labels_without_background.txt"
            }
        }
    }

    /// `(mean, std)` applied to each 0-255 channel value of a float model input.
    pub const fn normalization(self) -> (f32, f32) {
        match self {
            Self::FloatMobilenet => (127.5, 127.5),
            Self::FloatEfficientnet => (127.0, 128.0),
            Self::QuantizedMobilenet | Self::QuantizedEfficientnet => (0.0, 1.0),
        }
    }
}

/// Execution device for ONNX Runtime sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
    TensorRt,
}

/// Which qualifying detection supplies the final label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LabelSelection {
    /// Every classified detection overwrites the label; the last one in
    /// detector output order wins.
    #[default]
    LastQualifying,
    /// The classified detection with the highest detector confidence wins.
    HighestConfidence,
}

/// Settings that force the classifier to be rebuilt when they change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelSettings {
    pub variant: ModelVariant,
    pub device: Device,
    pub num_threads: Option<usize>,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Image files or directories to classify
    pub inputs: Vec<PathBuf>,

    /// Directory holding model and label files
    #[arg(short, long, default_value = "assets")]
    pub assets_dir: PathBuf,

    #[arg(long, default_value = DETECTOR_MODEL_FILE)]
    pub detector_model: PathBuf,

    #[arg(long, default_value = DETECTOR_LABELS_FILE)]
    pub detector_labels: PathBuf,

    #[arg(long, default_value_t = DETECTOR_INPUT_SIZE)]
    pub detector_input_size: u32,

    #[arg(long, default_value_t = false)]
    pub detector_quantized: bool,

    /// Defaults to the file matching the model variant
    #[arg(long)]
    pub classifier_model: Option<PathBuf>,

    /// Defaults to the file matching the model variant
    #[arg(long)]
    pub classifier_labels: Option<PathBuf>,

    #[arg(long, default_value_t = CLASSIFIER_INPUT_SIZE)]
    pub classifier_input_size: u32,

    #[arg(short = 'c', long, default_value_t = MINIMUM_CONFIDENCE)]
    pub min_confidence: f32,

    #[arg(long, default_value_t = MAINTAIN_ASPECT)]
    pub maintain_aspect: bool,

    #[arg(short, long, value_enum, default_value_t = ModelVariant::default())]
    pub model: ModelVariant,

    #[arg(long, value_enum, default_value_t = Device::default())]
    pub device: Device,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short = 't', long)]
    pub num_threads: Option<usize>,

    /// Clockwise rotation of the camera sensor, in degrees
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub sensor_orientation: i32,

    #[arg(long, value_enum, default_value_t = LabelSelection::default())]
    pub selection: LabelSelection,

    #[arg(long, default_value_t = 30_000)]
    pub inference_timeout_ms: u64,

    /// Write detector frames with the qualifying boxes drawn on them
    #[arg(long)]
    pub annotated_output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            assets_dir: PathBuf::from("assets"),
            detector_model: PathBuf::from(DETECTOR_MODEL_FILE),
            detector_labels: PathBuf::from(DETECTOR_LABELS_FILE),
            detector_input_size: DETECTOR_INPUT_SIZE,
            detector_quantized: false,
            classifier_model: None,
            classifier_labels: None,
            classifier_input_size: CLASSIFIER_INPUT_SIZE,
            min_confidence: MINIMUM_CONFIDENCE,
            maintain_aspect: MAINTAIN_ASPECT,
            model: ModelVariant::default(),
            device: Device::default(),
            device_id: 0,
            num_threads: None,
            sensor_orientation: 0,
            selection: LabelSelection::default(),
            inference_timeout_ms: 30_000,
            annotated_output: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ClassifyError::validation(
                "min_confidence",
                format!("must be within [0, 1], got {}", self.min_confidence),
            ));
        }
        if self.detector_input_size == 0 {
            return Err(ClassifyError::validation(
                "detector_input_size",
                "must be greater than zero",
            ));
        }
        if self.classifier_input_size == 0 {
            return Err(ClassifyError::validation(
                "classifier_input_size",
                "must be greater than zero",
            ));
        }
        if self.sensor_orientation % 90 != 0 {
            return Err(ClassifyError::validation(
                "sensor_orientation",
                format!("must be a multiple of 90, got {}", self.sensor_orientation),
            ));
        }
        if self.num_threads == Some(0) {
            return Err(ClassifyError::validation(
                "num_threads",
                "must be greater than zero when set",
            ));
        }
        if self.inference_timeout_ms == 0 {
            return Err(ClassifyError::validation(
                "inference_timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub const fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub const fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            variant: self.model,
            device: self.device,
            num_threads: self.num_threads,
        }
    }

    pub fn detector_spec(&self) -> DetectorSpec {
        DetectorSpec {
            model_path: self.asset_path(&self.detector_model),
            labels_path: self.asset_path(&self.detector_labels),
            input_size: self.detector_input_size,
            is_quantized: self.detector_quantized,
        }
    }

    /// Classifier files for `settings`, falling back to the variant's default
    /// file names when none were configured.
    pub fn classifier_spec(&self, settings: ModelSettings) -> ClassifierSpec {
        let model = self
            .classifier_model
            .clone()
            .unwrap_or_else(|| PathBuf::from(settings.variant.default_model_file()));
        let labels = self
            .classifier_labels
            .clone()
            .unwrap_or_else(|| PathBuf::from(settings.variant.default_labels_file()));
        ClassifierSpec {
            model_path: self.asset_path(&model),
            labels_path: self.asset_path(&labels),
            input_size: self.classifier_input_size,
            device_id: self.device_id,
            settings,
        }
    }

    fn asset_path(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.assets_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = Config::default();
        assert_eq!(config.detector_input_size, 300);
        assert_eq!(config.classifier_input_size, 224);
        assert_eq!(config.min_confidence, 0.5);
        assert!(!config.maintain_aspect);
        assert_eq!(config.selection, LabelSelection::LastQualifying);
        assert_eq!(config.inference_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_matches_default() {
        let parsed = Config::try_parse_from(["med-classify", "photo.jpg"]).unwrap();
        let default = Config::default();
        assert_eq!(parsed.inputs, vec![PathBuf::from("photo.jpg")]);
        assert_eq!(parsed.detector_model, default.detector_model);
        assert_eq!(parsed.min_confidence, default.min_confidence);
        assert_eq!(parsed.model_settings(), default.model_settings());
    }

    #[test]
    fn test_parse_overrides() {
        let parsed = Config::try_parse_from([
            "med-classify",
            "--model",
            "quantized-efficientnet",
            "--device",
            "gpu",
            "-t",
            "4",
            "--selection",
            "highest-confidence",
            "--sensor-orientation",
            "-90",
            "dir",
        ])
        .unwrap();
        assert_eq!(parsed.model, ModelVariant::QuantizedEfficientnet);
        assert_eq!(parsed.device, Device::Gpu);
        assert_eq!(parsed.num_threads, Some(4));
        assert_eq!(parsed.selection, LabelSelection::HighestConfidence);
        assert_eq!(parsed.sensor_orientation, -90);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            min_confidence: 1.5,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ClassifyError::Validation { field, .. }) if field == "min_confidence"
        ));

        let config = Config {
            sensor_orientation: 45,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            num_threads: Some(0),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_specs_resolve_against_assets_dir() {
        let config = Config {
            assets_dir: PathBuf::from("/opt/models"),
            ..Config::default()
        };

        let detector = config.detector_spec();
        assert_eq!(detector.model_path, PathBuf::from("/opt/models/2c_4000.onnx"));
        assert_eq!(
            detector.labels_path,
            PathBuf::from("/opt/models/labelmap_med.txt")
        );
        assert_eq!(detector.input_size, 300);

        let settings = ModelSettings {
            variant: ModelVariant::FloatEfficientnet,
            ..ModelSettings::default()
        };
        let classifier = config.classifier_spec(settings);
        assert_eq!(
            classifier.model_path,
            PathBuf::from("/opt/models/efficientnet-lite0-fp32.onnx")
        );
        assert_eq!(
            classifier.labels_path,
            PathBuf::from("/opt/models/labels_without_background.txt")
        );
    }

    #[test]
    fn test_variant_properties() {
        assert!(!ModelVariant::FloatMobilenet.is_quantized());
        assert!(ModelVariant::QuantizedMobilenet.is_quantized());
        assert_eq!(ModelVariant::FloatMobilenet.normalization(), (127.5, 127.5));
        assert_eq!(ModelVariant::FloatEfficientnet.normalization(), (127.0, 128.0));
    }
}
