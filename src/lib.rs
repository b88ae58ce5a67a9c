pub mod config;
pub mod errors;
pub mod model;
pub mod recognition;
pub mod service;
pub mod traits;
pub mod transform;

pub mod mocks;

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

pub use config::{Config, Device, LabelSelection, ModelSettings, ModelVariant};
pub use errors::{ClassifyError, Result};
pub use model::{MobileNetClassifier, OrtModelFactory, SsdDetector};
pub use recognition::{format_detections, BoundingBox, Classification, Detection};
pub use service::{AnalysisReport, ClassificationService, ClassifiedRegion};
pub use traits::*;
pub use transform::{prepare_frame, transformation_matrix, Affine2, PreparedFrame};

pub fn is_supported_image_format(path: &Path) -> bool {
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        matches!(
            extension.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp" | "gif" | "tiff"
        )
    } else {
        false
    }
}

/// Expand files and directories into the list of images to classify.
///
/// Files are taken as given; directories are walked recursively and only
/// supported image formats are kept.
pub fn collect_image_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut image_files = Vec::new();

    for input in inputs {
        if input.is_file() {
            image_files.push(input.clone());
        } else if input.is_dir() {
            for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_file() && is_supported_image_format(path) {
                    image_files.push(path.to_path_buf());
                }
            }
        } else {
            return Err(ClassifyError::FileSystem {
                path: input.clone(),
                operation: "input lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input is neither a file nor a directory",
                ),
            });
        }
    }

    image_files.sort();
    Ok(image_files)
}

/// Where the annotated frame for `path` is written.
///
/// Images found under a directory input keep their path relative to that
/// directory; file inputs keep only their file name. The last extension is
/// replaced by `png`.
pub fn annotated_output_path(path: &Path, inputs: &[PathBuf], output_dir: &Path) -> PathBuf {
    let relative = inputs
        .iter()
        .filter(|input| input.is_dir())
        .find_map(|input| path.strip_prefix(input).ok())
        .or_else(|| path.file_name().map(Path::new))
        .unwrap_or(path);

    output_dir.join(relative).with_extension("png")
}
