//! Frame preparation: rescaling an input image to the detector's square input
//! and the affine transforms between the two coordinate spaces.

use image::{imageops, imageops::FilterType, RgbImage};
use tracing::warn;

use crate::errors::{ClassifyError, Result};
use crate::recognition::BoundingBox;

const SINGULAR_EPSILON: f32 = 1e-12;

/// 2D affine transform `[a b tx; c d ty]`.
///
/// Composition helpers follow the post-concatenation convention: `post_*`
/// applies the new operation after the existing ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine2 {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    tx: f32,
    ty: f32,
}

impl Default for Affine2 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine2 {
    pub const fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn post_translate(mut self, dx: f32, dy: f32) -> Self {
        self.tx += dx;
        self.ty += dy;
        self
    }

    pub fn post_scale(mut self, sx: f32, sy: f32) -> Self {
        self.a *= sx;
        self.b *= sx;
        self.tx *= sx;
        self.c *= sy;
        self.d *= sy;
        self.ty *= sy;
        self
    }

    /// Rotate by `degrees` clockwise in image coordinates (y pointing down).
    pub fn post_rotate(self, degrees: i32) -> Self {
        let (sin, cos) = quarter_turn_sin_cos(degrees)
            .unwrap_or_else(|| (degrees as f32).to_radians().sin_cos());
        Self {
            a: cos * self.a - sin * self.c,
            b: cos * self.b - sin * self.d,
            tx: cos * self.tx - sin * self.ty,
            c: sin * self.a + cos * self.c,
            d: sin * self.b + cos * self.d,
            ty: sin * self.tx + cos * self.ty,
        }
    }

    /// Exact algebraic inverse, or `None` for a singular transform.
    pub fn invert(&self) -> Option<Self> {
        let det = self.a * self.d - self.b * self.c;
        if !det.is_finite() || det.abs() < SINGULAR_EPSILON {
            return None;
        }
        let a = self.d / det;
        let b = -self.b / det;
        let c = -self.c / det;
        let d = self.a / det;
        Some(Self {
            a,
            b,
            c,
            d,
            tx: -(a * self.tx + b * self.ty),
            ty: -(c * self.tx + d * self.ty),
        })
    }

    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.b * y + self.tx,
            self.c * x + self.d * y + self.ty,
        )
    }

    /// Map all four corners and return their bounding box.
    pub fn map_rect(&self, rect: &BoundingBox) -> BoundingBox {
        let corners = [
            self.map_point(rect.left, rect.top),
            self.map_point(rect.right, rect.top),
            self.map_point(rect.left, rect.bottom),
            self.map_point(rect.right, rect.bottom),
        ];
        let mut mapped = BoundingBox::new(f32::MAX, f32::MAX, f32::MIN, f32::MIN);
        for (x, y) in corners {
            mapped.left = mapped.left.min(x);
            mapped.top = mapped.top.min(y);
            mapped.right = mapped.right.max(x);
            mapped.bottom = mapped.bottom.max(y);
        }
        mapped
    }
}

fn quarter_turn_sin_cos(degrees: i32) -> Option<(f32, f32)> {
    match degrees.rem_euclid(360) {
        0 => Some((0.0, 1.0)),
        90 => Some((1.0, 0.0)),
        180 => Some((0.0, -1.0)),
        270 => Some((-1.0, 0.0)),
        _ => None,
    }
}

/// Build the transform from a `src_width x src_height` frame to a
/// `dst_width x dst_height` crop, optionally rotating by a multiple of 90
/// degrees around the frame centre.
///
/// With `maintain_aspect` the larger of the two scale factors is used on both
/// axes, so the destination is filled and the overflow cropped. Otherwise X
/// and Y scale independently.
pub fn transformation_matrix(
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
    rotation: i32,
    maintain_aspect: bool,
) -> Result<Affine2> {
    if rotation % 90 != 0 {
        return Err(ClassifyError::validation(
            "rotation",
            format!("must be a multiple of 90, got {rotation}"),
        ));
    }

    let mut matrix = Affine2::identity();
    if rotation != 0 {
        matrix = matrix
            .post_translate(-(src_width as f32) / 2.0, -(src_height as f32) / 2.0)
            .post_rotate(rotation);
    }

    let transpose = (rotation.abs() + 90) % 180 == 0;
    let (in_width, in_height) = if transpose {
        (src_height, src_width)
    } else {
        (src_width, src_height)
    };

    if in_width != dst_width || in_height != dst_height {
        let scale_x = dst_width as f32 / in_width as f32;
        let scale_y = dst_height as f32 / in_height as f32;
        matrix = if maintain_aspect {
            let scale = scale_x.max(scale_y);
            matrix.post_scale(scale, scale)
        } else {
            matrix.post_scale(scale_x, scale_y)
        };
    }

    if rotation != 0 {
        matrix = matrix.post_translate(dst_width as f32 / 2.0, dst_height as f32 / 2.0);
    }

    Ok(matrix)
}

/// An input image brought into detector space.
#[derive(Debug, Clone)]
pub struct PreparedFrame {
    /// The input rescaled to `crop_size x crop_size`.
    pub frame: RgbImage,
    pub crop_size: u32,
    /// Original image coordinates to detector-input coordinates.
    pub frame_to_crop: Affine2,
    /// Detector-input coordinates back to original image coordinates.
    pub crop_to_frame: Affine2,
}

/// Rescale `image` to the detector input size and derive both transforms.
pub fn prepare_frame(
    image: &RgbImage,
    target_size: u32,
    rotation: i32,
    maintain_aspect: bool,
) -> Result<PreparedFrame> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(ClassifyError::InvalidImage { width, height });
    }
    if target_size == 0 {
        return Err(ClassifyError::validation(
            "detector_input_size",
            "must be greater than zero",
        ));
    }

    let frame = imageops::resize(image, target_size, target_size, FilterType::Triangle);
    let crop_size = frame.width().min(frame.height());

    let frame_to_crop =
        transformation_matrix(width, height, crop_size, crop_size, rotation, maintain_aspect)?;
    let crop_to_frame = frame_to_crop.invert().ok_or_else(|| {
        warn!(width, height, "frame transform is not invertible");
        ClassifyError::InvalidImage { width, height }
    })?;

    Ok(PreparedFrame {
        frame,
        crop_size,
        frame_to_crop,
        crop_to_frame,
    })
}
