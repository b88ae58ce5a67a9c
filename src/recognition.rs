use std::fmt;

/// Axis-aligned rectangle in floating point pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Restrict the box to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self {
            left: self.left.max(0.0),
            top: self.top.max(0.0),
            right: self.right.min(width as f32),
            bottom: self.bottom.min(height as f32),
        }
    }

    /// Integer pixel region `(x, y, w, h)` covered by the box, truncating
    /// each coordinate toward zero.
    ///
    /// Returns `None` when the region is empty. The box must already be
    /// clamped to the image it will be cropped from.
    pub fn pixel_region(&self) -> Option<(u32, u32, u32, u32)> {
        let x = self.left.max(0.0) as u32;
        let y = self.top.max(0.0) as u32;
        let w = self.width().max(0.0) as u32;
        let h = self.height().max(0.0) as u32;
        (w > 0 && h > 0).then_some((x, y, w, h))
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RectF({:.1}, {:.1}, {:.1}, {:.1})",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// A region proposed by the object detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Position of the result in the model output.
    pub id: String,
    pub title: Option<String>,
    pub confidence: f32,
    pub class_id: usize,
    /// Box in detector-input coordinates.
    pub location: Option<BoundingBox>,
}

impl Detection {
    pub fn new(
        id: impl Into<String>,
        title: Option<String>,
        confidence: f32,
        class_id: usize,
        location: Option<BoundingBox>,
    ) -> Self {
        Self {
            id: id.into(),
            title,
            confidence,
            class_id,
            location,
        }
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![format!("[{}]", self.id)];
        if let Some(title) = &self.title {
            parts.push(title.clone());
        }
        parts.push(format!("({:.1}%)", self.confidence * 100.0));
        if let Some(location) = &self.location {
            parts.push(location.to_string());
        }
        f.write_str(&parts.join(" "))
    }
}

/// One label proposed by the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub id: String,
    pub title: String,
    pub score: f32,
}

impl Classification {
    pub fn new(id: impl Into<String>, title: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            score,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({:.1}%)", self.id, self.title, self.score * 100.0)
    }
}

/// Render a detection list as `[a, b, ...]`.
///
/// Used as the label when no detection gets classified.
pub fn format_detections(detections: &[Detection]) -> String {
    let items: Vec<String> = detections.iter().map(ToString::to_string).collect();
    format!("[{}]", items.join(", "))
}
