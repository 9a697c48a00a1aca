use image::{RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Axis-aligned box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }

    /// True when every edge is finite and the box has positive extent on both axes.
    pub fn is_valid(&self) -> bool {
        [self.left, self.top, self.right, self.bottom]
            .iter()
            .all(|v| v.is_finite())
            && self.left < self.right
            && self.top < self.bottom
    }

    /// Intersection-over-Union with another box. Zero when the union is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.left.max(other.left);
        let y1 = self.top.max(other.top);
        let x2 = self.right.min(other.right);
        let y2 = self.bottom.min(other.bottom);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// One candidate face returned by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    pub landmarks: Option<Landmarks>,
    pub confidence: f32,
}

/// Whole-pixel rectangle inside a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Output of [`FaceLocator::locate_and_crop`](crate::locator::FaceLocator::locate_and_crop).
#[derive(Debug, Clone)]
pub struct CropResult {
    pub image: RgbImage,
    /// Expanded, clamped region the crop was cut from.
    pub source_bbox: CropRegion,
    /// The detection the crop is centred on.
    pub detection: Detection,
    /// Number of lower-confidence detections dropped during selection.
    pub discarded: usize,
}

/// One frame of a before/after wipe animation.
#[derive(Debug, Clone, PartialEq)]
pub struct RevealFrame {
    /// Columns left of this position show the "after" image.
    pub bar_position: u32,
    pub image: RgbaImage,
}
