//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! The [`Detect`] trait is the seam the locator depends on, so any other
//! detector runtime can stand in for SCRFD.

use crate::types::{BoundingBox, Detection, Landmarks};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// File name of the SCRFD model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download det_10g.onnx from insightface and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detection capability.
///
/// Implementations return every candidate above `confidence_threshold` after
/// suppressing boxes that overlap a stronger one by more than `nms_threshold` IoU.
pub trait Detect {
    fn detect(
        &mut self,
        image: &RgbImage,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Letterbox an RGB image into a NCHW float tensor normalised for SCRFD.
    fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let letterbox = letterbox_for(width, height, self.input_width, self.input_height);

        let new_w = ((width as f32 * letterbox.scale).round() as usize).clamp(1, self.input_width);
        let new_h = ((height as f32 * letterbox.scale).round() as usize).clamp(1, self.input_height);
        let resized = imageops::resize(image, new_w as u32, new_h as u32, FilterType::Triangle);

        let pad_x_start = letterbox.pad_x.floor() as usize;
        let pad_y_start = letterbox.pad_y.floor() as usize;

        // Padding is filled with SCRFD_MEAN, which normalises to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height, self.input_width));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let tx = x as usize + pad_x_start;
            let ty = y as usize + pad_y_start;
            if tx >= self.input_width || ty >= self.input_height {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl Detect for FaceDetector {
    /// Detect faces in an RGB image, returning detections sorted by confidence.
    fn detect(
        &mut self,
        image: &RgbImage,
        confidence_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }

        let (input, letterbox) = self.preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                self.input_width,
                self.input_height,
                &letterbox,
                confidence_threshold,
            ));
        }

        let candidates = all_detections.len();
        let result = nms(all_detections, nms_threshold);
        tracing::debug!(
            candidates,
            kept = result.len(),
            confidence_threshold,
            nms_threshold,
            "SCRFD detection complete"
        );

        Ok(result)
    }
}

/// Scale and centring offsets that fit `width × height` into the model input.
fn letterbox_for(width: usize, height: usize, input_width: usize, input_height: usize) -> LetterboxInfo {
    let scale_w = input_width as f32 / width as f32;
    let scale_h = input_height as f32 / height as f32;
    let scale = scale_w.min(scale_h);

    let new_w = (width as f32 * scale).round().min(input_width as f32);
    let new_h = (height as f32 * scale).round().min(input_height as f32);

    LetterboxInfo {
        scale,
        pad_x: (input_width as f32 - new_w) / 2.0,
        pad_y: (input_height as f32 - new_h) / 2.0,
    }
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name their outputs ("score_8", "bbox_16", ...) or use
/// generic numeric names. Unrecognised names fall back to positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level.
#[allow(clippy::too_many_arguments)]
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let unmap = |x: f32, y: f32| -> (f32, f32) {
        ((x - letterbox.pad_x) / letterbox.scale, (y - letterbox.pad_y) / letterbox.scale)
    };

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * step;
        let anchor_cy = (anchor_idx / grid_w) as f32 * step;

        // bbox: [left, top, right, bottom] distances from the anchor, in strides
        let bbox_off = idx * 4;
        let Some(offsets) = bboxes.get(bbox_off..bbox_off + 4) else {
            continue;
        };
        let (left, top) = unmap(anchor_cx - offsets[0] * step, anchor_cy - offsets[1] * step);
        let (right, bottom) = unmap(anchor_cx + offsets[2] * step, anchor_cy + offsets[3] * step);

        let kps_off = idx * 10;
        let landmarks = kps.get(kps_off..kps_off + 10).map(|points| {
            let mut lms: Landmarks = [(0.0, 0.0); 5];
            for (i, lm) in lms.iter_mut().enumerate() {
                *lm = unmap(
                    anchor_cx + points[i * 2] * step,
                    anchor_cy + points[i * 2 + 1] * step,
                );
            }
            lms
        });

        detections.push(Detection {
            bounding_box: BoundingBox::new(left, top, right, bottom),
            landmarks,
            confidence: score,
        });
    }

    detections
}

/// Non-Maximum Suppression: keep the strongest of each overlapping cluster.
///
/// The result is ordered by descending confidence; equal confidences keep
/// their input order.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        let overlaps = keep
            .iter()
            .any(|kept| kept.bounding_box.iou(&det.bounding_box) > iou_threshold);
        if !overlaps {
            keep.push(det);
        }
    }

    keep
}
