//! Face location and context-preserving crop.
//!
//! A [`FaceLocator`] owns a detector for its whole lifetime: open it once,
//! crop as many images as needed, then close it. Each crop picks the most
//! confident detection, grows its box by `scale_factor`, pushes the centre
//! down by `shift_factor` of the growth, and clamps the result to the image.

use crate::detector::{Detect, DetectorError, FaceDetector};
use crate::types::{BoundingBox, CropRegion, CropResult, Detection};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_SCALE_FACTOR: f32 = 4.0;
pub const DEFAULT_SHIFT_FACTOR: f32 = 0.45;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.02;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("crop computation failed: {0}")]
    CropComputationFailed(String),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for a single crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropParams {
    /// Crop size relative to the face box; larger zooms out.
    pub scale_factor: f32,
    /// Fraction of the vertical growth used to move the crop centre down.
    pub shift_factor: f32,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Resample the crop so its longer side is this many pixels.
    pub output_size: Option<u32>,
}

impl Default for CropParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            shift_factor: DEFAULT_SHIFT_FACTOR,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            output_size: None,
        }
    }
}

/// Detection-backed face cropper.
pub struct FaceLocator<D: Detect = FaceDetector> {
    detector: D,
}

impl FaceLocator<FaceDetector> {
    /// Load the SCRFD model and open a locator session around it.
    pub fn open(model_path: impl AsRef<Path>) -> Result<Self, LocateError> {
        let detector = FaceDetector::load(model_path)?;
        tracing::info!("face locator opened");
        Ok(Self::new(detector))
    }
}

impl<D: Detect> FaceLocator<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    /// Detect the most confident face in `image` and cut out its expanded region.
    pub fn locate_and_crop(
        &mut self,
        image: &RgbImage,
        params: &CropParams,
    ) -> Result<CropResult, LocateError> {
        let detections =
            self.detector
                .detect(image, params.confidence_threshold, params.nms_threshold)?;
        tracing::debug!(count = detections.len(), "faces detected");

        let (detection, discarded) = select_best(detections).ok_or(LocateError::NoFaceDetected)?;
        if discarded > 0 {
            tracing::info!(
                detected = discarded + 1,
                discarded,
                confidence = detection.confidence,
                "multiple faces detected, using the one with highest confidence"
            );
        }

        let region = expand_box(
            &detection.bounding_box,
            image.width(),
            image.height(),
            params.scale_factor,
            params.shift_factor,
        )?;

        let mut cropped =
            imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image();
        if cropped.width() == 0 || cropped.height() == 0 {
            return Err(LocateError::CropComputationFailed("empty crop output".into()));
        }

        if let Some(size) = params.output_size {
            cropped = rescale_longest_side(&cropped, size)?;
        }

        Ok(CropResult {
            image: cropped,
            source_bbox: region,
            detection,
            discarded,
        })
    }

    /// Read `input`, crop the face, and write it to `output`.
    ///
    /// Parent directories of `output` are created as needed. Nothing is
    /// written when no crop could be produced.
    pub fn crop_to_file(
        &mut self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        params: &CropParams,
    ) -> Result<CropResult, LocateError> {
        let input = input.as_ref();
        let output = output.as_ref();

        let image = image::open(input)?.to_rgb8();
        let result = self.locate_and_crop(&image, params)?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        result.image.save(output)?;

        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            width = result.image.width(),
            height = result.image.height(),
            "saved face crop"
        );

        Ok(result)
    }

    /// End the session, releasing the detector.
    pub fn close(self) {
        drop(self.detector);
        tracing::info!("face locator closed");
    }
}

/// Pick the highest-confidence detection.
///
/// Equal confidences resolve to the earliest in detector order; NaN ranks
/// below every real score. Returns the winner and how many were dropped.
pub fn select_best(detections: Vec<Detection>) -> Option<(Detection, usize)> {
    let rank = |d: &Detection| if d.confidence.is_nan() { f32::NEG_INFINITY } else { d.confidence };

    let total = detections.len();
    let mut best: Option<Detection> = None;
    for det in detections {
        let replace = best.as_ref().map_or(true, |current| rank(&det) > rank(current));
        if replace {
            best = Some(det);
        }
    }

    best.map(|det| (det, total - 1))
}

/// Expand a face box into the crop region, clamped to a `image_width × image_height` image.
///
/// The box is scaled about its centre by `scale_factor` on both axes. Its centre
/// then moves down by `shift_factor × (new_height − height) / 2`. On each axis a
/// region larger than the image shrinks to the image extent, then slides inside it.
/// Edges round outward to whole pixels, so with `scale_factor >= 1` and
/// `|shift_factor| <= 1` a face box lying inside the image is fully contained.
pub fn expand_box(
    bbox: &BoundingBox,
    image_width: u32,
    image_height: u32,
    scale_factor: f32,
    shift_factor: f32,
) -> Result<CropRegion, LocateError> {
    if !bbox.is_valid() {
        return Err(LocateError::CropComputationFailed(format!(
            "degenerate face box {bbox:?}"
        )));
    }
    if !(scale_factor.is_finite() && scale_factor > 0.0) {
        return Err(LocateError::CropComputationFailed(format!(
            "scale factor must be positive, got {scale_factor}"
        )));
    }
    if !shift_factor.is_finite() {
        return Err(LocateError::CropComputationFailed(format!(
            "shift factor must be finite, got {shift_factor}"
        )));
    }

    let (left, top) = (bbox.left as f64, bbox.top as f64);
    let (right, bottom) = (bbox.right as f64, bbox.bottom as f64);
    let (width, height) = (right - left, bottom - top);
    let scale = scale_factor as f64;

    let new_width = width * scale;
    let new_height = height * scale;
    let cx = (left + right) / 2.0;
    let cy = (top + bottom) / 2.0 + shift_factor as f64 * (new_height - height) / 2.0;

    let (x, region_width) = fit_axis(cx, new_width, image_width);
    let (y, region_height) = fit_axis(cy, new_height, image_height);

    if region_width == 0 || region_height == 0 {
        return Err(LocateError::CropComputationFailed(format!(
            "crop collapsed to {region_width}x{region_height} inside {image_width}x{image_height} image"
        )));
    }

    Ok(CropRegion {
        x,
        y,
        width: region_width,
        height: region_height,
    })
}

/// Place a span of `size` centred on `center` within `[0, limit]`, widened to whole pixels.
fn fit_axis(center: f64, size: f64, limit: u32) -> (u32, u32) {
    let limit = limit as f64;
    let size = size.min(limit);
    let start = (center - size / 2.0).clamp(0.0, limit - size);

    let first = start.floor().clamp(0.0, limit);
    let last = (start + size).ceil().clamp(first, limit);
    (first as u32, (last - first) as u32)
}

fn rescale_longest_side(image: &RgbImage, size: u32) -> Result<RgbImage, LocateError> {
    if size == 0 {
        return Err(LocateError::CropComputationFailed("output size must be positive".into()));
    }
    let (w, h) = image.dimensions();
    let longest = w.max(h) as f64;
    let ratio = size as f64 / longest;
    let new_w = ((w as f64 * ratio).round() as u32).max(1);
    let new_h = ((h as f64 * ratio).round() as u32).max(1);
    Ok(imageops::resize(image, new_w, new_h, FilterType::Lanczos3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Returns a fixed list of detections and counts how often it was called.
    struct FixedDetector {
        detections: Vec<Detection>,
        calls: usize,
    }

    impl FixedDetector {
        fn new(detections: Vec<Detection>) -> Self {
            Self { detections, calls: 0 }
        }
    }

    impl Detect for FixedDetector {
        fn detect(
            &mut self,
            _image: &RgbImage,
            _confidence_threshold: f32,
            _nms_threshold: f32,
        ) -> Result<Vec<Detection>, DetectorError> {
            self.calls += 1;
            Ok(self.detections.clone())
        }
    }

    fn det(left: f32, top: f32, right: f32, bottom: f32, confidence: f32) -> Detection {
        Detection {
            bounding_box: BoundingBox::new(left, top, right, bottom),
            landmarks: None,
            confidence,
        }
    }

    /// Image whose pixel at (x, y) encodes its own coordinates.
    fn coordinate_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 7]))
    }

    #[test]
    fn test_select_best_empty() {
        assert!(select_best(vec![]).is_none());
    }

    #[test]
    fn test_select_best_is_permutation_invariant() {
        let dets = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.3),
            det(20.0, 0.0, 30.0, 10.0, 0.9),
            det(40.0, 0.0, 50.0, 10.0, 0.6),
        ];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0],
        ];
        for order in orders {
            let permuted: Vec<Detection> = order.iter().map(|&i| dets[i].clone()).collect();
            let (best, discarded) = select_best(permuted).unwrap();
            assert_eq!(best, dets[1], "order {order:?}");
            assert_eq!(discarded, 2);
        }
    }

    #[test]
    fn test_select_best_tie_prefers_first() {
        let first = det(0.0, 0.0, 10.0, 10.0, 0.8);
        let second = det(50.0, 50.0, 60.0, 60.0, 0.8);
        let (best, _) = select_best(vec![first.clone(), second]).unwrap();
        assert_eq!(best, first);
    }

    #[test]
    fn test_select_best_nan_ranks_last() {
        let nan = det(0.0, 0.0, 10.0, 10.0, f32::NAN);
        let real = det(50.0, 50.0, 60.0, 60.0, 0.1);
        let (best, discarded) = select_best(vec![nan, real.clone()]).unwrap();
        assert_eq!(best, real);
        assert_eq!(discarded, 1);
    }

    #[test]
    fn test_expand_box_centered_no_clamp() {
        // 20x20 face at the centre of a 200x200 image, no shift.
        let bbox = BoundingBox::new(90.0, 90.0, 110.0, 110.0);
        let region = expand_box(&bbox, 200, 200, 4.0, 0.0).unwrap();
        assert_eq!(region, CropRegion { x: 60, y: 60, width: 80, height: 80 });
    }

    #[test]
    fn test_expand_box_shift_moves_down() {
        // growth 60, half 30, shift 0.5 → centre moves down by 15
        let bbox = BoundingBox::new(90.0, 90.0, 110.0, 110.0);
        let region = expand_box(&bbox, 200, 200, 4.0, 0.5).unwrap();
        assert_eq!(region, CropRegion { x: 60, y: 75, width: 80, height: 80 });
    }

    #[test]
    fn test_expand_box_translates_inside_bounds() {
        // Face near the bottom-right corner: the region slides back inside.
        let bbox = BoundingBox::new(170.0, 170.0, 190.0, 190.0);
        let region = expand_box(&bbox, 200, 200, 4.0, 0.45).unwrap();
        assert_eq!(region, CropRegion { x: 120, y: 120, width: 80, height: 80 });
    }

    #[test]
    fn test_expand_box_shrinks_to_image() {
        let bbox = BoundingBox::new(40.0, 30.0, 60.0, 70.0);
        let region = expand_box(&bbox, 100, 100, 10.0, 0.45).unwrap();
        assert_eq!(region, CropRegion { x: 0, y: 0, width: 100, height: 100 });
    }

    #[test]
    fn test_expand_box_contains_face_and_stays_in_bounds() {
        let cases = [
            (BoundingBox::new(0.0, 0.0, 30.0, 40.0), 320, 240),
            (BoundingBox::new(290.0, 200.0, 320.0, 240.0), 320, 240),
            (BoundingBox::new(100.0, 50.0, 180.0, 150.0), 320, 240),
            (BoundingBox::new(5.0, 5.0, 7.0, 9.0), 16, 16),
        ];
        for (bbox, w, h) in cases {
            for scale in [1.0, 1.5, 4.0, 8.0] {
                let r = expand_box(&bbox, w, h, scale, DEFAULT_SHIFT_FACTOR).unwrap();
                assert!(r.right() <= w && r.bottom() <= h, "{r:?} outside {w}x{h}");
                assert!(r.x as f32 <= bbox.left && r.right() as f32 >= bbox.right, "{r:?} clips {bbox:?}");
                assert!(r.y as f32 <= bbox.top && r.bottom() as f32 >= bbox.bottom, "{r:?} clips {bbox:?}");
                assert!(
                    r.area() as f32 >= bbox.area(),
                    "{r:?} smaller than {bbox:?} at scale {scale}"
                );
            }
        }
    }

    #[test]
    fn test_expand_box_fractional_box_not_clipped() {
        let bbox = BoundingBox::new(10.5, 10.5, 20.4, 20.4);
        let region = expand_box(&bbox, 100, 100, 1.0, 0.0).unwrap();
        assert_eq!(region, CropRegion { x: 10, y: 10, width: 11, height: 11 });
        assert!(region.area() as f32 >= bbox.area());
    }

    #[test]
    fn test_expand_box_fractional_boxes_fully_contained() {
        let cases = [
            (BoundingBox::new(10.5, 10.5, 20.4, 20.4), 100, 100),
            (BoundingBox::new(0.3, 0.7, 31.2, 40.9), 320, 240),
            (BoundingBox::new(288.6, 199.2, 319.9, 239.8), 320, 240),
            (BoundingBox::new(101.49, 52.51, 179.5, 150.49), 320, 240),
            (BoundingBox::new(4.75, 5.25, 7.4, 9.6), 16, 16),
        ];
        for (bbox, w, h) in cases {
            for scale in [1.0, 1.25, 1.5, 4.0] {
                for shift in [0.0, DEFAULT_SHIFT_FACTOR, 1.0, -1.0] {
                    let r = expand_box(&bbox, w, h, scale, shift).unwrap();
                    let ctx = format!("{r:?} for {bbox:?} at scale {scale}, shift {shift}");
                    assert!(r.right() <= w && r.bottom() <= h, "outside image: {ctx}");
                    assert!(r.x as f32 <= bbox.left && r.right() as f32 >= bbox.right, "x clipped: {ctx}");
                    assert!(r.y as f32 <= bbox.top && r.bottom() as f32 >= bbox.bottom, "y clipped: {ctx}");
                }
            }
        }
    }

    #[test]
    fn test_expand_box_rejects_degenerate_input() {
        let flat = BoundingBox::new(10.0, 10.0, 10.0, 20.0);
        assert!(matches!(
            expand_box(&flat, 100, 100, 4.0, 0.45),
            Err(LocateError::CropComputationFailed(_))
        ));

        let bbox = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert!(matches!(
            expand_box(&bbox, 100, 100, 0.0, 0.45),
            Err(LocateError::CropComputationFailed(_))
        ));
        assert!(matches!(
            expand_box(&bbox, 100, 100, 4.0, f32::NAN),
            Err(LocateError::CropComputationFailed(_))
        ));
    }

    #[test]
    fn test_expand_box_collapses_in_empty_image() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert!(matches!(
            expand_box(&bbox, 0, 10, 4.0, 0.45),
            Err(LocateError::CropComputationFailed(_))
        ));
    }

    #[test]
    fn test_locate_and_crop_uses_expanded_region() {
        let image = coordinate_image(200, 200);
        let mut locator = FaceLocator::new(FixedDetector::new(vec![det(90.0, 90.0, 110.0, 110.0, 0.99)]));
        let params = CropParams { shift_factor: 0.0, ..CropParams::default() };

        let result = locator.locate_and_crop(&image, &params).unwrap();
        assert_eq!(result.source_bbox, CropRegion { x: 60, y: 60, width: 80, height: 80 });
        assert_eq!(result.image.dimensions(), (80, 80));
        assert_eq!(result.image.get_pixel(0, 0), &Rgb([60, 60, 7]));
        assert_eq!(result.image.get_pixel(79, 79), &Rgb([139, 139, 7]));
        assert_eq!(result.discarded, 0);
    }

    #[test]
    fn test_locate_and_crop_picks_most_confident() {
        let image = coordinate_image(200, 200);
        let weak = det(10.0, 10.0, 30.0, 30.0, 0.4);
        let strong = det(150.0, 150.0, 170.0, 170.0, 0.97);
        let mut locator = FaceLocator::new(FixedDetector::new(vec![weak, strong.clone()]));

        let result = locator.locate_and_crop(&image, &CropParams::default()).unwrap();
        assert_eq!(result.detection, strong);
        assert_eq!(result.discarded, 1);
    }

    #[test]
    fn test_locate_and_crop_no_face() {
        let image = coordinate_image(64, 64);
        let mut locator = FaceLocator::new(FixedDetector::new(vec![]));
        let err = locator.locate_and_crop(&image, &CropParams::default()).unwrap_err();
        assert!(matches!(err, LocateError::NoFaceDetected));
    }

    #[test]
    fn test_locate_and_crop_output_size() {
        let image = coordinate_image(200, 200);
        let mut locator = FaceLocator::new(FixedDetector::new(vec![det(90.0, 80.0, 110.0, 120.0, 0.9)]));
        let params = CropParams {
            scale_factor: 2.0,
            shift_factor: 0.0,
            output_size: Some(20),
            ..CropParams::default()
        };

        let result = locator.locate_and_crop(&image, &params).unwrap();
        assert_eq!(result.source_bbox.width, 40);
        assert_eq!(result.source_bbox.height, 80);
        assert_eq!(result.image.dimensions(), (10, 20));
    }

    #[test]
    fn test_crop_to_file_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ref.png");
        coordinate_image(120, 100).save(&input).unwrap();
        let output = dir.path().join("scratch/nested/cropped_face.png");

        let mut locator = FaceLocator::new(FixedDetector::new(vec![det(50.0, 40.0, 70.0, 60.0, 0.9)]));
        let result = locator.crop_to_file(&input, &output, &CropParams::default()).unwrap();

        let written = image::open(&output).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), result.image.dimensions());
        assert_eq!(written, result.image);
    }

    #[test]
    fn test_crop_to_file_no_face_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ref.png");
        coordinate_image(32, 32).save(&input).unwrap();
        let output = dir.path().join("out/cropped_face.png");

        let mut locator = FaceLocator::new(FixedDetector::new(vec![]));
        let err = locator.crop_to_file(&input, &output, &CropParams::default()).unwrap_err();

        assert!(matches!(err, LocateError::NoFaceDetected));
        assert!(!output.exists());
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_session_reuses_detector() {
        let image = coordinate_image(64, 64);
        let mut locator = FaceLocator::new(FixedDetector::new(vec![det(20.0, 20.0, 40.0, 40.0, 0.9)]));
        for _ in 0..3 {
            locator.locate_and_crop(&image, &CropParams::default()).unwrap();
        }
        assert_eq!(locator.detector.calls, 3);
        locator.close();
    }
}
