//! Before/after wipe animation.
//!
//! Frame `i` of `frame_count + 1` shows the "after" image left of
//! `floor(width * i / frame_count)` and the "before" image from there on,
//! so the sequence sweeps left to right from fully "before" to fully "after".

use crate::types::{CropRegion, RevealFrame};
use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, Frame, RgbaImage};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_FRAME_COUNT: u32 = 20;
pub const DEFAULT_BOTTOM_BIAS: f32 = 0.5;
pub const DEFAULT_FRAME_DELAY_MS: u32 = 100;

/// GIF quantisation speed (1 = best quality, 30 = fastest).
const GIF_ENCODE_SPEED: i32 = 10;

const RGBA_CHANNELS: usize = 4;

#[derive(Error, Debug)]
pub enum RevealError {
    #[error("invalid crop parameters: {0}")]
    InvalidCropParameters(String),
    #[error("frame count must be at least 1")]
    InvalidFrameCount,
    #[error("no frames to encode")]
    EmptySequence,
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RevealParams {
    /// Number of wipe steps; the sequence holds one more frame than this.
    pub frame_count: u32,
    /// Margin trimmed from the left, right and (scaled) top/bottom edges.
    pub crop_pixels: u32,
    /// Skew of the vertical trim toward the bottom, in `[0, 1]`. Unused when
    /// `crop_pixels` is 0.
    pub bottom_bias: f32,
}

impl Default for RevealParams {
    fn default() -> Self {
        Self {
            frame_count: DEFAULT_FRAME_COUNT,
            crop_pixels: 0,
            bottom_bias: DEFAULT_BOTTOM_BIAS,
        }
    }
}

/// Region left after trimming `crop_pixels` margins from a `width × height` image.
///
/// Left and right lose `crop_pixels` each. The top loses
/// `crop_pixels × (1 − bottom_bias)` and the bottom `crop_pixels × (1 + bottom_bias)`,
/// rounded to the nearest pixel. With no margin the bias has nothing to skew and
/// is not checked.
pub fn crop_margins(
    width: u32,
    height: u32,
    crop_pixels: u32,
    bottom_bias: f32,
) -> Result<CropRegion, RevealError> {
    if crop_pixels > 0 && !(0.0f32..=1.0).contains(&bottom_bias) {
        return Err(RevealError::InvalidCropParameters(format!(
            "bottom bias must be within [0, 1], got {bottom_bias}"
        )));
    }

    let margin = crop_pixels as f64;
    let bias = if crop_pixels > 0 { bottom_bias as f64 } else { 0.0 };

    let left = crop_pixels as i64;
    let right = width as i64 - crop_pixels as i64;
    let top = (margin * (1.0 - bias)).round() as i64;
    let bottom = height as i64 - (margin * (1.0 + bias)).round() as i64;

    if right <= left || bottom <= top {
        return Err(RevealError::InvalidCropParameters(format!(
            "cropping {crop_pixels}px (bottom bias {bottom_bias}) leaves no pixels of a {width}x{height} image"
        )));
    }

    Ok(CropRegion {
        x: left as u32,
        y: top as u32,
        width: (right - left) as u32,
        height: (bottom - top) as u32,
    })
}

/// Build the wipe sequence from `before` to `after`.
///
/// `before` fixes the output size; `after` is resampled to match when needed.
/// All parameters are validated before any pixel work starts.
pub fn build_reveal_sequence(
    before: &RgbaImage,
    after: &RgbaImage,
    params: &RevealParams,
) -> Result<Vec<RevealFrame>, RevealError> {
    if params.frame_count == 0 {
        return Err(RevealError::InvalidFrameCount);
    }
    let (width, height) = before.dimensions();
    let region = crop_margins(width, height, params.crop_pixels, params.bottom_bias)?;

    let resized;
    let after = if after.dimensions() != before.dimensions() {
        tracing::debug!(
            from = ?after.dimensions(),
            to = ?before.dimensions(),
            "resizing after image to match before image"
        );
        resized = imageops::resize(after, width, height, FilterType::Lanczos3);
        &resized
    } else {
        after
    };

    let (before, after) = if params.crop_pixels > 0 {
        (crop_to(before, &region), crop_to(after, &region))
    } else {
        (before.clone(), after.clone())
    };

    let frame_count = params.frame_count as u64;
    let frames: Vec<RevealFrame> = (0..=frame_count)
        .map(|i| {
            let bar_position = (region.width as u64 * i / frame_count) as u32;
            RevealFrame {
                bar_position,
                image: composite_at(&before, &after, bar_position),
            }
        })
        .collect();

    tracing::debug!(
        frames = frames.len(),
        width = region.width,
        height = region.height,
        "built reveal sequence"
    );

    Ok(frames)
}

fn crop_to(image: &RgbaImage, region: &CropRegion) -> RgbaImage {
    imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image()
}

/// Copy of `before` whose first `bar_position` columns come from `after`.
fn composite_at(before: &RgbaImage, after: &RgbaImage, bar_position: u32) -> RgbaImage {
    let mut frame = before.clone();
    let row_len = before.width() as usize * RGBA_CHANNELS;
    let bar_len = bar_position.min(before.width()) as usize * RGBA_CHANNELS;
    if row_len == 0 || bar_len == 0 {
        return frame;
    }

    for (dst, src) in frame.chunks_exact_mut(row_len).zip(after.chunks_exact(row_len)) {
        dst[..bar_len].copy_from_slice(&src[..bar_len]);
    }
    frame
}

/// Encode frames as a looping animated GIF, `frame_delay_ms` per frame.
///
/// Every frame is a full opaque canvas placed at (0, 0), so each one replaces
/// its predecessor outright and the frame disposal method never shows.
pub fn write_gif<W: Write>(
    frames: &[RevealFrame],
    writer: W,
    frame_delay_ms: u32,
) -> Result<(), RevealError> {
    if frames.is_empty() {
        return Err(RevealError::EmptySequence);
    }

    let mut encoder = GifEncoder::new_with_speed(writer, GIF_ENCODE_SPEED);
    encoder.set_repeat(Repeat::Infinite)?;

    let delay = Delay::from_numer_denom_ms(frame_delay_ms, 1);
    encoder.encode_frames(
        frames
            .iter()
            .map(|f| Frame::from_parts(f.image.clone(), 0, 0, delay)),
    )?;
    Ok(())
}

/// Write the sequence as a GIF file, creating parent directories as needed.
pub fn save_gif(
    frames: &[RevealFrame],
    path: impl AsRef<Path>,
    frame_delay_ms: u32,
) -> Result<(), RevealError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(path)?);
    write_gif(frames, &mut writer, frame_delay_ms)?;
    writer.flush()?;

    tracing::info!(
        path = %path.display(),
        frames = frames.len(),
        frame_delay_ms,
        "saved comparison GIF"
    );
    Ok(())
}
