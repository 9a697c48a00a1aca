//! facelift-core — Face location and before/after compositing.
//!
//! Finds the most confident face with SCRFD (via ONNX Runtime), crops it with
//! configurable context for use as an identity reference, and builds wipe
//! animations comparing an image before and after enhancement.

pub mod detector;
pub mod locator;
pub mod reveal;
pub mod types;

use std::path::PathBuf;

pub use detector::{Detect, DetectorError, FaceDetector};
pub use locator::{CropParams, FaceLocator, LocateError};
pub use reveal::{build_reveal_sequence, RevealError, RevealParams};
pub use types::{BoundingBox, CropRegion, CropResult, Detection, RevealFrame};

/// Default directory for ONNX model files: `$XDG_DATA_HOME/facelift/models`,
/// falling back to `~/.local/share/facelift/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facelift")
        .join("models")
}
