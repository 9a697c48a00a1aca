use anyhow::{Context, Result};
use facelift_core::detector::SCRFD_MODEL_FILE;
use facelift_core::{locator, reveal, CropParams, RevealParams};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration.
///
/// Precedence, lowest first: built-in defaults, TOML file, `FACELIFT_*`
/// environment variables, command-line flags (applied by the caller).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub scale_factor: f32,
    pub shift_factor: f32,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Display time of each comparison GIF frame.
    pub frame_delay_ms: u32,
    pub frame_count: u32,
    pub crop_pixels: u32,
    pub bottom_bias: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: facelift_core::default_model_dir(),
            scale_factor: locator::DEFAULT_SCALE_FACTOR,
            shift_factor: locator::DEFAULT_SHIFT_FACTOR,
            confidence_threshold: locator::DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: locator::DEFAULT_NMS_THRESHOLD,
            frame_delay_ms: reveal::DEFAULT_FRAME_DELAY_MS,
            frame_count: reveal::DEFAULT_FRAME_COUNT,
            crop_pixels: 0,
            bottom_bias: reveal::DEFAULT_BOTTOM_BIAS,
        }
    }
}

impl Config {
    /// Load from `path` (or `$FACELIFT_CONFIG`) if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FACELIFT_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                let config = Self::from_toml_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?;
                tracing::debug!(path = %path.display(), "loaded config file");
                config
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `FACELIFT_*` variables. Unparsable values are ignored.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACELIFT_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        env_or(&lookup, "FACELIFT_SCALE_FACTOR", &mut self.scale_factor);
        env_or(&lookup, "FACELIFT_SHIFT_FACTOR", &mut self.shift_factor);
        env_or(&lookup, "FACELIFT_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env_or(&lookup, "FACELIFT_NMS_THRESHOLD", &mut self.nms_threshold);
        env_or(&lookup, "FACELIFT_FRAME_DELAY_MS", &mut self.frame_delay_ms);
        env_or(&lookup, "FACELIFT_FRAME_COUNT", &mut self.frame_count);
        env_or(&lookup, "FACELIFT_CROP_PIXELS", &mut self.crop_pixels);
        env_or(&lookup, "FACELIFT_BOTTOM_BIAS", &mut self.bottom_bias);
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    pub fn crop_params(&self) -> CropParams {
        CropParams {
            scale_factor: self.scale_factor,
            shift_factor: self.shift_factor,
            confidence_threshold: self.confidence_threshold,
            nms_threshold: self.nms_threshold,
            output_size: None,
        }
    }

    pub fn reveal_params(&self) -> RevealParams {
        RevealParams {
            frame_count: self.frame_count,
            crop_pixels: self.crop_pixels,
            bottom_bias: self.bottom_bias,
        }
    }
}

fn env_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}
