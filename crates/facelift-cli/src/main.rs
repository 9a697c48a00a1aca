use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facelift_core::{reveal, Detect, FaceDetector, FaceLocator, LocateError};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facelift", version, about = "Face crop and before/after comparison tools")]
struct Cli {
    /// TOML configuration file (also read from FACELIFT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Detector tuning shared by the subcommands that run SCRFD.
#[derive(clap::Args)]
struct DetectArgs {
    /// Minimum detection confidence
    #[arg(long)]
    confidence_threshold: Option<f32>,
    /// IoU above which overlapping detections are suppressed
    #[arg(long)]
    nms_threshold: Option<f32>,
    /// SCRFD model file (defaults to <model_dir>/det_10g.onnx)
    #[arg(long)]
    model: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crop the most confident face out of an image, keeping surrounding context
    Crop {
        /// Source image
        input: PathBuf,
        /// Where to write the crop (format from extension)
        output: PathBuf,
        /// Crop size relative to the face box
        #[arg(long)]
        scale_factor: Option<f32>,
        /// Downward shift of the crop centre, as a fraction of the vertical growth
        #[arg(long, allow_hyphen_values = true)]
        shift_factor: Option<f32>,
        /// Resample the crop so its longer side has this many pixels
        #[arg(long)]
        output_size: Option<u32>,
        #[command(flatten)]
        detect: DetectArgs,
    },
    /// Build a before/after comparison GIF with a sliding reveal bar
    Compare {
        /// Image shown before the bar passes
        before: PathBuf,
        /// Image revealed by the bar
        after: PathBuf,
        #[arg(short, long, default_value = "comparison.gif")]
        output: PathBuf,
        /// Duration of each frame in milliseconds
        #[arg(short, long)]
        duration: Option<u32>,
        /// Number of reveal steps
        #[arg(short, long)]
        frames: Option<u32>,
        /// Margin to trim from the image edges
        #[arg(long)]
        crop_pixels: Option<u32>,
        /// How much more of the trim comes off the bottom than the top (0 to 1)
        #[arg(long)]
        bottom_bias: Option<f32>,
    },
    /// Print every detected face as JSON
    Detect {
        /// Source image
        input: PathBuf,
        #[command(flatten)]
        detect: DetectArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Crop {
            input,
            output,
            scale_factor,
            shift_factor,
            output_size,
            detect,
        } => {
            let mut params = config.crop_params();
            params.scale_factor = scale_factor.unwrap_or(params.scale_factor);
            params.shift_factor = shift_factor.unwrap_or(params.shift_factor);
            params.confidence_threshold = detect.confidence_threshold.unwrap_or(params.confidence_threshold);
            params.nms_threshold = detect.nms_threshold.unwrap_or(params.nms_threshold);
            params.output_size = output_size;

            let model = model_path(&config, detect.model.as_deref());
            let mut locator = FaceLocator::open(&model)
                .with_context(|| format!("opening face locator with {}", model.display()))?;

            let outcome = locator.crop_to_file(&input, &output, &params);
            locator.close();

            match outcome {
                Ok(result) => {
                    println!(
                        "Saved: {} ({}x{}, confidence {:.3})",
                        output.display(),
                        result.image.width(),
                        result.image.height(),
                        result.detection.confidence
                    );
                }
                Err(LocateError::NoFaceDetected) => {
                    anyhow::bail!("no face detected in {}", input.display());
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("cropping {}", input.display()));
                }
            }
        }
        Commands::Compare {
            before,
            after,
            output,
            duration,
            frames,
            crop_pixels,
            bottom_bias,
        } => {
            let mut params = config.reveal_params();
            params.frame_count = frames.unwrap_or(params.frame_count);
            params.crop_pixels = crop_pixels.unwrap_or(params.crop_pixels);
            params.bottom_bias = bottom_bias.unwrap_or(params.bottom_bias);
            let delay_ms = duration.unwrap_or(config.frame_delay_ms);

            let before_img = image::open(&before)
                .with_context(|| format!("reading {}", before.display()))?
                .to_rgba8();
            let after_img = image::open(&after)
                .with_context(|| format!("reading {}", after.display()))?
                .to_rgba8();

            let sequence = reveal::build_reveal_sequence(&before_img, &after_img, &params)?;
            reveal::save_gif(&sequence, &output, delay_ms)
                .with_context(|| format!("writing {}", output.display()))?;

            println!("Created comparison GIF: {}", output.display());
        }
        Commands::Detect { input, detect } => {
            let model = model_path(&config, detect.model.as_deref());
            let mut detector = FaceDetector::load(&model)
                .with_context(|| format!("loading detector {}", model.display()))?;

            let image = image::open(&input)
                .with_context(|| format!("reading {}", input.display()))?
                .to_rgb8();
            let detections = detector.detect(
                &image,
                detect.confidence_threshold.unwrap_or(config.confidence_threshold),
                detect.nms_threshold.unwrap_or(config.nms_threshold),
            )?;

            println!("{}", serde_json::to_string_pretty(&detections)?);
        }
    }

    Ok(())
}

fn model_path(config: &Config, explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.scrfd_model_path())
}
