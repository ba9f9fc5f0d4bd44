//! `tryon` CLI - Dress a person in a garment from another photo.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use image::DynamicImage;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tryon::densepose::DensePoseAssets;
use tryon::mask::{MaskCategory, MaskVariant};
use tryon::{load_image, save_image, Device, RegistryConfig, TryOn, TryOnConfig};

/// Virtual try-on with a mask-conditioned diffusion model.
#[derive(Parser, Debug)]
#[command(name = "tryon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Photo of the person.
    #[arg(value_name = "HUMAN")]
    human: PathBuf,

    /// Photo of the garment.
    #[arg(value_name = "GARMENT")]
    garment: PathBuf,

    /// Output image path.
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Short garment description, e.g. "short sleeve round neck t-shirt".
    #[arg(short, long, value_name = "TEXT")]
    description: String,

    /// Model bundle directory or hub repository id.
    #[arg(long, default_value = "yisol/IDM-VTON", value_name = "PATH")]
    assets: String,

    /// Also write the masked-person preview here.
    #[arg(long, value_name = "PATH")]
    mask_preview: Option<PathBuf>,

    /// Threshold the photo instead of computing a garment mask.
    #[arg(long)]
    no_auto_mask: bool,

    /// Center-crop the person to 3:4 and paste the result back.
    #[arg(long)]
    crop: bool,

    /// Garment category for the automatic mask (upper_body, lower_body, dresses).
    #[arg(long, default_value = "upper_body", value_name = "CATEGORY")]
    category: MaskCategory,

    /// Mask variant (hd or dc).
    #[arg(long, default_value = "hd", value_name = "VARIANT")]
    variant: MaskVariant,

    /// Number of denoising steps.
    #[arg(long, default_value = "30", value_name = "INT")]
    steps: usize,

    /// Random seed for reproducibility.
    #[arg(long, default_value = "42", value_name = "INT", conflicts_with = "random_seed")]
    seed: u64,

    /// Draw a fresh seed from the OS.
    #[arg(long)]
    random_seed: bool,

    /// Classifier-free guidance scale.
    #[arg(long, default_value = "2.0", value_name = "FLOAT")]
    guidance: f32,

    /// Execution device: cpu, cuda or cuda:N.
    #[arg(long, default_value = "cpu", value_name = "DEVICE")]
    device: Device,

    /// DensePose config file.
    #[arg(long, value_name = "PATH")]
    densepose_config: Option<PathBuf>,

    /// DensePose checkpoint.
    #[arg(long, value_name = "PATH")]
    densepose_checkpoint: Option<PathBuf>,

    /// Output JPEG quality (1-100).
    #[arg(short, long, default_value = "95", value_name = "INT")]
    quality: u8,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tryon={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(&args) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: &Args) -> Result<()> {
    let config = TryOnConfig {
        auto_mask: !args.no_auto_mask,
        auto_crop: args.crop,
        denoising_steps: args.steps,
        seed: (!args.random_seed).then_some(args.seed),
        guidance_scale: args.guidance,
        mask_category: args.category,
        mask_variant: args.variant,
        output_quality: args.quality,
        ..TryOnConfig::default()
    };
    config.validate().context("Invalid options")?;

    let human = load_image(&args.human).context("Failed to read person photo")?;
    let garment = load_image(&args.garment).context("Failed to read garment photo")?;

    let defaults = DensePoseAssets::default();
    let registry = RegistryConfig {
        assets: args.assets.clone(),
        densepose: DensePoseAssets {
            config: args.densepose_config.clone().unwrap_or(defaults.config),
            checkpoint: args
                .densepose_checkpoint
                .clone()
                .unwrap_or(defaults.checkpoint),
        },
        device: args.device,
    };

    let mut tryon = TryOn::load(&registry).context("Failed to load models")?;
    let output = tryon
        .run(&human, &garment, &args.description, &config)
        .context("Try-on failed")?;
    tryon.shutdown();

    save_image(
        &DynamicImage::ImageRgb8(output.image),
        &args.output,
        config.output_quality,
    )
    .context("Failed to save result")?;

    if let Some(path) = &args.mask_preview {
        save_image(
            &DynamicImage::ImageLuma8(output.mask_preview),
            path,
            config.output_quality,
        )
        .context("Failed to save mask preview")?;
    }

    println!(
        "Successfully dressed {} in {} -> {}",
        args.human.display(),
        args.garment.display(),
        args.output.display()
    );

    Ok(())
}
