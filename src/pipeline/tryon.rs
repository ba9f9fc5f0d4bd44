//! End-to-end virtual try-on.

use std::path::Path;

use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, RgbImage};

use crate::error::{Error, Result};
use crate::image::{
    normalize_garment, normalize_human, restore_crop, to_bgr_array, NormalizedHuman,
    CANONICAL_HEIGHT, CANONICAL_WIDTH, WORKING_HEIGHT, WORKING_WIDTH,
};
use crate::mask::{
    garment_mask, mask_preview, threshold_mask, to_canonical, MaskCategory, MaskMode, MaskVariant,
    MANUAL_THRESHOLD,
};
use crate::model::{ModelRegistry, RegistryConfig};
use crate::prompt::{garment_prompt, tryon_prompt, DEFAULT_NEGATIVE_PROMPT};

use super::diffusion::GenerationRequest;
use super::scheduler::DdpmScheduler;

/// Upper bound on denoising steps accepted per call.
const MAX_STEPS: usize = 1000;

/// Per-call settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TryOnConfig {
    /// Derive the mask from parsing and pose instead of thresholding.
    pub auto_mask: bool,

    /// Center-crop the human photo to 3:4 and paste the result back.
    pub auto_crop: bool,

    /// Number of denoising steps.
    pub denoising_steps: usize,

    /// Random seed for reproducibility. None for random.
    pub seed: Option<u64>,

    /// Classifier-free guidance scale; 1.0 or less disables guidance.
    pub guidance_scale: f32,

    /// Fraction of the schedule to run (1.0 starts from pure noise).
    pub strength: f32,

    pub negative_prompt: String,

    pub mask_category: MaskCategory,

    pub mask_variant: MaskVariant,

    /// Output JPEG quality (1-100).
    pub output_quality: u8,
}

impl Default for TryOnConfig {
    fn default() -> Self {
        Self {
            auto_mask: true,
            auto_crop: false,
            denoising_steps: 30,
            seed: Some(42),
            guidance_scale: 2.0,
            strength: 1.0,
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            mask_category: MaskCategory::default(),
            mask_variant: MaskVariant::default(),
            output_quality: 95,
        }
    }
}

impl TryOnConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.denoising_steps == 0 {
            return Err(Error::invalid_parameter(
                "denoising_steps",
                "must be greater than 0",
            ));
        }

        if self.denoising_steps > MAX_STEPS {
            return Err(Error::invalid_parameter(
                "denoising_steps",
                format!("must be at most {MAX_STEPS}"),
            ));
        }

        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(Error::invalid_parameter(
                "guidance_scale",
                "must be a finite non-negative number",
            ));
        }

        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(Error::invalid_parameter(
                "strength",
                "must be in (0.0, 1.0]",
            ));
        }

        let schedule = (0..self.denoising_steps).collect();
        if DdpmScheduler::truncate(schedule, self.strength).is_empty() {
            return Err(Error::invalid_parameter(
                "strength",
                format!(
                    "leaves no denoising steps out of {}",
                    self.denoising_steps
                ),
            ));
        }

        if !(1..=100).contains(&self.output_quality) {
            return Err(Error::invalid_parameter(
                "output_quality",
                "must be between 1 and 100",
            ));
        }

        Ok(())
    }
}

/// Result of one try-on.
#[derive(Debug, Clone)]
pub struct TryOnOutput {
    /// Canonical 768x1024 image, or the full original photo when cropped.
    pub image: RgbImage,
    /// Person with the repainted region grayed out, at 768x1024.
    pub mask_preview: GrayImage,
}

/// Virtual try-on over a loaded [`ModelRegistry`].
pub struct TryOn {
    registry: ModelRegistry,
}

impl TryOn {
    #[must_use]
    pub const fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    /// Load every model described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if models cannot be loaded.
    pub fn load(config: &RegistryConfig) -> Result<Self> {
        Ok(Self::new(ModelRegistry::load(config)?))
    }

    /// Dress the person in `human` in the garment in `garment`.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable inputs or if any model fails.
    pub fn run(
        &mut self,
        human: &DynamicImage,
        garment: &DynamicImage,
        description: &str,
        config: &TryOnConfig,
    ) -> Result<TryOnOutput> {
        config.validate()?;

        tracing::info!("Normalizing inputs...");
        let garment = normalize_garment(garment)?;
        let human = normalize_human(human, config.auto_crop)?;

        let mask = self.mask(&human.canonical, config)?;
        let preview = mask_preview(&mask, &human.canonical);

        tracing::info!("Rendering DensePose...");
        let pose = self.densepose(&human.canonical)?;

        tracing::info!("Encoding prompts...");
        let negative = (config.guidance_scale > 1.0).then_some(config.negative_prompt.as_str());
        let prompt = self
            .registry
            .prompt
            .encode(&tryon_prompt(description), negative)?;
        let garment_condition = self
            .registry
            .prompt
            .encode(&garment_prompt(description), None)?
            .positive;

        let request = GenerationRequest {
            prompt: &prompt,
            garment_prompt: &garment_condition,
            pose: &pose,
            garment: &garment,
            mask: &mask,
            human: &human.canonical,
            seed: config.seed,
            steps: config.denoising_steps,
            guidance_scale: config.guidance_scale,
            strength: config.strength,
        };
        let generated = self.registry.generator.generate(&request)?;

        Ok(TryOnOutput {
            image: composite(&human, &generated),
            mask_preview: preview,
        })
    }

    /// Release the models.
    pub fn shutdown(self) {
        self.registry.shutdown();
    }

    fn mask(&mut self, human: &RgbImage, config: &TryOnConfig) -> Result<GrayImage> {
        match MaskMode::from_auto_flag(config.auto_mask) {
            MaskMode::Automatic => {
                tracing::info!(
                    "Computing {} mask from parsing and pose...",
                    config.mask_category
                );
                let working = working_size(human);
                let keypoints = self.registry.pose.estimate(&working)?;
                let labels = self.registry.parser.parse(&working)?;
                tracing::debug!("Detected {} of 18 joints", keypoints.detected());
                let mask = garment_mask(&labels, &keypoints, config.mask_category, config.mask_variant);
                Ok(to_canonical(&mask))
            }
            MaskMode::Manual => {
                tracing::info!("Thresholding manual mask...");
                Ok(threshold_mask(human, MANUAL_THRESHOLD))
            }
        }
    }

    fn densepose(&mut self, human: &RgbImage) -> Result<RgbImage> {
        let bgr = to_bgr_array(&working_size(human));
        let rendered = self.registry.densepose.render(&bgr)?;
        Ok(imageops::resize(
            &rendered,
            CANONICAL_WIDTH,
            CANONICAL_HEIGHT,
            FilterType::Lanczos3,
        ))
    }
}

fn working_size(img: &RgbImage) -> RgbImage {
    imageops::resize(img, WORKING_WIDTH, WORKING_HEIGHT, FilterType::Lanczos3)
}

fn composite(human: &NormalizedHuman, generated: &RgbImage) -> RgbImage {
    match human.crop {
        Some(region) => {
            tracing::debug!("Pasting result back into {region:?}");
            restore_crop(&human.original, generated, region)
        }
        None => generated.clone(),
    }
}

/// Load models, run one try-on and release the models.
///
/// `seed: None` draws a fresh seed from the OS.
///
/// # Errors
///
/// Returns an error if models cannot be loaded or the run fails.
#[allow(clippy::too_many_arguments)]
pub fn run_tryon<P: AsRef<Path>>(
    model_assets_path: P,
    human: &DynamicImage,
    garment: &DynamicImage,
    description: &str,
    auto_mask: bool,
    auto_crop: bool,
    steps: usize,
    seed: Option<u64>,
) -> Result<TryOnOutput> {
    let registry = RegistryConfig::new(model_assets_path.as_ref().to_string_lossy());
    let config = TryOnConfig {
        auto_mask,
        auto_crop,
        denoising_steps: steps,
        seed,
        ..TryOnConfig::default()
    };
    config.validate()?;

    let mut tryon = TryOn::load(&registry)?;
    let output = tryon.run(human, garment, description, &config);
    tryon.shutdown();
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_config() {
        let config = TryOnConfig::default();
        assert!(config.auto_mask);
        assert!(!config.auto_crop);
        assert_eq!(config.denoising_steps, 30);
        assert_eq!(config.seed, Some(42));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_steps() {
        let config = TryOnConfig {
            denoising_steps: 0,
            ..TryOnConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_invalid_strength_and_quality() {
        for config in [
            TryOnConfig {
                strength: 0.0,
                ..TryOnConfig::default()
            },
            TryOnConfig {
                strength: 1.5,
                ..TryOnConfig::default()
            },
            TryOnConfig {
                output_quality: 0,
                ..TryOnConfig::default()
            },
            TryOnConfig {
                guidance_scale: f32::NAN,
                ..TryOnConfig::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_strength_leaving_no_steps() {
        let config = TryOnConfig {
            strength: 0.02,
            ..TryOnConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { ref name, .. } if name == "strength"));

        let config = TryOnConfig {
            strength: 0.04,
            ..TryOnConfig::default()
        };
        assert!(config.validate().is_ok(), "one of 30 steps survives");
    }

    #[test]
    fn test_run_tryon_rejects_bad_steps_before_loading() {
        let img = DynamicImage::new_rgb8(8, 8);
        let err = run_tryon("does-not-exist", &img, &img, "shirt", true, false, 0, Some(1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }
}
