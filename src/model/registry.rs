//! One-time loading of every model capability the pipeline uses.

use crate::densepose::{DensePoseAssets, DensePoseRenderer};
use crate::error::Result;
use crate::parsing::{HumanParser, OnnxHumanParser};
use crate::pipeline::{GeneratorSessions, InpaintGenerator, OnnxTryOnGenerator};
use crate::pose::{OnnxPoseEstimator, PoseEstimator};
use crate::prompt::{ClipTextEncoder, DualClipEncoder, PromptEncoder};

use super::loader::{AssetStore, ModelFile};
use super::session::Device;

/// Initialization-time settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Local bundle directory or hub repository id.
    pub assets: String,
    pub densepose: DensePoseAssets,
    pub device: Device,
}

impl RegistryConfig {
    /// Settings for `assets` with default DensePose paths on the CPU.
    #[must_use]
    pub fn new(assets: impl Into<String>) -> Self {
        Self {
            assets: assets.into(),
            densepose: DensePoseAssets::default(),
            device: Device::default(),
        }
    }
}

/// The loaded model capabilities, shared by every try-on run.
pub struct ModelRegistry {
    pub(crate) parser: Box<dyn HumanParser>,
    pub(crate) pose: Box<dyn PoseEstimator>,
    pub(crate) densepose: Box<dyn DensePoseRenderer>,
    pub(crate) prompt: Box<dyn PromptEncoder>,
    pub(crate) generator: Box<dyn InpaintGenerator>,
}

impl ModelRegistry {
    /// Load every model on the configured device.
    ///
    /// This will download models if the assets are a hub repository and the
    /// files are not already cached.
    ///
    /// # Errors
    ///
    /// Returns an error if any required asset is missing or fails to load.
    pub fn load(config: &RegistryConfig) -> Result<Self> {
        tracing::info!("Loading models on {}", config.device);
        let device = config.device;

        // Cheap checks first: DensePose files live outside the bundle.
        config.densepose.verify()?;
        let store = AssetStore::open(&config.assets)?;
        tracing::debug!("Model bundle at {}", store.root().display());

        tracing::info!("Loading human parser...");
        let parser = OnnxHumanParser::new(
            store.load_session(ModelFile::ParsingAtr, device)?,
            store.load_optional_session(ModelFile::ParsingLip, device)?,
        );

        tracing::info!("Loading pose estimator...");
        let pose = OnnxPoseEstimator::new(store.load_session(ModelFile::OpenPose, device)?);

        tracing::info!("Loading DensePose...");
        let densepose = config.densepose.load(device)?;

        tracing::info!("Loading text encoders...");
        let prompt = DualClipEncoder::new(
            ClipTextEncoder::primary(
                store.load_tokenizer(ModelFile::Tokenizer)?,
                store.load_session(ModelFile::TextEncoder, device)?,
            )?,
            ClipTextEncoder::secondary(
                store.load_tokenizer(ModelFile::Tokenizer2)?,
                store.load_session(ModelFile::TextEncoder2, device)?,
            )?,
        );

        tracing::info!("Loading VAE, image encoder and UNets...");
        let generator = OnnxTryOnGenerator::new(GeneratorSessions {
            vae_encoder: store.load_session(ModelFile::VaeEncoder, device)?,
            vae_decoder: store.load_session(ModelFile::VaeDecoder, device)?,
            image_encoder: store.load_session(ModelFile::ImageEncoder, device)?,
            unet_encoder: store.load_session(ModelFile::UnetEncoder, device)?,
            unet: store.load_session(ModelFile::Unet, device)?,
        });

        tracing::info!("Models loaded");

        Ok(Self::from_parts(
            Box::new(parser),
            Box::new(pose),
            Box::new(densepose),
            Box::new(prompt),
            Box::new(generator),
        ))
    }

    /// Assemble a registry from already-built capabilities.
    #[must_use]
    pub fn from_parts(
        parser: Box<dyn HumanParser>,
        pose: Box<dyn PoseEstimator>,
        densepose: Box<dyn DensePoseRenderer>,
        prompt: Box<dyn PromptEncoder>,
        generator: Box<dyn InpaintGenerator>,
    ) -> Self {
        Self {
            parser,
            pose,
            densepose,
            prompt,
            generator,
        }
    }

    /// Release every model.
    pub fn shutdown(self) {
        tracing::info!("Releasing models");
        drop(self);
    }
}
