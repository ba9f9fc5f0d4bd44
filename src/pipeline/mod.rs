//! Diffusion-based try-on pipeline.

mod diffusion;
mod scheduler;
mod tryon;
mod vae;

pub use diffusion::{GenerationRequest, GeneratorSessions, InpaintGenerator, OnnxTryOnGenerator};
pub use scheduler::{randn, DdpmScheduler, LatentTensor};
pub use tryon::{run_tryon, TryOn, TryOnConfig, TryOnOutput};
pub use vae::{LATENT_FACTOR, VAE_SCALE};
