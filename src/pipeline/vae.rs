//! SDXL autoencoder: pixels to scaled latents and back.

use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{Error, Result};
use crate::image::ImageTensor;
use crate::model::session::{extract_array4, missing_output};

use super::scheduler::LatentTensor;

/// SDXL latent scaling factor.
pub const VAE_SCALE: f32 = 0.13025;

/// Spatial downsampling between image and latent space.
pub const LATENT_FACTOR: usize = 8;

/// Latents for a `[-1, 1]` NCHW image, already multiplied by [`VAE_SCALE`].
///
/// A 768x1024 photo gives a `(1, 4, 128, 96)` latent.
///
/// # Errors
///
/// Returns an error if the encoder fails or returns no tensor.
pub fn encode(encoder: &mut Session, image: &ImageTensor) -> Result<LatentTensor> {
    let latent = run_single(encoder, image.clone(), "latent_sample")?;
    Ok(latent * VAE_SCALE)
}

/// Pixels in `[-1, 1]` for scaled latents.
///
/// # Errors
///
/// Returns an error if the decoder fails or returns no tensor.
pub fn decode(decoder: &mut Session, latent: &LatentTensor) -> Result<ImageTensor> {
    run_single(decoder, latent / VAE_SCALE, "sample")
}

/// One tensor in, the first output tensor back.
fn run_single(session: &mut Session, input: Array4<f32>, output: &str) -> Result<Array4<f32>> {
    let input = Tensor::from_array(input).map_err(|source| Error::Inference { source })?;
    let outputs = session
        .run(ort::inputs![input])
        .map_err(|source| Error::Inference { source })?;

    let value = outputs
        .values()
        .next()
        .ok_or_else(|| missing_output(output))?;
    extract_array4(&value)
}
