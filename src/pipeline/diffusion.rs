//! Mask-conditioned diffusion that paints the garment onto the person.

use image::{imageops, GrayImage, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, Array1, Array2, Array4, ArrayD, Axis};
use ort::session::Session;
use ort::value::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::image::{tensor_to_rgb, to_signed_tensor, to_unit_tensor, ImageTensor};
use crate::model::session::{extract_array, extract_array4, missing_output, output_names};
use crate::prompt::{PromptEmbeddings, TextCondition};

use super::scheduler::{randn, DdpmScheduler, LatentTensor};
use super::vae::{self, LATENT_FACTOR};

/// Latent channels produced by the VAE.
const LATENT_CHANNELS: usize = 4;

/// Side of the square image fed to the CLIP vision encoder.
const CLIP_IMAGE_SIZE: u32 = 224;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Everything one generation needs.
///
/// All images share the canonical size of `human`.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// Try-on prompt, with the negative branch when guidance is on.
    pub prompt: &'a PromptEmbeddings,
    /// Garment description embeddings (no negative branch).
    pub garment_prompt: &'a TextCondition,
    /// Rendered DensePose map.
    pub pose: &'a RgbImage,
    /// Normalized garment photo, also used as the IP-adapter image.
    pub garment: &'a RgbImage,
    /// Inpainting mask, 255 = regenerate.
    pub mask: &'a GrayImage,
    /// Normalized person photo.
    pub human: &'a RgbImage,
    /// `None` draws the seed from OS entropy.
    pub seed: Option<u64>,
    pub steps: usize,
    pub guidance_scale: f32,
    pub strength: f32,
}

impl GenerationRequest<'_> {
    /// Output width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.human.width()
    }

    /// Output height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.human.height()
    }

    /// Random generator for this request.
    #[must_use]
    pub fn rng(&self) -> StdRng {
        self.seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64)
    }

    /// Whether classifier-free guidance applies.
    #[must_use]
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.0 && self.prompt.negative.is_some()
    }

    fn check_sizes(&self) -> Result<()> {
        let expected = (self.width(), self.height());
        let sizes = [
            ("pose", self.pose.dimensions()),
            ("garment", self.garment.dimensions()),
            ("mask", self.mask.dimensions()),
        ];
        for (role, actual) in sizes {
            if actual != expected {
                return Err(Error::ShapeMismatch {
                    expected: format!("{role} {}x{}", expected.0, expected.1),
                    actual: format!("{}x{}", actual.0, actual.1),
                });
            }
        }
        if self.width() as usize % LATENT_FACTOR != 0 || self.height() as usize % LATENT_FACTOR != 0 {
            return Err(Error::invalid_parameter(
                "size",
                format!("{}x{} is not a multiple of {LATENT_FACTOR}", self.width(), self.height()),
            ));
        }
        Ok(())
    }
}

/// Produces the try-on image from prepared conditioning.
pub trait InpaintGenerator: Send {
    /// Generate an image the size of `request.human`.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails or the latents diverge.
    fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<RgbImage>;
}

/// ONNX sessions making up the try-on generator.
pub struct GeneratorSessions {
    pub vae_encoder: Session,
    pub vae_decoder: Session,
    pub image_encoder: Session,
    pub unet_encoder: Session,
    pub unet: Session,
}

/// SDXL inpainting UNet with a garment reference UNet and IP-adapter.
pub struct OnnxTryOnGenerator {
    sessions: GeneratorSessions,
    reference_outputs: Vec<String>,
    scheduler: DdpmScheduler,
}

/// Conditioning for one UNet branch (conditional or unconditional).
struct Branch<'a> {
    text: &'a TextCondition,
    image_embeds: ArrayD<f32>,
}

impl OnnxTryOnGenerator {
    #[must_use]
    pub fn new(sessions: GeneratorSessions) -> Self {
        let reference_outputs = output_names(&sessions.unet_encoder);
        tracing::debug!("Garment reference UNet exposes {} feature maps", reference_outputs.len());
        Self {
            sessions,
            reference_outputs,
            scheduler: DdpmScheduler::new(),
        }
    }

    /// Run the reference UNet over the garment latents once.
    fn reference_features(
        &mut self,
        garment_latents: &LatentTensor,
        garment_prompt: &TextCondition,
    ) -> Result<Vec<(String, ArrayD<f32>)>> {
        let sample = Tensor::from_array(garment_latents.clone())
            .map_err(|source| Error::Inference { source })?;
        let timestep = Tensor::from_array(Array1::from_vec(vec![0i64]))
            .map_err(|source| Error::Inference { source })?;
        let hidden = Tensor::from_array(garment_prompt.hidden.clone())
            .map_err(|source| Error::Inference { source })?;

        let outputs = self
            .sessions
            .unet_encoder
            .run(ort::inputs![
                "sample" => sample,
                "timestep" => timestep,
                "encoder_hidden_states" => hidden,
            ])
            .map_err(|source| Error::Inference { source })?;

        self.reference_outputs
            .iter()
            .map(|name| Ok((name.clone(), extract_array(&outputs[name.as_str()])?)))
            .collect()
    }

    /// IP-adapter embeddings from the CLIP vision encoder.
    fn image_embeds(&mut self, pixels: Array4<f32>) -> Result<ArrayD<f32>> {
        let input = Tensor::from_array(pixels).map_err(|source| Error::Inference { source })?;
        let outputs = self
            .sessions
            .image_encoder
            .run(ort::inputs![input])
            .map_err(|source| Error::Inference { source })?;
        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("image_embeds"))?;
        extract_array(&output)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn predict_noise(
        &mut self,
        model_input: &LatentTensor,
        timestep: usize,
        branch: &Branch<'_>,
        time_ids: &Array2<f32>,
        reference: &[(String, ArrayD<f32>)],
    ) -> Result<LatentTensor> {
        let tensor = |array: ArrayD<f32>| {
            Tensor::from_array(array).map_err(|source| Error::Inference { source })
        };

        let mut inputs = ort::inputs![
            "sample" => tensor(model_input.clone().into_dyn())?,
            "timestep" => Tensor::from_array(Array1::from_vec(vec![timestep as i64]))
                .map_err(|source| Error::Inference { source })?,
            "encoder_hidden_states" => tensor(branch.text.hidden.clone().into_dyn())?,
            "text_embeds" => tensor(branch.text.pooled.clone().into_dyn())?,
            "time_ids" => tensor(time_ids.clone().into_dyn())?,
            "image_embeds" => tensor(branch.image_embeds.clone())?,
        ];
        for (name, feature) in reference {
            inputs.push((name.clone().into(), tensor(feature.clone())?.into()));
        }

        let outputs = self
            .sessions
            .unet
            .run(inputs)
            .map_err(|source| Error::Inference { source })?;
        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("noise prediction"))?;
        extract_array4(&output)
    }
}

impl InpaintGenerator for OnnxTryOnGenerator {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<RgbImage> {
        request.check_sizes()?;
        let mut rng = request.rng();

        let (width, height) = (request.width() as usize, request.height() as usize);
        let latent_shape = (1, LATENT_CHANNELS, height / LATENT_FACTOR, width / LATENT_FACTOR);

        tracing::info!("Encoding conditioning images...");
        let human = to_signed_tensor(request.human);
        let latent_mask = downsample_mask(request.mask, latent_shape.3, latent_shape.2);
        let masked_latents =
            vae::encode(&mut self.sessions.vae_encoder, &masked_image(&human, request.mask))?;
        let pose_latents =
            vae::encode(&mut self.sessions.vae_encoder, &to_signed_tensor(request.pose))?;
        let garment_latents =
            vae::encode(&mut self.sessions.vae_encoder, &to_signed_tensor(request.garment))?;

        let reference = self.reference_features(&garment_latents, request.garment_prompt)?;

        let cond = Branch {
            text: &request.prompt.positive,
            image_embeds: self.image_embeds(clip_pixels(request.garment))?,
        };
        let uncond = match (&request.prompt.negative, request.uses_guidance()) {
            (Some(negative), true) => Some(Branch {
                text: negative,
                image_embeds: self.image_embeds(Array4::zeros((
                    1,
                    3,
                    CLIP_IMAGE_SIZE as usize,
                    CLIP_IMAGE_SIZE as usize,
                )))?,
            }),
            _ => None,
        };

        let time_ids = Array2::from_shape_vec(
            (1, 6),
            vec![height as f32, width as f32, 0.0, 0.0, height as f32, width as f32],
        )
        .map_err(|_| Error::ShapeMismatch {
            expected: "6 time ids".to_string(),
            actual: "reshape failed".to_string(),
        })?;

        let timesteps = self.scheduler.set_timesteps(request.steps)?;
        let timesteps = DdpmScheduler::truncate(timesteps, request.strength);
        let Some(&first) = timesteps.first() else {
            return Err(Error::invalid_parameter(
                "strength",
                "leaves no denoising steps to run",
            ));
        };

        let noise = randn(latent_shape, &mut rng);
        let mut latents = if request.strength >= 1.0 {
            noise
        } else {
            let image_latents = vae::encode(&mut self.sessions.vae_encoder, &human)?;
            self.scheduler.add_noise(&image_latents, &noise, first)
        };

        tracing::info!(
            "Denoising {} steps (guidance {}, {})",
            timesteps.len(),
            request.guidance_scale,
            request.seed.map_or_else(|| "random seed".to_string(), |s| format!("seed {s}"))
        );

        let pb = ProgressBar::new(timesteps.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} Denoising [{bar:40.cyan/blue}] {pos}/{len}")
                .expect("valid template")
                .progress_chars("#>-"),
        );

        for (step, &t) in timesteps.iter().enumerate() {
            let model_input = concatenate(
                Axis(1),
                &[
                    latents.view(),
                    latent_mask.view(),
                    masked_latents.view(),
                    pose_latents.view(),
                ],
            )
            .map_err(|_| Error::ShapeMismatch {
                expected: "matching latent sizes".to_string(),
                actual: format!("{:?} vs {:?}", latents.dim(), pose_latents.dim()),
            })?;

            let cond_eps = self.predict_noise(&model_input, t, &cond, &time_ids, &reference)?;
            let eps = match &uncond {
                Some(branch) => {
                    let uncond_eps =
                        self.predict_noise(&model_input, t, branch, &time_ids, &reference)?;
                    guide(&uncond_eps, &cond_eps, request.guidance_scale)
                }
                None => cond_eps,
            };

            latents = self.scheduler.step(&eps, t, &latents, &mut rng);
            if !latents.iter().all(|v| v.is_finite()) {
                pb.abandon();
                return Err(Error::NumericalInstability { step });
            }

            pb.inc(1);
        }

        pb.finish_with_message("Denoising complete");

        tracing::info!("Decoding from latent space...");
        let image = vae::decode(&mut self.sessions.vae_decoder, &latents)?;
        Ok(tensor_to_rgb(&image))
    }
}

/// Classifier-free guidance.
fn guide(uncond: &LatentTensor, cond: &LatentTensor, scale: f32) -> LatentTensor {
    uncond + &((cond - uncond) * scale)
}

/// Mask at latent resolution (nearest), as a 1-channel tensor in [0, 1].
#[allow(clippy::cast_possible_truncation)]
fn downsample_mask(mask: &GrayImage, width: usize, height: usize) -> LatentTensor {
    let small = imageops::resize(
        mask,
        width as u32,
        height as u32,
        imageops::FilterType::Nearest,
    );
    Array4::from_shape_fn((1, 1, height, width), |(_, _, y, x)| {
        if small.get_pixel(x as u32, y as u32)[0] >= 128 {
            1.0
        } else {
            0.0
        }
    })
}

/// Human tensor with the masked region zeroed.
#[allow(clippy::cast_possible_truncation)]
fn masked_image(human: &ImageTensor, mask: &GrayImage) -> ImageTensor {
    let mut masked = human.clone();
    for ((_, _, y, x), value) in masked.indexed_iter_mut() {
        if mask.get_pixel(x as u32, y as u32)[0] >= 128 {
            *value = 0.0;
        }
    }
    masked
}

/// CLIP vision preprocessing: shortest side to 224, center crop, normalize.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn clip_pixels(img: &RgbImage) -> Array4<f32> {
    let (width, height) = img.dimensions();
    let scale = CLIP_IMAGE_SIZE as f32 / width.min(height) as f32;
    let resized_w = ((width as f32 * scale).round() as u32).max(CLIP_IMAGE_SIZE);
    let resized_h = ((height as f32 * scale).round() as u32).max(CLIP_IMAGE_SIZE);
    let resized = imageops::resize(img, resized_w, resized_h, imageops::FilterType::CatmullRom);

    let left = (resized_w - CLIP_IMAGE_SIZE) / 2;
    let top = (resized_h - CLIP_IMAGE_SIZE) / 2;
    let cropped =
        imageops::crop_imm(&resized, left, top, CLIP_IMAGE_SIZE, CLIP_IMAGE_SIZE).to_image();

    let mut pixels = to_unit_tensor(&cropped);
    for (c, mut channel) in pixels.axis_iter_mut(Axis(1)).enumerate() {
        channel.mapv_inplace(|v| (v - CLIP_MEAN[c]) / CLIP_STD[c]);
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::{Luma, Rgb};
    use ndarray::Array3;

    fn condition() -> TextCondition {
        TextCondition {
            hidden: Array3::zeros((1, 77, 8)),
            pooled: Array2::zeros((1, 4)),
        }
    }

    #[test]
    fn test_guidance_blend() {
        let uncond = Array4::from_elem((1, 1, 1, 2), 1.0);
        let cond = Array4::from_elem((1, 1, 1, 2), 3.0);
        let guided = guide(&uncond, &cond, 2.0);
        assert!(guided.iter().all(|&v| (v - 5.0).abs() < 1e-6));
    }

    #[test]
    fn test_downsample_mask_nearest() {
        let mut mask = GrayImage::new(16, 16);
        for y in 0..16 {
            for x in 8..16 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let latent = downsample_mask(&mask, 2, 2);
        assert_eq!(latent.dim(), (1, 1, 2, 2));
        assert_abs_diff_eq!(latent[[0, 0, 0, 0]], 0.0);
        assert_abs_diff_eq!(latent[[0, 0, 1, 1]], 1.0);
    }

    #[test]
    fn test_masked_image_zeroes_region() {
        let human = to_signed_tensor(&RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])));
        let mut mask = GrayImage::new(4, 4);
        mask.put_pixel(1, 2, Luma([255]));

        let masked = masked_image(&human, &mask);
        assert_abs_diff_eq!(masked[[0, 0, 2, 1]], 0.0);
        assert_abs_diff_eq!(masked[[0, 2, 0, 0]], 1.0);
    }

    #[test]
    fn test_clip_pixels_shape_and_normalization() {
        let pixels = clip_pixels(&RgbImage::from_pixel(768, 1024, Rgb([0, 0, 0])));
        assert_eq!(pixels.dim(), (1, 3, 224, 224));
        assert_abs_diff_eq!(pixels[[0, 0, 0, 0]], -CLIP_MEAN[0] / CLIP_STD[0], epsilon = 1e-5);
    }

    #[test]
    fn test_request_rejects_mismatched_sizes() {
        let prompt = PromptEmbeddings {
            positive: condition(),
            negative: None,
        };
        let garment_prompt = condition();
        let human = RgbImage::new(64, 64);
        let small = RgbImage::new(32, 32);
        let mask = GrayImage::new(64, 64);

        let request = GenerationRequest {
            prompt: &prompt,
            garment_prompt: &garment_prompt,
            pose: &small,
            garment: &human,
            mask: &mask,
            human: &human,
            seed: Some(1),
            steps: 2,
            guidance_scale: 2.0,
            strength: 1.0,
        };
        assert!(request.check_sizes().is_err());
        assert!(!request.uses_guidance());
    }
}
