//! DDPM noise scheduler.

use ndarray::Array4;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{Error, Result};

/// Diffusion steps the model was trained with.
const TRAIN_TIMESTEPS: usize = 1000;

const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;

/// Offset added to every inference timestep ("leading" spacing).
const STEPS_OFFSET: usize = 1;

/// Floor for the posterior variance.
const MIN_VARIANCE: f64 = 1e-20;

/// Latent tensor type (1, 4, H/8, W/8).
pub type LatentTensor = Array4<f32>;

/// DDPM scheduler with scaled-linear betas and fixed-small variance.
#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    alphas_cumprod: Vec<f64>,
    step_ratio: usize,
}

impl Default for DdpmScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl DdpmScheduler {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new() -> Self {
        let (start, end) = (BETA_START.sqrt(), BETA_END.sqrt());
        let mut product = 1.0;
        let alphas_cumprod = (0..TRAIN_TIMESTEPS)
            .map(|i| {
                let t = i as f64 / (TRAIN_TIMESTEPS - 1) as f64;
                let beta = (t * (end - start) + start).powi(2);
                product *= 1.0 - beta;
                product
            })
            .collect();

        Self {
            alphas_cumprod,
            step_ratio: TRAIN_TIMESTEPS,
        }
    }

    /// Timesteps for `steps` inference steps, noisiest first.
    ///
    /// # Errors
    ///
    /// Returns an error if `steps` is zero or exceeds the training schedule.
    pub fn set_timesteps(&mut self, steps: usize) -> Result<Vec<usize>> {
        if steps == 0 || steps > TRAIN_TIMESTEPS {
            return Err(Error::invalid_parameter(
                "denoising_steps",
                format!("must be between 1 and {TRAIN_TIMESTEPS}"),
            ));
        }
        self.step_ratio = TRAIN_TIMESTEPS / steps;
        Ok((0..steps)
            .rev()
            .map(|i| i * self.step_ratio + STEPS_OFFSET)
            .collect())
    }

    /// Drop the noisiest steps so that only `strength` of the schedule runs.
    ///
    /// At strength 1.0 the whole schedule is kept and generation starts from
    /// pure noise.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn truncate(timesteps: Vec<usize>, strength: f32) -> Vec<usize> {
        let total = timesteps.len();
        let kept = ((total as f32 * strength) as usize).min(total);
        timesteps.into_iter().skip(total - kept).collect()
    }

    fn alpha_prod(&self, t: isize) -> f64 {
        usize::try_from(t)
            .ok()
            .and_then(|t| self.alphas_cumprod.get(t).copied())
            .unwrap_or(1.0)
    }

    /// Noise `original` to timestep `t`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn add_noise(&self, original: &LatentTensor, noise: &LatentTensor, t: usize) -> LatentTensor {
        let alpha = self.alpha_prod(t as isize);
        let signal = alpha.sqrt() as f32;
        let sigma = (1.0 - alpha).sqrt() as f32;
        original * signal + noise * sigma
    }

    /// One reverse step from `t` given the predicted noise `epsilon`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn step(
        &self,
        epsilon: &LatentTensor,
        t: usize,
        sample: &LatentTensor,
        rng: &mut StdRng,
    ) -> LatentTensor {
        let prev_t = t as isize - self.step_ratio as isize;

        let alpha_prod_t = self.alpha_prod(t as isize);
        let alpha_prod_prev = self.alpha_prod(prev_t);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let x0_from_sample = (1.0 / alpha_prod_t.sqrt()) as f32;
        let x0_from_eps = (beta_prod_t.sqrt() / alpha_prod_t.sqrt()) as f32;
        let pred_original = sample * x0_from_sample - epsilon * x0_from_eps;

        let original_coeff = (alpha_prod_prev.sqrt() * current_beta / beta_prod_t) as f32;
        let sample_coeff = (current_alpha.sqrt() * beta_prod_prev / beta_prod_t) as f32;
        let mut prev = pred_original * original_coeff + sample * sample_coeff;

        if t > 0 {
            let variance = (beta_prod_prev / beta_prod_t * current_beta).max(MIN_VARIANCE);
            let std = variance.sqrt() as f32;
            prev += &(randn(prev.dim(), rng) * std);
        }

        prev
    }
}

/// Standard-normal tensor drawn from `rng`.
#[must_use]
pub fn randn(shape: (usize, usize, usize, usize), rng: &mut StdRng) -> LatentTensor {
    Array4::from_shape_simple_fn(shape, || StandardNormal.sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    #[test]
    fn test_leading_timesteps() {
        let mut scheduler = DdpmScheduler::new();
        let timesteps = scheduler.set_timesteps(30).unwrap();
        assert_eq!(timesteps.len(), 30);
        assert_eq!(timesteps[0], 958);
        assert_eq!(timesteps[29], 1);
        assert!(timesteps.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_zero_steps_rejected() {
        assert!(DdpmScheduler::new().set_timesteps(0).is_err());
    }

    #[test]
    fn test_truncate_by_strength() {
        let timesteps: Vec<usize> = (0..30).rev().collect();
        assert_eq!(DdpmScheduler::truncate(timesteps.clone(), 1.0).len(), 30);
        let half = DdpmScheduler::truncate(timesteps, 0.5);
        assert_eq!(half.len(), 15);
        assert_eq!(half[0], 14);
    }

    #[test]
    fn test_alphas_decrease() {
        let scheduler = DdpmScheduler::new();
        assert!(scheduler.alphas_cumprod.windows(2).all(|w| w[1] < w[0]));
        assert!(scheduler.alphas_cumprod[TRAIN_TIMESTEPS - 1] > 0.0);
    }

    #[test]
    fn test_last_step_recovers_original() {
        let mut scheduler = DdpmScheduler::new();
        let timesteps = scheduler.set_timesteps(30).unwrap();
        let last = timesteps[timesteps.len() - 1];

        let mut rng = StdRng::seed_from_u64(7);
        let original = randn((1, 4, 8, 6), &mut rng);
        let noise = randn((1, 4, 8, 6), &mut rng);
        let noisy = scheduler.add_noise(&original, &noise, last);

        let recovered = scheduler.step(&noise, last, &noisy, &mut rng);
        for (a, b) in recovered.iter().zip(original.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let a = randn((1, 4, 4, 4), &mut StdRng::seed_from_u64(42));
        let b = randn((1, 4, 4, 4), &mut StdRng::seed_from_u64(42));
        let c = randn((1, 4, 4, 4), &mut StdRng::seed_from_u64(43));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
