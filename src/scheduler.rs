//! Diffusion noise schedulers for motion LoRA training
//!
//! Training uses two DDPM forward-process instances that share a timestep
//! count but differ in beta schedule:
//! - spatial: `scaled_linear`
//! - temporal: `linear`
//!
//! Validation sampling uses a DDIM instance with "leading" timestep spacing
//! and a `steps_offset` so the earliest sampled timestep is 1 instead of 0.

use crate::config::NoiseSchedulerConfig;
use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Beta schedule of a diffusion forward process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

impl BetaSchedule {
    /// Compute the betas for `num_train_timesteps` steps
    pub fn betas(&self, num_train_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
        let n = num_train_timesteps;
        let lerp = |i: usize, start: f64, end: f64| {
            let t = i as f64 / (n - 1) as f64;
            start + t * (end - start)
        };
        match self {
            BetaSchedule::Linear => (0..n).map(|i| lerp(i, beta_start, beta_end)).collect(),
            BetaSchedule::ScaledLinear => {
                let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
                (0..n)
                    .map(|i| {
                        let beta_sqrt = lerp(i, start, end);
                        beta_sqrt * beta_sqrt
                    })
                    .collect()
            }
            BetaSchedule::SquaredcosCapV2 => {
                let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
                (0..n)
                    .map(|i| {
                        let t1 = i as f64 / n as f64;
                        let t2 = (i + 1) as f64 / n as f64;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect()
            }
        }
    }
}

fn cumulative_alphas(betas: &[f64]) -> Vec<f64> {
    let mut cumprod = 1.0;
    betas
        .iter()
        .map(|b| {
            cumprod *= 1.0 - b;
            cumprod
        })
        .collect()
}

/// Per-batch-element coefficient tensor broadcastable against `like`
fn batch_coefficients(values: Vec<f64>, like: &Tensor) -> Result<Tensor> {
    let mut shape = vec![values.len()];
    shape.extend(std::iter::repeat_n(1, like.rank().saturating_sub(1)));
    Tensor::from_vec(values, shape, like.device())?.to_dtype(like.dtype())
}

/// DDPM forward process used to noise clean latents during training
#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    schedule: BetaSchedule,
    alphas_cumprod: Vec<f64>,
}

impl DdpmScheduler {
    pub fn new(config: &NoiseSchedulerConfig, schedule: BetaSchedule) -> Self {
        let betas = schedule.betas(config.num_train_timesteps, config.beta_start, config.beta_end);
        Self {
            schedule,
            alphas_cumprod: cumulative_alphas(&betas),
        }
    }

    pub fn schedule(&self) -> BetaSchedule {
        self.schedule
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Noise `original` at per-batch-element timesteps:
    ///   x_t = sqrt(acp[t]) * x_0 + sqrt(1 - acp[t]) * noise
    ///
    /// `timesteps` holds one entry per batch element (dim 0 of `original`).
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let batch = original.dim(0)?;
        if timesteps.len() != batch {
            candle_core::bail!(
                "add_noise: {} timesteps for a batch of {}",
                timesteps.len(),
                batch
            );
        }
        let mut signal = Vec::with_capacity(batch);
        let mut sigma = Vec::with_capacity(batch);
        for &t in timesteps {
            let Some(&acp) = self.alphas_cumprod.get(t) else {
                candle_core::bail!(
                    "timestep {} outside [0, {})",
                    t,
                    self.alphas_cumprod.len()
                );
            };
            signal.push(acp.sqrt());
            sigma.push((1.0 - acp).sqrt());
        }
        let signal = batch_coefficients(signal, original)?;
        let sigma = batch_coefficients(sigma, original)?;
        original
            .broadcast_mul(&signal)?
            .broadcast_add(&noise.to_dtype(original.dtype())?.broadcast_mul(&sigma)?)
    }
}

/// Spatial and temporal training schedulers
#[derive(Debug, Clone)]
pub struct TrainingSchedulers {
    pub spatial: DdpmScheduler,
    pub temporal: DdpmScheduler,
}

impl TrainingSchedulers {
    pub fn new(config: &NoiseSchedulerConfig) -> Self {
        Self {
            spatial: DdpmScheduler::new(config, BetaSchedule::ScaledLinear),
            temporal: DdpmScheduler::new(config, BetaSchedule::Linear),
        }
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.temporal.num_train_timesteps()
    }
}

/// DDIM sampler scheduler (eta = 0, epsilon prediction)
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    steps_offset: usize,
    timesteps: Vec<usize>,
    step_ratio: usize,
}

impl DdimScheduler {
    pub fn new(config: &NoiseSchedulerConfig, schedule: BetaSchedule) -> Self {
        let betas = schedule.betas(config.num_train_timesteps, config.beta_start, config.beta_end);
        let alphas_cumprod = cumulative_alphas(&betas);
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };
        Self {
            alphas_cumprod,
            final_alpha_cumprod,
            steps_offset: config.steps_offset,
            timesteps: Vec::new(),
            step_ratio: 1,
        }
    }

    /// Compute "leading" spaced timesteps, descending
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let num_train = self.alphas_cumprod.len();
        if num_inference_steps == 0 || num_inference_steps > num_train {
            candle_core::bail!(
                "num_inference_steps must be in [1, {}], got {}",
                num_train,
                num_inference_steps
            );
        }
        self.step_ratio = num_train / num_inference_steps;
        self.timesteps = (0..num_inference_steps)
            .rev()
            .map(|i| (i * self.step_ratio + self.steps_offset).min(num_train - 1))
            .collect();
        Ok(())
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Initial latent noise standard deviation
    pub fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    /// One deterministic DDIM update from `timestep` to the previous one
    pub fn step(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_prev = timestep
            .checked_sub(self.step_ratio)
            .map(|t| self.alphas_cumprod[t])
            .unwrap_or(self.final_alpha_cumprod);

        let dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let eps = model_output.to_dtype(DType::F32)?;

        let pred_original = ((&sample - (&eps * (1.0 - alpha_prod_t).sqrt())?)? / alpha_prod_t.sqrt())?;
        let prev = ((pred_original * alpha_prod_prev.sqrt())? + (eps * (1.0 - alpha_prod_prev).sqrt())?)?;
        prev.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_beta_schedules() {
        let linear = BetaSchedule::Linear.betas(1000, 0.00085, 0.012);
        let scaled = BetaSchedule::ScaledLinear.betas(1000, 0.00085, 0.012);
        assert!((linear[0] - 0.00085).abs() < 1e-12);
        assert!((scaled[999] - 0.012).abs() < 1e-12);
        // scaled-linear lies below linear in the interior
        assert!(scaled[500] < linear[500]);

        let cosine = BetaSchedule::SquaredcosCapV2.betas(1000, 0.00085, 0.012);
        assert!(cosine.iter().all(|b| *b > 0.0 && *b <= 0.999));
    }

    #[test]
    fn test_add_noise_endpoints() -> Result<()> {
        let device = Device::Cpu;
        let config = NoiseSchedulerConfig::default();
        let ddpm = DdpmScheduler::new(&config, BetaSchedule::Linear);

        let x0 = Tensor::ones((2, 4, 3, 2, 2), DType::F32, &device)?;
        let noise = Tensor::zeros((2, 4, 3, 2, 2), DType::F32, &device)?;
        let noisy = ddpm.add_noise(&x0, &noise, &[0, 999])?;

        let first = noisy.get(0)?.flatten_all()?.to_vec1::<f32>()?;
        let last = noisy.get(1)?.flatten_all()?.to_vec1::<f32>()?;
        let acp = ddpm.alphas_cumprod();
        assert!((first[0] as f64 - acp[0].sqrt()).abs() < 1e-6);
        assert!((last[0] as f64 - acp[999].sqrt()).abs() < 1e-6);
        assert!(ddpm.add_noise(&x0, &noise, &[0]).is_err());
        Ok(())
    }

    #[test]
    fn test_ddim_leading_timesteps() -> Result<()> {
        let config = NoiseSchedulerConfig::default();
        let mut ddim = DdimScheduler::new(&config, BetaSchedule::Linear);
        ddim.set_timesteps(50)?;
        let ts = ddim.timesteps();
        assert_eq!(ts.len(), 50);
        assert_eq!(ts[0], 981);
        assert_eq!(*ts.last().unwrap(), 1);
        Ok(())
    }

    #[test]
    fn test_ddim_recovers_clean_sample() -> Result<()> {
        let device = Device::Cpu;
        let config = NoiseSchedulerConfig::default();
        let mut ddim = DdimScheduler::new(&config, BetaSchedule::Linear);
        ddim.set_timesteps(1)?;
        let t = ddim.timesteps()[0];

        // With the exact noise as model output, a single final step returns x_0.
        let ddpm = DdpmScheduler::new(&config, BetaSchedule::Linear);
        let x0 = Tensor::new(&[[0.5f32, -0.25]], &device)?;
        let noise = Tensor::new(&[[1.0f32, 2.0]], &device)?;
        let xt = ddpm.add_noise(&x0, &noise, &[t])?;
        let out = ddim.step(&noise, t, &xt)?.to_vec2::<f32>()?;
        assert!((out[0][0] - 0.5).abs() < 1e-4);
        assert!((out[0][1] + 0.25).abs() < 1e-4);
        Ok(())
    }
}
