//! Seeded randomness for training runs
//!
//! Noise tensors come from a PCG32 stream so they are reproducible across
//! devices; scalar decisions (masking, frame picks, timesteps) come from a
//! seeded `StdRng`. Both are derived from the run seed.

use candle_core::{Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// PCG32 generator (XSH-RR output)
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(6364136223846793005).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        xorshifted.rotate_right((old >> 59) as u32)
    }

    /// Uniform float in [0, 1)
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * 5.9604645e-8
    }

    /// Pair of standard normal samples (Box-Muller)
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();
        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        (mag * angle.cos(), mag * angle.sin())
    }

    /// f32 tensor of standard normal noise
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let n = shape.elem_count();
        let mut data = Vec::with_capacity(n + 1);
        while data.len() < n {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(n);
        Tensor::from_vec(data, shape, device)
    }
}

/// All random draws of one training run
#[derive(Debug, Clone)]
pub struct TrainingRng {
    scalars: StdRng,
    noise: Pcg32,
}

impl TrainingRng {
    pub fn new(seed: u64) -> Self {
        Self {
            scalars: StdRng::seed_from_u64(seed),
            noise: Pcg32::new(seed, 54),
        }
    }

    /// True with probability `p`; never true for `p <= 0`
    pub fn chance(&mut self, p: f64) -> bool {
        p > 0.0 && self.scalars.r#gen::<f64>() < p
    }

    /// Uniform index in [0, n)
    pub fn index(&mut self, n: usize) -> usize {
        self.scalars.gen_range(0..n.max(1))
    }

    /// One training timestep per batch element
    pub fn timesteps(&mut self, batch: usize, num_train_timesteps: usize) -> Vec<usize> {
        (0..batch)
            .map(|_| self.scalars.gen_range(0..num_train_timesteps))
            .collect()
    }

    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        self.noise.randn(shape, device)
    }

    /// Gaussian noise shaped like `latents` ([B, C, F, H, W]).
    ///
    /// With `offset_strength`, adds a per-(batch, channel, frame) constant
    /// bias: `noise + strength * randn(B, C, F, 1, 1)`.
    pub fn sample_noise(&mut self, latents: &Tensor, offset_strength: Option<f64>) -> Result<Tensor> {
        let (b, c, f, _h, _w) = latents.dims5()?;
        let device = latents.device();
        let mut noise = self.randn(latents.shape(), device)?;
        if let Some(strength) = offset_strength {
            let offset = (self.randn((b, c, f, 1, 1), device)? * strength)?;
            noise = noise.broadcast_add(&offset)?;
        }
        noise.to_dtype(latents.dtype())
    }
}
