//! Low-rank adapters attached to frozen linear sublayers
//!
//! An [`AdaptableLinear`] owns a frozen [`candle_nn::Linear`] plus any number
//! of [`LoraAdapter`]s. Each adapter carries its own gate scale, read at
//! forward time:
//!
//!   y = W x + b + sum_i gate_i * (alpha / r) * up_i(down_i(x))
//!
//! Adapters whose gate is exactly 0 are skipped, so a gated-off adapter
//! contributes nothing to the output and receives no gradient.

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Linear, Module};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::deterministic_rng::Pcg32;

/// The two decoupled training objectives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterRole {
    /// Per-frame appearance
    Spatial,
    /// Cross-frame motion
    Temporal,
}

impl AdapterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterRole::Spatial => "spatial",
            AdapterRole::Temporal => "temporal",
        }
    }
}

impl fmt::Display for AdapterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role plus ensemble member index (always 0 for temporal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterId {
    pub role: AdapterRole,
    pub member: usize,
}

impl AdapterId {
    pub fn new(role: AdapterRole, member: usize) -> Self {
        Self { role, member }
    }
}

/// Shape and regularization of injected adapters
#[derive(Debug, Clone, Copy)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f64,
    pub dropout: f32,
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

/// One rank-r adapter pair
#[derive(Debug)]
pub struct LoraAdapter {
    id: AdapterId,
    /// [rank, in_features]
    down: Var,
    /// [out_features, rank]
    up: Var,
    scaling: f64,
    dropout: f32,
    scale: f64,
    train: bool,
}

impl LoraAdapter {
    /// Down projection ~ N(0, 1/r), up projection zeros, gate 1
    pub fn new(
        id: AdapterId,
        in_features: usize,
        out_features: usize,
        config: &LoraConfig,
        rng: &mut Pcg32,
        device: &Device,
    ) -> Result<Self> {
        let std = 1.0 / config.rank as f64;
        let down = (rng.randn((config.rank, in_features), device)? * std)?;
        let up = Tensor::zeros((out_features, config.rank), DType::F32, device)?;
        Ok(Self {
            id,
            down: Var::from_tensor(&down)?,
            up: Var::from_tensor(&up)?,
            scaling: config.scaling(),
            dropout: config.dropout,
            scale: 1.0,
            train: true,
        })
    }

    pub fn id(&self) -> AdapterId {
        self.id
    }

    pub fn down(&self) -> &Var {
        &self.down
    }

    pub fn up(&self) -> &Var {
        &self.up
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }

    pub fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    pub fn is_active(&self) -> bool {
        self.scale != 0.0
    }

    /// Adapter branch output, already multiplied by gate and scaling
    pub fn delta(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let down = Linear::new(self.down.as_tensor().to_dtype(dtype)?, None);
        let up = Linear::new(self.up.as_tensor().to_dtype(dtype)?, None);
        let mut h = up.forward(&down.forward(x)?)?;
        if self.train && self.dropout > 0.0 {
            h = candle_nn::ops::dropout(&h, self.dropout)?;
        }
        h * (self.scale * self.scaling)
    }
}

/// Frozen linear sublayer with optional parallel adapters
#[derive(Debug)]
pub struct AdaptableLinear {
    base: Linear,
    adapters: Vec<LoraAdapter>,
}

impl AdaptableLinear {
    pub fn new(base: Linear) -> Self {
        Self {
            base,
            adapters: Vec::new(),
        }
    }

    /// Build from a `VarBuilder`, like `candle_nn::linear`
    pub fn load(vb: candle_nn::VarBuilder, in_dim: usize, out_dim: usize, bias: bool) -> Result<Self> {
        let base = if bias {
            candle_nn::linear(in_dim, out_dim, vb)?
        } else {
            candle_nn::linear_no_bias(in_dim, out_dim, vb)?
        };
        Ok(Self::new(base))
    }

    /// (in_features, out_features)
    pub fn dims(&self) -> Result<(usize, usize)> {
        let (out_dim, in_dim) = self.base.weight().dims2()?;
        Ok((in_dim, out_dim))
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    pub fn device(&self) -> &Device {
        self.base.weight().device()
    }

    pub fn attach(&mut self, adapter: LoraAdapter) {
        self.adapters.push(adapter);
    }

    pub fn adapters(&self) -> &[LoraAdapter] {
        &self.adapters
    }

    pub fn adapters_mut(&mut self) -> &mut [LoraAdapter] {
        &mut self.adapters
    }

    pub fn set_train(&mut self, train: bool) {
        for adapter in self.adapters.iter_mut() {
            adapter.set_train(train);
        }
    }
}

impl Module for AdaptableLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut y = self.base.forward(x)?;
        for adapter in self.adapters.iter().filter(|a| a.is_active()) {
            y = (y + adapter.delta(x)?)?;
        }
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frozen_linear(device: &Device) -> Result<Linear> {
        let w = Tensor::arange(0f32, 12., device)?.reshape((3, 4))?;
        let b = Tensor::new(&[0.5f32, -0.5, 1.0], device)?;
        Ok(Linear::new(w, Some(b)))
    }

    fn config() -> LoraConfig {
        LoraConfig {
            rank: 2,
            alpha: 2.0,
            dropout: 0.0,
        }
    }

    #[test]
    fn test_zero_up_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = AdaptableLinear::new(frozen_linear(&device)?);
        let x = Tensor::ones((2, 5, 4), DType::F32, &device)?;
        let before = layer.forward(&x)?;

        let mut rng = Pcg32::new(0, 54);
        let id = AdapterId::new(AdapterRole::Temporal, 0);
        layer.attach(LoraAdapter::new(id, 4, 3, &config(), &mut rng, &device)?);
        let after = layer.forward(&x)?;

        let diff = (before - after)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_gate_scales_delta() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = AdaptableLinear::new(frozen_linear(&device)?);
        let mut rng = Pcg32::new(1, 54);
        let adapter = LoraAdapter::new(AdapterId::new(AdapterRole::Spatial, 0), 4, 3, &config(), &mut rng, &device)?;
        adapter.up().set(&Tensor::ones((3, 2), DType::F32, &device)?)?;
        layer.attach(adapter);

        let x = Tensor::ones((1, 4), DType::F32, &device)?;
        let base = layer.base().forward(&x)?;
        let full = (layer.forward(&x)? - &base)?;

        layer.adapters_mut()[0].set_scale(0.5);
        let half = (layer.forward(&x)? - &base)?;
        let ratio = (half / full)?.flatten_all()?.to_vec1::<f32>()?;
        for r in ratio {
            assert!((r - 0.5).abs() < 1e-5);
        }

        layer.adapters_mut()[0].set_scale(0.0);
        let off = (layer.forward(&x)? - &base)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(off, 0.0);
        Ok(())
    }

    #[test]
    fn test_gradients_reach_adapter_only_when_active() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = AdaptableLinear::new(frozen_linear(&device)?);
        let mut rng = Pcg32::new(2, 54);
        layer.attach(LoraAdapter::new(AdapterId::new(AdapterRole::Spatial, 0), 4, 3, &config(), &mut rng, &device)?);
        let x = Tensor::ones((1, 4), DType::F32, &device)?;

        let grads = layer.forward(&x)?.sum_all()?.backward()?;
        assert!(grads.get(layer.adapters()[0].up().as_tensor()).is_some());

        layer.adapters_mut()[0].set_scale(0.0);
        let grads = layer.forward(&x)?.sum_all()?.backward()?;
        assert!(grads.get(layer.adapters()[0].up().as_tensor()).is_none());
        Ok(())
    }
}
