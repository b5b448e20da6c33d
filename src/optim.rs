//! Optimizers, learning rate schedules and the dynamic loss scaler
//!
//! Each adapter role (and each spatial ensemble member) owns one
//! [`RoleOptimizer`] and one [`LrSchedule`]. A single [`GradScaler`] is
//! shared by every backward pass of a training step.

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use std::f64::consts::PI;

use crate::config::{LrScheduleConfig, LrScheduleKind, OptimizerConfig, OptimizerKind};

// ===========================================================================
// Lion
// ===========================================================================

#[derive(Debug, Clone, Copy)]
pub struct ParamsLion {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
}

impl Default for ParamsLion {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.99,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug)]
struct LionVar {
    var: Var,
    momentum: Var,
}

/// Sign-momentum optimizer (Chen et al., "Symbolic Discovery of
/// Optimization Algorithms")
///
///   c = β1·m + (1-β1)·g
///   θ = θ·(1 - lr·wd) - lr·sign(c)
///   m = β2·m + (1-β2)·g
#[derive(Debug)]
pub struct Lion {
    vars: Vec<LionVar>,
    params: ParamsLion,
}

impl Optimizer for Lion {
    type Config = ParamsLion;

    fn new(vars: Vec<Var>, params: ParamsLion) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let momentum = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(LionVar { var, momentum })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsLion {
            lr,
            beta1,
            beta2,
            weight_decay,
        } = self.params;
        for v in self.vars.iter() {
            let theta = &v.var;
            let Some(g) = grads.get(theta) else {
                continue;
            };
            let m = v.momentum.as_tensor();
            let c = ((m * beta1)? + (g * (1.0 - beta1))?)?;
            let sign = (c.gt(0.0)?.to_dtype(c.dtype())? - c.lt(0.0)?.to_dtype(c.dtype())?)?;
            let next = ((theta.as_tensor() * (1.0 - lr * weight_decay))? - (sign * lr)?)?;
            let next_m = ((m * beta2)? + (g * (1.0 - beta2))?)?;
            theta.set(&next.detach())?;
            v.momentum.set(&next_m.detach())?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

// ===========================================================================
// Role optimizer
// ===========================================================================

/// Optimizer of one adapter role; never holds another role's parameters
pub enum RoleOptimizer {
    AdamW(AdamW),
    Lion(Lion),
}

impl RoleOptimizer {
    /// Build for `vars` at `base_lr`, applying the sign-optimizer
    /// compensation when Lion is selected
    pub fn new(vars: Vec<Var>, config: &OptimizerConfig, base_lr: f64) -> Result<Self> {
        let (lr, weight_decay) = config.effective(base_lr);
        match config.kind {
            OptimizerKind::AdamW => Ok(Self::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    beta1: config.beta1,
                    beta2: config.beta2,
                    eps: config.eps,
                    weight_decay,
                },
            )?)),
            OptimizerKind::Lion => Ok(Self::Lion(Lion::new(
                vars,
                ParamsLion {
                    lr,
                    beta1: config.beta1,
                    beta2: config.beta2,
                    weight_decay,
                },
            )?)),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::AdamW(opt) => opt.step(grads),
            Self::Lion(opt) => opt.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Lion(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Lion(opt) => opt.set_learning_rate(lr),
        }
    }
}

// ===========================================================================
// Learning rate schedule
// ===========================================================================

/// Step-counted learning rate schedule
#[derive(Debug, Clone)]
pub struct LrSchedule {
    kind: LrScheduleKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LrSchedule {
    pub fn new(config: &LrScheduleConfig, base_lr: f64, total_steps: usize) -> Self {
        Self {
            kind: config.kind,
            base_lr,
            warmup_steps: config.warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Learning rate at `step`
    pub fn lr_at(&self, step: usize) -> f64 {
        let warmup = self.warmup_steps;
        let factor = match self.kind {
            LrScheduleKind::Constant => 1.0,
            _ if step < warmup => step as f64 / warmup.max(1) as f64,
            LrScheduleKind::ConstantWithWarmup => 1.0,
            LrScheduleKind::Linear => {
                let remaining = self.total_steps.saturating_sub(step) as f64;
                (remaining / self.total_steps.saturating_sub(warmup).max(1) as f64).max(0.0)
            }
            LrScheduleKind::Cosine => {
                let decay = self.total_steps.saturating_sub(warmup).max(1) as f64;
                let progress = ((step - warmup) as f64 / decay).min(1.0);
                0.5 * (1.0 + (PI * progress).cos())
            }
        };
        self.base_lr * factor
    }

    /// Current learning rate
    pub fn lr(&self) -> f64 {
        self.lr_at(self.current_step)
    }

    /// Advance one step and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.lr()
    }

    /// Number of times [`step`](Self::step) was called
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

// ===========================================================================
// Gradient scaler
// ===========================================================================

/// Dynamic loss scaler shared by all backward passes of a step.
///
/// Losses are multiplied by the scale before backward; gradients are
/// unscaled per optimizer and checked for overflow. An overflowing
/// optimizer step is skipped. [`update`](Self::update) must run exactly once
/// per training step and adjusts the scale from the combined overflow state
/// of that step.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
    found_inf: bool,
    updates: usize,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { 65536.0 } else { 1.0 },
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
            found_inf: false,
            updates: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of completed [`update`](Self::update) calls
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Backward of the scaled loss
    pub fn backward(&self, loss: &Tensor) -> Result<GradStore> {
        if self.enabled {
            (loss.to_dtype(DType::F32)? * self.scale)?.backward()
        } else {
            loss.backward()
        }
    }

    /// Unscale the gradients of `vars`, then step `optimizer` unless any of
    /// them overflowed. Returns whether the step ran.
    pub fn step(&mut self, optimizer: &mut RoleOptimizer, grads: &mut GradStore, vars: &[Var]) -> Result<bool> {
        if !self.enabled {
            optimizer.step(grads)?;
            return Ok(true);
        }
        let inverse = 1.0 / self.scale;
        let mut overflow = false;
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                let g = (g * inverse)?;
                let norm = g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
                overflow |= !norm.is_finite();
                grads.insert(var.as_tensor(), g);
            }
        }
        if overflow {
            self.found_inf = true;
            return Ok(false);
        }
        optimizer.step(grads)?;
        Ok(true)
    }

    /// Adjust the scale from this step's overflow state
    pub fn update(&mut self) {
        self.updates += 1;
        if !self.enabled {
            return;
        }
        if std::mem::take(&mut self.found_inf) {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }
}
