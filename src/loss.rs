//! Training objectives
//!
//! All losses are computed in f32 regardless of the backbone dtype.

use candle_core::{DType, Result, Tensor};

/// Weight of the full prediction in the decentered term
pub const DECENTERED_ALPHA: f64 = std::f64::consts::SQRT_2;
/// Weight of the pivot frame in the decentered term
pub const DECENTERED_BETA: f64 = 1.0;

/// Mean squared error over every element
pub fn mse(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let pred = pred.to_dtype(DType::F32)?;
    let target = target.to_dtype(DType::F32)?;
    (pred - target)?.sqr()?.mean_all()
}

/// Spatial objective: MSE on frame 0 of the prediction.
///
/// `pred` is [B, C, F, H, W]; `target` is either [B, C, H, W] or
/// [B, C, 1, H, W].
pub fn spatial_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let pred = pred.narrow(2, 0, 1)?.squeeze(2)?;
    let target = match target.rank() {
        5 => target.narrow(2, 0, 1)?.squeeze(2)?,
        _ => target.clone(),
    };
    mse(&pred, &target)
}

/// Frame-relative consistency term around a pivot frame:
///
///   mse(α·pred - β·pred[pivot], α·target - β·target[pivot])
///
/// Zero whenever `pred == target`, for any pivot.
pub fn decentered_loss(pred: &Tensor, target: &Tensor, pivot: usize) -> Result<Tensor> {
    let pred = pred.to_dtype(DType::F32)?;
    let target = target.to_dtype(DType::F32)?;
    let decenter = |x: &Tensor| -> Result<Tensor> {
        let anchor = x.narrow(2, pivot, 1)?;
        (x * DECENTERED_ALPHA)?.broadcast_sub(&(anchor * DECENTERED_BETA)?)
    };
    mse(&decenter(&pred)?, &decenter(&target)?)
}

/// Temporal objective: full-clip MSE plus the decentered term
pub fn temporal_loss(pred: &Tensor, target: &Tensor, pivot: usize) -> Result<Tensor> {
    mse(pred, target)? + decentered_loss(pred, target, pivot)?
}

/// Scalar value of a loss tensor
pub fn loss_value(loss: &Tensor) -> Result<f32> {
    loss.to_dtype(DType::F32)?.to_scalar::<f32>()
}
