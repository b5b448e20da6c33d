//! Adapter injection and gating on the spatio-temporal backbone
//!
//! Covers:
//! - Per-role injection counts and ensemble layout
//! - Unmatched targets and role disjointness
//! - Gate 0 being indistinguishable from no adapter
//! - Ensemble member addressing by stride

mod common;

use candle_core::{Device, Result, Tensor};
use candle_motion_director::{
    AdapterError, AdapterGate, AdapterManager, AdapterRole, Backbone, InjectedAdapters, LoraConfig, ScaleTarget,
    models::{SPATIAL_BLOCK_TYPE, TEMPORAL_BLOCK_TYPE},
    utils::deterministic_rng::Pcg32,
};
use common::{TEXT_DIM, TEXT_LEN, max_abs_diff, tiny_backbone};
use std::collections::HashMap;

fn lora() -> LoraConfig {
    LoraConfig {
        rank: 4,
        alpha: 4.0,
        dropout: 0.0,
    }
}

fn targets(block_type: &str) -> Vec<String> {
    vec![block_type.to_string()]
}

/// Overwrite every adapter tensor of a member with random values
fn randomize(adapters: &InjectedAdapters, member: usize, seed: u64) -> anyhow::Result<()> {
    let mut rng = Pcg32::new(seed, 11);
    let mut tensors = HashMap::new();
    for p in adapters.params().iter().filter(|p| p.member == member) {
        tensors.insert(p.name.clone(), (rng.randn(p.var.dims(), &Device::Cpu)? * 0.1)?);
    }
    adapters.load_state_dict(member, &tensors)?;
    Ok(())
}

fn inputs() -> Result<(Tensor, Tensor, Tensor)> {
    let device = Device::Cpu;
    let mut rng = Pcg32::new(5, 0);
    let sample = rng.randn((1, 4, 3, 4, 4), &device)?;
    let timesteps = Tensor::new(&[400u32], &device)?;
    let text = rng.randn((1, TEXT_LEN, TEXT_DIM), &device)?;
    Ok((sample, timesteps, text))
}

// ============================================================================
// Injection
// ============================================================================

#[test]
fn test_inject_counts_per_role() -> anyhow::Result<()> {
    let mut backbone = tiny_backbone(0)?;
    let mut rng = Pcg32::new(0, 7);

    let temporal = AdapterManager::inject(
        &mut backbone,
        &targets(TEMPORAL_BLOCK_TYPE),
        &lora(),
        AdapterRole::Temporal,
        1,
        &mut rng,
    )?;
    let spatial = AdapterManager::inject(
        &mut backbone,
        &targets(SPATIAL_BLOCK_TYPE),
        &lora(),
        AdapterRole::Spatial,
        2,
        &mut rng,
    )?;

    assert_eq!(temporal.sublayers().len(), 6);
    assert_eq!(temporal.params().len(), 12);
    assert_eq!(spatial.sublayers().len(), 10);
    assert_eq!(spatial.ensemble_size(), 2);
    assert_eq!(spatial.params().len(), 40);
    assert_eq!(spatial.member_vars(1).len(), 20);

    assert!(temporal.sublayers().iter().all(|s| s.block_type == TEMPORAL_BLOCK_TYPE));
    assert!(
        temporal
            .params()
            .iter()
            .any(|p| p.name == "blocks.0.temporal.attn1.to_q.lora_down.weight")
    );

    AdapterManager::ensure_disjoint(&spatial, &temporal)?;
    Ok(())
}

#[test]
fn test_unmatched_targets_fail() -> anyhow::Result<()> {
    let mut backbone = tiny_backbone(0)?;
    let result = AdapterManager::inject(
        &mut backbone,
        &targets("UNetMidBlock3DCrossAttn"),
        &lora(),
        AdapterRole::Spatial,
        1,
        &mut Pcg32::new(0, 7),
    );
    assert!(matches!(
        result,
        Err(AdapterError::NoMatchingSublayers {
            role: AdapterRole::Spatial,
            ..
        })
    ));
    Ok(())
}

#[test]
fn test_same_set_is_not_disjoint() -> anyhow::Result<()> {
    let mut backbone = tiny_backbone(0)?;
    let temporal = AdapterManager::inject(
        &mut backbone,
        &targets(TEMPORAL_BLOCK_TYPE),
        &lora(),
        AdapterRole::Temporal,
        1,
        &mut Pcg32::new(0, 7),
    )?;
    assert!(matches!(
        AdapterManager::ensure_disjoint(&temporal, &temporal.clone()),
        Err(AdapterError::Overlap { .. })
    ));
    Ok(())
}

#[test]
fn test_negation_set_excludes_trainable_names() -> anyhow::Result<()> {
    let mut backbone = tiny_backbone(0)?;
    let spatial = AdapterManager::inject(
        &mut backbone,
        &targets(SPATIAL_BLOCK_TYPE),
        &lora(),
        AdapterRole::Spatial,
        1,
        &mut Pcg32::new(0, 7),
    )?;
    assert!(spatial.negation().contains("blocks.0.spatial.attn1.to_q.weight"));
    assert!(spatial.params().iter().all(|p| !spatial.negation().contains(&p.name)));
    Ok(())
}

// ============================================================================
// Gating
// ============================================================================

#[test]
fn test_zero_gate_matches_plain_backbone() -> anyhow::Result<()> {
    let (sample, timesteps, text) = inputs()?;
    let plain = tiny_backbone(0)?;
    let reference = plain.forward(&sample, &timesteps, &text)?;

    let mut backbone = tiny_backbone(0)?;
    let temporal = AdapterManager::inject(
        &mut backbone,
        &targets(TEMPORAL_BLOCK_TYPE),
        &lora(),
        AdapterRole::Temporal,
        1,
        &mut Pcg32::new(0, 7),
    )?;
    randomize(&temporal, 0, 1)?;

    let adapted = backbone.forward(&sample, &timesteps, &text)?;
    assert!(max_abs_diff(&adapted, &reference)? > 1e-6);

    AdapterGate::set_scale(&mut backbone, ScaleTarget::Role(AdapterRole::Temporal), 0.0)?;
    let gated = backbone.forward(&sample, &timesteps, &text)?;
    assert_eq!(max_abs_diff(&gated, &reference)?, 0.0);
    Ok(())
}

#[test]
fn test_member_gate_addresses_stride() -> anyhow::Result<()> {
    let mut backbone = tiny_backbone(0)?;
    AdapterManager::inject(
        &mut backbone,
        &targets(SPATIAL_BLOCK_TYPE),
        &lora(),
        AdapterRole::Spatial,
        3,
        &mut Pcg32::new(0, 7),
    )?;

    AdapterGate::set_scale(&mut backbone, ScaleTarget::Role(AdapterRole::Spatial), 0.0)?;
    AdapterGate::set_scale(
        &mut backbone,
        ScaleTarget::Member {
            role: AdapterRole::Spatial,
            index: 1,
            ensemble_size: 3,
        },
        1.0,
    )?;

    let scales = AdapterGate::scales(&mut backbone, AdapterRole::Spatial)?;
    assert_eq!(scales.len(), 30);
    for (position, scale) in scales.iter().enumerate() {
        let expected = if position % 3 == 1 { 1.0 } else { 0.0 };
        assert_eq!(*scale, expected, "position {position}");
    }
    Ok(())
}

#[test]
fn test_role_gate_leaves_other_role() -> anyhow::Result<()> {
    let mut backbone = tiny_backbone(0)?;
    let mut rng = Pcg32::new(0, 7);
    for (role, block) in [
        (AdapterRole::Spatial, SPATIAL_BLOCK_TYPE),
        (AdapterRole::Temporal, TEMPORAL_BLOCK_TYPE),
    ] {
        AdapterManager::inject(&mut backbone, &targets(block), &lora(), role, 1, &mut rng)?;
    }

    AdapterGate::set_scale(&mut backbone, ScaleTarget::Role(AdapterRole::Spatial), 0.5)?;
    let spatial = AdapterGate::scales(&mut backbone, AdapterRole::Spatial)?;
    let temporal = AdapterGate::scales(&mut backbone, AdapterRole::Temporal)?;
    assert!(spatial.iter().all(|s| *s == 0.5));
    assert!(temporal.iter().all(|s| *s == 1.0));
    Ok(())
}

// ============================================================================
// Gradients
// ============================================================================

#[test]
fn test_gradients_reach_every_adapter() -> anyhow::Result<()> {
    let (sample, timesteps, text) = inputs()?;
    let mut backbone = tiny_backbone(0)?;
    let mut rng = Pcg32::new(0, 7);
    let temporal = AdapterManager::inject(
        &mut backbone,
        &targets(TEMPORAL_BLOCK_TYPE),
        &lora(),
        AdapterRole::Temporal,
        1,
        &mut rng,
    )?;
    let spatial = AdapterManager::inject(
        &mut backbone,
        &targets(SPATIAL_BLOCK_TYPE),
        &lora(),
        AdapterRole::Spatial,
        1,
        &mut rng,
    )?;

    for train in [true, false] {
        backbone.set_train(train)?;
        let out = backbone.forward(&sample, &timesteps, &text)?;
        let grads = out.sqr()?.mean_all()?.backward()?;
        for p in temporal.params().iter().chain(spatial.params()) {
            let grad = grads.get(p.var.as_tensor());
            assert!(grad.is_some(), "no gradient for {} (train: {train})", p.name);
            // Down projections see a zero up projection, so only up grads are non-zero
            if p.name.ends_with("lora_up.weight") {
                let norm = grad.map(|g| g.abs()?.sum_all()?.to_scalar::<f32>()).transpose()?;
                assert!(norm.is_some_and(|n| n > 0.0), "zero gradient for {}", p.name);
            }
        }
    }
    Ok(())
}
