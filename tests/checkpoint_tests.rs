//! Adapter artifact persistence
//!
//! Saving a role and loading it into a fresh backbone must reproduce the
//! adapted outputs exactly.

mod common;

use candle_core::{Device, Tensor};
use candle_motion_director::{
    AdapterError, AdapterManager, AdapterRole, Backbone, CheckpointError, CheckpointManager, InjectedAdapters,
    LoraConfig, OutputLayout, TrainingConfig,
    models::{SPATIAL_BLOCK_TYPE, TEMPORAL_BLOCK_TYPE},
    utils::deterministic_rng::Pcg32,
};
use common::{TEXT_DIM, TEXT_LEN, max_abs_diff, tiny_backbone};
use std::collections::HashMap;

fn inject(backbone: &mut dyn Backbone, role: AdapterRole, init_seed: u64) -> anyhow::Result<InjectedAdapters> {
    let block = match role {
        AdapterRole::Spatial => SPATIAL_BLOCK_TYPE,
        AdapterRole::Temporal => TEMPORAL_BLOCK_TYPE,
    };
    let lora = LoraConfig {
        rank: 4,
        alpha: 4.0,
        dropout: 0.0,
    };
    Ok(AdapterManager::inject(
        backbone,
        &[block.to_string()],
        &lora,
        role,
        1,
        &mut Pcg32::new(init_seed, 7),
    )?)
}

fn randomize(adapters: &InjectedAdapters, seed: u64) -> anyhow::Result<()> {
    let mut rng = Pcg32::new(seed, 11);
    let mut tensors = HashMap::new();
    for p in adapters.params() {
        tensors.insert(p.name.clone(), (rng.randn(p.var.dims(), &Device::Cpu)? * 0.1)?);
    }
    adapters.load_state_dict(0, &tensors)?;
    Ok(())
}

fn manager(root: &std::path::Path) -> CheckpointManager {
    let config = TrainingConfig {
        lora_name: "drift".to_string(),
        lora_rank: 4,
        ..Default::default()
    };
    CheckpointManager::new(OutputLayout::new(root), &config)
}

#[test]
fn test_temporal_round_trip_reproduces_outputs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager(dir.path());

    let mut trained = tiny_backbone(0)?;
    let adapters = inject(&mut trained, AdapterRole::Temporal, 1)?;
    randomize(&adapters, 2)?;
    let paths = manager.save(&adapters, 100)?;
    assert_eq!(paths.len(), 1);
    assert!(paths[0].ends_with("lora/temporal/100_drift_temporal.safetensors"));

    let mut restored = tiny_backbone(0)?;
    let fresh = inject(&mut restored, AdapterRole::Temporal, 99)?;
    let loaded = CheckpointManager::load_adapter_weights(&fresh, 0, &paths[0])?;
    assert_eq!(loaded, 12);

    let device = Device::Cpu;
    let mut rng = Pcg32::new(4, 0);
    let sample = rng.randn((1, 4, 3, 4, 4), &device)?;
    let timesteps = Tensor::new(&[250u32], &device)?;
    let text = rng.randn((1, TEXT_LEN, TEXT_DIM), &device)?;
    let expected = trained.forward(&sample, &timesteps, &text)?;
    let actual = restored.forward(&sample, &timesteps, &text)?;
    assert_eq!(max_abs_diff(&expected, &actual)?, 0.0);
    Ok(())
}

#[test]
fn test_key_formats_and_metadata() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager(dir.path());
    let mut backbone = tiny_backbone(0)?;
    let temporal = inject(&mut backbone, AdapterRole::Temporal, 1)?;
    let spatial = inject(&mut backbone, AdapterRole::Spatial, 2)?;

    let temporal_path = manager.save(&temporal, 5)?.remove(0);
    let spatial_path = manager.save(&spatial, 5)?.remove(0);

    let (tensors, metadata) = CheckpointManager::read(&temporal_path)?;
    assert!(tensors.keys().all(|k| !k.starts_with("unet.")));
    assert_eq!(metadata.get("role").map(String::as_str), Some("temporal"));
    assert_eq!(metadata.get("format").map(String::as_str), Some("motion_module"));
    assert_eq!(metadata.get("step").map(String::as_str), Some("5"));

    let (tensors, metadata) = CheckpointManager::read(&spatial_path)?;
    assert!(tensors.keys().all(|k| k.starts_with("unet.")));
    assert!(tensors.contains_key("unet.blocks.0.spatial.attn1.to_q.lora_up.weight"));
    assert_eq!(metadata.get("format").map(String::as_str), Some("unet"));

    // The unet prefix is stripped on load
    let loaded = CheckpointManager::load_adapter_weights(&spatial, 0, &spatial_path)?;
    assert_eq!(loaded, 20);
    Ok(())
}

#[test]
fn test_loading_wrong_role_fails() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager(dir.path());
    let mut backbone = tiny_backbone(0)?;
    let temporal = inject(&mut backbone, AdapterRole::Temporal, 1)?;
    let spatial = inject(&mut backbone, AdapterRole::Spatial, 2)?;

    let spatial_path = manager.save(&spatial, 1)?.remove(0);
    let result = CheckpointManager::load_adapter_weights(&temporal, 0, &spatial_path);
    assert!(matches!(
        result,
        Err(CheckpointError::Adapter(AdapterError::MissingTensor { .. }))
    ));
    Ok(())
}

#[test]
fn test_missing_artifact_is_io_error() {
    let result = CheckpointManager::read("/nonexistent/lora.safetensors");
    assert!(matches!(result, Err(CheckpointError::Io { .. })));
}
