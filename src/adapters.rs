//! Adapter Manager and Adapter Gate
//!
//! Injection walks the backbone's adaptable sublayers and attaches one
//! adapter per ensemble member to every sublayer whose block type is in the
//! role's target set. The returned [`InjectedAdapters`] holds the trainable
//! `Var`s (sharing storage with the attached adapters), so optimizer steps
//! and weight reloads are visible to the backbone without another walk.

use candle_core::{Device, Tensor, Var};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::backbone::{Backbone, SublayerInfo};
use crate::lora::{AdapterId, AdapterRole, LoraAdapter, LoraConfig};
use crate::utils::deterministic_rng::Pcg32;

/// Trainable adapter tensor with its state-dict key
#[derive(Debug, Clone)]
pub struct NamedVar {
    /// `<sublayer>.lora_down.weight` / `<sublayer>.lora_up.weight`
    pub name: String,
    pub member: usize,
    pub var: Var,
}

/// Result of injecting one role
#[derive(Debug, Clone)]
pub struct InjectedAdapters {
    role: AdapterRole,
    ensemble_size: usize,
    sublayers: Vec<SublayerInfo>,
    params: Vec<NamedVar>,
    negation: BTreeSet<String>,
}

impl InjectedAdapters {
    pub fn role(&self) -> AdapterRole {
        self.role
    }

    pub fn ensemble_size(&self) -> usize {
        self.ensemble_size
    }

    /// Matched sublayers, in injection order
    pub fn sublayers(&self) -> &[SublayerInfo] {
        &self.sublayers
    }

    pub fn params(&self) -> &[NamedVar] {
        &self.params
    }

    /// Trainable vars of one ensemble member
    pub fn member_vars(&self, member: usize) -> Vec<Var> {
        self.params
            .iter()
            .filter(|p| p.member == member)
            .map(|p| p.var.clone())
            .collect()
    }

    /// Frozen base parameter names that must never be optimized
    pub fn negation(&self) -> &BTreeSet<String> {
        &self.negation
    }

    /// CPU snapshot of one member's weights, keyed by state-dict name
    pub fn state_dict(&self, member: usize) -> candle_core::Result<Vec<(String, Tensor)>> {
        self.params
            .iter()
            .filter(|p| p.member == member)
            .map(|p| Ok((p.name.clone(), p.var.as_tensor().to_device(&Device::Cpu)?)))
            .collect()
    }

    /// Overwrite one member's weights in place; every key must be present
    pub fn load_state_dict(&self, member: usize, tensors: &HashMap<String, Tensor>) -> Result<usize, AdapterError> {
        let mut loaded = 0;
        for p in self.params.iter().filter(|p| p.member == member) {
            let tensor = tensors
                .get(&p.name)
                .ok_or_else(|| AdapterError::MissingTensor { name: p.name.clone() })?;
            if tensor.dims() != p.var.dims() {
                return Err(AdapterError::ShapeMismatch {
                    name: p.name.clone(),
                    expected: p.var.dims().to_vec(),
                    actual: tensor.dims().to_vec(),
                });
            }
            let tensor = tensor.to_device(p.var.device())?.to_dtype(p.var.dtype())?;
            p.var.set(&tensor)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

/// Attaches adapters to a backbone
#[derive(Debug)]
pub struct AdapterManager;

impl AdapterManager {
    /// Inject `ensemble_size` adapters per matching sublayer.
    ///
    /// Fails with [`AdapterError::NoMatchingSublayers`] when nothing matched.
    pub fn inject(
        backbone: &mut dyn Backbone,
        targets: &[String],
        config: &LoraConfig,
        role: AdapterRole,
        ensemble_size: usize,
        rng: &mut Pcg32,
    ) -> Result<InjectedAdapters, AdapterError> {
        let ensemble_size = ensemble_size.max(1);
        let mut sublayers = Vec::new();
        let mut params = Vec::new();
        let mut negation = BTreeSet::new();

        backbone.visit_sublayers(&mut |info, layer| {
            if !targets.iter().any(|t| t == info.block_type) {
                return Ok(());
            }
            let (in_dim, out_dim) = layer.dims()?;
            let device = layer.device().clone();
            for member in 0..ensemble_size {
                let adapter = LoraAdapter::new(AdapterId::new(role, member), in_dim, out_dim, config, rng, &device)?;
                params.push(NamedVar {
                    name: format!("{}.lora_down.weight", info.name),
                    member,
                    var: adapter.down().clone(),
                });
                params.push(NamedVar {
                    name: format!("{}.lora_up.weight", info.name),
                    member,
                    var: adapter.up().clone(),
                });
                layer.attach(adapter);
            }
            negation.insert(format!("{}.weight", info.name));
            if layer.base().bias().is_some() {
                negation.insert(format!("{}.bias", info.name));
            }
            sublayers.push(info.clone());
            Ok(())
        })?;

        if sublayers.is_empty() {
            return Err(AdapterError::NoMatchingSublayers {
                role,
                targets: targets.to_vec(),
            });
        }

        info!(
            role = %role,
            sublayers = sublayers.len(),
            ensemble_size,
            rank = config.rank,
            "Injected LoRA adapters"
        );

        Ok(InjectedAdapters {
            role,
            ensemble_size,
            sublayers,
            params,
            negation,
        })
    }

    /// Trainable sets of different roles must never share a tensor
    /// Fail if any name in `trainable` is a frozen base tensor of `adapters`
    pub fn ensure_trainable<'a>(
        adapters: &InjectedAdapters,
        role: AdapterRole,
        trainable: impl IntoIterator<Item = &'a String>,
    ) -> Result<(), AdapterError> {
        match trainable.into_iter().find(|name| adapters.negation.contains(*name)) {
            Some(name) => Err(AdapterError::FrozenTensor { role, name: name.clone() }),
            None => Ok(()),
        }
    }

    pub fn ensure_disjoint(a: &InjectedAdapters, b: &InjectedAdapters) -> Result<(), AdapterError> {
        let ids: HashSet<_> = a.params.iter().map(|p| p.var.as_tensor().id()).collect();
        if b.params.iter().any(|p| ids.contains(&p.var.as_tensor().id())) {
            return Err(AdapterError::Overlap {
                first: a.role,
                second: b.role,
            });
        }
        Ok(())
    }
}

/// Which adapters a gate change addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleTarget {
    /// Every adapter of a role
    Role(AdapterRole),
    /// One ensemble member: every `ensemble_size`-th entry of the role's
    /// flat, layer-major adapter list, starting at `index`
    Member {
        role: AdapterRole,
        index: usize,
        ensemble_size: usize,
    },
}

/// Runtime on/off switch for adapter contributions
#[derive(Debug)]
pub struct AdapterGate;

impl AdapterGate {
    /// Set the gate of the addressed adapters; read on the next forward pass
    pub fn set_scale(backbone: &mut dyn Backbone, target: ScaleTarget, value: f64) -> candle_core::Result<()> {
        let mut position = 0usize;
        backbone.visit_sublayers(&mut |_, layer| {
            for adapter in layer.adapters_mut() {
                match target {
                    ScaleTarget::Role(role) if adapter.id().role == role => adapter.set_scale(value),
                    ScaleTarget::Member {
                        role,
                        index,
                        ensemble_size,
                    } if adapter.id().role == role => {
                        if position % ensemble_size.max(1) == index {
                            adapter.set_scale(value);
                        }
                        position += 1;
                    }
                    _ => {}
                }
            }
            Ok(())
        })?;
        debug!(?target, value, "Adapter gate set");
        Ok(())
    }

    /// Current gates of a role, in flat order
    pub fn scales(backbone: &mut dyn Backbone, role: AdapterRole) -> candle_core::Result<Vec<f64>> {
        let mut scales = Vec::new();
        backbone.visit_sublayers(&mut |_, layer| {
            scales.extend(layer.adapters().iter().filter(|a| a.id().role == role).map(|a| a.scale()));
            Ok(())
        })?;
        Ok(scales)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("no sublayers matched {role} targets {targets:?}")]
    NoMatchingSublayers { role: AdapterRole, targets: Vec<String> },

    #[error("{first} and {second} adapters share trainable tensors")]
    Overlap { first: AdapterRole, second: AdapterRole },

    #[error("{role} optimizer would update frozen tensor {name}")]
    FrozenTensor { role: AdapterRole, name: String },

    #[error("missing adapter tensor {name}")]
    MissingTensor { name: String },

    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
