//! Weight-set loading boundary.
//!
//! The core never parses checkpoint files itself; it consumes weight mappings
//! (`name → tensor`) through the [`MotionWeightSource`] trait and leaves the
//! storage format to the embedding application. [`MemoryWeightSource`] is the
//! in-process implementation used by tests and by callers that already hold
//! the tensors.

use std::collections::HashMap;

use burn::prelude::*;
use burn::tensor::TensorData;
use thiserror::Error;

use crate::modules::motion::InjectorVersion;

/// Rank-erased weight mapping, as produced by a loader.
pub type WeightMap = HashMap<String, TensorData>;

/// Error at the weight-loading boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("motion asset not found: {0}")]
    NotFound(String),
    #[error("weight set {0} has no recognizable motion module layout")]
    UnrecognizedLayout(String),
}

/// Adjusted or loaded weight tensor incompatible with its target slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("weight {key}: expected {expected}, found {found}")]
pub struct ShapeMismatchError {
    /// Weight key the mismatch was detected at.
    pub key: String,
    /// What the target slot requires.
    pub expected: String,
    /// What the mapping actually holds.
    pub found: String,
}

impl ShapeMismatchError {
    pub(crate) fn new(
        key: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// Pull a tensor of the given rank out of a weight mapping.
pub(crate) fn fetch_tensor<B: Backend, const D: usize>(
    weights: &WeightMap,
    key: &str,
    device: &B::Device,
) -> Result<Tensor<B, D>, ShapeMismatchError> {
    let data = weights
        .get(key)
        .ok_or_else(|| ShapeMismatchError::new(key, format!("rank-{D} tensor"), "missing"))?;
    if data.shape.len() != D {
        return Err(ShapeMismatchError::new(
            key,
            format!("rank-{D} tensor"),
            format!("shape {:?}", data.shape),
        ));
    }
    Ok(Tensor::from_data(data.clone(), device))
}

/// A motion module's base weights, as reported by a loader.
#[derive(Debug, Clone)]
pub struct LoadedMotionWeights {
    /// Weight mapping keyed by module path.
    pub weights: WeightMap,
    /// Architecture family detected from the key set.
    pub version: InjectorVersion,
    /// Content hash of the stored weight set.
    pub content_hash: String,
}

/// A LoRA weight-delta mapping, as reported by a loader.
#[derive(Debug, Clone)]
pub struct LoadedLoraDelta {
    /// Delta mapping; keys match the base weight mapping they apply to.
    pub weights: WeightMap,
    /// Content hash of the stored delta.
    pub content_hash: String,
}

/// Source of motion module weights and LoRA deltas.
pub trait MotionWeightSource {
    /// Load the named motion module's weight mapping.
    fn load_motion_weights(&self, name: &str) -> Result<LoadedMotionWeights, LoadError>;

    /// Load the named LoRA's weight-delta mapping.
    fn load_lora_delta(&self, name: &str) -> Result<LoadedLoraDelta, LoadError>;
}

/// In-memory weight source.
///
/// Acts as a read-only registry once populated: lookups hand out independent
/// copies, so adjustments made downstream never touch the registered
/// originals and the same entry can back any number of injections.
#[derive(Debug, Clone, Default)]
pub struct MemoryWeightSource {
    motion_models: HashMap<String, (WeightMap, String)>,
    loras: HashMap<String, (WeightMap, String)>,
}

impl MemoryWeightSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a motion module's weights under `name`.
    pub fn insert_motion_model(
        &mut self,
        name: impl Into<String>,
        weights: WeightMap,
        content_hash: impl Into<String>,
    ) {
        self.motion_models
            .insert(name.into(), (weights, content_hash.into()));
    }

    /// Register a LoRA delta under `name`.
    pub fn insert_lora(
        &mut self,
        name: impl Into<String>,
        weights: WeightMap,
        content_hash: impl Into<String>,
    ) {
        self.loras.insert(name.into(), (weights, content_hash.into()));
    }
}

impl MotionWeightSource for MemoryWeightSource {
    fn load_motion_weights(&self, name: &str) -> Result<LoadedMotionWeights, LoadError> {
        let (weights, content_hash) = self
            .motion_models
            .get(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        let version = InjectorVersion::detect(weights)
            .ok_or_else(|| LoadError::UnrecognizedLayout(name.to_string()))?;

        Ok(LoadedMotionWeights {
            weights: weights.clone(),
            version,
            content_hash: content_hash.clone(),
        })
    }

    fn load_lora_delta(&self, name: &str) -> Result<LoadedLoraDelta, LoadError> {
        let (weights, content_hash) = self
            .loras
            .get(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;

        Ok(LoadedLoraDelta {
            weights: weights.clone(),
            content_hash: content_hash.clone(),
        })
    }
}
