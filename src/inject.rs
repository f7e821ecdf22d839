//! Injection controller.
//!
//! Attaches an adjusted motion module to a host model and reverses the
//! operation exactly. Per host model the lifecycle is uninjected → injected
//! → uninjected: injecting an already-injected handle fully ejects the
//! previous module first, and ejecting an uninjected handle is a no-op.
//!
//! Mutation is confined to the cloned handle returned by each call; the model
//! passed in is never touched, so concurrent holders of the original stay
//! valid. Injection is all-or-nothing: every weight shape is validated while
//! the module is built, before the first slot is written.

use std::collections::HashMap;

use burn::prelude::*;
use thiserror::Error;
use tracing::info;

use crate::adjust::adjust_weights;
use crate::config::InjectionParams;
use crate::context::ConfigurationError;
use crate::load::{LoadError, MotionWeightSource, ShapeMismatchError, WeightMap};
use crate::lora::MotionLoRAInfo;
use crate::modules::attention::AttentionImpl;
use crate::modules::motion::{InjectorVersion, MotionModel, MotionWrapper, TemporalBlock};

/// Failure while injecting a motion module. The host model is left in its
/// pre-injection state in every case.
#[derive(Error, Debug)]
pub enum InjectError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Shape(#[from] ShapeMismatchError),
    #[error(transparent)]
    Config(#[from] ConfigurationError),
    #[error("motion module {name} is {found}, injection params pin {expected}")]
    VersionMismatch {
        name: String,
        expected: InjectorVersion,
        found: InjectorVersion,
    },
}

/// Host model contract.
///
/// The host owns named sub-module slots and hands out copy-on-write handles;
/// a handle's slots can be rewritten without affecting other handles. The
/// injected-state accessors carry the process-local record that makes
/// ejection exact.
pub trait HostModel<B: Backend>: Sized {
    /// The module currently at `path`, if any.
    fn get_slot(&self, path: &str) -> Option<TemporalBlock<B>>;

    /// Place a module at `path`, or clear the slot with `None`.
    fn set_slot(&mut self, path: &str, module: Option<TemporalBlock<B>>);

    /// A new handle sharing unrelated state with this one.
    fn clone_handle(&self) -> Self;

    /// The injection record attached to this handle, if it is injected.
    fn injected_state(&self) -> Option<&InjectedState<B>>;

    /// Attach or clear the injection record.
    fn set_injected_state(&mut self, state: Option<InjectedState<B>>);
}

/// Record of one injection, held by the injected handle. Stores whatever the
/// touched slots held before so ejection can restore them exactly.
#[derive(Debug, Clone)]
pub struct InjectedState<B: Backend> {
    /// Name the motion module was loaded under.
    pub model_name: String,
    /// Content hash of the module's base weights.
    pub content_hash: String,
    /// Architecture family that was attached.
    pub version: InjectorVersion,
    /// Slot path → module previously at that slot (usually none).
    pub prior_slots: Vec<(String, Option<TemporalBlock<B>>)>,
}

/// Load, adjust, and attach the motion module described by `params`.
///
/// Returns a new injected handle; `model` itself is not modified. The
/// attached blocks have their video length and runtime attention scale set
/// from the params, so each can clip its positional encoding to the active
/// context window.
pub fn inject_motion_model<B: Backend, M: HostModel<B>>(
    model: &M,
    params: &InjectionParams,
    source: &impl MotionWeightSource,
    attention: AttentionImpl,
    device: &B::Device,
) -> Result<M, InjectError> {
    if let Some(context) = &params.context {
        context.validate()?;
    }

    let loaded = source.load_motion_weights(&params.model_name)?;
    if let Some(expected) = params.injector {
        if expected != loaded.version {
            return Err(InjectError::VersionMismatch {
                name: params.model_name.clone(),
                expected,
                found: loaded.version,
            });
        }
    }

    let mut deltas: Vec<(MotionLoRAInfo, WeightMap)> = Vec::new();
    if let Some(loras) = &params.loras {
        for lora in loras {
            let delta = source.load_lora_delta(&lora.name)?;
            deltas.push((lora.clone(), delta.weights));
        }
    }

    let adjusted = adjust_weights(&loaded.weights, &params.settings, &deltas)?;
    let mut wrapper = MotionModel::<B>::from_weights(
        params.model_name.as_str(),
        loaded.content_hash.as_str(),
        loaded.version,
        &adjusted,
        params.loras.clone(),
        attention,
        device,
    )?;

    if let Some(video_length) = params.effective_video_length() {
        wrapper.set_video_length(video_length);
    }
    wrapper.set_scale_multiplier(params.settings.attn_scale);

    let mut injected = model.clone_handle();
    if injected.injected_state().is_some() {
        injected = eject_motion_model(&injected);
    }

    let mut prior_slots = Vec::new();
    for (path, block) in wrapper.blocks() {
        prior_slots.push((path.clone(), injected.get_slot(&path)));
        injected.set_slot(&path, Some(block.clone()));
    }

    info!(
        model = %params.model_name,
        version = %loaded.version,
        blocks = prior_slots.len(),
        "attached motion module"
    );

    injected.set_injected_state(Some(InjectedState {
        model_name: params.model_name.clone(),
        content_hash: loaded.content_hash,
        version: loaded.version,
        prior_slots,
    }));

    Ok(injected)
}

/// Detach the injected motion module and restore the prior slot contents.
///
/// Returns a new uninjected handle; `model` itself is not modified. Calling
/// this on an uninjected handle returns an equivalent handle unchanged.
pub fn eject_motion_model<B: Backend, M: HostModel<B>>(model: &M) -> M {
    let mut restored = model.clone_handle();
    let Some(state) = restored.injected_state().cloned() else {
        return restored;
    };

    for (path, prior) in state.prior_slots {
        restored.set_slot(&path, prior);
    }
    restored.set_injected_state(None);
    info!(model = %state.model_name, "ejected motion module");
    restored
}

/// In-memory host model with named slots; the reference implementation of
/// the copy-on-write contract, also used by the tests.
#[derive(Debug, Clone, Default)]
pub struct SlotModel<B: Backend> {
    slots: HashMap<String, TemporalBlock<B>>,
    state: Option<InjectedState<B>>,
}

impl<B: Backend> SlotModel<B> {
    /// An empty host model.
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            state: None,
        }
    }

    /// Paths of the currently occupied slots, sorted.
    pub fn occupied_slots(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.slots.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

impl<B: Backend> HostModel<B> for SlotModel<B> {
    fn get_slot(&self, path: &str) -> Option<TemporalBlock<B>> {
        self.slots.get(path).cloned()
    }

    fn set_slot(&mut self, path: &str, module: Option<TemporalBlock<B>>) {
        match module {
            Some(module) => {
                self.slots.insert(path.to_string(), module);
            }
            None => {
                self.slots.remove(path);
            }
        }
    }

    fn clone_handle(&self) -> Self {
        self.clone()
    }

    fn injected_state(&self) -> Option<&InjectedState<B>> {
        self.state.as_ref()
    }

    fn set_injected_state(&mut self, state: Option<InjectedState<B>>) {
        self.state = state;
    }
}
