//! Motion-module injection for Burn-based video diffusion
//!
//! Extends a still-image diffusion model with temporal coherence: a loaded
//! motion module (temporal-attention blocks plus a positional table) is
//! adjusted per user settings and attached into a host model's slot
//! structure, and long frame sequences are split into bounded, overlapping
//! context windows the temporal attention can process one at a time.
//!
//! ## Components
//!
//! - **Context scheduler**: ordered, overlapping index windows over a frame
//!   count, with full coverage and a clamped wrap-around window for loops
//! - **Weight adjustment**: LoRA-delta merging, positional-encoding
//!   cap/stretch/interpolate/slice, per-category strength scaling
//! - **Injection controller**: reversible attach/eject of the adjusted
//!   blocks against copy-on-write host model handles
//!
//! ## Usage
//!
//! ```rust,ignore
//! use animotion_burn::{
//!     inject_motion_model, AttentionImpl, ContextOptions, ContextScheduler,
//!     InjectionParams, SlotModel,
//! };
//!
//! let mut params = InjectionParams::new("mm_sd_v15_v2");
//! params.set_video_length(64);
//! params.set_context(ContextOptions::new(16).with_overlap(4));
//!
//! let model = SlotModel::new();
//! let model = inject_motion_model(&model, &params, &source, AttentionImpl::Basic, &device)?;
//!
//! let schedule = ContextScheduler::new(64, ContextOptions::new(16).with_overlap(4))?;
//! for window in schedule.iter() {
//!     // slice latents by window.indices() and run the sampler
//! }
//! ```

pub mod adjust;
pub mod config;
pub mod context;
pub mod inject;
pub mod load;
pub mod lora;
pub mod modules;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use adjust::{adjust_weights, WeightCategory};
pub use config::{InjectionParams, MotionModelSettings};
pub use context::{
    ConfigurationError, ContextOptions, ContextSchedule, ContextScheduler, ContextWindow,
};
pub use inject::{
    eject_motion_model, inject_motion_model, HostModel, InjectError, InjectedState, SlotModel,
};
pub use load::{
    LoadError, LoadedLoraDelta, LoadedMotionWeights, MemoryWeightSource, MotionWeightSource,
    ShapeMismatchError, WeightMap,
};
pub use lora::{MotionLoRAInfo, MotionLoRAList};
pub use modules::attention::{AttentionImpl, TemporalAttention};
pub use modules::motion::{
    BlockType, InjectorVersion, MotionModel, MotionWrapper, TemporalBlock,
};
