//! Motion model settings and injection parameters.

use serde::{Deserialize, Serialize};

use crate::context::ContextOptions;
use crate::lora::MotionLoRAList;
use crate::modules::motion::InjectorVersion;

/// Per-category weight adjustments for a loaded motion module.
///
/// Every field defaults to neutral, so a default settings object leaves the
/// weights untouched. Strengths multiply whole weight categories; the
/// positional-encoding fields reshape the PE table before strengths apply;
/// `attn_scale` is a runtime multiplier read by the attention module at call
/// time rather than baked into the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionModelSettings {
    /// Multiplier for the positional-encoding table.
    pub pe_strength: f32,
    /// Multiplier for attention projection weights.
    pub attn_strength: f32,
    /// Override for the query projection; inherits `attn_strength` when unset.
    pub attn_q_strength: Option<f32>,
    /// Override for the key projection.
    pub attn_k_strength: Option<f32>,
    /// Override for the value projection.
    pub attn_v_strength: Option<f32>,
    /// Override for the output projection weight.
    pub attn_out_weight_strength: Option<f32>,
    /// Override for the output projection bias.
    pub attn_out_bias_strength: Option<f32>,
    /// Multiplier for every weight outside the PE and attention categories.
    pub other_strength: f32,
    /// Extend the PE table by this many positions via interpolation.
    pub motion_pe_stretch: usize,
    /// Truncate the PE table to this length before other transforms; 0 keeps it.
    pub cap_initial_pe_length: usize,
    /// Resample the PE table to exactly this length; 0 keeps it.
    pub interpolate_pe_to_length: usize,
    /// Drop this many positions from the front of the (resampled) PE table.
    pub initial_pe_idx_offset: usize,
    /// Drop this many positions from the tail of the (resampled) PE table.
    pub final_pe_idx_offset: usize,
    /// Runtime attention scale; `None` keeps the module's default scale.
    pub attn_scale: Option<f32>,
}

impl Default for MotionModelSettings {
    fn default() -> Self {
        Self {
            pe_strength: 1.0,
            attn_strength: 1.0,
            attn_q_strength: None,
            attn_k_strength: None,
            attn_v_strength: None,
            attn_out_weight_strength: None,
            attn_out_bias_strength: None,
            other_strength: 1.0,
            motion_pe_stretch: 0,
            cap_initial_pe_length: 0,
            interpolate_pe_to_length: 0,
            initial_pe_idx_offset: 0,
            final_pe_idx_offset: 0,
            attn_scale: None,
        }
    }
}

impl MotionModelSettings {
    /// Neutral settings; adjusting with these returns the input unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the positional-encoding strength.
    pub fn with_pe_strength(mut self, pe_strength: f32) -> Self {
        self.pe_strength = pe_strength;
        self
    }

    /// Set the attention strength applied to all projections without an override.
    pub fn with_attn_strength(mut self, attn_strength: f32) -> Self {
        self.attn_strength = attn_strength;
        self
    }

    /// Set the strength for weights outside the PE and attention categories.
    pub fn with_other_strength(mut self, other_strength: f32) -> Self {
        self.other_strength = other_strength;
        self
    }

    /// Set the PE stretch length.
    pub fn with_motion_pe_stretch(mut self, motion_pe_stretch: usize) -> Self {
        self.motion_pe_stretch = motion_pe_stretch;
        self
    }

    /// Set the runtime attention scale.
    pub fn with_attn_scale(mut self, attn_scale: f32) -> Self {
        self.attn_scale = Some(attn_scale);
        self
    }
}

/// Resolved description of how a loaded motion module is adjusted and
/// attached to a host model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionParams {
    /// Name the motion module's weights are loaded under.
    pub model_name: String,
    /// Total frame count, when known at injection time. Absent means the
    /// whole sequence is treated as one window.
    pub video_length: Option<usize>,
    /// Windowing configuration; absent disables windowing.
    pub context: Option<ContextOptions>,
    /// LoRA deltas merged into the weights, in application order.
    pub loras: Option<MotionLoRAList>,
    /// Weight adjustments.
    pub settings: MotionModelSettings,
    /// Pin the expected architecture family; `None` accepts whatever the
    /// loader reports.
    pub injector: Option<InjectorVersion>,
}

impl InjectionParams {
    /// Parameters for injecting the named motion module with no windowing,
    /// no LoRAs, and neutral settings.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            video_length: None,
            context: None,
            loras: None,
            settings: MotionModelSettings::default(),
            injector: None,
        }
    }

    /// Enable context windowing.
    pub fn set_context(&mut self, context: ContextOptions) {
        self.context = Some(context);
    }

    /// Attach a LoRA list.
    pub fn set_loras(&mut self, loras: MotionLoRAList) {
        self.loras = Some(loras);
    }

    /// Replace the motion model settings.
    pub fn set_motion_model_settings(&mut self, settings: MotionModelSettings) {
        self.settings = settings;
    }

    /// Record the total frame count.
    pub fn set_video_length(&mut self, video_length: usize) {
        self.video_length = Some(video_length);
    }

    /// Frame capacity each attached module should clip its positional
    /// encoding to: the context length when windowing is active, otherwise
    /// the full video length.
    pub fn effective_video_length(&self) -> Option<usize> {
        self.context
            .as_ref()
            .map(|c| c.context_length)
            .or(self.video_length)
    }
}
