//! Motion module building blocks

pub mod attention;
pub mod motion;

pub use attention::{AttentionImpl, TemporalAttention};
pub use motion::{BlockType, InjectorVersion, MotionModel, MotionWrapper, TemporalBlock};
