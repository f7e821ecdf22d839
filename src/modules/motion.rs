//! Motion module wrappers.
//!
//! A motion module is a set of temporal-attention blocks inserted into a base
//! image model, one per up/down/mid block position. The wrapper owns the
//! blocks, knows which architecture family they belong to, and exposes the
//! capability surface the injection controller dispatches on.

use std::fmt;

use burn::module::{Ignored, Module, Param};
use burn::nn::Linear;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use super::attention::{AttentionImpl, TemporalAttention};
use crate::load::{fetch_tensor, ShapeMismatchError, WeightMap};
use crate::lora::MotionLoRAList;

/// Hotshot-XL modules carry an 8-position PE table; anything longer is v1/v2.
const HOTSHOT_PE_LENGTH: usize = 8;

/// Position family a motion block attaches at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockType {
    Up,
    Down,
    Mid,
}

impl BlockType {
    /// Weight-key and slot-path family for this position.
    pub fn family(&self) -> &'static str {
        match self {
            BlockType::Down => "down_blocks",
            BlockType::Up => "up_blocks",
            BlockType::Mid => "mid_block",
        }
    }
}

/// Motion module architecture family; decides which weight keys exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InjectorVersion {
    /// AnimateDiff v1/v2 layout; v2 adds a mid block.
    V1V2,
    /// Hotshot-XL layout; no mid block, 8-position PE table.
    HotshotXlV1,
}

impl InjectorVersion {
    /// Detect the architecture family from a weight mapping's key set.
    /// Returns `None` when the mapping has no positional-encoding keys at all.
    pub fn detect(weights: &WeightMap) -> Option<Self> {
        let max_pe = weights
            .iter()
            .filter(|(key, _)| key.ends_with("pos_encoder.pe"))
            .filter_map(|(_, data)| data.shape.get(1).copied())
            .max()?;

        if max_pe <= HOTSHOT_PE_LENGTH {
            Some(InjectorVersion::HotshotXlV1)
        } else {
            Some(InjectorVersion::V1V2)
        }
    }
}

impl fmt::Display for InjectorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectorVersion::V1V2 => write!(f, "v1/v2"),
            InjectorVersion::HotshotXlV1 => write!(f, "HSXL v1"),
        }
    }
}

/// Learned positional table added to frame tokens.
///
/// Rows are selected either by the active sub-sequence indices (set per
/// context window) or by the leading `seq` positions of the table.
#[derive(Module, Debug)]
pub struct PositionalEncoder<B: Backend> {
    pe: Param<Tensor<B, 3>>,
    video_length: usize,
    sub_idxs: Ignored<Option<Vec<usize>>>,
}

impl<B: Backend> PositionalEncoder<B> {
    /// Build from the table stored at `key`, shape `[1, max_len, dim]`.
    pub fn from_weights(
        key: &str,
        weights: &WeightMap,
        device: &B::Device,
    ) -> Result<Self, ShapeMismatchError> {
        let pe: Tensor<B, 3> = fetch_tensor(weights, key, device)?;
        let dims = pe.dims();
        if dims[0] != 1 {
            return Err(ShapeMismatchError::new(
                key,
                "[1, max_len, dim]",
                format!("{dims:?}"),
            ));
        }

        Ok(Self {
            pe: Param::from_tensor(pe),
            video_length: 0,
            sub_idxs: Ignored(None),
        })
    }

    /// Add positional rows to `x` `[batch, seq, dim]`. With sub-sequence
    /// indices installed their rows are used; otherwise the leading `seq`
    /// rows. `seq` must not exceed the table length.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [_, seq, dim] = x.dims();

        let rows = match &self.sub_idxs.0 {
            Some(idxs) => {
                let ids: Vec<i64> = idxs.iter().map(|&i| i as i64).collect();
                let indices = Tensor::<B, 1, Int>::from_data(ids.as_slice(), &x.device());
                self.pe.val().select(1, indices)
            }
            None => self.pe.val().slice([0..1, 0..seq, 0..dim]),
        };

        x + rows
    }

    /// Set the frame count the encoder is clipped to.
    pub fn set_video_length(&mut self, video_length: usize) {
        self.video_length = video_length;
    }

    /// Select which table rows the next forward passes use; an empty slice
    /// restores positional order.
    pub fn set_sub_idxs(&mut self, sub_idxs: &[usize]) {
        self.sub_idxs = Ignored(if sub_idxs.is_empty() {
            None
        } else {
            Some(sub_idxs.to_vec())
        });
    }

    /// Frame count the encoder is clipped to.
    pub fn video_length(&self) -> usize {
        self.video_length
    }

    /// Number of positions the table holds.
    pub fn max_length(&self) -> usize {
        self.pe.val().dims()[1]
    }
}

/// One temporal-attention block, attachable at a single model slot.
///
/// Projects frame tokens in, adds positional rows, attends across the frame
/// axis, projects back out, and adds the residual.
#[derive(Module, Debug)]
pub struct TemporalBlock<B: Backend> {
    proj_in: Linear<B>,
    pos_encoder: PositionalEncoder<B>,
    attn: TemporalAttention<B>,
    proj_out: Linear<B>,
}

impl<B: Backend> TemporalBlock<B> {
    /// Build the block from weights under `prefix`, validating every shape.
    pub fn from_weights(
        prefix: &str,
        weights: &WeightMap,
        attention: AttentionImpl,
        device: &B::Device,
    ) -> Result<Self, ShapeMismatchError> {
        let attn =
            TemporalAttention::from_weights(&format!("{prefix}.attn"), weights, attention, device)?;
        let dim = attn.channel_dim();

        let pos_encoder =
            PositionalEncoder::from_weights(&format!("{prefix}.pos_encoder.pe"), weights, device)?;
        let pe_dim = pos_encoder.pe.val().dims()[2];
        if pe_dim != dim {
            return Err(ShapeMismatchError::new(
                format!("{prefix}.pos_encoder.pe"),
                format!("dim {dim}"),
                format!("dim {pe_dim}"),
            ));
        }

        let proj_in = fetch_linear(weights, prefix, "proj_in", dim, dim, device)?;
        let proj_out = fetch_linear(weights, prefix, "proj_out", dim, dim, device)?;

        Ok(Self {
            proj_in,
            pos_encoder,
            attn,
            proj_out,
        })
    }

    /// Forward pass over frame tokens `[batch, frames, channels]`.
    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<&Tensor<B, 4>>) -> Tensor<B, 3> {
        let residual = x.clone();
        let h = self.proj_in.forward(x);
        let h = self.pos_encoder.forward(h);
        let h = self.attn.forward(h, None, mask);
        let h = self.proj_out.forward(h);
        residual + h
    }

    /// Set the frame count the block's positional encoding is clipped to.
    pub fn set_video_length(&mut self, video_length: usize) {
        self.pos_encoder.set_video_length(video_length);
    }

    /// Install or clear the runtime attention scale multiplier.
    pub fn set_scale_multiplier(&mut self, multiplier: Option<f32>) {
        self.attn.set_scale_multiplier(multiplier);
    }

    /// Select the positional rows for the active context window.
    pub fn set_sub_idxs(&mut self, sub_idxs: &[usize]) {
        self.pos_encoder.set_sub_idxs(sub_idxs);
    }

    /// The currently installed runtime scale multiplier.
    pub fn scale_multiplier(&self) -> Option<f32> {
        self.attn.scale_multiplier()
    }

    /// Frame count the block's positional encoding is clipped to.
    pub fn video_length(&self) -> usize {
        self.pos_encoder.video_length()
    }

    /// Number of positions in the block's PE table.
    pub fn max_pe_length(&self) -> usize {
        self.pos_encoder.max_length()
    }
}

fn fetch_linear<B: Backend>(
    weights: &WeightMap,
    prefix: &str,
    name: &str,
    d_input: usize,
    d_output: usize,
    device: &B::Device,
) -> Result<Linear<B>, ShapeMismatchError> {
    let weight_key = format!("{prefix}.{name}.weight");
    let weight: Tensor<B, 2> = fetch_tensor(weights, &weight_key, device)?;
    if weight.dims() != [d_input, d_output] {
        return Err(ShapeMismatchError::new(
            weight_key,
            format!("[{d_input}, {d_output}]"),
            format!("{:?}", weight.dims()),
        ));
    }

    let bias_key = format!("{prefix}.{name}.bias");
    let bias: Tensor<B, 1> = fetch_tensor(weights, &bias_key, device)?;
    if bias.dims() != [d_output] {
        return Err(ShapeMismatchError::new(
            bias_key,
            format!("[{d_output}]"),
            format!("{:?}", bias.dims()),
        ));
    }

    Ok(Linear {
        weight: Param::from_tensor(weight),
        bias: Some(Param::from_tensor(bias)),
    })
}

fn has_prefix(weights: &WeightMap, prefix: &str) -> bool {
    weights.keys().any(|key| key.starts_with(prefix))
}

/// Capability surface of an attachable motion module.
///
/// The injection controller works exclusively through this trait, so new
/// architecture families only have to provide these operations.
pub trait MotionWrapper<B: Backend> {
    /// Asset name the module was loaded under.
    fn name(&self) -> &str;

    /// Content hash of the module's base weights.
    fn content_hash(&self) -> &str;

    /// Architecture family of the module.
    fn version(&self) -> InjectorVersion;

    /// LoRA list merged into the module's weights, if any.
    fn loras(&self) -> Option<&MotionLoRAList>;

    /// Whether any LoRA deltas were merged in.
    fn has_loras(&self) -> bool {
        self.loras().is_some_and(|l| !l.is_empty())
    }

    /// Set the frame count every block clips its positional encoding to.
    fn set_video_length(&mut self, video_length: usize);

    /// Current frame count.
    fn video_length(&self) -> usize;

    /// Install or clear the runtime attention scale on every block.
    fn set_scale_multiplier(&mut self, multiplier: Option<f32>);

    /// Restore the default attention scale on every block.
    fn reset_scale_multiplier(&mut self) {
        self.set_scale_multiplier(None);
    }

    /// Select positional rows for the active context window on every block.
    fn set_sub_idxs(&mut self, sub_idxs: &[usize]);

    /// The blocks and the slot paths they attach at, in attach order.
    fn blocks(&self) -> Vec<(String, &TemporalBlock<B>)>;
}

/// AnimateDiff v1/v2 motion module: down and up blocks, mid block in v2.
#[derive(Debug, Clone)]
pub struct MotionModelV1V2<B: Backend> {
    name: String,
    content_hash: String,
    loras: Option<MotionLoRAList>,
    down_blocks: Vec<TemporalBlock<B>>,
    up_blocks: Vec<TemporalBlock<B>>,
    mid_block: Option<TemporalBlock<B>>,
    video_length: usize,
}

impl<B: Backend> MotionModelV1V2<B> {
    /// Build the module from an adjusted weight mapping.
    pub fn from_weights(
        name: impl Into<String>,
        content_hash: impl Into<String>,
        weights: &WeightMap,
        loras: Option<MotionLoRAList>,
        attention: AttentionImpl,
        device: &B::Device,
    ) -> Result<Self, ShapeMismatchError> {
        let down_blocks = collect_blocks(weights, BlockType::Down, attention, device)?;
        let up_blocks = collect_blocks(weights, BlockType::Up, attention, device)?;
        let mid_block = if has_prefix(weights, "mid_block.") {
            Some(TemporalBlock::from_weights(
                "mid_block",
                weights,
                attention,
                device,
            )?)
        } else {
            None
        };

        if down_blocks.is_empty() && up_blocks.is_empty() && mid_block.is_none() {
            return Err(ShapeMismatchError::new(
                "down_blocks.0",
                "at least one motion block",
                "no block keys",
            ));
        }

        Ok(Self {
            name: name.into(),
            content_hash: content_hash.into(),
            loras,
            down_blocks,
            up_blocks,
            mid_block,
            video_length: 0,
        })
    }

    fn blocks_mut(&mut self) -> impl Iterator<Item = &mut TemporalBlock<B>> {
        self.down_blocks
            .iter_mut()
            .chain(self.mid_block.iter_mut())
            .chain(self.up_blocks.iter_mut())
    }
}

impl<B: Backend> MotionWrapper<B> for MotionModelV1V2<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_hash(&self) -> &str {
        &self.content_hash
    }

    fn version(&self) -> InjectorVersion {
        InjectorVersion::V1V2
    }

    fn loras(&self) -> Option<&MotionLoRAList> {
        self.loras.as_ref()
    }

    fn set_video_length(&mut self, video_length: usize) {
        self.video_length = video_length;
        for block in self.blocks_mut() {
            block.set_video_length(video_length);
        }
    }

    fn video_length(&self) -> usize {
        self.video_length
    }

    fn set_scale_multiplier(&mut self, multiplier: Option<f32>) {
        for block in self.blocks_mut() {
            block.set_scale_multiplier(multiplier);
        }
    }

    fn set_sub_idxs(&mut self, sub_idxs: &[usize]) {
        for block in self.blocks_mut() {
            block.set_sub_idxs(sub_idxs);
        }
    }

    fn blocks(&self) -> Vec<(String, &TemporalBlock<B>)> {
        let mut out = Vec::new();
        for (i, block) in self.down_blocks.iter().enumerate() {
            out.push((format!("down_blocks.{i}.motion_module"), block));
        }
        if let Some(block) = &self.mid_block {
            out.push(("mid_block.motion_module".to_string(), block));
        }
        for (i, block) in self.up_blocks.iter().enumerate() {
            out.push((format!("up_blocks.{i}.motion_module"), block));
        }
        out
    }
}

/// Hotshot-XL motion module: down and up blocks only, 8-position PE tables.
#[derive(Debug, Clone)]
pub struct HotshotXlModel<B: Backend> {
    name: String,
    content_hash: String,
    loras: Option<MotionLoRAList>,
    down_blocks: Vec<TemporalBlock<B>>,
    up_blocks: Vec<TemporalBlock<B>>,
    video_length: usize,
}

impl<B: Backend> HotshotXlModel<B> {
    /// Build the module from an adjusted weight mapping.
    pub fn from_weights(
        name: impl Into<String>,
        content_hash: impl Into<String>,
        weights: &WeightMap,
        loras: Option<MotionLoRAList>,
        attention: AttentionImpl,
        device: &B::Device,
    ) -> Result<Self, ShapeMismatchError> {
        if has_prefix(weights, "mid_block.") {
            return Err(ShapeMismatchError::new(
                "mid_block",
                "no mid block in the Hotshot-XL layout",
                "mid block keys",
            ));
        }

        let down_blocks = collect_blocks(weights, BlockType::Down, attention, device)?;
        let up_blocks = collect_blocks(weights, BlockType::Up, attention, device)?;
        if down_blocks.is_empty() && up_blocks.is_empty() {
            return Err(ShapeMismatchError::new(
                "down_blocks.0",
                "at least one motion block",
                "no block keys",
            ));
        }

        for block in down_blocks.iter().chain(&up_blocks) {
            if block.max_pe_length() > HOTSHOT_PE_LENGTH {
                return Err(ShapeMismatchError::new(
                    "pos_encoder.pe",
                    format!("at most {HOTSHOT_PE_LENGTH} positions"),
                    format!("{} positions", block.max_pe_length()),
                ));
            }
        }

        Ok(Self {
            name: name.into(),
            content_hash: content_hash.into(),
            loras,
            down_blocks,
            up_blocks,
            video_length: 0,
        })
    }

    fn blocks_mut(&mut self) -> impl Iterator<Item = &mut TemporalBlock<B>> {
        self.down_blocks.iter_mut().chain(self.up_blocks.iter_mut())
    }
}

impl<B: Backend> MotionWrapper<B> for HotshotXlModel<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_hash(&self) -> &str {
        &self.content_hash
    }

    fn version(&self) -> InjectorVersion {
        InjectorVersion::HotshotXlV1
    }

    fn loras(&self) -> Option<&MotionLoRAList> {
        self.loras.as_ref()
    }

    fn set_video_length(&mut self, video_length: usize) {
        self.video_length = video_length;
        for block in self.blocks_mut() {
            block.set_video_length(video_length);
        }
    }

    fn video_length(&self) -> usize {
        self.video_length
    }

    fn set_scale_multiplier(&mut self, multiplier: Option<f32>) {
        for block in self.blocks_mut() {
            block.set_scale_multiplier(multiplier);
        }
    }

    fn set_sub_idxs(&mut self, sub_idxs: &[usize]) {
        for block in self.blocks_mut() {
            block.set_sub_idxs(sub_idxs);
        }
    }

    fn blocks(&self) -> Vec<(String, &TemporalBlock<B>)> {
        let mut out = Vec::new();
        for (i, block) in self.down_blocks.iter().enumerate() {
            out.push((format!("down_blocks.{i}.motion_module"), block));
        }
        for (i, block) in self.up_blocks.iter().enumerate() {
            out.push((format!("up_blocks.{i}.motion_module"), block));
        }
        out
    }
}

/// A motion module of any supported architecture family.
#[derive(Debug, Clone)]
pub enum MotionModel<B: Backend> {
    V1V2(MotionModelV1V2<B>),
    HotshotXl(HotshotXlModel<B>),
}

impl<B: Backend> MotionModel<B> {
    /// Build the wrapper matching `version` from an adjusted weight mapping.
    pub fn from_weights(
        name: impl Into<String>,
        content_hash: impl Into<String>,
        version: InjectorVersion,
        weights: &WeightMap,
        loras: Option<MotionLoRAList>,
        attention: AttentionImpl,
        device: &B::Device,
    ) -> Result<Self, ShapeMismatchError> {
        match version {
            InjectorVersion::V1V2 => MotionModelV1V2::from_weights(
                name,
                content_hash,
                weights,
                loras,
                attention,
                device,
            )
            .map(MotionModel::V1V2),
            InjectorVersion::HotshotXlV1 => HotshotXlModel::from_weights(
                name,
                content_hash,
                weights,
                loras,
                attention,
                device,
            )
            .map(MotionModel::HotshotXl),
        }
    }

    fn inner(&self) -> &dyn MotionWrapper<B> {
        match self {
            MotionModel::V1V2(m) => m,
            MotionModel::HotshotXl(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn MotionWrapper<B> {
        match self {
            MotionModel::V1V2(m) => m,
            MotionModel::HotshotXl(m) => m,
        }
    }
}

impl<B: Backend> MotionWrapper<B> for MotionModel<B> {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn content_hash(&self) -> &str {
        self.inner().content_hash()
    }

    fn version(&self) -> InjectorVersion {
        self.inner().version()
    }

    fn loras(&self) -> Option<&MotionLoRAList> {
        self.inner().loras()
    }

    fn set_video_length(&mut self, video_length: usize) {
        self.inner_mut().set_video_length(video_length);
    }

    fn video_length(&self) -> usize {
        self.inner().video_length()
    }

    fn set_scale_multiplier(&mut self, multiplier: Option<f32>) {
        self.inner_mut().set_scale_multiplier(multiplier);
    }

    fn set_sub_idxs(&mut self, sub_idxs: &[usize]) {
        self.inner_mut().set_sub_idxs(sub_idxs);
    }

    fn blocks(&self) -> Vec<(String, &TemporalBlock<B>)> {
        self.inner().blocks()
    }
}

fn collect_blocks<B: Backend>(
    weights: &WeightMap,
    block_type: BlockType,
    attention: AttentionImpl,
    device: &B::Device,
) -> Result<Vec<TemporalBlock<B>>, ShapeMismatchError> {
    let family = block_type.family();
    let mut blocks = Vec::new();
    for index in 0.. {
        let prefix = format!("{family}.{index}");
        if !has_prefix(weights, &format!("{prefix}.")) {
            break;
        }
        blocks.push(TemporalBlock::from_weights(
            &prefix, weights, attention, device,
        )?);
    }
    Ok(blocks)
}
