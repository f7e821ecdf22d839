//! Temporal attention for motion modules.
//!
//! Attends across the frame axis within one context window. The attention
//! lowering is an explicit constructor dependency so callers pick the
//! full or memory-sliced computation up front instead of flipping a
//! process-wide switch.

use burn::module::{Ignored, Module, Param};
use burn::nn::Linear;
use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::load::{fetch_tensor, ShapeMismatchError, WeightMap};

/// Head count shared by every supported motion module family.
pub(crate) const TEMPORAL_HEADS: usize = 8;

/// Attention lowering.
///
/// `Sliced` computes attention in query chunks of `slice_size` rows,
/// trading speed for peak memory on long windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttentionImpl {
    /// Full attention in one matmul.
    #[default]
    Basic,
    /// Query-sliced attention; `slice_size` of 0 falls back to full.
    Sliced { slice_size: usize },
}

impl AttentionImpl {
    /// Compute scaled dot-product attention.
    ///
    /// # Arguments
    /// * `q`, `k`, `v` - Projected tensors [batch, heads, seq, head_dim]
    /// * `scale` - Score multiplier applied before softmax
    /// * `mask` - Optional additive mask [batch, heads, q_len, k_len]
    pub fn compute<B: Backend>(
        &self,
        q: Tensor<B, 4>,
        k: Tensor<B, 4>,
        v: Tensor<B, 4>,
        scale: f32,
        mask: Option<&Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        match *self {
            AttentionImpl::Basic => full_attention(q, k, v, scale, mask),
            AttentionImpl::Sliced { slice_size } => {
                let [_, _, seq, _] = q.dims();
                if slice_size == 0 || seq <= slice_size {
                    full_attention(q, k, v, scale, mask)
                } else {
                    sliced_attention(q, k, v, scale, mask, slice_size)
                }
            }
        }
    }
}

fn full_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    scale: f32,
    mask: Option<&Tensor<B, 4>>,
) -> Tensor<B, 4> {
    let mut attn = q.matmul(k.transpose()) * scale;
    if let Some(mask) = mask {
        attn = attn + mask.clone();
    }
    softmax(attn, 3).matmul(v)
}

/// Query-sliced attention: each chunk of query rows attends against all
/// keys, bounding the size of the live score matrix.
fn sliced_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    scale: f32,
    mask: Option<&Tensor<B, 4>>,
    slice_size: usize,
) -> Tensor<B, 4> {
    let [batch, heads, seq, head_dim] = q.dims();
    let [_, _, key_len, _] = k.dims();

    let num_slices = (seq + slice_size - 1) / slice_size;
    let mut outputs: Vec<Tensor<B, 4>> = Vec::with_capacity(num_slices);

    for i in 0..num_slices {
        let start = i * slice_size;
        let end = ((i + 1) * slice_size).min(seq);

        let q_slice = q
            .clone()
            .slice([0..batch, 0..heads, start..end, 0..head_dim]);

        let mut attn = q_slice.matmul(k.clone().transpose()) * scale;
        if let Some(mask) = mask {
            attn = attn + mask.clone().slice([0..batch, 0..heads, start..end, 0..key_len]);
        }
        outputs.push(softmax(attn, 3).matmul(v.clone()));
    }

    if outputs.len() == 1 {
        outputs.pop().unwrap()
    } else {
        Tensor::cat(outputs, 2)
    }
}

/// Temporal attention layer of a motion module.
///
/// Query/key/value projections carry no bias; the output projection does.
/// A runtime scale multiplier can replace the default `head_dim^-0.5`
/// scaling after injection without rebuilding the weights: keys are
/// pre-multiplied by `scale / default_scale` so the default scaling inside
/// the attention lowering nets out to the requested scale.
#[derive(Module, Debug)]
pub struct TemporalAttention<B: Backend> {
    to_q: Linear<B>,
    to_k: Linear<B>,
    to_v: Linear<B>,
    to_out: Linear<B>,
    heads: usize,
    dim_head: usize,
    default_scale: f32,
    scale: Ignored<Option<f32>>,
    attention: Ignored<AttentionImpl>,
}

impl<B: Backend> TemporalAttention<B> {
    /// Build the layer from weights under `prefix` (`{prefix}.to_q.weight`
    /// and so on), validating every shape before construction.
    pub fn from_weights(
        prefix: &str,
        weights: &WeightMap,
        attention: AttentionImpl,
        device: &B::Device,
    ) -> Result<Self, ShapeMismatchError> {
        let q_key = format!("{prefix}.to_q.weight");
        let to_q: Tensor<B, 2> = fetch_tensor(weights, &q_key, device)?;
        let [channel_dim, inner_dim] = to_q.dims();

        if inner_dim % TEMPORAL_HEADS != 0 {
            return Err(ShapeMismatchError::new(
                q_key,
                format!("inner dim divisible by {TEMPORAL_HEADS}"),
                format!("inner dim {inner_dim}"),
            ));
        }

        let to_k = fetch_projection(weights, prefix, "to_k", [channel_dim, inner_dim], device)?;
        let to_v = fetch_projection(weights, prefix, "to_v", [channel_dim, inner_dim], device)?;
        let out_w = fetch_projection(weights, prefix, "to_out", [inner_dim, channel_dim], device)?;

        let bias_key = format!("{prefix}.to_out.bias");
        let out_b: Tensor<B, 1> = fetch_tensor(weights, &bias_key, device)?;
        if out_b.dims() != [channel_dim] {
            return Err(ShapeMismatchError::new(
                bias_key,
                format!("[{channel_dim}]"),
                format!("{:?}", out_b.dims()),
            ));
        }

        let dim_head = inner_dim / TEMPORAL_HEADS;

        Ok(Self {
            to_q: Linear {
                weight: Param::from_tensor(to_q),
                bias: None,
            },
            to_k: Linear {
                weight: Param::from_tensor(to_k),
                bias: None,
            },
            to_v: Linear {
                weight: Param::from_tensor(to_v),
                bias: None,
            },
            to_out: Linear {
                weight: Param::from_tensor(out_w),
                bias: Some(Param::from_tensor(out_b)),
            },
            heads: TEMPORAL_HEADS,
            dim_head,
            default_scale: 1.0 / (dim_head as f32).sqrt(),
            scale: Ignored(None),
            attention: Ignored(attention),
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Query tokens [batch, seq, channels]
    /// * `context` - Key/value tokens; defaults to `x` (self-attention)
    /// * `mask` - Optional additive mask [batch, heads, q_len, k_len]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Option<Tensor<B, 3>>,
        mask: Option<&Tensor<B, 4>>,
    ) -> Tensor<B, 3> {
        let [batch, seq, _] = x.dims();

        let q = self.to_q.forward(x.clone());
        let context = context.unwrap_or(x);
        let [_, ctx_seq, _] = context.dims();
        let k = self.to_k.forward(context.clone());
        let v = self.to_v.forward(context);

        let q = q
            .reshape([batch, seq, self.heads, self.dim_head])
            .swap_dims(1, 2);
        let k = k
            .reshape([batch, ctx_seq, self.heads, self.dim_head])
            .swap_dims(1, 2);
        let v = v
            .reshape([batch, ctx_seq, self.heads, self.dim_head])
            .swap_dims(1, 2);

        let k = self.scaled_keys(k);
        let out = self
            .attention
            .0
            .compute(q, k, v, self.default_scale, mask);

        let out = out
            .swap_dims(1, 2)
            .reshape([batch, seq, self.heads * self.dim_head]);
        self.to_out.forward(out)
    }

    /// Apply the runtime scale multiplier to the key tensor, returning a new
    /// tensor; the default `head_dim^-0.5` applied inside the lowering then
    /// nets out to the requested scale.
    pub fn scaled_keys(&self, keys: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.scale.0 {
            Some(scale) => keys * (scale / self.default_scale),
            None => keys,
        }
    }

    /// Install or clear the runtime scale multiplier.
    pub fn set_scale_multiplier(&mut self, multiplier: Option<f32>) {
        self.scale = Ignored(multiplier);
    }

    /// The currently installed runtime scale multiplier.
    pub fn scale_multiplier(&self) -> Option<f32> {
        self.scale.0
    }

    /// Channel dimension of the layer.
    pub fn channel_dim(&self) -> usize {
        self.to_q.weight.dims()[0]
    }
}

fn fetch_projection<B: Backend>(
    weights: &WeightMap,
    prefix: &str,
    name: &str,
    expected: [usize; 2],
    device: &B::Device,
) -> Result<Tensor<B, 2>, ShapeMismatchError> {
    let key = format!("{prefix}.{name}.weight");
    let tensor: Tensor<B, 2> = fetch_tensor(weights, &key, device)?;
    if tensor.dims() != expected {
        return Err(ShapeMismatchError::new(
            key,
            format!("{expected:?}"),
            format!("{:?}", tensor.dims()),
        ));
    }
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestBackend};

    fn attention() -> TemporalAttention<TestBackend> {
        let mut weights = WeightMap::new();
        testing::insert_attention(&mut weights, "attn", 8);
        TemporalAttention::from_weights("attn", &weights, AttentionImpl::Basic, &testing::device())
            .unwrap()
    }

    fn frames() -> Tensor<TestBackend, 3> {
        let values: Vec<f32> = (0..4 * 8).map(|i| (i as f32 * 0.13).sin()).collect();
        Tensor::<TestBackend, 1>::from_data(values.as_slice(), &testing::device())
            .reshape([1, 4, 8])
    }

    #[test]
    fn runtime_scale_changes_output_and_resets() {
        let mut attn = attention();
        let baseline = attn.forward(frames(), None, None).to_data();

        attn.set_scale_multiplier(Some(2.0));
        let scaled = attn.forward(frames(), None, None).to_data();
        assert_ne!(
            baseline.to_vec::<f32>().unwrap(),
            scaled.to_vec::<f32>().unwrap()
        );

        attn.set_scale_multiplier(None);
        let restored = attn.forward(frames(), None, None).to_data();
        assert_eq!(
            baseline.to_vec::<f32>().unwrap(),
            restored.to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn scaled_keys_is_a_pure_transform() {
        let mut attn = attention();
        attn.set_scale_multiplier(Some(0.5));

        let keys = Tensor::<TestBackend, 1>::from_data(
            vec![1.0f32; 8].as_slice(),
            &testing::device(),
        )
        .reshape([1, 8, 1, 1]);
        let scaled = attn.scaled_keys(keys.clone());

        // Original tensor is untouched; the result carries the multiplier.
        // head_dim is 1 here, so the default scale is 1.0 and the factor is 0.5.
        assert_eq!(keys.to_data().to_vec::<f32>().unwrap(), vec![1.0f32; 8]);
        for value in scaled.to_data().to_vec::<f32>().unwrap() {
            assert!((value - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn sliced_attention_matches_basic() {
        let mut weights = WeightMap::new();
        testing::insert_attention(&mut weights, "attn", 8);
        let device = testing::device();

        let basic = TemporalAttention::<TestBackend>::from_weights(
            "attn",
            &weights,
            AttentionImpl::Basic,
            &device,
        )
        .unwrap();
        let sliced = TemporalAttention::<TestBackend>::from_weights(
            "attn",
            &weights,
            AttentionImpl::Sliced { slice_size: 2 },
            &device,
        )
        .unwrap();

        let a = basic.forward(frames(), None, None).to_data().to_vec::<f32>().unwrap();
        let b = sliced.forward(frames(), None, None).to_data().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn missing_projection_is_a_shape_error() {
        let mut weights = WeightMap::new();
        testing::insert_attention(&mut weights, "attn", 8);
        weights.remove("attn.to_v.weight");

        let err = TemporalAttention::<TestBackend>::from_weights(
            "attn",
            &weights,
            AttentionImpl::Basic,
            &testing::device(),
        )
        .unwrap_err();
        assert_eq!(err.key, "attn.to_v.weight");
        assert_eq!(err.found, "missing");
    }
}
