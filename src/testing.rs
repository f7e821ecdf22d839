//! Shared fixtures for the unit tests: a CPU backend and synthetic motion
//! module weight mappings small enough to run everywhere.

use burn::tensor::TensorData;

use crate::load::WeightMap;

pub(crate) type TestBackend = burn::backend::NdArray;

pub(crate) fn device() -> burn::backend::ndarray::NdArrayDevice {
    Default::default()
}

/// Deterministic, non-uniform values so scaling and merging are observable.
fn varied(len: usize, salt: usize) -> Vec<f32> {
    (0..len)
        .map(|i| (((i + salt) as f32) * 0.37).sin() * 0.1)
        .collect()
}

fn salt(key: &str) -> usize {
    key.bytes().map(|b| b as usize).sum()
}

fn insert(map: &mut WeightMap, key: &str, shape: &[usize]) {
    let len = shape.iter().product();
    map.insert(
        key.to_string(),
        TensorData::new(varied(len, salt(key)), shape.to_vec()),
    );
}

/// Attention projection weights under `{prefix}.to_*`.
pub(crate) fn insert_attention(map: &mut WeightMap, prefix: &str, dim: usize) {
    insert(map, &format!("{prefix}.to_q.weight"), &[dim, dim]);
    insert(map, &format!("{prefix}.to_k.weight"), &[dim, dim]);
    insert(map, &format!("{prefix}.to_v.weight"), &[dim, dim]);
    insert(map, &format!("{prefix}.to_out.weight"), &[dim, dim]);
    insert(map, &format!("{prefix}.to_out.bias"), &[dim]);
}

/// Full temporal block weights under `prefix`.
pub(crate) fn insert_block(map: &mut WeightMap, prefix: &str, dim: usize, pe_len: usize) {
    insert_attention(map, &format!("{prefix}.attn"), dim);
    insert(map, &format!("{prefix}.pos_encoder.pe"), &[1, pe_len, dim]);
    insert(map, &format!("{prefix}.proj_in.weight"), &[dim, dim]);
    insert(map, &format!("{prefix}.proj_in.bias"), &[dim]);
    insert(map, &format!("{prefix}.proj_out.weight"), &[dim, dim]);
    insert(map, &format!("{prefix}.proj_out.bias"), &[dim]);
}

/// v1/v2-layout mapping: two down blocks, a mid block, two up blocks,
/// 24-position PE tables.
pub(crate) fn v1v2_weight_map() -> WeightMap {
    let mut map = WeightMap::new();
    for prefix in ["down_blocks.0", "down_blocks.1", "up_blocks.0", "up_blocks.1"] {
        insert_block(&mut map, prefix, 8, 24);
    }
    insert_block(&mut map, "mid_block", 8, 24);
    map
}

/// Hotshot-XL-layout mapping: no mid block, 8-position PE tables.
pub(crate) fn hotshot_weight_map() -> WeightMap {
    let mut map = WeightMap::new();
    for prefix in ["down_blocks.0", "down_blocks.1", "up_blocks.0", "up_blocks.1"] {
        insert_block(&mut map, prefix, 8, 8);
    }
    map
}
