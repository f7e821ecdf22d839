//! Weight adjustment engine.
//!
//! Transforms a loaded motion-module weight mapping into an adjusted copy,
//! in a fixed order: LoRA deltas are merged in, the positional-encoding
//! table is reshaped, then category strengths scale every tensor. The input
//! mapping is never mutated, so a cached base mapping can back any number of
//! injections. The fourth adjustment, the runtime attention scale, is not
//! baked into weights; it lives on [`crate::modules::attention::TemporalAttention`]
//! and can change after injection.

use burn::tensor::TensorData;
use tracing::debug;

use crate::config::MotionModelSettings;
use crate::load::{ShapeMismatchError, WeightMap};
use crate::lora::MotionLoRAInfo;

/// Strength category a weight key falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightCategory {
    PositionalEncoding,
    AttnQ,
    AttnK,
    AttnV,
    AttnOutWeight,
    AttnOutBias,
    Other,
}

impl WeightCategory {
    /// Classify a weight key by its path suffix.
    pub fn of(key: &str) -> Self {
        if key.ends_with("pos_encoder.pe") {
            WeightCategory::PositionalEncoding
        } else if key.ends_with("attn.to_q.weight") {
            WeightCategory::AttnQ
        } else if key.ends_with("attn.to_k.weight") {
            WeightCategory::AttnK
        } else if key.ends_with("attn.to_v.weight") {
            WeightCategory::AttnV
        } else if key.ends_with("attn.to_out.weight") {
            WeightCategory::AttnOutWeight
        } else if key.ends_with("attn.to_out.bias") {
            WeightCategory::AttnOutBias
        } else {
            WeightCategory::Other
        }
    }
}

/// Produce the adjusted copy of `base` for the given settings and loaded
/// LoRA deltas (in application order). `base` is left untouched.
pub fn adjust_weights(
    base: &WeightMap,
    settings: &MotionModelSettings,
    loras: &[(MotionLoRAInfo, WeightMap)],
) -> Result<WeightMap, ShapeMismatchError> {
    let mut adjusted = base.clone();

    for (info, delta) in loras {
        merge_lora(&mut adjusted, info, delta)?;
    }

    if has_pe_transform(settings) {
        let pe_keys: Vec<String> = adjusted
            .keys()
            .filter(|key| WeightCategory::of(key) == WeightCategory::PositionalEncoding)
            .cloned()
            .collect();
        for key in pe_keys {
            let transformed = transform_pe(&key, &adjusted[&key], settings)?;
            adjusted.insert(key, transformed);
        }
    }

    for (key, data) in adjusted.iter_mut() {
        let strength = strength_for(key, settings);
        if strength != 1.0 {
            let values = as_f32(key, data)?;
            let scaled: Vec<f32> = values.into_iter().map(|v| v * strength).collect();
            let shape = data.shape.clone();
            *data = TensorData::new(scaled, shape);
        }
    }

    Ok(adjusted)
}

/// Add `strength * delta` onto every matching key of the running mapping.
/// Delta keys with no counterpart in the mapping are skipped; the key sets
/// differ legitimately between architecture families.
fn merge_lora(
    adjusted: &mut WeightMap,
    info: &MotionLoRAInfo,
    delta: &WeightMap,
) -> Result<(), ShapeMismatchError> {
    for (key, delta_data) in delta {
        let Some(current) = adjusted.get_mut(key) else {
            debug!(key = %key, lora = %info.name, "delta key not in weight mapping, skipped");
            continue;
        };
        if current.shape != delta_data.shape {
            return Err(ShapeMismatchError::new(
                key,
                format!("{:?}", current.shape),
                format!("{:?} in LoRA {}", delta_data.shape, info.name),
            ));
        }

        let mut values = as_f32(key, current)?;
        let delta_values = as_f32(key, delta_data)?;
        for (value, d) in values.iter_mut().zip(delta_values) {
            *value += info.strength * d;
        }
        let shape = current.shape.clone();
        *current = TensorData::new(values, shape);
    }
    debug!(lora = %info.name, strength = info.strength, "merged LoRA delta");
    Ok(())
}

fn has_pe_transform(settings: &MotionModelSettings) -> bool {
    settings.cap_initial_pe_length > 0
        || settings.motion_pe_stretch > 0
        || settings.interpolate_pe_to_length > 0
        || settings.initial_pe_idx_offset > 0
        || settings.final_pe_idx_offset > 0
}

/// Reshape a `[1, len, dim]` positional table: cap, stretch, interpolate,
/// then slice off the index offsets. Steps at their neutral 0 are no-ops.
fn transform_pe(
    key: &str,
    data: &TensorData,
    settings: &MotionModelSettings,
) -> Result<TensorData, ShapeMismatchError> {
    if data.shape.len() != 3 || data.shape[0] != 1 {
        return Err(ShapeMismatchError::new(
            key,
            "[1, max_len, dim]",
            format!("{:?}", data.shape),
        ));
    }
    let dim = data.shape[2];
    let mut len = data.shape[1];
    let mut values = as_f32(key, data)?;

    if settings.cap_initial_pe_length > 0 && settings.cap_initial_pe_length < len {
        len = settings.cap_initial_pe_length;
        values.truncate(len * dim);
    }

    if settings.motion_pe_stretch > 0 {
        let target = len + settings.motion_pe_stretch;
        values = resample_rows(&values, len, dim, target);
        len = target;
    }

    if settings.interpolate_pe_to_length > 0 {
        let target = settings.interpolate_pe_to_length;
        values = resample_rows(&values, len, dim, target);
        len = target;
    }

    let trimmed = settings.initial_pe_idx_offset + settings.final_pe_idx_offset;
    if trimmed >= len {
        return Err(ShapeMismatchError::new(
            key,
            format!("index offsets leaving at least 1 of {len} positions"),
            format!("offsets trimming {trimmed}"),
        ));
    }
    if settings.initial_pe_idx_offset > 0 {
        values.drain(..settings.initial_pe_idx_offset * dim);
        len -= settings.initial_pe_idx_offset;
    }
    if settings.final_pe_idx_offset > 0 {
        len -= settings.final_pe_idx_offset;
        values.truncate(len * dim);
    }

    debug!(key = %key, positions = len, "transformed positional encoding");
    Ok(TensorData::new(values, [1, len, dim]))
}

/// Linear interpolation along the position axis; channel values at the
/// first and last positions are preserved exactly.
fn resample_rows(values: &[f32], len: usize, dim: usize, target: usize) -> Vec<f32> {
    if target == len {
        return values.to_vec();
    }

    let mut out = vec![0.0f32; target * dim];
    for row in 0..target {
        let pos = if target <= 1 {
            0.0
        } else {
            (row as f32) * ((len - 1) as f32) / ((target - 1) as f32)
        };
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(len - 1);
        let frac = pos - lo as f32;
        for c in 0..dim {
            out[row * dim + c] = values[lo * dim + c] * (1.0 - frac) + values[hi * dim + c] * frac;
        }
    }
    out
}

fn strength_for(key: &str, settings: &MotionModelSettings) -> f32 {
    match WeightCategory::of(key) {
        WeightCategory::PositionalEncoding => settings.pe_strength,
        WeightCategory::AttnQ => settings.attn_q_strength.unwrap_or(settings.attn_strength),
        WeightCategory::AttnK => settings.attn_k_strength.unwrap_or(settings.attn_strength),
        WeightCategory::AttnV => settings.attn_v_strength.unwrap_or(settings.attn_strength),
        WeightCategory::AttnOutWeight => settings
            .attn_out_weight_strength
            .unwrap_or(settings.attn_strength),
        WeightCategory::AttnOutBias => settings
            .attn_out_bias_strength
            .unwrap_or(settings.attn_strength),
        WeightCategory::Other => settings.other_strength,
    }
}

fn as_f32(key: &str, data: &TensorData) -> Result<Vec<f32>, ShapeMismatchError> {
    data.to_vec::<f32>()
        .map_err(|_| ShapeMismatchError::new(key, "f32 tensor", format!("{:?} data", data.dtype)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn values(map: &WeightMap, key: &str) -> Vec<f32> {
        map[key].to_vec::<f32>().unwrap()
    }

    fn pe_map(len: usize, dim: usize, f: impl Fn(usize, usize) -> f32) -> WeightMap {
        let mut map = WeightMap::new();
        let data: Vec<f32> = (0..len * dim).map(|i| f(i / dim, i % dim)).collect();
        map.insert(
            "down_blocks.0.pos_encoder.pe".to_string(),
            TensorData::new(data, [1, len, dim]),
        );
        map
    }

    #[test]
    fn neutral_settings_leave_the_mapping_unchanged() {
        let base = testing::v1v2_weight_map();
        let adjusted = adjust_weights(&base, &MotionModelSettings::default(), &[]).unwrap();

        assert_eq!(adjusted.len(), base.len());
        for (key, data) in &base {
            assert_eq!(adjusted[key].shape, data.shape, "shape drift at {key}");
            assert_eq!(
                values(&adjusted, key),
                data.to_vec::<f32>().unwrap(),
                "value drift at {key}"
            );
        }
    }

    #[test]
    fn pe_strength_scales_the_positional_table() {
        let base = pe_map(32, 8, |_, _| 1.0);
        let settings = MotionModelSettings::default().with_pe_strength(0.5);
        let adjusted = adjust_weights(&base, &settings, &[]).unwrap();

        let pe = &adjusted["down_blocks.0.pos_encoder.pe"];
        assert_eq!(pe.shape, vec![1, 32, 8]);
        for value in pe.to_vec::<f32>().unwrap() {
            assert!((value - 0.5).abs() < 1e-6);
        }
        // Original mapping untouched.
        assert_eq!(values(&base, "down_blocks.0.pos_encoder.pe")[0], 1.0);
    }

    #[test]
    fn interpolation_preserves_endpoints() {
        let base = pe_map(32, 8, |row, _| row as f32);
        let settings = MotionModelSettings {
            interpolate_pe_to_length: 64,
            ..Default::default()
        };
        let adjusted = adjust_weights(&base, &settings, &[]).unwrap();

        let pe = &adjusted["down_blocks.0.pos_encoder.pe"];
        assert_eq!(pe.shape, vec![1, 64, 8]);
        let v = pe.to_vec::<f32>().unwrap();
        assert!((v[0] - 0.0).abs() < 1e-6);
        assert!((v[63 * 8] - 31.0).abs() < 1e-5);
    }

    #[test]
    fn stretch_extends_the_table() {
        let base = pe_map(32, 4, |row, _| row as f32);
        let settings = MotionModelSettings::default().with_motion_pe_stretch(32);
        let adjusted = adjust_weights(&base, &settings, &[]).unwrap();

        let pe = &adjusted["down_blocks.0.pos_encoder.pe"];
        assert_eq!(pe.shape, vec![1, 64, 4]);
        let v = pe.to_vec::<f32>().unwrap();
        assert!((v[63 * 4] - 31.0).abs() < 1e-5);
    }

    #[test]
    fn cap_and_offsets_slice_the_table() {
        let base = pe_map(32, 2, |row, _| row as f32);
        let settings = MotionModelSettings {
            cap_initial_pe_length: 16,
            initial_pe_idx_offset: 2,
            final_pe_idx_offset: 2,
            ..Default::default()
        };
        let adjusted = adjust_weights(&base, &settings, &[]).unwrap();

        let pe = &adjusted["down_blocks.0.pos_encoder.pe"];
        assert_eq!(pe.shape, vec![1, 12, 2]);
        let v = pe.to_vec::<f32>().unwrap();
        assert_eq!(v[0], 2.0);
        assert_eq!(v[11 * 2], 13.0);
    }

    #[test]
    fn offsets_consuming_the_whole_table_are_rejected() {
        let base = pe_map(8, 2, |row, _| row as f32);
        let settings = MotionModelSettings {
            initial_pe_idx_offset: 4,
            final_pe_idx_offset: 4,
            ..Default::default()
        };
        assert!(adjust_weights(&base, &settings, &[]).is_err());
    }

    #[test]
    fn lora_merge_is_additive_and_strength_scaled() {
        let base = pe_map(4, 2, |_, _| 1.0);
        let mut delta = WeightMap::new();
        delta.insert(
            "down_blocks.0.pos_encoder.pe".to_string(),
            TensorData::new(vec![2.0f32; 8], [1, 4, 2]),
        );
        let info = MotionLoRAInfo::new("zoom", 0.5, "h");

        let adjusted =
            adjust_weights(&base, &MotionModelSettings::default(), &[(info, delta)]).unwrap();
        for value in values(&adjusted, "down_blocks.0.pos_encoder.pe") {
            assert!((value - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn lora_merge_order_does_not_matter_for_disjoint_keys() {
        let base = testing::v1v2_weight_map();

        let mut delta_a = WeightMap::new();
        delta_a.insert(
            "down_blocks.0.attn.to_q.weight".to_string(),
            TensorData::new(vec![0.25f32; 64], [8, 8]),
        );
        let mut delta_b = WeightMap::new();
        delta_b.insert(
            "up_blocks.1.attn.to_v.weight".to_string(),
            TensorData::new(vec![-0.5f32; 64], [8, 8]),
        );
        let a = (MotionLoRAInfo::new("a", 1.0, "ha"), delta_a);
        let b = (MotionLoRAInfo::new("b", 0.8, "hb"), delta_b);

        let settings = MotionModelSettings::default();
        let ab = adjust_weights(&base, &settings, &[a.clone(), b.clone()]).unwrap();
        let ba = adjust_weights(&base, &settings, &[b, a]).unwrap();

        for key in base.keys() {
            assert_eq!(values(&ab, key), values(&ba, key), "divergence at {key}");
        }
    }

    #[test]
    fn lora_keys_missing_from_the_base_are_skipped() {
        let base = pe_map(4, 2, |_, _| 1.0);
        let mut delta = WeightMap::new();
        delta.insert(
            "up_blocks.9.attn.to_q.weight".to_string(),
            TensorData::new(vec![1.0f32; 4], [2, 2]),
        );
        let info = MotionLoRAInfo::new("stray", 1.0, "h");

        let adjusted =
            adjust_weights(&base, &MotionModelSettings::default(), &[(info, delta)]).unwrap();
        assert_eq!(adjusted.len(), 1);
        for value in values(&adjusted, "down_blocks.0.pos_encoder.pe") {
            assert!((value - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn mismatched_lora_shape_is_an_error() {
        let base = pe_map(4, 2, |_, _| 1.0);
        let mut delta = WeightMap::new();
        delta.insert(
            "down_blocks.0.pos_encoder.pe".to_string(),
            TensorData::new(vec![1.0f32; 4], [1, 2, 2]),
        );
        let info = MotionLoRAInfo::new("bad", 1.0, "h");

        let err = adjust_weights(&base, &MotionModelSettings::default(), &[(info, delta)])
            .unwrap_err();
        assert_eq!(err.key, "down_blocks.0.pos_encoder.pe");
    }

    #[test]
    fn per_projection_strengths_override_the_attention_strength() {
        let base = testing::v1v2_weight_map();
        let settings = MotionModelSettings {
            attn_strength: 2.0,
            attn_q_strength: Some(3.0),
            other_strength: 0.5,
            ..Default::default()
        };
        let adjusted = adjust_weights(&base, &settings, &[]).unwrap();

        let q_base = values(&base, "down_blocks.0.attn.to_q.weight");
        let q = values(&adjusted, "down_blocks.0.attn.to_q.weight");
        let k_base = values(&base, "down_blocks.0.attn.to_k.weight");
        let k = values(&adjusted, "down_blocks.0.attn.to_k.weight");
        let proj_base = values(&base, "down_blocks.0.proj_in.weight");
        let proj = values(&adjusted, "down_blocks.0.proj_in.weight");

        for (a, b) in q.iter().zip(&q_base) {
            assert!((a - b * 3.0).abs() < 1e-6);
        }
        for (a, b) in k.iter().zip(&k_base) {
            assert!((a - b * 2.0).abs() < 1e-6);
        }
        for (a, b) in proj.iter().zip(&proj_base) {
            assert!((a - b * 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn keys_are_categorized_by_suffix() {
        assert_eq!(
            WeightCategory::of("down_blocks.0.pos_encoder.pe"),
            WeightCategory::PositionalEncoding
        );
        assert_eq!(
            WeightCategory::of("mid_block.attn.to_out.bias"),
            WeightCategory::AttnOutBias
        );
        assert_eq!(
            WeightCategory::of("up_blocks.1.proj_out.weight"),
            WeightCategory::Other
        );
    }
}
