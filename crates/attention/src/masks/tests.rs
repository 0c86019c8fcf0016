use super::*;
use crate::core::KernelVersion;
use candle_core::{Device, Result};

fn idx(
    b: usize,
    h: usize,
    q: usize,
    k: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> usize {
    ((((b * num_heads) + h) * q_len) + q) * k_len + k
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let batch = 1;
    let num_heads = 2;
    let q_len = 3;
    let k_len = 5;

    let mask = build_causal_mask(&device, batch, num_heads, q_len, k_len)?;
    assert_eq!(mask.dims(), &[batch, num_heads, q_len, k_len]);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;

    // Earliest query can only see the prefix (offset = k_len - q_len).
    assert_eq!(values[idx(0, 0, 0, 2, num_heads, q_len, k_len)], 0.0);
    assert_eq!(values[idx(0, 0, 0, 3, num_heads, q_len, k_len)], MASK_FILL);

    // Later queries gain access to more keys.
    assert_eq!(values[idx(0, 1, 2, 4, num_heads, q_len, k_len)], 0.0);
    Ok(())
}

#[test]
fn causal_mask_handles_single_token_cases() -> Result<()> {
    let device = Device::Cpu;

    let mask = build_causal_mask(&device, 1, 1, 1, 1)?;
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, vec![0.0]);

    let mask = build_causal_mask(&device, 1, 1, 1, 4)?;
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, vec![0.0; 4]);
    Ok(())
}

#[test]
fn causal_allowed_never_permits_future_keys() -> Result<()> {
    let device = Device::Cpu;
    for (q_len, k_len) in [(4usize, 4usize), (2, 6), (1, 3)] {
        let allowed = causal_allowed(&device, q_len, k_len)?.to_vec2::<u8>()?;
        let offset = k_len - q_len;
        for (i, row) in allowed.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                assert_eq!(value == 1, j <= i + offset, "q={i} k={j}");
            }
        }
    }
    Ok(())
}

#[test]
fn sliding_window_limits_lookback() -> Result<()> {
    let device = Device::Cpu;
    let causal = causal_allowed(&device, 4, 4)?;
    let window = window_allowed(&device, 4, 4, 2)?;
    let combined = causal.mul(&window)?.to_vec2::<u8>()?;
    assert_eq!(combined[3], vec![0, 1, 1, 1]);
    assert_eq!(combined[0], vec![1, 0, 0, 0]);

    // Decoding one token at position 5 keeps keys 3..=5.
    let decode = window_allowed(&device, 1, 6, 2)?.to_vec2::<u8>()?;
    assert_eq!(decode[0], vec![0, 0, 0, 1, 1, 1]);

    let zero = window_allowed(&device, 3, 3, 0)?.to_vec2::<u8>()?;
    assert_eq!(zero, vec![vec![1, 0, 0], vec![0, 1, 0], vec![0, 0, 1]]);
    Ok(())
}

#[test]
fn alibi_slopes_follow_geometric_sequence() {
    let close = |got: Vec<f32>, want: &[f32]| {
        assert_eq!(got.len(), want.len());
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < 1e-7, "{got:?} vs {want:?}");
        }
    };
    close(gen_slopes(4, 8.0), &[0.25, 0.0625, 0.015625, 0.00390625]);
    close(gen_slopes(3, 8.0), &[0.0625, 0.00390625, 0.25]);
    close(gen_slopes(8, 8.0)[..1].to_vec(), &[0.5]);
}

#[test]
fn alibi_bias_penalises_distance() -> Result<()> {
    let device = Device::Cpu;
    let bias = build_alibi_bias(2, 3, 3, 8.0, &device)?;
    assert_eq!(bias.dims(), &[1, 2, 3, 3]);
    let values = bias.flatten_all()?.to_vec1::<f32>()?;
    // head 0 slope 1/16, head 1 slope 1/256.
    assert!((values[idx(0, 0, 2, 0, 2, 3, 3)] + 2.0 / 16.0).abs() < 1e-7);
    assert_eq!(values[idx(0, 1, 1, 1, 2, 3, 3)], 0.0);
    assert!((values[idx(0, 1, 0, 2, 2, 3, 3)] + 2.0 / 256.0).abs() < 1e-7);

    // A decode row of a longer bias matches the trailing row of the full one.
    let full = build_alibi_bias(2, 5, 5, 8.0, &device)?;
    let decode = build_alibi_bias(2, 1, 5, 8.0, &device)?;
    let tail = trailing_window(&full, 1, 5).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    assert_eq!(
        decode.flatten_all()?.to_vec1::<f32>()?,
        tail.flatten_all()?.to_vec1::<f32>()?
    );
    Ok(())
}

#[test]
fn bias_shape_rules() {
    let fused = Backend::Fused {
        version: KernelVersion::DEFAULT,
    };
    assert_eq!(attn_bias_shape(&fused, 4, 8, true, true, true), None);
    assert_eq!(
        attn_bias_shape(&Backend::Reference, 4, 8, true, false, true),
        Some([1, 4, 8, 8])
    );
    assert_eq!(
        attn_bias_shape(&Backend::Reference, 4, 8, false, true, false),
        Some([1, 1, 8, 8])
    );
    assert_eq!(attn_bias_shape(&Backend::Reference, 4, 8, false, false, false), None);
}

#[test]
fn build_bias_combines_alibi_and_causal() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let bias = build_bias(&Backend::Reference, 2, 3, true, false, true, 8.0, &device)?
        .expect("reference bias");
    let values = bias.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(values[idx(0, 0, 0, 1, 2, 3, 3)], MASK_FILL);
    assert!((values[idx(0, 0, 1, 0, 2, 3, 3)] + 1.0 / 16.0).abs() < 1e-7);

    let none = build_bias(
        &Backend::Fused {
            version: KernelVersion::DEFAULT,
        },
        2,
        3,
        true,
        false,
        true,
        8.0,
        &device,
    )?;
    assert!(none.is_none());
    Ok(())
}

#[test]
fn sequence_id_masks_cross_document_pairs() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let bias = build_bias(&Backend::Reference, 1, 4, false, true, true, 8.0, &device)?
        .expect("reference bias");
    let sequence_id = Tensor::new(&[[0i64, 0, 1, 1], [0, 0, 0, 0]], &device)?;
    let mask = Tensor::new(&[[1u8, 1, 1, 0], [1, 1, 1, 0]], &device)?;
    let masked = apply_sequence_id(&bias, &sequence_id, Some(&mask))?;
    assert_eq!(masked.dims(), &[2, 1, 4, 4]);

    let values = masked.flatten_all()?.to_vec1::<f32>()?;
    // Row 0: document boundary between positions 1 and 2.
    assert_eq!(values[idx(0, 0, 2, 1, 1, 4, 4)], MASK_FILL);
    assert_eq!(values[idx(0, 0, 1, 0, 1, 4, 4)], 0.0);
    // Padding at position 3 only matches itself.
    assert_eq!(values[idx(0, 0, 3, 2, 1, 4, 4)], MASK_FILL);
    assert_eq!(values[idx(0, 0, 3, 3, 1, 4, 4)], 0.0);
    // Row 1: one document over the unpadded prefix.
    assert_eq!(values[idx(1, 0, 2, 0, 1, 4, 4)], 0.0);
    assert_eq!(values[idx(1, 0, 3, 0, 1, 4, 4)], MASK_FILL);
    Ok(())
}

#[test]
fn key_padding_mask_layout() -> Result<()> {
    let device = Device::Cpu;
    let mask = attention_mask_from_lengths(&[2, 3], 3, &device)?;
    assert_eq!(mask.to_vec2::<u8>()?, vec![vec![1, 1, 0], vec![1, 1, 1]]);
    let allowed = key_padding_allowed(&mask)?;
    assert_eq!(allowed.dims(), &[2, 1, 1, 3]);
    Ok(())
}
