#![allow(dead_code)]

use attention::core::QkNorm;
use attention::{AttentionParams, Projection, ResolvedAttentionConfig};
use candle_core::{backprop::GradStore, DType, Device, Result, Tensor, Var};
use layers::{LayerNorm, Linear, LinearConfig, NormConfig};

/// Parameters backed by `Var`s so gradients can be compared across layers.
pub struct TrackedParams {
    pub params: AttentionParams,
    pub vars: Vec<(String, Var)>,
}

fn linear(name: &str, input: usize, output: usize, device: &Device, vars: &mut Vec<(String, Var)>) -> Result<Linear> {
    let weight = Var::randn(0f32, 0.3, (output, input), device)?;
    let bias = Var::randn(0f32, 0.1, output, device)?;
    let layer = Linear::new(
        LinearConfig::new(input, output),
        weight.as_tensor().clone(),
        Some(bias.as_tensor().clone()),
    )?;
    vars.push((format!("{name}.weight"), weight));
    vars.push((format!("{name}.bias"), bias));
    Ok(layer)
}

fn norm(name: &str, width: usize, device: &Device, vars: &mut Vec<(String, Var)>) -> Result<LayerNorm> {
    let weight = Var::from_tensor(&(Tensor::randn(0f32, 0.1, width, device)? + 1.0)?)?;
    let bias = Var::randn(0f32, 0.1, width, device)?;
    let layer = LayerNorm::new(
        NormConfig::new(width),
        Some(weight.as_tensor().clone()),
        Some(bias.as_tensor().clone()),
    )?;
    vars.push((format!("{name}.weight"), weight));
    vars.push((format!("{name}.bias"), bias));
    Ok(layer)
}

pub fn tracked_params(config: &ResolvedAttentionConfig, device: &Device) -> Result<TrackedParams> {
    let mut vars = Vec::new();
    let d_model = config.d_model;
    let projection = if config.reuses_kv() {
        Projection::QueryOnly(linear("wq", d_model, d_model, device, &mut vars)?)
    } else {
        Projection::Fused(linear("wqkv", d_model, d_model + 2 * config.kv_width(), device, &mut vars)?)
    };
    let widths = match config.qk_norm {
        QkNorm::None => None,
        QkNorm::Layer => Some((d_model, config.kv_width())),
        QkNorm::Group => Some((config.head_dim, config.head_dim)),
    };
    let (q_norm, k_norm) = match widths {
        Some((q, k)) => {
            let q_norm = norm("q_norm", q, device, &mut vars)?;
            let k_norm = if config.reuses_kv() {
                None
            } else {
                Some(norm("k_norm", k, device, &mut vars)?)
            };
            (Some(q_norm), k_norm)
        }
        None => (None, None),
    };
    let out_proj = linear("out_proj", d_model, d_model, device, &mut vars)?;
    Ok(TrackedParams {
        params: AttentionParams {
            projection,
            q_norm,
            k_norm,
            out_proj,
        },
        vars,
    })
}

/// Elementwise `|a - b| <= atol + rtol * |b|`.
pub fn assert_close(name: &str, a: &Tensor, b: &Tensor, rtol: f32, atol: f32) -> Result<()> {
    assert_eq!(a.dims(), b.dims(), "{name}: shape mismatch");
    let a = a.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let b = b.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    for (idx, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let bound = atol + rtol * y.abs();
        assert!(
            (x - y).abs() <= bound,
            "{name}[{idx}]: {x} vs {y} exceeds tolerance {bound}"
        );
    }
    Ok(())
}

pub fn assert_grads_close(
    left: &GradStore,
    left_vars: &[(String, Var)],
    right: &GradStore,
    right_vars: &[(String, Var)],
    rtol: f32,
    atol: f32,
) -> Result<()> {
    for ((name, lv), (_, rv)) in left_vars.iter().zip(right_vars.iter()) {
        let lg = left.get(lv.as_tensor());
        let rg = right.get(rv.as_tensor());
        match (lg, rg) {
            (Some(lg), Some(rg)) => assert_close(name, lg, rg, rtol, atol)?,
            (None, None) => {}
            _ => panic!("{name}: gradient present on only one side"),
        }
    }
    Ok(())
}

/// Zeroes padded query rows so backends may differ there.
pub fn mask_queries(output: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    match mask {
        Some(mask) => output.broadcast_mul(&mask.to_dtype(output.dtype())?.unsqueeze(2)?),
        None => Ok(output.clone()),
    }
}
