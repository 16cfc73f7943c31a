//! Exact softmax attention over `[batch, heads, seq_len, head_dim]` inputs.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax;

use crate::core::{merge_heads, PerlinError, PerlinResult};
use crate::masks::fp_min;

/// Everything the dense path produces for one call.
#[derive(Debug, Clone)]
pub struct DenseAttention {
    /// Scaled scores `[batch, heads, q_len, k_len]` before masking, in `f32`.
    pub scores: Tensor,
    /// Masked softmax probabilities `[batch, heads, q_len, k_len]` in `f32`.
    pub probs: Tensor,
    /// Merged context `[batch, q_len, heads * head_dim]` in the input dtype.
    pub context: Tensor,
}

/// Numerically stable, portable dense attention. Reductions run in `f32`.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attends `q` over `k`/`v` with an optional additive mask `[batch, 1|heads, q_len|1, k_len]`.
    pub fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> PerlinResult<DenseAttention> {
        let dtype = q.dtype();
        fp_min(dtype)?;
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(PerlinError::shape("q, k, v must share the same dtype"));
        }
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(PerlinError::shape("q, k, v must reside on the same device"));
        }

        let (batch, heads, q_len, head_dim) = q
            .dims4()
            .map_err(|_| PerlinError::shape("q must have shape [batch, heads, seq_len, head_dim]"))?;
        let (kb, kh, k_len, kd) = k
            .dims4()
            .map_err(|_| PerlinError::shape("k must have shape [batch, heads, seq_len, head_dim]"))?;
        let (vb, vh, vk, value_dim) = v
            .dims4()
            .map_err(|_| PerlinError::shape("v must have shape [batch, heads, seq_len, dim]"))?;
        if kb != batch || kh != heads || kd != head_dim {
            return Err(PerlinError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len {
            return Err(PerlinError::shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, ?] got [{vb}, {vh}, {vk}, {value_dim}]"
            )));
        }

        if self.first_call.set(()).is_ok() {
            log::info!(
                "perlin::reference init dtype={dtype:?} heads={heads} head_dim={head_dim} masked={}",
                mask.is_some()
            );
        }

        let merged = batch * heads;
        let q_view = q.to_dtype(DType::F32)?.reshape((merged, q_len, head_dim))?;
        let k_view = k.to_dtype(DType::F32)?.reshape((merged, k_len, head_dim))?;
        let v_view = v.to_dtype(DType::F32)?.reshape((merged, k_len, value_dim))?;

        let scores = q_view
            .matmul(&k_view.transpose(1, 2)?.contiguous()?)?
            .affine(1.0 / (head_dim as f64).sqrt(), 0.0)?
            .reshape((batch, heads, q_len, k_len))?;

        let masked = match mask {
            Some(mask) => {
                let (mb, mh, mq, mk) = mask.dims4().map_err(|_| {
                    PerlinError::shape("mask must have shape [batch, heads|1, q_len|1, k_len]")
                })?;
                if mb != batch || (mh != 1 && mh != heads) || (mq != 1 && mq != q_len) || mk != k_len {
                    return Err(PerlinError::shape(format!(
                        "mask shape mismatch: expected [{batch}, 1|{heads}, 1|{q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
                    )));
                }
                scores.broadcast_add(&mask.to_dtype(DType::F32)?)?
            }
            None => scores.clone(),
        };

        let probs = softmax(&masked, D::Minus1)?;
        let context = probs
            .reshape((merged, q_len, k_len))?
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, value_dim))?;
        let context = merge_heads(&context)?.to_dtype(dtype)?;

        Ok(DenseAttention {
            scores,
            probs,
            context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::build_causal_mask;
    use candle_core::Device;

    fn build_inputs(device: &Device) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    #[test]
    fn unmasked_rows_are_distributions() -> PerlinResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let out = ExactAttention::new().attend(&q, &k, &v, None)?;
        assert_eq!(out.context.dims(), &[1, 4, 16]);
        for row in out.probs.flatten_to(2)?.to_vec2::<f32>()? {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn causal_first_row_copies_first_value() -> PerlinResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, DType::F32, 1, 4, 4)?;
        let out = ExactAttention::new().attend(&q, &k, &v, Some(&mask))?;
        let first = out.context.get(0)?.get(0)?.narrow(0, 0, 8)?.to_vec1::<f32>()?;
        let expected = v.get(0)?.get(0)?.get(0)?.to_vec1::<f32>()?;
        for (a, b) in first.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
        let probs = out.probs.get(0)?.get(1)?.get(0)?.to_vec1::<f32>()?;
        assert!((probs[0] - 1.0).abs() < 1e-6);
        assert!(probs[1..].iter().all(|p| *p < 1e-6));
        Ok(())
    }

    #[test]
    fn rejects_integer_inputs() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 1, 2, 2), DType::U32, &device)?;
        let err = ExactAttention::new().attend(&q, &q, &q, None).unwrap_err();
        assert!(matches!(err, PerlinError::UnsupportedDType(DType::U32)));
        Ok(())
    }
}
