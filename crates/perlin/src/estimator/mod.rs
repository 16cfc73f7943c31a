//! Low-rank (random feature) approximation of softmax attention.
//!
//! Queries and keys are mapped through a positive random feature map
//! `phi(x) = m^-1/2 * (exp(W x' - |x'|^2 / 2 - stab) + eps)` with
//! `x' = x * d^-1/4`, after which attention is computed in linear time as
//! `phi(Q) (phi(K)^T V) / (phi(Q) sum_t phi(K_t))`. The feature map is unstable
//! in half precision, so the whole computation runs in `f32` and the result
//! is cast back to the caller's dtype.

pub mod projection;

use std::sync::Mutex;

use candle_core::{DType, Device, Error, Tensor, D};
use layers::PrecisionPolicy;
use rand::{rngs::StdRng, SeedableRng};

use crate::core::{PerlinError, PerlinResult};

pub use projection::{gaussian_orthogonal_random_matrix, ProjectionUpdater};

const KERNEL_EPSILON: f64 = 1e-4;

/// Kernelised attention estimator with a periodically redrawn projection.
#[derive(Debug)]
pub struct LowRankEstimator {
    head_dim: usize,
    nb_features: usize,
    projection: Mutex<Tensor>,
    rng: Mutex<StdRng>,
    updater: Mutex<ProjectionUpdater>,
}

/// Feature count `max(1, floor(d * ln(d) / factor))`.
pub fn feature_count(head_dim: usize, nb_factor: f64) -> usize {
    let d = head_dim as f64;
    ((d * d.ln() / nb_factor).floor() as usize).max(1)
}

impl LowRankEstimator {
    pub fn new(
        head_dim: usize,
        nb_factor: f64,
        redraw_interval: usize,
        seed: u64,
        device: &Device,
    ) -> PerlinResult<Self> {
        let nb_features = feature_count(head_dim, nb_factor);
        let mut rng = StdRng::seed_from_u64(seed);
        let projection = sample_projection(nb_features, head_dim, &mut rng, device)?;
        Ok(Self {
            head_dim,
            nb_features,
            projection: Mutex::new(projection),
            rng: Mutex::new(rng),
            updater: Mutex::new(ProjectionUpdater::new(redraw_interval)),
        })
    }

    pub fn nb_features(&self) -> usize {
        self.nb_features
    }

    /// Current `(nb_features, head_dim)` projection in `f32`.
    pub fn projection(&self) -> PerlinResult<Tensor> {
        let guard = self
            .projection
            .lock()
            .map_err(|_| Error::Msg("estimator projection mutex poisoned".into()))?;
        Ok(guard.clone())
    }

    /// Replaces the projection, e.g. when restoring a checkpoint.
    pub fn set_projection(&self, projection: &Tensor) -> PerlinResult<()> {
        if projection.dims() != [self.nb_features, self.head_dim] {
            return Err(PerlinError::shape(format!(
                "estimator projection expects [{}, {}], got {:?}",
                self.nb_features,
                self.head_dim,
                projection.dims()
            )));
        }
        let mut guard = self
            .projection
            .lock()
            .map_err(|_| Error::Msg("estimator projection mutex poisoned".into()))?;
        *guard = projection.to_dtype(DType::F32)?.detach();
        Ok(())
    }

    /// Counts a redraw request and resamples the projection on `device` when due.
    ///
    /// Returns whether a new projection was drawn. Must not run concurrently with a forward pass.
    pub fn redraw_projections(&self, training: bool, device: &Device) -> PerlinResult<bool> {
        let due = self
            .updater
            .lock()
            .map_err(|_| Error::Msg("projection updater mutex poisoned".into()))?
            .tick(training);
        if !due {
            return Ok(false);
        }
        let fresh = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| Error::Msg("estimator rng mutex poisoned".into()))?;
            sample_projection(self.nb_features, self.head_dim, &mut rng, device)?
        };
        *self
            .projection
            .lock()
            .map_err(|_| Error::Msg("estimator projection mutex poisoned".into()))? = fresh;
        log::debug!(
            "perlin estimator redrew {}x{} projection",
            self.nb_features,
            self.head_dim
        );
        Ok(true)
    }

    /// Approximate attention context `[batch, heads, seq, value_dim]`.
    ///
    /// `query` and `key` share `[batch, heads, seq, head_dim]`; `value` may have any
    /// trailing width. Padded keys are expected to carry zero values.
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> PerlinResult<Tensor> {
        let (batch, heads, seq, dim) = query.dims4()?;
        if key.dims() != query.dims() || dim != self.head_dim {
            return Err(PerlinError::shape(format!(
                "estimator expects query/key [.., .., .., {}], got {:?} and {:?}",
                self.head_dim,
                query.dims(),
                key.dims()
            )));
        }
        let (vb, vh, vt, value_dim) = value.dims4()?;
        if (vb, vh, vt) != (batch, heads, seq) {
            return Err(PerlinError::shape(format!(
                "estimator value {:?} does not match query {:?}",
                value.dims(),
                query.dims()
            )));
        }

        let policy = PrecisionPolicy::full_precision(query.dtype());
        let projection = self.projection()?.to_device(query.device())?;
        let q_prime = softmax_kernel(&policy.cast_for_matmul(query)?, &projection, true)?;
        let k_prime = softmax_kernel(&policy.cast_for_matmul(key)?, &projection, false)?;
        let value = policy
            .cast_for_matmul(value)?
            .reshape((batch * heads, seq, value_dim))?;

        let k_sum = k_prime.sum_keepdim(1)?;
        let normalizer = q_prime.broadcast_mul(&k_sum)?.sum_keepdim(D::Minus1)?;
        let kv = k_prime.transpose(1, 2)?.contiguous()?.matmul(&value)?;
        let context = q_prime.matmul(&kv)?.broadcast_div(&normalizer)?;

        let context = context.reshape((batch, heads, seq, value_dim))?;
        Ok(policy.cast_to_storage(&context)?)
    }
}

fn sample_projection(
    rows: usize,
    cols: usize,
    rng: &mut StdRng,
    device: &Device,
) -> PerlinResult<Tensor> {
    let values = gaussian_orthogonal_random_matrix(rows, cols, rng);
    Ok(Tensor::from_vec(values, (rows, cols), device)?)
}

/// Positive random features `[batch * heads, seq, nb_features]` for `f32` data.
fn softmax_kernel(data: &Tensor, projection: &Tensor, is_query: bool) -> candle_core::Result<Tensor> {
    let (batch, heads, seq, dim) = data.dims4()?;
    let nb_features = projection.dim(0)?;
    let normalizer = (dim as f64).powf(-0.25);
    let ratio = (nb_features as f64).powf(-0.5);

    let flat = data.reshape((batch * heads * seq, dim))?;
    let dash = flat
        .affine(normalizer, 0.0)?
        .matmul(&projection.t()?)?
        .reshape((batch * heads, seq, nb_features))?;
    let diag = flat
        .sqr()?
        .sum_keepdim(1)?
        .affine(normalizer * normalizer / 2.0, 0.0)?
        .reshape((batch * heads, seq, 1))?;
    let stabiliser = if is_query {
        dash.max_keepdim(D::Minus1)?
    } else {
        dash.max_keepdim(D::Minus1)?.max_keepdim(1)?
    }
    .detach();

    dash.broadcast_sub(&diag)?
        .broadcast_sub(&stabiliser)?
        .exp()?
        .affine(ratio, ratio * KERNEL_EPSILON)
}
