//! Random projection sampling and redraw scheduling for the low-rank estimator.

use rand::Rng;
use rand_distr::StandardNormal;

/// Samples a `(rows, cols)` matrix whose rows are orthogonal within each block
/// of `cols` rows and whose norms follow the norms of i.i.d. Gaussian vectors.
///
/// Returned row-major in `f32`.
pub fn gaussian_orthogonal_random_matrix<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    rng: &mut R,
) -> Vec<f32> {
    let mut basis = Vec::with_capacity(rows * cols);
    while basis.len() < rows * cols {
        let block = orthonormal_block(cols, rng);
        let needed = (rows * cols - basis.len()).min(block.len());
        basis.extend_from_slice(&block[..needed]);
    }

    let mut matrix = Vec::with_capacity(rows * cols);
    for row in basis.chunks(cols) {
        let norm = (0..cols)
            .map(|_| rng.sample::<f64, _>(StandardNormal).powi(2))
            .sum::<f64>()
            .sqrt();
        matrix.extend(row.iter().map(|&v| (v * norm) as f32));
    }
    matrix
}

/// `dim` orthonormal vectors of length `dim` via modified Gram-Schmidt.
fn orthonormal_block<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Vec<f64> {
    let mut vectors: Vec<Vec<f64>> = Vec::with_capacity(dim);
    while vectors.len() < dim {
        let mut candidate = (0..dim)
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect::<Vec<_>>();
        for existing in &vectors {
            let overlap = dot(&candidate, existing);
            candidate
                .iter_mut()
                .zip(existing)
                .for_each(|(c, e)| *c -= overlap * e);
        }
        let norm = dot(&candidate, &candidate).sqrt();
        // Nearly dependent draws are resampled.
        if norm > 1e-6 {
            candidate.iter_mut().for_each(|c| *c /= norm);
            vectors.push(candidate);
        }
    }
    vectors.concat()
}

fn dot(lhs: &[f64], rhs: &[f64]) -> f64 {
    lhs.iter().zip(rhs).map(|(a, b)| a * b).sum()
}

/// Counts redraw requests and decides when the projection is resampled.
///
/// Every call while training either resamples (once `interval` calls have been
/// counted, resetting the counter) or increments the counter. Calls outside
/// training are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionUpdater {
    interval: usize,
    calls_since_redraw: usize,
}

impl ProjectionUpdater {
    pub fn new(interval: usize) -> Self {
        Self {
            interval,
            calls_since_redraw: 0,
        }
    }

    pub fn calls_since_redraw(&self) -> usize {
        self.calls_since_redraw
    }

    /// Returns `true` when the caller should resample now.
    pub fn tick(&mut self, training: bool) -> bool {
        if !training {
            return false;
        }
        if self.calls_since_redraw >= self.interval {
            self.calls_since_redraw = 0;
            return true;
        }
        self.calls_since_redraw += 1;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn rows_within_a_block_are_orthogonal() {
        let mut rng = StdRng::seed_from_u64(7);
        let (rows, cols) = (10, 4);
        let matrix = gaussian_orthogonal_random_matrix(rows, cols, &mut rng);
        assert_eq!(matrix.len(), rows * cols);

        let row = |i: usize| -> Vec<f64> {
            matrix[i * cols..(i + 1) * cols]
                .iter()
                .map(|&v| f64::from(v))
                .collect()
        };
        for block_start in [0, 4] {
            for i in block_start..block_start + cols {
                for j in i + 1..block_start + cols {
                    let cos = dot(&row(i), &row(j))
                        / (dot(&row(i), &row(i)).sqrt() * dot(&row(j), &row(j)).sqrt());
                    assert!(cos.abs() < 1e-4, "rows {} and {} not orthogonal", i, j);
                }
            }
        }
    }

    #[test]
    fn sampling_is_reproducible_for_a_seed() {
        let first = gaussian_orthogonal_random_matrix(6, 3, &mut StdRng::seed_from_u64(1));
        let second = gaussian_orthogonal_random_matrix(6, 3, &mut StdRng::seed_from_u64(1));
        assert_eq!(first, second);
    }

    #[test]
    fn updater_redraws_after_interval_calls() {
        let mut updater = ProjectionUpdater::new(3);
        assert!(!updater.tick(false));
        assert_eq!(updater.calls_since_redraw(), 0);

        let fired = (0..8).map(|_| updater.tick(true)).collect::<Vec<_>>();
        assert_eq!(
            fired,
            vec![false, false, false, true, false, false, false, true]
        );
    }
}
