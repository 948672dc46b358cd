//! CPU reference matrix multiplication and input generation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{BenchError, Result};
use crate::matrix::Matrix;

/// Tile edge for [`matmul_tiled`]; 64x64 f32 tiles stay in L1.
const TILE: usize = 64;

fn check_shapes(lhs: &Matrix, rhs: &Matrix, result: &Matrix) -> Result<()> {
    if lhs.cols() != rhs.rows() {
        return Err(BenchError::ShapeMismatch {
            lhs_rows: lhs.rows(),
            lhs_cols: lhs.cols(),
            rhs_rows: rhs.rows(),
            rhs_cols: rhs.cols(),
        });
    }
    if result.rows() != lhs.rows() || result.cols() != rhs.cols() {
        return Err(BenchError::ResultShape {
            rows: lhs.rows(),
            cols: rhs.cols(),
            got_rows: result.rows(),
            got_cols: result.cols(),
        });
    }
    Ok(())
}

/// `result = lhs * rhs`, one dot product per element.
pub fn matmul_naive(lhs: &Matrix, rhs: &Matrix, result: &mut Matrix) -> Result<()> {
    check_shapes(lhs, rhs, result)?;
    let (m_len, n_len, k_len) = (lhs.rows(), rhs.cols(), lhs.cols());
    for m in 0..m_len {
        for n in 0..n_len {
            let mut acc = 0.0f32;
            for k in 0..k_len {
                acc += lhs[(m, k)] * rhs[(k, n)];
            }
            result[(m, n)] = acc;
        }
    }
    Ok(())
}

/// Cache-blocked `result = lhs * rhs`. Accumulates over `k` in the same
/// order as [`matmul_naive`], so both give identical results.
pub fn matmul_tiled(lhs: &Matrix, rhs: &Matrix, result: &mut Matrix) -> Result<()> {
    check_shapes(lhs, rhs, result)?;
    let (m_len, n_len, k_len) = (lhs.rows(), rhs.cols(), lhs.cols());
    let a = lhs.as_slice();
    let b = rhs.as_slice();
    let c = result.as_mut_slice();
    c.fill(0.0);

    for n0 in (0..n_len).step_by(TILE) {
        let n_end = (n0 + TILE).min(n_len);
        for k0 in (0..k_len).step_by(TILE) {
            let k_end = (k0 + TILE).min(k_len);
            for m0 in (0..m_len).step_by(TILE) {
                let m_end = (m0 + TILE).min(m_len);

                for n in n0..n_end {
                    for k in k0..k_end {
                        let b_val = b[k + n * k_len];
                        for m in m0..m_end {
                            c[m + n * m_len] += a[m + k * m_len] * b_val;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Mean absolute elementwise difference.
pub fn mean_abs_error(result: &[f32], reference: &[f32]) -> f32 {
    if reference.is_empty() {
        return 0.0;
    }
    let total: f32 = result.iter().zip(reference).map(|(r, e)| (r - e).abs()).sum();
    total / reference.len() as f32
}

/// `lhs(m, k) = (m + 1)(k + 1) / M` and `rhs(k, n) = (k + 1)(n + 1) / M`.
pub fn ramp_inputs(m: usize, n: usize, k: usize) -> (Matrix, Matrix) {
    let scale = m as f32;
    let lhs = Matrix::from_fn(m, k, |r, c| ((r + 1) * (c + 1)) as f32 / scale);
    let rhs = Matrix::from_fn(k, n, |r, c| ((r + 1) * (c + 1)) as f32 / scale);
    (lhs, rhs)
}

/// Uniform values in `[-1, 1)` from a seeded generator.
pub fn random_inputs(m: usize, n: usize, k: usize, seed: u64) -> (Matrix, Matrix) {
    let mut rng = StdRng::seed_from_u64(seed);
    let lhs = Matrix::from_fn(m, k, |_, _| rng.gen_range(-1.0..1.0));
    let rhs = Matrix::from_fn(k, n, |_, _| rng.gen_range(-1.0..1.0));
    (lhs, rhs)
}
