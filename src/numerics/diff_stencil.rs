//! Three-point derivative stencil blocks (`rm`, `r0`, `rp`) from spec.md
//! §4.3 / §4.4.5.
//!
//! The local (within-box) contribution is the exact derivative of the
//! orthonormal shifted-Legendre polynomials. Spec.md notes that `rm`/`r0`/
//! `rp` admit "rank-1 factorizations"; this module builds the jump
//! corrections connecting a box to its left/right neighbor as rank-1 outer
//! products of edge-value vectors, the standard central-flux construction
//! for a weak derivative of a discontinuous piecewise-polynomial basis.

use crate::tensor::Matrix;
use super::quadrature::phi;

/// Edge-value vectors `phi_i(0)` and `phi_i(1)` for `i in 0..k`.
fn edge_values(k: usize) -> (Vec<f64>, Vec<f64>) {
    let bm: Vec<f64> = (0..k).map(|i| phi(i, 0.0)).collect();
    let bp: Vec<f64> = (0..k).map(|i| phi(i, 1.0)).collect();
    (bm, bp)
}

/// Exact local derivative matrix of the orthonormal shifted-Legendre basis:
/// `d/dx phi_j = sum_i local[i][j] phi_i` for `x` strictly inside the box.
fn local_derivative(k: usize) -> Matrix {
    let mut m = Matrix::zeros(k, k);
    for i in 0..k {
        for j in 0..k {
            if i < j && (i + j) % 2 == 1 {
                let v = 2.0 * (((2 * i + 1) * (2 * j + 1)) as f64).sqrt();
                m.set(i, j, v);
            }
        }
    }
    m
}

fn outer(a: &[f64], b: &[f64], scale: f64) -> Matrix {
    let k = a.len();
    let mut m = Matrix::zeros(k, k);
    for i in 0..k {
        for j in 0..k {
            m.set(i, j, scale * a[i] * b[j]);
        }
    }
    m
}

/// The `(rm, r0, rp)` stencil for wavelet order `k`.
#[must_use]
pub fn build(k: usize) -> (Matrix, Matrix, Matrix) {
    let (bm, bp) = edge_values(k);
    let local = local_derivative(k);

    let bp_bp = outer(&bp, &bp, 0.5);
    let bm_bm = outer(&bm, &bm, 0.5);
    let mut r0 = local;
    for i in 0..k {
        for j in 0..k {
            r0.set(i, j, r0.get(i, j) - bp_bp.get(i, j) + bm_bm.get(i, j));
        }
    }
    let rp = outer(&bp, &bm, 0.5);
    let rm = outer(&bm, &bp, -0.5);
    (rm, r0, rp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencil_has_expected_shape() {
        let (rm, r0, rp) = build(4);
        assert_eq!(rm.rows(), 4);
        assert_eq!(r0.cols(), 4);
        assert_eq!(rp.rows(), 4);
    }
}
