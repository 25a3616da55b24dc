//! Two-scale (multiwavelet) matrix construction for the orthonormal
//! shifted-Legendre scaling-function basis.
//!
//! `h0`/`h1` express a parent scaling function in terms of the rescaled
//! child scaling functions on the left/right half; `g0`/`g1` do the same
//! for the wavelet functions, built as the orthogonal complement of the
//! parent embedding inside the `2k`-dimensional child space (the standard
//! Alpert multiwavelet construction). `hg`/`hgt` are the composed `2k x 2k`
//! unfilter/filter matrices spec.md §3 and §4.2 name.

use crate::tensor::Matrix;
use super::quadrature::{gauss_legendre_interval, phi};

/// The full set of per-order two-scale matrices, spec.md §3/§4.3.
#[derive(Clone, Debug)]
pub struct TwoScale {
    /// `k x k`: parent scaling coefficients from the left child half.
    pub h0: Matrix,
    /// `k x k`: parent scaling coefficients from the right child half.
    pub h1: Matrix,
    /// `k x k`: wavelet coefficients from the left child half.
    pub g0: Matrix,
    /// `k x k`: wavelet coefficients from the right child half.
    pub g1: Matrix,
    /// `2k x 2k` unfilter matrix: `[parent_scaling; wavelet] -> [left_child; right_child]`.
    pub hg: Matrix,
    /// `2k x 2k` filter matrix: the transpose of `hg`.
    pub hgt: Matrix,
}

/// `<phi_j, sqrt(2) * phi_l(2x - shift)>` over the half-interval the shift
/// selects, via Gauss-Legendre quadrature exact for the polynomial degrees
/// involved.
fn half_interval_inner(k: usize, left: bool) -> Matrix {
    let npt = k.max(1);
    let (a, b) = if left { (0.0, 0.5) } else { (0.5, 1.0) };
    let (nodes, weights) = gauss_legendre_interval(npt, a, b);
    let mut m = Matrix::zeros(k, k);
    for j in 0..k {
        for l in 0..k {
            let mut acc = 0.0;
            for (x, w) in nodes.iter().zip(&weights) {
                let shifted = if left { 2.0 * x } else { 2.0 * x - 1.0 };
                acc += w * phi(j, *x) * (2f64.sqrt() * phi(l, shifted));
            }
            m.set(j, l, acc);
        }
    }
    m
}

/// Orthonormalize `seed` columns (already orthonormal, e.g. the columns of
/// `P = [h0^T; h1^T]`) plus the standard basis of `R^dim`, returning the
/// `dim - seed.cols()` extra orthonormal vectors spanning the complement.
fn orthogonal_complement(dim: usize, seed_cols: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut basis: Vec<Vec<f64>> = seed_cols.to_vec();
    let mut complement = Vec::new();
    for i in 0..dim {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        for b in &basis {
            let proj: f64 = v.iter().zip(b).map(|(a, c)| a * c).sum();
            for (vi, bi) in v.iter_mut().zip(b) {
                *vi -= proj * bi;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 1e-9 {
            for vi in &mut v {
                *vi /= norm;
            }
            basis.push(v.clone());
            complement.push(v);
        }
        if complement.len() + seed_cols.len() >= dim {
            break;
        }
    }
    complement
}

impl TwoScale {
    /// Build the two-scale matrices for wavelet order `k`.
    ///
    /// # Panics
    /// Panics if `k` is zero — callers must validate `k` at the factory
    /// boundary (spec.md §7) before reaching the numerics layer.
    #[must_use]
    pub fn build(k: usize) -> Self {
        assert!(k > 0, "wavelet order must be positive");
        let h0 = half_interval_inner(k, true);
        let h1 = half_interval_inner(k, false);

        // Columns of P (2k x k): p_j = (h0[j,:], h1[j,:]) is the parent
        // scaling function expressed in the orthonormal child e-basis.
        let two_k = 2 * k;
        let seed_cols: Vec<Vec<f64>> = (0..k)
            .map(|j| {
                let mut col = vec![0.0; two_k];
                for i in 0..k {
                    col[i] = h0.get(j, i);
                    col[k + i] = h1.get(j, i);
                }
                col
            })
            .collect();

        let wavelet_cols = orthogonal_complement(two_k, &seed_cols);
        assert_eq!(wavelet_cols.len(), k, "two-scale construction lost rank");

        let mut g0 = Matrix::zeros(k, k);
        let mut g1 = Matrix::zeros(k, k);
        for (j, w) in wavelet_cols.iter().enumerate() {
            for i in 0..k {
                g0.set(j, i, w[i]);
                g1.set(j, i, w[k + i]);
            }
        }

        // hg: 2k x 2k, columns 0..k are P's columns (seed_cols), columns
        // k..2k are the wavelet columns — this is exactly [P | W].
        let mut hg = Matrix::zeros(two_k, two_k);
        for (j, col) in seed_cols.iter().enumerate() {
            for (i, v) in col.iter().enumerate() {
                hg.set(i, j, *v);
            }
        }
        for (j, col) in wavelet_cols.iter().enumerate() {
            for (i, v) in col.iter().enumerate() {
                hg.set(i, k + j, *v);
            }
        }
        let hgt = hg.transposed();

        Self {
            h0,
            h1,
            g0,
            g1,
            hg,
            hgt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn hg_is_orthogonal() {
        let ts = TwoScale::build(4);
        let prod = ts.hg.matmul(&ts.hgt);
        for i in 0..8 {
            for j in 0..8 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!(approx_eq(prod.get(i, j), expect, 1e-8), "i={i} j={j} v={}", prod.get(i, j));
            }
        }
    }

    #[test]
    fn unfilter_then_filter_is_identity() {
        let ts = TwoScale::build(3);
        let two_k = 6;
        let v: Vec<f64> = (0..two_k).map(|i| (i as f64 + 1.0) * 0.37).collect();
        // child = hg * v  (treat v as [s; d])
        let child: Vec<f64> = (0..two_k)
            .map(|i| (0..two_k).map(|j| ts.hg.get(i, j) * v[j]).sum())
            .collect();
        // back = hgt * child
        let back: Vec<f64> = (0..two_k)
            .map(|i| (0..two_k).map(|j| ts.hgt.get(i, j) * child[j]).sum())
            .collect();
        for (a, b) in v.iter().zip(&back) {
            assert!(approx_eq(*a, *b, 1e-8));
        }
    }
}
