//! Common Numerics — per-order-`k` singleton holding the two-scale
//! matrices, Gauss-Legendre quadrature, and polynomial evaluation tables
//! (spec.md §4.3). Lazily initialized per `k`, then immutable and shared,
//! following the teacher's per-`k` style of table in
//! `domain/fuel.rs`-style newtypes but as plain immutable data since these
//! tables need no validation beyond `k` itself.

pub mod diff_stencil;
pub mod quadrature;
pub mod twoscale;

use crate::tensor::Matrix;
use dashmap::DashMap;
use std::ops::Range;
use std::sync::Arc;
use twoscale::TwoScale;

/// Largest wavelet order this crate will build tables for.
pub const KMAX: usize = 30;

/// All of the per-`k` tables spec.md §4.3 lists.
#[derive(Clone, Debug)]
pub struct KTables {
    /// Wavelet order this table set was built for.
    pub k: usize,
    /// Two-scale matrices and their `2k x 2k` composed forms.
    pub two_scale: TwoScale,
    /// `k`-point Gauss-Legendre nodes on `[0, 1]`.
    pub quad_x: Vec<f64>,
    /// `k`-point Gauss-Legendre weights on `[0, 1]`.
    pub quad_w: Vec<f64>,
    /// `quad_phi[i][j] = phi_j(x_i)`: value of basis function `j` at node `i`.
    pub quad_phi: Matrix,
    /// `quad_phiw[i][j] = w_i * phi_j(x_i)`: value-times-weight matrix.
    pub quad_phiw: Matrix,
    /// Transpose of `quad_phi`.
    pub quad_phi_t: Matrix,
    /// Transpose of `quad_phiw`, used to project function values at
    /// quadrature points onto scaling coefficients (spec.md §4.4.1).
    pub quad_phiw_t: Matrix,
    /// Periodic difference-operator blocks used by `do_diff2` (spec.md §4.4.5).
    pub rm: Matrix,
    /// Local (within-box) derivative block.
    pub r0: Matrix,
    /// Right-neighbor derivative block.
    pub rp: Matrix,
}

impl KTables {
    fn build(k: usize) -> Self {
        assert!(k > 0 && k <= KMAX, "wavelet order {k} out of range [1, {KMAX}]");
        let two_scale = TwoScale::build(k);
        let (quad_x, quad_w) = quadrature::gauss_legendre_unit(k);
        let npt = quad_x.len();
        let mut quad_phi = Matrix::zeros(npt, k);
        let mut quad_phiw = Matrix::zeros(npt, k);
        for (i, (x, w)) in quad_x.iter().zip(&quad_w).enumerate() {
            for j in 0..k {
                let v = quadrature::phi(j, *x);
                quad_phi.set(i, j, v);
                quad_phiw.set(i, j, v * w);
            }
        }
        let quad_phi_t = quad_phi.transposed();
        let quad_phiw_t = quad_phiw.transposed();
        let (rm, r0, rp) = diff_stencil::build(k);
        Self {
            k,
            two_scale,
            quad_x,
            quad_w,
            quad_phi,
            quad_phiw,
            quad_phi_t,
            quad_phiw_t,
            rm,
            r0,
            rp,
        }
    }

    /// The scaling-block slice `[0, k)` repeated for each of `d` axes —
    /// spec.md §4.3's `s0`.
    #[must_use]
    pub fn scaling_block_ranges(&self, d: usize) -> Vec<Range<usize>> {
        vec![0..self.k; d]
    }

    /// The low-half slice `[0, k/2)` used by the autorefine test
    /// (spec.md §4.3's `sh`).
    #[must_use]
    pub fn low_half_ranges(&self, d: usize) -> Vec<Range<usize>> {
        vec![0..self.k.div_ceil(2); d]
    }
}

/// Process-wide cache of per-`k` tables, built lazily on first request and
/// shared read-only thereafter (spec.md §4.3).
#[derive(Default)]
pub struct NumericsContext {
    tables: DashMap<usize, Arc<KTables>>,
}

impl NumericsContext {
    /// A fresh, empty context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    /// Return the table set for `k`, building it on first request.
    #[must_use]
    pub fn get(&self, k: usize) -> Arc<KTables> {
        if let Some(existing) = self.tables.get(&k) {
            return Arc::clone(&existing);
        }
        let built = Arc::new(KTables::build(k));
        self.tables.entry(k).or_insert_with(|| Arc::clone(&built));
        Arc::clone(&self.tables.get(&k).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_caches_tables() {
        let ctx = NumericsContext::new();
        let a = ctx.get(4);
        let b = ctx.get(4);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn quad_phiw_t_is_transpose() {
        let ctx = NumericsContext::new();
        let t = ctx.get(3);
        for i in 0..t.quad_phiw.rows() {
            for j in 0..t.quad_phiw.cols() {
                assert_eq!(t.quad_phiw.get(i, j), t.quad_phiw_t.get(j, i));
            }
        }
    }
}
