//! Tree node record: coefficients, children flag, cached subtree norm
//! (spec.md §3).

use crate::container::Mergeable;
use crate::tensor::TensorAlgebra;
use serde::{Deserialize, Serialize};

/// Sentinel `norm_tree` value meaning "not yet computed" (spec.md §3).
pub const NORM_UNSET: f64 = f64::INFINITY;

/// A single tree node: either a leaf carrying `k^d` scaling coefficients,
/// an interior/compressed node carrying `(2k)^d` scaling+wavelet
/// coefficients, or an invalid placeholder carrying neither
/// (spec.md §3 — "used only transiently during remote construction").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node<T> {
    /// Scaling (shape `k^d`), scaling+wavelet (shape `(2k)^d`), or empty.
    pub coeff: T,
    /// Whether this node is interior.
    pub has_children: bool,
    /// Cached L2 norm of the subtree rooted here; [`NORM_UNSET`] until
    /// computed on demand by `tree::algorithms::subtree_norm`, which also
    /// writes the result back here.
    pub norm_tree: f64,
}

impl<T: TensorAlgebra> Node<T> {
    /// A childless node holding `coeff`.
    #[must_use]
    pub fn leaf(coeff: T) -> Self {
        Self {
            coeff,
            has_children: false,
            norm_tree: NORM_UNSET,
        }
    }

    /// An interior node with no coefficients of its own (reconstructed
    /// mode) or about to receive a compressed block.
    #[must_use]
    pub fn interior_empty(dim: usize) -> Self {
        Self {
            coeff: T::zeros(dim, 0),
            has_children: true,
            norm_tree: NORM_UNSET,
        }
    }

    /// Whether this node is invalid: neither coefficients nor children
    /// (spec.md §3's transient remote-construction placeholder).
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        !self.has_children && self.coeff.is_empty_coeff()
    }
}

impl<T: TensorAlgebra + Serialize + for<'de> Deserialize<'de>> Mergeable for Node<T> {
    fn zero_like(reference: &Self) -> Self {
        Self {
            coeff: T::zeros(reference.coeff.ndim(), reference.coeff.extent()),
            has_children: false,
            norm_tree: NORM_UNSET,
        }
    }

    fn merge_gaxpy(&mut self, alpha: f64, other: &Self, beta: f64) {
        if self.coeff.extent() == 0 && other.coeff.extent() > 0 {
            self.coeff = T::zeros(other.coeff.ndim(), other.coeff.extent());
        }
        if other.coeff.extent() > 0 {
            self.coeff.gaxpy(alpha, &other.coeff, beta);
        } else {
            self.coeff.scale(alpha);
        }
        self.has_children = self.has_children || other.has_children;
        self.norm_tree = NORM_UNSET;
    }

    fn merge_accumulate(&mut self, value: &Self) {
        self.merge_gaxpy(1.0, value, 1.0);
    }
}
