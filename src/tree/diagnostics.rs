//! Tree diagnostics (spec.md §9): `box_leaf` / `box_interior` counts,
//! reimplemented as an uncapped collective rather than the 1000-process
//! hard-abort ceiling the source imposed — spec.md §9 directs a rewrite to
//! "leave the cap out of the spec; reimplement as an unbounded collective."

use super::FunctionTree;
use crate::tensor::TensorAlgebra;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Box counts aggregated across every rank.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoxStats {
    /// Total leaf boxes across the whole (distributed) tree.
    pub box_leaf: usize,
    /// Total interior boxes across the whole tree.
    pub box_interior: usize,
}

/// Count local leaf/interior boxes, then all-reduce (sum) across every rank.
/// No process-count ceiling (spec.md §9's Open Question decision).
pub async fn box_stats<T, const D: usize>(tree: &FunctionTree<T, D>) -> BoxStats
where
    T: TensorAlgebra + Serialize + DeserializeOwned,
{
    let (mut local_leaf, mut local_interior) = (0usize, 0usize);
    for (_, node) in tree.container.local_iter() {
        if node.has_children {
            local_interior += 1;
        } else {
            local_leaf += 1;
        }
    }
    let total_leaf = tree.transport.all_reduce_sum(local_leaf as f64).await;
    let total_interior = tree.transport.all_reduce_sum(local_interior as f64).await;
    BoxStats {
        box_leaf: total_leaf.round() as usize,
        box_interior: total_interior.round() as usize,
    }
}

