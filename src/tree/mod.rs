//! Function Tree & Algorithms — the centerpiece (spec.md §2, §3, §4.4): a
//! sharded `2^D`-ary coefficient tree, polymorphic over the tensor element
//! type `T` and the spatial dimension `D`.

pub mod algorithms;
pub mod bc;
pub mod diagnostics;
pub mod key;
pub mod node;

use crate::container::DistributedContainer;
use crate::numerics::NumericsContext;
use crate::process_map::ProcessMap;
use crate::rml::Rml;
use crate::runtime::TaskRuntime;
use crate::tensor::TensorAlgebra;
use crate::transport::Transport;
use bc::BcMatrix;
use key::Key;
use node::Node;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// The three valid global tree states (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Leaves carry `k^d` scaling coefficients; interior nodes are empty.
    Reconstructed,
    /// Every node carries `(2k)^d` scaling+wavelet; scaling lives only at
    /// the root.
    Compressed,
    /// Same layout as `Compressed`, but scaling coefficients are retained
    /// at every interior node rather than zeroed.
    NonStandard,
}

/// How `truncate_tol` scales the base threshold with level (spec.md §4.4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncateMode {
    /// `tol` unscaled.
    Plain,
    /// `tol * min(1, 2^{-n} * L)`.
    LevelScaled,
    /// `tol * min(1, 4^{-n} * L^2)`.
    LevelScaledSquared,
}

/// `truncate_tol(tol, key)` from spec.md §4.4.1/§4.4.3/§4.4.4: the
/// per-node screening threshold, scaled by level according to `mode`.
/// `cell_width` is the minimum cell width `L` of the domain.
#[must_use]
pub fn truncate_tol(tol: f64, n: u32, mode: TruncateMode, cell_width: f64) -> f64 {
    match mode {
        TruncateMode::Plain => tol,
        TruncateMode::LevelScaled => {
            let scale = (2f64.powi(-(i32::try_from(n).unwrap_or(i32::MAX)))) * cell_width;
            tol * scale.min(1.0)
        }
        TruncateMode::LevelScaledSquared => {
            let scale = 4f64.powi(-(i32::try_from(n).unwrap_or(i32::MAX))) * cell_width * cell_width;
            tol * scale.min(1.0)
        }
    }
}

/// A sharded `2^D`-ary adaptive multiwavelet representation of a function,
/// with its owning process map, numerics context, and communication
/// handles (spec.md §2's "Function Tree & Algorithms" layer).
pub struct FunctionTree<T: TensorAlgebra + Serialize + DeserializeOwned, const D: usize> {
    /// Local/remote-routed node storage.
    pub container: Arc<DistributedContainer<Node<T>, D>>,
    /// Wavelet order.
    pub k: usize,
    /// Screening threshold.
    pub thresh: f64,
    /// Boundary condition matrix.
    pub bc: BcMatrix<D>,
    /// How `truncate_tol` scales with level.
    pub truncate_mode: TruncateMode,
    /// Ceiling on recursive refinement depth.
    pub max_refine_level: u32,
    /// Whether `refine_op` is swept over every leaf after `project` and
    /// after `algorithms::mul_tree` (spec.md §4.4.8's
    /// `autorefine_square_test`).
    pub autorefine: bool,
    /// Whether projected coefficients are stored one level shallower than
    /// the leaf that produced them (spec.md §4.4.1).
    pub truncate_on_project: bool,
    /// Current global representation (spec.md §3).
    pub mode: Mode,
    /// Per-`k` two-scale/quadrature tables.
    pub numerics: Arc<NumericsContext>,
    /// Key-to-rank routing.
    pub pmap: Arc<dyn ProcessMap<D>>,
    /// Task scheduling handle.
    pub runtime: TaskRuntime,
    /// Reliable messaging handle (used by `fence`'s drain).
    pub rml: Arc<Rml>,
    /// Collective transport (used by `fence`'s barrier).
    pub transport: Arc<dyn Transport>,
}

impl<T: TensorAlgebra + Serialize + DeserializeOwned, const D: usize> FunctionTree<T, D> {
    /// The per-node threshold at `key`'s level, given this tree's
    /// `truncate_mode` and a unit-cube domain (`cell_width = 1.0`).
    #[must_use]
    pub fn tol_at(&self, key: Key<D>) -> f64 {
        truncate_tol(self.thresh, key.n, self.truncate_mode, 1.0)
    }

    /// Collective barrier plus drain of in-flight messages — the only
    /// place global invariants are re-established (spec.md §5).
    pub async fn fence(&self) {
        self.transport.barrier().await;
        self.container.process_all_pending();
        self.transport.barrier().await;
    }

    /// Whether `key`'s owner is the local rank.
    #[must_use]
    pub fn is_local(&self, key: Key<D>) -> bool {
        self.container.is_local(key)
    }
}
