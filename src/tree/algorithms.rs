//! Recursive tree algorithms (spec.md §4.4): project, compress,
//! reconstruct, standard, truncate, multiply, differentiate, gaxpy/scale,
//! local reductions, refinement, and neighbor lookup.
//!
//! Recursion into remote-owned subtrees goes through
//! [`crate::container::DistributedContainer`]; the fast path throughout is
//! same-process recursion, which is what every end-to-end scenario in
//! spec.md §8 exercises with a single-rank world.

use super::node::{Node, NORM_UNSET};
use super::{FunctionTree, Mode};
use crate::container::ContainerOp;
use crate::numerics::KTables;
use crate::tensor::{DenseTensor, Matrix, TensorAlgebra};
use crate::tree::key::Key;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::sync::Arc;

/// Identity `k x k` matrix, used to hold an axis fixed in
/// [`TensorAlgebra::general_transform`].
fn identity(k: usize) -> Matrix {
    let mut m = Matrix::zeros(k, k);
    for i in 0..k {
        m.set(i, i, 1.0);
    }
    m
}

/// Per-axis sub-range a child patch occupies inside its parent's `2k`-wide
/// two-scale block: axis `i`'s low half if bit `i` of `child_index` is 0,
/// high half otherwise.
fn child_ranges(k: usize, child_index: usize, dim: usize) -> Vec<std::ops::Range<usize>> {
    (0..dim)
        .map(|axis| {
            if (child_index >> axis) & 1 == 0 {
                0..k
            } else {
                k..2 * k
            }
        })
        .collect()
}

/// Wavelet energy of a `(2k)^d` two-scale block: the Frobenius norm of
/// everything outside the all-scaling corner, using Parseval's identity
/// (`hg`/`hgt` are orthogonal) rather than materializing the complement.
fn wavelet_energy<const D: usize>(block: &DenseTensor, tables: &KTables) -> f64 {
    let scaling = block.get_block(&tables.scaling_block_ranges(D));
    let total2 = block.norm2().powi(2);
    let scaling2 = scaling.norm2().powi(2);
    (total2 - scaling2).max(0.0).sqrt()
}

/// Insert empty interior placeholders for every not-yet-present ancestor of
/// `key`, re-establishing spec.md §3's connectivity invariant. Only valid to
/// call when `key`'s whole ancestor chain is owned by this rank — safe for
/// every caller in this module since they all operate on locally-rooted
/// recursion; [`crate::apply`] checks `is_local` before calling this.
pub(crate) fn ensure_ancestors<const D: usize>(tree: &FunctionTree<DenseTensor, D>, key: Key<D>) {
    let mut cur = key;
    while cur.n > 0 {
        cur = cur.parent();
        if tree.container.get_local(cur).is_some() {
            break;
        }
        tree.container.replace(cur, Node::interior_empty(D));
        tree.container.process_pending(cur);
    }
}

/// Evaluate `functor` on the `k`-point Gauss-Legendre grid inside the box
/// at `key`, returning the `k^d` scaling-coefficient projection
/// (spec.md §4.4.1).
fn project_box<const D: usize>(
    tables: &KTables,
    key: Key<D>,
    functor: &(dyn Fn(&[f64; D]) -> f64 + Send + Sync),
) -> DenseTensor {
    let npt = tables.quad_x.len();
    let mut values = DenseTensor::zeros(D, npt);
    let scale = 1.0 / f64::from(key.boxes_per_axis() as u32);
    let total = npt.pow(u32::try_from(D).unwrap());
    for flat in 0..total {
        let mut rem = flat;
        let mut idx = [0usize; D];
        for axis in (0..D).rev() {
            idx[axis] = rem % npt;
            rem /= npt;
        }
        let mut coords = [0.0f64; D];
        for axis in 0..D {
            coords[axis] = (key.l[axis] as f64 + tables.quad_x[idx[axis]]) * scale;
        }
        let v = functor(&coords);
        values.set(&idx, v);
    }
    values.transform(&tables.quad_phiw)
}

/// Project `functor` into `tree`, starting from the root and refining down
/// to `initial_level` (or one shallower when `truncate_on_project` is set,
/// matching spec.md §4.4.1's seeding rule), then adaptively beyond that
/// when `refine` is requested.
pub async fn project<const D: usize>(
    tree: &FunctionTree<DenseTensor, D>,
    functor: Arc<dyn Fn(&[f64; D]) -> f64 + Send + Sync>,
    initial_level: u32,
    refine: bool,
    fence: bool,
) {
    let seed_level = if tree.truncate_on_project {
        initial_level.saturating_sub(1)
    } else {
        initial_level
    };
    let root = Key::<D>::root();
    let mut frontier = vec![root];
    for _ in 0..seed_level {
        let mut next = Vec::new();
        for key in frontier {
            tree.container.replace(key, Node::interior_empty(D));
            next.extend(key.children());
        }
        frontier = next;
    }
    let mut handles: Vec<BoxFuture<'_, ()>> = Vec::new();
    for key in frontier {
        if !tree.is_local(key) {
            continue;
        }
        handles.push(project_refine_op(tree, Arc::clone(&functor), key, refine));
    }
    join_all(handles).await;
    if tree.autorefine {
        autorefine_tree(tree);
    }
    if fence {
        tree.fence().await;
    }
}

/// `project_refine_op` (spec.md §4.4.1): project `key`'s box, then either
/// retain the result as a leaf or recurse into the `2^d` children when the
/// child-level wavelet energy exceeds threshold.
fn project_refine_op<'a, const D: usize>(
    tree: &'a FunctionTree<DenseTensor, D>,
    functor: Arc<dyn Fn(&[f64; D]) -> f64 + Send + Sync>,
    key: Key<D>,
    refine: bool,
) -> BoxFuture<'a, ()> {
    async move {
        let tables = tree.numerics.get(tree.k);
        let coeff = project_box(&tables, key, functor.as_ref());

        if refine && key.n < tree.max_refine_level {
            let mut assembled = DenseTensor::zeros(D, 2 * tree.k);
            for bits in 0..(1usize << D) {
                let child_key = key.child(bits);
                let child_coeff = project_box(&tables, child_key, functor.as_ref());
                assembled.set_block(&child_ranges(tree.k, bits, D), &child_coeff);
            }
            let filtered = assembled.transform(&tables.two_scale.hg);
            let energy = wavelet_energy::<D>(&filtered, &tables);
            if energy > tree.tol_at(key) {
                tree.container.replace(key, Node::interior_empty(D));
                ensure_ancestors(tree, key);
                let mut handles = Vec::new();
                for bits in 0..(1usize << D) {
                    let child_key = key.child(bits);
                    let functor = Arc::clone(&functor);
                    handles.push(project_refine_op(tree, functor, child_key, refine));
                }
                join_all(handles).await;
                return;
            }
        }
        tree.container.replace(key, Node::leaf(coeff));
        ensure_ancestors(tree, key);
    }
    .boxed()
}

/// Post-order compress (spec.md §4.4.2): recurse to the leaves, filter
/// each `2^d` group of children's scaling blocks into scaling+wavelet at
/// the parent, and zero the scaling sub-block unless this is the root or
/// the tree is being kept in non-standard form.
pub fn compress<const D: usize>(tree: &FunctionTree<DenseTensor, D>, key: Key<D>) -> BoxFuture<'_, DenseTensor> {
    async move {
        let node = tree.container.get_local(key).expect("compress: missing local node");
        if !node.has_children {
            return node.coeff;
        }
        let mut handles = Vec::with_capacity(1 << D);
        for bits in 0..(1usize << D) {
            handles.push(compress(tree, key.child(bits)));
        }
        let children: Vec<DenseTensor> = join_all(handles).await;

        let tables = tree.numerics.get(tree.k);
        let mut assembled = DenseTensor::zeros(D, 2 * tree.k);
        for (bits, child_coeff) in children.into_iter().enumerate() {
            assembled.set_block(&child_ranges(tree.k, bits, D), &child_coeff);
        }
        let mut filtered = assembled.transform(&tables.two_scale.hg);
        let scaling_ranges = tables.scaling_block_ranges(D);
        let returned_to_parent = filtered.get_block(&scaling_ranges);
        if !matches!(tree.mode, Mode::NonStandard) && key.n > 0 {
            filtered.zero_block(&scaling_ranges);
        }
        tree.container.replace(
            key,
            Node {
                coeff: filtered,
                has_children: true,
                norm_tree: NORM_UNSET,
            },
        );
        returned_to_parent
    }
    .boxed()
}

/// Run `compress` from the root and set the tree's mode.
pub async fn compress_tree<const D: usize>(tree: &mut FunctionTree<DenseTensor, D>, fence: bool) {
    let root = Key::<D>::root();
    compress(tree, root).await;
    tree.mode = Mode::Compressed;
    if fence {
        tree.fence().await;
    }
}

/// Pre-order reconstruct (spec.md §4.4.2): the inverse of `compress`.
/// `incoming` is the parent's contribution to this node's scaling
/// sub-block (`None` at the root, which already holds its own scaling).
pub fn reconstruct<'a, const D: usize>(
    tree: &'a FunctionTree<DenseTensor, D>,
    key: Key<D>,
    incoming: Option<DenseTensor>,
) -> BoxFuture<'a, ()> {
    async move {
        let node = tree.container.get_local(key).expect("reconstruct: missing local node");
        let tables = tree.numerics.get(tree.k);
        let scaling_ranges = tables.scaling_block_ranges(D);

        let mut patched = node.coeff.clone();
        let local_corner = node.coeff.get_block(&scaling_ranges);
        let combined = match incoming {
            Some(mut inc) => {
                inc.gaxpy(1.0, &local_corner, 1.0);
                inc
            }
            None => local_corner,
        };
        patched.set_block(&scaling_ranges, &combined);

        if !node.has_children {
            // A leaf reached during reconstruct: spec.md §3 says leaves
            // carry scaling-only coefficients post-reconstruct.
            tree.container.replace(key, Node::leaf(combined));
            return;
        }

        let unfiltered = patched.transform(&tables.two_scale.hgt);
        tree.container.replace(
            key,
            Node {
                coeff: DenseTensor::zeros(D, 0),
                has_children: true,
                norm_tree: NORM_UNSET,
            },
        );

        let mut handles = Vec::with_capacity(1 << D);
        for bits in 0..(1usize << D) {
            let child_key = key.child(bits);
            let patch = unfiltered.get_block(&child_ranges(tree.k, bits, D));
            let child_exists_interior = tree
                .container
                .get_local(child_key)
                .map(|n| n.has_children)
                .unwrap_or(false);
            if child_exists_interior {
                handles.push(reconstruct(tree, child_key, Some(patch)));
            } else {
                tree.container.replace(child_key, Node::leaf(patch));
                handles.push(async {}.boxed());
            }
        }
        join_all(handles).await;
    }
    .boxed()
}

/// Run `reconstruct` from the root and set the tree's mode.
pub async fn reconstruct_tree<const D: usize>(tree: &mut FunctionTree<DenseTensor, D>, fence: bool) {
    let root = Key::<D>::root();
    reconstruct(tree, root, None).await;
    tree.mode = Mode::Reconstructed;
    if fence {
        tree.fence().await;
    }
}

/// `standard()` (spec.md §4.4.2): zero the scaling sub-block of every
/// interior node and delete both sub-blocks of every leaf, converting a
/// non-standard-compressed tree into standard compressed form.
pub fn standard<const D: usize>(tree: &mut FunctionTree<DenseTensor, D>) {
    let tables = tree.numerics.get(tree.k);
    let ranges = tables.scaling_block_ranges(D);
    for (key, mut node) in tree.container.local_iter() {
        if node.has_children {
            node.coeff.zero_block(&ranges);
        } else {
            node.coeff = DenseTensor::zeros(D, 0);
        }
        tree.container.replace(key, node);
    }
    tree.mode = Mode::Compressed;
}

/// Depth-first truncation (spec.md §4.4.3) of a compressed-form tree:
/// delete a node's children if none of them have anything of their own and
/// this node's wavelet energy is below threshold. Returns whether `key`
/// (or anything beneath it) still holds content.
pub fn truncate<'a, const D: usize>(tree: &'a FunctionTree<DenseTensor, D>, key: Key<D>) -> BoxFuture<'a, bool> {
    async move {
        let node = match tree.container.get_local(key) {
            Some(n) => n,
            None => return false,
        };
        if !node.has_children {
            return node.coeff.norm2() > 0.0;
        }
        let mut handles = Vec::with_capacity(1 << D);
        for bits in 0..(1usize << D) {
            handles.push(truncate(tree, key.child(bits)));
        }
        let child_results = join_all(handles).await;
        let any_child_has_content = child_results.into_iter().any(|v| v);

        let tables = tree.numerics.get(tree.k);
        let energy = wavelet_energy::<D>(&node.coeff, &tables);
        if !any_child_has_content && energy <= tree.tol_at(key) {
            for bits in 0..(1usize << D) {
                tree.container.remove(key.child(bits));
            }
            let mut updated = node.clone();
            updated.has_children = false;
            tree.container.replace(key, updated);
            return energy > 0.0;
        }
        true
    }
    .boxed()
}

/// Run `truncate` from the root.
pub async fn truncate_tree<const D: usize>(tree: &FunctionTree<DenseTensor, D>, fence: bool) {
    truncate(tree, Key::<D>::root()).await;
    if fence {
        tree.fence().await;
    }
}

fn pointwise_mul(a: &DenseTensor, b: &DenseTensor) -> DenseTensor {
    let data: Vec<f64> = a.as_slice().iter().zip(b.as_slice()).map(|(x, y)| x * y).collect();
    DenseTensor::from_vec(a.ndim(), a.extent(), data)
}

/// Cached-or-computed L2 norm of the local subtree rooted at `key`
/// (spec.md §3's `Node.norm_tree`): the node's own coefficients combined
/// in quadrature with every child's subtree norm, recursively. Computed
/// once and written back into the container; a key absent locally has
/// norm `0.0` (nothing to screen).
pub fn subtree_norm<const D: usize>(tree: &FunctionTree<DenseTensor, D>, key: Key<D>) -> f64 {
    let Some(node) = tree.container.get_local(key) else {
        return 0.0;
    };
    if node.norm_tree != NORM_UNSET {
        return node.norm_tree;
    }
    let own2 = node.coeff.norm2().powi(2);
    let total2 = if node.has_children {
        (0..(1usize << D)).fold(own2, |acc, bits| acc + subtree_norm(tree, key.child(bits)).powi(2))
    } else {
        own2
    };
    let total = total2.sqrt();
    let mut cached = node;
    cached.norm_tree = total;
    tree.container.replace(key, cached);
    total
}

/// Widen a leaf's `k^d` scaling block into a `(2k)^d` two-scale block and
/// unfilter it, returning the parent's contribution to each of the `2^d`
/// children's scaling sub-block — the same construction `refine_op` uses
/// to split a leaf.
fn unfilter_leaf<const D: usize>(coeff: &DenseTensor, tables: &KTables, k: usize) -> DenseTensor {
    let mut widened = DenseTensor::zeros(D, 2 * k);
    widened.set_block(&tables.scaling_block_ranges(D), coeff);
    widened.transform(&tables.two_scale.hgt)
}

/// Multiply two co-located, same-level leaves' scaling coefficients
/// pointwise on the common quadrature grid (spec.md §4.4.4 case a),
/// rescaling by `2^{-n*d/2}` for the change of cell width relative to the
/// unit reference interval the quadrature tables are built on.
fn multiply_leaf_pair<const D: usize>(out: &FunctionTree<DenseTensor, D>, tables: &KTables, key: Key<D>, lcoeff: &DenseTensor, rcoeff: &DenseTensor) {
    let lvals = lcoeff.transform(&tables.quad_phi_t);
    let rvals = rcoeff.transform(&tables.quad_phi_t);
    let prod = pointwise_mul(&lvals, &rvals);
    let mut coeff = prod.transform(&tables.quad_phiw);
    let scale = 2f64.powf(-(f64::from(key.n) * D as f64) / 2.0);
    coeff.scale(scale);
    out.container.replace(key, Node::leaf(coeff));
}

/// Spec.md §4.4.4 case c: one operand (`deeper`) is refined past the
/// other's leaf. `virtual_coeff` is the coarser operand's leaf, already
/// unfiltered down to `key`'s level. Keep unfiltering one level at a time,
/// in step with `deeper`'s actual structure, until `deeper` also bottoms
/// out in a leaf — then multiply the two co-located, same-level leaves
/// (case a). Screens against `deeper`'s cached subtree norm (case b)
/// before paying for another level of unfiltering.
fn mul_against_deeper<'a, const D: usize>(
    out: &'a FunctionTree<DenseTensor, D>,
    deeper: &'a FunctionTree<DenseTensor, D>,
    key: Key<D>,
    virtual_coeff: DenseTensor,
    virtual_is_left: bool,
) -> BoxFuture<'a, ()> {
    async move {
        let Some(dn) = deeper.container.get_local(key) else {
            return;
        };
        let tables = out.numerics.get(out.k);
        if !dn.has_children {
            let (lcoeff, rcoeff) = if virtual_is_left {
                (&virtual_coeff, &dn.coeff)
            } else {
                (&dn.coeff, &virtual_coeff)
            };
            multiply_leaf_pair::<D>(out, &tables, key, lcoeff, rcoeff);
            ensure_ancestors(out, key);
            return;
        }
        if subtree_norm(deeper, key) <= out.tol_at(key) {
            return;
        }
        out.container.replace(key, Node::interior_empty(D));
        ensure_ancestors(out, key);
        let unfiltered = unfilter_leaf::<D>(&virtual_coeff, &tables, out.k);
        let mut handles = Vec::with_capacity(1 << D);
        for bits in 0..(1usize << D) {
            let child_key = key.child(bits);
            let patch = unfiltered.get_block(&child_ranges(out.k, bits, D));
            handles.push(mul_against_deeper(out, deeper, child_key, patch, virtual_is_left));
        }
        join_all(handles).await;
    }
    .boxed()
}

/// Pointwise multiply two reconstructed-form trees with identical process
/// maps into a fresh `out` tree (spec.md §4.4.4):
///
/// - **case a** — both sides are co-located, same-level leaves: multiply
///   directly (`multiply_leaf_pair`).
/// - **case b** — the deeper side's cached subtree norm
///   ([`subtree_norm`]) is at or below threshold at this key: its
///   contribution is negligible, so recursion stops here rather than
///   chasing it to the bottom.
/// - **case c** — one side is a leaf and the other is refined past it: the
///   leaf is unfiltered one level at a time (`mul_against_deeper`) to meet
///   the deeper side's actual grid, instead of comparing it against
///   nothing once the shallower side runs out of children.
/// - a node absent from one side entirely is exactly zero there, so the
///   product underneath it is zero too.
pub fn mul<'a, const D: usize>(
    out: &'a FunctionTree<DenseTensor, D>,
    left: &'a FunctionTree<DenseTensor, D>,
    right: &'a FunctionTree<DenseTensor, D>,
    key: Key<D>,
) -> BoxFuture<'a, ()> {
    async move {
        let l = left.container.get_local(key);
        let r = right.container.get_local(key);
        let tables = out.numerics.get(out.k);

        match (l, r) {
            (Some(ln), Some(rn)) if !ln.has_children && !rn.has_children => {
                multiply_leaf_pair::<D>(out, &tables, key, &ln.coeff, &rn.coeff);
                ensure_ancestors(out, key);
            }
            (Some(ln), Some(rn)) if !ln.has_children && rn.has_children => {
                if subtree_norm(right, key) <= out.tol_at(key) {
                    return;
                }
                out.container.replace(key, Node::interior_empty(D));
                ensure_ancestors(out, key);
                let unfiltered = unfilter_leaf::<D>(&ln.coeff, &tables, out.k);
                let mut handles = Vec::with_capacity(1 << D);
                for bits in 0..(1usize << D) {
                    let child_key = key.child(bits);
                    let patch = unfiltered.get_block(&child_ranges(out.k, bits, D));
                    handles.push(mul_against_deeper(out, right, child_key, patch, true));
                }
                join_all(handles).await;
            }
            (Some(ln), Some(rn)) if ln.has_children && !rn.has_children => {
                if subtree_norm(left, key) <= out.tol_at(key) {
                    return;
                }
                out.container.replace(key, Node::interior_empty(D));
                ensure_ancestors(out, key);
                let unfiltered = unfilter_leaf::<D>(&rn.coeff, &tables, out.k);
                let mut handles = Vec::with_capacity(1 << D);
                for bits in 0..(1usize << D) {
                    let child_key = key.child(bits);
                    let patch = unfiltered.get_block(&child_ranges(out.k, bits, D));
                    handles.push(mul_against_deeper(out, left, child_key, patch, false));
                }
                join_all(handles).await;
            }
            (Some(_), Some(_)) => {
                out.container.replace(key, Node::interior_empty(D));
                ensure_ancestors(out, key);
                let mut handles = Vec::with_capacity(1 << D);
                for bits in 0..(1usize << D) {
                    handles.push(mul(out, left, right, key.child(bits)));
                }
                join_all(handles).await;
            }
            _ => {}
        }
    }
    .boxed()
}

/// Run `mul` from the root and, if `out.autorefine` is set, sweep the
/// result once through `refine_op` (spec.md §4.4.8's
/// `autorefine_square_test`, applied after project/multiply).
pub async fn mul_tree<const D: usize>(out: &FunctionTree<DenseTensor, D>, left: &FunctionTree<DenseTensor, D>, right: &FunctionTree<DenseTensor, D>, fence: bool) {
    mul(out, left, right, Key::<D>::root()).await;
    if out.autorefine {
        autorefine_tree(out);
    }
    if fence {
        out.fence().await;
    }
}

/// Apply `refine_op` once to every local leaf (spec.md §4.4.8's
/// `autorefine_square_test`, run after `project`/`mul` when
/// `tree.autorefine` is set).
pub fn autorefine_tree<const D: usize>(tree: &FunctionTree<DenseTensor, D>) {
    let leaves: Vec<Key<D>> = tree
        .container
        .local_iter()
        .filter(|(_, n)| !n.has_children)
        .map(|(k, _)| k)
        .collect();
    for key in leaves {
        refine_op(tree, key);
    }
}

/// `do_diff2` (spec.md §4.4.5): three-point derivative along `axis` using
/// the precomputed `rm`/`r0`/`rp` blocks, assuming both neighbors exist at
/// the same level as `key`. Neighbors missing entirely (boundary, or not
/// yet refined to a matching level) contribute nothing — the `do_diff1`
/// local-refine path for level-mismatched neighbors is not implemented;
/// see `DESIGN.md`.
pub async fn diff_leaf<const D: usize>(
    tree_in: &FunctionTree<DenseTensor, D>,
    tree_out: &FunctionTree<DenseTensor, D>,
    key: Key<D>,
    axis: usize,
) {
    let Some(node) = tree_in.container.get_local(key) else {
        return;
    };
    if node.has_children {
        return;
    }
    let tables = tree_in.numerics.get(tree_in.k);
    let left_key = tree_in.bc.neighbor_axis(key, axis, -1);
    let right_key = tree_in.bc.neighbor_axis(key, axis, 1);
    let left = if left_key.is_valid() {
        tree_in.container.find(left_key).await
    } else {
        None
    };
    let right = if right_key.is_valid() {
        tree_in.container.find(right_key).await
    } else {
        None
    };

    let scale = 2f64.powi(i32::try_from(key.n).unwrap_or(i32::MAX));
    let identities: Vec<Matrix> = (0..D).map(|_| identity(tree_in.k)).collect();
    let mut per_axis = identities.clone();
    per_axis[axis] = tables.r0.clone();
    let mut result = node.coeff.general_transform(&per_axis);
    if let Some(l) = left {
        if !l.has_children {
            let mut per_axis = identities.clone();
            per_axis[axis] = tables.rm.clone();
            result.gaxpy(1.0, &l.coeff.general_transform(&per_axis), 1.0);
        }
    }
    if let Some(r) = right {
        if !r.has_children {
            let mut per_axis = identities;
            per_axis[axis] = tables.rp.clone();
            result.gaxpy(1.0, &r.coeff.general_transform(&per_axis), 1.0);
        }
    }
    result.scale(scale);
    tree_out.container.replace(key, Node::leaf(result));
    ensure_ancestors(tree_out, key);
}

/// Differentiate every local leaf of `tree_in` along `axis` into `tree_out`
/// (spec.md §4.4.5). Every leaf's neighbor lookups run concurrently since
/// each one issues a remote `find` (spec.md §4.4.5's last sentence).
pub async fn diff<const D: usize>(tree_in: &FunctionTree<DenseTensor, D>, tree_out: &FunctionTree<DenseTensor, D>, axis: usize, fence: bool) {
    let leaves: Vec<Key<D>> = tree_in
        .container
        .local_iter()
        .filter(|(_, n)| !n.has_children)
        .map(|(k, _)| k)
        .collect();
    let handles: Vec<BoxFuture<'_, ()>> = leaves
        .into_iter()
        .map(|key| diff_leaf(tree_in, tree_out, key, axis).boxed())
        .collect();
    join_all(handles).await;
    if fence {
        tree_out.fence().await;
    }
}

/// `gaxpy(alpha, a, beta, b)` into `out` (spec.md §4.4.7): walk each
/// operand's local shard and merge into `out` via the container's
/// `GaxpyInPlace` op, which short-circuits to a local update when `out`
/// shares the destination rank.
pub fn gaxpy<const D: usize>(out: &FunctionTree<DenseTensor, D>, alpha: f64, a: &FunctionTree<DenseTensor, D>, beta: f64, b: &FunctionTree<DenseTensor, D>) {
    for (key, node) in a.container.local_iter() {
        out.container.send(key, ContainerOp::GaxpyInPlace { alpha: 1.0, other: node, beta: alpha });
    }
    for (key, node) in b.container.local_iter() {
        out.container.send(key, ContainerOp::GaxpyInPlace { alpha: 1.0, other: node, beta });
    }
}

/// `scale(alpha)` in place on the local shard (spec.md §4.4.7).
pub fn scale<const D: usize>(tree: &FunctionTree<DenseTensor, D>, alpha: f64) {
    for (key, mut node) in tree.container.local_iter() {
        node.coeff.scale(alpha);
        node.norm_tree = NORM_UNSET;
        tree.container.replace(key, node);
    }
}

/// Sum of trace-conjugate products over co-located nodes that both carry
/// coefficients, local shard only (spec.md §4.4.7). Requires identical
/// process maps between `a` and `b`.
pub fn inner_local<const D: usize>(a: &FunctionTree<DenseTensor, D>, b: &FunctionTree<DenseTensor, D>) -> f64 {
    let mut total = 0.0;
    for (key, an) in a.container.local_iter() {
        if an.coeff.is_empty_coeff() {
            continue;
        }
        if let Some(bn) = b.container.get_local(key) {
            if !bn.coeff.is_empty_coeff() {
                total += an.coeff.inner(&bn.coeff);
            }
        }
    }
    total
}

/// Sum of squared coefficient norms over the local shard (spec.md §4.4.7).
#[must_use]
pub fn norm2sq_local<const D: usize>(tree: &FunctionTree<DenseTensor, D>) -> f64 {
    tree.container
        .local_iter()
        .map(|(_, n)| n.coeff.norm2().powi(2))
        .sum()
}

/// Sum of diagonal-like contributions over the local shard — for a real
/// scalar tree this coincides with `norm2sq_local` restricted to the root
/// scaling block (spec.md §4.4.7's `trace_local`).
#[must_use]
pub fn trace_local<const D: usize>(tree: &FunctionTree<DenseTensor, D>) -> f64 {
    tree.container
        .get_local(Key::<D>::root())
        .map(|n| n.coeff.as_slice().iter().sum())
        .unwrap_or(0.0)
}

/// Count of local nodes (spec.md §4.4.7's `size`).
#[must_use]
pub fn size<const D: usize>(tree: &FunctionTree<DenseTensor, D>) -> usize {
    tree.container.local_len()
}

/// Alias of `size`, kept distinct per spec.md's naming (`tree_size`
/// reports local node count; callers apply the collective sum).
#[must_use]
pub fn tree_size<const D: usize>(tree: &FunctionTree<DenseTensor, D>) -> usize {
    size(tree)
}

/// Maximum level among local nodes.
#[must_use]
pub fn max_depth<const D: usize>(tree: &FunctionTree<DenseTensor, D>) -> u32 {
    tree.container.local_iter().map(|(k, _)| k.n).max().unwrap_or(0)
}

/// `(min, max)` node count across local per-level buckets — a coarse
/// load-imbalance signal (spec.md §4.4.7's `min/max_nodes`).
#[must_use]
pub fn min_max_nodes<const D: usize>(tree: &FunctionTree<DenseTensor, D>) -> (usize, usize) {
    use std::collections::HashMap;
    let mut per_level: HashMap<u32, usize> = HashMap::new();
    for (key, _) in tree.container.local_iter() {
        *per_level.entry(key.n).or_insert(0) += 1;
    }
    let min = per_level.values().copied().min().unwrap_or(0);
    let max = per_level.values().copied().max().unwrap_or(0);
    (min, max)
}

/// `refine_op` (spec.md §4.4.8): split a leaf whose high-order coefficient
/// half is not negligible relative to its low-order half.
pub fn refine_op<const D: usize>(tree: &FunctionTree<DenseTensor, D>, key: Key<D>) {
    if key.n >= tree.max_refine_level {
        return;
    }
    let Some(node) = tree.container.get_local(key) else {
        return;
    };
    if node.has_children || node.coeff.is_empty_coeff() {
        return;
    }
    let tables = tree.numerics.get(tree.k);
    let low_ranges = tables.low_half_ranges(D);
    let lo = node.coeff.get_block(&low_ranges).norm2();
    let mut high_only = node.coeff.clone();
    high_only.zero_block(&low_ranges);
    let hi = high_only.norm2();
    if 2.0 * lo * hi + hi * hi <= tree.tol_at(key) {
        return;
    }

    let mut widened = DenseTensor::zeros(D, 2 * tree.k);
    let scaling_ranges = tables.scaling_block_ranges(D);
    widened.set_block(&scaling_ranges, &node.coeff);
    let unfiltered = widened.transform(&tables.two_scale.hgt);

    tree.container.replace(key, Node::interior_empty(D));
    for bits in 0..(1usize << D) {
        let child_key = key.child(bits);
        let patch = unfiltered.get_block(&child_ranges(tree.k, bits, D));
        tree.container.replace(child_key, Node::leaf(patch));
    }
}

/// `neighbor(key, axis, step)` (spec.md §4.4.8): delegate to the tree's
/// boundary condition matrix.
#[must_use]
pub fn neighbor<const D: usize>(tree: &FunctionTree<DenseTensor, D>, key: Key<D>, axis: usize, step: i64) -> Key<D> {
    tree.bc.neighbor_axis(key, axis, step)
}

/// `neighbor(key, displacement)` (spec.md §4.4.8), capping periodic
/// displacements to `|l_i| <= 2^{n-1}` to avoid double counting
/// (spec.md §4.4.6's last bullet).
#[must_use]
pub fn neighbor_displacement<const D: usize>(tree: &FunctionTree<DenseTensor, D>, key: Key<D>, displacement: [i64; D]) -> Key<D> {
    let cap = 1i64 << key.n.saturating_sub(1);
    let mut capped = displacement;
    for d in &mut capped {
        *d = (*d).clamp(-cap, cap);
    }
    tree.bc.neighbor(key, capped)
}

/// Walk upward from `key` looking for an ancestor with coefficients
/// (spec.md §4.4.8). Local-shard lookup only; remote ancestors route
/// through `find` in the caller if needed.
pub async fn sock_it_to_me<const D: usize>(tree: &FunctionTree<DenseTensor, D>, key: Key<D>) -> Option<(Key<D>, DenseTensor)> {
    let mut cur = key;
    loop {
        if let Some(node) = tree.container.find(cur).await {
            if !node.coeff.is_empty_coeff() {
                return Some((cur, node.coeff));
            }
        }
        if cur.n == 0 {
            return None;
        }
        cur = cur.parent();
    }
}
