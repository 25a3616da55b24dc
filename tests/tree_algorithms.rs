//! End-to-end scenarios over the full project/compress/gaxpy/diff pipeline
//! (spec.md §8). Boundary-condition edge cases are exercised as unit tests
//! colocated with `tree::bc`; these exercise the recursive algorithms
//! against a running task runtime and transport instead.

use madwave::factory::TreeFactory;
use madwave::rml::Rml;
use madwave::runtime::TaskRuntime;
use madwave::tensor::TensorAlgebra;
use madwave::transport::build_world;
use madwave::tree::algorithms::{compress_tree, diff, gaxpy, project, reconstruct_tree};
use madwave::tree::key::Key;
use madwave::tree::Mode;
use std::sync::Arc;
use std::time::Duration;

/// A fresh, isolated single-rank world: transport + RML + runtime, matching
/// the construction shape `factory::TreeFactory::build` expects.
async fn world() -> (Arc<madwave::transport::InProcessTransport>, Arc<Rml>, TaskRuntime) {
    let transport = Arc::new(build_world(1).into_iter().next().unwrap());
    let rml = Rml::new(transport.clone());
    let _io = rml.spawn_io_task();
    let runtime = TaskRuntime::current();
    (transport, rml, runtime)
}

/// Local `send`/spawn-based container ops are fire-and-forget; give the
/// runtime a moment to drain before inspecting results, as the `apply`
/// module's own tests do.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn mode_classification_after_compress_and_reconstruct() {
    let (transport, rml, runtime) = world().await;
    let (tree, functor, refine, initial_level) = TreeFactory::<1>::new()
        .with_k(4)
        .with_thresh(1e-6)
        .with_initial_level(3)
        .with_refine(false)
        .with_functor(Arc::new(|x: &[f64; 1]| x[0] * x[0]))
        .build(rml, runtime, transport)
        .expect("valid configuration");
    let mut tree = tree;
    project(&tree, functor.unwrap(), initial_level, refine, true).await;

    // Before compress: every leaf carries k coefficients, every seeded
    // interior node is empty (spec.md §3's Reconstructed layout).
    for (key, node) in tree.container.local_iter() {
        if node.has_children {
            assert!(node.coeff.is_empty_coeff(), "interior node {key} should be empty pre-compress");
        } else {
            assert_eq!(node.coeff.extent(), tree.k);
        }
    }

    compress_tree(&mut tree, true).await;
    settle().await;
    assert_eq!(tree.mode, Mode::Compressed);

    let tables = tree.numerics.get(tree.k);
    let scaling_ranges = tables.scaling_block_ranges(1);
    for (key, node) in tree.container.local_iter() {
        if node.has_children && key.n > 0 {
            let scaling = node.coeff.get_block(&scaling_ranges);
            assert!(
                scaling.norm2() < 1e-10,
                "non-root interior node {key}'s scaling sub-block should be exactly zero after compress"
            );
        }
    }
    let root = tree.container.get_local(Key::<1>::root()).expect("root node");
    assert!(root.coeff.norm2() > 0.0, "root should retain its scaling block");

    reconstruct_tree(&mut tree, true).await;
    settle().await;
    assert_eq!(tree.mode, Mode::Reconstructed);
    for (key, node) in tree.container.local_iter() {
        if node.has_children {
            assert!(node.coeff.is_empty_coeff(), "interior node {key} should be empty post-reconstruct");
        } else {
            assert_eq!(node.coeff.extent(), tree.k);
        }
    }
}

#[tokio::test]
async fn gaxpy_combines_coefficients_elementwise() {
    let (ta, rmla, runtimea) = world().await;
    let (tb, rmlb, runtimeb) = world().await;
    let (to, rmlo, runtimeo) = world().await;

    let (a, fa, refine_a, level_a) = TreeFactory::<1>::new()
        .with_k(3)
        .with_thresh(1e-6)
        .with_initial_level(2)
        .with_refine(false)
        .with_functor(Arc::new(|_: &[f64; 1]| 2.0))
        .build(rmla, runtimea, ta)
        .expect("valid configuration");
    let (b, fb, refine_b, level_b) = TreeFactory::<1>::new()
        .with_k(3)
        .with_thresh(1e-6)
        .with_initial_level(2)
        .with_refine(false)
        .with_functor(Arc::new(|_: &[f64; 1]| 5.0))
        .build(rmlb, runtimeb, tb)
        .expect("valid configuration");
    let (out, _, _, _) = TreeFactory::<1>::new()
        .with_empty(true)
        .build(rmlo, runtimeo, to)
        .expect("valid configuration");

    project(&a, fa.unwrap(), level_a, refine_a, true).await;
    project(&b, fb.unwrap(), level_b, refine_b, true).await;

    gaxpy(&out, 0.5, &a, 2.0, &b);
    settle().await;

    for (key, a_node) in a.container.local_iter() {
        if a_node.has_children {
            continue;
        }
        let b_node = b.container.get_local(key).expect("matching key in b");
        let out_node = out.container.get_local(key).expect("matching key in out");
        let mut expected = a_node.coeff.clone();
        expected.scale(0.5);
        expected.gaxpy(1.0, &b_node.coeff, 2.0);
        for i in 0..expected.extent() {
            assert!(
                (expected.as_slice()[i] - out_node.coeff.as_slice()[i]).abs() < 1e-10,
                "gaxpy mismatch at {key}, coefficient {i}"
            );
        }
    }
}

#[tokio::test]
async fn differentiating_a_constant_function_is_near_zero() {
    let (ti, rmli, runtimei) = world().await;
    let (to, rmlo, runtimeo) = world().await;

    let (tree_in, functor, refine, initial_level) = TreeFactory::<1>::new()
        .with_k(4)
        .with_thresh(1e-8)
        .with_initial_level(3)
        .with_refine(false)
        .with_functor(Arc::new(|_: &[f64; 1]| 7.0))
        .build(rmli, runtimei, ti)
        .expect("valid configuration");
    let (tree_out, _, _, _) = TreeFactory::<1>::new()
        .with_empty(true)
        .build(rmlo, runtimeo, to)
        .expect("valid configuration");

    project(&tree_in, functor.unwrap(), initial_level, refine, true).await;
    diff(&tree_in, &tree_out, 0, true).await;
    settle().await;

    for (key, node) in tree_out.container.local_iter() {
        if node.has_children {
            continue;
        }
        assert!(
            node.coeff.norm2() < 1e-8,
            "derivative of a constant should vanish at {key}, got norm {}",
            node.coeff.norm2()
        );
    }
}
