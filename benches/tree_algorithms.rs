//! Benchmarks for the hot recursive descent paths: `compress` and `apply`
//! (spec.md §4.4.2, §4.4.6), mirroring the teacher's async-benchmark shape.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use madwave::apply::timing::NodeTimer;
use madwave::apply::{apply, IntegralOperator};
use madwave::factory::TreeFactory;
use madwave::rml::Rml;
use madwave::runtime::TaskRuntime;
use madwave::tensor::DenseTensor;
use madwave::tree::algorithms::{compress_tree, project};
use madwave::tree::FunctionTree;
use madwave::transport::build_world;
use std::sync::Arc;
use tokio::runtime::Runtime;

async fn projected_tree(k: usize, initial_level: u32) -> FunctionTree<DenseTensor, 2> {
    let transport = Arc::new(build_world(1).into_iter().next().unwrap());
    let rml = Rml::new(transport.clone());
    let _io = rml.spawn_io_task();
    let runtime = TaskRuntime::current();

    let (tree, functor, refine, initial_level) = TreeFactory::<2>::new()
        .with_k(k)
        .with_thresh(1e-6)
        .with_initial_level(initial_level)
        .with_refine(false)
        .with_functor(Arc::new(|x: &[f64; 2]| (-(x[0] * x[0] + x[1] * x[1])).exp()))
        .build(rml, runtime, transport)
        .expect("valid configuration");

    project(&tree, functor.unwrap(), initial_level, refine, true).await;
    tree
}

fn bench_compress(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("compress");

    for k in [3usize, 6].iter() {
        group.bench_with_input(BenchmarkId::new("compress_tree", k), k, |b, &k| {
            b.to_async(&rt).iter(|| async move {
                let mut tree = projected_tree(k, 4).await;
                compress_tree(&mut tree, true).await;
                black_box(&tree.mode);
            });
        });
    }
    group.finish();
}

struct IdentityKernel;

impl IntegralOperator<2> for IdentityKernel {
    fn displacements(&self, _level: u32) -> Vec<[i64; 2]> {
        vec![[0, 0]]
    }

    fn opnorm(&self, _level: u32, _displacement: [i64; 2]) -> f64 {
        1.0
    }

    fn apply_kernel(&self, _level: u32, _displacement: [i64; 2], source: &DenseTensor) -> DenseTensor {
        source.clone()
    }
}

fn bench_apply(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("apply");

    group.bench_function("identity_kernel", |b| {
        b.to_async(&rt).iter(|| async move {
            let f = projected_tree(4, 4).await;
            let transport = Arc::new(build_world(1).into_iter().next().unwrap());
            let rml = Rml::new(transport.clone());
            let _io = rml.spawn_io_task();
            let runtime = TaskRuntime::current();
            let (out, _, _, _) = TreeFactory::<2>::new()
                .with_empty(true)
                .build(rml, runtime, transport)
                .expect("valid configuration");

            let timer = NodeTimer::new();
            apply(&IdentityKernel, &timer, &f, &out, 1e-9, true).await;
            black_box(&out.mode);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_compress, bench_apply);
criterion_main!(benches);
