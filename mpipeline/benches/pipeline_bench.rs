//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mpipeline::prelude::*;
use mpipeline::testing::{AddOne, Doubler, ToText};

fn thread_pipeline(workers: usize) -> Pipeline<i64, String> {
    Pipeline::new(Stage::thread(workers, || Ok(Doubler)))
        | Stage::thread(workers, || Ok(AddOne::default()))
        | Stage::thread(1, || Ok(ToText))
}

fn pipeline_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("thread_pipeline");

    for ordered in [true, false] {
        let pipeline = thread_pipeline(4);
        let options = RunOptions::default().with_ordered(ordered);
        let label = if ordered { "ordered" } else { "unordered" };
        group.bench_with_input(BenchmarkId::new(label, 1000), &1000_i64, |b, &items| {
            b.iter(|| {
                runtime.block_on(async {
                    let outputs = pipeline
                        .run(0..items, options.clone())
                        .expect("valid pipeline")
                        .collect_all()
                        .await
                        .expect("run succeeds");
                    black_box(outputs)
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
