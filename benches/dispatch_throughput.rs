use cancellable_result::{ok, result, CancellationToken, Handlers, Scheduler};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn promise_benchmark(c: &mut Criterion) {
    c.bench_function("promise_ready_source", |b| {
        b.iter(|| {
            let r = result(async { ok::<_, &str, ()>(black_box(42)) });
            black_box(cancellable_result::block_on(r.promise()))
        })
    });
}

fn resolve_benchmark(c: &mut Criterion) {
    let scheduler = Scheduler::new();

    c.bench_function("resolve_success", |b| {
        b.iter(|| {
            let r = result(async { ok::<_, &str, ()>(black_box(42)) });
            let resolution = r.resolve_in(&scheduler.handle(), |v| { black_box(v); }, Handlers::new());
            black_box(scheduler.block_on(resolution))
        })
    });

    c.bench_function("resolve_cancelled", |b| {
        b.iter(|| {
            let r = result(async { ok::<_, &str, ()>(black_box(42)) });
            let resolution =
                r.resolve_in(&scheduler.handle(), |_| (), Handlers::new().on_cancelled(|| ()));
            resolution.cancel();
            black_box(scheduler.block_on(resolution))
        })
    });
}

fn token_cascade_benchmark(c: &mut Criterion) {
    c.bench_function("token_cascade_depth_16", |b| {
        b.iter(|| {
            let tokens: Vec<CancellationToken> = (0..16).map(|_| CancellationToken::new()).collect();
            for pair in tokens.windows(2) {
                pair[0].register_child(pair[1].clone().into());
            }
            tokens[0].cancel();
            black_box(tokens[15].is_cancelled())
        })
    });
}

criterion_group!(
    benches,
    promise_benchmark,
    resolve_benchmark,
    token_cascade_benchmark
);
criterion_main!(benches);
