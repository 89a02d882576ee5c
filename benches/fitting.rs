//! Criterion benchmarks for the fitting loop.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use nmfit::prelude::*;

const WINDOWS: usize = 4;

fn make_config(nodes: usize) -> DelayedLinearConfig {
    DelayedLinearConfig::default()
        .with_nodes(nodes, nodes)
        .with_grid(5, 10)
        .with_delay(3)
        .with_seed(42)
}

fn make_session(nodes: usize) -> ModelFitting<DelayedLinear, TimeSeriesCost> {
    let cfg = make_config(nodes);
    let mut truth = DelayedLinear::ring(cfg.clone().with_seed(7)).unwrap();
    let series = simulate(&mut truth, WINDOWS, 1, None, IcMode::Training).unwrap();
    let rec = EmpiricalRecording::from_series(&series.get("signal").unwrap().data, cfg.trs_per_window)
        .unwrap();
    let model = DelayedLinear::ring(cfg).unwrap();
    ModelFitting::new(model, TrainingSet::single(rec), 1, TimeSeriesCost).unwrap()
}

/// One training epoch (forward, backward and update per window).
fn bench_train_epoch(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_epoch");
    let cfg = TrainConfig::default()
        .with_early_stop(usize::MAX, 0.0)
        .with_transient(0);

    for nodes in [4usize, 8, 16, 32].iter() {
        group.throughput(Throughput::Elements(WINDOWS as u64));
        group.bench_with_input(BenchmarkId::new("nodes", nodes), nodes, |b, &nodes| {
            let mut fit = make_session(nodes);
            b.iter(|| black_box(fit.train(&cfg, None).unwrap()));
        });
    }

    group.finish();
}

/// Forward-only evaluation with a burn-in prefix.
fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");

    for nodes in [4usize, 16, 64].iter() {
        group.bench_with_input(BenchmarkId::new("nodes", nodes), nodes, |b, &nodes| {
            let mut fit = make_session(nodes);
            b.iter(|| black_box(fit.evaluate(2, None).unwrap().cos_sim));
        });
    }

    group.finish();
}

/// Tape backward pass in isolation.
fn bench_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("backward");

    for nodes in [8usize, 32].iter() {
        group.bench_with_input(BenchmarkId::new("nodes", nodes), nodes, |b, &nodes| {
            let mut model = DelayedLinear::ring(make_config(nodes)).unwrap();
            let snap = StateSnapshot::initial(&mut model, IcMode::Training);
            b.iter(|| {
                let mut tape = Tape::new();
                let bindings = model.params().bind(&mut tape);
                let input = WindowInput {
                    external: tape.input(Tensor::zeros(&model.dims().input_shape())),
                    state: tape.input(snap.state.clone()),
                    delay_history: tape.input(snap.delay_history.clone()),
                };
                let out = model.forward(&mut tape, &bindings, input).unwrap();
                let sig = out.var("signal").unwrap();
                let loss = tape.sum(sig);
                tape.backward(loss);
                black_box(bindings.grads(&tape))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_train_epoch, bench_evaluate, bench_backward);
criterion_main!(benches);
