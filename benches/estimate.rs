//! End-to-end RCR estimation benchmark: sample selection, moments, the segment
//! search, gradients and the delta method.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rcrs::{Dataset, EstimationOptions, Formulation, RcrProblem};
use std::hint::black_box;

fn make_problem(n: usize, controls: usize) -> RcrProblem {
    let mut rng = SmallRng::seed_from_u64(2016);
    let mut xs = vec![Vec::with_capacity(n); controls];
    let mut y = Vec::with_capacity(n);
    let mut z = Vec::with_capacity(n);
    for _ in 0..n {
        let mut index = 0.0;
        for column in xs.iter_mut() {
            let x: f64 = rng.sample(StandardNormal);
            index += 0.4 * x;
            column.push(x);
        }
        let u: f64 = rng.sample(StandardNormal);
        let e: f64 = rng.sample(StandardNormal);
        let treatment = index + u;
        z.push(treatment);
        y.push(1.0 + treatment + 2.0 * index + e);
    }

    let mut builder = Dataset::builder().column("y", y).column("z", z);
    let mut varlist = String::from("y z");
    for (j, column) in xs.into_iter().enumerate() {
        let name = format!("x{j}");
        varlist.push(' ');
        varlist.push_str(&name);
        builder = builder.column(name, column);
    }
    let data = builder.build().expect("simulated dataset");
    let formulation = Formulation::parse(&varlist).expect("simulated varlist");
    RcrProblem::new(data, formulation).expect("simulated problem")
}

fn bench_estimate(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate");
    group.sample_size(10);
    let options = EstimationOptions::default();
    for (n, controls) in [(1_000, 2), (10_000, 2), (10_000, 8)] {
        let problem = make_problem(n, controls);
        group.bench_with_input(
            BenchmarkId::new(format!("{controls}_controls"), n),
            &problem,
            |b, problem| b.iter(|| problem.estimate(black_box(&options)).expect("estimate")),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_estimate);
criterion_main!(benches);
