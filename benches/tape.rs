use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tapegrad::{arithmetic, elemental1, elementals, gradient, pop, ret, setup, Op};

// Recording dominates for short programs, the backward walk for long ones;
// the two benches below keep both visible separately.

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(12345u64);

    let mut group = c.benchmark_group("tape: multiply chain");
    for size in [64usize, 256, 1024, 4096] {
        // Close to 1 so long chains neither vanish nor overflow.
        let x0: f64 = rng.gen_range(0.999..1.001);

        group.bench_with_input(BenchmarkId::new("forward", size), &size, |b, &n| {
            b.iter(|| {
                let x = setup(&[black_box(x0)]);
                let mut acc = x[0];
                for _ in 0..n {
                    acc = arithmetic(Op::Mul, &[acc, x[0]]);
                }
                ret(acc);
                pop();
            });
        });
        group.bench_with_input(
            BenchmarkId::new("forward + gradient", size),
            &size,
            |b, &n| {
                b.iter(|| {
                    let x = setup(&[black_box(x0)]);
                    let mut acc = x[0];
                    for _ in 0..n {
                        acc = arithmetic(Op::Mul, &[acc, x[0]]);
                    }
                    ret(acc);
                    black_box(gradient());
                });
            },
        );
    }
    group.finish();

    let mut group = c.benchmark_group("tape: elemental chain");
    for size in [64usize, 1024] {
        let x0: f64 = rng.gen_range(0.25..0.75);
        group.bench_with_input(
            BenchmarkId::new("forward + gradient", size),
            &size,
            |b, &n| {
                b.iter(|| {
                    let x = setup(&[black_box(x0)]);
                    let mut acc = x[0];
                    for _ in 0..n {
                        acc = elemental1(elementals::sin, acc);
                    }
                    ret(acc);
                    black_box(gradient());
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
