use criterion::{black_box, criterion_group, criterion_main, Criterion};
use geocluster::{Geocluster, GeoclusterBuilder, MutableGeocluster};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn world_points(count: usize) -> Vec<(f64, f64)> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    (0..count)
        .map(|_| (rng.gen_range(-179.0..179.0), rng.gen_range(-80.0..80.0)))
        .collect()
}

fn bench_geocluster(c: &mut Criterion) {
    let points = world_points(10_000);

    c.bench_function("immutable load", |b| {
        b.iter(|| {
            let options = GeoclusterBuilder::new().build();
            let mut engine: Geocluster<(f64, f64)> = Geocluster::new(options).unwrap();
            engine.load(black_box(points.clone())).unwrap();
        })
    });

    let options = GeoclusterBuilder::new().build();
    let mut engine: Geocluster<(f64, f64)> = Geocluster::new(options).unwrap();
    engine.load(points.clone()).unwrap();

    c.bench_function("immutable search", |b| {
        b.iter(|| {
            let _ = engine.search(black_box([-30.0, 30.0, 40.0, 70.0]), black_box(4));
        })
    });

    c.bench_function("mutable load", |b| {
        b.iter(|| {
            let options = GeoclusterBuilder::new().build();
            let mut engine: MutableGeocluster<(f64, f64)> =
                MutableGeocluster::new(options).unwrap();
            engine.load(black_box(points.clone())).unwrap();
        })
    });

    let options = GeoclusterBuilder::new().build();
    let mut mutable: MutableGeocluster<(f64, f64)> = MutableGeocluster::new(options).unwrap();
    mutable.load(points).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(7);

    c.bench_function("mutable add", |b| {
        b.iter(|| {
            let point = (rng.gen_range(-179.0..179.0), rng.gen_range(-80.0..80.0));
            mutable.add(black_box(point)).unwrap();
        })
    });
}

criterion_group!(benches, bench_geocluster);
criterion_main!(benches);
