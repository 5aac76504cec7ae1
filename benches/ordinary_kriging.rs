use criterion::{black_box, criterion_group, criterion_main, Criterion};
use krigrid::{
    compute::Context,
    kriging::{KrigingOperation, SerialKriging},
    point::Point,
};

fn create_point_set(domain: [[f32; 3]; 2], n_points: usize) -> Vec<Point> {
    let mut points = vec![];
    for _ in 0..n_points {
        let x = rand::random::<f32>() * (domain[1][0] - domain[0][0]) + domain[0][0];
        let y = rand::random::<f32>() * (domain[1][1] - domain[0][1]) + domain[0][1];
        let z = domain[0][2]
            + (domain[1][2] - domain[0][2]) * 0.25 * ((x / 15.0).sin() + (y / 20.0).cos() + 2.0);
        points.push(Point::new(x, y, z));
    }
    points
}

fn criterion_benchmark(c: &mut Criterion) {
    let domain = [[0.0, 0.0, 0.0], [100.0, 100.0, 10.0]];
    let n_points = 400;
    let lags_count = 10;
    let grid_size = 30;
    let points = create_point_set(domain, n_points);

    for platform in 0..Context::platform_count() {
        let ctx = Context::new(platform, None).unwrap();
        let mut kriging = KrigingOperation::new(&ctx).unwrap();
        let name = ctx.platform().name.to_lowercase().replace(' ', "_");

        c.bench_function(&format!("fit {}", name), |b| {
            b.iter(|| {
                kriging
                    .fit(black_box(&points), black_box(lags_count))
                    .map(|fitted| fitted.point_count)
                    .unwrap()
            })
        });
        c.bench_function(&format!("predict {}", name), |b| {
            b.iter(|| {
                kriging
                    .predict(black_box(&points), black_box(grid_size))
                    .unwrap()
            })
        });
    }

    let mut serial = SerialKriging::new();
    c.bench_function("fit serial", |b| {
        b.iter(|| {
            serial
                .fit(black_box(&points), black_box(lags_count))
                .map(|fitted| fitted.point_count)
                .unwrap()
        })
    });
    c.bench_function("predict serial", |b| {
        b.iter(|| serial.predict(black_box(&points), black_box(grid_size)).unwrap())
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = criterion_benchmark
}
criterion_main!(benches);
