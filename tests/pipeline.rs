use approx::assert_abs_diff_eq;
use rand::prelude::*;

use krigrid::compute::{Context, DeviceInfo, Platform};
use krigrid::io::{read_xyz, write_xyz};
use krigrid::kriging::{KrigingOperation, SerialKriging};
use krigrid::point::Point;
use krigrid::Error;

fn host_contexts() -> Vec<Context> {
    let mixed = Platform::new(
        "Mixed",
        vec![
            DeviceInfo::cpu("cpu", 2),
            DeviceInfo::gpu("gpu-0", 3),
            DeviceInfo::gpu("gpu-1", 5),
        ],
    );
    (0..Context::platform_count())
        .map(|index| Context::new(index, None).unwrap())
        .chain(std::iter::once(Context::with_platform(mixed, None).unwrap()))
        .collect()
}

/// Jittered 7×7 lattice over [0, 60]² sampling a smooth surface.
fn surface_cloud(seed: u64) -> Vec<Point> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::new();
    for i in 0..7 {
        for j in 0..7 {
            let x = i as f32 * 10.0 + rng.gen_range(-3.0..3.0);
            let y = j as f32 * 10.0 + rng.gen_range(-3.0..3.0);
            let z = (x / 20.0).sin() * 4.0 + (y / 25.0).cos() * 3.0 + rng.gen_range(-0.1..0.1);
            points.push(Point::new(x, y, z));
        }
    }
    points
}

#[test]
fn unit_square_corners() {
    let points = vec![
        Point::new(0.0, 0.0, 0.0),
        Point::new(1.0, 0.0, 1.0),
        Point::new(0.0, 1.0, 1.0),
        Point::new(1.0, 1.0, 2.0),
    ];

    for ctx in host_contexts() {
        let mut kriging = KrigingOperation::new(&ctx).unwrap();
        let fitted = kriging.fit(&points, 2).unwrap();
        assert_eq!(fitted.min_point, Point::new(0.0, 0.0, 0.0));
        assert_eq!(fitted.max_point, Point::new(1.0, 1.0, 2.0));
        assert_eq!(fitted.point_count, 4);

        let grid = kriging.predict(&points, 2).unwrap();
        assert_eq!(grid.len(), 4);
        for (node, point) in grid.iter().zip(&points) {
            assert_eq!((node.x, node.y), (point.x, point.y));
            assert_abs_diff_eq!(node.z, point.z, epsilon = 1e-4);
        }
    }
}

#[test]
fn repeated_point_is_numerically_unstable() {
    let points = vec![Point::new(5.0, -2.0, 3.0); 6];
    for ctx in host_contexts() {
        let mut kriging = KrigingOperation::new(&ctx).unwrap();
        assert!(matches!(
            kriging.fit(&points, 3),
            Err(Error::NumericalInstability(_))
        ));
        assert!(matches!(kriging.predict(&points, 4), Err(Error::Usage(_))));
    }
}

#[test]
fn failed_refit_leaves_no_model_behind() {
    let good = surface_cloud(5);
    let bad = vec![Point::new(5.0, 5.0, 100.0); good.len()];

    for ctx in host_contexts() {
        let mut kriging = KrigingOperation::new(&ctx).unwrap();
        kriging.fit(&good, 6).unwrap();
        assert!(kriging.predict(&good, 3).is_ok());

        assert!(matches!(
            kriging.fit(&bad, 6),
            Err(Error::NumericalInstability(_))
        ));
        assert!(kriging.fitted().is_none());
        assert!(matches!(kriging.predict(&bad, 2), Err(Error::Usage(_))));
        assert!(matches!(kriging.predict(&good, 2), Err(Error::Usage(_))));
    }

    let mut serial = SerialKriging::new();
    serial.fit(&good, 6).unwrap();
    assert!(serial.fit(&bad, 6).is_err());
    assert!(matches!(serial.predict(&bad, 2), Err(Error::Usage(_))));
}

#[test]
fn devices_agree_with_serial_reference() {
    let points = surface_cloud(7);
    let grid_size = 9;

    let mut serial = SerialKriging::new();
    let reference_model = serial.fit(&points, 6).unwrap().model;
    let reference = serial.predict(&points, grid_size).unwrap();

    for ctx in host_contexts() {
        let mut kriging = KrigingOperation::new(&ctx).unwrap();
        let model = kriging.fit(&points, 6).unwrap().model;
        assert_abs_diff_eq!(model.nugget, reference_model.nugget, epsilon = 1e-6);
        assert_abs_diff_eq!(model.range, reference_model.range, epsilon = 1e-6);
        assert_abs_diff_eq!(model.sill, reference_model.sill, epsilon = 1e-6);

        let grid = kriging.predict(&points, grid_size).unwrap();
        assert_eq!(grid.len(), reference.len());
        for (node, expected) in grid.iter().zip(&reference) {
            assert_eq!((node.x, node.y), (expected.x, expected.y));
            assert_abs_diff_eq!(node.z, expected.z, epsilon = 1e-3);
        }
    }
}

#[test]
fn samples_on_grid_nodes_are_reproduced() {
    let height = |x: f32, y: f32| 2.0 * x - y + 0.25 * x * y;
    let mut points = Vec::new();
    for j in 0..3 {
        for i in 0..3 {
            let (x, y) = (i as f32 * 2.0, j as f32 * 2.0);
            points.push(Point::new(x, y, height(x, y)));
        }
    }
    for (x, y) in [(1.0, 1.0), (3.0, 1.0), (1.0, 3.0), (3.0, 3.0), (2.5, 1.5)] {
        points.push(Point::new(x, y, height(x, y)));
    }

    for ctx in host_contexts() {
        let mut kriging = KrigingOperation::new(&ctx).unwrap();
        kriging.fit(&points, 4).unwrap();
        let grid = kriging.predict(&points, 3).unwrap();

        for (index, node) in grid.iter().enumerate() {
            let sample = points[index];
            assert_eq!((node.x, node.y), (sample.x, sample.y));
            assert_abs_diff_eq!(node.z, sample.z, epsilon = 1e-3);
        }
    }
}

#[test]
fn predict_is_repeatable_on_one_fit() {
    let points = surface_cloud(11);
    let ctx = Context::new(1, None).unwrap();
    let mut kriging = KrigingOperation::new(&ctx).unwrap();
    kriging.fit(&points, 8).unwrap();

    let first = kriging.predict(&points, 5).unwrap();
    let second = kriging.predict(&points, 5).unwrap();
    assert_eq!(first, second);

    let single = kriging.predict(&points, 1).unwrap();
    assert_eq!(single.len(), 1);
    let min = kriging.fitted().unwrap().min_point;
    assert_eq!((single[0].x, single[0].y), (min.x, min.y));

    assert!(matches!(kriging.predict(&points, 0), Err(Error::Usage(_))));
    assert!(matches!(
        kriging.predict(&points[1..], 5),
        Err(Error::Usage(_))
    ));
}

#[test]
fn queues_rotate_over_devices() {
    let ctx = Context::new(1, None).unwrap();
    assert_eq!(ctx.device_count(), 2);
    let rotation = (0..5).map(|_| ctx.next_queue()).collect::<Vec<_>>();
    assert_ne!(rotation[0], rotation[1]);
    assert_eq!(rotation[0], rotation[2]);
    assert_eq!(rotation[1], rotation[3]);
    assert_eq!(rotation[0], rotation[4]);

    let limited = Context::new(1, Some(1)).unwrap();
    assert_eq!(limited.device_count(), 1);
    assert!(matches!(
        Context::new(Context::platform_count(), None),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn file_to_grid() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("cloud.xyz");
    let output = dir.path().join("grid.xyz");
    write_xyz(&input, &surface_cloud(3)).unwrap();

    let points = read_xyz(&input).unwrap();
    assert_eq!(points.len(), 49);

    let ctx = Context::new(0, None).unwrap();
    ctx.set_profiling(true);
    let mut kriging = KrigingOperation::new(&ctx).unwrap();
    kriging.fit(&points, 10).unwrap();
    let grid = kriging.predict(&points, 6).unwrap();
    write_xyz(&output, &grid).unwrap();

    assert_eq!(read_xyz(&output).unwrap(), grid);
    let profile = ctx.profile().unwrap();
    for tag in [
        "distances_matrix",
        "semivariogram",
        "covariance_matrix",
        "inverse_matrix",
        "prediction",
    ] {
        assert!(profile.contains_key(tag), "missing {}", tag);
    }
}
