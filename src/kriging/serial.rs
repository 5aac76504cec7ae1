use std::time::Instant;

use itertools::iproduct;
use nalgebra::{DMatrix, DVector};
use tracing::{info, warn};

use super::common::{
    check_fit_input, cutoff, invert, lag_bounds, FittedModel, Grid, LagBounds,
    SemivariogramSample, VariogramModel,
};
use crate::error::{Error, Result};
use crate::point::{planar_distance, Point};

/// Single-threaded host Kriging, used to check the device pipeline.
#[derive(Debug, Default)]
pub struct SerialKriging {
    fitted: Option<FittedModel>,
}

impl SerialKriging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fitted(&self) -> Option<&FittedModel> {
        self.fitted.as_ref()
    }

    pub fn fit(&mut self, points: &[Point], lags_count: usize) -> Result<&FittedModel> {
        // unfitted until this fit succeeds
        self.fitted = None;
        check_fit_input(points, lags_count)?;
        let n = points.len();
        let timer = Instant::now();

        let (min_point, max_point) = points.iter().fold(
            (points[0], points[0]),
            |(min, max), p| {
                (
                    Point::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z)),
                    Point::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z)),
                )
            },
        );

        let distances = DMatrix::from_fn(n, n, |i, j| points[i].planar_distance(&points[j]));

        let mut samples = lag_bounds(cutoff(&min_point, &max_point), lags_count)
            .iter()
            .filter_map(|lag| lag_sample(points, &distances, lag))
            .collect::<Vec<_>>();
        if samples.is_empty() {
            warn!("no lag below the cutoff holds a point pair, using all separated pairs");
            samples.push(
                lag_sample(points, &distances, &LagBounds::all_separated()).ok_or_else(|| {
                    Error::NumericalInstability(
                        "all points share one location, the semivariogram is undefined"
                            .to_string(),
                    )
                })?,
            );
        }
        let model = VariogramModel::fit(&samples)?;

        let size = n + 1;
        let covariance = DMatrix::from_fn(size, size, |i, j| match (i < n, j < n) {
            (true, true) => model.variogram(distances[(i, j)] as f64),
            (false, false) => 0.0,
            _ => 1.0,
        });
        let inverse_covariance = invert(covariance)?;

        info!(
            nugget = model.nugget,
            range = model.range,
            sill = model.sill,
            elapsed = ?timer.elapsed(),
            "serial fit"
        );

        Ok(&*self.fitted.insert(FittedModel {
            min_point,
            max_point,
            model,
            inverse_covariance,
            point_count: n,
        }))
    }

    pub fn predict(&self, points: &[Point], grid_size: usize) -> Result<Vec<Point>> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| Error::Usage("predict called before fit".to_string()))?;
        fitted.check_points(points)?;
        let grid = Grid::new(fitted.min_point, fitted.max_point, grid_size)?;

        let values = DVector::from_vec(FittedModel::augmented_values(points));
        let mut result = vec![Point::default(); grid.len()];

        for (i, j) in iproduct!(0..grid_size, 0..grid_size) {
            let (x, y) = grid.coordinate(i, j);
            let r = DVector::from_iterator(
                points.len() + 1,
                points
                    .iter()
                    .map(|p| fitted.model.variogram(planar_distance(p.x, p.y, x, y) as f64))
                    .chain(std::iter::once(1.0)),
            );
            let weights = &fitted.inverse_covariance * r;
            result[grid.index(i, j)] = Point::new(x, y, weights.dot(&values) as f32);
        }

        Ok(result)
    }
}

/// Averages over ordered pairs `i != j` whose separation falls in `lag`.
fn lag_sample(
    points: &[Point],
    distances: &DMatrix<f32>,
    lag: &LagBounds,
) -> Option<SemivariogramSample> {
    let n = points.len();
    let (distance_sum, squared_sum, pairs) = iproduct!(0..n, 0..n)
        .filter(|&(i, j)| i != j && lag.contains(distances[(i, j)]))
        .fold((0.0, 0.0, 0usize), |(d, s, c), (i, j)| {
            let dz = points[i].z as f64 - points[j].z as f64;
            (d + distances[(i, j)] as f64, s + dz * dz, c + 1)
        });
    SemivariogramSample::from_sums(distance_sum, squared_sum, pairs)
}
