use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::point::Point;

/// Largest tolerated entry of `A·A⁻¹ − I` after inversion.
pub const INVERSE_TOLERANCE: f64 = 1e-4;

/// Half-open distance interval `[lb, ub)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagBounds {
    pub lb: f32,
    pub ub: f32,
}

impl LagBounds {
    pub fn new(lb: f32, ub: f32) -> Self {
        Self { lb, ub }
    }

    /// Every strictly positive separation. Used when no regular lag has pairs.
    pub fn all_separated() -> Self {
        Self::new(f32::MIN_POSITIVE, f32::INFINITY)
    }

    #[inline(always)]
    pub fn contains(&self, h: f32) -> bool {
        self.lb <= h && h < self.ub
    }
}

/// `lags_count` equal-width lags tiling `[0, cutoff)`.
pub fn lag_bounds(cutoff: f32, lags_count: usize) -> Vec<LagBounds> {
    (1..=lags_count)
        .map(|lag| {
            LagBounds::new(
                (lag - 1) as f32 * cutoff / lags_count as f32,
                lag as f32 * cutoff / lags_count as f32,
            )
        })
        .collect()
}

/// Average separation and half the mean squared value difference of one lag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SemivariogramSample {
    pub distance: f64,
    pub semivariance: f64,
}

impl SemivariogramSample {
    /// `None` when no pair qualified.
    pub fn from_sums(distance_sum: f64, squared_difference_sum: f64, pairs: usize) -> Option<Self> {
        if pairs == 0 {
            return None;
        }
        Some(Self {
            distance: distance_sum / pairs as f64,
            semivariance: 0.5 * squared_difference_sum / pairs as f64,
        })
    }
}

/// Ordinary least-squares line `y = a + b·x`. `None` without spread in `x`.
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    if x.is_empty() || x.len() != y.len() {
        return None;
    }
    let mean_x = x.iter().sum::<f64>() / x.len() as f64;
    let mean_y = y.iter().sum::<f64>() / y.len() as f64;

    let (sxy, sxx) = x
        .iter()
        .zip(y)
        .fold((0.0, 0.0), |(sxy, sxx), (x, y)| {
            (sxy + (x - mean_x) * (y - mean_y), sxx + (x - mean_x).powi(2))
        });

    if sxx == 0.0 {
        return None;
    }
    let b = sxy / sxx;
    Some((mean_y - b * mean_x, b))
}

/// Spherical model rising from `nugget` at the origin to `sill` at `range`.
#[inline(always)]
pub fn spherical(h: f64, nugget: f64, range: f64, sill: f64) -> f64 {
    if h >= range {
        return sill;
    }
    let r = h / range;
    (sill - nugget) * (1.5 * r - 0.5 * r.powi(3)) + nugget
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariogramModel {
    pub nugget: f64,
    pub range: f64,
    pub sill: f64,
}

impl VariogramModel {
    pub fn new(nugget: f64, range: f64, sill: f64) -> Self {
        Self {
            nugget,
            range,
            sill,
        }
    }

    /// Fits a straight line through the samples: the intercept is the nugget,
    /// the largest sample distance the range, and the line's value there the sill.
    /// A single sample fixes the line through the origin.
    pub fn fit(samples: &[SemivariogramSample]) -> Result<Self> {
        let (x, y): (Vec<f64>, Vec<f64>) = samples
            .iter()
            .map(|s| (s.distance, s.semivariance))
            .unzip();

        let model = match samples {
            [] => {
                return Err(Error::NumericalInstability(
                    "no semivariogram samples to fit".to_string(),
                ))
            }
            [only] => {
                warn!(
                    distance = only.distance,
                    semivariance = only.semivariance,
                    "single semivariogram sample, fitting through the origin"
                );
                Self::new(0.0, only.distance, only.semivariance)
            }
            _ => {
                let (a, b) = linear_fit(&x, &y).ok_or_else(|| {
                    Error::NumericalInstability(
                        "semivariogram samples share one distance".to_string(),
                    )
                })?;
                let range = x.iter().cloned().fold(f64::MIN, f64::max);
                Self::new(a, range, a + b * range)
            }
        };

        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if !(self.nugget.is_finite() && self.range.is_finite() && self.sill.is_finite()) {
            return Err(Error::NumericalInstability(format!(
                "non-finite variogram model {:?}",
                self
            )));
        }
        if self.range <= 0.0 {
            return Err(Error::NumericalInstability(format!(
                "variogram range must be positive, got {}",
                self.range
            )));
        }
        Ok(())
    }

    #[inline(always)]
    pub fn variogram(&self, h: f64) -> f64 {
        spherical(h, self.nugget, self.range, self.sill)
    }
}

/// Dense inverse, rejected when singular or when `A·A⁻¹` strays from identity.
pub fn invert(matrix: DMatrix<f64>) -> Result<DMatrix<f64>> {
    let size = matrix.nrows();
    let inverse = matrix.clone().try_inverse().ok_or_else(|| {
        Error::NumericalInstability("covariance matrix is singular".to_string())
    })?;

    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(Error::NumericalInstability(
            "covariance matrix inverse is not finite".to_string(),
        ));
    }

    let residual = (&matrix * &inverse - DMatrix::<f64>::identity(size, size)).amax();
    if !(residual <= INVERSE_TOLERANCE) {
        return Err(Error::NumericalInstability(format!(
            "covariance matrix is ill-conditioned (inverse residual {:e})",
            residual
        )));
    }

    Ok(inverse)
}

/// Square prediction grid spanning the xy extent of the samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub min: Point,
    pub max: Point,
    pub size: usize,
    step_x: f32,
    step_y: f32,
}

impl Grid {
    pub fn new(min: Point, max: Point, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Usage("grid size must be at least 1".to_string()));
        }
        let intervals = (size - 1).max(1) as f32;
        let (step_x, step_y) = if size == 1 {
            (0.0, 0.0)
        } else {
            ((max.x - min.x) / intervals, (max.y - min.y) / intervals)
        };
        Ok(Self {
            min,
            max,
            size,
            step_x,
            step_y,
        })
    }

    #[inline(always)]
    pub fn coordinate(&self, i: usize, j: usize) -> (f32, f32) {
        (
            self.min.x + i as f32 * self.step_x,
            self.min.y + j as f32 * self.step_y,
        )
    }

    /// Storage index of node `(i, j)`.
    #[inline(always)]
    pub fn index(&self, i: usize, j: usize) -> usize {
        i + j * self.size
    }

    pub fn len(&self) -> usize {
        self.size * self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Everything a prediction needs from a fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedModel {
    pub min_point: Point,
    pub max_point: Point,
    pub model: VariogramModel,
    pub inverse_covariance: DMatrix<f64>,
    pub point_count: usize,
}

impl FittedModel {
    pub(crate) fn check_points(&self, points: &[Point]) -> Result<()> {
        if points.len() != self.point_count {
            return Err(Error::Usage(format!(
                "model was fitted on {} points, predict was given {}",
                self.point_count,
                points.len()
            )));
        }
        Ok(())
    }

    /// `[z₀ … zₙ₋₁, 1]`
    pub(crate) fn augmented_values(points: &[Point]) -> Vec<f64> {
        points
            .iter()
            .map(|p| p.z as f64)
            .chain(std::iter::once(1.0))
            .collect()
    }
}

pub(crate) fn check_fit_input(points: &[Point], lags_count: usize) -> Result<()> {
    if points.is_empty() {
        return Err(Error::Usage("cannot fit an empty point set".to_string()));
    }
    if lags_count == 0 {
        return Err(Error::Usage("lags count must be at least 1".to_string()));
    }
    Ok(())
}

/// Cutoff of the semivariogram lags: a third of the bounding box diagonal.
pub fn cutoff(min: &Point, max: &Point) -> f32 {
    max.planar_distance(min) / 3.0
}
