use std::mem::size_of;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::common::{
    check_fit_input, cutoff, invert, lag_bounds, FittedModel, Grid, LagBounds,
    SemivariogramSample, VariogramModel,
};
use crate::compute::{Buffer, Context, Event, MemAccess, NdRange, Program, Queue};
use crate::error::{Error, Result};
use crate::kernels;
use crate::operations::{
    count_arg, DistancesMatrixOperation, FillBufferOperation, LinearAlgebraOperation,
    ReductionOp, ReductionOperation,
};
use crate::point::Point;

/// Ordinary Kriging on the devices of a [`Context`].
///
/// `fit` estimates the semivariogram, fits the spherical model and inverts
/// the covariance matrix; `predict` evaluates any number of square grids
/// against that fit. Lags and grid rows are spread over one worker per device.
pub struct KrigingOperation<'a> {
    ctx: &'a Context,
    program: Program,
    reduction: ReductionOperation<'a>,
    distances: DistancesMatrixOperation<'a>,
    fill: FillBufferOperation<'a>,
    linalg: LinearAlgebraOperation<'a>,
    fitted: Option<FittedModel>,
    progress: bool,
}

/// Per-worker replicas of the shared fit inputs plus the semivariogram scratch.
struct SemivariogramWorker {
    queue: Queue,
    points: Buffer,
    distances: Buffer,
    distances_out: Buffer,
    semivar_out: Buffer,
    valid_count: Buffer,
}

/// Per-worker prediction buffers, written once and reused for every row.
struct PredictionWorker {
    queue: Queue,
    points: Buffer,
    inverse: Buffer,
    values: Buffer,
    r: Buffer,
    weights: Buffer,
    cache: Buffer,
}

impl<'a> KrigingOperation<'a> {
    pub fn new(ctx: &'a Context) -> Result<Self> {
        Ok(Self {
            ctx,
            program: ctx.create_program(kernels::KRIGING)?,
            reduction: ReductionOperation::new(ctx)?,
            distances: DistancesMatrixOperation::new(ctx)?,
            fill: FillBufferOperation::new(ctx)?,
            linalg: LinearAlgebraOperation::new(ctx)?,
            fitted: None,
            progress: false,
        })
    }

    /// Show a progress bar over prediction rows.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn fitted(&self) -> Option<&FittedModel> {
        self.fitted.as_ref()
    }

    pub fn fit(&mut self, points: &[Point], lags_count: usize) -> Result<&FittedModel> {
        // unfitted until this fit succeeds
        self.fitted = None;
        check_fit_input(points, lags_count)?;
        let n = points.len();
        count_arg(n * n)?;

        let queue = self.ctx.next_queue();
        info!(points = n, lags_count, device = queue.device().name(), "fitting");

        let points_buffer = self
            .ctx
            .create_buffer(MemAccess::ReadOnly, n * size_of::<Point>());
        queue.enqueue_write_buffer(&points_buffer, true, points, &[])?;

        let min_point = self
            .reduction
            .reduce_points(&points_buffer, n, ReductionOp::Min)?;
        let max_point = self
            .reduction
            .reduce_points(&points_buffer, n, ReductionOp::Max)?;
        info!(%min_point, %max_point, "bounding box");

        let lags = lag_bounds(cutoff(&min_point, &max_point), lags_count);

        let distances = self
            .ctx
            .create_buffer(MemAccess::ReadWrite, n * n * size_of::<f32>());
        let event = self
            .distances
            .compute_matrix_on(&queue, &points_buffer, n, &distances, &[])?;
        event.wait()?;
        self.ctx.record_event(&["distances_matrix"], &event)?;

        let model = self.fit_model(&queue, &points_buffer, &distances, n, &lags)?;
        info!(
            nugget = model.nugget,
            range = model.range,
            sill = model.sill,
            "variogram model"
        );

        let covariance = self.covariance_matrix(&queue, &distances, n, &model)?;

        let timer = Instant::now();
        let inverse_covariance = invert(covariance)?;
        self.ctx.record_time(&["inverse_matrix"], timer.elapsed())?;

        Ok(&*self.fitted.insert(FittedModel {
            min_point,
            max_point,
            model,
            inverse_covariance,
            point_count: n,
        }))
    }

    fn fit_model(
        &self,
        queue: &Queue,
        points: &Buffer,
        distances: &Buffer,
        n: usize,
        lags: &[LagBounds],
    ) -> Result<VariogramModel> {
        let timer = Instant::now();
        let workers = self.ctx.device_count().min(lags.len()).max(1);
        let chunk = lags.len().div_ceil(workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("semivariogram-{}", i))
            .build()?;

        let per_lag = pool.install(|| {
            lags.par_chunks(chunk)
                .map(|lags| {
                    let worker = self.semivariogram_worker(queue, points, distances, n)?;
                    lags.iter()
                        .map(|lag| self.lag_sample(&worker, n, lag))
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()
        })?;
        self.ctx.record_time(&["semivariogram"], timer.elapsed())?;

        for (lag, sample) in lags.iter().zip(per_lag.iter().flatten()) {
            debug!(lb = lag.lb, ub = lag.ub, ?sample, "lag");
        }

        let mut samples = per_lag.into_iter().flatten().flatten().collect_vec();
        if samples.is_empty() {
            warn!("no lag below the cutoff holds a point pair, using all separated pairs");
            let worker = self.semivariogram_worker(queue, points, distances, n)?;
            let sample = self
                .lag_sample(&worker, n, &LagBounds::all_separated())?
                .ok_or_else(|| {
                    Error::NumericalInstability(
                        "all points share one location, the semivariogram is undefined"
                            .to_string(),
                    )
                })?;
            samples.push(sample);
        }

        VariogramModel::fit(&samples)
    }

    /// Takes the next queue and, when it is not the writer's, private copies
    /// of the points and the distance matrix.
    fn semivariogram_worker(
        &self,
        writer: &Queue,
        points: &Buffer,
        distances: &Buffer,
        n: usize,
    ) -> Result<SemivariogramWorker> {
        let queue = self.ctx.next_queue();

        let (points, distances) = if &queue == writer {
            (points.clone(), distances.clone())
        } else {
            let local_points = self.ctx.create_buffer(MemAccess::ReadOnly, points.size());
            let local_distances = self
                .ctx
                .create_buffer(MemAccess::ReadOnly, distances.size());
            queue.enqueue_copy_buffer(points, &local_points, &[])?;
            queue.enqueue_copy_buffer(distances, &local_distances, &[])?;
            (local_points, local_distances)
        };

        let scratch = n * n * size_of::<f64>();
        Ok(SemivariogramWorker {
            distances_out: self.ctx.create_buffer(MemAccess::ReadWrite, scratch),
            semivar_out: self.ctx.create_buffer(MemAccess::ReadWrite, scratch),
            valid_count: self
                .ctx
                .create_buffer(MemAccess::WriteOnly, size_of::<i32>()),
            queue,
            points,
            distances,
        })
    }

    fn lag_sample(
        &self,
        worker: &SemivariogramWorker,
        n: usize,
        lag: &LagBounds,
    ) -> Result<Option<SemivariogramSample>> {
        let queue = &worker.queue;
        let fills = [
            self.fill
                .fill_on(queue, &worker.distances_out, 0.0f64, n * n, &[])?,
            self.fill
                .fill_on(queue, &worker.semivar_out, 0.0f64, n * n, &[])?,
            self.fill.fill_on(queue, &worker.valid_count, 0i32, 1, &[])?,
        ];

        let kernel = self.program.kernel("SemivariogramKernel")?;
        let event = queue.enqueue_kernel(
            &kernel,
            vec![
                (&worker.points).into(),
                (&worker.distances).into(),
                count_arg(n)?,
                lag.lb.into(),
                lag.ub.into(),
                (&worker.distances_out).into(),
                (&worker.semivar_out).into(),
                (&worker.valid_count).into(),
            ],
            NdRange::linear(n),
            &fills,
        )?;

        let valid = queue.enqueue_read_buffer::<i32>(&worker.valid_count, &[event])?;
        let pairs = valid.first().copied().unwrap_or(0).max(0) as usize;
        if pairs == 0 {
            return Ok(None);
        }

        let distance_sum =
            self.reduction
                .reduce_double_on(queue, &worker.distances_out, n * n, ReductionOp::Sum)?;
        let semivar_sum =
            self.reduction
                .reduce_double_on(queue, &worker.semivar_out, n * n, ReductionOp::Sum)?;

        Ok(SemivariogramSample::from_sums(
            distance_sum,
            semivar_sum,
            pairs,
        ))
    }

    /// `(n + 1)²` matrix of model values bordered by ones, with a zero corner.
    fn covariance_matrix(
        &self,
        queue: &Queue,
        distances: &Buffer,
        n: usize,
        model: &VariogramModel,
    ) -> Result<DMatrix<f64>> {
        let size = n + 1;
        let covariance = self
            .ctx
            .create_buffer(MemAccess::ReadWrite, size * size * size_of::<f64>());
        let filled = self
            .fill
            .fill_on(queue, &covariance, 1.0f64, size * size, &[])?;

        let kernel = self.program.kernel("CovarianceMatrixKernel")?;
        let event = queue.enqueue_kernel(
            &kernel,
            vec![
                distances.into(),
                (&covariance).into(),
                count_arg(n)?,
                model.nugget.into(),
                model.range.into(),
                model.sill.into(),
            ],
            NdRange::linear(n),
            &[filled],
        )?;

        let mut values = queue.enqueue_read_buffer::<f64>(&covariance, &[event.clone()])?;
        self.ctx.record_event(&["covariance_matrix"], &event)?;

        values[n * size + n] = 0.0;
        Ok(DMatrix::from_row_slice(size, size, &values))
    }

    /// Evaluates the fitted model on a `grid_size × grid_size` grid. Node
    /// `(i, j)` is stored at `i + j * grid_size`.
    pub fn predict(&self, points: &[Point], grid_size: usize) -> Result<Vec<Point>> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| Error::Usage("predict called before fit".to_string()))?;
        fitted.check_points(points)?;
        let grid = Grid::new(fitted.min_point, fitted.max_point, grid_size)?;
        info!(grid_size, "predicting");

        let timer = Instant::now();
        let values = FittedModel::augmented_values(points);
        // nalgebra stores column-major; the kernels read row-major
        let inverse = fitted
            .inverse_covariance
            .transpose()
            .as_slice()
            .to_vec();

        let workers = self.ctx.device_count().min(grid_size);
        let chunk = grid_size.div_ceil(workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("prediction-{}", i))
            .build()?;

        let bar = if self.progress {
            ProgressBar::new(grid_size as u64).with_style(
                ProgressStyle::with_template("{msg} {wide_bar} {pos}/{len} rows ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            )
        } else {
            ProgressBar::hidden()
        };
        bar.set_message("kriging");

        let rows = (0..grid_size).collect_vec();
        let nodes = pool.install(|| {
            rows.par_chunks(chunk)
                .map(|rows| {
                    let worker = self.prediction_worker(points, &inverse, &values)?;
                    let mut nodes = Vec::with_capacity(rows.len() * grid_size);
                    for &i in rows {
                        for j in 0..grid_size {
                            let (x, y) = grid.coordinate(i, j);
                            let z = self.predict_node(&worker, fitted, x, y)?;
                            nodes.push((grid.index(i, j), Point::new(x, y, z as f32)));
                        }
                        bar.inc(1);
                    }
                    Ok(nodes)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        bar.finish_and_clear();

        let mut result = vec![Point::default(); grid.len()];
        for (index, node) in nodes.into_iter().flatten() {
            result[index] = node;
        }

        self.ctx.record_time(&["prediction"], timer.elapsed())?;
        Ok(result)
    }

    fn prediction_worker(
        &self,
        points: &[Point],
        inverse: &[f64],
        values: &[f64],
    ) -> Result<PredictionWorker> {
        let queue = self.ctx.next_queue();
        let size = values.len();
        let vector = size * size_of::<f64>();

        let worker = PredictionWorker {
            points: self
                .ctx
                .create_buffer(MemAccess::ReadOnly, std::mem::size_of_val(points)),
            inverse: self
                .ctx
                .create_buffer(MemAccess::ReadOnly, size * vector),
            values: self.ctx.create_buffer(MemAccess::ReadOnly, vector),
            r: self.ctx.create_buffer(MemAccess::ReadWrite, vector),
            weights: self.ctx.create_buffer(MemAccess::ReadWrite, vector),
            cache: self.ctx.create_buffer(MemAccess::ReadWrite, vector),
            queue,
        };

        let queue = &worker.queue;
        let ready: Vec<Event> = vec![
            queue.enqueue_write_buffer(&worker.points, false, points, &[])?,
            queue.enqueue_write_buffer(&worker.inverse, false, inverse, &[])?,
            queue.enqueue_write_buffer(&worker.values, false, values, &[])?,
            self.fill.fill_on(queue, &worker.r, 1.0f64, size, &[])?,
        ];
        Event::wait_all(&ready)?;

        Ok(worker)
    }

    fn predict_node(
        &self,
        worker: &PredictionWorker,
        fitted: &FittedModel,
        x: f32,
        y: f32,
    ) -> Result<f64> {
        let queue = &worker.queue;
        let n = fitted.point_count;
        let model = &fitted.model;

        let kernel = self.program.kernel("PredictionCovariance")?;
        let covariance = queue.enqueue_kernel(
            &kernel,
            vec![
                (&worker.points).into(),
                (&worker.r).into(),
                x.into(),
                y.into(),
                model.nugget.into(),
                model.range.into(),
                model.sill.into(),
            ],
            NdRange::linear(n),
            &[],
        )?;

        let weights = self.linalg.mat_vec_mul(
            queue,
            &worker.inverse,
            &worker.r,
            &worker.weights,
            n + 1,
            &[covariance],
        )?;

        self.linalg.dot_product(
            queue,
            &worker.weights,
            &worker.values,
            n + 1,
            &worker.cache,
            &[weights],
        )
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::compute::test::mixed_platform;

    fn unit_square() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0, 0.0),
            Point::new(1.0, 0.0, 1.0),
            Point::new(0.0, 1.0, 1.0),
            Point::new(1.0, 1.0, 2.0),
        ]
    }

    #[test]
    fn predict_requires_a_fit() {
        let ctx = Context::with_platform(mixed_platform(), None).unwrap();
        let kriging = KrigingOperation::new(&ctx).unwrap();
        assert!(matches!(
            kriging.predict(&unit_square(), 2),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn fit_input_is_checked() {
        let ctx = Context::with_platform(mixed_platform(), None).unwrap();
        let mut kriging = KrigingOperation::new(&ctx).unwrap();
        assert!(matches!(kriging.fit(&[], 2), Err(Error::Usage(_))));
        assert!(matches!(
            kriging.fit(&unit_square(), 0),
            Err(Error::Usage(_))
        ));
        assert!(kriging.fitted().is_none());
    }

    #[test]
    fn unit_square_falls_back_to_all_pairs() {
        let ctx = Context::with_platform(mixed_platform(), None).unwrap();
        let mut kriging = KrigingOperation::new(&ctx).unwrap();
        let fitted = kriging.fit(&unit_square(), 2).unwrap().clone();

        // 8 ordered edge pairs at 1 and 4 diagonal pairs at √2
        let distance = (8.0 + 4.0 * 2f64.sqrt()) / 12.0;
        assert_eq!(fitted.model.nugget, 0.0);
        assert_abs_diff_eq!(fitted.model.range, distance, epsilon = 1e-6);
        assert_abs_diff_eq!(fitted.model.sill, 2.0 / 3.0, epsilon = 1e-9);
        assert_eq!(fitted.inverse_covariance.nrows(), 5);

        assert!(matches!(
            kriging.predict(&unit_square()[..3], 2),
            Err(Error::Usage(_))
        ));
        assert!(matches!(
            kriging.predict(&unit_square(), 0),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn covariance_matrix_layout() {
        let ctx = Context::with_platform(mixed_platform(), None).unwrap();
        let kriging = KrigingOperation::new(&ctx).unwrap();
        let points = vec![
            Point::new(0.0, 0.0, 1.0),
            Point::new(2.0, 0.0, 2.0),
            Point::new(0.0, 5.0, 3.0),
        ];
        let n = points.len();
        let model = VariogramModel::new(0.1, 3.0, 1.2);

        for queue in ctx.queues() {
            let input = ctx.create_buffer(MemAccess::ReadOnly, n * 12);
            queue.enqueue_write_buffer(&input, true, &points, &[]).unwrap();
            let distances = ctx.create_buffer(MemAccess::ReadWrite, n * n * 4);
            kriging
                .distances
                .compute_matrix_on(queue, &input, n, &distances, &[])
                .unwrap()
                .wait()
                .unwrap();

            let matrix = kriging
                .covariance_matrix(queue, &distances, n, &model)
                .unwrap();
            assert_eq!(matrix[(n, n)], 0.0);
            for i in 0..n {
                assert_eq!(matrix[(i, n)], 1.0);
                assert_eq!(matrix[(n, i)], 1.0);
                assert_eq!(matrix[(i, i)], model.nugget);
                for j in 0..n {
                    assert_eq!(matrix[(i, j)], matrix[(j, i)]);
                }
            }
            assert_abs_diff_eq!(matrix[(0, 1)], model.variogram(2.0), epsilon = 1e-12);
            assert_eq!(matrix[(0, 2)], model.sill);
        }
    }

    #[test]
    fn worker_replicas_are_private() {
        let ctx = Context::with_platform(mixed_platform(), None).unwrap();
        let kriging = KrigingOperation::new(&ctx).unwrap();
        let writer = ctx.next_queue();
        let points = ctx.create_buffer(MemAccess::ReadOnly, 12);
        let distances = ctx.create_buffer(MemAccess::ReadWrite, 4);

        let mut shared = 0;
        for _ in 0..ctx.device_count() {
            let worker = kriging
                .semivariogram_worker(&writer, &points, &distances, 1)
                .unwrap();
            if worker.queue == writer {
                assert!(worker.points.same_storage(&points));
                shared += 1;
            } else {
                assert!(!worker.distances.same_storage(&distances));
            }
        }
        assert_eq!(shared, 1);
    }
}
