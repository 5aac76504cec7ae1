pub mod common;
pub mod operation;
pub mod serial;

pub use common::{FittedModel, Grid, LagBounds, SemivariogramSample, VariogramModel};
pub use operation::KrigingOperation;
pub use serial::SerialKriging;
