pub mod compute;
pub mod config;
pub mod error;
pub mod io;
pub mod kernels;
pub mod kriging;
pub mod operations;
pub mod point;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::compute::{Context, DeviceInfo, DeviceKind, MemAccess, Platform};
    pub use crate::config::KrigingConfig;
    pub use crate::error::{Error, Result};
    pub use crate::kriging::{FittedModel, KrigingOperation, SerialKriging, VariogramModel};
    pub use crate::operations::{
        DistancesMatrixOperation, FillBufferOperation, LinearAlgebraOperation, ReductionOp,
        ReductionOperation,
    };
    pub use crate::point::Point;
}
