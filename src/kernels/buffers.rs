use bytemuck::Pod;
use rayon::prelude::*;

use crate::compute::program::{KernelArg, KernelDef, Launch, Param};
use crate::error::Result;

/// Element type with a fill kernel.
pub trait Fill: Pod + Send + Sync + Into<KernelArg> {
    const KERNEL: &'static str;

    fn from_launch(launch: &Launch<'_>, index: usize) -> Result<Self>;
}

impl Fill for f64 {
    const KERNEL: &'static str = "FillDoubleBuffer";

    fn from_launch(launch: &Launch<'_>, index: usize) -> Result<Self> {
        launch.double(index)
    }
}

impl Fill for f32 {
    const KERNEL: &'static str = "FillFloatBuffer";

    fn from_launch(launch: &Launch<'_>, index: usize) -> Result<Self> {
        launch.float(index)
    }
}

impl Fill for i32 {
    const KERNEL: &'static str = "FillIntBuffer";

    fn from_launch(launch: &Launch<'_>, index: usize) -> Result<Self> {
        launch.int(index)
    }
}

pub const KERNELS: &[KernelDef] = &[
    KernelDef {
        name: <f64 as Fill>::KERNEL,
        params: &[Param::Output, Param::Double],
        body: fill::<f64>,
    },
    KernelDef {
        name: <f32 as Fill>::KERNEL,
        params: &[Param::Output, Param::Float],
        body: fill::<f32>,
    },
    KernelDef {
        name: <i32 as Fill>::KERNEL,
        params: &[Param::Output, Param::Int],
        body: fill::<i32>,
    },
];

/// `(buffer, value)`: one element per work item.
fn fill<T: Fill>(launch: &Launch<'_>) -> Result<()> {
    let value = T::from_launch(launch, 1)?;
    let items = launch.range.global_size();

    let mut buffer = launch.write::<T>(0)?;
    launch.check_bounds("buffer", items, buffer.len())?;
    buffer[..items].par_iter_mut().for_each(|slot| *slot = value);

    Ok(())
}
