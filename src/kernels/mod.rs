//! Device code. Each submodule is one program, registered under the
//! identifier passed to [`Context::create_program`](crate::compute::Context::create_program).
//!
//! Kernel bodies receive the whole launch and spread the work items over the
//! device's compute units with rayon. Work-group kernels run one group per
//! task, with a private scratch vector standing in for local memory.

pub mod buffers;
pub mod distances_matrix;
pub mod kriging;
pub mod linear_algebra;
pub mod reduction;

use crate::compute::program::ProgramSource;

pub const REDUCTION: &str = "reduction";
pub const LINEAR_ALGEBRA: &str = "linear_algebra";
pub const DISTANCES_MATRIX: &str = "distances_matrix";
pub const KRIGING: &str = "kriging";
pub const BUFFERS: &str = "buffers";

const PROGRAMS: &[ProgramSource] = &[
    ProgramSource {
        name: REDUCTION,
        kernels: reduction::KERNELS,
        requires_double: true,
    },
    ProgramSource {
        name: LINEAR_ALGEBRA,
        kernels: linear_algebra::KERNELS,
        requires_double: true,
    },
    ProgramSource {
        name: DISTANCES_MATRIX,
        kernels: distances_matrix::KERNELS,
        requires_double: false,
    },
    ProgramSource {
        name: KRIGING,
        kernels: kriging::KERNELS,
        requires_double: true,
    },
    ProgramSource {
        name: BUFFERS,
        kernels: buffers::KERNELS,
        requires_double: true,
    },
];

/// Looks up the program source registered under `identifier`.
pub fn source(identifier: &str) -> Option<ProgramSource> {
    PROGRAMS.iter().find(|p| p.name == identifier).copied()
}
