//! Block-parallel LINCS for rust-constraint-solvers.
//!
//! The kernel follows the GPU formulation of LINCS: one thread per
//! constraint, coupled constraints kept inside one block, and atomic updates
//! of positions, velocities and the virial. It runs on a software device
//! model ([`device`]) with in-order streams and grow-only buffers.

pub mod device;
mod kernel;
pub mod lincs_gpu;

pub use device::{AtomicF32, DeviceAtomPair, DeviceBuffer, DeviceContext, DeviceStream, GpuEvent};
pub use lincs_gpu::{is_topology_supported, GpuLincsParams, LincsGpu};
