//! Core library for rust-constraint-solvers.
//!
//! Pure Rust bond-constraint solvers for molecular dynamics, with no Python
//! dependencies. Provides the constraint topology and coupling graph, SHAKE
//! and LINCS on the CPU, block and task partitioning, the scaled virial, and
//! reference systems for testing.

pub mod analysis;
pub mod config;
pub mod constraints;
pub mod coupling;
pub mod error;
pub mod lincs;
pub mod partition;
pub mod pbc;
pub mod shake;
pub mod test_systems;
pub mod topology;
pub mod util;
pub mod virial;

pub use config::{Algorithm, ConstraintConfig, LincsParams, ShakeParams};
pub use constraints::{ConstrainStep, Constraints, SolverReport};
pub use error::{ConstraintError, Result};
pub use lincs::{Lincs, LincsReport};
pub use pbc::{Pbc, PbcType};
pub use shake::{Shake, ShakeReport};
pub use topology::{AtomPair, ConstraintTopology};
pub use virial::Virial;
