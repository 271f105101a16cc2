//! Error types for constraint setup and solving.

use thiserror::Error;

/// Errors arising from constraint topology construction, solving, or the
/// device buffers used by the block kernel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstraintError {
    /// A group of coupled constraints does not fit into one execution block.
    /// Raised while building the block layout; not recoverable without
    /// re-grouping the constraints.
    #[error(
        "coupled constraint group starting at constraint {first_constraint} has {group_size} \
         constraints, which does not fit in a block of {block_size} threads"
    )]
    CoupledGroupTooLarge {
        group_size: usize,
        block_size: usize,
        first_constraint: usize,
    },

    /// SHAKE used up its iteration budget.
    #[error(
        "SHAKE did not converge in {iterations} iterations \
         (max relative deviation {max_relative_deviation:.3e})"
    )]
    ShakeNotConverged {
        iterations: usize,
        max_relative_deviation: f64,
    },

    /// The reference and trial bond vectors of a constraint are (nearly)
    /// perpendicular, so the SHAKE correction is undefined.
    #[error("SHAKE: bond of constraint {constraint} rotated by more than 90 degrees")]
    ShakeBondRotated { constraint: usize },

    /// Zero-length reference bond vector.
    #[error("constraint {constraint} between atoms {atom_i} and {atom_j} has zero length")]
    DegenerateBond {
        constraint: usize,
        atom_i: usize,
        atom_j: usize,
    },

    #[error("constraint {constraint} references atom {atom}, but the system has {num_atoms} atoms")]
    AtomIndexOutOfRange {
        constraint: usize,
        atom: usize,
        num_atoms: usize,
    },

    #[error("constraint {constraint} connects atom {atom} to itself")]
    SelfConstraint { constraint: usize, atom: usize },

    #[error("constraint {constraint} uses type {type_index}, but only {num_types} types are defined")]
    UnknownConstraintType {
        constraint: usize,
        type_index: usize,
        num_types: usize,
    },

    #[error("{what}: expected {expected} elements, found {found}")]
    BufferSizeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("device buffer `{name}` holds {capacity} elements, {requested} requested")]
    DeviceBufferTooSmall {
        name: &'static str,
        capacity: usize,
        requested: usize,
    },

    #[error("device stream is closed")]
    StreamClosed,
}

pub type Result<T> = std::result::Result<T, ConstraintError>;

/// Check that a per-atom (or per-constraint) buffer has the expected length.
pub(crate) fn check_len(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(ConstraintError::BufferSizeMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}
