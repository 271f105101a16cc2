//! Algorithm-independent entry point used by integrators.

use crate::config::{Algorithm, ConstraintConfig};
use crate::error::Result;
use crate::lincs::{Lincs, LincsReport};
use crate::pbc::Pbc;
use crate::shake::{Shake, ShakeReport};
use crate::topology::ConstraintTopology;
use crate::util::inverse_masses;
use crate::virial::Virial;

/// Everything a single constraint step needs. The solver mutates `xprime`
/// (and `v`) in place and adds to `virial`.
pub struct ConstrainStep<'a> {
    /// Positions at the start of the step.
    pub x: &'a [[f64; 3]],
    /// Unconstrained positions at the end of the step.
    pub xprime: &'a mut [[f64; 3]],
    /// Velocities to correct, if requested.
    pub v: Option<&'a mut [[f64; 3]]>,
    /// Inverse time step used for the velocity correction.
    pub invdt: f64,
    pub pbc: &'a Pbc,
    /// Scaled virial accumulator, if requested.
    pub virial: Option<&'a mut Virial>,
}

/// Per-step outcome of whichever algorithm ran.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolverReport {
    Lincs(LincsReport),
    Shake(ShakeReport),
}

#[derive(Debug, Clone)]
enum Solver {
    Lincs(Lincs),
    Shake(Shake),
}

/// Constraint solver selected from a [`ConstraintConfig`].
#[derive(Debug, Clone)]
pub struct Constraints {
    config: ConstraintConfig,
    solver: Solver,
    masses: Vec<f64>,
}

impl Constraints {
    pub fn new(config: ConstraintConfig) -> Result<Self> {
        config.validate()?;
        let solver = match config.algorithm {
            Algorithm::Lincs => Solver::Lincs(Lincs::new(config.lincs.clone())?),
            Algorithm::Shake => Solver::Shake(Shake::new(config.shake.clone())?),
        };
        Ok(Self {
            config,
            solver,
            masses: Vec::new(),
        })
    }

    pub fn config(&self) -> &ConstraintConfig {
        &self.config
    }

    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    /// Masses of the current topology epoch.
    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    /// Start a new topology epoch. Must be called before the first step and
    /// whenever constraints or masses change.
    pub fn set_topology(&mut self, topology: &ConstraintTopology, masses: &[f64]) -> Result<()> {
        let inv = inverse_masses(masses);
        match &mut self.solver {
            Solver::Lincs(lincs) => lincs.set_topology(topology, &inv)?,
            Solver::Shake(shake) => shake.set_topology(topology, &inv)?,
        }
        self.masses = masses.to_vec();
        Ok(())
    }

    pub fn apply(&mut self, step: ConstrainStep<'_>) -> Result<SolverReport> {
        let ConstrainStep {
            x,
            xprime,
            v,
            invdt,
            pbc,
            virial,
        } = step;
        match &mut self.solver {
            Solver::Lincs(lincs) => lincs
                .apply(x, xprime, v, invdt, pbc, virial)
                .map(SolverReport::Lincs),
            Solver::Shake(shake) => shake
                .apply(x, xprime, v, invdt, pbc, virial)
                .map(SolverReport::Shake),
        }
    }
}
