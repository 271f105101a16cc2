//! SHAKE: iterative pairwise constraint solver.
//!
//! Each sweep visits every constraint in order and moves its two atoms along
//! the reference bond vector so that the bond length is satisfied to first
//! order. Sweeps repeat until all relative deviations are within tolerance.
//! Corrections made earlier in a sweep are seen by later constraints
//! (Gauss-Seidel), which makes the solve sequential within a task.

use crate::config::ShakeParams;
use crate::coupling::CouplingGraph;
use crate::error::{check_len, ConstraintError, Result};
use crate::partition::{build_tasks, solve_tasks, ConstraintTask};
use crate::pbc::Pbc;
use crate::topology::ConstraintTopology;
use crate::util::{add_scaled, dot, norm2};
use crate::virial::Virial;

/// Threshold on `r_old · r_new / r0²` below which a bond is considered
/// rotated too far to correct.
const ROTATION_TOLERANCE: f64 = 1e-10;

/// Outcome of a successful SHAKE step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShakeReport {
    /// Largest number of sweeps needed by any task.
    pub iterations: usize,
    /// Relaxation factor used for this step.
    pub omega: f64,
}

/// Per-task SHAKE state and work buffers.
#[derive(Debug, Clone, Default)]
struct ShakeWork {
    /// `0.5 / (invmass_i + invmass_j)` per constraint.
    half_reduced_mass: Vec<f64>,
    rij: Vec<[f64; 3]>,
    lagrange: Vec<f64>,
    virial: Virial,
}

struct SweepInput<'a> {
    constraints: &'a [usize],
    topology: &'a ConstraintTopology,
    inverse_masses: &'a [f64],
    x: &'a [[f64; 3]],
    pbc: &'a Pbc,
}

impl ShakeWork {
    fn new(topology: &ConstraintTopology, inverse_masses: &[f64]) -> Self {
        let half_reduced_mass = topology
            .pairs()
            .iter()
            .map(|p| {
                let sum = inverse_masses[p.i] + inverse_masses[p.j];
                if sum > 0.0 {
                    0.5 / sum
                } else {
                    0.0
                }
            })
            .collect();
        Self {
            half_reduced_mass,
            rij: vec![[0.0; 3]; topology.len()],
            lagrange: vec![0.0; topology.len()],
            virial: Virial::zero(),
        }
    }

    /// Run SHAKE sweeps on one set of constraints and return the number of
    /// sweeps performed.
    #[allow(clippy::too_many_arguments)]
    fn solve(
        &mut self,
        input: SweepInput<'_>,
        xprime: &mut [[f64; 3]],
        v: Option<&mut [[f64; 3]]>,
        invdt: f64,
        params: &ShakeParams,
        omega: f64,
        compute_virial: bool,
    ) -> Result<usize> {
        let SweepInput {
            constraints,
            topology,
            inverse_masses,
            x,
            pbc,
        } = input;
        let global = |c: usize| constraints.get(c).copied().unwrap_or(c);

        for (c, p) in topology.pairs().iter().enumerate() {
            let rij = pbc.dx_aiuc(&x[p.i], &x[p.j]);
            if norm2(&rij) == 0.0 {
                return Err(ConstraintError::DegenerateBond {
                    constraint: global(c),
                    atom_i: p.i,
                    atom_j: p.j,
                });
            }
            self.rij[c] = rij;
            self.lagrange[c] = 0.0;
        }

        let mut iterations = 0;
        let mut max_relative_deviation = f64::INFINITY;
        while max_relative_deviation > params.tolerance {
            if iterations == params.max_iterations {
                return Err(ConstraintError::ShakeNotConverged {
                    iterations,
                    max_relative_deviation,
                });
            }
            max_relative_deviation = 0.0;
            for (c, p) in topology.pairs().iter().enumerate() {
                let r0 = topology.target_length(c);
                let r02 = r0 * r0;
                let xpij = pbc.dx_aiuc(&xprime[p.i], &xprime[p.j]);
                let diff = r02 - norm2(&xpij);
                let relative = diff.abs() / (2.0 * r02);
                if relative <= params.tolerance {
                    continue;
                }
                max_relative_deviation = max_relative_deviation.max(relative);

                let rij = self.rij[c];
                let rrpr = dot(&rij, &xpij);
                if rrpr < r02 * ROTATION_TOLERANCE {
                    return Err(ConstraintError::ShakeBondRotated {
                        constraint: global(c),
                    });
                }
                let acor = omega * diff * self.half_reduced_mass[c] / rrpr;
                self.lagrange[c] += acor;
                add_scaled(&mut xprime[p.i], &rij, acor * inverse_masses[p.i]);
                add_scaled(&mut xprime[p.j], &rij, -acor * inverse_masses[p.j]);
            }
            iterations += 1;
        }

        if let Some(v) = v {
            for (c, p) in topology.pairs().iter().enumerate() {
                let s = invdt * self.lagrange[c];
                add_scaled(&mut v[p.i], &self.rij[c], s * inverse_masses[p.i]);
                add_scaled(&mut v[p.j], &self.rij[c], -s * inverse_masses[p.j]);
            }
        }

        self.virial = Virial::zero();
        if compute_virial {
            for c in 0..topology.len() {
                self.virial.add_outer(-self.lagrange[c], &self.rij[c]);
            }
        }
        Ok(iterations)
    }
}

/// SHAKE solver for one topology epoch.
#[derive(Debug, Clone)]
pub struct Shake {
    params: ShakeParams,
    topology: ConstraintTopology,
    inverse_masses: Vec<f64>,
    tasks: Vec<ConstraintTask>,
    work: Vec<ShakeWork>,
    omega: f64,
    delta: f64,
    prev_iterations: usize,
}

impl Shake {
    pub fn new(params: ShakeParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            omega: params.relaxation,
            params,
            topology: ConstraintTopology::default(),
            inverse_masses: Vec::new(),
            tasks: Vec::new(),
            work: vec![ShakeWork::default()],
            delta: 0.1,
            prev_iterations: usize::MAX,
        })
    }

    pub fn params(&self) -> &ShakeParams {
        &self.params
    }

    /// Current (possibly adapted) relaxation factor.
    pub fn omega(&self) -> f64 {
        self.omega
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len().max(1)
    }

    /// Start a new topology epoch.
    pub fn set_topology(&mut self, topology: &ConstraintTopology, inverse_masses: &[f64]) -> Result<()> {
        check_len("inverse masses", topology.num_atoms(), inverse_masses.len())?;
        self.topology = topology.clone();
        self.inverse_masses = inverse_masses.to_vec();
        self.tasks.clear();

        let groups = if self.params.num_tasks > 1 {
            CouplingGraph::build(topology, inverse_masses)?.coupled_groups()
        } else {
            Vec::new()
        };
        if groups.len() > 1 {
            self.tasks = build_tasks(topology, inverse_masses, &groups, self.params.num_tasks)?;
            self.work = self
                .tasks
                .iter()
                .map(|t| ShakeWork::new(t.topology(), t.inverse_masses()))
                .collect();
        } else {
            self.work = vec![ShakeWork::new(topology, inverse_masses)];
        }
        log::info!(
            "SHAKE topology: {} constraints on {} atoms in {} task(s)",
            topology.len(),
            topology.num_atoms(),
            self.num_tasks()
        );
        Ok(())
    }

    /// Constrain `xprime` to the bond lengths, using `x` as the reference
    /// geometry. Velocities are corrected by `invdt * Δx` when given, and the
    /// scaled virial is added to `virial` when requested.
    pub fn apply(
        &mut self,
        x: &[[f64; 3]],
        xprime: &mut [[f64; 3]],
        v: Option<&mut [[f64; 3]]>,
        invdt: f64,
        pbc: &Pbc,
        virial: Option<&mut Virial>,
    ) -> Result<ShakeReport> {
        let n = self.topology.num_atoms();
        check_len("reference positions", n, x.len())?;
        check_len("updated positions", n, xprime.len())?;
        if let Some(v) = v.as_deref() {
            check_len("velocities", n, v.len())?;
        }

        let compute_virial = virial.is_some();
        let omega = self.omega;
        let params = &self.params;
        let iterations = if self.tasks.is_empty() {
            let input = SweepInput {
                constraints: &[],
                topology: &self.topology,
                inverse_masses: &self.inverse_masses,
                x,
                pbc,
            };
            self.work[0].solve(input, xprime, v, invdt, params, omega, compute_virial)?
        } else {
            let per_task = solve_tasks(
                &mut self.tasks,
                &mut self.work,
                x,
                xprime,
                v,
                |work, buffers| {
                    let input = SweepInput {
                        constraints: buffers.constraints,
                        topology: buffers.topology,
                        inverse_masses: buffers.inverse_masses,
                        x: buffers.x,
                        pbc,
                    };
                    work.solve(input, buffers.xprime, buffers.v, invdt, params, omega, compute_virial)
                },
            )?;
            per_task.into_iter().max().unwrap_or(0)
        };

        if let Some(virial) = virial {
            for work in &self.work {
                *virial += work.virial;
            }
        }

        let report = ShakeReport { iterations, omega };
        if self.params.use_sor {
            if iterations > self.prev_iterations {
                self.delta *= -0.5;
            }
            self.omega += self.delta;
            self.prev_iterations = iterations;
        }
        log::debug!(
            "SHAKE converged in {} iterations (omega {:.3})",
            report.iterations,
            report.omega
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::deviation_stats;
    use crate::util::norm;
    use approx::assert_relative_eq;

    fn stretched_dimer() -> (ConstraintTopology, Vec<f64>, Vec<[f64; 3]>, Vec<[f64; 3]>) {
        let top = ConstraintTopology::from_triples(2, &[0, 0, 1], &[1.0]).unwrap();
        let x = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        let xprime = vec![[-0.1, 0.05, 0.0], [1.2, 0.0, 0.0]];
        (top, vec![1.0, 0.5], x, xprime)
    }

    #[test]
    fn test_dimer_converges() {
        let (top, inv, x, mut xprime) = stretched_dimer();
        let mut shake = Shake::new(ShakeParams {
            tolerance: 1e-10,
            ..Default::default()
        })
        .unwrap();
        shake.set_topology(&top, &inv).unwrap();
        let report = shake
            .apply(&x, &mut xprime, None, 1.0, &Pbc::none(), None)
            .unwrap();
        assert!(report.iterations >= 1);
        let len = norm(&crate::util::sub(&xprime[1], &xprime[0]));
        assert_relative_eq!(len, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_corrections_conserve_momentum() {
        let (top, inv, x, mut xprime) = stretched_dimer();
        let before = xprime.clone();
        let mut v = vec![[0.0; 3]; 2];
        let mut shake = Shake::new(ShakeParams::default()).unwrap();
        shake.set_topology(&top, &inv).unwrap();
        shake
            .apply(&x, &mut xprime, Some(&mut v), 10.0, &Pbc::none(), None)
            .unwrap();
        // masses 1 and 2
        for d in 0..3 {
            let shift = (xprime[0][d] - before[0][d]) + 2.0 * (xprime[1][d] - before[1][d]);
            assert!(shift.abs() < 1e-12);
            assert!((v[0][d] + 2.0 * v[1][d]).abs() < 1e-10);
            assert_relative_eq!(v[0][d], 10.0 * (xprime[0][d] - before[0][d]), epsilon = 1e-10);
        }
    }

    #[test]
    fn test_iteration_budget_is_reported() {
        let top = ConstraintTopology::from_triples(3, &[0, 0, 1, 0, 1, 2], &[1.0]).unwrap();
        let x = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]];
        let xprime = vec![[0.0, 0.0, 0.0], [1.3, 0.2, 0.0], [1.5, 1.2, 0.0]];
        let mut shake = Shake::new(ShakeParams {
            tolerance: 1e-12,
            max_iterations: 1,
            ..Default::default()
        })
        .unwrap();
        shake.set_topology(&top, &[1.0; 3]).unwrap();
        let mut xp = xprime.clone();
        let err = shake
            .apply(&x, &mut xp, None, 1.0, &Pbc::none(), None)
            .unwrap_err();
        assert!(matches!(err, ConstraintError::ShakeNotConverged { iterations: 1, .. }));
    }

    #[test]
    fn test_perpendicular_bond_is_rejected() {
        let top = ConstraintTopology::from_triples(2, &[0, 0, 1], &[1.0]).unwrap();
        let x = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        let mut xprime = vec![[0.0, 0.0, 0.0], [0.0, 1.5, 0.0]];
        let mut shake = Shake::new(ShakeParams::default()).unwrap();
        shake.set_topology(&top, &[1.0, 1.0]).unwrap();
        let err = shake
            .apply(&x, &mut xprime, None, 1.0, &Pbc::none(), None)
            .unwrap_err();
        assert_eq!(err, ConstraintError::ShakeBondRotated { constraint: 0 });
    }

    #[test]
    fn test_sor_adapts_relaxation() {
        let (top, inv, x, xprime) = stretched_dimer();
        let mut shake = Shake::new(ShakeParams {
            use_sor: true,
            ..Default::default()
        })
        .unwrap();
        shake.set_topology(&top, &inv).unwrap();
        let mut xp = xprime.clone();
        let report = shake.apply(&x, &mut xp, None, 1.0, &Pbc::none(), None).unwrap();
        assert_relative_eq!(report.omega, 1.0);
        assert_relative_eq!(shake.omega(), 1.1);
    }

    #[test]
    fn test_sor_reverses_when_sweeps_increase() {
        let (top, inv, x, xprime) = stretched_dimer();
        let mut shake = Shake::new(ShakeParams {
            use_sor: true,
            ..Default::default()
        })
        .unwrap();
        shake.set_topology(&top, &inv).unwrap();

        // already on the constraint surface: a single checking sweep
        let mut xp = x.clone();
        let first = shake.apply(&x, &mut xp, None, 1.0, &Pbc::none(), None).unwrap();
        assert_eq!(first.iterations, 1);
        assert_relative_eq!(shake.omega(), 1.1);
        assert_relative_eq!(shake.delta, 0.1);

        let mut xp = xprime.clone();
        let second = shake.apply(&x, &mut xp, None, 1.0, &Pbc::none(), None).unwrap();
        assert!(second.iterations > first.iterations);
        assert_relative_eq!(second.omega, 1.1);
        assert_relative_eq!(shake.delta, -0.05);
        assert_relative_eq!(shake.omega(), 1.05);

        let mut xp = x.clone();
        shake.apply(&x, &mut xp, None, 1.0, &Pbc::none(), None).unwrap();
        assert_relative_eq!(shake.delta, -0.05);
        assert_relative_eq!(shake.omega(), 1.0);
    }

    #[test]
    fn test_tasks_match_single_task() {
        let top = ConstraintTopology::from_triples(
            6,
            &[0, 0, 1, 0, 1, 2, 0, 3, 4, 0, 4, 5],
            &[1.0],
        )
        .unwrap();
        let inv = vec![1.0, 0.5, 1.0, 1.0, 0.25, 1.0];
        let x = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [5.0, 0.0, 0.0],
            [6.0, 0.0, 0.0],
            [6.0, 0.0, 1.0],
        ];
        let xprime = vec![
            [0.0, 0.1, 0.0],
            [1.1, 0.0, 0.0],
            [1.1, 1.05, 0.0],
            [4.95, 0.0, 0.0],
            [6.1, 0.0, 0.1],
            [6.0, 0.05, 1.1],
        ];

        let mut single = Shake::new(ShakeParams::default()).unwrap();
        single.set_topology(&top, &inv).unwrap();
        let mut multi = Shake::new(ShakeParams {
            num_tasks: 2,
            ..Default::default()
        })
        .unwrap();
        multi.set_topology(&top, &inv).unwrap();
        assert_eq!(multi.num_tasks(), 2);

        let mut a = xprime.clone();
        let mut b = xprime.clone();
        let mut va = Virial::zero();
        let mut vb = Virial::zero();
        single.apply(&x, &mut a, None, 1.0, &Pbc::none(), Some(&mut va)).unwrap();
        multi.apply(&x, &mut b, None, 1.0, &Pbc::none(), Some(&mut vb)).unwrap();
        for (pa, pb) in a.iter().zip(&b) {
            for d in 0..3 {
                assert_relative_eq!(pa[d], pb[d], epsilon = 1e-12);
            }
        }
        assert!(va.max_abs_diff(&vb) < 1e-12);
        assert!(deviation_stats(&top, &b, &Pbc::none()).max < 2e-4);
    }
}
