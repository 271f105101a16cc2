//! LINCS: linear constraint solver.
//!
//! Per step:
//!
//! 1. Normalized bond directions `r` are taken from the reference positions.
//! 2. The coupling matrix `A` is filled from the mass factors and `r_c · r_c'`.
//! 3. The right-hand side `b = sqrt(mu) * (r · (x'_i - x'_j) - r0)` is solved
//!    with the truncated expansion `(I - A)^-1 b ≈ sum_k A^k b`.
//! 4. Positions are corrected along `r` by the resulting Lagrange multipliers.
//! 5. `num_iterations` centripetal passes correct for the lengthening caused
//!    by bond rotation, using `p = sqrt(2 r0² - |x'_i - x'_j|²)`.
//!
//! Velocities and the scaled virial are derived from the accumulated
//! multipliers. The expansion is a fixed budget; no convergence check is
//! made. Large rotations are counted and reported once per step.

use crate::analysis::{bond_rotation_cosine, deviation_stats};
use crate::config::LincsParams;
use crate::coupling::CouplingGraph;
use crate::error::{check_len, ConstraintError, Result};
use crate::partition::{build_tasks, solve_tasks, ConstraintTask};
use crate::pbc::Pbc;
use crate::topology::ConstraintTopology;
use crate::util::{add_scaled, dot, norm, norm2, scale};
use crate::virial::Virial;

/// Per-step LINCS diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LincsReport {
    /// Constraints that rotated beyond the warning angle or were stretched
    /// so far that the centripetal correction broke down.
    pub num_warnings: usize,
    /// Constraint with the largest rotation among the warned ones.
    pub worst_constraint: Option<usize>,
    /// Largest rotation of any constraint during the step.
    pub max_angle_degrees: f64,
    /// RMS relative deviation after the solve.
    pub rms_deviation: f64,
    /// Largest relative deviation after the solve.
    pub max_deviation: f64,
}

/// Warning bookkeeping of one task.
#[derive(Debug, Clone, Copy, Default)]
struct TaskWarnings {
    count: usize,
    worst: Option<usize>,
    worst_cosine: f64,
    min_cosine: f64,
}

/// `sol += A * rhs + A² * rhs + ...` up to `order` terms, alternating between
/// the two right-hand-side buffers.
pub(crate) fn expand(
    graph: &CouplingGraph,
    matrix: &[f64],
    order: usize,
    rhs: &mut [f64],
    rhs_next: &mut [f64],
    sol: &mut [f64],
) {
    let (mut current, mut next) = (rhs, rhs_next);
    for _ in 0..order {
        graph.multiply(matrix, current, next);
        for (s, n) in sol.iter_mut().zip(next.iter()) {
            *s += n;
        }
        std::mem::swap(&mut current, &mut next);
    }
}

/// Work buffers and coupling data for one task.
#[derive(Debug, Clone)]
struct LincsWork {
    graph: CouplingGraph,
    directions: Vec<[f64; 3]>,
    matrix: Vec<f64>,
    rhs: Vec<f64>,
    rhs_next: Vec<f64>,
    sol: Vec<f64>,
    blc_sol: Vec<f64>,
    lambda: Vec<f64>,
    warned: Vec<bool>,
    virial: Virial,
}

struct LincsInput<'a> {
    constraints: &'a [usize],
    topology: &'a ConstraintTopology,
    inverse_masses: &'a [f64],
    x: &'a [[f64; 3]],
    pbc: &'a Pbc,
}

impl LincsWork {
    fn new(topology: &ConstraintTopology, inverse_masses: &[f64]) -> Result<Self> {
        let n = topology.len();
        Ok(Self {
            graph: CouplingGraph::build(topology, inverse_masses)?,
            directions: vec![[0.0; 3]; n],
            matrix: Vec::new(),
            rhs: vec![0.0; n],
            rhs_next: vec![0.0; n],
            sol: vec![0.0; n],
            blc_sol: vec![0.0; n],
            lambda: vec![0.0; n],
            warned: vec![false; n],
            virial: Virial::zero(),
        })
    }

    /// Move both atoms of every constraint by `prefactor * fac[c]` along its
    /// direction, weighted by inverse mass.
    fn update_atoms(
        topology: &ConstraintTopology,
        inverse_masses: &[f64],
        directions: &[[f64; 3]],
        prefactor: f64,
        fac: &[f64],
        target: &mut [[f64; 3]],
    ) {
        for (c, p) in topology.pairs().iter().enumerate() {
            let mvb = prefactor * fac[c];
            add_scaled(&mut target[p.i], &directions[c], -mvb * inverse_masses[p.i]);
            add_scaled(&mut target[p.j], &directions[c], mvb * inverse_masses[p.j]);
        }
    }

    fn solve_expansion(&mut self, order: usize) {
        let n = self.sol.len();
        expand(
            &self.graph,
            &self.matrix,
            order,
            &mut self.rhs,
            &mut self.rhs_next,
            &mut self.sol,
        );
        for c in 0..n {
            self.blc_sol[c] = self.graph.sqrt_reduced_mass(c) * self.sol[c];
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn solve(
        &mut self,
        input: LincsInput<'_>,
        xprime: &mut [[f64; 3]],
        v: Option<&mut [[f64; 3]]>,
        invdt: f64,
        params: &LincsParams,
        compute_virial: bool,
    ) -> Result<TaskWarnings> {
        let LincsInput {
            constraints,
            topology,
            inverse_masses,
            x,
            pbc,
        } = input;
        let global = |c: usize| constraints.get(c).copied().unwrap_or(c);
        let n = topology.len();

        for (c, p) in topology.pairs().iter().enumerate() {
            let dx = pbc.dx_aiuc(&x[p.i], &x[p.j]);
            let len = norm(&dx);
            if len == 0.0 {
                return Err(ConstraintError::DegenerateBond {
                    constraint: global(c),
                    atom_i: p.i,
                    atom_j: p.j,
                });
            }
            self.directions[c] = scale(&dx, 1.0 / len);
            self.warned[c] = false;
        }
        self.graph.fill_matrix(&self.directions, &mut self.matrix);

        for (c, p) in topology.pairs().iter().enumerate() {
            let dxp = pbc.dx_aiuc(&xprime[p.i], &xprime[p.j]);
            let mvb = self.graph.sqrt_reduced_mass(c)
                * (dot(&self.directions[c], &dxp) - topology.target_length(c));
            self.rhs[c] = mvb;
            self.sol[c] = mvb;
        }
        self.solve_expansion(params.expansion_order);
        self.lambda.copy_from_slice(&self.blc_sol);
        Self::update_atoms(topology, inverse_masses, &self.directions, 1.0, &self.blc_sol, xprime);

        let cos_warn = params.warn_angle_degrees.to_radians().cos();
        let stretch_limit = cos_warn * cos_warn;
        for _ in 0..params.num_iterations {
            for (c, p) in topology.pairs().iter().enumerate() {
                let r0 = topology.target_length(c);
                let len2 = r0 * r0;
                let dxp = pbc.dx_aiuc(&xprime[p.i], &xprime[p.j]);
                let dlen2 = 2.0 * len2 - norm2(&dxp);
                if dlen2 < stretch_limit * len2 {
                    self.warned[c] = true;
                }
                let projection = if dlen2 > 0.0 { r0 - dlen2.sqrt() } else { r0 };
                let mvb = self.graph.sqrt_reduced_mass(c) * projection;
                self.rhs[c] = mvb;
                self.sol[c] = mvb;
            }
            self.solve_expansion(params.expansion_order);
            for (l, b) in self.lambda.iter_mut().zip(&self.blc_sol) {
                *l += b;
            }
            Self::update_atoms(topology, inverse_masses, &self.directions, 1.0, &self.blc_sol, xprime);
        }

        if let Some(v) = v {
            Self::update_atoms(topology, inverse_masses, &self.directions, invdt, &self.lambda, v);
        }

        self.virial = Virial::zero();
        if compute_virial {
            for c in 0..n {
                self.virial
                    .add_outer(topology.target_length(c) * self.lambda[c], &self.directions[c]);
            }
        }

        let mut warnings = TaskWarnings {
            min_cosine: 1.0,
            worst_cosine: f64::INFINITY,
            ..Default::default()
        };
        for c in 0..n {
            let cosine = bond_rotation_cosine(topology, c, x, xprime, pbc);
            warnings.min_cosine = warnings.min_cosine.min(cosine);
            if cosine < cos_warn {
                self.warned[c] = true;
            }
            if self.warned[c] {
                warnings.count += 1;
                if cosine < warnings.worst_cosine {
                    warnings.worst_cosine = cosine;
                    warnings.worst = Some(global(c));
                }
            }
        }
        Ok(warnings)
    }
}

/// LINCS solver for one topology epoch.
#[derive(Debug, Clone)]
pub struct Lincs {
    params: LincsParams,
    topology: ConstraintTopology,
    inverse_masses: Vec<f64>,
    tasks: Vec<ConstraintTask>,
    work: Vec<LincsWork>,
}

impl Lincs {
    pub fn new(params: LincsParams) -> Result<Self> {
        params.validate()?;
        let topology = ConstraintTopology::default();
        let work = vec![LincsWork::new(&topology, &[])?];
        Ok(Self {
            params,
            topology,
            inverse_masses: Vec::new(),
            tasks: Vec::new(),
            work,
        })
    }

    pub fn params(&self) -> &LincsParams {
        &self.params
    }

    pub fn topology(&self) -> &ConstraintTopology {
        &self.topology
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len().max(1)
    }

    /// Start a new topology epoch: build the coupling graph and split the
    /// constraints into tasks.
    pub fn set_topology(&mut self, topology: &ConstraintTopology, inverse_masses: &[f64]) -> Result<()> {
        check_len("inverse masses", topology.num_atoms(), inverse_masses.len())?;
        let graph = CouplingGraph::build(topology, inverse_masses)?;
        let groups = graph.coupled_groups();

        self.topology = topology.clone();
        self.inverse_masses = inverse_masses.to_vec();
        self.tasks.clear();
        if self.params.num_tasks > 1 && groups.len() > 1 {
            self.tasks = build_tasks(topology, inverse_masses, &groups, self.params.num_tasks)?;
            self.work = self
                .tasks
                .iter()
                .map(|t| LincsWork::new(t.topology(), t.inverse_masses()))
                .collect::<Result<_>>()?;
        } else {
            self.work = vec![LincsWork::new(topology, inverse_masses)?];
        }
        log::info!(
            "LINCS topology: {} constraints, {} couplings, {} coupled groups, {} task(s)",
            topology.len(),
            graph.num_couplings() / 2,
            groups.len(),
            self.num_tasks()
        );
        Ok(())
    }

    /// Spectral radius of the coupling matrix at the geometry `x`. The
    /// expansion converges only below 1; a warning is logged otherwise.
    pub fn coupling_spectral_radius(&self, x: &[[f64; 3]], pbc: &Pbc) -> Result<f64> {
        check_len("positions", self.topology.num_atoms(), x.len())?;
        let graph = CouplingGraph::build(&self.topology, &self.inverse_masses)?;
        let directions: Vec<[f64; 3]> = self
            .topology
            .pairs()
            .iter()
            .map(|p| {
                let dx = pbc.dx_aiuc(&x[p.i], &x[p.j]);
                let len = norm(&dx);
                if len > 0.0 {
                    scale(&dx, 1.0 / len)
                } else {
                    dx
                }
            })
            .collect();
        let radius = graph.spectral_radius(&directions)?;
        if radius >= 1.0 {
            log::warn!(
                "LINCS coupling matrix has spectral radius {radius:.3}; \
                 the matrix expansion does not converge for this geometry"
            );
        }
        Ok(radius)
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
    ) -> Result<LincsReport> {
        let n = self.topology.num_atoms();
        check_len("reference positions", n, x.len())?;
        check_len("updated positions", n, xprime.len())?;
        if let Some(v) = v.as_deref() {
            check_len("velocities", n, v.len())?;
        }

        let compute_virial = virial.is_some();
        let params = &self.params;
        let per_task = if self.tasks.is_empty() {
            let input = LincsInput {
                constraints: &[],
                topology: &self.topology,
                inverse_masses: &self.inverse_masses,
                x,
                pbc,
            };
            vec![self.work[0].solve(input, xprime, v, invdt, params, compute_virial)?]
        } else {
            solve_tasks(&mut self.tasks, &mut self.work, x, xprime, v, |work, buffers| {
                let input = LincsInput {
                    constraints: buffers.constraints,
                    topology: buffers.topology,
                    inverse_masses: buffers.inverse_masses,
                    x: buffers.x,
                    pbc,
                };
                work.solve(input, buffers.xprime, buffers.v, invdt, params, compute_virial)
            })?
        };

        if let Some(virial) = virial {
            for work in &self.work {
                *virial += work.virial;
            }
        }

        let mut report = LincsReport::default();
        let mut min_cosine: f64 = 1.0;
        let mut worst_cosine = f64::INFINITY;
        for w in &per_task {
            report.num_warnings += w.count;
            min_cosine = min_cosine.min(w.min_cosine);
            if w.worst.is_some() && w.worst_cosine < worst_cosine {
                worst_cosine = w.worst_cosine;
                report.worst_constraint = w.worst;
            }
        }
        report.max_angle_degrees = min_cosine.clamp(-1.0, 1.0).acos().to_degrees();
        let stats = deviation_stats(&self.topology, xprime, pbc);
        report.rms_deviation = stats.rms;
        report.max_deviation = stats.max;

        if report.num_warnings > 0 {
            log::warn!(
                "LINCS: {} constraint(s) rotated more than {} degrees or were overstretched; \
                 worst constraint {:?} rotated {:.1} degrees, relative deviation rms {:.3e} max {:.3e}",
                report.num_warnings,
                self.params.warn_angle_degrees,
                report.worst_constraint,
                report.max_angle_degrees,
                report.rms_deviation,
                report.max_deviation
            );
        } else {
            log::debug!(
                "LINCS: relative deviation rms {:.3e} max {:.3e}",
                report.rms_deviation,
                report.max_deviation
            );
        }
        Ok(report)
    }
}
