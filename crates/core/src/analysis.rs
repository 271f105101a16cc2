//! Constraint deviation statistics and invariant checks.

use crate::pbc::Pbc;
use crate::topology::ConstraintTopology;
use crate::util::{dot, norm};

/// Relative deviation `|r - r0| / r0` over a set of constraints.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviationStats {
    pub rms: f64,
    pub max: f64,
    /// Constraint with the largest deviation, `None` when there are no constraints.
    pub max_constraint: Option<usize>,
}

/// Deviation of the current constraint lengths in `x` from their targets.
pub fn deviation_stats(topology: &ConstraintTopology, x: &[[f64; 3]], pbc: &Pbc) -> DeviationStats {
    let mut sum_sq = 0.0;
    let mut stats = DeviationStats::default();
    for (c, p) in topology.pairs().iter().enumerate() {
        let r0 = topology.target_length(c);
        let len = norm(&pbc.dx_aiuc(&x[p.i], &x[p.j]));
        let dev = ((len - r0) / r0).abs();
        sum_sq += dev * dev;
        if stats.max_constraint.is_none() || dev > stats.max {
            stats.max = dev;
            stats.max_constraint = Some(c);
        }
    }
    if !topology.is_empty() {
        stats.rms = (sum_sq / topology.len() as f64).sqrt();
    }
    stats
}

/// Cosine of the angle between the bond vectors of constraint `c` in `x`
/// and in `xprime`.
pub fn bond_rotation_cosine(
    topology: &ConstraintTopology,
    c: usize,
    x: &[[f64; 3]],
    xprime: &[[f64; 3]],
    pbc: &Pbc,
) -> f64 {
    let p = topology.pair(c);
    let before = pbc.dx_aiuc(&x[p.i], &x[p.j]);
    let after = pbc.dx_aiuc(&xprime[p.i], &xprime[p.j]);
    let denom = norm(&before) * norm(&after);
    if denom > 0.0 {
        dot(&before, &after) / denom
    } else {
        1.0
    }
}

/// Constraints whose bond vector points against its pre-step direction.
pub fn direction_flips(
    topology: &ConstraintTopology,
    x: &[[f64; 3]],
    xprime: &[[f64; 3]],
    pbc: &Pbc,
) -> Vec<usize> {
    topology
        .pairs()
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            let before = pbc.dx_aiuc(&x[p.i], &x[p.j]);
            let after = pbc.dx_aiuc(&xprime[p.i], &xprime[p.j]);
            dot(&before, &after) < 0.0
        })
        .map(|(c, _)| c)
        .collect()
}

/// Mass-weighted mean of `values` (positions or velocities).
pub fn center_of_mass(masses: &[f64], values: &[[f64; 3]]) -> [f64; 3] {
    let mut com = [0.0; 3];
    let mut total = 0.0;
    for (m, v) in masses.iter().zip(values) {
        for d in 0..3 {
            com[d] += m * v[d];
        }
        total += m;
    }
    if total > 0.0 {
        for c in &mut com {
            *c /= total;
        }
    }
    com
}

/// Mass-weighted mean velocity.
pub fn center_of_mass_velocity(masses: &[f64], velocities: &[[f64; 3]]) -> [f64; 3] {
    center_of_mass(masses, velocities)
}
