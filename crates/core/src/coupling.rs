//! Coupling graph between constraints that share an atom.
//!
//! For constraint `c` the coupled constraints and their mass factors are
//! stored in flat CSR arrays. The LINCS coupling matrix `A` has the same
//! sparsity pattern; its entries are the mass factor times the dot product of
//! the two normalized bond directions and are refilled every step.

use crate::error::{ConstraintError, Result};
use crate::topology::ConstraintTopology;
use crate::util::dot;
use nalgebra::{DMatrix, SymmetricEigen};

/// Sparse constraint coupling structure for one topology epoch.
#[derive(Debug, Clone)]
pub struct CouplingGraph {
    offsets: Vec<usize>,
    coupled: Vec<usize>,
    mass_factors: Vec<f64>,
    /// `1 / sqrt(invmass_i + invmass_j)` per constraint.
    sqrt_reduced_mass: Vec<f64>,
}

impl CouplingGraph {
    /// Build the coupling structure for `topology`.
    ///
    /// The mass factor of a coupling `c`-`c'` through shared atom `a` is
    /// `-s * invmass[a] * sqrt(mu_c) * sqrt(mu_c')`, with `s = +1` when `a`
    /// takes the same slot (first or second atom) in both constraints and
    /// `s = -1` otherwise.
    pub fn build(topology: &ConstraintTopology, inverse_masses: &[f64]) -> Result<Self> {
        crate::error::check_len("inverse masses", topology.num_atoms(), inverse_masses.len())?;

        let sqrt_reduced_mass: Vec<f64> = topology
            .pairs()
            .iter()
            .map(|p| {
                let sum = inverse_masses[p.i] + inverse_masses[p.j];
                if sum > 0.0 {
                    1.0 / sum.sqrt()
                } else {
                    0.0
                }
            })
            .collect();

        let atom_map = topology.atom_constraints();
        let n = topology.len();
        let mut offsets = Vec::with_capacity(n + 1);
        let mut coupled = Vec::new();
        let mut mass_factors = Vec::new();
        offsets.push(0);

        for c in 0..n {
            let p = topology.pair(c);
            for shared in [p.i, p.j] {
                for &c2 in atom_map.constraints_of(shared) {
                    if c2 == c {
                        continue;
                    }
                    let p2 = topology.pair(c2);
                    let same_slot = (shared == p.i && shared == p2.i) || (shared == p.j && shared == p2.j);
                    let sign = if same_slot { -1.0 } else { 1.0 };
                    coupled.push(c2);
                    mass_factors.push(
                        sign * inverse_masses[shared] * sqrt_reduced_mass[c] * sqrt_reduced_mass[c2],
                    );
                }
            }
            offsets.push(coupled.len());
        }

        Ok(Self {
            offsets,
            coupled,
            mass_factors,
            sqrt_reduced_mass,
        })
    }

    pub fn num_constraints(&self) -> usize {
        self.sqrt_reduced_mass.len()
    }

    /// Total number of stored (directed) couplings.
    pub fn num_couplings(&self) -> usize {
        self.coupled.len()
    }

    pub fn has_couplings(&self) -> bool {
        !self.coupled.is_empty()
    }

    /// Largest number of couplings of a single constraint.
    pub fn max_coupled(&self) -> usize {
        self.offsets.windows(2).map(|w| w[1] - w[0]).max().unwrap_or(0)
    }

    #[inline]
    pub fn range(&self, c: usize) -> std::ops::Range<usize> {
        self.offsets[c]..self.offsets[c + 1]
    }

    #[inline]
    pub fn coupled(&self, c: usize) -> &[usize] {
        &self.coupled[self.range(c)]
    }

    #[inline]
    pub fn mass_factors(&self, c: usize) -> &[f64] {
        &self.mass_factors[self.range(c)]
    }

    #[inline]
    pub fn sqrt_reduced_mass(&self, c: usize) -> f64 {
        self.sqrt_reduced_mass[c]
    }

    /// Fill the coupling matrix entries for the current bond directions.
    /// `matrix` is indexed like the CSR coupling arrays.
    pub fn fill_matrix(&self, directions: &[[f64; 3]], matrix: &mut Vec<f64>) {
        matrix.clear();
        matrix.resize(self.coupled.len(), 0.0);
        for c in 0..self.num_constraints() {
            let rc = &directions[c];
            for idx in self.range(c) {
                matrix[idx] = self.mass_factors[idx] * dot(rc, &directions[self.coupled[idx]]);
            }
        }
    }

    /// `out = A * rhs`
    #[inline]
    pub fn multiply(&self, matrix: &[f64], rhs: &[f64], out: &mut [f64]) {
        for (c, o) in out.iter_mut().enumerate() {
            let mut mvb = 0.0;
            for idx in self.range(c) {
                mvb += matrix[idx] * rhs[self.coupled[idx]];
            }
            *o = mvb;
        }
    }

    /// Connected groups of coupled constraints, each sorted ascending and
    /// ordered by their lowest constraint index.
    pub fn coupled_groups(&self) -> Vec<Vec<usize>> {
        let n = self.num_constraints();
        let mut visited = vec![false; n];
        let mut groups = Vec::new();
        let mut stack = Vec::new();
        for start in 0..n {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            stack.push(start);
            let mut group = Vec::new();
            while let Some(c) = stack.pop() {
                group.push(c);
                for &c2 in self.coupled(c) {
                    if !visited[c2] {
                        visited[c2] = true;
                        stack.push(c2);
                    }
                }
            }
            group.sort_unstable();
            groups.push(group);
        }
        groups
    }

    /// Spectral radius of the coupling matrix for the given bond
    /// directions, computed per coupled group.
    ///
    /// The truncated expansion `sum_k A^k b` converges only when this is
    /// below 1; rigid, highly branched networks (e.g. coupled angle
    /// constraints) can approach or exceed it.
    pub fn spectral_radius(&self, directions: &[[f64; 3]]) -> Result<f64> {
        crate::error::check_len("bond directions", self.num_constraints(), directions.len())?;
        let mut matrix = Vec::new();
        self.fill_matrix(directions, &mut matrix);

        let mut radius: f64 = 0.0;
        for group in self.coupled_groups() {
            if group.len() < 2 {
                continue;
            }
            let local: rustc_hash::FxHashMap<usize, usize> =
                group.iter().enumerate().map(|(l, &c)| (c, l)).collect();
            let mut dense = DMatrix::<f64>::zeros(group.len(), group.len());
            for (row, &c) in group.iter().enumerate() {
                for idx in self.range(c) {
                    let col = local.get(&self.coupled[idx]).copied().ok_or_else(|| {
                        ConstraintError::InvalidParameter(format!(
                            "coupling of constraint {c} leaves its group"
                        ))
                    })?;
                    dense[(row, col)] += matrix[idx];
                }
            }
            let eigen = SymmetricEigen::new(dense);
            let group_radius = eigen.eigenvalues.iter().fold(0.0f64, |m, &e| m.max(e.abs()));
            radius = radius.max(group_radius);
        }
        Ok(radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ch2() -> (ConstraintTopology, Vec<f64>) {
        let top = ConstraintTopology::from_triples(3, &[0, 0, 1, 1, 1, 2], &[0.1, 0.2]).unwrap();
        (top, vec![1.0, 1.0 / 12.0, 1.0 / 16.0])
    }

    #[test]
    fn test_mass_factor_sign_follows_shared_slot() {
        let (top, inv) = ch2();
        let g = CouplingGraph::build(&top, &inv).unwrap();
        // atom 1 is second in constraint 0 and first in constraint 1
        assert_eq!(g.coupled(0), &[1]);
        let expected = inv[1] * g.sqrt_reduced_mass(0) * g.sqrt_reduced_mass(1);
        assert_relative_eq!(g.mass_factors(0)[0], expected, epsilon = 1e-12);

        // same slot flips the sign
        let star = ConstraintTopology::from_triples(3, &[0, 0, 1, 0, 0, 2], &[0.1]).unwrap();
        let g = CouplingGraph::build(&star, &[1.0 / 12.0, 1.0, 1.0]).unwrap();
        assert!(g.mass_factors(0)[0] < 0.0);
    }

    #[test]
    fn test_coupling_is_symmetric() {
        let tri = ConstraintTopology::from_triples(3, &[0, 0, 1, 2, 0, 2, 1, 1, 2], &[0.1, 0.1, 0.1])
            .unwrap();
        let g = CouplingGraph::build(&tri, &[1.0, 0.5, 0.25]).unwrap();
        for c in 0..3 {
            for (&c2, &f) in g.coupled(c).iter().zip(g.mass_factors(c)) {
                let back = g.coupled(c2).iter().position(|&x| x == c).unwrap();
                assert_relative_eq!(g.mass_factors(c2)[back], f, epsilon = 1e-12);
            }
        }
        assert_eq!(g.max_coupled(), 2);
    }

    #[test]
    fn test_groups_split_disjoint_constraints() {
        let top = ConstraintTopology::from_triples(6, &[0, 0, 1, 0, 2, 3, 0, 1, 2, 0, 4, 5], &[1.0])
            .unwrap();
        let g = CouplingGraph::build(&top, &[1.0; 6]).unwrap();
        assert_eq!(g.coupled_groups(), vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn test_spectral_radius_of_ch2_is_below_one() {
        let (top, inv) = ch2();
        let g = CouplingGraph::build(&top, &inv).unwrap();
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let dirs = [[s, s, 0.0], [1.0, 0.0, 0.0]];
        let radius = g.spectral_radius(&dirs).unwrap();
        // 2x2 symmetric with zero diagonal: eigenvalues are +-|A01|
        let expected = g.mass_factors(0)[0].abs() * s;
        assert_relative_eq!(radius, expected, epsilon = 1e-12);
        assert!(radius < 1.0);
    }
}
