//! Static constraint topology: constrained atom pairs and their target lengths.
//!
//! Constraints are stored in arena form. Each constraint owns one
//! `(i, j, type)` triple and target lengths are shared per type, the way
//! interaction lists are laid out in MD topologies.

use crate::error::{ConstraintError, Result};
use rustc_hash::FxHashMap;

/// A constrained pair of atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomPair {
    pub i: usize,
    pub j: usize,
}

impl AtomPair {
    pub fn new(i: usize, j: usize) -> Self {
        Self { i, j }
    }
}

/// Constraint list for one topology epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintTopology {
    num_atoms: usize,
    pairs: Vec<AtomPair>,
    type_indices: Vec<usize>,
    type_lengths: Vec<f64>,
}

impl ConstraintTopology {
    /// Build a topology from pairs, per-constraint type indices and the
    /// type → length table.
    pub fn new(
        num_atoms: usize,
        pairs: Vec<AtomPair>,
        type_indices: Vec<usize>,
        type_lengths: Vec<f64>,
    ) -> Result<Self> {
        if pairs.len() != type_indices.len() {
            return Err(ConstraintError::BufferSizeMismatch {
                what: "constraint type indices",
                expected: pairs.len(),
                found: type_indices.len(),
            });
        }
        for (c, (pair, &t)) in pairs.iter().zip(&type_indices).enumerate() {
            for atom in [pair.i, pair.j] {
                if atom >= num_atoms {
                    return Err(ConstraintError::AtomIndexOutOfRange {
                        constraint: c,
                        atom,
                        num_atoms,
                    });
                }
            }
            if pair.i == pair.j {
                return Err(ConstraintError::SelfConstraint {
                    constraint: c,
                    atom: pair.i,
                });
            }
            if t >= type_lengths.len() {
                return Err(ConstraintError::UnknownConstraintType {
                    constraint: c,
                    type_index: t,
                    num_types: type_lengths.len(),
                });
            }
        }
        if let Some(&bad) = type_lengths.iter().find(|&&r0| !r0.is_finite() || r0 <= 0.0) {
            return Err(ConstraintError::InvalidParameter(format!(
                "constraint target lengths must be positive and finite, got {bad}"
            )));
        }
        Ok(Self {
            num_atoms,
            pairs,
            type_indices,
            type_lengths,
        })
    }

    /// Build from a flat interaction list of `(type, i, j)` triples.
    pub fn from_triples(num_atoms: usize, triples: &[usize], type_lengths: &[f64]) -> Result<Self> {
        if triples.len() % 3 != 0 {
            return Err(ConstraintError::InvalidParameter(format!(
                "interaction list length {} is not a multiple of 3",
                triples.len()
            )));
        }
        let (pairs, types): (Vec<_>, Vec<_>) = triples
            .chunks_exact(3)
            .map(|t| (AtomPair::new(t[1], t[2]), t[0]))
            .unzip();
        Self::new(num_atoms, pairs, types, type_lengths.to_vec())
    }

    /// Build from pairs with one length per constraint; identical lengths
    /// share a type.
    pub fn from_lengths(num_atoms: usize, pairs: Vec<AtomPair>, lengths: &[f64]) -> Result<Self> {
        if pairs.len() != lengths.len() {
            return Err(ConstraintError::BufferSizeMismatch {
                what: "constraint lengths",
                expected: pairs.len(),
                found: lengths.len(),
            });
        }
        let mut type_of_length: FxHashMap<u64, usize> = FxHashMap::default();
        let mut type_lengths = Vec::new();
        let type_indices = lengths
            .iter()
            .map(|&r0| {
                *type_of_length.entry(r0.to_bits()).or_insert_with(|| {
                    type_lengths.push(r0);
                    type_lengths.len() - 1
                })
            })
            .collect();
        Self::new(num_atoms, pairs, type_indices, type_lengths)
    }

    pub fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[AtomPair] {
        &self.pairs
    }

    #[inline]
    pub fn pair(&self, c: usize) -> AtomPair {
        self.pairs[c]
    }

    #[inline]
    pub fn target_length(&self, c: usize) -> f64 {
        self.type_lengths[self.type_indices[c]]
    }

    pub fn type_lengths(&self) -> &[f64] {
        &self.type_lengths
    }

    /// For every atom, the constraints it takes part in.
    pub fn atom_constraints(&self) -> AtomConstraintMap {
        AtomConstraintMap::build(self.num_atoms, &self.pairs)
    }

    /// Extract the constraints in `constraints` (global indices) into a new
    /// topology over `atoms` (sorted global atom indices), renumbering both.
    pub fn extract(&self, atoms: &[usize], constraints: &[usize]) -> Result<Self> {
        let old_to_new: FxHashMap<usize, usize> =
            atoms.iter().enumerate().map(|(new, &old)| (old, new)).collect();
        let mut pairs = Vec::with_capacity(constraints.len());
        let mut type_indices = Vec::with_capacity(constraints.len());
        for &c in constraints {
            let p = self.pairs[c];
            let lookup = |atom: usize| {
                old_to_new
                    .get(&atom)
                    .copied()
                    .ok_or(ConstraintError::AtomIndexOutOfRange {
                        constraint: c,
                        atom,
                        num_atoms: atoms.len(),
                    })
            };
            pairs.push(AtomPair::new(lookup(p.i)?, lookup(p.j)?));
            type_indices.push(self.type_indices[c]);
        }
        Self::new(atoms.len(), pairs, type_indices, self.type_lengths.clone())
    }
}

/// Compressed atom → constraints adjacency.
#[derive(Debug, Clone)]
pub struct AtomConstraintMap {
    offsets: Vec<usize>,
    constraints: Vec<usize>,
}

impl AtomConstraintMap {
    fn build(num_atoms: usize, pairs: &[AtomPair]) -> Self {
        let mut counts = vec![0usize; num_atoms + 1];
        for p in pairs {
            counts[p.i + 1] += 1;
            counts[p.j + 1] += 1;
        }
        for a in 0..num_atoms {
            counts[a + 1] += counts[a];
        }
        let offsets = counts;
        let mut fill = offsets.clone();
        let mut constraints = vec![0usize; offsets[num_atoms]];
        for (c, p) in pairs.iter().enumerate() {
            constraints[fill[p.i]] = c;
            fill[p.i] += 1;
            constraints[fill[p.j]] = c;
            fill[p.j] += 1;
        }
        Self {
            offsets,
            constraints,
        }
    }

    /// Constraints involving `atom`, in ascending order.
    #[inline]
    pub fn constraints_of(&self, atom: usize) -> &[usize] {
        &self.constraints[self.offsets[atom]..self.offsets[atom + 1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_triples_reads_type_then_atoms() {
        let top = ConstraintTopology::from_triples(3, &[0, 0, 1, 1, 1, 2], &[0.1, 0.2]).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top.pair(1), AtomPair::new(1, 2));
        assert!((top.target_length(1) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_from_lengths_shares_types() {
        let pairs = vec![AtomPair::new(0, 1), AtomPair::new(0, 2), AtomPair::new(1, 2)];
        let top = ConstraintTopology::from_lengths(3, pairs, &[0.1, 0.1, 0.1633]).unwrap();
        assert_eq!(top.type_lengths().len(), 2);
        assert!((top.target_length(2) - 0.1633).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            ConstraintTopology::from_triples(2, &[0, 0, 2], &[0.1]),
            Err(ConstraintError::AtomIndexOutOfRange { atom: 2, .. })
        ));
        assert!(matches!(
            ConstraintTopology::from_triples(2, &[0, 1, 1], &[0.1]),
            Err(ConstraintError::SelfConstraint { .. })
        ));
        assert!(matches!(
            ConstraintTopology::from_triples(2, &[3, 0, 1], &[0.1]),
            Err(ConstraintError::UnknownConstraintType { type_index: 3, .. })
        ));
        assert!(ConstraintTopology::from_triples(2, &[0, 0, 1], &[-0.1]).is_err());
        assert!(ConstraintTopology::from_triples(2, &[0, 0], &[0.1]).is_err());
    }

    #[test]
    fn test_atom_constraint_map_lists_all_constraints_per_atom() {
        // CH3-like star: atom 0 in all three constraints
        let top =
            ConstraintTopology::from_triples(4, &[0, 0, 1, 0, 0, 2, 0, 0, 3], &[0.1]).unwrap();
        let map = top.atom_constraints();
        assert_eq!(map.constraints_of(0), &[0, 1, 2]);
        assert_eq!(map.constraints_of(3), &[2]);
    }

    #[test]
    fn test_extract_renumbers_atoms() {
        let top = ConstraintTopology::from_triples(6, &[0, 0, 1, 0, 4, 5], &[0.1]).unwrap();
        let sub = top.extract(&[4, 5], &[1]).unwrap();
        assert_eq!(sub.num_atoms(), 2);
        assert_eq!(sub.pair(0), AtomPair::new(0, 1));
        assert!(top.extract(&[4], &[1]).is_err());
    }
}
