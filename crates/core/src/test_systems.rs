//! Small reference systems with known constrained results, and synthetic
//! systems for benchmarking.
//!
//! The reference systems carry the positions before the step, the
//! unconstrained positions after it, starting velocities and the expected
//! scaled virial for a time step of [`REFERENCE_TIMESTEP`].

use crate::config::{LincsParams, ShakeParams};
use crate::error::Result;
use crate::pbc::Pbc;
use crate::topology::{AtomPair, ConstraintTopology};
use crate::util::{norm, scale};
use crate::virial::Virial;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Time step the reference virials were computed for.
pub const REFERENCE_TIMESTEP: f64 = 0.001;

/// Absolute tolerances for checking a constrained reference system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub length: f64,
    pub com: f64,
    pub virial: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            length: 2e-4,
            com: 1e-4,
            virial: 1e-4,
        }
    }
}

/// A tiny system with a hand-checked constrained result.
#[derive(Debug, Clone)]
pub struct ReferenceSystem {
    pub title: &'static str,
    pub masses: Vec<f64>,
    /// `(type, i, j)` triples.
    pub constraints: Vec<usize>,
    /// Target length per constraint type.
    pub lengths: Vec<f64>,
    pub x: Vec<[f64; 3]>,
    pub xprime: Vec<[f64; 3]>,
    pub v: Vec<[f64; 3]>,
    pub virial: Virial,
    pub lincs: LincsParams,
    pub shake: ShakeParams,
    pub tolerances: Tolerances,
}

impl ReferenceSystem {
    pub fn num_atoms(&self) -> usize {
        self.masses.len()
    }

    pub fn topology(&self) -> Result<ConstraintTopology> {
        ConstraintTopology::from_triples(self.num_atoms(), &self.constraints, &self.lengths)
    }
}

fn sym(d: [f64; 3], xy: f64, xz: f64, yz: f64) -> Virial {
    Virial([[d[0], xy, xz], [xy, d[1], yz], [xz, yz, d[2]]])
}

/// Periodic boundary modes every reference system is checked under.
pub fn reference_pbcs() -> Result<Vec<Pbc>> {
    Ok(vec![Pbc::none(), Pbc::rectangular(10.0, 20.0, 15.0)?])
}

/// The six reference systems: OH bond, two disjoint bonds, CH2, a 4-atom
/// chain, CH3 and a rigid triangle.
pub fn reference_systems() -> Vec<ReferenceSystem> {
    let s2 = 0.1 / 2f64.sqrt();
    let s3 = 0.2 / 3f64.sqrt();
    let base = |title: &'static str| ReferenceSystem {
        title,
        masses: Vec::new(),
        constraints: Vec::new(),
        lengths: Vec::new(),
        x: Vec::new(),
        xprime: Vec::new(),
        v: Vec::new(),
        virial: Virial::zero(),
        lincs: LincsParams::default(),
        shake: ShakeParams::default(),
        tolerances: Tolerances::default(),
    };
    let chain_x = vec![
        [2.50, -3.10, 15.70],
        [0.51, -3.02, 15.55],
        [-0.50, -3.00, 15.20],
        [-1.51, -2.95, 15.05],
    ];

    vec![
        ReferenceSystem {
            masses: vec![1.0, 12.0],
            constraints: vec![0, 0, 1],
            lengths: vec![0.1],
            x: vec![[0.0, s2, 0.0], [s2, 0.0, 0.0]],
            xprime: vec![[0.01, 0.08, 0.01], [0.06, 0.01, -0.01]],
            v: vec![[1.0, 2.0, 3.0], [3.0, 2.0, 1.0]],
            virial: sym([-5.58e-4, -5.58e-4, 0.0], 5.58e-4, 0.0, 0.0),
            ..base("one constraint (OH)")
        },
        ReferenceSystem {
            masses: vec![0.5, 1.0 / 3.0, 0.25, 1.0],
            constraints: vec![0, 0, 1, 1, 2, 3],
            lengths: vec![2.0, 1.0],
            x: chain_x.clone(),
            xprime: chain_x.clone(),
            v: vec![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]],
            virial: sym([3.3e-3, 8.9e-6, 8.9e-5], -1.7e-4, 5.6e-4, -2.8e-5),
            ..base("two disjoint constraints")
        },
        ReferenceSystem {
            masses: vec![1.0, 12.0, 16.0],
            constraints: vec![0, 0, 1, 1, 1, 2],
            lengths: vec![0.1, 0.2],
            x: vec![[s2, s2, 0.0], [0.0, 0.0, 0.0], [s3, s3, s3]],
            xprime: vec![[0.08, 0.07, 0.01], [-0.02, 0.01, -0.02], [0.10, 0.12, 0.11]],
            v: vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            virial: sym([4.14e-3, 4.14e-3, 3.31e-3], 4.14e-3, 3.31e-3, 3.31e-3),
            ..base("three atoms in a row (CH2)")
        },
        ReferenceSystem {
            masses: vec![0.5, 1.0 / 3.0, 0.25, 1.0],
            constraints: vec![0, 0, 1, 1, 1, 2, 2, 2, 3],
            lengths: vec![2.0, 1.0, 1.0],
            x: chain_x.clone(),
            xprime: chain_x,
            v: vec![[0.0, 0.0, 2.0], [0.0, 0.0, 3.0], [0.0, 0.0, -4.0], [0.0, 0.0, -1.0]],
            virial: sym([1.15e-1, 1.70e-4, 5.45e-3], -4.20e-3, 2.12e-2, -6.41e-4),
            lincs: LincsParams {
                num_iterations: 4,
                expansion_order: 8,
                ..Default::default()
            },
            tolerances: Tolerances {
                virial: 0.01,
                ..Default::default()
            },
            ..base("four atoms in a row")
        },
        ReferenceSystem {
            masses: vec![12.0, 1.0, 1.0, 1.0],
            constraints: vec![0, 0, 1, 0, 0, 2, 0, 0, 3],
            lengths: vec![0.1],
            x: vec![[0.0, 0.0, 0.0], [0.1, 0.0, 0.0], [0.0, -0.1, 0.0], [0.0, 0.0, 0.1]],
            xprime: vec![
                [0.004, 0.009, -0.010],
                [0.110, -0.006, 0.003],
                [-0.007, -0.102, -0.007],
                [-0.005, 0.011, 0.102],
            ],
            v: vec![[1.0, 0.0, 0.0]; 4],
            virial: sym([7.14e-4, 1.08e-3, 1.15e-3], 0.0, 0.0, 0.0),
            ..base("three atoms bonded to a center (CH3)")
        },
        ReferenceSystem {
            masses: vec![1.0, 1.0, 1.0],
            constraints: vec![0, 0, 1, 2, 0, 2, 1, 1, 2],
            lengths: vec![0.1, 0.1, 0.1],
            x: vec![[s2, 0.0, 0.0], [0.0, s2, 0.0], [0.0, 0.0, s2]],
            xprime: vec![[0.09, -0.02, 0.01], [-0.02, 0.10, -0.02], [0.03, -0.01, 0.07]],
            v: vec![[1.0, 1.0, 1.0], [-2.0, -2.0, -2.0], [1.0, 1.0, 1.0]],
            virial: sym([6.00e-4, 2.53e-3, -8.05e-5], -1.61e-3, 1.01e-3, -9.25e-4),
            ..base("rigid triangle")
        },
    ]
}

/// A generated system with unconstrained trial positions `x + v * dt`.
#[derive(Debug, Clone)]
pub struct SyntheticSystem {
    pub topology: ConstraintTopology,
    pub masses: Vec<f64>,
    pub x: Vec<[f64; 3]>,
    pub xprime: Vec<[f64; 3]>,
    pub v: Vec<[f64; 3]>,
    pub pbc: Pbc,
    pub dt: f64,
}

const MASS_O: f64 = 15.999;
const MASS_H: f64 = 1.008;
const MASS_C: f64 = 12.011;

fn random_unit(rng: &mut StdRng) -> [f64; 3] {
    loop {
        let v = [
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        ];
        let n = norm(&v);
        if n > 1e-3 && n <= 1.0 {
            return scale(&v, 1.0 / n);
        }
    }
}

fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Finish a system by drawing thermal-ish velocities and advancing
/// positions by one unconstrained step.
fn finish(
    topology: ConstraintTopology,
    masses: Vec<f64>,
    x: Vec<[f64; 3]>,
    pbc: Pbc,
    dt: f64,
    rng: &mut StdRng,
) -> SyntheticSystem {
    let v: Vec<[f64; 3]> = masses
        .iter()
        .map(|&m| {
            let sigma = (2.5 / m).sqrt();
            [
                rng.gen_range(-sigma..sigma),
                rng.gen_range(-sigma..sigma),
                rng.gen_range(-sigma..sigma),
            ]
        })
        .collect();
    let xprime = x
        .iter()
        .zip(&v)
        .map(|(p, vel)| [p[0] + vel[0] * dt, p[1] + vel[1] * dt, p[2] + vel[2] * dt])
        .collect();
    SyntheticSystem {
        topology,
        masses,
        x,
        xprime,
        v,
        pbc,
        dt,
    }
}

/// Rigid waters (three constraints each) on a cubic lattice of
/// `per_side³` molecules in a periodic box.
pub fn water_box(per_side: usize, seed: u64) -> Result<SyntheticSystem> {
    const SPACING: f64 = 0.31;
    const D_OH: f64 = 0.1;
    const D_HH: f64 = 0.1633;
    let mut rng = StdRng::seed_from_u64(seed);
    let half_angle = (0.5 * D_HH / D_OH).asin();

    let n_mol = per_side.pow(3);
    let mut x = Vec::with_capacity(3 * n_mol);
    let mut masses = Vec::with_capacity(3 * n_mol);
    let mut pairs = Vec::with_capacity(3 * n_mol);
    let mut lengths = Vec::with_capacity(3 * n_mol);
    for ix in 0..per_side {
        for iy in 0..per_side {
            for iz in 0..per_side {
                let o = [
                    (ix as f64 + 0.5) * SPACING,
                    (iy as f64 + 0.5) * SPACING,
                    (iz as f64 + 0.5) * SPACING,
                ];
                let axis = random_unit(&mut rng);
                let mut perp = cross(&axis, &random_unit(&mut rng));
                while norm(&perp) < 1e-3 {
                    perp = cross(&axis, &random_unit(&mut rng));
                }
                let perp = scale(&perp, 1.0 / norm(&perp));
                let (s, c) = half_angle.sin_cos();
                let h = |sign: f64| {
                    [
                        o[0] + D_OH * (c * axis[0] + sign * s * perp[0]),
                        o[1] + D_OH * (c * axis[1] + sign * s * perp[1]),
                        o[2] + D_OH * (c * axis[2] + sign * s * perp[2]),
                    ]
                };
                let first = x.len();
                x.extend([o, h(1.0), h(-1.0)]);
                masses.extend([MASS_O, MASS_H, MASS_H]);
                pairs.extend([
                    AtomPair::new(first, first + 1),
                    AtomPair::new(first, first + 2),
                    AtomPair::new(first + 1, first + 2),
                ]);
                lengths.extend([D_OH, D_OH, D_HH]);
            }
        }
    }
    let side = per_side as f64 * SPACING;
    let topology = ConstraintTopology::from_lengths(x.len(), pairs, &lengths)?;
    let pbc = Pbc::rectangular(side, side, side)?;
    Ok(finish(topology, masses, x, pbc, 0.002, &mut rng))
}

/// United-hydrogen alkane chains: a zig-zag carbon backbone with two
/// constrained hydrogens per carbon and constrained C-C bonds.
pub fn alkane_chains(num_chains: usize, carbons_per_chain: usize, seed: u64) -> Result<SyntheticSystem> {
    const D_CC: f64 = 0.153;
    const D_CH: f64 = 0.109;
    const CHAIN_SPACING: f64 = 0.5;
    let mut rng = StdRng::seed_from_u64(seed);
    let half_zig = (111.0f64.to_radians() * 0.5).sin();
    let step_x = D_CC * half_zig;
    let step_y = D_CC * (1.0 - half_zig * half_zig).sqrt();

    let grid = (num_chains as f64).sqrt().ceil().max(1.0) as usize;
    let mut x = Vec::new();
    let mut masses = Vec::new();
    let mut pairs = Vec::new();
    let mut lengths = Vec::new();
    for chain in 0..num_chains {
        let y0 = (chain % grid) as f64 * CHAIN_SPACING;
        let z0 = (chain / grid) as f64 * CHAIN_SPACING;
        let mut prev_carbon = None;
        for k in 0..carbons_per_chain {
            let up = if k % 2 == 0 { 0.0 } else { 1.0 };
            let carbon = [k as f64 * step_x, y0 + up * step_y, z0];
            let c_index = x.len();
            x.push(carbon);
            masses.push(MASS_C);
            if let Some(prev) = prev_carbon {
                pairs.push(AtomPair::new(prev, c_index));
                lengths.push(D_CC);
            }
            prev_carbon = Some(c_index);

            let outward = if k % 2 == 0 { -1.0 } else { 1.0 };
            for side in [-1.0, 1.0] {
                let dir = [0.0, outward * 0.577, side * 0.817];
                let dir = scale(&dir, 1.0 / norm(&dir));
                let h_index = x.len();
                x.push([
                    carbon[0] + D_CH * dir[0],
                    carbon[1] + D_CH * dir[1],
                    carbon[2] + D_CH * dir[2],
                ]);
                masses.push(MASS_H);
                pairs.push(AtomPair::new(c_index, h_index));
                lengths.push(D_CH);
            }
        }
    }
    let topology = ConstraintTopology::from_lengths(x.len(), pairs, &lengths)?;
    Ok(finish(topology, masses, x, Pbc::none(), 0.002, &mut rng))
}
