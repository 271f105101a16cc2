//! Block-parallel LINCS kernel.
//!
//! One logical thread handles one constraint. Blocks run in parallel; the
//! threads of a block are stepped through barrier-separated phases, with
//! block-shared memory (directions, right-hand sides, virial partials) held
//! in per-block arrays. Position and velocity updates go through atomic adds
//! because constraints in the same block share atoms.

use crate::device::{AtomicF32, DeviceAtomPair};
use rayon::prelude::*;

/// Launch-time scalars.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelParams {
    pub num_threads: usize,
    pub threads_per_block: usize,
    pub max_coupled: usize,
    pub num_iterations: usize,
    pub expansion_order: usize,
    pub pbc: [f32; 9],
    pub invdt: f32,
}

/// Device arrays seen by one launch. `xp` and `v` are flat `3 * num_atoms`
/// views; `virial` holds the six packed components.
pub(crate) struct KernelData<'a> {
    pub constraints: &'a [DeviceAtomPair],
    pub target_lengths: &'a [f32],
    pub coupled_counts: &'a [i32],
    pub coupled_indices: &'a [i32],
    pub mass_factors: &'a [f32],
    pub inverse_masses: &'a [f32],
    pub x: &'a [[f32; 3]],
    pub xp: &'a [AtomicF32],
    pub v: &'a [AtomicF32],
    pub virial: &'a [AtomicF32],
}

#[inline]
fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Minimum-image `xi - xj` from the packed single-precision box.
#[inline]
pub(crate) fn pbc_dx_aiuc(pbc: &[f32; 9], xi: [f32; 3], xj: [f32; 3]) -> [f32; 3] {
    let mut dx = sub(xi, xj);
    let shift_z = (dx[2] * pbc[0]).round();
    dx[0] -= shift_z * pbc[1];
    dx[1] -= shift_z * pbc[2];
    dx[2] -= shift_z * pbc[3];
    let shift_y = (dx[1] * pbc[4]).round();
    dx[0] -= shift_y * pbc[5];
    dx[1] -= shift_y * pbc[6];
    let shift_x = (dx[0] * pbc[7]).round();
    dx[0] -= shift_x * pbc[8];
    dx
}

#[inline]
fn load3(buffer: &[AtomicF32], atom: usize) -> [f32; 3] {
    [
        buffer[3 * atom].load(),
        buffer[3 * atom + 1].load(),
        buffer[3 * atom + 2].load(),
    ]
}

#[inline]
fn add3(buffer: &[AtomicF32], atom: usize, value: [f32; 3], factor: f32) {
    for d in 0..3 {
        buffer[3 * atom + d].fetch_add(value[d] * factor);
    }
}

/// Per-thread registers and block-shared memory of one block.
struct BlockState {
    pair: Vec<DeviceAtomPair>,
    target_length: Vec<f32>,
    inverse_mass_i: Vec<f32>,
    inverse_mass_j: Vec<f32>,
    sqrt_reduced_mass: Vec<f32>,
    /// Shared: normalized old bond directions.
    directions: Vec<[f32; 3]>,
    coupled_count: Vec<usize>,
    /// Block-local thread of the `n`-th coupled constraint, at
    /// `n * threads_per_block + thread`.
    coupled_local: Vec<usize>,
    /// Coupling matrix, same layout as `coupled_local`.
    matrix: Vec<f32>,
    sol: Vec<f32>,
    lagrange_scaled: Vec<f32>,
    /// Shared: two halves used alternately by the expansion.
    rhs: Vec<f32>,
}

impl BlockState {
    fn new(threads_per_block: usize, max_coupled: usize) -> Self {
        Self {
            pair: vec![DeviceAtomPair::DUMMY; threads_per_block],
            target_length: vec![0.0; threads_per_block],
            inverse_mass_i: vec![0.0; threads_per_block],
            inverse_mass_j: vec![0.0; threads_per_block],
            sqrt_reduced_mass: vec![0.0; threads_per_block],
            directions: vec![[0.0; 3]; threads_per_block],
            coupled_count: vec![0; threads_per_block],
            coupled_local: vec![0; max_coupled * threads_per_block],
            matrix: vec![0.0; max_coupled * threads_per_block],
            sol: vec![0.0; threads_per_block],
            lagrange_scaled: vec![0.0; threads_per_block],
            rhs: vec![0.0; 2 * threads_per_block],
        }
    }
}

fn lincs_block<const UPDATE_VELOCITIES: bool, const COMPUTE_VIRIAL: bool, const HAVE_COUPLED: bool>(
    block: usize,
    p: &KernelParams,
    d: &KernelData<'_>,
) {
    let tpb = p.threads_per_block;
    let first = block * tpb;
    let mut s = BlockState::new(tpb, if HAVE_COUPLED { p.max_coupled } else { 0 });

    for tib in 0..tpb {
        let pair = d.constraints[first + tib];
        s.pair[tib] = pair;
        if pair.is_dummy() {
            continue;
        }
        let (i, j) = (pair.i as usize, pair.j as usize);
        s.target_length[tib] = d.target_lengths[first + tib];
        s.inverse_mass_i[tib] = d.inverse_masses[i];
        s.inverse_mass_j[tib] = d.inverse_masses[j];
        let inv_sum = s.inverse_mass_i[tib] + s.inverse_mass_j[tib];
        s.sqrt_reduced_mass[tib] = if inv_sum > 0.0 { inv_sum.sqrt().recip() } else { 0.0 };
        let dx = pbc_dx_aiuc(&p.pbc, d.x[i], d.x[j]);
        let rlen = dot(dx, dx).sqrt().recip();
        s.directions[tib] = [dx[0] * rlen, dx[1] * rlen, dx[2] * rlen];
    }
    // barrier: directions visible to the block

    if HAVE_COUPLED {
        for tib in 0..tpb {
            let thread = first + tib;
            let count = d.coupled_counts[thread] as usize;
            s.coupled_count[tib] = count;
            for n in 0..count {
                let index = n * p.num_threads + thread;
                let c1 = d.coupled_indices[index] as usize;
                s.coupled_local[n * tpb + tib] = c1;
                s.matrix[n * tpb + tib] =
                    d.mass_factors[index] * dot(s.directions[tib], s.directions[c1]);
            }
        }
    }

    for tib in 0..tpb {
        let sol = if s.pair[tib].is_dummy() {
            0.0
        } else {
            let pair = s.pair[tib];
            let xi = load3(d.xp, pair.i as usize);
            let xj = load3(d.xp, pair.j as usize);
            let dx = pbc_dx_aiuc(&p.pbc, xi, xj);
            s.sqrt_reduced_mass[tib] * (dot(s.directions[tib], dx) - s.target_length[tib])
        };
        s.sol[tib] = sol;
        s.rhs[tib] = sol;
    }

    if HAVE_COUPLED {
        expand(&mut s, tpb, p.expansion_order);
    }

    for tib in 0..tpb {
        s.lagrange_scaled[tib] = s.sqrt_reduced_mass[tib] * s.sol[tib];
        update_positions(&s, d, tib, s.lagrange_scaled[tib]);
    }

    for _ in 0..p.num_iterations {
        // barrier: all corrections of the previous pass applied
        for tib in 0..tpb {
            let proj = if s.pair[tib].is_dummy() {
                0.0
            } else {
                let pair = s.pair[tib];
                let xi = load3(d.xp, pair.i as usize);
                let xj = load3(d.xp, pair.j as usize);
                let dx = pbc_dx_aiuc(&p.pbc, xi, xj);
                let len = s.target_length[tib];
                let dlen2 = 2.0 * len * len - dot(dx, dx);
                let corrected = if dlen2 > 0.0 { dlen2.sqrt() } else { 0.0 };
                s.sqrt_reduced_mass[tib] * (len - corrected)
            };
            s.sol[tib] = proj;
            s.rhs[tib] = proj;
        }

        if HAVE_COUPLED {
            expand(&mut s, tpb, p.expansion_order);
        }

        for tib in 0..tpb {
            let sqrtmu_sol = s.sqrt_reduced_mass[tib] * s.sol[tib];
            s.lagrange_scaled[tib] += sqrtmu_sol;
            update_positions(&s, d, tib, sqrtmu_sol);
        }
    }

    if UPDATE_VELOCITIES {
        for tib in 0..tpb {
            let pair = s.pair[tib];
            if pair.is_dummy() {
                continue;
            }
            let scaled = p.invdt * s.lagrange_scaled[tib];
            add3(d.v, pair.i as usize, s.directions[tib], -scaled * s.inverse_mass_i[tib]);
            add3(d.v, pair.j as usize, s.directions[tib], scaled * s.inverse_mass_j[tib]);
        }
    }

    if COMPUTE_VIRIAL {
        reduce_virial(&s, d, tpb);
    }
}

/// `sol += A^k rhs` for `k = 1..=expansion_order`, alternating halves of the
/// shared right-hand side so reads and writes of one pass never overlap.
fn expand(s: &mut BlockState, tpb: usize, expansion_order: usize) {
    for rec in 0..expansion_order {
        // barrier: previous half complete
        let (low, high) = s.rhs.split_at_mut(tpb);
        let (src, dst) = if rec % 2 == 0 {
            (&*low, high)
        } else {
            (&*high, low)
        };
        for tib in 0..tpb {
            let mut mvb = 0.0f32;
            for n in 0..s.coupled_count[tib] {
                let column = n * tpb + tib;
                mvb += s.matrix[column] * src[s.coupled_local[column]];
            }
            dst[tib] = mvb;
            s.sol[tib] += mvb;
        }
    }
}

fn update_positions(s: &BlockState, d: &KernelData<'_>, tib: usize, lagrange: f32) {
    let pair = s.pair[tib];
    if pair.is_dummy() {
        return;
    }
    add3(d.xp, pair.i as usize, s.directions[tib], -lagrange * s.inverse_mass_i[tib]);
    add3(d.xp, pair.j as usize, s.directions[tib], lagrange * s.inverse_mass_j[tib]);
}

/// Per-thread `r0 * lambda * r (x) r`, tree-reduced over the block and
/// accumulated atomically into the six packed components.
fn reduce_virial(s: &BlockState, d: &KernelData<'_>, tpb: usize) {
    let mut partial = vec![0.0f32; 6 * tpb];
    for tib in 0..tpb {
        let mult = s.target_length[tib] * s.lagrange_scaled[tib];
        let r = s.directions[tib];
        partial[tib] = mult * r[0] * r[0];
        partial[tpb + tib] = mult * r[0] * r[1];
        partial[2 * tpb + tib] = mult * r[0] * r[2];
        partial[3 * tpb + tib] = mult * r[1] * r[1];
        partial[4 * tpb + tib] = mult * r[1] * r[2];
        partial[5 * tpb + tib] = mult * r[2] * r[2];
    }

    let mut divide_by = 2;
    while divide_by <= tpb {
        // barrier
        let divided_at = tpb / divide_by;
        for tib in 0..divided_at {
            for component in 0..6 {
                partial[component * tpb + tib] += partial[component * tpb + tib + divided_at];
            }
        }
        divide_by *= 2;
    }

    for component in 0..6 {
        d.virial[component].fetch_add(partial[component * tpb]);
    }
}

fn lincs_kernel<const UPDATE_VELOCITIES: bool, const COMPUTE_VIRIAL: bool, const HAVE_COUPLED: bool>(
    p: &KernelParams,
    d: &KernelData<'_>,
) {
    let num_blocks = p.num_threads / p.threads_per_block;
    (0..num_blocks)
        .into_par_iter()
        .for_each(|block| lincs_block::<UPDATE_VELOCITIES, COMPUTE_VIRIAL, HAVE_COUPLED>(block, p, d));
}

/// Run the kernel specialization matching the runtime flags.
pub(crate) fn launch_lincs_kernel(
    update_velocities: bool,
    compute_virial: bool,
    have_coupled: bool,
    p: &KernelParams,
    d: &KernelData<'_>,
) {
    match (update_velocities, compute_virial, have_coupled) {
        (false, false, false) => lincs_kernel::<false, false, false>(p, d),
        (false, false, true) => lincs_kernel::<false, false, true>(p, d),
        (false, true, false) => lincs_kernel::<false, true, false>(p, d),
        (false, true, true) => lincs_kernel::<false, true, true>(p, d),
        (true, false, false) => lincs_kernel::<true, false, false>(p, d),
        (true, false, true) => lincs_kernel::<true, false, true>(p, d),
        (true, true, false) => lincs_kernel::<true, true, false>(p, d),
        (true, true, true) => lincs_kernel::<true, true, true>(p, d),
    }
}
