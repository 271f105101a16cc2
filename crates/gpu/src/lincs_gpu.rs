//! Host-side driver of the block LINCS kernel.
//!
//! [`LincsGpu::set`] lays the constraints out over device threads, one
//! coupled group per block, and uploads the per-thread tables. Each call to
//! [`LincsGpu::apply`] enqueues one kernel launch on the stream and returns;
//! only a virial request synchronizes with the host.

use crate::device::{read, AtomicF32, DeviceAtomPair, DeviceBuffer, DeviceStream};
use crate::kernel::{launch_lincs_kernel, KernelData, KernelParams};
use rcs_core::coupling::CouplingGraph;
use rcs_core::partition::BlockLayout;
use rcs_core::util::norm2;
use rcs_core::{AtomPair, ConstraintError, ConstraintTopology, LincsParams, Pbc, Result, Virial};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Parameters of the block kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuLincsParams {
    /// Threads per block; a power of two of at least 2. Default: 256.
    pub threads_per_block: usize,
    /// Number of centripetal-correction passes. Default: 1.
    pub num_iterations: usize,
    /// Order of the expansion of the coupling-matrix inverse. Default: 4.
    pub expansion_order: usize,
}

impl Default for GpuLincsParams {
    fn default() -> Self {
        Self {
            threads_per_block: 256,
            num_iterations: 1,
            expansion_order: 4,
        }
    }
}

impl From<&LincsParams> for GpuLincsParams {
    fn from(params: &LincsParams) -> Self {
        Self {
            num_iterations: params.num_iterations,
            expansion_order: params.expansion_order,
            ..Default::default()
        }
    }
}

impl GpuLincsParams {
    pub fn validate(&self) -> Result<()> {
        if self.threads_per_block < 2 || !self.threads_per_block.is_power_of_two() {
            return Err(ConstraintError::InvalidParameter(format!(
                "threads per block must be a power of two of at least 2, got {}",
                self.threads_per_block
            )));
        }
        Ok(())
    }
}

/// Whether every coupled group of `topology` fits in one block.
pub fn is_topology_supported(topology: &ConstraintTopology, threads_per_block: usize) -> Result<bool> {
    let unit_masses = vec![1.0; topology.num_atoms()];
    let graph = CouplingGraph::build(topology, &unit_masses)?;
    Ok(graph
        .coupled_groups()
        .iter()
        .all(|group| group.len() <= threads_per_block))
}

fn check_size(name: &'static str, available: usize, requested: usize) -> Result<()> {
    if available < requested {
        return Err(ConstraintError::DeviceBufferTooSmall {
            name,
            capacity: available,
            requested,
        });
    }
    Ok(())
}

fn check_host_len(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(ConstraintError::BufferSizeMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

fn to_device_vec3(values: &[[f64; 3]]) -> Vec<[f32; 3]> {
    values
        .iter()
        .map(|v| [v[0] as f32, v[1] as f32, v[2] as f32])
        .collect()
}

/// Block-parallel LINCS bound to one stream.
pub struct LincsGpu {
    params: GpuLincsParams,
    stream: Arc<DeviceStream>,
    layout: Option<BlockLayout>,
    num_atoms: usize,
    num_constraints: usize,
    max_coupled: usize,
    have_coupled: bool,
    pairs: Vec<AtomPair>,

    constraints: DeviceBuffer<DeviceAtomPair>,
    target_lengths: DeviceBuffer<f32>,
    coupled_counts: DeviceBuffer<i32>,
    coupled_indices: DeviceBuffer<i32>,
    mass_factors: DeviceBuffer<f32>,
    inverse_masses: DeviceBuffer<f32>,
    virial_scaled: DeviceBuffer<AtomicF32>,

    staging_x: DeviceBuffer<[f32; 3]>,
    staging_xp: DeviceBuffer<AtomicF32>,
    staging_v: DeviceBuffer<AtomicF32>,
}

impl LincsGpu {
    pub fn new(params: GpuLincsParams, stream: Arc<DeviceStream>) -> Result<Self> {
        params.validate()?;
        let mut virial_scaled = DeviceBuffer::new("virial");
        virial_scaled.reallocate(6);
        Ok(Self {
            params,
            stream,
            layout: None,
            num_atoms: 0,
            num_constraints: 0,
            max_coupled: 0,
            have_coupled: false,
            pairs: Vec::new(),
            constraints: DeviceBuffer::new("constraints"),
            target_lengths: DeviceBuffer::new("constraint lengths"),
            coupled_counts: DeviceBuffer::new("coupled constraint counts"),
            coupled_indices: DeviceBuffer::new("coupled constraint indices"),
            mass_factors: DeviceBuffer::new("mass factors"),
            inverse_masses: DeviceBuffer::new("inverse masses"),
            virial_scaled,
            staging_x: DeviceBuffer::new("staging positions"),
            staging_xp: DeviceBuffer::new("staging updated positions"),
            staging_v: DeviceBuffer::new("staging velocities"),
        })
    }

    pub fn params(&self) -> &GpuLincsParams {
        &self.params
    }

    pub fn stream(&self) -> &DeviceStream {
        &self.stream
    }

    /// Thread layout of the current topology, once [`set`](Self::set) ran.
    pub fn layout(&self) -> Option<&BlockLayout> {
        self.layout.as_ref()
    }

    pub fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    pub fn have_coupled_constraints(&self) -> bool {
        self.have_coupled
    }

    /// Total reallocations of the per-topology device tables.
    pub fn num_reallocations(&self) -> usize {
        self.constraints.reallocations()
            + self.target_lengths.reallocations()
            + self.coupled_counts.reallocations()
            + self.coupled_indices.reallocations()
            + self.mass_factors.reallocations()
            + self.inverse_masses.reallocations()
    }

    /// Upload a new topology epoch.
    ///
    /// Fails with [`ConstraintError::CoupledGroupTooLarge`] when a coupled
    /// group exceeds the block size.
    pub fn set(&mut self, topology: &ConstraintTopology, inverse_masses: &[f64]) -> Result<()> {
        check_host_len("inverse masses", topology.num_atoms(), inverse_masses.len())?;
        let tpb = self.params.threads_per_block;
        let graph = CouplingGraph::build(topology, inverse_masses)?;
        let groups = graph.coupled_groups();
        let layout = BlockLayout::pack(&groups, topology.len(), tpb)?;

        let num_threads = layout.num_threads();
        let max_coupled = graph.max_coupled();
        let mut pairs = vec![DeviceAtomPair::DUMMY; num_threads];
        let mut lengths = vec![0.0f32; num_threads];
        let mut counts = vec![0i32; num_threads];
        let mut indices = vec![-1i32; max_coupled * num_threads];
        let mut factors = vec![0.0f32; max_coupled * num_threads];

        for thread in 0..num_threads {
            let Some(c) = layout.constraint_of_thread(thread) else {
                continue;
            };
            let pair = topology.pair(c);
            pairs[thread] = DeviceAtomPair {
                i: pair.i as i32,
                j: pair.j as i32,
            };
            lengths[thread] = topology.target_length(c) as f32;
            let coupled = graph.coupled(c);
            counts[thread] = coupled.len() as i32;
            let block_start = thread - thread % tpb;
            for (n, (&c2, &factor)) in coupled.iter().zip(graph.mass_factors(c)).enumerate() {
                let other = layout.thread_of_constraint(c2);
                debug_assert_eq!(other - other % tpb, block_start);
                let index = n * num_threads + thread;
                indices[index] = (other - block_start) as i32;
                factors[index] = factor as f32;
            }
        }
        let inverse_masses_f32: Vec<f32> = inverse_masses.iter().map(|&m| m as f32).collect();

        self.constraints.reallocate(num_threads);
        self.target_lengths.reallocate(num_threads);
        self.coupled_counts.reallocate(num_threads);
        self.coupled_indices.reallocate(max_coupled * num_threads);
        self.mass_factors.reallocate(max_coupled * num_threads);
        self.inverse_masses.reallocate(topology.num_atoms());

        self.constraints.copy_to_device(&self.stream, pairs)?;
        self.target_lengths.copy_to_device(&self.stream, lengths)?;
        self.coupled_counts.copy_to_device(&self.stream, counts)?;
        self.coupled_indices.copy_to_device(&self.stream, indices)?;
        self.mass_factors.copy_to_device(&self.stream, factors)?;
        self.inverse_masses
            .copy_to_device(&self.stream, inverse_masses_f32)?;

        log::info!(
            "block LINCS: {} constraints in {} groups over {} blocks of {} threads ({} padding)",
            topology.len(),
            groups.len(),
            layout.num_blocks(),
            tpb,
            layout.num_dummies()
        );

        self.num_atoms = topology.num_atoms();
        self.num_constraints = topology.len();
        self.max_coupled = max_coupled;
        self.have_coupled = graph.has_couplings();
        self.pairs = topology.pairs().to_vec();
        self.layout = Some(layout);
        Ok(())
    }

    /// Enqueue one constraint step on device-resident buffers.
    ///
    /// `xp` and `v` are flat `3 * num_atoms` arrays, corrected in place.
    /// When `virial_scaled` is given the stream is synchronized and the
    /// packed device virial is added to it.
    ///
    /// Bonds of zero length in `x` are not detected here: their direction
    /// is NaN and the NaN spreads through the coupled group. The CPU solvers
    /// and [`apply_on_host`](Self::apply_on_host) report
    /// [`ConstraintError::DegenerateBond`] for the same input.
    pub fn apply(
        &self,
        x: &DeviceBuffer<[f32; 3]>,
        xp: &DeviceBuffer<AtomicF32>,
        v: Option<&DeviceBuffer<AtomicF32>>,
        invdt: f32,
        pbc: &Pbc,
        virial_scaled: Option<&mut Virial>,
    ) -> Result<()> {
        let Some(layout) = self.layout.as_ref() else {
            return Err(ConstraintError::InvalidParameter(
                "block LINCS applied before a topology was set".to_string(),
            ));
        };
        if self.num_constraints == 0 {
            return Ok(());
        }
        check_size(x.name(), x.size(), self.num_atoms)?;
        check_size(xp.name(), xp.size(), 3 * self.num_atoms)?;
        if let Some(v) = v {
            check_size(v.name(), v.size(), 3 * self.num_atoms)?;
        }

        let compute_virial = virial_scaled.is_some();
        if compute_virial {
            self.virial_scaled.clear(&self.stream)?;
        }

        let params = KernelParams {
            num_threads: layout.num_threads(),
            threads_per_block: self.params.threads_per_block,
            max_coupled: self.max_coupled,
            num_iterations: self.params.num_iterations,
            expansion_order: self.params.expansion_order,
            pbc: pbc.to_f32_params(),
            invdt,
        };
        let update_velocities = v.is_some();
        let have_coupled = self.have_coupled;

        let constraints = self.constraints.shared();
        let target_lengths = self.target_lengths.shared();
        let coupled_counts = self.coupled_counts.shared();
        let coupled_indices = self.coupled_indices.shared();
        let mass_factors = self.mass_factors.shared();
        let inverse_masses = self.inverse_masses.shared();
        let x = x.shared();
        let xp = xp.shared();
        let v = v.map(DeviceBuffer::shared);
        let virial = self.virial_scaled.shared();

        self.stream.enqueue(move || {
            let constraints = read(&constraints);
            let target_lengths = read(&target_lengths);
            let coupled_counts = read(&coupled_counts);
            let coupled_indices = read(&coupled_indices);
            let mass_factors = read(&mass_factors);
            let inverse_masses = read(&inverse_masses);
            let x = read(&x);
            let xp = read(&xp);
            let v = v.as_deref().map(read);
            let virial = read(&virial);
            let data = KernelData {
                constraints: &constraints,
                target_lengths: &target_lengths,
                coupled_counts: &coupled_counts,
                coupled_indices: &coupled_indices,
                mass_factors: &mass_factors,
                inverse_masses: &inverse_masses,
                x: &x,
                xp: &xp,
                v: v.as_deref().map_or(&[][..], Vec::as_slice),
                virial: &virial,
            };
            launch_lincs_kernel(update_velocities, compute_virial, have_coupled, &params, &data);
        })?;

        if let Some(virial_scaled) = virial_scaled {
            let device = self.virial_scaled.copy_from_device(&self.stream, 6)?;
            let mut packed = [0.0f64; 6];
            for (dst, src) in packed.iter_mut().zip(device) {
                *dst = f64::from(src);
            }
            *virial_scaled += Virial::from_packed(packed);
        }
        Ok(())
    }

    /// Constrain host arrays through the staging buffers.
    ///
    /// Corrections are added back as differences, so coordinates the kernel
    /// does not touch keep their double precision.
    pub fn apply_on_host(
        &mut self,
        x: &[[f64; 3]],
        xprime: &mut [[f64; 3]],
        v: Option<&mut [[f64; 3]]>,
        invdt: f64,
        pbc: &Pbc,
        virial_scaled: Option<&mut Virial>,
    ) -> Result<()> {
        let n = self.num_atoms;
        check_host_len("positions", n, x.len())?;
        check_host_len("updated positions", n, xprime.len())?;
        if let Some(v) = v.as_deref() {
            check_host_len("velocities", n, v.len())?;
        }
        for (c, p) in self.pairs.iter().enumerate() {
            if norm2(&pbc.dx_aiuc(&x[p.i], &x[p.j])) == 0.0 {
                return Err(ConstraintError::DegenerateBond {
                    constraint: c,
                    atom_i: p.i,
                    atom_j: p.j,
                });
            }
        }

        let xp_before = to_device_vec3(xprime);
        let xp_flat: Vec<f32> = bytemuck::cast_slice::<[f32; 3], f32>(&xp_before).to_vec();
        self.staging_x.reallocate(n);
        self.staging_xp.reallocate(3 * n);
        self.staging_x.copy_to_device(&self.stream, to_device_vec3(x))?;
        self.staging_xp.copy_to_device(&self.stream, xp_flat)?;

        let v_before = match v.as_deref() {
            Some(v) => {
                let v_before = to_device_vec3(v);
                self.staging_v.reallocate(3 * n);
                self.staging_v.copy_to_device(
                    &self.stream,
                    bytemuck::cast_slice::<[f32; 3], f32>(&v_before).to_vec(),
                )?;
                Some(v_before)
            }
            None => None,
        };

        self.apply(
            &self.staging_x,
            &self.staging_xp,
            v_before.as_ref().map(|_| &self.staging_v),
            invdt as f32,
            pbc,
            virial_scaled,
        )?;

        let xp_after = self.staging_xp.copy_from_device(&self.stream, 3 * n)?;
        add_difference(xprime, &xp_before, bytemuck::cast_slice(&xp_after));
        if let (Some(v), Some(v_before)) = (v, v_before) {
            let v_after = self.staging_v.copy_from_device(&self.stream, 3 * n)?;
            add_difference(v, &v_before, bytemuck::cast_slice(&v_after));
        }
        Ok(())
    }
}

fn add_difference(target: &mut [[f64; 3]], before: &[[f32; 3]], after: &[[f32; 3]]) {
    for ((t, b), a) in target.iter_mut().zip(before).zip(after) {
        for d in 0..3 {
            t[d] += f64::from(a[d] - b[d]);
        }
    }
}

impl std::fmt::Debug for LincsGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LincsGpu")
            .field("params", &self.params)
            .field("num_atoms", &self.num_atoms)
            .field("num_constraints", &self.num_constraints)
            .field("have_coupled", &self.have_coupled)
            .finish()
    }
}
