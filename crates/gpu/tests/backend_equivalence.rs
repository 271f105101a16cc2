//! The block kernel against the CPU solvers on the reference systems and on
//! synthetic water.

use approx::assert_abs_diff_eq;
use rcs_core::analysis::{center_of_mass, center_of_mass_velocity, deviation_stats};
use rcs_core::test_systems::{reference_pbcs, reference_systems, water_box, REFERENCE_TIMESTEP};
use rcs_core::util::{dot, inverse_masses, norm};
use rcs_core::{Lincs, LincsParams, Pbc, Shake, Virial};
use rcs_gpu::{AtomicF32, DeviceBuffer, DeviceContext, GpuLincsParams, LincsGpu};
use std::sync::Arc;

fn block_lincs(params: GpuLincsParams) -> LincsGpu {
    let context = DeviceContext::new();
    let stream = context.create_stream("constraints").unwrap();
    LincsGpu::new(params, Arc::new(stream)).unwrap()
}

#[test]
fn test_block_kernel_satisfies_reference_systems() {
    for system in reference_systems() {
        for pbc in reference_pbcs().unwrap() {
            for threads_per_block in [4, 256] {
                let ctx = format!("{} / {:?} / {threads_per_block}", system.title, pbc.pbc_type());
                let topology = system.topology().unwrap();
                let inv = inverse_masses(&system.masses);
                let mut lincs = block_lincs(GpuLincsParams {
                    threads_per_block,
                    ..GpuLincsParams::from(&system.lincs)
                });
                lincs.set(&topology, &inv).unwrap();

                let mut xprime = system.xprime.clone();
                let mut v = system.v.clone();
                let mut virial = Virial::zero();
                lincs
                    .apply_on_host(
                        &system.x,
                        &mut xprime,
                        Some(&mut v),
                        1.0 / REFERENCE_TIMESTEP,
                        &pbc,
                        Some(&mut virial),
                    )
                    .unwrap();

                let tol = system.tolerances;
                for (c, p) in topology.pairs().iter().enumerate() {
                    let before = pbc.dx_aiuc(&system.x[p.i], &system.x[p.j]);
                    let after = pbc.dx_aiuc(&xprime[p.i], &xprime[p.j]);
                    let r0 = topology.target_length(c);
                    assert!(
                        (norm(&after) - r0).abs() <= tol.length,
                        "{ctx}: constraint {c} has length {}",
                        norm(&after)
                    );
                    assert!(dot(&before, &after) >= 0.0, "{ctx}: constraint {c} flipped");
                }

                let com_before = center_of_mass(&system.masses, &system.xprime);
                let com_after = center_of_mass(&system.masses, &xprime);
                let vcom_before = center_of_mass_velocity(&system.masses, &system.v);
                let vcom_after = center_of_mass_velocity(&system.masses, &v);
                for d in 0..3 {
                    assert_abs_diff_eq!(com_before[d], com_after[d], epsilon = tol.com);
                    assert_abs_diff_eq!(vcom_before[d], vcom_after[d], epsilon = tol.com);
                }

                assert!(virial.is_symmetric(1e-12), "{ctx}");
                let diff = virial.max_abs_diff(&system.virial);
                assert!(diff <= tol.virial, "{ctx}: virial differs by {diff:.3e}");
            }
        }
    }
}

#[test]
fn test_block_kernel_agrees_with_cpu_solvers() {
    for system in reference_systems() {
        let pbc = Pbc::none();
        let topology = system.topology().unwrap();
        let inv = inverse_masses(&system.masses);
        let invdt = 1.0 / REFERENCE_TIMESTEP;

        let mut cpu = Lincs::new(system.lincs.clone()).unwrap();
        cpu.set_topology(&topology, &inv).unwrap();
        let mut cpu_xprime = system.xprime.clone();
        let mut cpu_virial = Virial::zero();
        cpu.apply(&system.x, &mut cpu_xprime, None, invdt, &pbc, Some(&mut cpu_virial))
            .unwrap();

        let mut shake = Shake::new(system.shake.clone()).unwrap();
        shake.set_topology(&topology, &inv).unwrap();
        let mut shake_xprime = system.xprime.clone();
        shake
            .apply(&system.x, &mut shake_xprime, None, invdt, &pbc, None)
            .unwrap();

        let mut gpu = block_lincs(GpuLincsParams::from(&system.lincs));
        gpu.set(&topology, &inv).unwrap();
        let mut gpu_xprime = system.xprime.clone();
        let mut gpu_virial = Virial::zero();
        gpu.apply_on_host(&system.x, &mut gpu_xprime, None, invdt, &pbc, Some(&mut gpu_virial))
            .unwrap();

        for a in 0..system.num_atoms() {
            for d in 0..3 {
                assert_abs_diff_eq!(gpu_xprime[a][d], cpu_xprime[a][d], epsilon = 1e-5);
                assert_abs_diff_eq!(gpu_xprime[a][d], shake_xprime[a][d], epsilon = 2e-3);
            }
        }
        assert!(
            gpu_virial.max_abs_diff(&cpu_virial) < 1e-5,
            "{}: {gpu_virial:?} vs {cpu_virial:?}",
            system.title
        );
    }
}

#[test]
fn test_water_box_on_device_buffers() {
    let system = water_box(4, 5).unwrap();
    let n = system.topology.num_atoms();
    let inv = inverse_masses(&system.masses);
    let params = LincsParams {
        num_iterations: 2,
        expansion_order: 8,
        ..Default::default()
    };

    let mut cpu = Lincs::new(params.clone()).unwrap();
    cpu.set_topology(&system.topology, &inv).unwrap();
    let mut cpu_xprime = system.xprime.clone();
    let mut cpu_v = system.v.clone();
    cpu.apply(
        &system.x,
        &mut cpu_xprime,
        Some(&mut cpu_v),
        1.0 / system.dt,
        &system.pbc,
        None,
    )
    .unwrap();

    let context = DeviceContext::new();
    let stream = Arc::new(context.create_stream("update").unwrap());
    let mut gpu = LincsGpu::new(
        GpuLincsParams {
            threads_per_block: 64,
            ..GpuLincsParams::from(&params)
        },
        Arc::clone(&stream),
    )
    .unwrap();
    gpu.set(&system.topology, &inv).unwrap();
    let layout = gpu.layout().unwrap();
    // 21 waters per block of 64 threads, so 64 waters need four blocks
    assert_eq!(layout.num_blocks(), 4);
    assert_eq!(layout.num_dummies(), 4 * 64 - 192);
    assert!(gpu.have_coupled_constraints());

    let flat = |values: &[[f64; 3]]| -> Vec<f32> {
        values.iter().flatten().map(|&c| c as f32).collect()
    };
    let mut d_x: DeviceBuffer<[f32; 3]> = DeviceBuffer::new("x");
    let mut d_xp: DeviceBuffer<AtomicF32> = DeviceBuffer::new("xp");
    let mut d_v: DeviceBuffer<AtomicF32> = DeviceBuffer::new("v");
    d_x.reallocate(n);
    d_xp.reallocate(3 * n);
    d_v.reallocate(3 * n);
    d_x.copy_to_device(
        &stream,
        system.x.iter().map(|p| [p[0] as f32, p[1] as f32, p[2] as f32]).collect(),
    )
    .unwrap();
    d_xp.copy_to_device(&stream, flat(&system.xprime)).unwrap();
    d_v.copy_to_device(&stream, flat(&system.v)).unwrap();

    gpu.apply(&d_x, &d_xp, Some(&d_v), (1.0 / system.dt) as f32, &system.pbc, None)
        .unwrap();
    let done = stream.record_event().unwrap();
    done.wait();

    let xp = d_xp.copy_from_device(&stream, 3 * n).unwrap();
    let v = d_v.copy_from_device(&stream, 3 * n).unwrap();
    let gpu_xprime: Vec<[f64; 3]> = xp
        .chunks_exact(3)
        .map(|c| [f64::from(c[0]), f64::from(c[1]), f64::from(c[2])])
        .collect();

    let stats = deviation_stats(&system.topology, &gpu_xprime, &system.pbc);
    assert!(stats.max < 1e-3, "max relative deviation {}", stats.max);
    for a in 0..n {
        for d in 0..3 {
            assert_abs_diff_eq!(gpu_xprime[a][d], cpu_xprime[a][d], epsilon = 2e-5);
            assert_abs_diff_eq!(f64::from(v[3 * a + d]), cpu_v[a][d], epsilon = 1e-2);
        }
    }
}

#[test]
fn test_repeated_topologies_reuse_device_tables() {
    let small = water_box(2, 1).unwrap();
    let large = water_box(3, 1).unwrap();
    let mut gpu = block_lincs(GpuLincsParams {
        num_iterations: 2,
        expansion_order: 8,
        ..Default::default()
    });

    gpu.set(&large.topology, &inverse_masses(&large.masses)).unwrap();
    let grown = gpu.num_reallocations();
    gpu.set(&small.topology, &inverse_masses(&small.masses)).unwrap();
    gpu.set(&large.topology, &inverse_masses(&large.masses)).unwrap();
    assert_eq!(gpu.num_reallocations(), grown);

    let mut xprime = large.xprime.clone();
    gpu.apply_on_host(&large.x, &mut xprime, None, 1.0, &large.pbc, None)
        .unwrap();
    let stats = deviation_stats(&large.topology, &xprime, &large.pbc);
    assert!(stats.max < 1e-3, "max relative deviation {}", stats.max);
}
