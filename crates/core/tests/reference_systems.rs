//! Constrained reference systems checked with every CPU solver under every
//! periodic boundary mode.

use approx::assert_abs_diff_eq;
use rcs_core::analysis::{center_of_mass, center_of_mass_velocity, deviation_stats};
use rcs_core::test_systems::{
    alkane_chains, reference_pbcs, reference_systems, water_box, ReferenceSystem,
    REFERENCE_TIMESTEP,
};
use rcs_core::util::{dot, inverse_masses, norm};
use rcs_core::{
    AtomPair, ConstraintTopology, Lincs, LincsParams, Pbc, PbcType, Shake, ShakeParams, Virial,
};

#[derive(Debug, Clone, Copy)]
enum Runner {
    Shake,
    Lincs,
    LincsTasks,
    ShakeTasks,
}

const RUNNERS: [Runner; 4] = [Runner::Shake, Runner::Lincs, Runner::LincsTasks, Runner::ShakeTasks];

struct Outcome {
    xprime: Vec<[f64; 3]>,
    v: Vec<[f64; 3]>,
    virial: Virial,
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run(system: &ReferenceSystem, pbc: &Pbc, runner: Runner) -> Outcome {
    let topology = system.topology().unwrap();
    let inv = inverse_masses(&system.masses);
    let mut xprime = system.xprime.clone();
    let mut v = system.v.clone();
    let mut virial = Virial::zero();
    let invdt = 1.0 / REFERENCE_TIMESTEP;

    match runner {
        Runner::Shake | Runner::ShakeTasks => {
            let num_tasks = if matches!(runner, Runner::ShakeTasks) { 4 } else { 1 };
            let mut shake = Shake::new(ShakeParams {
                num_tasks,
                ..system.shake.clone()
            })
            .unwrap();
            shake.set_topology(&topology, &inv).unwrap();
            shake
                .apply(&system.x, &mut xprime, Some(&mut v), invdt, pbc, Some(&mut virial))
                .unwrap();
        }
        Runner::Lincs | Runner::LincsTasks => {
            let num_tasks = if matches!(runner, Runner::LincsTasks) { 4 } else { 1 };
            let mut lincs = Lincs::new(LincsParams {
                num_tasks,
                ..system.lincs.clone()
            })
            .unwrap();
            lincs.set_topology(&topology, &inv).unwrap();
            lincs
                .apply(&system.x, &mut xprime, Some(&mut v), invdt, pbc, Some(&mut virial))
                .unwrap();
        }
    }
    Outcome { xprime, v, virial }
}

fn check(system: &ReferenceSystem, pbc: &Pbc, runner: Runner, out: &Outcome) {
    let ctx = format!("{} / {:?} / {:?}", system.title, pbc.pbc_type(), runner);
    let topology = system.topology().unwrap();
    let tol = system.tolerances;

    for (c, p) in topology.pairs().iter().enumerate() {
        let before = pbc.dx_aiuc(&system.x[p.i], &system.x[p.j]);
        let after = pbc.dx_aiuc(&out.xprime[p.i], &out.xprime[p.j]);
        let r0 = topology.target_length(c);
        assert!(
            (norm(&after) - r0).abs() <= tol.length,
            "{ctx}: constraint {c} has length {} instead of {r0}",
            norm(&after)
        );
        assert!(dot(&before, &after) >= 0.0, "{ctx}: constraint {c} flipped direction");
    }

    let com_before = center_of_mass(&system.masses, &system.xprime);
    let com_after = center_of_mass(&system.masses, &out.xprime);
    let vcom_before = center_of_mass_velocity(&system.masses, &system.v);
    let vcom_after = center_of_mass_velocity(&system.masses, &out.v);
    for d in 0..3 {
        assert_abs_diff_eq!(com_before[d], com_after[d], epsilon = tol.com);
        assert_abs_diff_eq!(vcom_before[d], vcom_after[d], epsilon = tol.com);
    }

    assert!(out.virial.is_symmetric(1e-12), "{ctx}: virial is not symmetric");
    let diff = out.virial.max_abs_diff(&system.virial);
    assert!(
        diff <= tol.virial,
        "{ctx}: virial {:?} differs from reference {:?} by {diff:.3e}",
        out.virial,
        system.virial
    );
}

#[test]
fn test_all_solvers_satisfy_reference_systems() {
    init_logging();
    for system in reference_systems() {
        for pbc in reference_pbcs().unwrap() {
            for runner in RUNNERS {
                let out = run(&system, &pbc, runner);
                check(&system, &pbc, runner, &out);
            }
        }
    }
}

#[test]
fn test_solvers_agree_with_each_other() {
    for system in reference_systems() {
        let pbc = Pbc::none();
        let shake = run(&system, &pbc, Runner::Shake);
        let lincs = run(&system, &pbc, Runner::Lincs);
        let tasks = run(&system, &pbc, Runner::LincsTasks);
        for a in 0..system.num_atoms() {
            for d in 0..3 {
                // both converge to nearby points on the constraint surface
                assert_abs_diff_eq!(shake.xprime[a][d], lincs.xprime[a][d], epsilon = 2e-3);
                assert_abs_diff_eq!(lincs.xprime[a][d], tasks.xprime[a][d], epsilon = 1e-12);
            }
        }
        assert!(lincs.virial.max_abs_diff(&tasks.virial) < 1e-12);
    }
}

/// Odd atoms are moved to a periodic image, so every constraint crosses the
/// box and only the minimum image recovers the bond.
#[test]
fn test_periodic_images_are_solved_like_open_systems() {
    init_logging();
    let triclinic = Pbc::new(
        PbcType::Xyz,
        [[3.0, 0.0, 0.0], [1.0, 2.5, 0.0], [0.5, 0.7, 2.8]],
    )
    .unwrap();
    let slab = Pbc::new(
        PbcType::Xy,
        [[3.0, 0.0, 0.0], [-1.2, 2.5, 0.0], [0.0, 0.0, 0.0]],
    )
    .unwrap();

    for pbc in [triclinic, slab] {
        let b = pbc.box_vectors();
        let shift = match pbc.pbc_type() {
            PbcType::Xy => [b[0][0] + b[1][0], b[1][1], 0.0],
            _ => [b[0][0] + b[2][0], b[2][1], b[2][2]],
        };
        for system in reference_systems() {
            let mut imaged = system.clone();
            for a in (1..system.num_atoms()).step_by(2) {
                for d in 0..3 {
                    imaged.x[a][d] += shift[d];
                    imaged.xprime[a][d] += shift[d];
                }
            }

            for runner in RUNNERS {
                let out = run(&imaged, &pbc, runner);
                check(&imaged, &pbc, runner, &out);
            }

            let open = run(&system, &Pbc::none(), Runner::Lincs);
            let wrapped = run(&imaged, &pbc, Runner::Lincs);
            for a in 0..system.num_atoms() {
                for d in 0..3 {
                    assert_abs_diff_eq!(
                        wrapped.xprime[a][d] - imaged.xprime[a][d],
                        open.xprime[a][d] - system.xprime[a][d],
                        epsilon = 1e-9
                    );
                    assert_abs_diff_eq!(wrapped.v[a][d], open.v[a][d], epsilon = 1e-6);
                }
            }
            assert!(wrapped.virial.max_abs_diff(&open.virial) < 1e-9);
        }
    }
}

#[test]
fn test_oh_bond_scenario() {
    let system = &reference_systems()[0];
    let out = run(system, &Pbc::none(), Runner::Lincs);
    let d = norm(&rcs_core::util::sub(&out.xprime[0], &out.xprime[1]));
    assert_abs_diff_eq!(d, 0.1, epsilon = 2e-4);
    let expected = [[-5.58e-4, 5.58e-4, 0.0], [5.58e-4, -5.58e-4, 0.0], [0.0, 0.0, 0.0]];
    for i in 0..3 {
        for j in 0..3 {
            assert_abs_diff_eq!(out.virial.0[i][j], expected[i][j], epsilon = 1e-4);
        }
    }
}

/// Disjoint pairs have no coupling, so each pair is solved exactly by the
/// first projection whatever the expansion order.
#[test]
fn test_disjoint_pairs_match_single_pair_solves() {
    let masses = [1.0, 4.0, 2.0, 3.0, 16.0, 1.0];
    let inv = inverse_masses(&masses);
    let pairs = vec![AtomPair::new(0, 1), AtomPair::new(2, 3), AtomPair::new(4, 5)];
    let lengths = [0.1, 0.15, 0.12];
    let topology = ConstraintTopology::from_lengths(6, pairs.clone(), &lengths).unwrap();
    let x = vec![
        [0.0, 0.0, 0.0],
        [0.1, 0.0, 0.0],
        [1.0, 1.0, 1.0],
        [1.0, 1.15, 1.0],
        [2.0, 0.0, 0.0],
        [2.0, 0.0, 0.12],
    ];
    let xprime = vec![
        [0.002, -0.003, 0.001],
        [0.104, 0.004, -0.002],
        [1.003, 0.998, 1.001],
        [0.996, 1.162, 1.004],
        [2.001, 0.002, -0.001],
        [1.995, 0.003, 0.118],
    ];

    let solve = |order: usize, top: &ConstraintTopology, inv: &[f64], x: &[[f64; 3]], xp: &mut [[f64; 3]]| {
        let mut lincs = Lincs::new(LincsParams {
            num_iterations: 0,
            expansion_order: order,
            ..Default::default()
        })
        .unwrap();
        lincs.set_topology(top, inv).unwrap();
        lincs.apply(x, xp, None, 1.0, &Pbc::none(), None).unwrap();
    };

    let mut low = xprime.clone();
    let mut high = xprime.clone();
    solve(1, &topology, &inv, &x, &mut low);
    solve(8, &topology, &inv, &x, &mut high);
    assert_eq!(low, high);

    for (c, p) in pairs.iter().enumerate() {
        let single = ConstraintTopology::from_lengths(2, vec![AtomPair::new(0, 1)], &[lengths[c]]).unwrap();
        let local_inv = [inv[p.i], inv[p.j]];
        let local_x = [x[p.i], x[p.j]];
        let mut local_xp = [xprime[p.i], xprime[p.j]];
        solve(4, &single, &local_inv, &local_x, &mut local_xp);
        assert_eq!(local_xp[0], low[p.i]);
        assert_eq!(local_xp[1], low[p.j]);

        // closed form: move along r by mu * (r . dx' - r0)
        let dx = rcs_core::util::sub(&x[p.i], &x[p.j]);
        let r = rcs_core::util::scale(&dx, 1.0 / norm(&dx));
        let dxp = rcs_core::util::sub(&xprime[p.i], &xprime[p.j]);
        let mu = 1.0 / (inv[p.i] + inv[p.j]);
        let lambda = mu * (dot(&r, &dxp) - lengths[c]);
        for d in 0..3 {
            assert_abs_diff_eq!(low[p.i][d], xprime[p.i][d] - r[d] * lambda * inv[p.i], epsilon = 1e-14);
            assert_abs_diff_eq!(low[p.j][d], xprime[p.j][d] + r[d] * lambda * inv[p.j], epsilon = 1e-14);
        }
    }
}

#[test]
fn test_water_box_with_tasks() {
    let system = water_box(4, 11).unwrap();
    let inv = inverse_masses(&system.masses);
    let params = LincsParams {
        num_iterations: 4,
        expansion_order: 12,
        ..Default::default()
    };

    let mut single = Lincs::new(params.clone()).unwrap();
    single.set_topology(&system.topology, &inv).unwrap();
    let mut multi = Lincs::new(LincsParams {
        num_tasks: 8,
        ..params
    })
    .unwrap();
    multi.set_topology(&system.topology, &inv).unwrap();
    assert_eq!(multi.num_tasks(), 8);

    let radius = single.coupling_spectral_radius(&system.x, &system.pbc).unwrap();
    assert!(radius > 0.5 && radius < 1.0, "radius {radius}");

    let mut a = system.xprime.clone();
    let mut b = system.xprime.clone();
    let mut va = Virial::zero();
    let mut vb = Virial::zero();
    let report = single
        .apply(&system.x, &mut a, None, 1.0 / system.dt, &system.pbc, Some(&mut va))
        .unwrap();
    multi
        .apply(&system.x, &mut b, None, 1.0 / system.dt, &system.pbc, Some(&mut vb))
        .unwrap();
    assert_eq!(report.num_warnings, 0);
    assert!(report.max_deviation < 1e-4, "max deviation {}", report.max_deviation);
    assert_eq!(a, b);
    assert!(va.max_abs_diff(&vb) < 1e-12);
}

#[test]
fn test_shake_on_alkanes() {
    let system = alkane_chains(6, 8, 3).unwrap();
    let inv = inverse_masses(&system.masses);
    let mut shake = Shake::new(ShakeParams {
        tolerance: 1e-8,
        num_tasks: 3,
        ..Default::default()
    })
    .unwrap();
    shake.set_topology(&system.topology, &inv).unwrap();
    let mut xprime = system.xprime.clone();
    shake
        .apply(&system.x, &mut xprime, None, 1.0, &system.pbc, None)
        .unwrap();
    let stats = deviation_stats(&system.topology, &xprime, &system.pbc);
    assert!(stats.max < 1e-7, "max deviation {}", stats.max);
}
