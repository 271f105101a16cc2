//! Constrain a synthetic water box with every solver and compare.
//!
//! Runs one step of SHAKE, CPU LINCS and the block kernel on the same
//! unconstrained positions and prints the remaining deviation, the number of
//! solver iterations and the scaled virial.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example water_box_constraints -- \
//!     --per-side 12 \
//!     --config lincs.json
//! ```
//!
//! `lincs.json` is an optional `LincsParams` document, e.g.
//! `{"num_iterations": 2, "expansion_order": 6, "num_tasks": 8}`.

use rcs_core::analysis::deviation_stats;
use rcs_core::test_systems::water_box;
use rcs_core::util::inverse_masses;
use rcs_core::{Lincs, LincsParams, Shake, ShakeParams, Virial};
use rcs_gpu::{DeviceContext, GpuLincsParams, LincsGpu};
use std::sync::Arc;
use std::time::Instant;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // -------------------------------------------------------------------------
    // 1. Parse command-line arguments
    // -------------------------------------------------------------------------
    let args: Vec<String> = std::env::args().collect();
    let (per_side, config_path) = parse_args(&args);

    let lincs_params: LincsParams = match &config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path).expect("Failed to read config");
            serde_json::from_str(&text).expect("Failed to parse LINCS parameters")
        }
        None => LincsParams::default(),
    };
    lincs_params.validate().expect("Invalid LINCS parameters");

    // -------------------------------------------------------------------------
    // 2. Build the system
    // -------------------------------------------------------------------------
    let system = water_box(per_side, 2024).expect("Failed to build water box");
    let inv = inverse_masses(&system.masses);
    let invdt = 1.0 / system.dt;
    println!("Water box constraint comparison");
    println!("===============================");
    println!(
        "{} waters, {} atoms, {} constraints",
        per_side.pow(3),
        system.topology.num_atoms(),
        system.topology.len()
    );
    let before = deviation_stats(&system.topology, &system.xprime, &system.pbc);
    println!("Unconstrained: rms {:.3e}, max {:.3e}", before.rms, before.max);
    println!();

    // -------------------------------------------------------------------------
    // 3. SHAKE
    // -------------------------------------------------------------------------
    let mut shake = Shake::new(ShakeParams {
        tolerance: 1e-6,
        ..Default::default()
    })
    .expect("Invalid SHAKE parameters");
    shake.set_topology(&system.topology, &inv).expect("SHAKE setup failed");
    let mut xprime = system.xprime.clone();
    let mut v = system.v.clone();
    let mut virial = Virial::zero();
    let start = Instant::now();
    let report = shake
        .apply(&system.x, &mut xprime, Some(&mut v), invdt, &system.pbc, Some(&mut virial))
        .expect("SHAKE failed");
    let elapsed = start.elapsed();
    let stats = deviation_stats(&system.topology, &xprime, &system.pbc);
    println!(
        "SHAKE:       {:>4} iterations, rms {:.3e}, max {:.3e}, {:?}",
        report.iterations, stats.rms, stats.max, elapsed
    );
    print_virial(&virial);

    // -------------------------------------------------------------------------
    // 4. CPU LINCS
    // -------------------------------------------------------------------------
    let mut lincs = Lincs::new(lincs_params.clone()).expect("Invalid LINCS parameters");
    lincs.set_topology(&system.topology, &inv).expect("LINCS setup failed");
    let radius = lincs
        .coupling_spectral_radius(&system.x, &system.pbc)
        .expect("Spectral radius failed");
    let mut xprime = system.xprime.clone();
    let mut v = system.v.clone();
    let mut virial = Virial::zero();
    let start = Instant::now();
    let report = lincs
        .apply(&system.x, &mut xprime, Some(&mut v), invdt, &system.pbc, Some(&mut virial))
        .expect("LINCS failed");
    let elapsed = start.elapsed();
    println!(
        "LINCS:       {} tasks, coupling radius {:.3}, rms {:.3e}, max {:.3e}, {:?}",
        lincs.num_tasks(),
        radius,
        report.rms_deviation,
        report.max_deviation,
        elapsed
    );
    print_virial(&virial);

    // -------------------------------------------------------------------------
    // 5. Block kernel
    // -------------------------------------------------------------------------
    let context = DeviceContext::new();
    let stream = Arc::new(context.create_stream("constraints").expect("No device stream"));
    let mut gpu = LincsGpu::new(GpuLincsParams::from(&lincs_params), stream)
        .expect("Invalid block LINCS parameters");
    gpu.set(&system.topology, &inv).expect("Block LINCS setup failed");
    let mut xprime = system.xprime.clone();
    let mut v = system.v.clone();
    let mut virial = Virial::zero();
    let start = Instant::now();
    gpu.apply_on_host(&system.x, &mut xprime, Some(&mut v), invdt, &system.pbc, Some(&mut virial))
        .expect("Block LINCS failed");
    let elapsed = start.elapsed();
    let stats = deviation_stats(&system.topology, &xprime, &system.pbc);
    println!(
        "Block LINCS: {} compute units, rms {:.3e}, max {:.3e}, {:?}",
        context.num_compute_units(),
        stats.rms,
        stats.max,
        elapsed
    );
    print_virial(&virial);
}

fn print_virial(virial: &Virial) {
    for row in virial.matrix() {
        println!("    [{:>12.5e} {:>12.5e} {:>12.5e}]", row[0], row[1], row[2]);
    }
}

fn parse_args(args: &[String]) -> (usize, Option<String>) {
    let mut per_side = 10;
    let mut config = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--per-side" => {
                i += 1;
                per_side = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .expect("--per-side needs a positive integer");
            }
            "--config" => {
                i += 1;
                config = args.get(i).cloned();
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
        i += 1;
    }
    (per_side, config)
}
