#![allow(clippy::useless_conversion)]
#![allow(clippy::too_many_arguments)]

use ndarray::Array2;
use numpy::{PyArray2, PyReadonlyArray1, PyReadonlyArray2, ToPyArray};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use rcs_core::analysis::deviation_stats;
use rcs_core::util::inverse_masses;
use rcs_core::{
    Algorithm, ConstrainStep, ConstraintConfig, ConstraintError, ConstraintTopology, Constraints,
    Lincs, LincsParams, LincsReport, Pbc, PbcType, Shake, ShakeParams, SolverReport, Virial,
};
use rcs_gpu::{DeviceContext, GpuLincsParams, LincsGpu};
use std::sync::Arc;

// ============================================================================
// Helpers
// ============================================================================

fn to_py_err(err: ConstraintError) -> PyErr {
    match err {
        ConstraintError::ShakeNotConverged { .. } | ConstraintError::StreamClosed => {
            PyRuntimeError::new_err(err.to_string())
        }
        _ => PyValueError::new_err(err.to_string()),
    }
}

fn array2_to_coords(arr: &ndarray::ArrayView2<f64>, what: &str) -> PyResult<Vec<[f64; 3]>> {
    if arr.ncols() != 3 {
        return Err(PyValueError::new_err(format!(
            "{what} must have shape (n, 3), got {:?}",
            arr.shape()
        )));
    }
    Ok((0..arr.nrows())
        .map(|i| [arr[[i, 0]], arr[[i, 1]], arr[[i, 2]]])
        .collect())
}

fn coords_to_array2(coords: &[[f64; 3]]) -> Array2<f64> {
    let mut result = Array2::<f64>::zeros((coords.len(), 3));
    for (i, c) in coords.iter().enumerate() {
        result[[i, 0]] = c[0];
        result[[i, 1]] = c[1];
        result[[i, 2]] = c[2];
    }
    result
}

/// Topology from an `(m, 2)` array of atom pairs and `m` target lengths.
fn build_topology(
    num_atoms: usize,
    pairs: &PyReadonlyArray2<'_, i64>,
    lengths: &PyReadonlyArray1<'_, f64>,
) -> PyResult<ConstraintTopology> {
    let pairs = pairs.as_array();
    if pairs.ncols() != 2 {
        return Err(PyValueError::new_err(format!(
            "constraints must have shape (m, 2), got {:?}",
            pairs.shape()
        )));
    }
    let mut atom_pairs = Vec::with_capacity(pairs.nrows());
    for row in pairs.rows() {
        if row[0] < 0 || row[1] < 0 {
            return Err(PyValueError::new_err("constraint atom indices must be non-negative"));
        }
        atom_pairs.push(rcs_core::AtomPair::new(row[0] as usize, row[1] as usize));
    }
    let lengths: Vec<f64> = lengths.as_array().iter().copied().collect();
    ConstraintTopology::from_lengths(num_atoms, atom_pairs, &lengths).map_err(to_py_err)
}

fn build_pbc(box_vectors: Option<PyReadonlyArray2<'_, f64>>, pbc: &str) -> PyResult<Pbc> {
    let pbc_type = match pbc {
        "none" => PbcType::None,
        "xyz" => PbcType::Xyz,
        "xy" => PbcType::Xy,
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown pbc '{other}', expected 'none', 'xyz' or 'xy'"
            )))
        }
    };
    let Some(box_vectors) = box_vectors else {
        if pbc_type != PbcType::None {
            return Err(PyValueError::new_err("periodic boundaries need box_vectors"));
        }
        return Ok(Pbc::none());
    };
    let rows = array2_to_coords(&box_vectors.as_array(), "box_vectors")?;
    if rows.len() != 3 {
        return Err(PyValueError::new_err("box_vectors must have shape (3, 3)"));
    }
    Pbc::new(pbc_type, [rows[0], rows[1], rows[2]]).map_err(to_py_err)
}

struct StepInput {
    masses: Vec<f64>,
    topology: ConstraintTopology,
    x: Vec<[f64; 3]>,
    xprime: Vec<[f64; 3]>,
    v: Option<Vec<[f64; 3]>>,
    pbc: Pbc,
}

fn step_input(
    x: PyReadonlyArray2<'_, f64>,
    xprime: PyReadonlyArray2<'_, f64>,
    masses: PyReadonlyArray1<'_, f64>,
    constraints: PyReadonlyArray2<'_, i64>,
    lengths: PyReadonlyArray1<'_, f64>,
    v: Option<PyReadonlyArray2<'_, f64>>,
    box_vectors: Option<PyReadonlyArray2<'_, f64>>,
    pbc: &str,
) -> PyResult<StepInput> {
    let masses: Vec<f64> = masses.as_array().iter().copied().collect();
    let topology = build_topology(masses.len(), &constraints, &lengths)?;
    Ok(StepInput {
        masses,
        topology,
        x: array2_to_coords(&x.as_array(), "x")?,
        xprime: array2_to_coords(&xprime.as_array(), "xprime")?,
        v: v.map(|v| array2_to_coords(&v.as_array(), "v")).transpose()?,
        pbc: build_pbc(box_vectors, pbc)?,
    })
}

fn step_result<'py>(
    py: Python<'py>,
    xprime: &[[f64; 3]],
    v: Option<&[[f64; 3]]>,
    virial: Option<&Virial>,
) -> PyResult<Bound<'py, PyDict>> {
    let result = PyDict::new_bound(py);
    result.set_item("xprime", coords_to_array2(xprime).to_pyarray_bound(py))?;
    if let Some(v) = v {
        result.set_item("v", coords_to_array2(v).to_pyarray_bound(py))?;
    }
    if let Some(virial) = virial {
        let rows: Vec<[f64; 3]> = virial.matrix().to_vec();
        result.set_item("virial", coords_to_array2(&rows).to_pyarray_bound(py))?;
    }
    Ok(result)
}

fn add_lincs_report(result: &Bound<'_, PyDict>, report: &LincsReport) -> PyResult<()> {
    result.set_item("num_warnings", report.num_warnings)?;
    result.set_item("worst_constraint", report.worst_constraint)?;
    result.set_item("max_angle_degrees", report.max_angle_degrees)?;
    result.set_item("rms_deviation", report.rms_deviation)?;
    result.set_item("max_deviation", report.max_deviation)?;
    Ok(())
}

// ============================================================================
// ONE-SHOT SOLVERS
// ============================================================================

#[pyfunction]
#[pyo3(signature = (x, xprime, masses, constraints, lengths, v=None, dt=0.002, box_vectors=None, pbc="none", compute_virial=true, num_iterations=1, expansion_order=4, warn_angle_degrees=30.0, num_tasks=1))]
fn constrain_lincs<'py>(
    py: Python<'py>,
    x: PyReadonlyArray2<'py, f64>,
    xprime: PyReadonlyArray2<'py, f64>,
    masses: PyReadonlyArray1<'py, f64>,
    constraints: PyReadonlyArray2<'py, i64>,
    lengths: PyReadonlyArray1<'py, f64>,
    v: Option<PyReadonlyArray2<'py, f64>>,
    dt: f64,
    box_vectors: Option<PyReadonlyArray2<'py, f64>>,
    pbc: &str,
    compute_virial: bool,
    num_iterations: usize,
    expansion_order: usize,
    warn_angle_degrees: f64,
    num_tasks: usize,
) -> PyResult<Bound<'py, PyDict>> {
    let mut input = step_input(x, xprime, masses, constraints, lengths, v, box_vectors, pbc)?;
    let mut lincs = Lincs::new(LincsParams {
        num_iterations,
        expansion_order,
        warn_angle_degrees,
        num_tasks,
    })
    .map_err(to_py_err)?;
    lincs
        .set_topology(&input.topology, &inverse_masses(&input.masses))
        .map_err(to_py_err)?;

    let mut virial = compute_virial.then(Virial::zero);
    let report = py
        .allow_threads(|| {
            lincs.apply(
                &input.x,
                &mut input.xprime,
                input.v.as_deref_mut(),
                1.0 / dt,
                &input.pbc,
                virial.as_mut(),
            )
        })
        .map_err(to_py_err)?;

    let result = step_result(py, &input.xprime, input.v.as_deref(), virial.as_ref())?;
    add_lincs_report(&result, &report)?;
    Ok(result)
}

#[pyfunction]
#[pyo3(signature = (x, xprime, masses, constraints, lengths, v=None, dt=0.002, box_vectors=None, pbc="none", compute_virial=true, tolerance=1e-4, max_iterations=1000, num_tasks=1))]
fn constrain_shake<'py>(
    py: Python<'py>,
    x: PyReadonlyArray2<'py, f64>,
    xprime: PyReadonlyArray2<'py, f64>,
    masses: PyReadonlyArray1<'py, f64>,
    constraints: PyReadonlyArray2<'py, i64>,
    lengths: PyReadonlyArray1<'py, f64>,
    v: Option<PyReadonlyArray2<'py, f64>>,
    dt: f64,
    box_vectors: Option<PyReadonlyArray2<'py, f64>>,
    pbc: &str,
    compute_virial: bool,
    tolerance: f64,
    max_iterations: usize,
    num_tasks: usize,
) -> PyResult<Bound<'py, PyDict>> {
    let mut input = step_input(x, xprime, masses, constraints, lengths, v, box_vectors, pbc)?;
    let mut shake = Shake::new(ShakeParams {
        tolerance,
        max_iterations,
        num_tasks,
        ..Default::default()
    })
    .map_err(to_py_err)?;
    shake
        .set_topology(&input.topology, &inverse_masses(&input.masses))
        .map_err(to_py_err)?;

    let mut virial = compute_virial.then(Virial::zero);
    let report = py
        .allow_threads(|| {
            shake.apply(
                &input.x,
                &mut input.xprime,
                input.v.as_deref_mut(),
                1.0 / dt,
                &input.pbc,
                virial.as_mut(),
            )
        })
        .map_err(to_py_err)?;

    let result = step_result(py, &input.xprime, input.v.as_deref(), virial.as_ref())?;
    result.set_item("iterations", report.iterations)?;
    Ok(result)
}

#[pyfunction]
#[pyo3(signature = (x, xprime, masses, constraints, lengths, v=None, dt=0.002, box_vectors=None, pbc="none", compute_virial=true, num_iterations=1, expansion_order=4, threads_per_block=256))]
fn constrain_lincs_blocks<'py>(
    py: Python<'py>,
    x: PyReadonlyArray2<'py, f64>,
    xprime: PyReadonlyArray2<'py, f64>,
    masses: PyReadonlyArray1<'py, f64>,
    constraints: PyReadonlyArray2<'py, i64>,
    lengths: PyReadonlyArray1<'py, f64>,
    v: Option<PyReadonlyArray2<'py, f64>>,
    dt: f64,
    box_vectors: Option<PyReadonlyArray2<'py, f64>>,
    pbc: &str,
    compute_virial: bool,
    num_iterations: usize,
    expansion_order: usize,
    threads_per_block: usize,
) -> PyResult<Bound<'py, PyDict>> {
    let mut input = step_input(x, xprime, masses, constraints, lengths, v, box_vectors, pbc)?;
    let context = DeviceContext::new();
    let stream = context.create_stream("python").map_err(to_py_err)?;
    let mut lincs = LincsGpu::new(
        GpuLincsParams {
            threads_per_block,
            num_iterations,
            expansion_order,
        },
        Arc::new(stream),
    )
    .map_err(to_py_err)?;
    lincs
        .set(&input.topology, &inverse_masses(&input.masses))
        .map_err(to_py_err)?;
    log::debug!(
        "block LINCS from Python: {} atoms, {} constraints, {} threads per block",
        input.topology.num_atoms(),
        input.topology.len(),
        threads_per_block
    );

    let mut virial = compute_virial.then(Virial::zero);
    py.allow_threads(|| {
        lincs.apply_on_host(
            &input.x,
            &mut input.xprime,
            input.v.as_deref_mut(),
            1.0 / dt,
            &input.pbc,
            virial.as_mut(),
        )
    })
    .map_err(to_py_err)?;

    let result = step_result(py, &input.xprime, input.v.as_deref(), virial.as_ref())?;
    if let Some(layout) = lincs.layout() {
        result.set_item("num_blocks", layout.num_blocks())?;
        result.set_item("num_padding_threads", layout.num_dummies())?;
    }
    Ok(result)
}

#[pyfunction]
#[pyo3(name = "deviation_stats", signature = (positions, masses, constraints, lengths, box_vectors=None, pbc="none"))]
fn deviation_stats_py<'py>(
    py: Python<'py>,
    positions: PyReadonlyArray2<'py, f64>,
    masses: PyReadonlyArray1<'py, f64>,
    constraints: PyReadonlyArray2<'py, i64>,
    lengths: PyReadonlyArray1<'py, f64>,
    box_vectors: Option<PyReadonlyArray2<'py, f64>>,
    pbc: &str,
) -> PyResult<Bound<'py, PyDict>> {
    let num_atoms = masses.as_array().len();
    let topology = build_topology(num_atoms, &constraints, &lengths)?;
    let positions = array2_to_coords(&positions.as_array(), "positions")?;
    if positions.len() != num_atoms {
        return Err(PyValueError::new_err(format!(
            "positions has {} rows, expected {num_atoms}",
            positions.len()
        )));
    }
    let stats = deviation_stats(&topology, &positions, &build_pbc(box_vectors, pbc)?);
    let result = PyDict::new_bound(py);
    result.set_item("rms", stats.rms)?;
    result.set_item("max", stats.max)?;
    result.set_item("max_constraint", stats.max_constraint)?;
    Ok(result)
}

// ============================================================================
// STATEFUL SOLVER
// ============================================================================

/// Solver kept across steps, so SHAKE's relaxation factor adapts.
#[pyclass(name = "ConstraintSolver")]
struct PyConstraintSolver {
    inner: Constraints,
}

#[pymethods]
impl PyConstraintSolver {
    #[new]
    #[pyo3(signature = (algorithm="lincs", num_iterations=1, expansion_order=4, num_tasks=1, tolerance=1e-4, max_iterations=1000, use_sor=false))]
    fn new(
        algorithm: &str,
        num_iterations: usize,
        expansion_order: usize,
        num_tasks: usize,
        tolerance: f64,
        max_iterations: usize,
        use_sor: bool,
    ) -> PyResult<Self> {
        let algorithm = match algorithm {
            "lincs" => Algorithm::Lincs,
            "shake" => Algorithm::Shake,
            other => {
                return Err(PyValueError::new_err(format!(
                    "unknown algorithm '{other}', expected 'lincs' or 'shake'"
                )))
            }
        };
        let config = ConstraintConfig {
            algorithm,
            lincs: LincsParams {
                num_iterations,
                expansion_order,
                num_tasks,
                ..Default::default()
            },
            shake: ShakeParams {
                tolerance,
                max_iterations,
                use_sor,
                num_tasks,
                ..Default::default()
            },
        };
        let inner = Constraints::new(config).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    #[getter]
    fn algorithm(&self) -> &'static str {
        match self.inner.algorithm() {
            Algorithm::Lincs => "lincs",
            Algorithm::Shake => "shake",
        }
    }

    fn set_topology(
        &mut self,
        masses: PyReadonlyArray1<'_, f64>,
        constraints: PyReadonlyArray2<'_, i64>,
        lengths: PyReadonlyArray1<'_, f64>,
    ) -> PyResult<()> {
        let masses: Vec<f64> = masses.as_array().iter().copied().collect();
        let topology = build_topology(masses.len(), &constraints, &lengths)?;
        log::debug!(
            "ConstraintSolver({}) topology: {} atoms, {} constraints",
            self.algorithm(),
            topology.num_atoms(),
            topology.len()
        );
        self.inner.set_topology(&topology, &masses).map_err(to_py_err)
    }

    #[pyo3(signature = (x, xprime, v=None, dt=0.002, box_vectors=None, pbc="none", compute_virial=true))]
    fn apply<'py>(
        &mut self,
        py: Python<'py>,
        x: PyReadonlyArray2<'py, f64>,
        xprime: PyReadonlyArray2<'py, f64>,
        v: Option<PyReadonlyArray2<'py, f64>>,
        dt: f64,
        box_vectors: Option<PyReadonlyArray2<'py, f64>>,
        pbc: &str,
        compute_virial: bool,
    ) -> PyResult<Bound<'py, PyDict>> {
        let x = array2_to_coords(&x.as_array(), "x")?;
        let mut xprime = array2_to_coords(&xprime.as_array(), "xprime")?;
        let mut v = v.map(|v| array2_to_coords(&v.as_array(), "v")).transpose()?;
        let pbc = build_pbc(box_vectors, pbc)?;
        let mut virial = compute_virial.then(Virial::zero);

        let inner = &mut self.inner;
        let report = py
            .allow_threads(|| {
                inner.apply(ConstrainStep {
                    x: &x,
                    xprime: &mut xprime,
                    v: v.as_deref_mut(),
                    invdt: 1.0 / dt,
                    pbc: &pbc,
                    virial: virial.as_mut(),
                })
            })
            .map_err(to_py_err)?;

        let result = step_result(py, &xprime, v.as_deref(), virial.as_ref())?;
        match report {
            SolverReport::Lincs(report) => add_lincs_report(&result, &report)?,
            SolverReport::Shake(report) => {
                result.set_item("iterations", report.iterations)?;
                result.set_item("omega", report.omega)?;
            }
        }
        Ok(result)
    }
}

/// Convert a scaled virial into the constraint contribution to the pressure
/// virial for time step `dt`.
#[pyfunction]
fn constraint_virial<'py>(
    py: Python<'py>,
    virial_scaled: PyReadonlyArray2<'py, f64>,
    dt: f64,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let rows = array2_to_coords(&virial_scaled.as_array(), "virial_scaled")?;
    if rows.len() != 3 {
        return Err(PyValueError::new_err("virial_scaled must have shape (3, 3)"));
    }
    let physical = Virial([rows[0], rows[1], rows[2]]).to_constraint_virial(dt);
    Ok(coords_to_array2(&physical).to_pyarray_bound(py))
}

// ============================================================================
// MODULE DEFINITION
// ============================================================================

#[pymodule]
fn rust_constraint_solvers(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // One-shot solvers
    m.add_function(wrap_pyfunction!(constrain_lincs, m)?)?;
    m.add_function(wrap_pyfunction!(constrain_shake, m)?)?;
    m.add_function(wrap_pyfunction!(constrain_lincs_blocks, m)?)?;

    // Analysis
    m.add_function(wrap_pyfunction!(deviation_stats_py, m)?)?;
    m.add_function(wrap_pyfunction!(constraint_virial, m)?)?;

    // Stateful solver
    m.add_class::<PyConstraintSolver>()?;

    Ok(())
}
