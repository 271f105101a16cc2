//! Periodic boundary conditions and minimum-image displacements.
//!
//! Uses the "atom in unit cell" approximation: both atoms are assumed to lie
//! within (or close to) the same unit cell, so a single shift per box vector
//! is enough. Shifts are applied along z, then y, then x so that triclinic
//! (lower-triangular) boxes are handled.

use crate::error::{ConstraintError, Result};
use crate::util::sub;
use serde::{Deserialize, Serialize};

/// Which dimensions are periodic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PbcType {
    /// No periodicity; displacements are plain differences.
    None,
    /// Periodic in all three dimensions.
    Xyz,
    /// Periodic in x and y only (slab systems).
    Xy,
}

/// Box description for minimum-image displacement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pbc {
    pbc_type: PbcType,
    /// Box vectors as rows, lower-triangular.
    box_vectors: [[f64; 3]; 3],
    inv_box_diag: [f64; 3],
}

impl Default for Pbc {
    fn default() -> Self {
        Self::none()
    }
}

impl Pbc {
    /// No periodic boundaries.
    pub fn none() -> Self {
        Self {
            pbc_type: PbcType::None,
            box_vectors: [[0.0; 3]; 3],
            inv_box_diag: [0.0; 3],
        }
    }

    /// Rectangular box periodic in all dimensions.
    pub fn rectangular(lx: f64, ly: f64, lz: f64) -> Result<Self> {
        Self::new(
            PbcType::Xyz,
            [[lx, 0.0, 0.0], [0.0, ly, 0.0], [0.0, 0.0, lz]],
        )
    }

    /// Build from box vectors (rows). The box must be lower-triangular, as
    /// produced by standard MD box reduction.
    pub fn new(pbc_type: PbcType, box_vectors: [[f64; 3]; 3]) -> Result<Self> {
        if pbc_type == PbcType::None {
            return Ok(Self::none());
        }
        if box_vectors[0][1] != 0.0 || box_vectors[0][2] != 0.0 || box_vectors[1][2] != 0.0 {
            return Err(ConstraintError::InvalidParameter(
                "box vectors must form a lower-triangular matrix".to_string(),
            ));
        }
        let periodic_dims = match pbc_type {
            PbcType::Xy => 2,
            _ => 3,
        };
        let mut inv_box_diag = [0.0; 3];
        for d in 0..periodic_dims {
            if box_vectors[d][d] <= 0.0 {
                return Err(ConstraintError::InvalidParameter(format!(
                    "box diagonal element {} must be positive, got {}",
                    d, box_vectors[d][d]
                )));
            }
            inv_box_diag[d] = 1.0 / box_vectors[d][d];
        }
        Ok(Self {
            pbc_type,
            box_vectors,
            inv_box_diag,
        })
    }

    pub fn pbc_type(&self) -> PbcType {
        self.pbc_type
    }

    pub fn box_vectors(&self) -> &[[f64; 3]; 3] {
        &self.box_vectors
    }

    /// Minimum-image displacement `xi - xj`.
    #[inline]
    pub fn dx_aiuc(&self, xi: &[f64; 3], xj: &[f64; 3]) -> [f64; 3] {
        let mut dx = sub(xi, xj);
        match self.pbc_type {
            PbcType::None => {}
            PbcType::Xyz => {
                self.shift_along(&mut dx, 2);
                self.shift_along(&mut dx, 1);
                self.shift_along(&mut dx, 0);
            }
            PbcType::Xy => {
                self.shift_along(&mut dx, 1);
                self.shift_along(&mut dx, 0);
            }
        }
        dx
    }

    #[inline(always)]
    fn shift_along(&self, dx: &mut [f64; 3], dim: usize) {
        let shift = (dx[dim] * self.inv_box_diag[dim]).round();
        if shift != 0.0 {
            let bv = &self.box_vectors[dim];
            dx[0] -= shift * bv[0];
            dx[1] -= shift * bv[1];
            dx[2] -= shift * bv[2];
        }
    }

    /// Single-precision parameters for the device kernel:
    /// `[inv_diag_z, zx, zy, zz, inv_diag_y, yx, yy, inv_diag_x, xx]`,
    /// with all zeros when there is no periodicity in a dimension.
    pub fn to_f32_params(&self) -> [f32; 9] {
        let b = &self.box_vectors;
        let i = &self.inv_box_diag;
        match self.pbc_type {
            PbcType::None => [0.0; 9],
            PbcType::Xy => [
                0.0,
                0.0,
                0.0,
                0.0,
                i[1] as f32,
                b[1][0] as f32,
                b[1][1] as f32,
                i[0] as f32,
                b[0][0] as f32,
            ],
            PbcType::Xyz => [
                i[2] as f32,
                b[2][0] as f32,
                b[2][1] as f32,
                b[2][2] as f32,
                i[1] as f32,
                b[1][0] as f32,
                b[1][1] as f32,
                i[0] as f32,
                b[0][0] as f32,
            ],
        }
    }
}
