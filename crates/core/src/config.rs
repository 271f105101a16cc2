//! Solver parameters.
//!
//! All parameter structs implement `Default` with the customary MD values and
//! derive serde traits with `#[serde(default)]`, so partial JSON documents
//! are accepted.

use crate::error::{ConstraintError, Result};
use serde::{Deserialize, Serialize};

/// LINCS parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LincsParams {
    /// Number of centripetal-correction passes. Default: 1.
    pub num_iterations: usize,
    /// Order of the truncated expansion of the coupling-matrix inverse. Default: 4.
    pub expansion_order: usize,
    /// Bond rotation (degrees) above which a warning is reported. Default: 30.
    pub warn_angle_degrees: f64,
    /// Number of independent tasks the constraints are split into. Default: 1.
    pub num_tasks: usize,
}

impl Default for LincsParams {
    fn default() -> Self {
        Self {
            num_iterations: 1,
            expansion_order: 4,
            warn_angle_degrees: 30.0,
            num_tasks: 1,
        }
    }
}

impl LincsParams {
    pub fn validate(&self) -> Result<()> {
        if self.warn_angle_degrees.is_nan()
            || self.warn_angle_degrees <= 0.0
            || self.warn_angle_degrees > 90.0
        {
            return Err(ConstraintError::InvalidParameter(format!(
                "LINCS warning angle must be in (0, 90] degrees, got {}",
                self.warn_angle_degrees
            )));
        }
        if self.num_tasks == 0 {
            return Err(ConstraintError::InvalidParameter(
                "LINCS needs at least one task".to_string(),
            ));
        }
        Ok(())
    }
}

/// SHAKE parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShakeParams {
    /// Relative tolerance on the constraint lengths. Default: 1e-4.
    pub tolerance: f64,
    /// Iteration budget per step. Default: 1000.
    pub max_iterations: usize,
    /// Adapt the relaxation factor between steps. Default: false.
    pub use_sor: bool,
    /// (Initial) successive over-relaxation factor. Default: 1.0.
    pub relaxation: f64,
    /// Number of independent tasks the constraints are split into. Default: 1.
    pub num_tasks: usize,
}

impl Default for ShakeParams {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            max_iterations: 1000,
            use_sor: false,
            relaxation: 1.0,
            num_tasks: 1,
        }
    }
}

impl ShakeParams {
    pub fn validate(&self) -> Result<()> {
        if self.tolerance.is_nan() || self.tolerance <= 0.0 {
            return Err(ConstraintError::InvalidParameter(format!(
                "SHAKE tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(ConstraintError::InvalidParameter(
                "SHAKE needs at least one iteration".to_string(),
            ));
        }
        if self.relaxation.is_nan() || self.relaxation <= 0.0 || self.relaxation >= 2.0 {
            return Err(ConstraintError::InvalidParameter(format!(
                "SHAKE relaxation factor must be in (0, 2), got {}",
                self.relaxation
            )));
        }
        if self.num_tasks == 0 {
            return Err(ConstraintError::InvalidParameter(
                "SHAKE needs at least one task".to_string(),
            ));
        }
        Ok(())
    }
}

/// Constraint algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Lincs,
    Shake,
}

/// Full constraint configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    pub algorithm: Algorithm,
    pub lincs: LincsParams,
    pub shake: ShakeParams,
}

impl ConstraintConfig {
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            Algorithm::Lincs => self.lincs.validate(),
            Algorithm::Shake => self.shake.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ConstraintConfig::default();
        assert_eq!(cfg.algorithm, Algorithm::Lincs);
        assert_eq!(cfg.lincs.expansion_order, 4);
        assert!(cfg.validate().is_ok());
        assert!(cfg.shake.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: ConstraintConfig =
            serde_json::from_str(r#"{"algorithm": "shake", "shake": {"tolerance": 1e-6}}"#).unwrap();
        assert_eq!(cfg.algorithm, Algorithm::Shake);
        assert_eq!(cfg.shake.tolerance, 1e-6);
        assert_eq!(cfg.shake.max_iterations, 1000);
        assert_eq!(cfg.lincs.num_iterations, 1);
    }

    #[test]
    fn test_rejects_bad_values() {
        let shake = ShakeParams {
            relaxation: 2.5,
            ..Default::default()
        };
        assert!(shake.validate().is_err());
        let lincs = LincsParams {
            warn_angle_degrees: 0.0,
            ..Default::default()
        };
        assert!(lincs.validate().is_err());
    }
}
