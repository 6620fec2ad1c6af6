use crate::model::Model;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Finite-difference stencil selector. The stencil fixes both the
/// perturbation multipliers and the combination formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdMethod {
    Forward,
    Backward,
    Central,
    /// 4-point stencil with smoothness weighting, for noisy models.
    Smoothing,
}

impl FdMethod {
    /// Number of extra unit evaluations per derivative.
    pub fn n_pert(self) -> usize {
        match self {
            FdMethod::Forward | FdMethod::Backward => 1,
            FdMethod::Central => 2,
            FdMethod::Smoothing => 4,
        }
    }

    /// Step multiplier for perturbation `k`, to be scaled by the signed step.
    pub(crate) fn perturbation(self, k: usize) -> f64 {
        match self {
            FdMethod::Forward | FdMethod::Backward => 1.0,
            FdMethod::Central => (2 * k) as f64 - 1.0,
            FdMethod::Smoothing => ((2 * (k / 2)) as f64 - 1.0) * (k % 2 + 1) as f64,
        }
    }
}

impl fmt::Display for FdMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FdMethod::Forward => "forward",
            FdMethod::Backward => "backward",
            FdMethod::Central => "central",
            FdMethod::Smoothing => "smoothing",
        };
        write!(f, "{name}")
    }
}

/// Sensitivity evaluation options, fixed at adapter construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DerivativeSettings {
    /// Calculate first order derivatives using the unit's directional
    /// derivative support.
    pub enable_ad: bool,
    /// Compare analytic derivatives with finite differences for validation.
    pub validate_ad: bool,
    /// Step size, scaled by nominal value.
    pub step: f64,
    /// Absolute error tolerance, scaled by nominal value.
    pub abstol: f64,
    /// Relative error tolerance.
    pub reltol: f64,
    /// Tolerance passed to the unit (0 if not defined).
    pub fmu_tolerance: f64,
    /// Target ratio of truncation error to roundoff error.
    pub error_ratio_target: f64,
    /// Number of step size refinement iterations.
    pub step_iterations: usize,
    pub step_min: f64,
    pub step_max: f64,
    pub method: FdMethod,
}

impl Default for DerivativeSettings {
    fn default() -> Self {
        Self {
            enable_ad: false,
            validate_ad: false,
            step: 1e-6,
            abstol: 1e-3,
            reltol: 1e-3,
            fmu_tolerance: 0.0,
            error_ratio_target: 100.0,
            step_iterations: 0,
            step_min: 0.0,
            step_max: f64::INFINITY,
            method: FdMethod::Forward,
        }
    }
}

impl DerivativeSettings {
    /// Defaults for a given model: analytic derivatives are enabled exactly
    /// when the unit declares support for them.
    pub fn for_model(model: &Model) -> Self {
        Self {
            enable_ad: model.provides_directional_derivative,
            ..Self::default()
        }
    }
}
