use serde::{Deserialize, Serialize};

/// One scalar model variable, as described by the unit's model description.
/// Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    /// Opaque handle the wire protocol uses to address this variable.
    pub value_reference: u32,
    /// Scale factor used to non-dimensionalize values and derivatives.
    pub nominal: f64,
    pub min: f64,
    pub max: f64,
}

impl Variable {
    pub fn new(name: impl Into<String>, value_reference: u32) -> Self {
        Self {
            name: name.into(),
            value_reference,
            nominal: 1.0,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        }
    }

    pub fn with_nominal(mut self, nominal: f64) -> Self {
        self.nominal = nominal;
        self
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

/// Ordered list of variable ids assigned to one named input or output slot
/// of the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoBinding {
    pub name: String,
    pub ids: Vec<usize>,
}

impl IoBinding {
    pub fn new(name: impl Into<String>, ids: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            ids,
        }
    }
}

/// Variable table plus unit capabilities, created once at adapter
/// construction and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub variables: Vec<Variable>,
    /// Whether the unit declares support for analytic directional derivatives.
    pub provides_directional_derivative: bool,
}

impl Model {
    pub fn new(variables: Vec<Variable>) -> Self {
        Self {
            variables,
            provides_directional_derivative: false,
        }
    }

    pub fn with_directional_derivative(mut self, provides: bool) -> Self {
        self.provides_directional_derivative = provides;
        self
    }

    pub fn n_vars(&self) -> usize {
        self.variables.len()
    }

    pub fn variable(&self, id: usize) -> &Variable {
        &self.variables[id]
    }
}
