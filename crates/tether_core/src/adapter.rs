//! Public facade tying the pool, the evaluation protocol and the sensitivity
//! machinery together behind three calls: values, Jacobians, adjoints.
//!
//! The adapter itself is immutable after construction and shared freely
//! across threads; every call leases a slot from the pool, runs against it
//! and returns it, so concurrent calls proceed on distinct instances.

use crate::api::FmuBinary;
use crate::config::DerivativeSettings;
use crate::error::FmuError;
use crate::jacobian::{assemble, AssembleMode, JacobianLayout};
use crate::model::{IoBinding, Model};
use crate::pool::{InstancePool, Slot, SlotLease};
use crate::protocol;
use crate::sensitivity::{LogSink, ValidationSink};
use anyhow::{ensure, Result};
use nalgebra::DMatrix;

pub struct FmuAdapter {
    binary: Box<dyn FmuBinary>,
    model: Model,
    inputs: Vec<IoBinding>,
    outputs: Vec<IoBinding>,
    layout: JacobianLayout,
    settings: DerivativeSettings,
    pool: InstancePool,
    sink: Box<dyn ValidationSink>,
}

impl FmuAdapter {
    /// Validates the whole configuration up front; anything that would make
    /// a later evaluation meaningless is rejected here.
    pub fn new(
        binary: Box<dyn FmuBinary>,
        model: Model,
        inputs: Vec<IoBinding>,
        outputs: Vec<IoBinding>,
        layout: JacobianLayout,
        settings: DerivativeSettings,
    ) -> Result<Self> {
        ensure!(
            settings.step.is_finite() && settings.step > 0.0,
            "step must be positive and finite, got {}",
            settings.step
        );
        ensure!(settings.abstol > 0.0, "abstol must be positive");
        ensure!(settings.reltol > 0.0, "reltol must be positive");
        ensure!(
            settings.error_ratio_target > 0.0,
            "error ratio target must be positive"
        );
        ensure!(
            settings.step_min >= 0.0 && settings.step_min <= settings.step_max,
            "step bounds [{}, {}] are not a valid range",
            settings.step_min,
            settings.step_max
        );
        ensure!(
            !settings.enable_ad || model.provides_directional_derivative,
            "analytic derivatives requested but the unit does not provide them"
        );
        ensure!(
            !settings.validate_ad || settings.enable_ad,
            "derivative validation requires analytic derivatives"
        );
        for binding in inputs.iter().chain(outputs.iter()) {
            for &id in &binding.ids {
                ensure!(
                    id < model.n_vars(),
                    "binding '{}' references variable {id}, model has {}",
                    binding.name,
                    model.n_vars()
                );
            }
        }
        ensure!(
            layout.n_cols() == inputs.iter().map(|b| b.ids.len()).sum::<usize>()
                && layout.n_rows() == outputs.iter().map(|b| b.ids.len()).sum::<usize>(),
            "sparsity layout does not match the bindings"
        );
        for var in &model.variables {
            ensure!(
                var.nominal.is_finite() && var.nominal != 0.0,
                "variable '{}' has unusable nominal value {}",
                var.name,
                var.nominal
            );
        }

        let n_vars = model.n_vars();
        Ok(Self {
            binary,
            model,
            inputs,
            outputs,
            layout,
            settings,
            pool: InstancePool::new(n_vars),
            sink: Box::new(LogSink),
        })
    }

    pub fn with_validation_sink(mut self, sink: Box<dyn ValidationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn settings(&self) -> &DerivativeSettings {
        &self.settings
    }

    /// Evaluates the outputs at the given inputs, one slice per binding.
    pub fn eval(&self, inputs: &[&[f64]]) -> Result<Vec<Vec<f64>>, FmuError> {
        self.with_lease(|slot| {
            self.stage_inputs(slot, inputs)?;
            for out in &self.outputs {
                for &id in &out.ids {
                    slot.request(id, None);
                }
            }
            protocol::evaluate(slot, &self.model, &self.settings)?;
            Ok(self
                .outputs
                .iter()
                .map(|out| out.ids.iter().map(|&id| slot.value(id)).collect())
                .collect())
        })
    }

    /// Evaluates the Jacobian at the given inputs, one dense block per
    /// (output binding, input binding) pair. Entries outside the sparsity
    /// pattern stay zero; entries whose probes leave the variable bounds
    /// come back NaN.
    pub fn eval_jac(&self, inputs: &[&[f64]]) -> Result<Vec<Vec<DMatrix<f64>>>, FmuError> {
        self.with_lease(|slot| {
            self.stage_inputs(slot, inputs)?;
            protocol::evaluate(slot, &self.model, &self.settings)?;
            let mut jac: Vec<Vec<DMatrix<f64>>> = self
                .outputs
                .iter()
                .map(|out| {
                    self.inputs
                        .iter()
                        .map(|inp| DMatrix::zeros(out.ids.len(), inp.ids.len()))
                        .collect()
                })
                .collect();
            assemble(
                slot,
                &self.model,
                &self.settings,
                &self.inputs,
                &self.outputs,
                &self.layout,
                self.sink.as_ref(),
                AssembleMode::Jacobian(&mut jac),
            )?;
            Ok(jac)
        })
    }

    /// Evaluates the adjoint directional derivative at the given inputs:
    /// the Jacobian-transpose product with one seed slice per output
    /// binding, returned as one gradient slice per input binding.
    pub fn eval_adj(
        &self,
        inputs: &[&[f64]],
        seeds: &[&[f64]],
    ) -> Result<Vec<Vec<f64>>, FmuError> {
        if seeds.len() != self.outputs.len() {
            return Err(FmuError::BindingCount {
                expected: self.outputs.len(),
                got: seeds.len(),
            });
        }
        for (out, seed) in self.outputs.iter().zip(seeds) {
            if seed.len() != out.ids.len() {
                return Err(FmuError::BindingSize {
                    name: out.name.clone(),
                    expected: out.ids.len(),
                    got: seed.len(),
                });
            }
        }
        self.with_lease(|slot| {
            self.stage_inputs(slot, inputs)?;
            protocol::evaluate(slot, &self.model, &self.settings)?;
            let mut accum: Vec<Vec<f64>> = self
                .inputs
                .iter()
                .map(|inp| vec![0.0; inp.ids.len()])
                .collect();
            assemble(
                slot,
                &self.model,
                &self.settings,
                &self.inputs,
                &self.outputs,
                &self.layout,
                self.sink.as_ref(),
                AssembleMode::Adjoint {
                    seeds,
                    accum: &mut accum,
                },
            )?;
            Ok(accum)
        })
    }

    /// Leases a slot, runs the call, returns the slot even on failure.
    fn with_lease<T>(
        &self,
        f: impl FnOnce(&mut Slot) -> Result<T, FmuError>,
    ) -> Result<T, FmuError> {
        let mut lease: SlotLease = self.pool.checkout(self.binary.as_ref())?;
        let result = f(&mut lease.slot);
        self.pool.release(lease);
        result
    }

    fn stage_inputs(&self, slot: &mut Slot, inputs: &[&[f64]]) -> Result<(), FmuError> {
        if inputs.len() != self.inputs.len() {
            return Err(FmuError::BindingCount {
                expected: self.inputs.len(),
                got: inputs.len(),
            });
        }
        for (binding, values) in self.inputs.iter().zip(inputs) {
            if values.len() != binding.ids.len() {
                return Err(FmuError::BindingSize {
                    name: binding.name.clone(),
                    expected: binding.ids.len(),
                    got: values.len(),
                });
            }
            for (&id, &value) in binding.ids.iter().zip(*values) {
                slot.set(id, value);
            }
        }
        Ok(())
    }
}
