//! In-process stand-ins for a loaded simulation unit, used across the test
//! modules. The mock keeps one value per variable, addressed by a value
//! reference equal to the variable id, and recomputes its outputs with a
//! caller-supplied closure on every read.

use crate::api::{FmiStatus, FmuBinary, FmuInstance};
use crate::error::FmuError;
use crate::model::{Model, Variable};
use crate::sensitivity::{DerivativeMismatch, ValidationSink};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Model with `n` variables named x0, x1, ... whose value references equal
/// their ids.
pub fn test_model(n: usize) -> Model {
    Model::new(
        (0..n)
            .map(|id| Variable::new(format!("x{id}"), id as u32))
            .collect(),
    )
}

type UpdateFn = dyn Fn(&mut [f64]) + Send + Sync;
type DirectionalFn = dyn Fn(&[f64], &[u32], &[u32], &[f64], &mut [f64]) + Send + Sync;

/// Fake loaded unit. The update closure recomputes the output variables from
/// the current values in place.
pub struct MockUnit {
    pub n_vars: usize,
    pub instantiations: Arc<AtomicUsize>,
    update: Arc<UpdateFn>,
    directional: Option<Arc<DirectionalFn>>,
    fail_call: Option<&'static str>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockUnit {
    pub fn new(n_vars: usize, update: impl Fn(&mut [f64]) + Send + Sync + 'static) -> Self {
        Self {
            n_vars,
            instantiations: Arc::new(AtomicUsize::new(0)),
            update: Arc::new(update),
            directional: None,
            fail_call: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Makes the named wire call fail with an error status.
    pub fn with_failure(mut self, call: &'static str) -> Self {
        self.fail_call = Some(call);
        self
    }

    /// Adds analytic directional derivative support. The closure receives
    /// the current values, the unknown and known references, the seed and
    /// the output buffer.
    pub fn with_directional(
        mut self,
        directional: impl Fn(&[f64], &[u32], &[u32], &[f64], &mut [f64]) + Send + Sync + 'static,
    ) -> Self {
        self.directional = Some(Arc::new(directional));
        self
    }

    /// Every wire call made so far, across all instances, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock call log poisoned").clone()
    }
}

impl FmuBinary for MockUnit {
    fn instantiate(&self) -> Result<Box<dyn FmuInstance>, FmuError> {
        self.calls
            .lock()
            .expect("mock call log poisoned")
            .push("instantiate".to_string());
        if self.fail_call == Some("instantiate") {
            return Err(FmuError::Instantiate("mock".to_string()));
        }
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockInstance {
            values: vec![0.0; self.n_vars],
            initialized: false,
            update: Arc::clone(&self.update),
            directional: self.directional.clone(),
            fail_call: self.fail_call,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct MockInstance {
    values: Vec<f64>,
    initialized: bool,
    update: Arc<UpdateFn>,
    directional: Option<Arc<DirectionalFn>>,
    fail_call: Option<&'static str>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockInstance {
    fn record(&self, call: &'static str) -> FmiStatus {
        self.calls
            .lock()
            .expect("mock call log poisoned")
            .push(call.to_string());
        if self.fail_call == Some(call) {
            FmiStatus::Error
        } else {
            FmiStatus::Ok
        }
    }
}

impl FmuInstance for MockInstance {
    fn setup_experiment(
        &mut self,
        _tolerance: Option<f64>,
        _start_time: f64,
        _stop_time: Option<f64>,
    ) -> FmiStatus {
        self.record("setup_experiment")
    }

    fn reset(&mut self) -> FmiStatus {
        let status = self.record("reset");
        if status.is_ok() {
            self.values.fill(0.0);
            self.initialized = false;
        }
        status
    }

    fn enter_initialization_mode(&mut self) -> FmiStatus {
        self.record("enter_initialization_mode")
    }

    fn exit_initialization_mode(&mut self) -> FmiStatus {
        let status = self.record("exit_initialization_mode");
        if status.is_ok() {
            self.initialized = true;
        }
        status
    }

    fn set_real(&mut self, refs: &[u32], values: &[f64]) -> FmiStatus {
        let status = self.record("set_real");
        if status.is_ok() {
            for (&vr, &v) in refs.iter().zip(values) {
                self.values[vr as usize] = v;
            }
        }
        status
    }

    fn get_real(&mut self, refs: &[u32], values: &mut [f64]) -> FmiStatus {
        let status = self.record("get_real");
        if !status.is_ok() {
            return status;
        }
        if !self.initialized {
            return FmiStatus::Error;
        }
        (self.update)(&mut self.values);
        for (&vr, v) in refs.iter().zip(values.iter_mut()) {
            *v = self.values[vr as usize];
        }
        FmiStatus::Ok
    }

    fn get_directional_derivative(
        &mut self,
        unknown_refs: &[u32],
        known_refs: &[u32],
        seed: &[f64],
        out: &mut [f64],
    ) -> FmiStatus {
        let status = self.record("get_directional_derivative");
        if !status.is_ok() {
            return status;
        }
        let Some(directional) = &self.directional else {
            return FmiStatus::Error;
        };
        (self.update)(&mut self.values);
        directional(&self.values, unknown_refs, known_refs, seed, out);
        FmiStatus::Ok
    }
}

/// Validation sink that keeps every diagnostic for later inspection. Clones
/// share the same store.
#[derive(Clone, Default)]
pub struct CollectSink {
    reports: Arc<Mutex<Vec<DerivativeMismatch>>>,
}

impl CollectSink {
    pub fn reports(&self) -> Vec<DerivativeMismatch> {
        self.reports.lock().expect("sink store poisoned").clone()
    }
}

impl ValidationSink for CollectSink {
    fn report(&self, mismatch: &DerivativeMismatch) {
        self.reports
            .lock()
            .expect("sink store poisoned")
            .push(mismatch.clone());
    }
}
