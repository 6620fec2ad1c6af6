//! Dirty-state tracking on a slot: which input scalars changed and which
//! outputs are requested since the last flush, so wire calls can be batched.

use crate::error::FmuError;
use crate::model::Model;
use crate::pool::Slot;

impl Slot {
    /// Stores an input value, marking it changed only if it differs from the
    /// buffered one.
    pub fn set(&mut self, id: usize, value: f64) {
        if value != self.values[id] {
            self.values[id] = value;
            self.changed[id] = true;
        }
        self.applied[id] = true;
    }

    /// A nonzero seed is treated as an input perturbation.
    pub fn set_seed(&mut self, id: usize, value: f64) {
        if value != 0.0 {
            self.sens[id] = value;
            self.changed[id] = true;
        }
    }

    /// Marks an output as wanted, optionally recording which input column
    /// asked for it.
    pub fn request(&mut self, id: usize, wrt_id: Option<usize>) {
        self.requested[id] = true;
        if let Some(wrt_id) = wrt_id {
            self.wrt[id] = wrt_id;
        }
    }

    /// Re-marks every input the caller has ever set. Used after a reset,
    /// which returns the unit to defaults and invalidates pushed inputs.
    pub(crate) fn mark_applied(&mut self) {
        for id in 0..self.applied.len() {
            if self.applied[id] {
                self.changed[id] = true;
            }
        }
    }

    /// Compacts changed/requested marks into index lists with wire
    /// references, clearing the marks in the same pass.
    pub(crate) fn gather_io(&mut self, model: &Model) {
        self.id_in.clear();
        self.vr_in.clear();
        self.v_in.clear();
        for id in 0..self.changed.len() {
            if self.changed[id] {
                self.id_in.push(id);
                self.vr_in.push(model.variable(id).value_reference);
                self.v_in.push(self.values[id]);
                self.changed[id] = false;
            }
        }
        self.id_out.clear();
        self.vr_out.clear();
        for id in 0..self.requested.len() {
            if self.requested[id] {
                self.id_out.push(id);
                self.vr_out.push(model.variable(id).value_reference);
                self.requested[id] = false;
            }
        }
    }

    /// Gathers for a derivative evaluation: inputs carry their seeds, output
    /// buffers are sized for the requested set. Seeds are consumed.
    pub(crate) fn gather_sens(&mut self, model: &Model) -> Result<(), FmuError> {
        self.gather_io(model);
        self.d_in.clear();
        for k in 0..self.id_in.len() {
            let id = self.id_in[k];
            self.d_in.push(self.sens[id]);
            self.sens[id] = 0.0;
        }
        if self.id_in.is_empty() {
            return Err(FmuError::NoSeeds { slot: self.id });
        }
        let n_unknown = self.id_out.len();
        self.v_out.clear();
        self.v_out.resize(n_unknown, 0.0);
        self.d_out.clear();
        self.d_out.resize(n_unknown, 0.0);
        Ok(())
    }
}
