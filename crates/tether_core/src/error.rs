use thiserror::Error;

/// Errors produced while driving a simulation unit.
///
/// Resource and protocol errors leave the slot in an undefined state and are
/// fatal for the current logical call. I/O and derivative errors are
/// recoverable: the call failed but the slot can be primed again.
#[derive(Debug, Error)]
pub enum FmuError {
    #[error("cannot retrieve entry point '{0}'")]
    MissingSymbol(String),

    #[error("fmi2Instantiate failed for '{0}'")]
    Instantiate(String),

    #[error("{call} failed on slot {slot}")]
    Protocol { call: &'static str, slot: usize },

    #[error("{call} failed on slot {slot}")]
    Io { call: &'static str, slot: usize },

    #[error("fmi2GetDirectionalDerivative failed on slot {slot}")]
    Derivative { slot: usize },

    #[error("no derivative seeds set on slot {slot}")]
    NoSeeds { slot: usize },

    #[error("inconsistent seed bookkeeping for output '{output}' on slot {slot}")]
    InconsistentSeed { output: String, slot: usize },

    #[error("expected {expected} bindings, got {got}")]
    BindingCount { expected: usize, got: usize },

    #[error("binding '{name}' expects {expected} values, got {got}")]
    BindingSize {
        name: String,
        expected: usize,
        got: usize,
    },
}

impl FmuError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FmuError::MissingSymbol(_) | FmuError::Instantiate(_) | FmuError::Protocol { .. }
        )
    }
}
