pub mod adapter;
pub mod api;
pub mod config;
mod dirty;
pub mod error;
pub mod jacobian;
/// The `tether_core` crate drives compiled FMI 2.0 co-simulation units as
/// reusable, differentiable functions.
///
/// Key components:
/// - **Api**: typed entry points over the raw wire interface, behind the `FmuBinary`/`FmuInstance` seams.
/// - **Pool**: reusable simulation instances, leased one per logical call.
/// - **Protocol**: the canonical prime/set/get lifecycle per evaluation.
/// - **Sensitivity**: analytic directional derivatives, adaptive finite differences and cross-validation.
/// - **Jacobian**: block sparsity patterns, seed coloring and Jacobian/adjoint assembly.
pub mod model;
pub mod pool;
mod protocol;
pub mod sensitivity;

#[cfg(test)]
pub(crate) mod mock;
