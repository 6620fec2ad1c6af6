//! Directional derivatives of a simulation unit.
//!
//! Given gathered (input, seed) pairs and requested output ids, produces one
//! directional-derivative value per output: the derivative of that output
//! with respect to the weighted combination of inputs defined by the seeds.
//!
//! Two paths exist. The analytic path makes one call to the unit's
//! directional-derivative primitive. The finite-difference path perturbs the
//! gathered inputs along the seed direction and combines the probed outputs
//! with one of four stencils, working in nominal-scaled units throughout and
//! adapting the step size toward a target truncation/roundoff error ratio.
//! When both paths run, results are cross-validated and mismatches are
//! reported through an injectable sink.

use crate::config::{DerivativeSettings, FdMethod};
use crate::error::FmuError;
use crate::model::Model;
use crate::pool::Slot;
use crate::protocol::push_inputs;
use serde::Serialize;

/// One cross-validation failure, in physical units.
#[derive(Debug, Clone, Serialize)]
pub struct DerivativeMismatch {
    pub output: String,
    pub wrt: String,
    /// Input value at the evaluation point.
    pub at: f64,
    pub nominal: f64,
    pub min: f64,
    pub max: f64,
    pub analytic: f64,
    pub finite_diff: f64,
    pub method: FdMethod,
    /// Stencil values, left to right, scaled back to physical units.
    pub stencil: Vec<f64>,
    pub step: f64,
    pub error_ratio: f64,
}

/// Receives cross-validation diagnostics. Advisory only, never fails a call.
pub trait ValidationSink: Send + Sync {
    fn report(&self, mismatch: &DerivativeMismatch);
}

/// Default sink, routes diagnostics to the log.
pub struct LogSink;

impl ValidationSink for LogSink {
    fn report(&self, m: &DerivativeMismatch) {
        log::warn!(
            "inconsistent derivatives of {} w.r.t. {}: at {} (nominal {}, min {}, max {}), \
             got {} analytic vs. {} for FD[{}]; stencil {:?}, step {}, error ratio {}",
            m.output,
            m.wrt,
            m.at,
            m.nominal,
            m.min,
            m.max,
            m.analytic,
            m.finite_diff,
            m.method,
            m.stencil,
            m.step,
            m.error_ratio
        );
    }
}

pub(crate) struct FdTolerances {
    pub abstol: f64,
    pub reltol: f64,
    pub smoothing: f64,
}

/// One-sided difference. No error estimator; reported as "no estimate" so a
/// refinement iteration falls back to shrinking the step.
pub(crate) fn forward_diff(yk: &[f64], y0: &[f64], d: &mut [f64], h: f64) -> f64 {
    for i in 0..y0.len() {
        d[i] = (yk[i] - y0[i]) / h;
    }
    -1.0
}

/// Symmetric difference with a truncation/roundoff error ratio estimate.
/// Non-finite stencil values mark the entry unavailable.
pub(crate) fn central_diff(
    yk: &[f64],
    y0: &[f64],
    d: &mut [f64],
    h: f64,
    tol: &FdTolerances,
) -> f64 {
    let n = y0.len();
    let mut u = 0.0_f64;
    for i in 0..n {
        let yb = yk[i];
        let yf = yk[n + i];
        let yc = y0[i];
        if !yb.is_finite() || !yc.is_finite() || !yf.is_finite() {
            d[i] = f64::NAN;
            u = -1.0;
            continue;
        }
        d[i] = (yf - yb) / (2.0 * h);
        let err_trunc = yf - 2.0 * yc + yb;
        let err_round = tol.reltol / h * (yf - yc).abs().max((yc - yb).abs()) + tol.abstol;
        u = u.max((err_trunc / err_round).abs());
    }
    u
}

/// 4-point stencil for noisy models: three shifted 3-point approximations,
/// weighted by a second-derivative smoothness measure.
pub(crate) fn smoothing_diff(
    yk: &[f64],
    y0: &[f64],
    d: &mut [f64],
    h: f64,
    tol: &FdTolerances,
) -> f64 {
    let n = y0.len();
    let mut u = 0.0_f64;
    for i in 0..n {
        let yy = [yk[n + i], yk[i], y0[i], yk[2 * n + i], yk[3 * n + i]];
        let mut sum_d = 0.0;
        let mut sum_w = 0.0;
        let mut ui = 0.0;
        for k in 0..3 {
            if !yy[k].is_finite() || !yy[k + 1].is_finite() || !yy[k + 2].is_finite() {
                continue;
            }
            // Shifted 3-point approximations over 2h, central weighted double.
            let (jk, base_w) = match k {
                0 => (3.0 * yy[2] - 4.0 * yy[1] + yy[0], 1.0),
                1 => (yy[3] - yy[1], 2.0),
                _ => (-3.0 * yy[2] + 4.0 * yy[3] - yy[4], 1.0),
            };
            let err_trunc = yy[k + 2] - 2.0 * yy[k + 1] + yy[k];
            let err_round = tol.reltol / h * (yy[k + 2] - yy[k + 1]).abs().max((yy[k + 1] - yy[k]).abs())
                + tol.abstol;
            let sm = err_trunc / (h * h);
            let wk = base_w / (sm * sm + tol.smoothing);
            sum_w += wk;
            sum_d += wk * jk;
            ui += wk * (err_trunc / err_round).abs();
        }
        if sum_w == 0.0 {
            d[i] = f64::NAN;
            u = -1.0;
        } else {
            d[i] = sum_d / (2.0 * h * sum_w);
            u = u.max(ui / sum_w);
        }
    }
    u
}

/// Computes sensitivities for the gathered seed direction and requested
/// outputs, dispatching per configuration: analytic, finite differences, or
/// both for cross-validation.
pub(crate) fn eval_derivative(
    slot: &mut Slot,
    model: &Model,
    settings: &DerivativeSettings,
    sink: &dyn ValidationSink,
) -> Result<(), FmuError> {
    slot.gather_sens(model)?;
    if settings.enable_ad {
        eval_ad(slot)?;
    }
    if !settings.enable_ad || settings.validate_ad {
        eval_fd(slot, model, settings, sink)?;
    }
    Ok(())
}

/// Analytic path: one call to the unit's directional-derivative primitive.
fn eval_ad(slot: &mut Slot) -> Result<(), FmuError> {
    let slot_id = slot.id;
    let n_unknown = slot.id_out.len();
    if n_unknown == 0 {
        return Ok(());
    }
    {
        let Slot {
            handle,
            vr_in,
            vr_out,
            v_out,
            d_in,
            d_out,
            ..
        } = slot;
        let instance = handle.as_deref_mut().ok_or(FmuError::Protocol {
            call: "missing instance handle",
            slot: slot_id,
        })?;
        if !instance.get_real(vr_out, v_out).is_ok() {
            log::warn!("fmi2GetReal failed on slot {slot_id}");
            return Err(FmuError::Io {
                call: "fmi2GetReal",
                slot: slot_id,
            });
        }
        if !instance
            .get_directional_derivative(vr_out, vr_in, d_in, d_out)
            .is_ok()
        {
            log::warn!("fmi2GetDirectionalDerivative failed on slot {slot_id}");
            return Err(FmuError::Derivative { slot: slot_id });
        }
    }
    for k in 0..n_unknown {
        let id = slot.id_out[k];
        slot.sens[id] = slot.d_out[k];
    }
    Ok(())
}

/// Finite-difference path, in nominal-scaled units.
fn eval_fd(
    slot: &mut Slot,
    model: &Model,
    settings: &DerivativeSettings,
    sink: &dyn ValidationSink,
) -> Result<(), FmuError> {
    let slot_id = slot.id;
    let n_known = slot.id_in.len();
    let n_unknown = slot.id_out.len();
    if n_unknown == 0 {
        return Ok(());
    }

    // Baseline outputs at the unperturbed point.
    {
        let Slot {
            handle,
            vr_out,
            v_out,
            ..
        } = slot;
        let instance = handle.as_deref_mut().ok_or(FmuError::Protocol {
            call: "missing instance handle",
            slot: slot_id,
        })?;
        if !instance.get_real(vr_out, v_out).is_ok() {
            log::warn!("fmi2GetReal failed on slot {slot_id}");
            return Err(FmuError::Io {
                call: "fmi2GetReal",
                slot: slot_id,
            });
        }
    }

    slot.nominal_out.clear();
    for &id in &slot.id_out {
        slot.nominal_out.push(model.variable(id).nominal);
    }
    for k in 0..n_unknown {
        slot.v_out[k] /= slot.nominal_out[k];
    }

    let mut h = settings.step;
    if settings.method == FdMethod::Backward {
        h = -h;
    }
    let n_pert = settings.method.n_pert();
    slot.fd_out.clear();
    slot.fd_out.resize(n_pert * n_unknown, 0.0);
    let tol = FdTolerances {
        abstol: settings.abstol,
        reltol: settings.reltol,
        smoothing: f64::EPSILON,
    };
    let mut u = f64::NAN;

    for iter in 0..=settings.step_iterations {
        for k in 0..n_pert {
            let pert = settings.method.perturbation(k) * h;

            let mut in_bounds = true;
            for (i, &id) in slot.id_in.iter().enumerate() {
                let var = model.variable(id);
                let probe = slot.v_in[i] + pert * slot.d_in[i];
                in_bounds = in_bounds && probe >= var.min && probe <= var.max;
            }

            // The smoothing stencil does not enforce bounds; the other
            // stencils skip out-of-bounds probes and record them as
            // unavailable.
            if settings.method == FdMethod::Smoothing || in_bounds {
                for i in 0..n_known {
                    slot.v_in[i] += pert * slot.d_in[i];
                }
                {
                    let Slot {
                        handle,
                        vr_in,
                        v_in,
                        vr_out,
                        fd_out,
                        ..
                    } = slot;
                    let instance = handle.as_deref_mut().ok_or(FmuError::Protocol {
                        call: "missing instance handle",
                        slot: slot_id,
                    })?;
                    if !instance.set_real(vr_in, v_in).is_ok() {
                        log::warn!("fmi2SetReal failed on slot {slot_id}");
                        return Err(FmuError::Io {
                            call: "fmi2SetReal",
                            slot: slot_id,
                        });
                    }
                    let yk = &mut fd_out[n_unknown * k..n_unknown * (k + 1)];
                    if !instance.get_real(vr_out, yk).is_ok() {
                        log::warn!("fmi2GetReal failed on slot {slot_id}");
                        return Err(FmuError::Io {
                            call: "fmi2GetReal",
                            slot: slot_id,
                        });
                    }
                }
                for i in 0..n_known {
                    slot.v_in[i] -= pert * slot.d_in[i];
                }
                for i in 0..n_unknown {
                    slot.fd_out[n_unknown * k + i] /= slot.nominal_out[i];
                }
            } else {
                for i in 0..n_unknown {
                    slot.fd_out[n_unknown * k + i] = f64::NAN;
                }
            }
        }

        // Restore the unit to the unperturbed inputs.
        push_inputs(slot)?;

        {
            let Slot {
                v_out,
                d_out,
                fd_out,
                ..
            } = slot;
            u = match settings.method {
                FdMethod::Forward | FdMethod::Backward => forward_diff(fd_out, v_out, d_out, h),
                FdMethod::Central => central_diff(fd_out, v_out, d_out, h, &tol),
                FdMethod::Smoothing => smoothing_diff(fd_out, v_out, d_out, h, &tol),
            };
        }

        if iter == settings.step_iterations {
            break;
        }
        if u < 0.0 {
            // Probe failed, try a smaller step.
            h /= settings.error_ratio_target;
        } else {
            // Rescale toward the target error ratio.
            h *= (settings.error_ratio_target / u.max(1.0)).sqrt();
        }
        if h != 0.0 {
            h = h.signum() * h.abs().clamp(settings.step_min, settings.step_max);
        }
    }

    collect_fd(slot, model, settings, sink, h, u)
}

/// Rescales the finite-difference results to physical units and either
/// stores them as the sensitivities or cross-validates them against the
/// analytic ones.
fn collect_fd(
    slot: &mut Slot,
    model: &Model,
    settings: &DerivativeSettings,
    sink: &dyn ValidationSink,
    h: f64,
    u: f64,
) -> Result<(), FmuError> {
    let slot_id = slot.id;
    let n_unknown = slot.id_out.len();
    for ind in 0..n_unknown {
        let id = slot.id_out[ind];
        let nominal = slot.nominal_out[ind];
        let d_fd = slot.d_out[ind] * nominal;
        if !settings.validate_ad {
            slot.sens[id] = d_fd;
            continue;
        }

        let output = model.variable(id);
        let wrt_id = slot.wrt[id];
        if wrt_id >= model.n_vars() {
            return Err(FmuError::InconsistentSeed {
                output: output.name.clone(),
                slot: slot_id,
            });
        }
        let wrt = model.variable(wrt_id);
        let d_ad = slot.sens[id];
        let d_max = d_fd.abs().max(d_ad.abs());
        if d_max > wrt.nominal * nominal * settings.abstol
            && (d_ad - d_fd).abs() > d_max * settings.reltol
        {
            let wrt_ind = slot
                .id_in
                .iter()
                .position(|&i| i == wrt_id)
                .ok_or_else(|| FmuError::InconsistentSeed {
                    output: output.name.clone(),
                    slot: slot_id,
                })?;
            let n = n_unknown;
            let yk = |k: usize| slot.fd_out[n * k + ind];
            let stencil: Vec<f64> = match settings.method {
                FdMethod::Forward => vec![slot.v_out[ind], yk(0)],
                FdMethod::Backward => vec![yk(0), slot.v_out[ind]],
                FdMethod::Central => vec![yk(0), slot.v_out[ind], yk(1)],
                FdMethod::Smoothing => {
                    vec![yk(1), yk(0), slot.v_out[ind], yk(2), yk(3)]
                }
            }
            .into_iter()
            .map(|s| s * nominal)
            .collect();
            sink.report(&DerivativeMismatch {
                output: output.name.clone(),
                wrt: wrt.name.clone(),
                at: slot.v_in[wrt_ind],
                nominal: wrt.nominal,
                min: wrt.min,
                max: wrt.max,
                analytic: d_ad,
                finite_diff: d_fd,
                method: settings.method,
                stencil,
                step: h,
                error_ratio: u,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{central_diff, forward_diff, smoothing_diff, FdTolerances};

    fn tol() -> FdTolerances {
        FdTolerances {
            abstol: 1e-3,
            reltol: 1e-3,
            smoothing: f64::EPSILON,
        }
    }

    fn central_error_for_sine(h: f64) -> f64 {
        let x = 1.0_f64;
        let y0 = [x.sin()];
        let yk = [(x - h).sin(), (x + h).sin()];
        let mut d = [0.0];
        central_diff(&yk, &y0, &mut d, h, &tol());
        (d[0] - x.cos()).abs()
    }

    #[test]
    fn forward_difference_of_line_is_exact() {
        let y0 = [2.0, -1.0];
        let yk = [2.0 + 3.0 * 1e-6, -1.0 - 0.5 * 1e-6];
        let mut d = [0.0, 0.0];
        let u = forward_diff(&yk, &y0, &mut d, 1e-6);
        assert!(u < 0.0);
        assert!((d[0] - 3.0).abs() < 1e-6);
        assert!((d[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn central_difference_error_dips_then_grows_with_step() {
        // Truncation error shrinks with the step until roundoff takes over.
        let err_1em1 = central_error_for_sine(1e-1);
        let err_1em2 = central_error_for_sine(1e-2);
        let err_1em3 = central_error_for_sine(1e-3);
        let err_1em4 = central_error_for_sine(1e-4);
        let err_1em6 = central_error_for_sine(1e-6);
        let err_1em12 = central_error_for_sine(1e-12);
        assert!(err_1em2 < err_1em1);
        assert!(err_1em3 < err_1em2);
        assert!(err_1em4 < err_1em3);
        assert!(err_1em6 < err_1em1);
        assert!(err_1em12 > err_1em6);
    }

    #[test]
    fn central_difference_reports_error_ratio() {
        let x = 1.0_f64;
        let h = 1e-2;
        let y0 = [x.sin()];
        let yk = [(x - h).sin(), (x + h).sin()];
        let mut d = [0.0];
        let u = central_diff(&yk, &y0, &mut d, h, &tol());
        assert!(u.is_finite());
        assert!(u > 0.0);
    }

    #[test]
    fn central_difference_marks_nan_probe_unavailable() {
        let y0 = [1.0];
        let yk = [f64::NAN, 1.1];
        let mut d = [0.0];
        let u = central_diff(&yk, &y0, &mut d, 1e-1, &tol());
        assert!(d[0].is_nan());
        assert!(u < 0.0);
    }

    #[test]
    fn smoothing_difference_matches_on_smooth_function() {
        let x = 0.7_f64;
        let h = 1e-4;
        let f = |x: f64| x.sin();
        let y0 = [f(x)];
        // Probe order is -h, -2h, +h, +2h.
        let yk = [f(x - h), f(x - 2.0 * h), f(x + h), f(x + 2.0 * h)];
        let mut d = [0.0];
        let u = smoothing_diff(&yk, &y0, &mut d, h, &tol());
        assert!(u >= 0.0);
        assert!((d[0] - x.cos()).abs() < 1e-6);
    }

    #[test]
    fn smoothing_difference_survives_partial_nan_stencil() {
        let x = 0.7_f64;
        let h = 1e-4;
        let f = |x: f64| 2.0 * x;
        let y0 = [f(x)];
        let yk = [f(x - h), f64::NAN, f(x + h), f(x + 2.0 * h)];
        let mut d = [0.0];
        let u = smoothing_diff(&yk, &y0, &mut d, h, &tol());
        assert!(u >= 0.0);
        assert!((d[0] - 2.0).abs() < 1e-8);
    }
}
